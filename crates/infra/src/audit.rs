//! Lifecycle logging that never fails the caller.
//!
//! Audit rows are written through the store; when that write fails the record is
//! emitted through `tracing` instead (at `error`, flagged `critical = true`) and
//! the caller carries on.

use std::sync::Arc;

use tracing::{error, warn};

use busline_core::{Clock, ComponentState, HostRuntimeId, MessageId, SystemClock};
use busline_observability::{CorrelationProvider, NoCorrelation};

use crate::store::{AuditStore, InstanceRef, LogLevel, LogRecord, LogSubject};

/// Where an audit record ended up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuditDisposition {
    Persisted,
    /// The store write failed; the record went to the fallback logger.
    Fallback,
}

#[derive(Debug)]
pub struct AuditLogger<S: ?Sized> {
    store: Arc<S>,
    clock: Arc<dyn Clock>,
    correlation: Arc<dyn CorrelationProvider>,
}

impl<S: ?Sized> Clone for AuditLogger<S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            clock: self.clock.clone(),
            correlation: self.correlation.clone(),
        }
    }
}

impl<S> AuditLogger<S>
where
    S: AuditStore + ?Sized,
{
    pub fn new(store: Arc<S>) -> Self {
        Self {
            store,
            clock: Arc::new(SystemClock),
            correlation: Arc::new(NoCorrelation),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_correlation(mut self, correlation: Arc<dyn CorrelationProvider>) -> Self {
        self.correlation = correlation;
        self
    }

    /// Persist `record`, filling in the ambient correlation id when it has none.
    pub async fn log(&self, mut record: LogRecord) -> AuditDisposition {
        if record.correlation_id.is_none() {
            record.correlation_id = self.correlation.correlation_id();
        }

        match self.store.append_log(&record).await {
            Ok(()) => AuditDisposition::Persisted,
            Err(e) => {
                error!(
                    critical = true,
                    error = %e,
                    subject = %record.subject,
                    level = ?record.level,
                    status = ?record.status,
                    message_id = ?record.message,
                    correlation_id = ?record.correlation_id,
                    text = %record.text,
                    "audit log write failed"
                );
                AuditDisposition::Fallback
            }
        }
    }

    /// Record a status change of a host runtime.
    pub async fn host_status(
        &self,
        runtime: HostRuntimeId,
        status: ComponentState,
        text: impl Into<String>,
    ) -> AuditDisposition {
        let record = LogRecord::new(
            LogSubject::HostRuntime(runtime),
            level_for(status),
            text,
            self.clock.now(),
        )
        .with_status(status);
        self.log(record).await
    }

    /// Record a status change of a publisher, subscriber or job instance.
    pub async fn instance_status(
        &self,
        instance: InstanceRef,
        status: ComponentState,
        text: impl Into<String>,
    ) -> AuditDisposition {
        let record = LogRecord::new(
            LogSubject::Instance(instance),
            level_for(status),
            text,
            self.clock.now(),
        )
        .with_status(status);
        self.log(record).await
    }

    /// Record something that happened while an instance handled `message`.
    pub async fn message_event(
        &self,
        instance: InstanceRef,
        message: MessageId,
        level: LogLevel,
        text: impl Into<String>,
    ) -> AuditDisposition {
        if level >= LogLevel::Warning {
            warn!(%instance, %message, "audited delivery problem");
        }
        let record = LogRecord::new(LogSubject::Instance(instance), level, text, self.clock.now())
            .with_message(message);
        self.log(record).await
    }
}

fn level_for(status: ComponentState) -> LogLevel {
    match status {
        ComponentState::Faulted => LogLevel::Error,
        _ => LogLevel::Information,
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use async_trait::async_trait;
    use chrono::Utc;

    use busline_core::{ManualClock, SubscriberInstanceId};
    use busline_observability::StaticCorrelation;

    use super::*;
    use crate::store::{StoreError, StoreResult};

    #[derive(Debug, Default)]
    struct RecordingStore {
        fail: bool,
        rows: Mutex<Vec<LogRecord>>,
    }

    #[async_trait]
    impl AuditStore for RecordingStore {
        async fn append_log(&self, record: &LogRecord) -> StoreResult<()> {
            if self.fail {
                return Err(StoreError::Database("connection reset".into()));
            }
            self.rows.lock().unwrap().push(record.clone());
            Ok(())
        }

        async fn list_logs(&self, _subject: LogSubject) -> StoreResult<Vec<LogRecord>> {
            Ok(self.rows.lock().unwrap().clone())
        }

        async fn current_state(&self, _subject: LogSubject) -> StoreResult<Option<ComponentState>> {
            Ok(None)
        }
    }

    #[tokio::test]
    async fn persisted_records_carry_correlation_and_level() {
        let store = Arc::new(RecordingStore::default());
        let logger = AuditLogger::new(store.clone())
            .with_clock(Arc::new(ManualClock::at(Utc::now())))
            .with_correlation(Arc::new(StaticCorrelation::new("run-7")));

        let instance = InstanceRef::Subscriber(SubscriberInstanceId::new());
        let disposition = logger
            .instance_status(instance, ComponentState::Faulted, "handler crashed")
            .await;

        assert_eq!(disposition, AuditDisposition::Persisted);
        let rows = store.rows.lock().unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].status, Some(ComponentState::Faulted));
        assert_eq!(rows[0].level, LogLevel::Error);
        assert_eq!(rows[0].correlation_id.as_deref(), Some("run-7"));
    }

    #[tokio::test]
    async fn store_failure_falls_back_without_error() {
        let store = Arc::new(RecordingStore {
            fail: true,
            ..Default::default()
        });
        let logger = AuditLogger::new(store);

        let disposition = logger
            .host_status(HostRuntimeId::new(), ComponentState::Running, "started")
            .await;

        assert_eq!(disposition, AuditDisposition::Fallback);
    }
}
