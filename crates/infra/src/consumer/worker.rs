//! Claim → dispatch → commit loop for one subscriber or job instance.

use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};

use futures::FutureExt;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, info_span, warn};

use busline_core::{
    Clock, ComponentState, ConcurrencyToken, DeliveryOutcome, DeliveryPolicy, SystemClock,
    TicketId, TicketState, resolve_outcome,
};
use busline_messages::{HandlerRegistry, HandlerResult, RawDelivery};

use super::{PollOutcome, WorkerConfig, WorkerStats};
use crate::audit::AuditLogger;
use crate::cache::{CacheSettings, CatalogCache};
use crate::cancel::Cancellable;
use crate::store::{
    BusStore, ClaimOutcome, ClaimedDelivery, CommitOutcome, Consumer, LogLevel, StoreError,
    StoreResult,
};

/// Background consumer of one queue.
///
/// Each poll refreshes the instance's liveness, claims the next ticket under the
/// queue's [`DeliveryPolicy`], hands the decoded payload to the registry and writes
/// the resolved outcome back. Handlers see every message at least once and must be
/// idempotent.
#[derive(Debug)]
pub struct ConsumerWorker<S: ?Sized> {
    store: Arc<S>,
    registry: Arc<HandlerRegistry>,
    cache: Arc<CatalogCache>,
    clock: Arc<dyn Clock>,
    audit: AuditLogger<S>,
    consumer: Consumer,
    policy: DeliveryPolicy,
    config: WorkerConfig,
    cancel: CancellationToken,
    stats: Mutex<WorkerStats>,
}

impl<S> ConsumerWorker<S>
where
    S: BusStore + ?Sized + 'static,
{
    pub fn new(
        store: Arc<S>,
        registry: Arc<HandlerRegistry>,
        consumer: Consumer,
        policy: DeliveryPolicy,
    ) -> Self {
        Self {
            audit: AuditLogger::new(store.clone()),
            store,
            registry,
            cache: Arc::new(CatalogCache::new(CacheSettings::default())),
            clock: Arc::new(SystemClock),
            consumer,
            policy,
            config: WorkerConfig::default(),
            cancel: CancellationToken::new(),
            stats: Mutex::new(WorkerStats::default()),
        }
    }

    pub fn with_config(mut self, config: WorkerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_cache(mut self, cache: Arc<CatalogCache>) -> Self {
        self.cache = cache;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.audit = self.audit.with_clock(clock.clone());
        self.clock = clock;
        self
    }

    pub fn with_audit(mut self, audit: AuditLogger<S>) -> Self {
        self.audit = audit;
        self
    }

    /// Token that stops [`run`](Self::run) and aborts a pending claim.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn consumer(&self) -> Consumer {
        self.consumer
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn stats(&self) -> WorkerStats {
        self.stats
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Poll until cancelled or until a fatal store error.
    ///
    /// The instance is logged as `Running` on entry, then `Stopped` on a clean exit
    /// or `Faulted` when a fatal error ends the loop.
    pub async fn run(&self) -> StoreResult<()> {
        let instance = self.consumer.instance();
        info!(worker = %self.config.name, %instance, queue = %self.consumer.queue(), "consumer started");
        self.audit
            .instance_status(instance, ComponentState::Running, "consumer started")
            .await;

        let result = self.poll_loop().await;

        match &result {
            Ok(()) => {
                self.audit
                    .instance_status(instance, ComponentState::Stopped, "consumer stopped")
                    .await;
            }
            Err(e) => {
                self.audit
                    .instance_status(instance, ComponentState::Faulted, e.to_string())
                    .await;
            }
        }
        info!(worker = %self.config.name, %instance, stats = ?self.stats(), "consumer stopped");
        result
    }

    async fn poll_loop(&self) -> StoreResult<()> {
        loop {
            if self.cancel.is_cancelled() {
                return Ok(());
            }

            let pause = match self.run_once().await {
                Ok(PollOutcome::Empty) => self.config.poll_interval,
                Ok(_) => continue,
                Err(StoreError::Cancelled) => return Ok(()),
                Err(e) if e.is_fatal() => {
                    error!(worker = %self.config.name, error = %e, "fatal store error");
                    return Err(e);
                }
                Err(e) => {
                    warn!(worker = %self.config.name, error = %e, "poll failed");
                    self.config.error_backoff
                }
            };

            tokio::select! {
                () = tokio::time::sleep(pause) => {}
                () = self.cancel.cancelled() => return Ok(()),
            }
        }
    }

    /// One poll: claim at most one ticket, process it and commit the result.
    pub async fn run_once(&self) -> StoreResult<PollOutcome> {
        let now = self.clock.now();
        self.store
            .touch_instance(self.consumer.instance(), now)
            .with_cancel(&self.cancel)
            .await?;

        let claim = self
            .store
            .claim_next(self.consumer, &self.policy, &self.config.eligible, now)
            .with_cancel(&self.cancel)
            .await?;

        let outcome = match claim {
            ClaimOutcome::Empty => PollOutcome::Empty,
            ClaimOutcome::Lost { ticket } => {
                debug!(worker = %self.config.name, %ticket, "claim lost, polling again");
                PollOutcome::Lost { ticket }
            }
            ClaimOutcome::Claimed(delivery) => {
                let span = info_span!(
                    "delivery",
                    worker = %self.config.name,
                    ticket = %delivery.ticket.id,
                    message = %delivery.message.id,
                    retry_count = delivery.ticket.retry_count,
                );
                self.process(*delivery).instrument(span).await?
            }
        };

        self.stats
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .record(&outcome);
        Ok(outcome)
    }

    async fn process(&self, delivery: ClaimedDelivery) -> StoreResult<PollOutcome> {
        let ClaimedDelivery { ticket, message } = delivery;
        let message_type = self
            .cache
            .message_type_by_id(self.store.as_ref(), message.message_type)
            .await?;

        let raw = RawDelivery {
            ticket_id: ticket.id,
            message_id: message.id,
            message_type: message_type.name,
            previous_message: message.previous_message,
            created_utc: message.created_utc,
            is_recovery: message.is_recovery,
            data: message.data,
            retry_count: ticket.retry_count,
            snapshot: ticket.snapshot.clone(),
        };

        let heartbeat = self.spawn_heartbeat(ticket.id, ticket.concurrency_token);
        let result = self.dispatch(raw).await;
        heartbeat.stop().await;

        let update = {
            let update = resolve_outcome(
                &self.policy,
                &self.config.backoff,
                ticket.retry_count,
                &result.outcome,
                self.clock.now(),
            );
            match result.snapshot {
                Some(snapshot) => update.with_snapshot(snapshot),
                None => update,
            }
        };

        let committed = self
            .store
            .commit(
                self.consumer,
                ticket.id,
                ticket.concurrency_token,
                &update,
                self.clock.now(),
            )
            .await?;

        match committed {
            CommitOutcome::Committed { .. } => {
                debug!(state = ?update.state, "result committed");
            }
            CommitOutcome::Lost => {
                warn!(state = ?update.state, "ticket was reclaimed; result discarded");
            }
        }

        if let DeliveryOutcome::Failed { reason } | DeliveryOutcome::Rejected { reason } =
            &result.outcome
        {
            let level = if update.state == TicketState::Suspended {
                LogLevel::Error
            } else {
                LogLevel::Warning
            };
            self.audit
                .message_event(self.consumer.instance(), message.id, level, reason.clone())
                .await;
        }

        Ok(PollOutcome::Processed {
            ticket: ticket.id,
            state: update.state,
            committed: committed.is_committed(),
        })
    }

    /// Run the handler; errors and panics become failed outcomes.
    async fn dispatch(&self, raw: RawDelivery) -> HandlerResult {
        match AssertUnwindSafe(self.registry.dispatch(raw))
            .catch_unwind()
            .await
        {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => {
                warn!(error = %e, "dispatch failed");
                HandlerResult::failed(e.to_string())
            }
            Err(panic) => {
                let err = anyhow::anyhow!("handler panicked: {}", panic_message(&*panic));
                error!(error = %err, "handler panicked");
                HandlerResult::failed(err.to_string())
            }
        }
    }

    fn spawn_heartbeat(&self, ticket: TicketId, token: ConcurrencyToken) -> Heartbeat {
        let stop = self.cancel.child_token();
        let store = self.store.clone();
        let clock = self.clock.clone();
        let consumer = self.consumer;
        let interval = self.config.heartbeat_interval;
        let stopped = stop.clone();

        let task = tokio::spawn(
            async move {
                loop {
                    tokio::select! {
                        () = stopped.cancelled() => return,
                        () = tokio::time::sleep(interval) => {}
                    }
                    match store.heartbeat(consumer, ticket, token, clock.now()).await {
                        Ok(CommitOutcome::Committed { .. }) => debug!("heartbeat"),
                        Ok(CommitOutcome::Lost) => {
                            warn!("claim lost while the handler is running");
                            return;
                        }
                        Err(e) => warn!(error = %e, "heartbeat failed"),
                    }
                }
            }
            .in_current_span(),
        );

        Heartbeat { stop, task }
    }
}

struct Heartbeat {
    stop: CancellationToken,
    task: JoinHandle<()>,
}

impl Heartbeat {
    async fn stop(self) {
        self.stop.cancel();
        if let Err(e) = self.task.await {
            warn!(error = %e, "heartbeat task ended abnormally");
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> &str {
    if let Some(s) = panic.downcast_ref::<&'static str>() {
        s
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.as_str()
    } else {
        "non-string panic payload"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn panic_payloads_are_readable() {
        let boxed: Box<dyn std::any::Any + Send> = Box::new("boom");
        assert_eq!(panic_message(&*boxed), "boom");

        let boxed: Box<dyn std::any::Any + Send> = Box::new(String::from("bang"));
        assert_eq!(panic_message(&*boxed), "bang");

        let boxed: Box<dyn std::any::Any + Send> = Box::new(7_u8);
        assert_eq!(panic_message(&*boxed), "non-string panic payload");
    }
}
