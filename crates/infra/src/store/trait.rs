use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use busline_core::{
    ComponentState, ConcurrencyToken, DeliveryPolicy, DomainError, HostRuntimeId, JobId,
    JobInstanceId, MessageId, MessageTypeId, ScenarioId, SnapshotIdentifier, SubscriberId,
    TicketId, TicketState, TicketUpdate,
};

use super::model::{
    ClaimOutcome, CommitOutcome, Consumer, DeliveryTicket, Host, HostRuntime, InstanceRecord,
    InstanceRef, Job, JobSpec, LogRecord, LogSubject, Message, MessageType, MessageTypeSpec,
    PublishReceipt, Publisher, PublisherSpec, QueueDepth, QueueRef, Scenario, Snapshot,
    Subscriber, SubscriberSpec, TicketKind,
};
use crate::registration::{StartupPlan, StartupReceipt};

/// Storage operation error.
///
/// Lost claim/commit races are *not* errors; they come back as
/// [`ClaimOutcome::Lost`] / [`CommitOutcome::Lost`].
#[derive(Debug, Error)]
pub enum StoreError {
    /// A statement touched a different number of rows than it must.
    #[error("integrity violation in {operation}: expected {expected} affected row(s), got {affected}")]
    Integrity {
        operation: &'static str,
        expected: u64,
        affected: u64,
    },

    /// A catalog row already exists under the key with different identity fields.
    #[error("registration conflict for {entity} '{key}': {detail}")]
    RegistrationConflict {
        entity: &'static str,
        key: String,
        detail: String,
    },

    #[error("{entity} '{key}' not found")]
    NotFound { entity: &'static str, key: String },

    #[error(transparent)]
    Domain(#[from] DomainError),

    #[error("invalid request: {0}")]
    Validation(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("database error: {0}")]
    Database(String),

    #[error("operation cancelled")]
    Cancelled,
}

impl StoreError {
    pub fn not_found(entity: &'static str, key: impl ToString) -> Self {
        Self::NotFound {
            entity,
            key: key.to_string(),
        }
    }

    pub fn conflict(entity: &'static str, key: impl ToString, detail: impl Into<String>) -> Self {
        Self::RegistrationConflict {
            entity,
            key: key.to_string(),
            detail: detail.into(),
        }
    }

    /// Integrity violations and registration conflicts are configuration or data
    /// corruption problems that retrying will not fix.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            StoreError::Integrity { .. } | StoreError::RegistrationConflict { .. }
        )
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Assert that a write touched exactly one row.
pub fn expect_one(operation: &'static str, affected: u64) -> StoreResult<()> {
    if affected == 1 {
        Ok(())
    } else {
        Err(StoreError::Integrity {
            operation,
            expected: 1,
            affected,
        })
    }
}

/// A message is fanned out to at least one queue, and to each queue at most once.
pub(crate) fn validate_targets(targets: &[QueueRef]) -> StoreResult<()> {
    if targets.is_empty() {
        return Err(StoreError::Validation(
            "publish requires at least one target queue".into(),
        ));
    }
    let mut seen = HashSet::with_capacity(targets.len());
    match targets.iter().find(|q| !seen.insert(**q)) {
        Some(duplicate) => Err(StoreError::Validation(format!(
            "duplicate publish target {duplicate}"
        ))),
        None => Ok(()),
    }
}

/// Catalog registration and liveness.
///
/// Every `register_*` call is an idempotent upsert: the first call creates the row,
/// later calls with the same identity return it (refreshing policy settings), and a
/// call whose identity differs from the stored row fails with
/// [`StoreError::RegistrationConflict`].
#[async_trait]
pub trait CatalogStore: Send + Sync {
    /// Apply a whole startup registration pass atomically.
    async fn initialize(&self, plan: &StartupPlan, now: DateTime<Utc>)
    -> StoreResult<StartupReceipt>;

    async fn register_host(&self, host: &Host) -> StoreResult<Host>;

    async fn start_host_runtime(&self, runtime: &HostRuntime) -> StoreResult<()>;

    /// Stamp `ended_utc` and move the runtime to `Stopped`.
    async fn end_host_runtime(&self, runtime: HostRuntimeId, now: DateTime<Utc>)
    -> StoreResult<()>;

    async fn register_scenario(&self, scenario: &Scenario) -> StoreResult<Scenario>;

    async fn register_message_type(&self, spec: &MessageTypeSpec) -> StoreResult<MessageType>;

    async fn register_publisher(
        &self,
        scenario: ScenarioId,
        spec: &PublisherSpec,
    ) -> StoreResult<Publisher>;

    async fn register_subscriber(
        &self,
        scenario: ScenarioId,
        spec: &SubscriberSpec,
    ) -> StoreResult<Subscriber>;

    async fn register_job(&self, scenario: ScenarioId, spec: &JobSpec) -> StoreResult<Job>;

    /// Insert a fresh instance row in state `Starting`.
    async fn start_instance(&self, instance: &InstanceRecord) -> StoreResult<()>;

    /// Refresh an instance's `last_activity_utc`.
    async fn touch_instance(&self, instance: InstanceRef, now: DateTime<Utc>) -> StoreResult<()>;

    async fn message_type_by_name(&self, name: &str) -> StoreResult<Option<MessageType>>;

    async fn message_type_by_id(&self, id: MessageTypeId) -> StoreResult<Option<MessageType>>;

    async fn load_subscriber(&self, id: SubscriberId) -> StoreResult<Option<Subscriber>>;

    async fn load_job(&self, id: JobId) -> StoreResult<Option<Job>>;

    /// Every subscriber and job of `scenario` that declares `message_type`.
    async fn resolve_targets(
        &self,
        scenario: ScenarioId,
        message_type: MessageTypeId,
    ) -> StoreResult<Vec<QueueRef>>;
}

/// Message storage, fan-out and the ticket claim/commit protocol.
#[async_trait]
pub trait DeliveryStore: Send + Sync {
    /// Insert `message` and one `Ready` ticket per target, all or nothing.
    async fn publish(&self, message: &Message, targets: &[QueueRef])
    -> StoreResult<PublishReceipt>;

    /// The queue's head ticket, if it is claimable right now.
    async fn find_next_fifo(
        &self,
        queue: QueueRef,
        eligible: &[TicketState],
        processing_timeout: Duration,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<DeliveryTicket>>;

    /// The oldest claimable ticket of the queue.
    async fn find_next_non_fifo(
        &self,
        queue: QueueRef,
        eligible: &[TicketState],
        processing_timeout: Duration,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<DeliveryTicket>>;

    /// Conditionally claim `candidate` for `consumer` against the token observed when it
    /// was selected.
    ///
    /// The stored row must still be reclaimable at `now`: not terminal, unowned or
    /// holding the observed token, and if in progress, untouched for longer than
    /// `processing_timeout`. Otherwise the outcome is [`ClaimOutcome::Lost`].
    async fn try_claim(
        &self,
        candidate: &DeliveryTicket,
        consumer: Consumer,
        processing_timeout: Duration,
        now: DateTime<Utc>,
    ) -> StoreResult<ClaimOutcome>;

    /// Select and claim the next ticket for `consumer` according to `policy`.
    async fn claim_next(
        &self,
        consumer: Consumer,
        policy: &DeliveryPolicy,
        eligible: &[TicketState],
        now: DateTime<Utc>,
    ) -> StoreResult<ClaimOutcome> {
        let queue = consumer.queue();
        let candidate = if policy.fifo {
            self.find_next_fifo(queue, eligible, policy.processing_timeout, now)
                .await?
        } else {
            self.find_next_non_fifo(queue, eligible, policy.processing_timeout, now)
                .await?
        };

        match candidate {
            Some(ticket) => {
                self.try_claim(&ticket, consumer, policy.processing_timeout, now)
                    .await
            }
            None => Ok(ClaimOutcome::Empty),
        }
    }

    /// Write a processing result, conditional on `token` and ownership.
    async fn commit(
        &self,
        consumer: Consumer,
        ticket: TicketId,
        token: ConcurrencyToken,
        update: &TicketUpdate,
        now: DateTime<Utc>,
    ) -> StoreResult<CommitOutcome>;

    /// Refresh `last_access_utc` of an in-progress claim without rotating the token.
    async fn heartbeat(
        &self,
        consumer: Consumer,
        ticket: TicketId,
        token: ConcurrencyToken,
        now: DateTime<Utc>,
    ) -> StoreResult<CommitOutcome>;

    async fn load_ticket(
        &self,
        kind: TicketKind,
        ticket: TicketId,
    ) -> StoreResult<Option<DeliveryTicket>>;

    async fn load_message(&self, message: MessageId) -> StoreResult<Option<Message>>;

    /// All tickets fanned out from `message`, subscriber tickets first.
    async fn tickets_for_message(&self, message: MessageId) -> StoreResult<Vec<DeliveryTicket>>;

    async fn count_by_state(&self, queue: QueueRef) -> StoreResult<QueueDepth>;
}

/// Job checkpoints.
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    /// Upsert by identifier, rewriting data and owner.
    async fn save_snapshot(
        &self,
        owner: JobInstanceId,
        identifier: &SnapshotIdentifier,
        data: &[u8],
        now: DateTime<Utc>,
    ) -> StoreResult<Snapshot>;

    /// Move an existing snapshot to `new_owner`; the data is untouched.
    async fn transfer_snapshot(
        &self,
        new_owner: JobInstanceId,
        identifier: &SnapshotIdentifier,
        now: DateTime<Utc>,
    ) -> StoreResult<()>;

    async fn load_snapshot(&self, identifier: &SnapshotIdentifier)
    -> StoreResult<Option<Snapshot>>;

    /// Returns whether a snapshot was removed.
    async fn delete_snapshot(&self, identifier: &SnapshotIdentifier) -> StoreResult<bool>;
}

/// Append-only lifecycle logs.
#[async_trait]
pub trait AuditStore: Send + Sync {
    /// Insert `record` and, when it carries a status, move its subject to that status
    /// in the same transaction.
    async fn append_log(&self, record: &LogRecord) -> StoreResult<()>;

    /// Log rows of `subject`, oldest first.
    async fn list_logs(&self, subject: LogSubject) -> StoreResult<Vec<LogRecord>>;

    async fn current_state(&self, subject: LogSubject) -> StoreResult<Option<ComponentState>>;
}

/// Everything a bus process needs from storage.
pub trait BusStore: CatalogStore + DeliveryStore + SnapshotStore + AuditStore {}

impl<S> BusStore for S where S: CatalogStore + DeliveryStore + SnapshotStore + AuditStore {}
