//! Row types shared by every store implementation.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use busline_core::{
    ComponentState, ConcurrencyToken, DeliveryPolicy, HostId, HostRuntimeId, HostState, JobId,
    JobInstanceId, LogId, MessageId, MessageTypeId, PublisherId, PublisherInstanceId, ScenarioId,
    SnapshotIdentifier, SubscriberId, SubscriberInstanceId, TicketId, TicketState,
};

/// One logical bus deployment (`service_bus_host`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Host {
    pub id: HostId,
    pub name: String,
}

/// One running process of a host (`service_bus_host_runtime`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostRuntime {
    pub id: HostRuntimeId,
    pub host: HostId,
    pub user_name: String,
    pub machine_name: String,
    pub started_utc: DateTime<Utc>,
    pub ended_utc: Option<DateTime<Utc>>,
    pub state: HostState,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Scenario {
    pub id: ScenarioId,
    pub name: String,
}

/// Requested message type registration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageTypeSpec {
    /// Logical name; the registration key (`MessagePayload::MESSAGE_TYPE`).
    pub name: String,
    /// Payload type the name is bound to; must not change across deployments.
    pub type_name: String,
}

impl MessageTypeSpec {
    pub fn new(name: impl Into<String>, type_name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            type_name: type_name.into(),
        }
    }

    /// Spec for a typed payload, keyed by its `MESSAGE_TYPE`.
    pub fn of<P: busline_messages::MessagePayload>() -> Self {
        Self::new(P::MESSAGE_TYPE, core::any::type_name::<P>())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageType {
    pub id: MessageTypeId,
    pub name: String,
    pub type_name: String,
}

/// Requested publisher registration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublisherSpec {
    pub id: PublisherId,
    pub name: String,
    /// Message type name; resolved against the catalog during registration.
    pub message_type: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Publisher {
    pub id: PublisherId,
    pub name: String,
    pub scenario: ScenarioId,
    pub message_type: MessageTypeId,
}

/// Requested subscriber registration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriberSpec {
    pub id: SubscriberId,
    pub name: String,
    pub message_type: String,
    pub policy: DeliveryPolicy,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscriber {
    pub id: SubscriberId,
    pub name: String,
    pub scenario: ScenarioId,
    pub message_type: MessageTypeId,
    pub policy: DeliveryPolicy,
}

/// Requested job registration. Jobs are keyed by `(scenario, name)`; the integer id
/// is assigned by the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobSpec {
    pub name: String,
    /// Message type fed into the job's private queue, if it consumes one.
    pub message_type: Option<String>,
    pub policy: DeliveryPolicy,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub name: String,
    pub scenario: ScenarioId,
    pub message_type: Option<MessageTypeId>,
    pub policy: DeliveryPolicy,
}

/// A running-process registration of a component, carrying its own liveness.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instance<I, C> {
    pub id: I,
    pub component: C,
    pub host_runtime: HostRuntimeId,
    pub created_utc: DateTime<Utc>,
    pub last_activity_utc: DateTime<Utc>,
    pub state: ComponentState,
}

pub type PublisherInstance = Instance<PublisherInstanceId, PublisherId>;
pub type SubscriberInstance = Instance<SubscriberInstanceId, SubscriberId>;
pub type JobInstance = Instance<JobInstanceId, JobId>;

/// A new instance row of any component kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceRecord {
    Publisher(PublisherInstance),
    Subscriber(SubscriberInstance),
    Job(JobInstance),
}

impl InstanceRecord {
    pub fn instance(&self) -> InstanceRef {
        match self {
            InstanceRecord::Publisher(i) => InstanceRef::Publisher(i.id),
            InstanceRecord::Subscriber(i) => InstanceRef::Subscriber(i.id),
            InstanceRecord::Job(i) => InstanceRef::Job(i.id),
        }
    }

    pub fn host_runtime(&self) -> HostRuntimeId {
        match self {
            InstanceRecord::Publisher(i) => i.host_runtime,
            InstanceRecord::Subscriber(i) => i.host_runtime,
            InstanceRecord::Job(i) => i.host_runtime,
        }
    }
}

/// Reference to any kind of component instance.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceRef {
    Publisher(PublisherInstanceId),
    Subscriber(SubscriberInstanceId),
    Job(JobInstanceId),
}

impl core::fmt::Display for InstanceRef {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            InstanceRef::Publisher(id) => write!(f, "publisher-instance:{id}"),
            InstanceRef::Subscriber(id) => write!(f, "subscriber-instance:{id}"),
            InstanceRef::Job(id) => write!(f, "job-instance:{id}"),
        }
    }
}

/// An immutable published message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub message_type: MessageTypeId,
    pub publisher_instance: PublisherInstanceId,
    pub previous_message: Option<MessageId>,
    pub created_utc: DateTime<Utc>,
    /// Messages past this instant are no longer delivered.
    pub valid_to_utc: Option<DateTime<Utc>>,
    pub is_recovery: bool,
    pub data: Vec<u8>,
}

impl Message {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.valid_to_utc.is_some_and(|valid_to| valid_to <= now)
    }
}

/// A delivery queue: a subscriber's fan-out tickets or a job's private pool.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueRef {
    Subscriber(SubscriberId),
    Job(JobId),
}

impl QueueRef {
    pub fn kind(&self) -> TicketKind {
        match self {
            QueueRef::Subscriber(_) => TicketKind::Subscriber,
            QueueRef::Job(_) => TicketKind::TempQueue,
        }
    }
}

impl core::fmt::Display for QueueRef {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            QueueRef::Subscriber(id) => write!(f, "subscriber:{id}"),
            QueueRef::Job(id) => write!(f, "job:{id}"),
        }
    }
}

/// Which ticket table a ticket lives in.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TicketKind {
    /// `subscriber_message`
    Subscriber,
    /// `message_temp_queue`
    TempQueue,
}

/// The mutable per-consumer unit of work derived from a message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryTicket {
    pub id: TicketId,
    pub queue: QueueRef,
    pub message: MessageId,
    /// Instance that last claimed the ticket; `None` means never claimed.
    pub owner_instance: Option<Uuid>,
    pub last_access_utc: Option<DateTime<Utc>>,
    pub state: TicketState,
    pub snapshot: Option<Vec<u8>>,
    pub retry_count: u32,
    pub delayed_to_utc: Option<DateTime<Utc>>,
    pub concurrency_token: ConcurrencyToken,
}

impl DeliveryTicket {
    /// A freshly fanned-out, never claimed ticket.
    pub fn ready(queue: QueueRef, message: MessageId) -> Self {
        Self {
            id: TicketId::new(),
            queue,
            message,
            owner_instance: None,
            last_access_utc: None,
            state: TicketState::Ready,
            snapshot: None,
            retry_count: 0,
            delayed_to_utc: None,
            concurrency_token: ConcurrencyToken::issue(),
        }
    }

    pub fn kind(&self) -> TicketKind {
        self.queue.kind()
    }

    /// Whether a poll may hand this ticket out at `now`.
    ///
    /// Either its state is in `eligible` and any delay has strictly passed, or it is an
    /// in-progress claim whose last heartbeat is older than `processing_timeout`.
    /// `SELECT` statements in the Postgres store encode the same predicate.
    pub fn is_claimable(
        &self,
        eligible: &[TicketState],
        processing_timeout: Duration,
        now: DateTime<Utc>,
    ) -> bool {
        if self.state == TicketState::InProgress {
            return self.is_stale(processing_timeout, now);
        }
        eligible.contains(&self.state) && self.delayed_to_utc.is_none_or(|until| until < now)
    }

    /// Whether the stored row still permits a claim by a poller that selected it while
    /// it carried `observed`.
    ///
    /// Terminal rows never do. A live in-progress claim is refused even when the token
    /// matches: heartbeats refresh access without rotating it.
    pub fn accepts_claim(
        &self,
        observed: ConcurrencyToken,
        processing_timeout: Duration,
        now: DateTime<Utc>,
    ) -> bool {
        if self.state.is_terminal() {
            return false;
        }
        if self.owner_instance.is_some() && self.concurrency_token != observed {
            return false;
        }
        self.state != TicketState::InProgress || self.is_stale(processing_timeout, now)
    }

    /// An in-progress claim that stopped heartbeating.
    pub fn is_stale(&self, processing_timeout: Duration, now: DateTime<Utc>) -> bool {
        if self.state != TicketState::InProgress {
            return false;
        }
        match self.last_access_utc {
            None => true,
            Some(last_access) => last_access < reclaim_cutoff(now, processing_timeout),
        }
    }
}

/// Heartbeats older than this instant mark an in-progress claim as stuck.
pub fn reclaim_cutoff(now: DateTime<Utc>, processing_timeout: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(processing_timeout)
        .ok()
        .and_then(|timeout| now.checked_sub_signed(timeout))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// The process-local identity a claim is made under.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Consumer {
    Subscriber {
        subscriber: SubscriberId,
        instance: SubscriberInstanceId,
    },
    Job {
        job: JobId,
        instance: JobInstanceId,
    },
}

impl Consumer {
    pub fn queue(&self) -> QueueRef {
        match self {
            Consumer::Subscriber { subscriber, .. } => QueueRef::Subscriber(*subscriber),
            Consumer::Job { job, .. } => QueueRef::Job(*job),
        }
    }

    pub fn instance_uuid(&self) -> Uuid {
        match self {
            Consumer::Subscriber { instance, .. } => *instance.as_uuid(),
            Consumer::Job { instance, .. } => *instance.as_uuid(),
        }
    }

    pub fn instance(&self) -> InstanceRef {
        match self {
            Consumer::Subscriber { instance, .. } => InstanceRef::Subscriber(*instance),
            Consumer::Job { instance, .. } => InstanceRef::Job(*instance),
        }
    }
}

/// A ticket that was just claimed, together with its message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimedDelivery {
    pub ticket: DeliveryTicket,
    pub message: Message,
}

/// Result of a claim attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClaimOutcome {
    Claimed(Box<ClaimedDelivery>),
    /// No eligible ticket right now.
    Empty,
    /// Another instance claimed or updated the candidate first; poll again.
    Lost { ticket: TicketId },
}

impl ClaimOutcome {
    pub fn claimed(self) -> Option<ClaimedDelivery> {
        match self {
            ClaimOutcome::Claimed(delivery) => Some(*delivery),
            _ => None,
        }
    }

    pub fn is_lost(&self) -> bool {
        matches!(self, ClaimOutcome::Lost { .. })
    }
}

/// Result of a conditional result write or heartbeat.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum CommitOutcome {
    /// The write applied; `token` is the ticket's current token.
    Committed { token: ConcurrencyToken },
    /// The presented token is stale: the ticket was reclaimed or updated elsewhere.
    Lost,
}

impl CommitOutcome {
    pub fn is_committed(&self) -> bool {
        matches!(self, CommitOutcome::Committed { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishReceipt {
    pub message: MessageId,
    pub tickets: Vec<(QueueRef, TicketId)>,
}

/// A resumable job checkpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub identifier: SnapshotIdentifier,
    pub owner: JobInstanceId,
    pub data: Vec<u8>,
    pub created_utc: DateTime<Utc>,
    pub updated_utc: DateTime<Utc>,
}

/// Whose lifecycle a log row describes.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogSubject {
    /// `service_bus_log`
    HostRuntime(HostRuntimeId),
    Instance(InstanceRef),
}

impl core::fmt::Display for LogSubject {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            LogSubject::HostRuntime(id) => write!(f, "host-runtime:{id}"),
            LogSubject::Instance(instance) => instance.fmt(f),
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Trace,
    Debug,
    Information,
    Warning,
    Error,
    Critical,
}

impl LogLevel {
    pub fn code(self) -> i16 {
        match self {
            LogLevel::Trace => 0,
            LogLevel::Debug => 1,
            LogLevel::Information => 2,
            LogLevel::Warning => 3,
            LogLevel::Error => 4,
            LogLevel::Critical => 5,
        }
    }

    pub fn from_code(code: i16) -> Option<Self> {
        match code {
            0 => Some(LogLevel::Trace),
            1 => Some(LogLevel::Debug),
            2 => Some(LogLevel::Information),
            3 => Some(LogLevel::Warning),
            4 => Some(LogLevel::Error),
            5 => Some(LogLevel::Critical),
            _ => None,
        }
    }
}

/// An append-only lifecycle/audit row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogRecord {
    pub id: LogId,
    pub subject: LogSubject,
    pub level: LogLevel,
    pub text: String,
    pub message: Option<MessageId>,
    /// When set, the owning host runtime / instance moves to this state.
    pub status: Option<ComponentState>,
    pub correlation_id: Option<String>,
    pub created_utc: DateTime<Utc>,
}

impl LogRecord {
    pub fn new(
        subject: LogSubject,
        level: LogLevel,
        text: impl Into<String>,
        created_utc: DateTime<Utc>,
    ) -> Self {
        Self {
            id: LogId::new(),
            subject,
            level,
            text: text.into(),
            message: None,
            status: None,
            correlation_id: None,
            created_utc,
        }
    }

    pub fn with_status(mut self, status: ComponentState) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_message(mut self, message: MessageId) -> Self {
        self.message = Some(message);
        self
    }

    pub fn with_correlation(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }
}

/// Ticket counts per state for one queue.
pub type QueueDepth = HashMap<TicketState, u64>;

#[cfg(test)]
mod tests {
    use super::*;

    fn claimed_at(at: DateTime<Utc>) -> DeliveryTicket {
        let mut ticket =
            DeliveryTicket::ready(QueueRef::Subscriber(SubscriberId::new()), MessageId::new());
        ticket.owner_instance = Some(Uuid::new_v4());
        ticket.state = TicketState::InProgress;
        ticket.last_access_utc = Some(at);
        ticket
    }

    #[test]
    fn heartbeat_keeps_a_claim_out_of_reach() {
        let start = Utc::now();
        let timeout = Duration::from_secs(30);
        let mut ticket = claimed_at(start);
        let observed = ticket.concurrency_token;
        let later = start + chrono::Duration::seconds(45);

        assert!(ticket.accepts_claim(observed, timeout, later));

        ticket.last_access_utc = Some(later - chrono::Duration::seconds(1));
        assert!(!ticket.accepts_claim(observed, timeout, later));
    }

    #[test]
    fn terminal_tickets_refuse_claims() {
        let now = Utc::now();
        for state in [TicketState::Completed, TicketState::Suspended] {
            let mut ticket = claimed_at(now - chrono::Duration::hours(1));
            ticket.state = state;
            assert!(!ticket.accepts_claim(ticket.concurrency_token, Duration::ZERO, now));
        }
    }

    #[test]
    fn rotated_token_refuses_claims() {
        let now = Utc::now();
        let mut ticket = claimed_at(now - chrono::Duration::hours(1));
        ticket.state = TicketState::Failed;
        let observed = ticket.concurrency_token;
        assert!(ticket.accepts_claim(observed, Duration::from_secs(1), now));

        ticket.concurrency_token = ConcurrencyToken::issue();
        assert!(!ticket.accepts_claim(observed, Duration::from_secs(1), now));
    }
}
