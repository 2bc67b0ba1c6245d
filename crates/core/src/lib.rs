//! `busline-core`: delivery engine building blocks.
//!
//! This crate contains **pure** primitives (no storage or IO): identifiers, the
//! delivery ticket state machine, concurrency tokens and delivery policies.

pub mod error;
pub mod id;
pub mod policy;
pub mod state;
pub mod time;
pub mod token;

pub use error::{DomainError, DomainResult};
pub use id::{
    HostId, HostRuntimeId, JobId, JobInstanceId, LogId, MessageId, MessageTypeId,
    PublisherId, PublisherInstanceId, ScenarioId, SnapshotIdentifier, SubscriberId,
    SubscriberInstanceId, TicketId,
};
pub use policy::{BackoffPolicy, BackoffStrategy, DeliveryPolicy};
pub use state::{
    ComponentState, DeliveryOutcome, HostState, TicketState, TicketUpdate, resolve_outcome,
};
pub use time::{Clock, ManualClock, SystemClock};
pub use token::ConcurrencyToken;
