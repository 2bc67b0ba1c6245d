//! Storage boundary of the bus.
//!
//! Four async traits split the persistent state by concern: the catalog
//! ([`CatalogStore`]), messages and delivery tickets ([`DeliveryStore`]), job
//! checkpoints ([`SnapshotStore`]) and lifecycle logs ([`AuditStore`]). Both stores
//! implement all four:
//!
//! - [`InMemoryBusStore`] for tests and single-process development,
//! - [`PostgresBusStore`] for production (schema `bus`).
//!
//! Claims and result writes are compare-and-swap on the ticket's
//! `ConcurrencyToken`; losing such a race is reported as an outcome, not an error.

pub mod in_memory;
pub mod model;
pub mod postgres;
pub mod r#trait;

pub use in_memory::InMemoryBusStore;
pub use model::{
    ClaimOutcome, ClaimedDelivery, CommitOutcome, Consumer, DeliveryTicket, Host, HostRuntime,
    Instance, InstanceRecord, InstanceRef, Job, JobInstance, JobSpec, LogLevel, LogRecord,
    LogSubject, Message, MessageType, MessageTypeSpec, PublishReceipt, Publisher,
    PublisherInstance, PublisherSpec, QueueDepth, QueueRef, Scenario, Snapshot, Subscriber,
    SubscriberInstance, SubscriberSpec, TicketKind, reclaim_cutoff,
};
pub use postgres::PostgresBusStore;
pub use r#trait::{
    AuditStore, BusStore, CatalogStore, DeliveryStore, SnapshotStore, StoreError, StoreResult,
    expect_one,
};
