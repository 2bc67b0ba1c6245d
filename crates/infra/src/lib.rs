//! Storage and runtime layer of the bus: Postgres and in-memory stores, startup
//! registration, configuration, catalog caching, audit logging, publishing and
//! the consumer loop.

pub mod audit;
pub mod cache;
pub mod cancel;
pub mod config;
pub mod consumer;
pub mod publisher;
pub mod registration;
pub mod schema;
pub mod store;

pub use audit::{AuditDisposition, AuditLogger};
pub use cache::{CacheSettings, CacheStats, CatalogCache};
pub use cancel::Cancellable;
pub use config::{BusConfig, ConfigError};
pub use consumer::{ConsumerWorker, PollOutcome, WorkerConfig, WorkerStats};
pub use publisher::{Publication, Publisher};
pub use registration::{PlannedInstance, StartupPlan, StartupReceipt};
pub use store::{
    AuditStore, BusStore, CatalogStore, DeliveryStore, InMemoryBusStore, PostgresBusStore,
    SnapshotStore, StoreError, StoreResult,
};

#[cfg(test)]
mod integration_tests;
