//! Postgres-backed bus store.
//!
//! All tables live in the `bus` schema (see `migrations/0001_bus_schema.sql`).
//!
//! ## Error Mapping
//!
//! SQLx errors are mapped to `StoreError` as follows:
//!
//! | SQLx Error | PostgreSQL Error Code | StoreError | Scenario |
//! |------------|----------------------|------------|----------|
//! | Database (unique violation) | `23505` | `Integrity` | Duplicate message/ticket/instance id |
//! | Database (foreign key violation) | `23503` | `NotFound` | Referenced catalog row or instance is missing |
//! | Database (check constraint violation) | `23514` | `Validation` | Out-of-range state code, negative retry count |
//! | Database (other) | Any other | `Database` | Other database errors |
//! | PoolClosed | N/A | `Database` | Connection pool was closed |
//! | Other | N/A | `Database` | Network errors, connection failures, etc. |
//!
//! Registration upserts turn the unique violation on `scenario.name` into a
//! `RegistrationConflict` themselves.
//!
//! ## Thread Safety
//!
//! `PostgresBusStore` is `Send + Sync` and can be shared across tasks; all operations
//! go through the SQLx connection pool.

mod audit;
mod catalog;
mod delivery;
mod snapshots;

use std::sync::Arc;
use std::time::Duration;

use sqlx::PgPool;
use sqlx::postgres::PgArguments;
use sqlx::query::Query;

use busline_core::DeliveryPolicy;

use super::model::{QueueRef, TicketKind};
use super::r#trait::StoreError;

/// Postgres-backed bus store.
#[derive(Debug, Clone)]
pub struct PostgresBusStore {
    pool: Arc<PgPool>,
}

impl PostgresBusStore {
    /// Create a new store over the given connection pool.
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

/// Column layout of one ticket table.
#[derive(Debug, Clone, Copy)]
pub(crate) struct TicketTable {
    pub table: &'static str,
    pub id: &'static str,
    pub queue: &'static str,
    pub owner: &'static str,
}

pub(crate) const SUBSCRIBER_TICKETS: TicketTable = TicketTable {
    table: "bus.subscriber_message",
    id: "id_subscriber_message",
    queue: "id_subscriber",
    owner: "id_subscriber_instance",
};

pub(crate) const TEMP_QUEUE_TICKETS: TicketTable = TicketTable {
    table: "bus.message_temp_queue",
    id: "id_message_temp_queue",
    queue: "id_job",
    owner: "id_job_instance",
};

pub(crate) fn ticket_table(kind: TicketKind) -> TicketTable {
    match kind {
        TicketKind::Subscriber => SUBSCRIBER_TICKETS,
        TicketKind::TempQueue => TEMP_QUEUE_TICKETS,
    }
}

impl TicketTable {
    /// Ticket columns, aliased so both tables decode the same way.
    pub fn columns(&self, alias: &str) -> String {
        format!(
            "{alias}.{id} AS id_ticket, {alias}.id_message, {alias}.{queue} AS id_queue, \
             {alias}.{owner} AS id_owner, {alias}.last_access_utc, {alias}.state, \
             {alias}.snapshot, {alias}.retry_count, {alias}.delayed_to_utc, \
             {alias}.concurrency_token",
            id = self.id,
            queue = self.queue,
            owner = self.owner,
        )
    }
}

/// Bind a queue key, which is a UUID for subscribers and an integer for jobs.
pub(crate) fn bind_queue<'q>(
    query: Query<'q, sqlx::Postgres, PgArguments>,
    queue: QueueRef,
) -> Query<'q, sqlx::Postgres, PgArguments> {
    match queue {
        QueueRef::Subscriber(id) => query.bind(*id.as_uuid()),
        QueueRef::Job(id) => query.bind(id.get()),
    }
}

pub(crate) fn duration_to_ms(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}

pub(crate) fn ms_to_duration(ms: i64) -> Duration {
    Duration::from_millis(u64::try_from(ms).unwrap_or(0))
}

pub(crate) fn policy_from_columns(
    is_fifo: bool,
    processing_timeout_ms: i64,
    max_retry: Option<i32>,
) -> DeliveryPolicy {
    DeliveryPolicy {
        fifo: is_fifo,
        processing_timeout: ms_to_duration(processing_timeout_ms),
        max_retry: max_retry.map(|m| u32::try_from(m).unwrap_or(0)),
    }
}

pub(crate) fn max_retry_column(policy: &DeliveryPolicy) -> Option<i32> {
    policy.max_retry.map(|m| i32::try_from(m).unwrap_or(i32::MAX))
}

pub(crate) fn retry_count_column(retry_count: u32) -> i32 {
    i32::try_from(retry_count).unwrap_or(i32::MAX)
}

/// Map SQLx errors to `StoreError`.
pub(crate) fn map_sqlx_error(operation: &'static str, err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {}: {}", operation, db_err.message());

            match db_err.code().as_deref() {
                // Unique violation: a row that must be new already exists
                Some("23505") => StoreError::Integrity {
                    operation,
                    expected: 1,
                    affected: 0,
                },
                // Foreign key violation
                Some("23503") => StoreError::NotFound {
                    entity: "referenced row",
                    key: db_err.constraint().unwrap_or(operation).to_string(),
                },
                // Check constraint violation
                Some("23514") => StoreError::Validation(msg),
                _ => StoreError::Database(msg),
            }
        }
        sqlx::Error::PoolClosed => {
            StoreError::Database(format!("connection pool closed in {}", operation))
        }
        sqlx::Error::ColumnDecode { index, source } => StoreError::Serialization(format!(
            "failed to decode column {} in {}: {}",
            index, operation, source
        )),
        _ => StoreError::Database(format!("sqlx error in {}: {}", operation, err)),
    }
}

/// Check if an error is a unique constraint violation.
pub(crate) fn is_unique_violation(err: &sqlx::Error) -> bool {
    if let sqlx::Error::Database(db_err) = err {
        if let Some(code) = db_err.code() {
            return code.as_ref() == "23505";
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn policy_columns_round_trip() {
        let policy = DeliveryPolicy::fifo(Duration::from_secs(30)).with_max_retry(Some(3));
        let restored = policy_from_columns(
            policy.fifo,
            duration_to_ms(policy.processing_timeout),
            max_retry_column(&policy),
        );
        assert_eq!(restored, policy);

        let unlimited = DeliveryPolicy::default().with_max_retry(None);
        assert_eq!(max_retry_column(&unlimited), None);
    }

    #[test]
    fn ticket_tables_alias_the_same_columns() {
        let subscriber = SUBSCRIBER_TICKETS.columns("t");
        let temp = TEMP_QUEUE_TICKETS.columns("t");
        assert!(subscriber.contains("t.id_subscriber AS id_queue"));
        assert!(temp.contains("t.id_job AS id_queue"));
        assert_eq!(
            subscriber.matches(" AS ").count(),
            temp.matches(" AS ").count()
        );
    }

    #[test]
    fn pool_closed_maps_to_database_error() {
        let err = map_sqlx_error("claim", sqlx::Error::PoolClosed);
        assert!(matches!(err, StoreError::Database(_)));
        assert!(!is_unique_violation(&sqlx::Error::PoolClosed));
    }
}
