//! Database schema for the Postgres store.
//!
//! The DDL lives in `migrations/0001_bus_schema.sql`; every statement is idempotent
//! (`IF NOT EXISTS`), so applying it on each start is safe.

use sqlx::PgPool;
use tracing::instrument;

use crate::store::StoreResult;
use crate::store::postgres::map_sqlx_error;

/// Name of the Postgres schema holding every bus table.
pub const SCHEMA: &str = "bus";

pub const BUS_SCHEMA_SQL: &str = include_str!("../migrations/0001_bus_schema.sql");

/// Tables created by [`BUS_SCHEMA_SQL`].
pub const TABLES: [&str; 18] = [
    "service_bus_host",
    "service_bus_host_runtime",
    "scenario",
    "message_type",
    "publisher",
    "subscriber",
    "job",
    "publisher_instance",
    "subscriber_instance",
    "job_instance",
    "message",
    "subscriber_message",
    "message_temp_queue",
    "snapshot",
    "service_bus_log",
    "publisher_instance_log",
    "subscriber_instance_log",
    "job_instance_log",
];

/// Create the `bus` schema and its tables if they do not exist yet.
#[instrument(skip(pool), err)]
pub async fn apply(pool: &PgPool) -> StoreResult<()> {
    sqlx::raw_sql(BUS_SCHEMA_SQL)
        .execute(pool)
        .await
        .map_err(|e| map_sqlx_error("apply_schema", e))?;
    tracing::info!(schema = SCHEMA, tables = TABLES.len(), "bus schema applied");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ddl_creates_every_table_in_the_bus_schema() {
        for table in TABLES {
            let ddl = format!("CREATE TABLE IF NOT EXISTS {SCHEMA}.{table} (");
            assert!(BUS_SCHEMA_SQL.contains(&ddl), "missing table {table}");
        }
        assert_eq!(BUS_SCHEMA_SQL.matches("CREATE TABLE").count(), TABLES.len());
    }

    #[test]
    fn integer_keys_only_for_message_type_and_job() {
        assert_eq!(BUS_SCHEMA_SQL.matches("GENERATED ALWAYS AS IDENTITY").count(), 2);
    }
}
