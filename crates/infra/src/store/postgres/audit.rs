use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::Row;
use sqlx::postgres::PgRow;
use tracing::instrument;
use uuid::Uuid;

use busline_core::{ComponentState, LogId, MessageId};

use super::catalog::instance_table;
use super::{PostgresBusStore, map_sqlx_error};
use crate::store::model::{InstanceRef, LogLevel, LogRecord, LogSubject};
use crate::store::r#trait::{AuditStore, StoreError, StoreResult, expect_one};

/// Where a subject's log rows and current state live.
struct LogTarget {
    log_table: &'static str,
    owner_table: &'static str,
    id_column: &'static str,
    id: Uuid,
}

fn log_target(subject: LogSubject) -> LogTarget {
    match subject {
        LogSubject::HostRuntime(id) => LogTarget {
            log_table: "bus.service_bus_log",
            owner_table: "bus.service_bus_host_runtime",
            id_column: "id_service_bus_host_runtime",
            id: *id.as_uuid(),
        },
        LogSubject::Instance(instance) => {
            let (owner_table, id_column, id) = instance_table(instance);
            LogTarget {
                log_table: match instance {
                    InstanceRef::Publisher(_) => "bus.publisher_instance_log",
                    InstanceRef::Subscriber(_) => "bus.subscriber_instance_log",
                    InstanceRef::Job(_) => "bus.job_instance_log",
                },
                owner_table,
                id_column,
                id,
            }
        }
    }
}

fn log_from_row(subject: LogSubject, row: &PgRow) -> StoreResult<LogRecord> {
    let decode = |e: sqlx::Error| StoreError::Serialization(format!("failed to read log row: {e}"));

    let level: i16 = row.try_get("level").map_err(decode)?;
    let status: Option<i16> = row.try_get("status").map_err(decode)?;
    let message: Option<Uuid> = row.try_get("id_message").map_err(decode)?;
    let created_utc: DateTime<Utc> = row.try_get("created_utc").map_err(decode)?;

    Ok(LogRecord {
        id: LogId::from_uuid(row.try_get("id_log").map_err(decode)?),
        subject,
        level: LogLevel::from_code(level)
            .ok_or_else(|| StoreError::Serialization(format!("unknown log level {level}")))?,
        text: row.try_get("text").map_err(decode)?,
        message: message.map(MessageId::from_uuid),
        status: status.map(ComponentState::from_code).transpose()?,
        correlation_id: row.try_get("correlation_id").map_err(decode)?,
        created_utc,
    })
}

#[async_trait]
impl AuditStore for PostgresBusStore {
    /// Insert the log row and apply its status in one transaction.
    #[instrument(
        skip(self, record),
        fields(subject = %record.subject, level = ?record.level, status = ?record.status),
        err
    )]
    async fn append_log(&self, record: &LogRecord) -> StoreResult<()> {
        let target = log_target(record.subject);

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        let inserted = sqlx::query(&format!(
            r#"
            INSERT INTO {log_table} (
                id_log,
                {id_column},
                level,
                text,
                id_message,
                status,
                correlation_id,
                created_utc
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
            log_table = target.log_table,
            id_column = target.id_column,
        ))
        .bind(record.id.as_uuid())
        .bind(target.id)
        .bind(record.level.code())
        .bind(&record.text)
        .bind(record.message.map(|m| *m.as_uuid()))
        .bind(record.status.map(ComponentState::code))
        .bind(record.correlation_id.as_deref())
        .bind(record.created_utc)
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("insert_log", e))?;
        expect_one("insert_log", inserted.rows_affected())?;

        if let Some(status) = record.status {
            let updated = sqlx::query(&format!(
                "UPDATE {} SET state = $2 WHERE {} = $1",
                target.owner_table, target.id_column
            ))
            .bind(target.id)
            .bind(status.code())
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("update_status", e))?;
            expect_one("update_status", updated.rows_affected())?;
        }

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;
        Ok(())
    }

    #[instrument(skip(self), fields(subject = %subject), err)]
    async fn list_logs(&self, subject: LogSubject) -> StoreResult<Vec<LogRecord>> {
        let target = log_target(subject);
        let rows = sqlx::query(&format!(
            r#"
            SELECT id_log, level, text, id_message, status, correlation_id, created_utc
            FROM {}
            WHERE {} = $1
            ORDER BY created_utc, id_log
            "#,
            target.log_table, target.id_column
        ))
        .bind(target.id)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("list_logs", e))?;

        rows.iter().map(|row| log_from_row(subject, row)).collect()
    }

    #[instrument(skip(self), fields(subject = %subject), err)]
    async fn current_state(&self, subject: LogSubject) -> StoreResult<Option<ComponentState>> {
        let target = log_target(subject);
        let state: Option<i16> = sqlx::query_scalar(&format!(
            "SELECT state FROM {} WHERE {} = $1",
            target.owner_table, target.id_column
        ))
        .bind(target.id)
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("current_state", e))?;

        Ok(state.map(ComponentState::from_code).transpose()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use busline_core::{HostRuntimeId, JobInstanceId, PublisherInstanceId, SubscriberInstanceId};

    #[test]
    fn each_subject_logs_into_its_own_table() {
        let runtime = log_target(LogSubject::HostRuntime(HostRuntimeId::new()));
        assert_eq!(runtime.log_table, "bus.service_bus_log");
        assert_eq!(runtime.owner_table, "bus.service_bus_host_runtime");

        let subscriber = log_target(LogSubject::Instance(InstanceRef::Subscriber(
            SubscriberInstanceId::new(),
        )));
        assert_eq!(subscriber.log_table, "bus.subscriber_instance_log");
        assert_eq!(subscriber.id_column, "id_subscriber_instance");

        let job = log_target(LogSubject::Instance(InstanceRef::Job(JobInstanceId::new())));
        assert_eq!(job.log_table, "bus.job_instance_log");
        assert_eq!(job.owner_table, "bus.job_instance");
    }

    #[test]
    fn instance_log_tables_pair_with_their_owner() {
        let instances = [
            InstanceRef::Publisher(PublisherInstanceId::new()),
            InstanceRef::Subscriber(SubscriberInstanceId::new()),
            InstanceRef::Job(JobInstanceId::new()),
        ];
        for instance in instances {
            let target = log_target(LogSubject::Instance(instance));
            assert_eq!(target.log_table, format!("{}_log", target.owner_table));
            assert_eq!(target.id, instance_table(instance).2);
        }
    }
}
