use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{FromRow, Row};
use tracing::{Span, instrument};
use uuid::Uuid;

use busline_core::{JobInstanceId, SnapshotIdentifier};

use super::{PostgresBusStore, map_sqlx_error};
use crate::store::model::Snapshot;
use crate::store::r#trait::{SnapshotStore, StoreError, StoreResult, expect_one};

#[derive(Debug)]
struct SnapshotRow {
    identifier: String,
    id_job_instance: Uuid,
    data: Vec<u8>,
    created_utc: DateTime<Utc>,
    updated_utc: DateTime<Utc>,
}

impl<'r> FromRow<'r, PgRow> for SnapshotRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(SnapshotRow {
            identifier: row.try_get("identifier")?,
            id_job_instance: row.try_get("id_job_instance")?,
            data: row.try_get("data")?,
            created_utc: row.try_get("created_utc")?,
            updated_utc: row.try_get("updated_utc")?,
        })
    }
}

impl TryFrom<SnapshotRow> for Snapshot {
    type Error = StoreError;

    fn try_from(row: SnapshotRow) -> Result<Self, Self::Error> {
        Ok(Snapshot {
            identifier: SnapshotIdentifier::new(row.identifier)?,
            owner: JobInstanceId::from_uuid(row.id_job_instance),
            data: row.data,
            created_utc: row.created_utc,
            updated_utc: row.updated_utc,
        })
    }
}

fn snapshot_from_row(row: &PgRow) -> StoreResult<Snapshot> {
    SnapshotRow::from_row(row)
        .map_err(|e| StoreError::Serialization(format!("failed to read snapshot row: {e}")))?
        .try_into()
}

#[async_trait]
impl SnapshotStore for PostgresBusStore {
    /// Upsert keyed by identifier; `created_utc` is kept from the first save.
    #[instrument(
        skip(self, data),
        fields(identifier = %identifier, owner = %owner, bytes = data.len()),
        err
    )]
    async fn save_snapshot(
        &self,
        owner: JobInstanceId,
        identifier: &SnapshotIdentifier,
        data: &[u8],
        now: DateTime<Utc>,
    ) -> StoreResult<Snapshot> {
        let row = sqlx::query(
            r#"
            INSERT INTO bus.snapshot (identifier, id_job_instance, data, created_utc, updated_utc)
            VALUES ($1, $2, $3, $4, $4)
            ON CONFLICT (identifier) DO UPDATE SET
                id_job_instance = EXCLUDED.id_job_instance,
                data = EXCLUDED.data,
                updated_utc = EXCLUDED.updated_utc
            RETURNING identifier, id_job_instance, data, created_utc, updated_utc
            "#,
        )
        .bind(identifier.as_str())
        .bind(owner.as_uuid())
        .bind(data)
        .bind(now)
        .fetch_one(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("save_snapshot", e))?;

        snapshot_from_row(&row)
    }

    /// Rewrites only the owner; the stored data is untouched.
    #[instrument(skip(self), fields(identifier = %identifier, new_owner = %new_owner), err)]
    async fn transfer_snapshot(
        &self,
        new_owner: JobInstanceId,
        identifier: &SnapshotIdentifier,
        now: DateTime<Utc>,
    ) -> StoreResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE bus.snapshot
            SET id_job_instance = $2, updated_utc = $3
            WHERE identifier = $1
            "#,
        )
        .bind(identifier.as_str())
        .bind(new_owner.as_uuid())
        .bind(now)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("transfer_snapshot", e))?;

        match result.rows_affected() {
            0 => Err(StoreError::not_found("snapshot", identifier)),
            n => expect_one("transfer_snapshot", n),
        }
    }

    #[instrument(skip(self), fields(identifier = %identifier, found), err)]
    async fn load_snapshot(
        &self,
        identifier: &SnapshotIdentifier,
    ) -> StoreResult<Option<Snapshot>> {
        let row = sqlx::query(
            r#"
            SELECT identifier, id_job_instance, data, created_utc, updated_utc
            FROM bus.snapshot
            WHERE identifier = $1
            "#,
        )
        .bind(identifier.as_str())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("load_snapshot", e))?;

        Span::current().record("found", row.is_some());
        row.as_ref().map(snapshot_from_row).transpose()
    }

    #[instrument(skip(self), fields(identifier = %identifier), err)]
    async fn delete_snapshot(&self, identifier: &SnapshotIdentifier) -> StoreResult<bool> {
        let result = sqlx::query("DELETE FROM bus.snapshot WHERE identifier = $1")
            .bind(identifier.as_str())
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("delete_snapshot", e))?;

        match result.rows_affected() {
            0 => Ok(false),
            n => expect_one("delete_snapshot", n).map(|()| true),
        }
    }
}
