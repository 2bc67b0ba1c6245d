use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgConnection, Row};
use tracing::{Span, instrument};
use uuid::Uuid;

use busline_core::{
    ComponentState, HostId, HostRuntimeId, JobId, MessageTypeId, PublisherId, ScenarioId,
    SubscriberId,
};

use super::{
    PostgresBusStore, duration_to_ms, is_unique_violation, map_sqlx_error, max_retry_column,
    policy_from_columns,
};
use crate::registration::{Registrar, StartupPlan, StartupReceipt, apply_plan, ensure_same};
use crate::store::model::{
    Host, HostRuntime, InstanceRecord, InstanceRef, Job, JobSpec, MessageType, MessageTypeSpec,
    Publisher, PublisherSpec, QueueRef, Scenario, Subscriber, SubscriberSpec,
};
use crate::store::r#trait::{CatalogStore, StoreError, StoreResult, expect_one};

// Upserts use `ON CONFLICT ... DO UPDATE` so the stored row always comes back through
// `RETURNING`, whether it was just inserted or already existed.

async fn upsert_host(conn: &mut PgConnection, host: &Host) -> StoreResult<Host> {
    let row = sqlx::query(
        r#"
        INSERT INTO bus.service_bus_host (id_service_bus_host, name)
        VALUES ($1, $2)
        ON CONFLICT (id_service_bus_host) DO UPDATE SET name = bus.service_bus_host.name
        RETURNING id_service_bus_host, name
        "#,
    )
    .bind(host.id.as_uuid())
    .bind(&host.name)
    .fetch_one(&mut *conn)
    .await
    .map_err(|e| map_sqlx_error("upsert_host", e))?;

    let stored = Host {
        id: HostId::from_uuid(get(&row, "id_service_bus_host")?),
        name: get(&row, "name")?,
    };
    ensure_same("host", host.id, "name", &stored.name, &host.name)?;
    Ok(stored)
}

async fn insert_host_runtime(conn: &mut PgConnection, runtime: &HostRuntime) -> StoreResult<()> {
    let result = sqlx::query(
        r#"
        INSERT INTO bus.service_bus_host_runtime (
            id_service_bus_host_runtime,
            id_service_bus_host,
            user_name,
            machine_name,
            started_utc,
            ended_utc,
            state
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7)
        "#,
    )
    .bind(runtime.id.as_uuid())
    .bind(runtime.host.as_uuid())
    .bind(&runtime.user_name)
    .bind(&runtime.machine_name)
    .bind(runtime.started_utc)
    .bind(runtime.ended_utc)
    .bind(runtime.state.code())
    .execute(&mut *conn)
    .await
    .map_err(|e| map_sqlx_error("insert_host_runtime", e))?;

    expect_one("insert_host_runtime", result.rows_affected())
}

async fn upsert_scenario(conn: &mut PgConnection, scenario: &Scenario) -> StoreResult<Scenario> {
    let row = sqlx::query(
        r#"
        INSERT INTO bus.scenario (id_scenario, name)
        VALUES ($1, $2)
        ON CONFLICT (id_scenario) DO UPDATE SET name = bus.scenario.name
        RETURNING id_scenario, name
        "#,
    )
    .bind(scenario.id.as_uuid())
    .bind(&scenario.name)
    .fetch_one(&mut *conn)
    .await
    .map_err(|e| {
        if is_unique_violation(&e) {
            StoreError::conflict(
                "scenario",
                &scenario.name,
                "name is registered under a different id",
            )
        } else {
            map_sqlx_error("upsert_scenario", e)
        }
    })?;

    let stored = Scenario {
        id: ScenarioId::from_uuid(get(&row, "id_scenario")?),
        name: get(&row, "name")?,
    };
    ensure_same("scenario", scenario.id, "name", &stored.name, &scenario.name)?;
    Ok(stored)
}

async fn upsert_message_type(
    conn: &mut PgConnection,
    spec: &MessageTypeSpec,
) -> StoreResult<MessageType> {
    let row = sqlx::query(
        r#"
        INSERT INTO bus.message_type (name, type_name)
        VALUES ($1, $2)
        ON CONFLICT (name) DO UPDATE SET name = bus.message_type.name
        RETURNING id_message_type, name, type_name
        "#,
    )
    .bind(&spec.name)
    .bind(&spec.type_name)
    .fetch_one(&mut *conn)
    .await
    .map_err(|e| map_sqlx_error("upsert_message_type", e))?;

    let stored = message_type_from_row(&row)?;
    ensure_same(
        "message type",
        &spec.name,
        "type name",
        &stored.type_name,
        &spec.type_name,
    )?;
    Ok(stored)
}

async fn find_message_type(
    conn: &mut PgConnection,
    name: &str,
) -> StoreResult<Option<MessageType>> {
    let row = sqlx::query(
        "SELECT id_message_type, name, type_name FROM bus.message_type WHERE name = $1",
    )
    .bind(name)
    .fetch_optional(&mut *conn)
    .await
    .map_err(|e| map_sqlx_error("find_message_type", e))?;

    row.as_ref().map(message_type_from_row).transpose()
}

async fn upsert_publisher(conn: &mut PgConnection, publisher: &Publisher) -> StoreResult<Publisher> {
    let row = sqlx::query(
        r#"
        INSERT INTO bus.publisher (id_publisher, name, id_scenario, id_message_type)
        VALUES ($1, $2, $3, $4)
        ON CONFLICT (id_publisher) DO UPDATE SET id_publisher = bus.publisher.id_publisher
        RETURNING id_publisher, name, id_scenario, id_message_type
        "#,
    )
    .bind(publisher.id.as_uuid())
    .bind(&publisher.name)
    .bind(publisher.scenario.as_uuid())
    .bind(publisher.message_type.get())
    .fetch_one(&mut *conn)
    .await
    .map_err(|e| map_sqlx_error("upsert_publisher", e))?;

    let stored = Publisher {
        id: PublisherId::from_uuid(get(&row, "id_publisher")?),
        name: get(&row, "name")?,
        scenario: ScenarioId::from_uuid(get(&row, "id_scenario")?),
        message_type: MessageTypeId::new(get(&row, "id_message_type")?),
    };
    ensure_same("publisher", publisher.id, "name", &stored.name, &publisher.name)?;
    ensure_same(
        "publisher",
        publisher.id,
        "scenario",
        &stored.scenario,
        &publisher.scenario,
    )?;
    ensure_same(
        "publisher",
        publisher.id,
        "message type",
        &stored.message_type,
        &publisher.message_type,
    )?;
    Ok(stored)
}

const SUBSCRIBER_COLUMNS: &str = "id_subscriber, name, id_scenario, id_message_type, is_fifo, \
                                  processing_timeout_ms, max_retry";

async fn upsert_subscriber(
    conn: &mut PgConnection,
    subscriber: &Subscriber,
) -> StoreResult<Subscriber> {
    // Policy is refreshed only when the identity matches; otherwise nothing is returned
    // and the stored row is read back to report the conflict.
    let upserted = sqlx::query(&format!(
        r#"
        INSERT INTO bus.subscriber ({SUBSCRIBER_COLUMNS})
        VALUES ($1, $2, $3, $4, $5, $6, $7)
        ON CONFLICT (id_subscriber) DO UPDATE SET
            is_fifo = EXCLUDED.is_fifo,
            processing_timeout_ms = EXCLUDED.processing_timeout_ms,
            max_retry = EXCLUDED.max_retry
        WHERE bus.subscriber.name = EXCLUDED.name
          AND bus.subscriber.id_scenario = EXCLUDED.id_scenario
          AND bus.subscriber.id_message_type = EXCLUDED.id_message_type
        RETURNING {SUBSCRIBER_COLUMNS}
        "#
    ))
    .bind(subscriber.id.as_uuid())
    .bind(&subscriber.name)
    .bind(subscriber.scenario.as_uuid())
    .bind(subscriber.message_type.get())
    .bind(subscriber.policy.fifo)
    .bind(duration_to_ms(subscriber.policy.processing_timeout))
    .bind(max_retry_column(&subscriber.policy))
    .fetch_optional(&mut *conn)
    .await
    .map_err(|e| map_sqlx_error("upsert_subscriber", e))?;

    if let Some(row) = upserted {
        return subscriber_from_row(&row);
    }

    let stored = find_subscriber(conn, subscriber.id)
        .await?
        .ok_or_else(|| StoreError::not_found("subscriber", subscriber.id))?;
    ensure_same("subscriber", subscriber.id, "name", &stored.name, &subscriber.name)?;
    ensure_same(
        "subscriber",
        subscriber.id,
        "scenario",
        &stored.scenario,
        &subscriber.scenario,
    )?;
    ensure_same(
        "subscriber",
        subscriber.id,
        "message type",
        &stored.message_type,
        &subscriber.message_type,
    )?;
    Ok(stored)
}

async fn find_subscriber(
    conn: &mut PgConnection,
    id: SubscriberId,
) -> StoreResult<Option<Subscriber>> {
    let row = sqlx::query(&format!(
        "SELECT {SUBSCRIBER_COLUMNS} FROM bus.subscriber WHERE id_subscriber = $1"
    ))
    .bind(id.as_uuid())
    .fetch_optional(&mut *conn)
    .await
    .map_err(|e| map_sqlx_error("find_subscriber", e))?;

    row.as_ref().map(subscriber_from_row).transpose()
}

const JOB_COLUMNS: &str =
    "id_job, name, id_scenario, id_message_type, is_fifo, processing_timeout_ms, max_retry";

async fn upsert_job(conn: &mut PgConnection, job: &Job) -> StoreResult<Job> {
    let upserted = sqlx::query(&format!(
        r#"
        INSERT INTO bus.job (name, id_scenario, id_message_type, is_fifo, processing_timeout_ms, max_retry)
        VALUES ($1, $2, $3, $4, $5, $6)
        ON CONFLICT (id_scenario, name) DO UPDATE SET
            is_fifo = EXCLUDED.is_fifo,
            processing_timeout_ms = EXCLUDED.processing_timeout_ms,
            max_retry = EXCLUDED.max_retry
        WHERE bus.job.id_message_type IS NOT DISTINCT FROM EXCLUDED.id_message_type
        RETURNING {JOB_COLUMNS}
        "#
    ))
    .bind(&job.name)
    .bind(job.scenario.as_uuid())
    .bind(job.message_type.map(MessageTypeId::get))
    .bind(job.policy.fifo)
    .bind(duration_to_ms(job.policy.processing_timeout))
    .bind(max_retry_column(&job.policy))
    .fetch_optional(&mut *conn)
    .await
    .map_err(|e| map_sqlx_error("upsert_job", e))?;

    if let Some(row) = upserted {
        return job_from_row(&row);
    }

    let row = sqlx::query(&format!(
        "SELECT {JOB_COLUMNS} FROM bus.job WHERE id_scenario = $1 AND name = $2"
    ))
    .bind(job.scenario.as_uuid())
    .bind(&job.name)
    .fetch_optional(&mut *conn)
    .await
    .map_err(|e| map_sqlx_error("find_job", e))?
    .ok_or_else(|| StoreError::not_found("job", &job.name))?;

    let stored = job_from_row(&row)?;
    ensure_same(
        "job",
        &job.name,
        "message type",
        &stored.message_type,
        &job.message_type,
    )?;
    Ok(stored)
}

async fn insert_instance(conn: &mut PgConnection, record: &InstanceRecord) -> StoreResult<()> {
    let (table, id_column, id) = instance_table(record.instance());
    let (component_column, created_utc, last_activity_utc, state) = match record {
        InstanceRecord::Publisher(i) => ("id_publisher", i.created_utc, i.last_activity_utc, i.state),
        InstanceRecord::Subscriber(i) => {
            ("id_subscriber", i.created_utc, i.last_activity_utc, i.state)
        }
        InstanceRecord::Job(i) => ("id_job", i.created_utc, i.last_activity_utc, i.state),
    };

    let sql = format!(
        r#"
        INSERT INTO {table} (
            {id_column},
            id_service_bus_host_runtime,
            created_utc,
            last_activity_utc,
            state,
            {component_column}
        )
        VALUES ($1, $2, $3, $4, $5, $6)
        "#
    );
    let query = sqlx::query(&sql)
        .bind(id)
        .bind(*record.host_runtime().as_uuid())
        .bind(created_utc)
        .bind(last_activity_utc)
        .bind(state.code());
    let query = match record {
        InstanceRecord::Publisher(i) => query.bind(*i.component.as_uuid()),
        InstanceRecord::Subscriber(i) => query.bind(*i.component.as_uuid()),
        InstanceRecord::Job(i) => query.bind(i.component.get()),
    };

    let result = query
        .execute(&mut *conn)
        .await
        .map_err(|e| map_sqlx_error("insert_instance", e))?;
    expect_one("insert_instance", result.rows_affected())
}

/// `(table, id column, id)` of an instance.
pub(super) fn instance_table(instance: InstanceRef) -> (&'static str, &'static str, Uuid) {
    match instance {
        InstanceRef::Publisher(id) => (
            "bus.publisher_instance",
            "id_publisher_instance",
            *id.as_uuid(),
        ),
        InstanceRef::Subscriber(id) => (
            "bus.subscriber_instance",
            "id_subscriber_instance",
            *id.as_uuid(),
        ),
        InstanceRef::Job(id) => ("bus.job_instance", "id_job_instance", *id.as_uuid()),
    }
}

fn get<'r, T>(row: &'r PgRow, column: &'static str) -> StoreResult<T>
where
    T: sqlx::Decode<'r, sqlx::Postgres> + sqlx::Type<sqlx::Postgres>,
{
    row.try_get(column)
        .map_err(|e| StoreError::Serialization(format!("failed to read {column}: {e}")))
}

fn message_type_from_row(row: &PgRow) -> StoreResult<MessageType> {
    Ok(MessageType {
        id: MessageTypeId::new(get(row, "id_message_type")?),
        name: get(row, "name")?,
        type_name: get(row, "type_name")?,
    })
}

fn subscriber_from_row(row: &PgRow) -> StoreResult<Subscriber> {
    Ok(Subscriber {
        id: SubscriberId::from_uuid(get(row, "id_subscriber")?),
        name: get(row, "name")?,
        scenario: ScenarioId::from_uuid(get(row, "id_scenario")?),
        message_type: MessageTypeId::new(get(row, "id_message_type")?),
        policy: policy_from_columns(
            get(row, "is_fifo")?,
            get(row, "processing_timeout_ms")?,
            get(row, "max_retry")?,
        ),
    })
}

fn job_from_row(row: &PgRow) -> StoreResult<Job> {
    let message_type: Option<i32> = get(row, "id_message_type")?;
    Ok(Job {
        id: JobId::new(get(row, "id_job")?),
        name: get(row, "name")?,
        scenario: ScenarioId::from_uuid(get(row, "id_scenario")?),
        message_type: message_type.map(MessageTypeId::new),
        policy: policy_from_columns(
            get(row, "is_fifo")?,
            get(row, "processing_timeout_ms")?,
            get(row, "max_retry")?,
        ),
    })
}

#[async_trait]
impl Registrar for PgConnection {
    async fn host(&mut self, host: &Host) -> StoreResult<Host> {
        upsert_host(self, host).await
    }

    async fn host_runtime(&mut self, runtime: &HostRuntime) -> StoreResult<()> {
        insert_host_runtime(self, runtime).await
    }

    async fn scenario(&mut self, scenario: &Scenario) -> StoreResult<Scenario> {
        upsert_scenario(self, scenario).await
    }

    async fn message_type(&mut self, spec: &MessageTypeSpec) -> StoreResult<MessageType> {
        upsert_message_type(self, spec).await
    }

    async fn message_type_by_name(&mut self, name: &str) -> StoreResult<Option<MessageType>> {
        find_message_type(self, name).await
    }

    async fn publisher(&mut self, publisher: &Publisher) -> StoreResult<Publisher> {
        upsert_publisher(self, publisher).await
    }

    async fn subscriber(&mut self, subscriber: &Subscriber) -> StoreResult<Subscriber> {
        upsert_subscriber(self, subscriber).await
    }

    async fn job(&mut self, job: &Job) -> StoreResult<Job> {
        upsert_job(self, job).await
    }

    async fn instance(&mut self, instance: &InstanceRecord) -> StoreResult<()> {
        insert_instance(self, instance).await
    }
}

impl PostgresBusStore {
    async fn conn(&self) -> StoreResult<sqlx::pool::PoolConnection<sqlx::Postgres>> {
        self.pool
            .acquire()
            .await
            .map_err(|e| map_sqlx_error("acquire_connection", e))
    }

    async fn resolve_message_type(
        conn: &mut PgConnection,
        name: &str,
    ) -> StoreResult<MessageTypeId> {
        find_message_type(conn, name)
            .await?
            .map(|mt| mt.id)
            .ok_or_else(|| StoreError::not_found("message type", name))
    }
}

#[async_trait]
impl CatalogStore for PostgresBusStore {
    #[instrument(
        skip(self, plan),
        fields(
            host_id = %plan.host.id,
            scenario = %plan.scenario.name,
            instance_count = plan.instances.len()
        ),
        err
    )]
    async fn initialize(
        &self,
        plan: &StartupPlan,
        now: DateTime<Utc>,
    ) -> StoreResult<StartupReceipt> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        match apply_plan(&mut *tx, plan, now).await {
            Ok(receipt) => {
                tx.commit()
                    .await
                    .map_err(|e| map_sqlx_error("commit_transaction", e))?;
                Ok(receipt)
            }
            Err(err) => {
                tx.rollback()
                    .await
                    .map_err(|e| map_sqlx_error("rollback", e))?;
                Err(err)
            }
        }
    }

    #[instrument(skip(self), fields(host_id = %host.id), err)]
    async fn register_host(&self, host: &Host) -> StoreResult<Host> {
        upsert_host(&mut *self.conn().await?, host).await
    }

    #[instrument(skip(self), fields(host_runtime_id = %runtime.id), err)]
    async fn start_host_runtime(&self, runtime: &HostRuntime) -> StoreResult<()> {
        insert_host_runtime(&mut *self.conn().await?, runtime).await
    }

    #[instrument(skip(self), fields(host_runtime_id = %runtime), err)]
    async fn end_host_runtime(
        &self,
        runtime: HostRuntimeId,
        now: DateTime<Utc>,
    ) -> StoreResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE bus.service_bus_host_runtime
            SET ended_utc = $2, state = $3
            WHERE id_service_bus_host_runtime = $1
            "#,
        )
        .bind(runtime.as_uuid())
        .bind(now)
        .bind(ComponentState::Stopped.code())
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("end_host_runtime", e))?;

        match result.rows_affected() {
            0 => Err(StoreError::not_found("host runtime", runtime)),
            n => expect_one("end_host_runtime", n),
        }
    }

    #[instrument(skip(self), fields(scenario = %scenario.name), err)]
    async fn register_scenario(&self, scenario: &Scenario) -> StoreResult<Scenario> {
        upsert_scenario(&mut *self.conn().await?, scenario).await
    }

    #[instrument(skip(self), fields(message_type = %spec.name), err)]
    async fn register_message_type(&self, spec: &MessageTypeSpec) -> StoreResult<MessageType> {
        upsert_message_type(&mut *self.conn().await?, spec).await
    }

    #[instrument(skip(self, spec), fields(publisher_id = %spec.id), err)]
    async fn register_publisher(
        &self,
        scenario: ScenarioId,
        spec: &PublisherSpec,
    ) -> StoreResult<Publisher> {
        let mut conn = self.conn().await?;
        let message_type = Self::resolve_message_type(&mut conn, &spec.message_type).await?;
        let requested = Publisher {
            id: spec.id,
            name: spec.name.clone(),
            scenario,
            message_type,
        };
        upsert_publisher(&mut conn, &requested).await
    }

    #[instrument(skip(self, spec), fields(subscriber_id = %spec.id), err)]
    async fn register_subscriber(
        &self,
        scenario: ScenarioId,
        spec: &SubscriberSpec,
    ) -> StoreResult<Subscriber> {
        let mut conn = self.conn().await?;
        let message_type = Self::resolve_message_type(&mut conn, &spec.message_type).await?;
        let requested = Subscriber {
            id: spec.id,
            name: spec.name.clone(),
            scenario,
            message_type,
            policy: spec.policy.clone(),
        };
        upsert_subscriber(&mut conn, &requested).await
    }

    #[instrument(skip(self, spec), fields(job = %spec.name), err)]
    async fn register_job(&self, scenario: ScenarioId, spec: &JobSpec) -> StoreResult<Job> {
        let mut conn = self.conn().await?;
        let message_type = match &spec.message_type {
            Some(name) => Some(Self::resolve_message_type(&mut conn, name).await?),
            None => None,
        };
        let requested = Job {
            id: JobId::new(0),
            name: spec.name.clone(),
            scenario,
            message_type,
            policy: spec.policy.clone(),
        };
        upsert_job(&mut conn, &requested).await
    }

    #[instrument(skip(self), fields(instance = %instance.instance()), err)]
    async fn start_instance(&self, instance: &InstanceRecord) -> StoreResult<()> {
        insert_instance(&mut *self.conn().await?, instance).await
    }

    #[instrument(skip(self), fields(instance = %instance), err)]
    async fn touch_instance(&self, instance: InstanceRef, now: DateTime<Utc>) -> StoreResult<()> {
        let (table, id_column, id) = instance_table(instance);
        let result = sqlx::query(&format!(
            "UPDATE {table} SET last_activity_utc = $2 WHERE {id_column} = $1"
        ))
        .bind(id)
        .bind(now)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("touch_instance", e))?;

        match result.rows_affected() {
            0 => Err(StoreError::not_found("instance", instance)),
            n => expect_one("touch_instance", n),
        }
    }

    #[instrument(skip(self), err)]
    async fn message_type_by_name(&self, name: &str) -> StoreResult<Option<MessageType>> {
        find_message_type(&mut *self.conn().await?, name).await
    }

    #[instrument(skip(self), fields(message_type_id = %id), err)]
    async fn message_type_by_id(&self, id: MessageTypeId) -> StoreResult<Option<MessageType>> {
        let row = sqlx::query(
            "SELECT id_message_type, name, type_name FROM bus.message_type WHERE id_message_type = $1",
        )
        .bind(id.get())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("message_type_by_id", e))?;

        row.as_ref().map(message_type_from_row).transpose()
    }

    #[instrument(skip(self), fields(subscriber_id = %id), err)]
    async fn load_subscriber(&self, id: SubscriberId) -> StoreResult<Option<Subscriber>> {
        find_subscriber(&mut *self.conn().await?, id).await
    }

    #[instrument(skip(self), fields(job_id = %id), err)]
    async fn load_job(&self, id: JobId) -> StoreResult<Option<Job>> {
        let row = sqlx::query(&format!("SELECT {JOB_COLUMNS} FROM bus.job WHERE id_job = $1"))
            .bind(id.get())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("load_job", e))?;

        row.as_ref().map(job_from_row).transpose()
    }

    #[instrument(
        skip(self),
        fields(scenario_id = %scenario, message_type_id = %message_type, target_count),
        err
    )]
    async fn resolve_targets(
        &self,
        scenario: ScenarioId,
        message_type: MessageTypeId,
    ) -> StoreResult<Vec<QueueRef>> {
        let subscribers: Vec<Uuid> = sqlx::query_scalar(
            r#"
            SELECT id_subscriber FROM bus.subscriber
            WHERE id_scenario = $1 AND id_message_type = $2
            ORDER BY id_subscriber
            "#,
        )
        .bind(scenario.as_uuid())
        .bind(message_type.get())
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("resolve_subscribers", e))?;

        let jobs: Vec<i32> = sqlx::query_scalar(
            r#"
            SELECT id_job FROM bus.job
            WHERE id_scenario = $1 AND id_message_type = $2
            ORDER BY id_job
            "#,
        )
        .bind(scenario.as_uuid())
        .bind(message_type.get())
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("resolve_jobs", e))?;

        let targets: Vec<QueueRef> = subscribers
            .into_iter()
            .map(|id| QueueRef::Subscriber(SubscriberId::from_uuid(id)))
            .chain(jobs.into_iter().map(|id| QueueRef::Job(JobId::new(id))))
            .collect();

        Span::current().record("target_count", targets.len());
        Ok(targets)
    }
}
