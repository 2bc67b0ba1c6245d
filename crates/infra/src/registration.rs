//! Startup registration pass.
//!
//! A process describes everything it runs in a [`StartupPlan`]; the store applies the
//! plan in one transaction (`CatalogStore::initialize`) and hands back a
//! [`StartupReceipt`] carrying every resolved id. Catalog rows are upserted
//! idempotently, instance rows and the host runtime are created fresh.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use busline_core::{
    ComponentState, HostRuntimeId, JobInstanceId, MessageTypeId, PublisherId,
    PublisherInstanceId, SubscriberId, SubscriberInstanceId,
};
use busline_messages::MessagePayload;

use crate::store::{
    Consumer, Host, HostRuntime, Instance, InstanceRecord, Job, JobSpec, MessageType,
    MessageTypeSpec, Publisher, PublisherSpec, Scenario, StoreError, StoreResult, Subscriber,
    SubscriberSpec,
};

/// An instance this process is going to run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlannedInstance {
    Publisher {
        publisher: PublisherId,
        instance: PublisherInstanceId,
    },
    Subscriber {
        subscriber: SubscriberId,
        instance: SubscriberInstanceId,
    },
    /// Jobs are planned by name; their integer id is only known after registration.
    Job {
        job: String,
        instance: JobInstanceId,
    },
}

/// Everything one bus process registers at startup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartupPlan {
    pub host: Host,
    pub runtime_id: HostRuntimeId,
    pub user_name: String,
    pub machine_name: String,
    pub scenario: Scenario,
    pub message_types: Vec<MessageTypeSpec>,
    pub publishers: Vec<PublisherSpec>,
    pub subscribers: Vec<SubscriberSpec>,
    pub jobs: Vec<JobSpec>,
    pub instances: Vec<PlannedInstance>,
}

impl StartupPlan {
    pub fn new(host: Host, scenario: Scenario) -> Self {
        Self {
            host,
            runtime_id: HostRuntimeId::new(),
            user_name: String::new(),
            machine_name: String::new(),
            scenario,
            message_types: Vec::new(),
            publishers: Vec::new(),
            subscribers: Vec::new(),
            jobs: Vec::new(),
            instances: Vec::new(),
        }
    }

    pub fn with_process(
        mut self,
        user_name: impl Into<String>,
        machine_name: impl Into<String>,
    ) -> Self {
        self.user_name = user_name.into();
        self.machine_name = machine_name.into();
        self
    }

    pub fn with_message_type<P: MessagePayload>(mut self) -> Self {
        self.message_types.push(MessageTypeSpec::of::<P>());
        self
    }

    pub fn with_message_type_spec(mut self, spec: MessageTypeSpec) -> Self {
        self.message_types.push(spec);
        self
    }

    /// Register a publisher and run one instance of it in this process.
    pub fn with_publisher(mut self, spec: PublisherSpec) -> Self {
        self.instances.push(PlannedInstance::Publisher {
            publisher: spec.id,
            instance: PublisherInstanceId::new(),
        });
        self.publishers.push(spec);
        self
    }

    /// Register a subscriber and run one instance of it in this process.
    pub fn with_subscriber(mut self, spec: SubscriberSpec) -> Self {
        self.instances.push(PlannedInstance::Subscriber {
            subscriber: spec.id,
            instance: SubscriberInstanceId::new(),
        });
        self.subscribers.push(spec);
        self
    }

    /// Register a job and run one instance of it in this process.
    pub fn with_job(mut self, spec: JobSpec) -> Self {
        self.instances.push(PlannedInstance::Job {
            job: spec.name.clone(),
            instance: JobInstanceId::new(),
        });
        self.jobs.push(spec);
        self
    }

    /// Run an additional instance of an already planned component.
    pub fn with_instance(mut self, instance: PlannedInstance) -> Self {
        self.instances.push(instance);
        self
    }
}

/// Resolved catalog and instance rows of an applied [`StartupPlan`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartupReceipt {
    pub host: Host,
    pub runtime: HostRuntime,
    pub scenario: Scenario,
    pub message_types: Vec<MessageType>,
    pub publishers: Vec<Publisher>,
    pub subscribers: Vec<Subscriber>,
    pub jobs: Vec<Job>,
    pub instances: Vec<InstanceRecord>,
}

impl StartupReceipt {
    pub fn message_type(&self, name: &str) -> Option<&MessageType> {
        self.message_types.iter().find(|mt| mt.name == name)
    }

    pub fn job(&self, name: &str) -> Option<&Job> {
        self.jobs.iter().find(|job| job.name == name)
    }

    pub fn subscriber(&self, id: SubscriberId) -> Option<&Subscriber> {
        self.subscribers.iter().find(|s| s.id == id)
    }

    /// First instance of `publisher` started by this process.
    pub fn publisher_instance(&self, publisher: PublisherId) -> Option<PublisherInstanceId> {
        self.instances.iter().find_map(|record| match record {
            InstanceRecord::Publisher(i) if i.component == publisher => Some(i.id),
            _ => None,
        })
    }

    /// Claim identities of every subscriber and job instance started by this process.
    pub fn consumers(&self) -> Vec<Consumer> {
        self.instances
            .iter()
            .filter_map(|record| match record {
                InstanceRecord::Publisher(_) => None,
                InstanceRecord::Subscriber(i) => Some(Consumer::Subscriber {
                    subscriber: i.component,
                    instance: i.id,
                }),
                InstanceRecord::Job(i) => Some(Consumer::Job {
                    job: i.component,
                    instance: i.id,
                }),
            })
            .collect()
    }

    pub fn subscriber_consumer(&self, subscriber: SubscriberId) -> Option<Consumer> {
        self.consumers().into_iter().find(
            |c| matches!(c, Consumer::Subscriber { subscriber: s, .. } if *s == subscriber),
        )
    }

    pub fn job_consumer(&self, name: &str) -> Option<Consumer> {
        let job = self.job(name)?.id;
        self.consumers()
            .into_iter()
            .find(|c| matches!(c, Consumer::Job { job: j, .. } if *j == job))
    }
}

/// The catalog writes of one registration transaction.
///
/// Implemented by each store over whatever it uses as a transaction; [`apply_plan`]
/// drives it so both stores resolve a plan identically.
#[async_trait]
pub(crate) trait Registrar: Send {
    async fn host(&mut self, host: &Host) -> StoreResult<Host>;

    async fn host_runtime(&mut self, runtime: &HostRuntime) -> StoreResult<()>;

    async fn scenario(&mut self, scenario: &Scenario) -> StoreResult<Scenario>;

    async fn message_type(&mut self, spec: &MessageTypeSpec) -> StoreResult<MessageType>;

    async fn message_type_by_name(&mut self, name: &str) -> StoreResult<Option<MessageType>>;

    async fn publisher(&mut self, publisher: &Publisher) -> StoreResult<Publisher>;

    async fn subscriber(&mut self, subscriber: &Subscriber) -> StoreResult<Subscriber>;

    /// `job.id` is ignored; the stored row carries the assigned id.
    async fn job(&mut self, job: &Job) -> StoreResult<Job>;

    async fn instance(&mut self, instance: &InstanceRecord) -> StoreResult<()>;
}

/// Resolves message type names against the types registered so far, falling back to
/// the catalog for types registered by other processes.
struct TypeResolver {
    known: HashMap<String, MessageTypeId>,
}

impl TypeResolver {
    async fn resolve<R: Registrar + ?Sized>(
        &mut self,
        registrar: &mut R,
        name: &str,
    ) -> StoreResult<MessageTypeId> {
        if let Some(id) = self.known.get(name) {
            return Ok(*id);
        }
        let found = registrar
            .message_type_by_name(name)
            .await?
            .ok_or_else(|| StoreError::not_found("message type", name))?;
        self.known.insert(found.name, found.id);
        Ok(found.id)
    }
}

pub(crate) async fn apply_plan<R: Registrar + ?Sized>(
    registrar: &mut R,
    plan: &StartupPlan,
    now: DateTime<Utc>,
) -> StoreResult<StartupReceipt> {
    let host = registrar.host(&plan.host).await?;

    let runtime = HostRuntime {
        id: plan.runtime_id,
        host: host.id,
        user_name: plan.user_name.clone(),
        machine_name: plan.machine_name.clone(),
        started_utc: now,
        ended_utc: None,
        state: ComponentState::Starting,
    };
    registrar.host_runtime(&runtime).await?;

    let scenario = registrar.scenario(&plan.scenario).await?;

    let mut types = TypeResolver {
        known: HashMap::new(),
    };
    let mut message_types = Vec::with_capacity(plan.message_types.len());
    for spec in &plan.message_types {
        let registered = registrar.message_type(spec).await?;
        types.known.insert(registered.name.clone(), registered.id);
        message_types.push(registered);
    }

    let mut publishers = Vec::with_capacity(plan.publishers.len());
    for spec in &plan.publishers {
        let message_type = types.resolve(registrar, &spec.message_type).await?;
        let requested = Publisher {
            id: spec.id,
            name: spec.name.clone(),
            scenario: scenario.id,
            message_type,
        };
        publishers.push(registrar.publisher(&requested).await?);
    }

    let mut subscribers = Vec::with_capacity(plan.subscribers.len());
    for spec in &plan.subscribers {
        let message_type = types.resolve(registrar, &spec.message_type).await?;
        let requested = Subscriber {
            id: spec.id,
            name: spec.name.clone(),
            scenario: scenario.id,
            message_type,
            policy: spec.policy.clone(),
        };
        subscribers.push(registrar.subscriber(&requested).await?);
    }

    let mut jobs = Vec::with_capacity(plan.jobs.len());
    for spec in &plan.jobs {
        let message_type = match &spec.message_type {
            Some(name) => Some(types.resolve(registrar, name).await?),
            None => None,
        };
        let requested = Job {
            id: busline_core::JobId::new(0),
            name: spec.name.clone(),
            scenario: scenario.id,
            message_type,
            policy: spec.policy.clone(),
        };
        jobs.push(registrar.job(&requested).await?);
    }

    let mut instances = Vec::with_capacity(plan.instances.len());
    for planned in &plan.instances {
        let record = match planned {
            PlannedInstance::Publisher {
                publisher,
                instance,
            } => {
                if !publishers.iter().any(|p| p.id == *publisher) {
                    return Err(StoreError::Validation(format!(
                        "instance {instance} runs publisher {publisher}, which is not part of the plan"
                    )));
                }
                InstanceRecord::Publisher(new_instance(*instance, *publisher, runtime.id, now))
            }
            PlannedInstance::Subscriber {
                subscriber,
                instance,
            } => {
                if !subscribers.iter().any(|s| s.id == *subscriber) {
                    return Err(StoreError::Validation(format!(
                        "instance {instance} runs subscriber {subscriber}, which is not part of the plan"
                    )));
                }
                InstanceRecord::Subscriber(new_instance(*instance, *subscriber, runtime.id, now))
            }
            PlannedInstance::Job { job, instance } => {
                let job_id = jobs
                    .iter()
                    .find(|j| j.name == *job)
                    .map(|j| j.id)
                    .ok_or_else(|| {
                        StoreError::Validation(format!(
                            "instance {instance} runs job '{job}', which is not part of the plan"
                        ))
                    })?;
                InstanceRecord::Job(new_instance(*instance, job_id, runtime.id, now))
            }
        };
        registrar.instance(&record).await?;
        instances.push(record);
    }

    tracing::info!(
        host_id = %host.id,
        host_runtime_id = %runtime.id,
        scenario = %scenario.name,
        message_types = message_types.len(),
        publishers = publishers.len(),
        subscribers = subscribers.len(),
        jobs = jobs.len(),
        instances = instances.len(),
        "startup registration applied"
    );

    Ok(StartupReceipt {
        host,
        runtime,
        scenario,
        message_types,
        publishers,
        subscribers,
        jobs,
        instances,
    })
}

fn new_instance<I, C>(
    id: I,
    component: C,
    host_runtime: HostRuntimeId,
    now: DateTime<Utc>,
) -> Instance<I, C> {
    Instance {
        id,
        component,
        host_runtime,
        created_utc: now,
        last_activity_utc: now,
        state: ComponentState::Starting,
    }
}

/// Compare a stored catalog row's identity field with the requested one.
pub(crate) fn ensure_same<T>(
    entity: &'static str,
    key: impl ToString,
    field: &str,
    stored: &T,
    requested: &T,
) -> StoreResult<()>
where
    T: PartialEq + core::fmt::Debug,
{
    if stored == requested {
        Ok(())
    } else {
        Err(StoreError::conflict(
            entity,
            key,
            format!("stored {field} {stored:?} differs from requested {requested:?}"),
        ))
    }
}
