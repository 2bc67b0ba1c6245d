use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::FutureExt;

use busline_core::{
    ComponentState, ConcurrencyToken, HostId, HostRuntimeId, JobId, JobInstanceId, MessageId,
    MessageTypeId, PublisherId, PublisherInstanceId, ScenarioId, SnapshotIdentifier,
    SubscriberId, SubscriberInstanceId, TicketId, TicketState, TicketUpdate,
};

use super::model::{
    ClaimOutcome, ClaimedDelivery, CommitOutcome, Consumer, DeliveryTicket, Host, HostRuntime,
    InstanceRecord, InstanceRef, Job, JobInstance, JobSpec, LogRecord, LogSubject, Message,
    MessageType, MessageTypeSpec, PublishReceipt, Publisher, PublisherInstance, PublisherSpec,
    QueueDepth, QueueRef, Scenario, Snapshot, Subscriber, SubscriberInstance, SubscriberSpec,
    TicketKind,
};
use super::r#trait::{
    AuditStore, CatalogStore, DeliveryStore, SnapshotStore, StoreError, StoreResult,
    validate_targets,
};
use crate::registration::{Registrar, StartupPlan, StartupReceipt, apply_plan, ensure_same};

#[derive(Debug, Clone, Default)]
struct State {
    hosts: HashMap<HostId, Host>,
    runtimes: HashMap<HostRuntimeId, HostRuntime>,
    scenarios: HashMap<ScenarioId, Scenario>,
    message_types: HashMap<MessageTypeId, MessageType>,
    publishers: HashMap<PublisherId, Publisher>,
    subscribers: HashMap<SubscriberId, Subscriber>,
    jobs: HashMap<JobId, Job>,
    publisher_instances: HashMap<PublisherInstanceId, PublisherInstance>,
    subscriber_instances: HashMap<SubscriberInstanceId, SubscriberInstance>,
    job_instances: HashMap<JobInstanceId, JobInstance>,
    messages: HashMap<MessageId, Message>,
    tickets: HashMap<TicketId, DeliveryTicket>,
    snapshots: HashMap<SnapshotIdentifier, Snapshot>,
    logs: Vec<LogRecord>,
    next_message_type_id: i32,
    next_job_id: i32,
}

/// In-memory bus store.
///
/// Intended for tests/dev. Every write takes the single lock, so each operation is as
/// atomic as the conditional `UPDATE` it stands in for.
#[derive(Debug, Default)]
pub struct InMemoryBusStore {
    state: RwLock<State>,
}

impl InMemoryBusStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> StoreResult<RwLockReadGuard<'_, State>> {
        self.state
            .read()
            .map_err(|_| StoreError::Database("lock poisoned".to_string()))
    }

    fn write(&self) -> StoreResult<RwLockWriteGuard<'_, State>> {
        self.state
            .write()
            .map_err(|_| StoreError::Database("lock poisoned".to_string()))
    }
}

// Catalog upserts. Identity fields must match an existing row; policy is refreshed.

impl State {
    fn upsert_host(&mut self, host: &Host) -> StoreResult<Host> {
        let stored = self.hosts.entry(host.id).or_insert_with(|| host.clone());
        ensure_same("host", host.id, "name", &stored.name, &host.name)?;
        Ok(stored.clone())
    }

    fn insert_runtime(&mut self, runtime: &HostRuntime) -> StoreResult<()> {
        if !self.hosts.contains_key(&runtime.host) {
            return Err(StoreError::not_found("host", runtime.host));
        }
        if self.runtimes.contains_key(&runtime.id) {
            return Err(StoreError::Integrity {
                operation: "insert_host_runtime",
                expected: 1,
                affected: 0,
            });
        }
        self.runtimes.insert(runtime.id, runtime.clone());
        Ok(())
    }

    fn upsert_scenario(&mut self, scenario: &Scenario) -> StoreResult<Scenario> {
        let name_taken = self
            .scenarios
            .values()
            .any(|s| s.name == scenario.name && s.id != scenario.id);
        if name_taken {
            return Err(StoreError::conflict(
                "scenario",
                &scenario.name,
                "name is registered under a different id",
            ));
        }
        let stored = self
            .scenarios
            .entry(scenario.id)
            .or_insert_with(|| scenario.clone());
        ensure_same("scenario", scenario.id, "name", &stored.name, &scenario.name)?;
        Ok(stored.clone())
    }

    fn upsert_message_type(&mut self, spec: &MessageTypeSpec) -> StoreResult<MessageType> {
        if let Some(stored) = self.message_type_named(&spec.name) {
            ensure_same(
                "message type",
                &spec.name,
                "type name",
                &stored.type_name,
                &spec.type_name,
            )?;
            return Ok(stored);
        }
        self.next_message_type_id += 1;
        let registered = MessageType {
            id: MessageTypeId::new(self.next_message_type_id),
            name: spec.name.clone(),
            type_name: spec.type_name.clone(),
        };
        self.message_types.insert(registered.id, registered.clone());
        Ok(registered)
    }

    fn message_type_named(&self, name: &str) -> Option<MessageType> {
        self.message_types.values().find(|mt| mt.name == name).cloned()
    }

    fn require_scenario(&self, scenario: ScenarioId) -> StoreResult<()> {
        if self.scenarios.contains_key(&scenario) {
            Ok(())
        } else {
            Err(StoreError::not_found("scenario", scenario))
        }
    }

    fn require_message_type(&self, message_type: MessageTypeId) -> StoreResult<()> {
        if self.message_types.contains_key(&message_type) {
            Ok(())
        } else {
            Err(StoreError::not_found("message type", message_type))
        }
    }

    fn upsert_publisher(&mut self, publisher: &Publisher) -> StoreResult<Publisher> {
        self.require_scenario(publisher.scenario)?;
        self.require_message_type(publisher.message_type)?;
        let stored = self
            .publishers
            .entry(publisher.id)
            .or_insert_with(|| publisher.clone());
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
        Ok(stored.clone())
    }

    fn upsert_subscriber(&mut self, subscriber: &Subscriber) -> StoreResult<Subscriber> {
        self.require_scenario(subscriber.scenario)?;
        self.require_message_type(subscriber.message_type)?;
        let stored = self
            .subscribers
            .entry(subscriber.id)
            .or_insert_with(|| subscriber.clone());
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
        stored.policy = subscriber.policy.clone();
        Ok(stored.clone())
    }

    fn upsert_job(&mut self, job: &Job) -> StoreResult<Job> {
        self.require_scenario(job.scenario)?;
        if let Some(message_type) = job.message_type {
            self.require_message_type(message_type)?;
        }
        let existing = self
            .jobs
            .values()
            .find(|j| j.scenario == job.scenario && j.name == job.name)
            .map(|j| j.id);

        let id = match existing {
            Some(id) => id,
            None => {
                self.next_job_id += 1;
                let id = JobId::new(self.next_job_id);
                self.jobs.insert(id, Job { id, ..job.clone() });
                id
            }
        };

        let stored = self
            .jobs
            .get_mut(&id)
            .ok_or_else(|| StoreError::not_found("job", id))?;
        ensure_same(
            "job",
            &job.name,
            "message type",
            &stored.message_type,
            &job.message_type,
        )?;
        stored.policy = job.policy.clone();
        Ok(stored.clone())
    }

    fn insert_instance(&mut self, record: &InstanceRecord) -> StoreResult<()> {
        if !self.runtimes.contains_key(&record.host_runtime()) {
            return Err(StoreError::not_found("host runtime", record.host_runtime()));
        }
        let duplicate = match record {
            InstanceRecord::Publisher(i) => {
                if !self.publishers.contains_key(&i.component) {
                    return Err(StoreError::not_found("publisher", i.component));
                }
                self.publisher_instances.insert(i.id, i.clone()).is_some()
            }
            InstanceRecord::Subscriber(i) => {
                if !self.subscribers.contains_key(&i.component) {
                    return Err(StoreError::not_found("subscriber", i.component));
                }
                self.subscriber_instances.insert(i.id, i.clone()).is_some()
            }
            InstanceRecord::Job(i) => {
                if !self.jobs.contains_key(&i.component) {
                    return Err(StoreError::not_found("job", i.component));
                }
                self.job_instances.insert(i.id, i.clone()).is_some()
            }
        };
        if duplicate {
            return Err(StoreError::Integrity {
                operation: "insert_instance",
                expected: 1,
                affected: 0,
            });
        }
        Ok(())
    }

    fn queue_exists(&self, queue: QueueRef) -> bool {
        match queue {
            QueueRef::Subscriber(id) => self.subscribers.contains_key(&id),
            QueueRef::Job(id) => self.jobs.contains_key(&id),
        }
    }

    /// Tickets of `queue` whose message is still deliverable, in claim order.
    fn live_tickets(&self, queue: QueueRef, now: DateTime<Utc>) -> Vec<(&DeliveryTicket, &Message)> {
        let mut tickets: Vec<_> = self
            .tickets
            .values()
            .filter(|t| t.queue == queue && !t.state.is_terminal())
            .filter_map(|t| self.messages.get(&t.message).map(|m| (t, m)))
            .filter(|(_, m)| !m.is_expired(now))
            .collect();
        tickets.sort_by_key(|(t, m)| (m.created_utc, t.id));
        tickets
    }
}

#[async_trait]
impl Registrar for State {
    async fn host(&mut self, host: &Host) -> StoreResult<Host> {
        self.upsert_host(host)
    }

    async fn host_runtime(&mut self, runtime: &HostRuntime) -> StoreResult<()> {
        self.insert_runtime(runtime)
    }

    async fn scenario(&mut self, scenario: &Scenario) -> StoreResult<Scenario> {
        self.upsert_scenario(scenario)
    }

    async fn message_type(&mut self, spec: &MessageTypeSpec) -> StoreResult<MessageType> {
        self.upsert_message_type(spec)
    }

    async fn message_type_by_name(&mut self, name: &str) -> StoreResult<Option<MessageType>> {
        Ok(self.message_type_named(name))
    }

    async fn publisher(&mut self, publisher: &Publisher) -> StoreResult<Publisher> {
        self.upsert_publisher(publisher)
    }

    async fn subscriber(&mut self, subscriber: &Subscriber) -> StoreResult<Subscriber> {
        self.upsert_subscriber(subscriber)
    }

    async fn job(&mut self, job: &Job) -> StoreResult<Job> {
        self.upsert_job(job)
    }

    async fn instance(&mut self, instance: &InstanceRecord) -> StoreResult<()> {
        self.insert_instance(instance)
    }
}

#[async_trait]
impl CatalogStore for InMemoryBusStore {
    async fn initialize(
        &self,
        plan: &StartupPlan,
        now: DateTime<Utc>,
    ) -> StoreResult<StartupReceipt> {
        let mut state = self.write()?;
        let mut draft = state.clone();
        // Registrar calls on `State` never suspend, so the pass completes in one poll
        // while the lock is held.
        let receipt = apply_plan(&mut draft, plan, now)
            .now_or_never()
            .ok_or_else(|| StoreError::Database("registration pass suspended".to_string()))??;
        *state = draft;
        Ok(receipt)
    }

    async fn register_host(&self, host: &Host) -> StoreResult<Host> {
        self.write()?.upsert_host(host)
    }

    async fn start_host_runtime(&self, runtime: &HostRuntime) -> StoreResult<()> {
        self.write()?.insert_runtime(runtime)
    }

    async fn end_host_runtime(
        &self,
        runtime: HostRuntimeId,
        now: DateTime<Utc>,
    ) -> StoreResult<()> {
        let mut state = self.write()?;
        let row = state
            .runtimes
            .get_mut(&runtime)
            .ok_or_else(|| StoreError::not_found("host runtime", runtime))?;
        row.ended_utc = Some(now);
        row.state = ComponentState::Stopped;
        Ok(())
    }

    async fn register_scenario(&self, scenario: &Scenario) -> StoreResult<Scenario> {
        self.write()?.upsert_scenario(scenario)
    }

    async fn register_message_type(&self, spec: &MessageTypeSpec) -> StoreResult<MessageType> {
        self.write()?.upsert_message_type(spec)
    }

    async fn register_publisher(
        &self,
        scenario: ScenarioId,
        spec: &PublisherSpec,
    ) -> StoreResult<Publisher> {
        let mut state = self.write()?;
        let message_type = state
            .message_type_named(&spec.message_type)
            .ok_or_else(|| StoreError::not_found("message type", &spec.message_type))?;
        state.upsert_publisher(&Publisher {
            id: spec.id,
            name: spec.name.clone(),
            scenario,
            message_type: message_type.id,
        })
    }

    async fn register_subscriber(
        &self,
        scenario: ScenarioId,
        spec: &SubscriberSpec,
    ) -> StoreResult<Subscriber> {
        let mut state = self.write()?;
        let message_type = state
            .message_type_named(&spec.message_type)
            .ok_or_else(|| StoreError::not_found("message type", &spec.message_type))?;
        state.upsert_subscriber(&Subscriber {
            id: spec.id,
            name: spec.name.clone(),
            scenario,
            message_type: message_type.id,
            policy: spec.policy.clone(),
        })
    }

    async fn register_job(&self, scenario: ScenarioId, spec: &JobSpec) -> StoreResult<Job> {
        let mut state = self.write()?;
        let message_type = match &spec.message_type {
            Some(name) => Some(
                state
                    .message_type_named(name)
                    .ok_or_else(|| StoreError::not_found("message type", name))?
                    .id,
            ),
            None => None,
        };
        state.upsert_job(&Job {
            id: JobId::new(0),
            name: spec.name.clone(),
            scenario,
            message_type,
            policy: spec.policy.clone(),
        })
    }

    async fn start_instance(&self, instance: &InstanceRecord) -> StoreResult<()> {
        self.write()?.insert_instance(instance)
    }

    async fn touch_instance(&self, instance: InstanceRef, now: DateTime<Utc>) -> StoreResult<()> {
        let mut state = self.write()?;
        let last_activity = match instance {
            InstanceRef::Publisher(id) => state
                .publisher_instances
                .get_mut(&id)
                .map(|i| &mut i.last_activity_utc),
            InstanceRef::Subscriber(id) => state
                .subscriber_instances
                .get_mut(&id)
                .map(|i| &mut i.last_activity_utc),
            InstanceRef::Job(id) => state
                .job_instances
                .get_mut(&id)
                .map(|i| &mut i.last_activity_utc),
        };
        match last_activity {
            Some(slot) => {
                *slot = now;
                Ok(())
            }
            None => Err(StoreError::not_found("instance", instance)),
        }
    }

    async fn message_type_by_name(&self, name: &str) -> StoreResult<Option<MessageType>> {
        Ok(self.read()?.message_type_named(name))
    }

    async fn message_type_by_id(&self, id: MessageTypeId) -> StoreResult<Option<MessageType>> {
        Ok(self.read()?.message_types.get(&id).cloned())
    }

    async fn load_subscriber(&self, id: SubscriberId) -> StoreResult<Option<Subscriber>> {
        Ok(self.read()?.subscribers.get(&id).cloned())
    }

    async fn load_job(&self, id: JobId) -> StoreResult<Option<Job>> {
        Ok(self.read()?.jobs.get(&id).cloned())
    }

    async fn resolve_targets(
        &self,
        scenario: ScenarioId,
        message_type: MessageTypeId,
    ) -> StoreResult<Vec<QueueRef>> {
        let state = self.read()?;

        let mut subscribers: Vec<_> = state
            .subscribers
            .values()
            .filter(|s| s.scenario == scenario && s.message_type == message_type)
            .map(|s| s.id)
            .collect();
        subscribers.sort_by_key(|id| *id.as_uuid());

        let mut jobs: Vec<_> = state
            .jobs
            .values()
            .filter(|j| j.scenario == scenario && j.message_type == Some(message_type))
            .map(|j| j.id)
            .collect();
        jobs.sort();

        Ok(subscribers
            .into_iter()
            .map(QueueRef::Subscriber)
            .chain(jobs.into_iter().map(QueueRef::Job))
            .collect())
    }
}

#[async_trait]
impl DeliveryStore for InMemoryBusStore {
    async fn publish(
        &self,
        message: &Message,
        targets: &[QueueRef],
    ) -> StoreResult<PublishReceipt> {
        validate_targets(targets)?;

        let mut state = self.write()?;
        if state.messages.contains_key(&message.id) {
            return Err(StoreError::Integrity {
                operation: "insert_message",
                expected: 1,
                affected: 0,
            });
        }
        state.require_message_type(message.message_type)?;
        if !state
            .publisher_instances
            .contains_key(&message.publisher_instance)
        {
            return Err(StoreError::not_found(
                "publisher instance",
                message.publisher_instance,
            ));
        }
        if let Some(missing) = targets.iter().find(|q| !state.queue_exists(**q)) {
            return Err(StoreError::not_found("queue", missing));
        }

        state.messages.insert(message.id, message.clone());
        let mut tickets = Vec::with_capacity(targets.len());
        for queue in targets {
            let ticket = DeliveryTicket::ready(*queue, message.id);
            tickets.push((*queue, ticket.id));
            state.tickets.insert(ticket.id, ticket);
        }

        Ok(PublishReceipt {
            message: message.id,
            tickets,
        })
    }

    async fn find_next_fifo(
        &self,
        queue: QueueRef,
        eligible: &[TicketState],
        processing_timeout: Duration,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<DeliveryTicket>> {
        let state = self.read()?;
        let head = state.live_tickets(queue, now).into_iter().next();
        Ok(head
            .filter(|(t, _)| t.is_claimable(eligible, processing_timeout, now))
            .map(|(t, _)| t.clone()))
    }

    async fn find_next_non_fifo(
        &self,
        queue: QueueRef,
        eligible: &[TicketState],
        processing_timeout: Duration,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<DeliveryTicket>> {
        let state = self.read()?;
        Ok(state
            .live_tickets(queue, now)
            .into_iter()
            .find(|(t, _)| t.is_claimable(eligible, processing_timeout, now))
            .map(|(t, _)| t.clone()))
    }

    async fn try_claim(
        &self,
        candidate: &DeliveryTicket,
        consumer: Consumer,
        processing_timeout: Duration,
        now: DateTime<Utc>,
    ) -> StoreResult<ClaimOutcome> {
        if candidate.queue != consumer.queue() {
            return Err(StoreError::Validation(format!(
                "ticket {} belongs to {}, not to {}",
                candidate.id,
                candidate.queue,
                consumer.queue()
            )));
        }

        let mut state = self.write()?;
        let Some(ticket) = state.tickets.get_mut(&candidate.id) else {
            return Ok(ClaimOutcome::Lost {
                ticket: candidate.id,
            });
        };
        if !ticket.accepts_claim(candidate.concurrency_token, processing_timeout, now) {
            return Ok(ClaimOutcome::Lost {
                ticket: candidate.id,
            });
        }

        ticket.owner_instance = Some(consumer.instance_uuid());
        ticket.state = TicketState::InProgress;
        ticket.last_access_utc = Some(now);
        ticket.delayed_to_utc = None;
        ticket.concurrency_token = ConcurrencyToken::issue();
        let ticket = ticket.clone();

        let message = state
            .messages
            .get(&ticket.message)
            .cloned()
            .ok_or_else(|| StoreError::not_found("message", ticket.message))?;

        Ok(ClaimOutcome::Claimed(Box::new(ClaimedDelivery { ticket, message })))
    }

    async fn commit(
        &self,
        consumer: Consumer,
        ticket: TicketId,
        token: ConcurrencyToken,
        update: &TicketUpdate,
        now: DateTime<Utc>,
    ) -> StoreResult<CommitOutcome> {
        TicketState::InProgress.ensure_transition(update.state)?;

        let mut state = self.write()?;
        let Some(row) = owned_ticket(&mut state, consumer, ticket, token) else {
            return Ok(CommitOutcome::Lost);
        };

        row.state = update.state;
        row.retry_count = update.retry_count;
        row.delayed_to_utc = update.delayed_to_utc;
        if let Some(snapshot) = &update.snapshot {
            row.snapshot = Some(snapshot.clone());
        }
        row.last_access_utc = Some(now);
        row.concurrency_token = ConcurrencyToken::issue();

        Ok(CommitOutcome::Committed {
            token: row.concurrency_token,
        })
    }

    async fn heartbeat(
        &self,
        consumer: Consumer,
        ticket: TicketId,
        token: ConcurrencyToken,
        now: DateTime<Utc>,
    ) -> StoreResult<CommitOutcome> {
        let mut state = self.write()?;
        match owned_ticket(&mut state, consumer, ticket, token) {
            Some(row) if row.state == TicketState::InProgress => {
                row.last_access_utc = Some(now);
                Ok(CommitOutcome::Committed { token })
            }
            _ => Ok(CommitOutcome::Lost),
        }
    }

    async fn load_ticket(
        &self,
        kind: TicketKind,
        ticket: TicketId,
    ) -> StoreResult<Option<DeliveryTicket>> {
        Ok(self
            .read()?
            .tickets
            .get(&ticket)
            .filter(|t| t.kind() == kind)
            .cloned())
    }

    async fn load_message(&self, message: MessageId) -> StoreResult<Option<Message>> {
        Ok(self.read()?.messages.get(&message).cloned())
    }

    async fn tickets_for_message(&self, message: MessageId) -> StoreResult<Vec<DeliveryTicket>> {
        let state = self.read()?;
        let mut tickets: Vec<_> = state
            .tickets
            .values()
            .filter(|t| t.message == message)
            .cloned()
            .collect();
        tickets.sort_by_key(|t| (t.kind() != TicketKind::Subscriber, t.id));
        Ok(tickets)
    }

    async fn count_by_state(&self, queue: QueueRef) -> StoreResult<QueueDepth> {
        let state = self.read()?;
        let mut depth = QueueDepth::new();
        for ticket in state.tickets.values().filter(|t| t.queue == queue) {
            *depth.entry(ticket.state).or_insert(0) += 1;
        }
        Ok(depth)
    }
}

#[async_trait]
impl SnapshotStore for InMemoryBusStore {
    async fn save_snapshot(
        &self,
        owner: JobInstanceId,
        identifier: &SnapshotIdentifier,
        data: &[u8],
        now: DateTime<Utc>,
    ) -> StoreResult<Snapshot> {
        let mut state = self.write()?;
        if !state.job_instances.contains_key(&owner) {
            return Err(StoreError::not_found("job instance", owner));
        }
        let snapshot = state
            .snapshots
            .entry(identifier.clone())
            .and_modify(|s| {
                s.owner = owner;
                s.data = data.to_vec();
                s.updated_utc = now;
            })
            .or_insert_with(|| Snapshot {
                identifier: identifier.clone(),
                owner,
                data: data.to_vec(),
                created_utc: now,
                updated_utc: now,
            });
        Ok(snapshot.clone())
    }

    async fn transfer_snapshot(
        &self,
        new_owner: JobInstanceId,
        identifier: &SnapshotIdentifier,
        now: DateTime<Utc>,
    ) -> StoreResult<()> {
        let mut state = self.write()?;
        if !state.job_instances.contains_key(&new_owner) {
            return Err(StoreError::not_found("job instance", new_owner));
        }
        let snapshot = state
            .snapshots
            .get_mut(identifier)
            .ok_or_else(|| StoreError::not_found("snapshot", identifier))?;
        snapshot.owner = new_owner;
        snapshot.updated_utc = now;
        Ok(())
    }

    async fn load_snapshot(
        &self,
        identifier: &SnapshotIdentifier,
    ) -> StoreResult<Option<Snapshot>> {
        Ok(self.read()?.snapshots.get(identifier).cloned())
    }

    async fn delete_snapshot(&self, identifier: &SnapshotIdentifier) -> StoreResult<bool> {
        Ok(self.write()?.snapshots.remove(identifier).is_some())
    }
}

#[async_trait]
impl AuditStore for InMemoryBusStore {
    async fn append_log(&self, record: &LogRecord) -> StoreResult<()> {
        let mut state = self.write()?;
        if let Some(message) = record.message {
            if !state.messages.contains_key(&message) {
                return Err(StoreError::not_found("message", message));
            }
        }

        let slot = match record.subject {
            LogSubject::HostRuntime(id) => state.runtimes.get_mut(&id).map(|r| &mut r.state),
            LogSubject::Instance(InstanceRef::Publisher(id)) => state
                .publisher_instances
                .get_mut(&id)
                .map(|i| &mut i.state),
            LogSubject::Instance(InstanceRef::Subscriber(id)) => state
                .subscriber_instances
                .get_mut(&id)
                .map(|i| &mut i.state),
            LogSubject::Instance(InstanceRef::Job(id)) => {
                state.job_instances.get_mut(&id).map(|i| &mut i.state)
            }
        };
        let Some(slot) = slot else {
            return Err(StoreError::not_found("log subject", record.subject));
        };
        if let Some(status) = record.status {
            *slot = status;
        }
        state.logs.push(record.clone());
        Ok(())
    }

    async fn list_logs(&self, subject: LogSubject) -> StoreResult<Vec<LogRecord>> {
        let state = self.read()?;
        let mut logs: Vec<_> = state
            .logs
            .iter()
            .filter(|l| l.subject == subject)
            .cloned()
            .collect();
        logs.sort_by_key(|l| l.created_utc);
        Ok(logs)
    }

    async fn current_state(&self, subject: LogSubject) -> StoreResult<Option<ComponentState>> {
        let state = self.read()?;
        Ok(match subject {
            LogSubject::HostRuntime(id) => state.runtimes.get(&id).map(|r| r.state),
            LogSubject::Instance(InstanceRef::Publisher(id)) => {
                state.publisher_instances.get(&id).map(|i| i.state)
            }
            LogSubject::Instance(InstanceRef::Subscriber(id)) => {
                state.subscriber_instances.get(&id).map(|i| i.state)
            }
            LogSubject::Instance(InstanceRef::Job(id)) => {
                state.job_instances.get(&id).map(|i| i.state)
            }
        })
    }
}

fn owned_ticket(
    state: &mut State,
    consumer: Consumer,
    ticket: TicketId,
    token: ConcurrencyToken,
) -> Option<&mut DeliveryTicket> {
    state.tickets.get_mut(&ticket).filter(|t| {
        t.queue == consumer.queue()
            && t.concurrency_token == token
            && t.owner_instance == Some(consumer.instance_uuid())
    })
}
