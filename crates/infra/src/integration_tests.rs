//! Integration tests for the full delivery pipeline.
//!
//! Tests: StartupPlan → Publisher → fan-out → claim → handler → commit
//!
//! Verifies:
//! - Every interested queue gets exactly one ticket per message
//! - Crashed claims are reclaimed after the processing timeout and the stale
//!   owner's late result is discarded
//! - FIFO queues deliver in publish order and block behind a delayed head
//! - Subscribers of one message keep independent state and retry counts
//! - Retry budgets end in `Suspended`
//! - Registration is idempotent and conflicting identities are rejected

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use async_trait::async_trait;
    use chrono::{DateTime, TimeZone, Utc};
    use proptest::prelude::*;
    use serde::{Deserialize, Serialize};

    use busline_core::{
        BackoffPolicy, Clock, ComponentState, DeliveryOutcome, DeliveryPolicy, HostId,
        HostRuntimeId, JobInstanceId, ManualClock, MessageId, PublisherId, PublisherInstanceId,
        ScenarioId, SnapshotIdentifier, SubscriberId, SubscriberInstanceId, TicketState,
        TicketUpdate, resolve_outcome,
    };
    use busline_messages::{
        HandlerRegistry, HandlerResult, JsonSerializer, MessageEnvelope, MessageHandler,
        MessagePayload,
    };

    use crate::audit::{AuditDisposition, AuditLogger};
    use crate::cache::{CacheSettings, CatalogCache};
    use crate::consumer::{ConsumerWorker, PollOutcome, WorkerConfig};
    use crate::publisher::{Publication, Publisher};
    use crate::registration::{PlannedInstance, StartupPlan, StartupReceipt};
    use crate::store::{
        AuditStore, CatalogStore, ClaimOutcome, ClaimedDelivery, CommitOutcome, Consumer,
        DeliveryStore, Host, InMemoryBusStore, InstanceRef, JobSpec, LogSubject, MessageTypeSpec,
        PublisherSpec, QueueRef, Scenario, SnapshotStore, StoreError, SubscriberSpec, TicketKind,
    };

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct InvoiceIssued {
        number: u32,
    }

    impl MessagePayload for InvoiceIssued {
        const MESSAGE_TYPE: &'static str = "billing.invoice-issued";
    }

    const TIMEOUT: Duration = Duration::from_secs(30);

    fn base_time() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 5, 9, 0, 0).unwrap()
    }

    struct Bus {
        store: Arc<InMemoryBusStore>,
        clock: ManualClock,
        plan: StartupPlan,
        receipt: StartupReceipt,
        publisher_id: PublisherId,
        subscriber_id: SubscriberId,
        policy: DeliveryPolicy,
    }

    impl Bus {
        fn publisher(&self) -> Publisher<InMemoryBusStore> {
            let instance = self.receipt.publisher_instance(self.publisher_id).unwrap();
            Publisher::new(
                self.store.clone(),
                Arc::new(CatalogCache::new(CacheSettings::default())),
                self.receipt.scenario.id,
                instance,
            )
            .with_clock(Arc::new(self.clock.clone()))
        }

        /// Subscriber consumers, in plan order.
        fn subscribers(&self) -> Vec<Consumer> {
            self.receipt
                .consumers()
                .into_iter()
                .filter(|c| matches!(c, Consumer::Subscriber { .. }))
                .collect()
        }

        fn queue(&self) -> QueueRef {
            QueueRef::Subscriber(self.subscriber_id)
        }

        async fn claim(&self, consumer: Consumer) -> ClaimOutcome {
            self.claim_with(consumer, &self.policy).await
        }

        async fn claim_with(&self, consumer: Consumer, policy: &DeliveryPolicy) -> ClaimOutcome {
            self.store
                .claim_next(
                    consumer,
                    policy,
                    &TicketState::DEFAULT_ELIGIBLE,
                    self.clock.now(),
                )
                .await
                .unwrap()
        }

        async fn finish(
            &self,
            consumer: Consumer,
            claimed: &ClaimedDelivery,
            outcome: DeliveryOutcome,
            backoff: &BackoffPolicy,
        ) -> (TicketUpdate, CommitOutcome) {
            let update = resolve_outcome(
                &self.policy,
                backoff,
                claimed.ticket.retry_count,
                &outcome,
                self.clock.now(),
            );
            let committed = self
                .store
                .commit(
                    consumer,
                    claimed.ticket.id,
                    claimed.ticket.concurrency_token,
                    &update,
                    self.clock.now(),
                )
                .await
                .unwrap();
            (update, committed)
        }

        fn advance(&self, secs: i64) {
            self.clock.advance(chrono::Duration::seconds(secs));
        }
    }

    fn plan(policy: &DeliveryPolicy, publisher_id: PublisherId, subscriber_id: SubscriberId) -> StartupPlan {
        StartupPlan::new(
            Host {
                id: HostId::new(),
                name: "billing-host".into(),
            },
            Scenario {
                id: ScenarioId::new(),
                name: "billing".into(),
            },
        )
        .with_process("svc-billing", "node-1")
        .with_message_type::<InvoiceIssued>()
        .with_publisher(PublisherSpec {
            id: publisher_id,
            name: "invoicing".into(),
            message_type: InvoiceIssued::MESSAGE_TYPE.into(),
        })
        .with_subscriber(SubscriberSpec {
            id: subscriber_id,
            name: "ledger".into(),
            message_type: InvoiceIssued::MESSAGE_TYPE.into(),
            policy: policy.clone(),
        })
        .with_instance(PlannedInstance::Subscriber {
            subscriber: subscriber_id,
            instance: SubscriberInstanceId::new(),
        })
        .with_job(JobSpec {
            name: "archive".into(),
            message_type: Some(InvoiceIssued::MESSAGE_TYPE.into()),
            policy: DeliveryPolicy::non_fifo(TIMEOUT),
        })
        .with_instance(PlannedInstance::Job {
            job: "archive".into(),
            instance: JobInstanceId::new(),
        })
    }

    /// The same components under new instance ids, as after a process restart.
    fn restarted(plan: &StartupPlan) -> StartupPlan {
        let mut restart = plan.clone();
        restart.runtime_id = HostRuntimeId::new();
        for planned in &mut restart.instances {
            match planned {
                PlannedInstance::Publisher { instance, .. } => *instance = PublisherInstanceId::new(),
                PlannedInstance::Subscriber { instance, .. } => {
                    *instance = SubscriberInstanceId::new()
                }
                PlannedInstance::Job { instance, .. } => *instance = JobInstanceId::new(),
            }
        }
        restart
    }

    async fn start(policy: DeliveryPolicy) -> Bus {
        let store = Arc::new(InMemoryBusStore::new());
        let clock = ManualClock::at(base_time());
        let publisher_id = PublisherId::new();
        let subscriber_id = SubscriberId::new();
        let plan = plan(&policy, publisher_id, subscriber_id);
        let receipt = store.initialize(&plan, clock.now()).await.unwrap();

        Bus {
            store,
            clock,
            plan,
            receipt,
            publisher_id,
            subscriber_id,
            policy,
        }
    }

    async fn publish(bus: &Bus, number: u32) -> MessageId {
        let receipt = bus.publisher().publish(&InvoiceIssued { number }).await.unwrap();
        bus.advance(1);
        receipt.message
    }

    #[tokio::test]
    async fn fan_out_creates_one_ready_ticket_per_interested_queue() {
        let bus = start(DeliveryPolicy::fifo(TIMEOUT)).await;

        let receipt = bus.publisher().publish(&InvoiceIssued { number: 1 }).await.unwrap();

        assert_eq!(receipt.tickets.len(), 2);
        let tickets = bus.store.tickets_for_message(receipt.message).await.unwrap();
        assert_eq!(tickets.len(), 2);
        assert_eq!(tickets[0].kind(), TicketKind::Subscriber);
        assert_eq!(tickets[1].kind(), TicketKind::TempQueue);
        for ticket in &tickets {
            assert_eq!(ticket.state, TicketState::Ready);
            assert_eq!(ticket.retry_count, 0);
            assert!(ticket.owner_instance.is_none());
        }
        assert_ne!(tickets[0].concurrency_token, tickets[1].concurrency_token);

        let depth = bus.store.count_by_state(bus.queue()).await.unwrap();
        assert_eq!(depth.get(&TicketState::Ready), Some(&1));
    }

    #[tokio::test]
    async fn publish_is_all_or_nothing() {
        let bus = start(DeliveryPolicy::fifo(TIMEOUT)).await;
        let publisher = bus.publisher();
        let unknown = QueueRef::Subscriber(SubscriberId::new());

        let err = publisher
            .publish_to(&InvoiceIssued { number: 1 }, &[bus.queue(), unknown])
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound { .. }));

        let err = publisher
            .publish_to(&InvoiceIssued { number: 1 }, &[bus.queue(), bus.queue()])
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Validation(_)));

        let err = publisher
            .publish_to(&InvoiceIssued { number: 1 }, &[])
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Validation(_)));

        assert!(bus.store.count_by_state(bus.queue()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn duplicate_message_id_is_an_integrity_violation() {
        let bus = start(DeliveryPolicy::fifo(TIMEOUT)).await;
        let publisher = bus.publisher();
        let id = MessageId::new();
        let publication = Publication {
            id: Some(id),
            ..Default::default()
        };

        publisher
            .publish_with(&InvoiceIssued { number: 1 }, publication.clone())
            .await
            .unwrap();
        let err = publisher
            .publish_with(&InvoiceIssued { number: 1 }, publication)
            .await
            .unwrap_err();
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn crashed_claim_is_reclaimed_and_late_result_discarded() {
        let bus = start(DeliveryPolicy::fifo(TIMEOUT)).await;
        let consumers = bus.subscribers();
        let (first, second) = (consumers[0], consumers[1]);
        publish(&bus, 1).await;

        let ClaimOutcome::Claimed(abandoned) = bus.claim(first).await else {
            panic!("first instance should claim the ticket");
        };
        assert_eq!(abandoned.ticket.state, TicketState::InProgress);

        // first instance "crashes": no heartbeat, no commit
        bus.advance(10);
        assert_eq!(bus.claim(second).await, ClaimOutcome::Empty);

        bus.advance(25);
        let ClaimOutcome::Claimed(reclaimed) = bus.claim(second).await else {
            panic!("stale claim should be reclaimable");
        };
        assert_eq!(reclaimed.ticket.id, abandoned.ticket.id);
        assert_eq!(reclaimed.ticket.owner_instance, Some(second.instance_uuid()));

        let (_, late) = bus
            .finish(first, &abandoned, DeliveryOutcome::Completed, &BackoffPolicy::none())
            .await;
        assert_eq!(late, CommitOutcome::Lost);

        let (_, committed) = bus
            .finish(second, &reclaimed, DeliveryOutcome::Completed, &BackoffPolicy::none())
            .await;
        assert!(committed.is_committed());

        let ticket = bus
            .store
            .load_ticket(TicketKind::Subscriber, abandoned.ticket.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(ticket.state, TicketState::Completed);
        assert_eq!(ticket.owner_instance, Some(second.instance_uuid()));
        assert_eq!(bus.claim(second).await, ClaimOutcome::Empty);
    }

    #[tokio::test]
    async fn heartbeat_keeps_a_long_claim_alive() {
        let bus = start(DeliveryPolicy::non_fifo(TIMEOUT)).await;
        let consumers = bus.subscribers();
        let (first, second) = (consumers[0], consumers[1]);
        publish(&bus, 1).await;
        let claimed = bus.claim(first).await.claimed().unwrap();

        bus.advance(20);
        let beat = bus
            .store
            .heartbeat(first, claimed.ticket.id, claimed.ticket.concurrency_token, bus.clock.now())
            .await
            .unwrap();
        assert_eq!(
            beat,
            CommitOutcome::Committed {
                token: claimed.ticket.concurrency_token
            }
        );

        bus.advance(20);
        assert_eq!(bus.claim(second).await, ClaimOutcome::Empty);

        bus.advance(11);
        assert!(bus.claim(second).await.claimed().is_some());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_claims_have_exactly_one_winner() {
        let bus = start(DeliveryPolicy::non_fifo(TIMEOUT)).await;
        publish(&bus, 1).await;
        let candidate = bus
            .store
            .find_next_non_fifo(
                bus.queue(),
                &TicketState::DEFAULT_ELIGIBLE,
                TIMEOUT,
                bus.clock.now(),
            )
            .await
            .unwrap()
            .unwrap();

        let consumers = bus.subscribers();
        let mut tasks = Vec::new();
        for i in 0..8 {
            let store = bus.store.clone();
            let candidate = candidate.clone();
            let consumer = consumers[i % consumers.len()];
            let now = bus.clock.now();
            tasks.push(tokio::spawn(async move {
                store
                    .try_claim(&candidate, consumer, TIMEOUT, now)
                    .await
                    .unwrap()
            }));
        }

        let mut claimed = 0;
        let mut lost = 0;
        for task in tasks {
            match task.await.unwrap() {
                ClaimOutcome::Claimed(_) => claimed += 1,
                ClaimOutcome::Lost { .. } => lost += 1,
                ClaimOutcome::Empty => panic!("try_claim never reports Empty"),
            }
        }
        assert_eq!((claimed, lost), (1, 7));
    }

    #[tokio::test]
    async fn heartbeat_after_selection_defeats_a_stale_claim() {
        let bus = start(DeliveryPolicy::non_fifo(TIMEOUT)).await;
        let consumers = bus.subscribers();
        let (owner, rival) = (consumers[0], consumers[1]);
        publish(&bus, 1).await;
        let claimed = bus.claim(owner).await.claimed().unwrap();

        bus.advance(35);
        let candidate = bus
            .store
            .find_next_non_fifo(
                bus.queue(),
                &TicketState::DEFAULT_ELIGIBLE,
                TIMEOUT,
                bus.clock.now(),
            )
            .await
            .unwrap()
            .unwrap();
        assert_eq!(candidate.id, claimed.ticket.id);

        let beat = bus
            .store
            .heartbeat(owner, claimed.ticket.id, claimed.ticket.concurrency_token, bus.clock.now())
            .await
            .unwrap();
        assert!(beat.is_committed());

        let outcome = bus
            .store
            .try_claim(&candidate, rival, TIMEOUT, bus.clock.now())
            .await
            .unwrap();
        assert_eq!(
            outcome,
            ClaimOutcome::Lost {
                ticket: candidate.id
            }
        );

        let (_, committed) = bus
            .finish(owner, &claimed, DeliveryOutcome::Completed, &BackoffPolicy::none())
            .await;
        assert!(committed.is_committed());
    }

    #[tokio::test]
    async fn terminal_tickets_cannot_be_claimed_again() {
        let policy = DeliveryPolicy::non_fifo(TIMEOUT).with_max_retry(Some(1));
        let bus = start(policy).await;
        let consumers = bus.subscribers();
        let (owner, rival) = (consumers[0], consumers[1]);
        publish(&bus, 1).await;
        publish(&bus, 2).await;

        let poisoned = bus.claim(owner).await.claimed().unwrap();
        let (update, _) = bus
            .finish(owner, &poisoned, DeliveryOutcome::failed("boom"), &BackoffPolicy::none())
            .await;
        assert_eq!(update.state, TicketState::Suspended);

        let done = bus.claim(owner).await.claimed().unwrap();
        let (update, _) = bus
            .finish(owner, &done, DeliveryOutcome::Completed, &BackoffPolicy::none())
            .await;
        assert_eq!(update.state, TicketState::Completed);

        bus.advance(3600);
        for (id, expected) in [
            (poisoned.ticket.id, TicketState::Suspended),
            (done.ticket.id, TicketState::Completed),
        ] {
            let stored = bus
                .store
                .load_ticket(TicketKind::Subscriber, id)
                .await
                .unwrap()
                .unwrap();
            let outcome = bus
                .store
                .try_claim(&stored, rival, TIMEOUT, bus.clock.now())
                .await
                .unwrap();
            assert_eq!(outcome, ClaimOutcome::Lost { ticket: id });

            let after = bus
                .store
                .load_ticket(TicketKind::Subscriber, id)
                .await
                .unwrap()
                .unwrap();
            assert_eq!(after, stored);
            assert_eq!(after.state, expected);
        }
    }

    #[tokio::test]
    async fn subscribers_progress_independently_on_the_same_message() {
        let ledger = SubscriberId::new();
        let reporting = SubscriberId::new();
        let publisher_id = PublisherId::new();
        let fifo = DeliveryPolicy::fifo(TIMEOUT);
        let non_fifo = DeliveryPolicy::non_fifo(TIMEOUT);
        let plan = plan(&fifo, publisher_id, ledger).with_subscriber(SubscriberSpec {
            id: reporting,
            name: "reporting".into(),
            message_type: InvoiceIssued::MESSAGE_TYPE.into(),
            policy: non_fifo.clone(),
        });
        let store = Arc::new(InMemoryBusStore::new());
        let clock = ManualClock::at(base_time());
        let receipt = store.initialize(&plan, clock.now()).await.unwrap();
        let bus = Bus {
            store,
            clock,
            plan,
            receipt,
            publisher_id,
            subscriber_id: ledger,
            policy: fifo,
        };
        let a = bus.receipt.subscriber_consumer(ledger).unwrap();
        let b = bus.receipt.subscriber_consumer(reporting).unwrap();
        let first = publish(&bus, 1).await;
        let second = publish(&bus, 2).await;

        let at_a = bus.claim(a).await.claimed().unwrap();
        assert_eq!(at_a.message.id, first);
        let (update, _) = bus
            .finish(
                a,
                &at_a,
                DeliveryOutcome::failed("ledger locked"),
                &BackoffPolicy::fixed(Duration::from_secs(10)),
            )
            .await;
        assert_eq!(update.state, TicketState::Failed);
        assert_eq!(bus.claim(a).await, ClaimOutcome::Empty);

        let at_b = bus.claim_with(b, &non_fifo).await.claimed().unwrap();
        assert_eq!(at_b.message.id, first);
        assert_eq!(at_b.ticket.retry_count, 0);
        let (_, committed) = bus
            .finish(b, &at_b, DeliveryOutcome::Completed, &BackoffPolicy::none())
            .await;
        assert!(committed.is_committed());
        let next = bus.claim_with(b, &non_fifo).await.claimed().unwrap();
        assert_eq!(next.message.id, second);

        let tickets = bus.store.tickets_for_message(first).await.unwrap();
        let at = |queue: QueueRef| tickets.iter().find(|t| t.queue == queue).unwrap();
        let ledger_ticket = at(QueueRef::Subscriber(ledger));
        assert_eq!(ledger_ticket.state, TicketState::Failed);
        assert_eq!(ledger_ticket.retry_count, 1);
        assert!(ledger_ticket.delayed_to_utc.is_some());
        let reporting_ticket = at(QueueRef::Subscriber(reporting));
        assert_eq!(reporting_ticket.state, TicketState::Completed);
        assert_eq!(reporting_ticket.retry_count, 0);
        assert_eq!(tickets.len(), 3);
    }

    #[tokio::test]
    async fn fifo_head_blocks_until_its_delay_has_strictly_passed() {
        let bus = start(DeliveryPolicy::fifo(TIMEOUT)).await;
        let consumer = bus.subscribers()[0];
        let first = publish(&bus, 1).await;
        publish(&bus, 2).await;

        let claimed = bus.claim(consumer).await.claimed().unwrap();
        assert_eq!(claimed.message.id, first);
        let (update, _) = bus
            .finish(
                consumer,
                &claimed,
                DeliveryOutcome::failed("ledger locked"),
                &BackoffPolicy::fixed(Duration::from_secs(10)),
            )
            .await;
        assert_eq!(update.state, TicketState::Failed);
        let delayed_to = update.delayed_to_utc.unwrap();

        assert_eq!(bus.claim(consumer).await, ClaimOutcome::Empty);

        bus.clock.set(delayed_to);
        assert_eq!(bus.claim(consumer).await, ClaimOutcome::Empty);

        bus.advance(1);
        let retried = bus.claim(consumer).await.claimed().unwrap();
        assert_eq!(retried.message.id, first);
        assert_eq!(retried.ticket.retry_count, 1);
    }

    #[tokio::test]
    async fn non_fifo_skips_past_a_delayed_ticket() {
        let bus = start(DeliveryPolicy::non_fifo(TIMEOUT)).await;
        let consumer = bus.subscribers()[0];
        let first = publish(&bus, 1).await;
        let second = publish(&bus, 2).await;

        let claimed = bus.claim(consumer).await.claimed().unwrap();
        assert_eq!(claimed.message.id, first);
        bus.finish(
            consumer,
            &claimed,
            DeliveryOutcome::Deferred {
                until: bus.clock.now() + chrono::Duration::minutes(5),
            },
            &BackoffPolicy::none(),
        )
        .await;

        let next = bus.claim(consumer).await.claimed().unwrap();
        assert_eq!(next.message.id, second);
        assert_eq!(next.ticket.retry_count, 0);
    }

    #[tokio::test]
    async fn exhausted_retries_suspend_and_unblock_the_fifo_queue() {
        let policy = DeliveryPolicy::fifo(TIMEOUT).with_max_retry(Some(2));
        let bus = start(policy).await;
        let consumer = bus.subscribers()[0];
        let poison = publish(&bus, 1).await;
        let next = publish(&bus, 2).await;

        for expected in [TicketState::Failed, TicketState::Suspended] {
            let claimed = bus.claim(consumer).await.claimed().unwrap();
            assert_eq!(claimed.message.id, poison);
            let (update, committed) = bus
                .finish(consumer, &claimed, DeliveryOutcome::failed("boom"), &BackoffPolicy::none())
                .await;
            assert!(committed.is_committed());
            assert_eq!(update.state, expected);
            bus.advance(1);
        }

        let claimed = bus.claim(consumer).await.claimed().unwrap();
        assert_eq!(claimed.message.id, next);

        let depth = bus.store.count_by_state(bus.queue()).await.unwrap();
        assert_eq!(depth.get(&TicketState::Suspended), Some(&1));
        assert_eq!(depth.get(&TicketState::InProgress), Some(&1));
    }

    #[tokio::test]
    async fn expired_messages_are_not_delivered() {
        let bus = start(DeliveryPolicy::fifo(TIMEOUT)).await;
        let consumer = bus.subscribers()[0];
        bus.publisher()
            .publish_with(
                &InvoiceIssued { number: 1 },
                Publication::default().valid_until(bus.clock.now() + chrono::Duration::seconds(5)),
            )
            .await
            .unwrap();
        let live = bus
            .publisher()
            .publish_with(&InvoiceIssued { number: 2 }, Publication::default().recovery())
            .await
            .unwrap();

        bus.advance(10);
        let claimed = bus.claim(consumer).await.claimed().unwrap();
        assert_eq!(claimed.message.id, live.message);
        assert!(claimed.message.is_recovery);
    }

    #[tokio::test]
    async fn job_queue_is_claimed_by_job_instance() {
        let bus = start(DeliveryPolicy::fifo(TIMEOUT)).await;
        let message = publish(&bus, 9).await;
        let job = bus.receipt.job("archive").unwrap().clone();
        let consumer = bus.receipt.job_consumer("archive").unwrap();

        let claimed = bus
            .store
            .claim_next(consumer, &job.policy, &TicketState::DEFAULT_ELIGIBLE, bus.clock.now())
            .await
            .unwrap()
            .claimed()
            .unwrap();
        assert_eq!(claimed.message.id, message);
        assert_eq!(claimed.ticket.queue, QueueRef::Job(job.id));
        assert_eq!(claimed.ticket.kind(), TicketKind::TempQueue);
    }

    proptest! {
        #[test]
        fn fifo_delivers_in_publish_time_order(
            offsets in prop::collection::hash_set(0_i64..10_000, 1..12)
        ) {
            let rt = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .unwrap();

            let delivered = rt.block_on(async {
                let bus = start(DeliveryPolicy::fifo(TIMEOUT)).await;
                let consumer = bus.subscribers()[0];
                let publisher = bus.publisher();

                for (number, offset) in offsets.iter().enumerate() {
                    bus.clock.set(base_time() + chrono::Duration::seconds(*offset));
                    publisher.publish(&InvoiceIssued { number: number as u32 }).await.unwrap();
                }

                bus.clock.set(base_time() + chrono::Duration::seconds(20_000));
                let mut delivered = Vec::new();
                while let Some(claimed) = bus.claim(consumer).await.claimed() {
                    delivered.push(claimed.message.created_utc);
                    bus.finish(consumer, &claimed, DeliveryOutcome::Completed, &BackoffPolicy::none())
                        .await;
                }
                delivered
            });

            let mut expected: Vec<_> = offsets
                .iter()
                .map(|o| base_time() + chrono::Duration::seconds(*o))
                .collect();
            expected.sort();
            prop_assert_eq!(delivered, expected);
        }
    }

    #[tokio::test]
    async fn snapshot_save_transfer_and_delete() {
        let bus = start(DeliveryPolicy::fifo(TIMEOUT)).await;
        let job_instances: Vec<JobInstanceId> = bus
            .receipt
            .consumers()
            .into_iter()
            .filter_map(|c| match c {
                Consumer::Job { instance, .. } => Some(instance),
                Consumer::Subscriber { .. } => None,
            })
            .collect();
        let (owner, successor) = (job_instances[0], job_instances[1]);
        let id = SnapshotIdentifier::new("archive/2026-01").unwrap();

        let first = bus
            .store
            .save_snapshot(owner, &id, b"page=1", bus.clock.now())
            .await
            .unwrap();
        bus.advance(60);
        let second = bus
            .store
            .save_snapshot(owner, &id, b"page=2", bus.clock.now())
            .await
            .unwrap();
        assert_eq!(second.created_utc, first.created_utc);
        assert!(second.updated_utc > first.updated_utc);

        bus.store.transfer_snapshot(successor, &id, bus.clock.now()).await.unwrap();
        let loaded = bus.store.load_snapshot(&id).await.unwrap().unwrap();
        assert_eq!(loaded.owner, successor);
        assert_eq!(loaded.data, b"page=2".to_vec());

        let missing = SnapshotIdentifier::new("archive/none").unwrap();
        let err = bus
            .store
            .transfer_snapshot(successor, &missing, bus.clock.now())
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound { .. }));

        assert!(bus.store.delete_snapshot(&id).await.unwrap());
        assert!(!bus.store.delete_snapshot(&id).await.unwrap());
        assert!(bus.store.load_snapshot(&id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn restart_reuses_catalog_rows_and_refreshes_policy() {
        let bus = start(DeliveryPolicy::fifo(TIMEOUT)).await;

        let mut restart = restarted(&bus.plan);
        restart.subscribers[0].policy = DeliveryPolicy::non_fifo(Duration::from_secs(90));
        let again = bus.store.initialize(&restart, bus.clock.now()).await.unwrap();

        assert_eq!(again.scenario, bus.receipt.scenario);
        assert_eq!(again.message_types, bus.receipt.message_types);
        assert_eq!(again.job("archive").unwrap().id, bus.receipt.job("archive").unwrap().id);
        assert_ne!(again.runtime.id, bus.receipt.runtime.id);

        let stored = bus.store.load_subscriber(bus.subscriber_id).await.unwrap().unwrap();
        assert!(!stored.policy.fifo);
        assert_eq!(stored.policy.processing_timeout, Duration::from_secs(90));
    }

    #[tokio::test]
    async fn conflicting_identity_fails_and_rolls_back_the_pass() {
        let bus = start(DeliveryPolicy::fifo(TIMEOUT)).await;

        let mut renamed = restarted(&bus.plan);
        renamed.message_types.push(MessageTypeSpec::new("billing.credit-note", "tests::CreditNote"));
        renamed.subscribers[0].name = "general-ledger".into();

        let err = bus.store.initialize(&renamed, bus.clock.now()).await.unwrap_err();
        assert!(matches!(err, StoreError::RegistrationConflict { entity: "subscriber", .. }));
        assert!(err.is_fatal());
        assert!(
            bus.store
                .message_type_by_name("billing.credit-note")
                .await
                .unwrap()
                .is_none()
        );

        let err = bus
            .store
            .register_message_type(&MessageTypeSpec::new(InvoiceIssued::MESSAGE_TYPE, "tests::Other"))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::RegistrationConflict { .. }));
    }

    #[tokio::test]
    async fn audit_rows_move_instance_state() {
        let bus = start(DeliveryPolicy::fifo(TIMEOUT)).await;
        let audit = AuditLogger::new(bus.store.clone()).with_clock(Arc::new(bus.clock.clone()));
        let instance = bus.subscribers()[0].instance();
        let subject = LogSubject::Instance(instance);

        assert_eq!(
            bus.store.current_state(subject).await.unwrap(),
            Some(ComponentState::Starting)
        );
        let disposition = audit
            .instance_status(instance, ComponentState::Running, "consumer started")
            .await;
        assert_eq!(disposition, AuditDisposition::Persisted);
        assert_eq!(
            bus.store.current_state(subject).await.unwrap(),
            Some(ComponentState::Running)
        );
        assert_eq!(bus.store.list_logs(subject).await.unwrap().len(), 1);

        let stranger = InstanceRef::Subscriber(SubscriberInstanceId::new());
        let disposition = audit
            .instance_status(stranger, ComponentState::Running, "unknown instance")
            .await;
        assert_eq!(disposition, AuditDisposition::Fallback);
    }

    #[derive(Default)]
    struct Ledger {
        seen: Mutex<Vec<u32>>,
    }

    #[async_trait]
    impl MessageHandler<InvoiceIssued> for Arc<Ledger> {
        async fn handle(&self, envelope: MessageEnvelope<InvoiceIssued>) -> HandlerResult {
            let number = envelope.payload().number;
            self.seen.lock().unwrap().push(number);
            if number == 13 {
                panic!("unlucky invoice");
            }
            HandlerResult::completed().with_snapshot(format!("booked {number}").into_bytes())
        }
    }

    fn worker(bus: &Bus, ledger: Arc<Ledger>) -> ConsumerWorker<InMemoryBusStore> {
        let registry = HandlerRegistry::new(Arc::new(JsonSerializer))
            .with::<InvoiceIssued, _>(ledger)
            .unwrap();
        ConsumerWorker::new(
            bus.store.clone(),
            Arc::new(registry),
            bus.subscribers()[0],
            bus.policy.clone(),
        )
        .with_clock(Arc::new(bus.clock.clone()))
        .with_config(
            WorkerConfig::default()
                .with_name("ledger")
                .with_backoff(BackoffPolicy::none())
                .with_poll_interval(Duration::from_millis(5)),
        )
    }

    #[tokio::test]
    async fn worker_processes_and_commits() {
        let bus = start(DeliveryPolicy::fifo(TIMEOUT)).await;
        let ledger = Arc::new(Ledger::default());
        let worker = worker(&bus, ledger.clone());
        let message = publish(&bus, 7).await;

        let outcome = worker.run_once().await.unwrap();
        let PollOutcome::Processed {
            ticket,
            state,
            committed,
        } = outcome
        else {
            panic!("expected a processed delivery, got {outcome:?}");
        };
        assert_eq!(state, TicketState::Completed);
        assert!(committed);
        assert_eq!(*ledger.seen.lock().unwrap(), vec![7]);

        let stored = bus
            .store
            .load_ticket(TicketKind::Subscriber, ticket)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.message, message);
        assert_eq!(stored.snapshot.as_deref(), Some(&b"booked 7"[..]));

        assert_eq!(worker.run_once().await.unwrap(), PollOutcome::Empty);
        let stats = worker.stats();
        assert_eq!((stats.completed, stats.empty_polls), (1, 1));
    }

    #[tokio::test]
    async fn handler_panic_becomes_a_failed_attempt() {
        let bus = start(DeliveryPolicy::fifo(TIMEOUT)).await;
        let worker = worker(&bus, Arc::new(Ledger::default()));
        publish(&bus, 13).await;

        let outcome = worker.run_once().await.unwrap();
        assert!(matches!(
            outcome,
            PollOutcome::Processed {
                state: TicketState::Failed,
                committed: true,
                ..
            }
        ));

        let depth = bus.store.count_by_state(bus.queue()).await.unwrap();
        assert_eq!(depth.get(&TicketState::Failed), Some(&1));
    }

    #[tokio::test]
    async fn worker_run_stops_on_cancellation() {
        let bus = start(DeliveryPolicy::fifo(TIMEOUT)).await;
        let ledger = Arc::new(Ledger::default());
        let worker = Arc::new(worker(&bus, ledger.clone()));
        publish(&bus, 1).await;
        publish(&bus, 2).await;

        let running = tokio::spawn({
            let worker = worker.clone();
            async move { worker.run().await }
        });
        while ledger.seen.lock().unwrap().len() < 2 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        worker.cancellation().cancel();
        running.await.unwrap().unwrap();

        let subject = LogSubject::Instance(bus.subscribers()[0].instance());
        assert_eq!(
            bus.store.current_state(subject).await.unwrap(),
            Some(ComponentState::Stopped)
        );
        assert_eq!(*ledger.seen.lock().unwrap(), vec![1, 2]);
    }
}
