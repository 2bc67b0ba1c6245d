//! Typed publishing on top of a [`BusStore`].

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{Span, info, instrument};

use busline_core::{Clock, MessageId, PublisherInstanceId, ScenarioId, SystemClock};
use busline_messages::{JsonSerializer, MessagePayload, PayloadSerializer, encode};

use crate::cache::CatalogCache;
use crate::store::{BusStore, Message, PublishReceipt, QueueRef, StoreError, StoreResult};

/// Per-message options for [`Publisher::publish_with`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Publication {
    /// Preset id; a fresh one is generated otherwise.
    pub id: Option<MessageId>,
    pub previous_message: Option<MessageId>,
    pub valid_to_utc: Option<DateTime<Utc>>,
    pub is_recovery: bool,
}

impl Publication {
    pub fn after(mut self, previous: MessageId) -> Self {
        self.previous_message = Some(previous);
        self
    }

    pub fn valid_until(mut self, valid_to: DateTime<Utc>) -> Self {
        self.valid_to_utc = Some(valid_to);
        self
    }

    pub fn recovery(mut self) -> Self {
        self.is_recovery = true;
        self
    }
}

/// Publishes typed payloads as one publisher instance of one scenario.
#[derive(Debug)]
pub struct Publisher<S: ?Sized> {
    store: Arc<S>,
    cache: Arc<CatalogCache>,
    serializer: Arc<dyn PayloadSerializer>,
    clock: Arc<dyn Clock>,
    scenario: ScenarioId,
    instance: PublisherInstanceId,
}

impl<S> Publisher<S>
where
    S: BusStore + ?Sized,
{
    pub fn new(
        store: Arc<S>,
        cache: Arc<CatalogCache>,
        scenario: ScenarioId,
        instance: PublisherInstanceId,
    ) -> Self {
        Self {
            store,
            cache,
            serializer: Arc::new(JsonSerializer),
            clock: Arc::new(SystemClock),
            scenario,
            instance,
        }
    }

    pub fn with_serializer(mut self, serializer: Arc<dyn PayloadSerializer>) -> Self {
        self.serializer = serializer;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn instance(&self) -> PublisherInstanceId {
        self.instance
    }

    /// Publish to every subscriber and job of the scenario that declares `P`.
    ///
    /// Fails with [`StoreError::Validation`] when nothing consumes `P`; no message row
    /// is written.
    pub async fn publish<P: MessagePayload>(&self, payload: &P) -> StoreResult<PublishReceipt> {
        self.publish_with(payload, Publication::default()).await
    }

    #[instrument(
        skip(self, payload, publication),
        fields(message_type = P::MESSAGE_TYPE, scenario = %self.scenario, targets),
        err
    )]
    pub async fn publish_with<P: MessagePayload>(
        &self,
        payload: &P,
        publication: Publication,
    ) -> StoreResult<PublishReceipt> {
        let message = self.build(payload, publication).await?;
        let targets = self
            .store
            .resolve_targets(self.scenario, message.message_type)
            .await?;
        Span::current().record("targets", targets.len());
        self.send(&message, &targets).await
    }

    /// Publish to an explicit set of queues.
    #[instrument(
        skip(self, payload, targets),
        fields(message_type = P::MESSAGE_TYPE, targets = targets.len()),
        err
    )]
    pub async fn publish_to<P: MessagePayload>(
        &self,
        payload: &P,
        targets: &[QueueRef],
    ) -> StoreResult<PublishReceipt> {
        let message = self.build(payload, Publication::default()).await?;
        self.send(&message, targets).await
    }

    async fn build<P: MessagePayload>(
        &self,
        payload: &P,
        publication: Publication,
    ) -> StoreResult<Message> {
        let message_type = self
            .cache
            .message_type(self.store.as_ref(), P::MESSAGE_TYPE)
            .await?;
        let data = encode(self.serializer.as_ref(), payload)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;

        Ok(Message {
            id: publication.id.unwrap_or_default(),
            message_type: message_type.id,
            publisher_instance: self.instance,
            previous_message: publication.previous_message,
            created_utc: self.clock.now(),
            valid_to_utc: publication.valid_to_utc,
            is_recovery: publication.is_recovery,
            data,
        })
    }

    async fn send(&self, message: &Message, targets: &[QueueRef]) -> StoreResult<PublishReceipt> {
        let receipt = self.store.publish(message, targets).await?;
        info!(
            message_id = %receipt.message,
            publisher_instance = %self.instance,
            tickets = receipt.tickets.len(),
            "message published"
        );
        Ok(receipt)
    }
}
