//! Typed handler registry.
//!
//! Maps a payload's `MESSAGE_TYPE` name to a strongly-typed handler. The registry
//! is built once at startup and only read afterwards; dispatch is a hash lookup
//! followed by a typed decode, with no runtime type inspection.

use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::serializer::{PayloadSerializer, SerializerError, decode};
use crate::{HandlerResult, MessageEnvelope, MessageHandler, MessagePayload, RawDelivery};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("a handler is already registered for message type '{0}'")]
    Duplicate(String),
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DispatchError {
    #[error("no handler registered for message type '{0}'")]
    UnknownType(String),

    #[error(transparent)]
    Decode(#[from] SerializerError),
}

#[async_trait]
trait ErasedHandler: Send + Sync {
    async fn dispatch(
        &self,
        serializer: &dyn PayloadSerializer,
        raw: RawDelivery,
    ) -> Result<HandlerResult, DispatchError>;
}

struct TypedHandler<P, H> {
    handler: H,
    _payload: PhantomData<fn() -> P>,
}

#[async_trait]
impl<P, H> ErasedHandler for TypedHandler<P, H>
where
    P: MessagePayload,
    H: MessageHandler<P>,
{
    async fn dispatch(
        &self,
        serializer: &dyn PayloadSerializer,
        raw: RawDelivery,
    ) -> Result<HandlerResult, DispatchError> {
        let payload: P = decode(serializer, &raw.data)?;
        let envelope = MessageEnvelope::from_raw(raw, payload);
        Ok(self.handler.handle(envelope).await)
    }
}

/// Message type name → handler mapping.
#[derive(Clone)]
pub struct HandlerRegistry {
    serializer: Arc<dyn PayloadSerializer>,
    handlers: HashMap<&'static str, Arc<dyn ErasedHandler>>,
}

impl core::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("serializer", &self.serializer)
            .field("message_types", &self.message_types())
            .finish()
    }
}

impl HandlerRegistry {
    pub fn new(serializer: Arc<dyn PayloadSerializer>) -> Self {
        Self {
            serializer,
            handlers: HashMap::new(),
        }
    }

    /// Register the handler for payload type `P`.
    pub fn register<P, H>(&mut self, handler: H) -> Result<(), RegistryError>
    where
        P: MessagePayload,
        H: MessageHandler<P> + 'static,
    {
        if self.handlers.contains_key(P::MESSAGE_TYPE) {
            return Err(RegistryError::Duplicate(P::MESSAGE_TYPE.to_string()));
        }
        self.handlers.insert(
            P::MESSAGE_TYPE,
            Arc::new(TypedHandler {
                handler,
                _payload: PhantomData,
            }),
        );
        Ok(())
    }

    /// Builder-style variant of [`register`](Self::register).
    pub fn with<P, H>(mut self, handler: H) -> Result<Self, RegistryError>
    where
        P: MessagePayload,
        H: MessageHandler<P> + 'static,
    {
        self.register::<P, H>(handler)?;
        Ok(self)
    }

    pub fn serializer(&self) -> &Arc<dyn PayloadSerializer> {
        &self.serializer
    }

    pub fn handles(&self, message_type: &str) -> bool {
        self.handlers.contains_key(message_type)
    }

    /// Registered message type names, sorted.
    pub fn message_types(&self) -> Vec<&'static str> {
        let mut types: Vec<_> = self.handlers.keys().copied().collect();
        types.sort_unstable();
        types
    }

    /// Decode a raw delivery and run the matching typed handler.
    pub async fn dispatch(&self, raw: RawDelivery) -> Result<HandlerResult, DispatchError> {
        let handler = self
            .handlers
            .get(raw.message_type.as_str())
            .ok_or_else(|| DispatchError::UnknownType(raw.message_type.clone()))?;

        tracing::debug!(
            message_id = %raw.message_id,
            ticket_id = %raw.ticket_id,
            message_type = %raw.message_type,
            "dispatching delivery"
        );

        handler.dispatch(self.serializer.as_ref(), raw).await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use chrono::Utc;
    use serde::{Deserialize, Serialize};

    use busline_core::{DeliveryOutcome, MessageId, TicketId};

    use super::*;
    use crate::{JsonSerializer, encode};

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct OrderPlaced {
        order_no: u32,
    }

    impl MessagePayload for OrderPlaced {
        const MESSAGE_TYPE: &'static str = "orders.order-placed";
    }

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<u32>>,
    }

    #[async_trait]
    impl MessageHandler<OrderPlaced> for Arc<Recorder> {
        async fn handle(&self, envelope: MessageEnvelope<OrderPlaced>) -> HandlerResult {
            self.seen.lock().unwrap().push(envelope.payload().order_no);
            HandlerResult::completed()
        }
    }

    fn raw(message_type: &str, data: Vec<u8>) -> RawDelivery {
        RawDelivery {
            ticket_id: TicketId::new(),
            message_id: MessageId::new(),
            message_type: message_type.to_string(),
            previous_message: None,
            created_utc: Utc::now(),
            is_recovery: false,
            data,
            retry_count: 0,
            snapshot: None,
        }
    }

    #[tokio::test]
    async fn dispatches_to_typed_handler() {
        let recorder = Arc::new(Recorder::default());
        let registry = HandlerRegistry::new(Arc::new(JsonSerializer))
            .with::<OrderPlaced, _>(recorder.clone())
            .unwrap();

        let data = encode(&JsonSerializer, &OrderPlaced { order_no: 42 }).unwrap();
        let result = registry
            .dispatch(raw(OrderPlaced::MESSAGE_TYPE, data))
            .await
            .unwrap();

        assert_eq!(result.outcome, DeliveryOutcome::Completed);
        assert_eq!(*recorder.seen.lock().unwrap(), vec![42]);
    }

    #[tokio::test]
    async fn unknown_type_is_reported() {
        let registry = HandlerRegistry::new(Arc::new(JsonSerializer));
        let err = registry.dispatch(raw("nope", vec![])).await.unwrap_err();
        assert_eq!(err, DispatchError::UnknownType("nope".into()));
    }

    #[tokio::test]
    async fn undecodable_payload_is_a_decode_error() {
        let registry = HandlerRegistry::new(Arc::new(JsonSerializer))
            .with::<OrderPlaced, _>(Arc::new(Recorder::default()))
            .unwrap();
        let err = registry
            .dispatch(raw(OrderPlaced::MESSAGE_TYPE, b"not json".to_vec()))
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::Decode(_)));
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let mut registry = HandlerRegistry::new(Arc::new(JsonSerializer));
        registry
            .register::<OrderPlaced, _>(Arc::new(Recorder::default()))
            .unwrap();
        let err = registry
            .register::<OrderPlaced, _>(Arc::new(Recorder::default()))
            .unwrap_err();
        assert_eq!(err, RegistryError::Duplicate("orders.order-placed".into()));
        assert_eq!(registry.message_types(), vec!["orders.order-placed"]);
    }
}
