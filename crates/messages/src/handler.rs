use async_trait::async_trait;

use busline_core::DeliveryOutcome;

use crate::{MessageEnvelope, MessagePayload};

/// What a handler hands back to the consumer loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandlerResult {
    pub outcome: DeliveryOutcome,
    /// Progress blob to store on the ticket (e.g. how far a partial import got).
    pub snapshot: Option<Vec<u8>>,
}

impl HandlerResult {
    pub fn completed() -> Self {
        Self {
            outcome: DeliveryOutcome::Completed,
            snapshot: None,
        }
    }

    pub fn failed(reason: impl Into<String>) -> Self {
        Self {
            outcome: DeliveryOutcome::failed(reason),
            snapshot: None,
        }
    }

    pub fn rejected(reason: impl Into<String>) -> Self {
        Self {
            outcome: DeliveryOutcome::rejected(reason),
            snapshot: None,
        }
    }

    pub fn deferred(until: chrono::DateTime<chrono::Utc>) -> Self {
        Self {
            outcome: DeliveryOutcome::Deferred { until },
            snapshot: None,
        }
    }

    pub fn with_snapshot(mut self, snapshot: Vec<u8>) -> Self {
        self.snapshot = Some(snapshot);
        self
    }
}

/// Processes deliveries of one payload type.
///
/// Handlers must be idempotent: a ticket can be delivered again after a crash or a
/// reclaim, so the same `message_id` may arrive more than once.
#[async_trait]
pub trait MessageHandler<P>: Send + Sync
where
    P: MessagePayload,
{
    async fn handle(&self, envelope: MessageEnvelope<P>) -> HandlerResult;
}
