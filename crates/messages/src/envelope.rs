use chrono::{DateTime, Utc};

use busline_core::{MessageId, TicketId};

/// An undecoded delivery as it comes off a claimed ticket.
///
/// This is the unit handed to the `HandlerRegistry`: the message's stored bytes
/// plus the ticket's progress metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawDelivery {
    pub ticket_id: TicketId,
    pub message_id: MessageId,
    pub message_type: String,
    pub previous_message: Option<MessageId>,
    pub created_utc: DateTime<Utc>,
    pub is_recovery: bool,
    pub data: Vec<u8>,
    /// Number of failed attempts so far.
    pub retry_count: u32,
    /// Consumer-opaque progress blob saved by an earlier attempt.
    pub snapshot: Option<Vec<u8>>,
}

/// A decoded delivery handed to a typed handler.
///
/// Notes:
/// - The same message may be delivered more than once (at-least-once); use
///   `message_id` for idempotency.
/// - `snapshot` carries whatever a previous attempt of this ticket saved.
#[derive(Debug, Clone, PartialEq)]
pub struct MessageEnvelope<P> {
    ticket_id: TicketId,
    message_id: MessageId,
    previous_message: Option<MessageId>,
    created_utc: DateTime<Utc>,
    is_recovery: bool,
    retry_count: u32,
    snapshot: Option<Vec<u8>>,
    payload: P,
}

impl<P> MessageEnvelope<P> {
    pub fn from_raw(raw: RawDelivery, payload: P) -> Self {
        Self {
            ticket_id: raw.ticket_id,
            message_id: raw.message_id,
            previous_message: raw.previous_message,
            created_utc: raw.created_utc,
            is_recovery: raw.is_recovery,
            retry_count: raw.retry_count,
            snapshot: raw.snapshot,
            payload,
        }
    }

    pub fn ticket_id(&self) -> TicketId {
        self.ticket_id
    }

    pub fn message_id(&self) -> MessageId {
        self.message_id
    }

    pub fn previous_message(&self) -> Option<MessageId> {
        self.previous_message
    }

    pub fn created_utc(&self) -> DateTime<Utc> {
        self.created_utc
    }

    pub fn is_recovery(&self) -> bool {
        self.is_recovery
    }

    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    pub fn snapshot(&self) -> Option<&[u8]> {
        self.snapshot.as_deref()
    }

    pub fn payload(&self) -> &P {
        &self.payload
    }

    pub fn into_payload(self) -> P {
        self.payload
    }
}
