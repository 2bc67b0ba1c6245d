//! Domain error model.

use thiserror::Error;

use crate::state::TicketState;

/// Result type used across the domain layer.
pub type DomainResult<T> = Result<T, DomainError>;

/// Domain-level error.
///
/// Keep this focused on deterministic failures (validation, state machine rules,
/// encoding). Storage concerns belong to the infra crate.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// A value failed validation (e.g. malformed input).
    #[error("validation failed: {0}")]
    Validation(String),

    /// A delivery ticket was asked to move along an edge the state machine does not have.
    #[error("invalid ticket transition: {from:?} -> {to:?}")]
    InvalidTransition { from: TicketState, to: TicketState },

    /// An identifier was invalid (e.g. parse failure).
    #[error("invalid identifier: {0}")]
    InvalidId(String),

    /// A persisted state code does not map to a known state.
    #[error("unknown {kind} code: {code}")]
    UnknownStateCode { kind: &'static str, code: i16 },
}

impl DomainError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn invalid_id(msg: impl Into<String>) -> Self {
        Self::InvalidId(msg.into())
    }

    pub fn invalid_transition(from: TicketState, to: TicketState) -> Self {
        Self::InvalidTransition { from, to }
    }
}
