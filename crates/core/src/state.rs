//! Delivery ticket state machine and component lifecycle states.
//!
//! ```text
//!            claim                 success
//!   Ready ────────────► InProgress ────────► Completed (terminal)
//!                        │  ▲  │ │
//!          failure,      │  │  │ └─ defer ──────► Delayed ──┐
//!          retries left  ▼  │  │                            │
//!                    Failed ┘  └─ failure, budget spent ──► Suspended (terminal)
//!                       (re-claim)          or rejection
//! ```
//!
//! An in-progress ticket whose heartbeat is older than the processing timeout can be
//! claimed again by another instance (`InProgress -> InProgress`).

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{DomainError, DomainResult};
use crate::policy::{BackoffPolicy, DeliveryPolicy};

/// Lifecycle state of a delivery ticket, persisted as a `SMALLINT` code.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TicketState {
    Ready,
    InProgress,
    Completed,
    /// Processing failed; eligible again once `delayed_to_utc` has passed.
    Failed,
    /// Deferred by the consumer until `delayed_to_utc`; does not consume a retry.
    Delayed,
    /// Retry budget spent or rejected outright; never polled again.
    Suspended,
}

impl TicketState {
    pub const ALL: [TicketState; 6] = [
        TicketState::Ready,
        TicketState::InProgress,
        TicketState::Completed,
        TicketState::Failed,
        TicketState::Delayed,
        TicketState::Suspended,
    ];

    /// States a consumer polls for unless it asks for something narrower.
    pub const DEFAULT_ELIGIBLE: [TicketState; 3] =
        [TicketState::Ready, TicketState::Failed, TicketState::Delayed];

    pub fn code(self) -> i16 {
        match self {
            TicketState::Ready => 1,
            TicketState::InProgress => 2,
            TicketState::Completed => 3,
            TicketState::Failed => 4,
            TicketState::Delayed => 5,
            TicketState::Suspended => 6,
        }
    }

    pub fn from_code(code: i16) -> DomainResult<Self> {
        match code {
            1 => Ok(TicketState::Ready),
            2 => Ok(TicketState::InProgress),
            3 => Ok(TicketState::Completed),
            4 => Ok(TicketState::Failed),
            5 => Ok(TicketState::Delayed),
            6 => Ok(TicketState::Suspended),
            _ => Err(DomainError::UnknownStateCode {
                kind: "ticket state",
                code,
            }),
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, TicketState::Completed | TicketState::Suspended)
    }

    /// Whether the state machine has an edge `self -> next`.
    pub fn can_transition_to(self, next: TicketState) -> bool {
        use TicketState::*;
        match (self, next) {
            (Ready | Failed | Delayed, InProgress) => true,
            (InProgress, InProgress | Completed | Failed | Delayed | Suspended) => true,
            _ => false,
        }
    }

    pub fn ensure_transition(self, next: TicketState) -> DomainResult<()> {
        if self.can_transition_to(next) {
            Ok(())
        } else {
            Err(DomainError::invalid_transition(self, next))
        }
    }
}

/// What a consumer reports after processing a claimed ticket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Completed,
    /// Transient failure: counts against the retry budget.
    Failed { reason: String },
    /// Not ready to process yet: park the ticket until `until` without counting a retry.
    Deferred { until: DateTime<Utc> },
    /// Permanent failure: suspend regardless of the remaining retry budget.
    Rejected { reason: String },
}

impl DeliveryOutcome {
    pub fn failed(reason: impl Into<String>) -> Self {
        Self::Failed {
            reason: reason.into(),
        }
    }

    pub fn rejected(reason: impl Into<String>) -> Self {
        Self::Rejected {
            reason: reason.into(),
        }
    }
}

/// The columns a result commit writes back to a ticket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TicketUpdate {
    pub state: TicketState,
    pub retry_count: u32,
    pub delayed_to_utc: Option<DateTime<Utc>>,
    /// Replacement progress blob; `None` keeps the stored one.
    pub snapshot: Option<Vec<u8>>,
}

impl TicketUpdate {
    pub fn with_snapshot(mut self, snapshot: Vec<u8>) -> Self {
        self.snapshot = Some(snapshot);
        self
    }
}

/// Turn a processing outcome into the next persisted ticket state.
pub fn resolve_outcome(
    policy: &DeliveryPolicy,
    backoff: &BackoffPolicy,
    retry_count: u32,
    outcome: &DeliveryOutcome,
    now: DateTime<Utc>,
) -> TicketUpdate {
    match outcome {
        DeliveryOutcome::Completed => TicketUpdate {
            state: TicketState::Completed,
            retry_count,
            delayed_to_utc: None,
            snapshot: None,
        },
        DeliveryOutcome::Failed { .. } => {
            let retry_count = retry_count.saturating_add(1);
            if policy.retries_exhausted(retry_count) {
                TicketUpdate {
                    state: TicketState::Suspended,
                    retry_count,
                    delayed_to_utc: None,
                    snapshot: None,
                }
            } else {
                let delay = backoff.delay_for_retry(retry_count);
                TicketUpdate {
                    state: TicketState::Failed,
                    retry_count,
                    delayed_to_utc: delay_until(now, delay),
                    snapshot: None,
                }
            }
        }
        DeliveryOutcome::Deferred { until } => TicketUpdate {
            state: TicketState::Delayed,
            retry_count,
            delayed_to_utc: Some(*until),
            snapshot: None,
        },
        DeliveryOutcome::Rejected { .. } => TicketUpdate {
            state: TicketState::Suspended,
            retry_count,
            delayed_to_utc: None,
            snapshot: None,
        },
    }
}

fn delay_until(now: DateTime<Utc>, delay: Duration) -> Option<DateTime<Utc>> {
    if delay.is_zero() {
        return None;
    }
    chrono::Duration::from_std(delay)
        .ok()
        .and_then(|d| now.checked_add_signed(d))
}

/// Lifecycle state of a publisher/subscriber/job instance.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComponentState {
    Starting,
    Running,
    Stopping,
    Stopped,
    Faulted,
}

/// Lifecycle state of a host runtime (one bus process).
pub type HostState = ComponentState;

impl ComponentState {
    pub fn code(self) -> i16 {
        match self {
            ComponentState::Starting => 1,
            ComponentState::Running => 2,
            ComponentState::Stopping => 3,
            ComponentState::Stopped => 4,
            ComponentState::Faulted => 5,
        }
    }

    pub fn from_code(code: i16) -> DomainResult<Self> {
        match code {
            1 => Ok(ComponentState::Starting),
            2 => Ok(ComponentState::Running),
            3 => Ok(ComponentState::Stopping),
            4 => Ok(ComponentState::Stopped),
            5 => Ok(ComponentState::Faulted),
            _ => Err(DomainError::UnknownStateCode {
                kind: "component state",
                code,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn now() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2024-05-01T12:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    #[test]
    fn state_codes_round_trip() {
        for state in TicketState::ALL {
            assert_eq!(TicketState::from_code(state.code()).unwrap(), state);
        }
        assert!(TicketState::from_code(0).is_err());
        assert!(ComponentState::from_code(9).is_err());
    }

    #[test]
    fn in_progress_is_code_two() {
        assert_eq!(TicketState::InProgress.code(), 2);
    }

    #[test]
    fn terminal_states_have_no_outgoing_edges() {
        for terminal in [TicketState::Completed, TicketState::Suspended] {
            for next in TicketState::ALL {
                assert!(!terminal.can_transition_to(next));
            }
        }
        assert!(TicketState::Ready.ensure_transition(TicketState::Completed).is_err());
        assert!(TicketState::InProgress.can_transition_to(TicketState::InProgress));
    }

    #[test]
    fn failure_with_budget_left_backs_off() {
        let policy = DeliveryPolicy::default().with_max_retry(Some(3));
        let backoff = BackoffPolicy::fixed(Duration::from_secs(10));

        let update = resolve_outcome(&policy, &backoff, 0, &DeliveryOutcome::failed("boom"), now());

        assert_eq!(update.state, TicketState::Failed);
        assert_eq!(update.retry_count, 1);
        assert_eq!(update.delayed_to_utc, Some(now() + chrono::Duration::seconds(10)));
    }

    #[test]
    fn failure_that_spends_budget_suspends() {
        let policy = DeliveryPolicy::default().with_max_retry(Some(3));
        let update = resolve_outcome(
            &policy,
            &BackoffPolicy::none(),
            2,
            &DeliveryOutcome::failed("boom"),
            now(),
        );

        assert_eq!(update.state, TicketState::Suspended);
        assert_eq!(update.retry_count, 3);
        assert!(update.delayed_to_utc.is_none());
    }

    #[test]
    fn zero_backoff_leaves_ticket_undelayed() {
        let update = resolve_outcome(
            &DeliveryPolicy::default(),
            &BackoffPolicy::none(),
            0,
            &DeliveryOutcome::failed("boom"),
            now(),
        );
        assert_eq!(update.state, TicketState::Failed);
        assert!(update.delayed_to_utc.is_none());
    }

    #[test]
    fn deferral_keeps_retry_count() {
        let until = now() + chrono::Duration::minutes(5);
        let update = resolve_outcome(
            &DeliveryPolicy::default(),
            &BackoffPolicy::default(),
            2,
            &DeliveryOutcome::Deferred { until },
            now(),
        );
        assert_eq!(update.state, TicketState::Delayed);
        assert_eq!(update.retry_count, 2);
        assert_eq!(update.delayed_to_utc, Some(until));
    }

    #[test]
    fn rejection_suspends_immediately() {
        let update = resolve_outcome(
            &DeliveryPolicy::default().with_max_retry(None),
            &BackoffPolicy::default(),
            0,
            &DeliveryOutcome::rejected("bad payload"),
            now(),
        );
        assert_eq!(update.state, TicketState::Suspended);
        assert_eq!(update.retry_count, 0);
    }
}
