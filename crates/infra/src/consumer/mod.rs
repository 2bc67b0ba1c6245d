//! Polling consumers for subscriber and job queues.

mod worker;

use std::time::Duration;

use busline_core::{BackoffPolicy, TicketId, TicketState};

use crate::config::BusConfig;

pub use worker::ConsumerWorker;

/// Consumer loop configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerConfig {
    /// Name for logging
    pub name: String,
    /// Sleep after a poll that found nothing
    pub poll_interval: Duration,
    /// How often a running handler's claim is refreshed
    pub heartbeat_interval: Duration,
    /// Sleep after a poll that failed with a retryable store error
    pub error_backoff: Duration,
    /// States a poll may pick up besides stale in-progress claims
    pub eligible: Vec<TicketState>,
    pub backoff: BackoffPolicy,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            name: "consumer".to_string(),
            poll_interval: Duration::from_millis(500),
            heartbeat_interval: Duration::from_secs(5),
            error_backoff: Duration::from_secs(5),
            eligible: TicketState::DEFAULT_ELIGIBLE.to_vec(),
            backoff: BackoffPolicy::default(),
        }
    }
}

impl WorkerConfig {
    /// Intervals taken from the process configuration.
    pub fn from_bus(config: &BusConfig) -> Self {
        Self {
            poll_interval: config.poll_interval,
            heartbeat_interval: config.heartbeat_interval,
            ..Default::default()
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_eligible(mut self, eligible: &[TicketState]) -> Self {
        self.eligible = eligible.to_vec();
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn with_heartbeat_interval(mut self, heartbeat_interval: Duration) -> Self {
        self.heartbeat_interval = heartbeat_interval;
        self
    }
}

/// What a single poll did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome {
    /// A ticket was claimed and its handler ran.
    Processed {
        ticket: TicketId,
        /// State the result commit asked for.
        state: TicketState,
        /// False when the ticket was reclaimed before the result could be written.
        committed: bool,
    },
    Empty,
    /// Another instance won the claim race.
    Lost { ticket: TicketId },
}

/// Worker runtime statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct WorkerStats {
    pub polls: u64,
    pub empty_polls: u64,
    pub claims_lost: u64,
    pub processed: u64,
    pub completed: u64,
    pub failed: u64,
    pub suspended: u64,
    pub deferred: u64,
    pub commits_lost: u64,
}

impl WorkerStats {
    fn record(&mut self, outcome: &PollOutcome) {
        self.polls += 1;
        match outcome {
            PollOutcome::Empty => self.empty_polls += 1,
            PollOutcome::Lost { .. } => self.claims_lost += 1,
            PollOutcome::Processed {
                state, committed, ..
            } => {
                self.processed += 1;
                if !committed {
                    self.commits_lost += 1;
                    return;
                }
                match state {
                    TicketState::Completed => self.completed += 1,
                    TicketState::Failed => self.failed += 1,
                    TicketState::Suspended => self.suspended += 1,
                    TicketState::Delayed => self.deferred += 1,
                    _ => {}
                }
            }
        }
    }
}
