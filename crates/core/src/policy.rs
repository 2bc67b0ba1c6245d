//! Delivery and retry policies.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Backoff strategy for re-delivering a failed ticket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Fixed delay between retries
    Fixed,
    /// Exponential backoff: base * 2^(retry - 1)
    #[default]
    Exponential,
    /// Linear backoff: base * retry
    Linear,
}

/// How long a failed ticket waits before it becomes eligible again.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackoffPolicy {
    /// Base delay between retries
    pub base_delay: Duration,
    /// Maximum delay cap
    pub max_delay: Duration,
    pub strategy: BackoffStrategy,
    /// Jitter factor (0.0-1.0), applied deterministically per retry number
    pub jitter: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(60),
            strategy: BackoffStrategy::Exponential,
            jitter: 0.1,
        }
    }
}

impl BackoffPolicy {
    /// Failed tickets become eligible again immediately.
    pub fn none() -> Self {
        Self::fixed(Duration::ZERO)
    }

    pub fn fixed(delay: Duration) -> Self {
        Self {
            base_delay: delay,
            max_delay: delay,
            strategy: BackoffStrategy::Fixed,
            jitter: 0.0,
        }
    }

    pub fn exponential(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            base_delay,
            max_delay,
            strategy: BackoffStrategy::Exponential,
            jitter: 0.1,
        }
    }

    /// Delay before retry number `retry` (1-indexed) becomes eligible.
    pub fn delay_for_retry(&self, retry: u32) -> Duration {
        if retry == 0 {
            return Duration::ZERO;
        }

        let base_ms = self.base_delay.as_millis() as f64;
        let max_ms = self.max_delay.as_millis() as f64;

        let delay_ms = match self.strategy {
            BackoffStrategy::Fixed => base_ms,
            BackoffStrategy::Exponential => {
                let exp = 2_f64.powi((retry - 1).min(30) as i32);
                (base_ms * exp).min(max_ms)
            }
            BackoffStrategy::Linear => (base_ms * retry as f64).min(max_ms),
        };

        let jitter_range = delay_ms * self.jitter;
        let jitter = if jitter_range > 0.0 {
            let pseudo_random = ((retry as f64 * 17.0) % 100.0) / 100.0;
            jitter_range * (pseudo_random - 0.5) * 2.0
        } else {
            0.0
        };

        Duration::from_millis((delay_ms + jitter).max(0.0) as u64)
    }
}

/// Per-consumer delivery settings stored on the subscriber/job catalog row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryPolicy {
    /// Process tickets strictly in publish order (head-of-line blocking).
    pub fifo: bool,
    /// Age after which an in-progress ticket without a heartbeat may be reclaimed.
    pub processing_timeout: Duration,
    /// Number of failed attempts after which a ticket is suspended. `None` retries forever.
    pub max_retry: Option<u32>,
}

impl Default for DeliveryPolicy {
    fn default() -> Self {
        Self {
            fifo: false,
            processing_timeout: Duration::from_secs(30),
            max_retry: Some(5),
        }
    }
}

impl DeliveryPolicy {
    pub fn fifo(processing_timeout: Duration) -> Self {
        Self {
            fifo: true,
            processing_timeout,
            ..Default::default()
        }
    }

    pub fn non_fifo(processing_timeout: Duration) -> Self {
        Self {
            fifo: false,
            processing_timeout,
            ..Default::default()
        }
    }

    pub fn with_max_retry(mut self, max_retry: Option<u32>) -> Self {
        self.max_retry = max_retry;
        self
    }

    /// True once `retry_count` failures have used up the retry budget.
    pub fn retries_exhausted(&self, retry_count: u32) -> bool {
        self.max_retry.is_some_and(|max| retry_count >= max)
    }
}
