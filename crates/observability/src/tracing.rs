//! Tracing subscriber initialization.
//!
//! Bus processes log JSON lines; the filter comes from `RUST_LOG` and falls back to
//! a caller-supplied default.

use tracing_subscriber::EnvFilter;

/// Filter used when `RUST_LOG` is unset or invalid.
pub const DEFAULT_FILTER: &str = "info";

/// Install the JSON subscriber with [`DEFAULT_FILTER`].
pub fn init() {
    init_with(DEFAULT_FILTER);
}

/// Install the JSON subscriber, using `default_filter` unless `RUST_LOG` is set.
///
/// Returns whether this call installed the subscriber; later calls are no-ops.
pub fn init_with(default_filter: &str) -> bool {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .json()
        .with_current_span(true)
        .with_timer(tracing_subscriber::fmt::time::SystemTime)
        .with_target(false)
        .try_init()
        .is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_init_is_a_no_op() {
        init();
        assert!(!init_with("debug"));
    }
}
