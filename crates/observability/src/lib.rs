//! Tracing setup and correlation context shared by every bus process.

/// Initialize process-wide tracing.
///
/// This is safe to call multiple times; subsequent calls become no-ops.
pub fn init() {
    tracing::init();
}

pub mod correlation;

/// Tracing subscriber configuration.
pub mod tracing;

pub use correlation::{CorrelationProvider, NoCorrelation, ScopedCorrelation, StaticCorrelation};
