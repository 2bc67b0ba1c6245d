//! Correlation ids attached to audit rows and log lines.
//!
//! A correlation id ties together everything done on behalf of one unit of work
//! (a published message, a processed delivery) across processes. Where it comes
//! from is up to the host application; the bus only asks a [`CorrelationProvider`].

use std::sync::Arc;

use uuid::Uuid;

/// Source of the ambient correlation id.
pub trait CorrelationProvider: Send + Sync + core::fmt::Debug {
    fn correlation_id(&self) -> Option<String>;
}

impl<P> CorrelationProvider for Arc<P>
where
    P: CorrelationProvider + ?Sized,
{
    fn correlation_id(&self) -> Option<String> {
        (**self).correlation_id()
    }
}

/// Never supplies an id.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoCorrelation;

impl CorrelationProvider for NoCorrelation {
    fn correlation_id(&self) -> Option<String> {
        None
    }
}

/// Always supplies the same id (e.g. one per process run).
#[derive(Debug, Clone)]
pub struct StaticCorrelation(String);

impl StaticCorrelation {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn random() -> Self {
        Self(Uuid::now_v7().to_string())
    }
}

impl CorrelationProvider for StaticCorrelation {
    fn correlation_id(&self) -> Option<String> {
        Some(self.0.clone())
    }
}

tokio::task_local! {
    static CURRENT: String;
}

/// Task-scoped ids: whatever [`ScopedCorrelation::scope`] set for the running task.
#[derive(Debug, Clone, Copy, Default)]
pub struct ScopedCorrelation;

impl ScopedCorrelation {
    /// Run `fut` with `id` as the current correlation id.
    pub async fn scope<F>(id: impl Into<String>, fut: F) -> F::Output
    where
        F: Future,
    {
        CURRENT.scope(id.into(), fut).await
    }
}

impl CorrelationProvider for ScopedCorrelation {
    fn correlation_id(&self) -> Option<String> {
        CURRENT.try_with(Clone::clone).ok()
    }
}
