//! Wall-clock context for real deployments.

use crate::PendulumContext;
use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::Instrument;

/// Context backed by the Tokio runtime.
///
/// Reads `tokio::time::Instant`, so a runtime started with a paused clock
/// drives `now()` together with the timers. Every spawned task runs inside a
/// span carrying its name and the context label, which keeps the logs of
/// several instances sharing one process apart.
pub struct TokioContext {
    started: Instant,
    label: Option<String>,
}

impl TokioContext {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
            label: None,
        }
    }

    /// Context whose tasks are tagged with `label` in their spans.
    pub fn labeled(label: impl Into<String>) -> Self {
        Self {
            label: Some(label.into()),
            ..Self::new()
        }
    }

    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    pub fn label(&self) -> Option<&str> {
        self.label.as_deref()
    }
}

impl Default for TokioContext {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PendulumContext for TokioContext {
    fn now(&self) -> Duration {
        self.started.elapsed()
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }

    fn spawn<F>(&self, name: &str, future: F) -> JoinHandle<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let span = tracing::debug_span!("task", task = name, label = self.label());
        tokio::spawn(future.instrument(span))
    }

    /// Wall-clock runs have no seed.
    fn seed(&self) -> u64 {
        0
    }
}
