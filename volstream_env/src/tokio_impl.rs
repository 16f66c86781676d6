//! Tokio-backed [`StreamContext`] for live deployments.
//!
//! Wall-clock readings are derived from the monotonic clock anchored at
//! construction, so decision timestamps never step backwards when the
//! system clock is adjusted mid-session.

use crate::StreamContext;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};
use tracing::{debug, info_span, Instrument};

pub struct TokioContext {
    started: Instant,

    /// Wall-clock time at `started`
    epoch: SystemTime,
}

impl TokioContext {
    pub fn new() -> Self {
        Self::anchored_at(SystemTime::now())
    }

    /// Context whose wall clock reads `epoch` at construction.
    pub fn anchored_at(epoch: SystemTime) -> Self {
        Self {
            started: Instant::now(),
            epoch,
        }
    }

    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }
}

impl Default for TokioContext {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StreamContext for TokioContext {
    fn now(&self) -> Duration {
        self.started.elapsed()
    }

    fn system_time(&self) -> SystemTime {
        self.epoch + self.started.elapsed()
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }

    /// Runs the task inside a `task` span tagged with its name and the
    /// session uptime at spawn.
    fn spawn<F>(&self, name: &str, future: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let uptime_ms = self.now().as_millis() as u64;
        let span = info_span!("task", task = %name, spawned_at_ms = uptime_ms);
        let label = name.to_string();
        tokio::spawn(
            async move {
                future.await;
                debug!("Task {} finished", label);
            }
            .instrument(span),
        );
    }

    /// Live sessions are not seeded.
    fn seed(&self) -> u64 {
        0
    }
}
