//! Core environment context trait for the VolStream control loop.

use async_trait::async_trait;
use std::future::Future;
use std::time::{Duration, SystemTime};

/// The central interface for environment interaction.
///
/// Abstracts the clock and task spawning so the control loop can run
/// against tokio in production or a virtual clock in simulation.
///
/// # Implementations
///
/// - **Production**: `TokioContext` - wraps `tokio::time`
/// - **Simulation**: `SimContext` (volstream_sim) - manually advanced clock
#[async_trait]
pub trait StreamContext: Send + Sync + 'static {
    /// Returns the monotonic time since context creation.
    ///
    /// Drives the position-history recording interval and cycle timing.
    fn now(&self) -> Duration;

    /// Returns the wall-clock time used to stamp published decisions.
    fn system_time(&self) -> SystemTime;

    /// Suspends execution for the given duration.
    ///
    /// In production: wraps `tokio::time::sleep`
    /// In simulation: advances the virtual clock
    async fn sleep(&self, duration: Duration);

    /// Spawns a background task.
    fn spawn<F>(&self, name: &str, future: F)
    where
        F: Future<Output = ()> + Send + 'static;

    /// Returns the context's seed (0 when not seeded).
    fn seed(&self) -> u64;

    /// Convenience: monotonic time in seconds.
    fn now_secs(&self) -> f64 {
        self.now().as_secs_f64()
    }
}
