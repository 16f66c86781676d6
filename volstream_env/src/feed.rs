//! Input/output abstractions between the engine and its collaborators.

use crate::error::EnvError;
use crate::types::{DecisionEnvelope, TrackingUpdate};
use async_trait::async_trait;

/// Source of tracking updates (object motion, viewer cameras, bandwidth).
///
/// # Implementations
///
/// - **Production**: `ChannelFeed` fed by the tracking/camera/transport layers
/// - **Simulation**: a queue filled by the seeded oracle
///
/// # Update Flow
///
/// ```text
/// Tracking layer            Feed                  ControlLoop
///   |                        |                        |
///   |-- EntityUpdate ------->|                        |
///   |                        |-- recv() ------------->|-- Scene::apply()
///   |                        |                        |
/// ```
#[async_trait]
pub trait UpdateFeed: Send + Sync + 'static {
    /// Receives the next update.
    ///
    /// # Returns
    /// * `Some(update)` - An update arrived
    /// * `None` - The feed was closed (shutdown)
    async fn recv(&self) -> Option<TrackingUpdate>;

    /// Returns an already-queued update without waiting.
    fn try_recv(&self) -> Option<TrackingUpdate>;
}

/// Consumer of published decisions (encoder/transport collaborator).
#[async_trait]
pub trait DecisionSink: Send + Sync + 'static {
    /// Hands one serialized decision batch to the collaborator.
    ///
    /// # Returns
    /// * `Ok(())` - Envelope accepted
    /// * `Err(EnvError::SinkError)` - Collaborator unavailable
    async fn publish(&self, envelope: DecisionEnvelope) -> Result<(), EnvError>;
}
