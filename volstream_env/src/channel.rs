//! Channel-backed production implementations of the feed and sink traits.

use crate::error::EnvError;
use crate::feed::{DecisionSink, UpdateFeed};
use crate::types::{DecisionEnvelope, TrackingUpdate};
use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};

/// Producer side of a [`ChannelFeed`], cloned into each collaborator.
#[derive(Debug, Clone)]
pub struct FeedHandle {
    tx: mpsc::UnboundedSender<TrackingUpdate>,
}

impl FeedHandle {
    /// Queues an update for the control loop.
    pub fn send(&self, update: TrackingUpdate) -> Result<(), EnvError> {
        self.tx.send(update).map_err(|_| EnvError::FeedClosed)
    }
}

/// Tracking feed backed by an unbounded tokio channel.
pub struct ChannelFeed {
    rx: Mutex<mpsc::UnboundedReceiver<TrackingUpdate>>,
}

impl ChannelFeed {
    /// Creates a feed and the handle used to push updates into it.
    pub fn new() -> (FeedHandle, Self) {
        let (tx, rx) = mpsc::unbounded_channel();
        (FeedHandle { tx }, Self { rx: Mutex::new(rx) })
    }
}

#[async_trait]
impl UpdateFeed for ChannelFeed {
    async fn recv(&self) -> Option<TrackingUpdate> {
        self.rx.lock().await.recv().await
    }

    fn try_recv(&self) -> Option<TrackingUpdate> {
        // A concurrent recv() holds the lock; nothing is lost by skipping.
        let mut rx = self.rx.try_lock().ok()?;
        rx.try_recv().ok()
    }
}

/// Decision sink forwarding envelopes into a tokio channel.
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<DecisionEnvelope>,
}

impl ChannelSink {
    /// Creates a sink and the receiver the encoder side reads from.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<DecisionEnvelope>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

#[async_trait]
impl DecisionSink for ChannelSink {
    async fn publish(&self, envelope: DecisionEnvelope) -> Result<(), EnvError> {
        self.tx
            .send(envelope)
            .map_err(|_| EnvError::sink("decision receiver dropped"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{BandwidthUpdate, ViewerId};

    fn bandwidth(mbps: f64) -> TrackingUpdate {
        TrackingUpdate::Bandwidth(BandwidthUpdate {
            viewer: ViewerId::from_seed(1),
            available_mbps: mbps,
        })
    }

    #[tokio::test]
    async fn test_channel_feed_delivers_in_order() {
        let (handle, feed) = ChannelFeed::new();
        handle.send(bandwidth(10.0)).unwrap();
        handle.send(bandwidth(20.0)).unwrap();

        match feed.recv().await {
            Some(TrackingUpdate::Bandwidth(b)) => assert_eq!(b.available_mbps, 10.0),
            other => panic!("unexpected update: {:?}", other),
        }
        match feed.try_recv() {
            Some(TrackingUpdate::Bandwidth(b)) => assert_eq!(b.available_mbps, 20.0),
            other => panic!("unexpected update: {:?}", other),
        }
        assert!(feed.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_channel_feed_closes_when_handles_drop() {
        let (handle, feed) = ChannelFeed::new();
        drop(handle);
        assert!(feed.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_channel_sink_reports_dropped_receiver() {
        let (sink, rx) = ChannelSink::new();
        drop(rx);
        let result = sink.publish(DecisionEnvelope::new(vec![1, 2, 3], 0, 1)).await;
        assert!(matches!(result, Err(EnvError::SinkError(_))));
    }
}
