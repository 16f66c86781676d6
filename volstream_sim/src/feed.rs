//! In-memory feed and sink used by the harness.

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use volstream_env::{DecisionEnvelope, DecisionSink, EnvError, TrackingUpdate, UpdateFeed};

/// Queue the oracle fills once per tick.
///
/// `recv` never waits: an empty queue reads as a closed feed so a loop
/// driven by it stops once the scenario has nothing more to say.
#[derive(Default)]
pub struct SimFeed {
    queue: Mutex<VecDeque<TrackingUpdate>>,
}

impl SimFeed {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_all(&self, updates: impl IntoIterator<Item = TrackingUpdate>) {
        if let Ok(mut queue) = self.queue.lock() {
            queue.extend(updates);
        }
    }

    pub fn len(&self) -> usize {
        self.queue.lock().map(|q| q.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl UpdateFeed for SimFeed {
    async fn recv(&self) -> Option<TrackingUpdate> {
        self.try_recv()
    }

    fn try_recv(&self) -> Option<TrackingUpdate> {
        self.queue.lock().ok()?.pop_front()
    }
}

/// Sink keeping every published envelope.
#[derive(Default)]
pub struct RecordingSink {
    envelopes: Mutex<Vec<DecisionEnvelope>>,

    /// Reject every publish (transport outage)
    failing: AtomicBool,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn len(&self) -> usize {
        self.envelopes.lock().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn total_bytes(&self) -> usize {
        self.envelopes
            .lock()
            .map(|e| e.iter().map(DecisionEnvelope::size).sum())
            .unwrap_or(0)
    }

    pub fn last(&self) -> Option<DecisionEnvelope> {
        self.envelopes.lock().ok()?.last().cloned()
    }

    /// Versions in publication order.
    pub fn versions(&self) -> Vec<u64> {
        self.envelopes
            .lock()
            .map(|e| e.iter().map(|env| env.version).collect())
            .unwrap_or_default()
    }
}

#[async_trait]
impl DecisionSink for RecordingSink {
    async fn publish(&self, envelope: DecisionEnvelope) -> Result<(), EnvError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(EnvError::sink("transport unavailable"));
        }
        self.envelopes
            .lock()
            .map_err(|_| EnvError::sink("recording poisoned"))?
            .push(envelope);
        Ok(())
    }
}
