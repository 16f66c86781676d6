//! Control Loop - Drives clustering cycles from the tracking feed.
//!
//! The loop owns the live [`Scene`] and the shared [`ClusterManager`]:
//!
//! 1. **Ingest**: updates from the [`UpdateFeed`] are applied to the scene as
//!    they arrive
//! 2. **Snapshot**: every `cycle_every_ticks` ticks the scene is copied
//! 3. **Cycle**: the copy is clustered on a blocking worker holding the
//!    manager lock
//! 4. **Publish**: unless superseded while running, the snapshot is swapped
//!    into a `watch` channel and its decisions are sent to the
//!    [`DecisionSink`]
//!
//! # Usage
//!
//! ```ignore
//! use volstream_core::{ControlLoop, EngineConfig};
//! use volstream_env::{ChannelFeed, ChannelSink, TokioContext};
//!
//! let (handle, feed) = ChannelFeed::new();
//! let (sink, decisions) = ChannelSink::new();
//! let mut control = ControlLoop::new(TokioContext::shared(), Arc::new(feed), Arc::new(sink), &EngineConfig::default());
//! let snapshots = control.subscribe();
//!
//! control.run(None).await?;
//! ```

use crate::config::EngineConfig;
use crate::manager::ClusterManager;
use crate::metrics::MetricsSummary;
use crate::scene::Scene;
use crate::snapshot::ClusterSnapshot;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, UNIX_EPOCH};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use volstream_env::{DecisionSink, EnvError, StreamContext, TrackingUpdate, UpdateFeed};

/// Cadence of the control loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlConfig {
    /// Tick rate in Hz (default: 30)
    pub tick_rate_hz: u32,

    /// Ticks between two cycles (default: 10)
    pub cycle_every_ticks: u32,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            tick_rate_hz: 30,
            cycle_every_ticks: 10,
        }
    }
}

impl ControlConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.tick_rate_hz.max(1) as f64)
    }
}

/// A cycle running on the blocking pool.
#[derive(Debug)]
pub struct PendingCycle {
    generation: u64,
    handle: JoinHandle<Result<Arc<ClusterSnapshot>, ControlError>>,
}

impl PendingCycle {
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

/// Periodic cycle driver.
///
/// Generic over the context, feed and sink so the same loop runs against
/// tokio channels in production and the seeded harness in simulation.
pub struct ControlLoop<Ctx, Feed, Sink>
where
    Ctx: StreamContext,
    Feed: UpdateFeed,
    Sink: DecisionSink,
{
    context: Arc<Ctx>,
    feed: Arc<Feed>,
    sink: Arc<Sink>,
    config: ControlConfig,
    scene: Scene,
    manager: Arc<Mutex<ClusterManager>>,

    /// Bumped whenever a running cycle must not be published
    generation: Arc<AtomicU64>,

    publisher: watch::Sender<Arc<ClusterSnapshot>>,
    pending: Option<PendingCycle>,
    tick_count: u64,
    published: u64,
    discarded: u64,
}

impl<Ctx, Feed, Sink> ControlLoop<Ctx, Feed, Sink>
where
    Ctx: StreamContext,
    Feed: UpdateFeed,
    Sink: DecisionSink,
{
    pub fn new(context: Arc<Ctx>, feed: Arc<Feed>, sink: Arc<Sink>, config: &EngineConfig) -> Self {
        let manager = ClusterManager::from_config(config);
        let (publisher, _) = watch::channel(manager.current());
        Self {
            context,
            feed,
            sink,
            config: config.control,
            scene: Scene::new(config.entity.clone()),
            manager: Arc::new(Mutex::new(manager)),
            generation: Arc::new(AtomicU64::new(0)),
            publisher,
            pending: None,
            tick_count: 0,
            published: 0,
            discarded: 0,
        }
    }

    /// Receiver that observes every published snapshot.
    pub fn subscribe(&self) -> watch::Receiver<Arc<ClusterSnapshot>> {
        self.publisher.subscribe()
    }

    /// Last published snapshot.
    pub fn current(&self) -> Arc<ClusterSnapshot> {
        Arc::clone(&self.publisher.borrow())
    }

    pub fn scene(&self) -> &Scene {
        &self.scene
    }

    pub fn tick_count(&self) -> u64 {
        self.tick_count
    }

    /// Cycles published and cycles discarded as stale.
    pub fn cycle_counts(&self) -> (u64, u64) {
        (self.published, self.discarded)
    }

    pub fn metrics(&self) -> Result<MetricsSummary, ControlError> {
        let manager = self.manager.lock().map_err(|_| ControlError::ManagerPoisoned)?;
        Ok(manager.metrics().summary())
    }

    /// Applies one update at the context's current time.
    pub fn ingest(&mut self, update: TrackingUpdate) {
        let removal = matches!(
            update,
            TrackingUpdate::EntityRemoved(_) | TrackingUpdate::ViewerRemoved(_)
        );
        self.scene.apply(&update, self.context.now_secs());
        if removal {
            self.invalidate();
        }
    }

    /// Marks every running cycle as stale.
    pub fn invalidate(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
    }

    /// Applies every update already queued on the feed.
    pub fn drain_feed(&mut self) -> usize {
        let mut applied = 0;
        while let Some(update) = self.feed.try_recv() {
            self.ingest(update);
            applied += 1;
        }
        applied
    }

    /// Copies the scene and starts a cycle on the blocking pool.
    pub fn start_cycle(&self) -> PendingCycle {
        let scene = self.scene.snapshot(self.context.now_secs());
        let generation = self.generation.load(Ordering::SeqCst);
        let manager = Arc::clone(&self.manager);

        let handle = tokio::task::spawn_blocking(move || -> Result<Arc<ClusterSnapshot>, ControlError> {
            let mut manager = manager.lock().map_err(|_| ControlError::ManagerPoisoned)?;
            Ok(manager.run_cycle(&scene))
        });

        PendingCycle { generation, handle }
    }

    /// Waits for a cycle and publishes it unless it went stale. Only a
    /// published cycle becomes the manager's history.
    pub async fn finish_cycle(
        &mut self,
        pending: PendingCycle,
    ) -> Result<Option<Arc<ClusterSnapshot>>, ControlError> {
        let snapshot = pending
            .handle
            .await
            .map_err(|e| ControlError::WorkerFailed(e.to_string()))??;

        if self.generation.load(Ordering::SeqCst) != pending.generation {
            debug!("Discarding stale cycle {}", snapshot.version);
            self.discarded += 1;
            return Ok(None);
        }

        self.manager
            .lock()
            .map_err(|_| ControlError::ManagerPoisoned)?
            .commit(Arc::clone(&snapshot));
        self.publish(Arc::clone(&snapshot)).await?;
        Ok(Some(snapshot))
    }

    /// Runs one cycle to completion.
    pub async fn run_cycle(&mut self) -> Result<Option<Arc<ClusterSnapshot>>, ControlError> {
        let pending = self.start_cycle();
        self.finish_cycle(pending).await
    }

    async fn publish(&mut self, snapshot: Arc<ClusterSnapshot>) -> Result<(), ControlError> {
        self.scene.apply_labels(&snapshot);
        self.publisher.send_replace(Arc::clone(&snapshot));
        self.published += 1;

        let timestamp_ms = self
            .context
            .system_time()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        let envelope = snapshot.decisions().to_envelope(timestamp_ms)?;
        self.sink.publish(envelope).await?;
        Ok(())
    }

    /// One tick: drain the feed, collect a finished cycle and start the
    /// next one when due. Never waits on a running cycle.
    pub async fn tick(&mut self) -> Result<u64, ControlError> {
        self.drain_feed();
        self.tick_count += 1;

        if self.pending.as_ref().is_some_and(PendingCycle::is_finished) {
            if let Some(pending) = self.pending.take() {
                self.finish_cycle(pending).await?;
            }
        }

        let every = u64::from(self.config.cycle_every_ticks.max(1));
        if self.tick_count % every == 0 {
            if self.pending.is_some() {
                debug!("Tick {}: previous cycle still running", self.tick_count);
            } else {
                self.pending = Some(self.start_cycle());
            }
        }

        Ok(self.tick_count)
    }

    /// Runs until the feed closes or `max_ticks` ticks have elapsed.
    ///
    /// Sink failures are logged and the loop keeps going; worker failures
    /// end it.
    pub async fn run(&mut self, max_ticks: Option<u64>) -> Result<(), ControlError> {
        let feed = Arc::clone(&self.feed);
        let context = Arc::clone(&self.context);
        let interval = self.config.tick_interval();
        // One deadline per tick, kept across updates
        let mut next_tick = context.sleep(interval);

        info!(
            "Control loop started: {} Hz, cycle every {} ticks",
            self.config.tick_rate_hz, self.config.cycle_every_ticks
        );

        loop {
            if max_ticks.is_some_and(|max| self.tick_count >= max) {
                break;
            }

            tokio::select! {
                update = feed.recv() => match update {
                    Some(update) => self.ingest(update),
                    None => {
                        info!("Tracking feed closed after {} ticks", self.tick_count);
                        break;
                    }
                },
                _ = &mut next_tick => {
                    next_tick = context.sleep(interval);
                    match self.tick().await {
                        Ok(_) => {}
                        Err(ControlError::Env(e)) => warn!("Decision sink failed: {}", e),
                        Err(e) => return Err(e),
                    }
                }
            }
        }

        if let Some(pending) = self.pending.take() {
            match self.finish_cycle(pending).await {
                Ok(_) => {}
                Err(ControlError::Env(e)) => warn!("Decision sink failed: {}", e),
                Err(e) => return Err(e),
            }
        }

        info!(
            "Control loop stopped: {} published, {} discarded",
            self.published, self.discarded
        );
        Ok(())
    }
}

// ============================================================================
// ERRORS
// ============================================================================

/// Errors that end a cycle without publication.
#[derive(Debug, thiserror::Error)]
pub enum ControlError {
    #[error("Environment error: {0}")]
    Env(#[from] EnvError),

    #[error("Failed to encode decisions: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Cycle worker failed: {0}")]
    WorkerFailed(String),

    #[error("Cluster manager lock poisoned")]
    ManagerPoisoned,
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::DecisionBatch;
    use volstream_env::{
        ChannelFeed, ChannelSink, EntityId, EntityUpdate, FeedHandle, ProjectionParams, TokioContext,
        ViewerId, ViewerUpdate,
    };

    type TestLoop = ControlLoop<TokioContext, ChannelFeed, ChannelSink>;

    fn entity(seed: u64, x: f64) -> TrackingUpdate {
        TrackingUpdate::Entity(EntityUpdate {
            id: EntityId::from_seed(seed),
            position: [x, 0.0, 0.0],
            velocity: [0.0; 3],
            half_extents: [0.25; 3],
        })
    }

    fn viewer(seed: u64) -> TrackingUpdate {
        TrackingUpdate::Viewer(ViewerUpdate {
            id: ViewerId::from_seed(seed),
            position: [0.5, 0.0, 5.0],
            forward: [0.0, 0.0, -1.0],
            up: [0.0, 1.0, 0.0],
            projection: ProjectionParams::default(),
        })
    }

    fn setup(
        config: EngineConfig,
    ) -> (TestLoop, FeedHandle, tokio::sync::mpsc::UnboundedReceiver<volstream_env::DecisionEnvelope>) {
        let (handle, feed) = ChannelFeed::new();
        let (sink, decisions) = ChannelSink::new();
        let control = ControlLoop::new(TokioContext::shared(), Arc::new(feed), Arc::new(sink), &config);
        (control, handle, decisions)
    }

    #[test]
    fn test_control_config_default() {
        let config = ControlConfig::default();
        assert_eq!(config.tick_rate_hz, 30);
        assert_eq!(config.cycle_every_ticks, 10);
        assert_eq!(config.tick_interval(), Duration::from_secs_f64(1.0 / 30.0));
    }

    #[tokio::test]
    async fn test_cycle_publishes_snapshot_and_decisions() {
        let (mut control, handle, mut decisions) = setup(EngineConfig::default());
        let mut snapshots = control.subscribe();
        assert_eq!(snapshots.borrow().version, 0);

        handle.send(entity(1, 0.0)).unwrap();
        handle.send(entity(2, 0.5)).unwrap();
        handle.send(viewer(1)).unwrap();
        assert_eq!(control.drain_feed(), 3);

        let snapshot = control.run_cycle().await.unwrap().unwrap();
        assert_eq!(snapshot.version, 1);

        assert!(snapshots.has_changed().unwrap());
        assert_eq!(snapshots.borrow_and_update().version, 1);
        assert_eq!(control.current().version, 1);

        let envelope = decisions.recv().await.unwrap();
        assert_eq!(envelope.version, 1);
        let batch = DecisionBatch::from_envelope(&envelope).unwrap();
        assert_eq!(batch.clusters.len(), snapshot.clusters.len());

        // Labels written back to the live scene
        let labelled = control.scene().entity(&EntityId::from_seed(1)).unwrap();
        assert_eq!(labelled.cluster, snapshot.label_of(&EntityId::from_seed(1)));
        assert_eq!(control.cycle_counts(), (1, 0));
    }

    #[tokio::test]
    async fn test_stale_cycle_is_discarded() {
        let (mut control, handle, mut decisions) = setup(EngineConfig::default());
        let snapshots = control.subscribe();
        handle.send(entity(1, 0.0)).unwrap();
        handle.send(viewer(1)).unwrap();
        control.drain_feed();

        let pending = control.start_cycle();
        control.invalidate();
        let result = control.finish_cycle(pending).await.unwrap();

        assert!(result.is_none());
        assert_eq!(snapshots.borrow().version, 0);
        assert!(decisions.try_recv().is_err());
        assert_eq!(control.cycle_counts(), (0, 1));

        // The next cycle publishes normally
        assert!(control.run_cycle().await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_tick_cadence_starts_cycles() {
        let mut config = EngineConfig::default();
        config.control.cycle_every_ticks = 3;
        let (mut control, handle, mut decisions) = setup(config);
        handle.send(entity(1, 0.0)).unwrap();
        handle.send(viewer(1)).unwrap();

        for _ in 0..3 {
            control.tick().await.unwrap();
        }
        assert_eq!(control.tick_count(), 3);
        assert_eq!(control.scene().entity_count(), 1);

        // Cycle started on tick 3 is collected when the loop stops
        control.run(Some(3)).await.unwrap();
        let envelope = decisions.recv().await.unwrap();
        assert_eq!(envelope.version, 1);
    }

    #[tokio::test]
    async fn test_ticks_fire_under_a_continuous_feed() {
        let mut config = EngineConfig::default();
        config.control.cycle_every_ticks = 1;
        let (mut control, handle, _decisions) = setup(config);
        handle.send(viewer(1)).unwrap();

        // One update every 5 ms, well inside the 33 ms tick interval
        let producer = tokio::spawn(async move {
            let mut x = 0.0;
            while handle.send(entity(1, x)).is_ok() {
                x += 0.01;
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        });

        let finished = tokio::time::timeout(Duration::from_secs(2), control.run(Some(3))).await;
        producer.abort();

        assert!(matches!(finished, Ok(Ok(()))));
        assert_eq!(control.tick_count(), 3);
        assert!(control.cycle_counts().0 >= 1);
    }

    #[tokio::test]
    async fn test_discarded_cycle_is_not_history() {
        let (mut control, handle, _decisions) = setup(EngineConfig::default());
        handle.send(entity(1, 0.0)).unwrap();
        handle.send(entity(2, 0.5)).unwrap();
        handle.send(viewer(1)).unwrap();
        control.drain_feed();

        let pending = control.start_cycle();
        control.invalidate();
        assert!(control.finish_cycle(pending).await.unwrap().is_none());

        let history = control.manager.lock().unwrap().current();
        assert_eq!(history.version, 0);
        assert!(history.clusters.is_empty());

        // The published cycle is committed and skips the discarded version
        let snapshot = control.run_cycle().await.unwrap().unwrap();
        assert_eq!(snapshot.version, 2);
        assert_eq!(control.manager.lock().unwrap().current().version, 2);
    }

    #[tokio::test]
    async fn test_run_stops_when_feed_closes() {
        let (mut control, handle, _decisions) = setup(EngineConfig::default());
        handle.send(entity(1, 0.0)).unwrap();
        drop(handle);

        control.run(None).await.unwrap();
        assert_eq!(control.scene().entity_count(), 1);
    }

    #[tokio::test]
    async fn test_sink_failure_after_swap() {
        let (mut control, handle, decisions) = setup(EngineConfig::default());
        drop(decisions);
        handle.send(entity(1, 0.0)).unwrap();
        control.drain_feed();

        assert!(matches!(control.run_cycle().await, Err(ControlError::Env(_))));
        // Snapshot still swapped in before the sink was tried
        assert_eq!(control.current().version, 1);
    }
}
