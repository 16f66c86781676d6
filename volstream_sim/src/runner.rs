//! Scenario runner - drives the control loop against the oracle and checks
//! every published snapshot.

use crate::context::SimContext;
use crate::exporter::{SimEvent, SimExport, SimFrame};
use crate::feed::{RecordingSink, SimFeed};
use crate::oracle::Oracle;
use crate::scenarios::{ScenarioId, StageEvent};

use serde::{Deserialize, Serialize};
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use volstream_core::{ClusterLabel, ClusterSnapshot, ControlError, ControlLoop, EngineConfig};

/// Quality tolerance for floating-point checks.
const QUALITY_TOLERANCE: f64 = 1e-9;

/// RNG stream used to lay out stages.
const STAGE_STREAM: u64 = 0x5747;

/// Results from running a scenario.
#[derive(Debug, Clone)]
pub struct ScenarioResult {
    pub scenario: ScenarioId,
    pub seed: u64,

    /// Whether scenario passed all assertions
    pub passed: bool,

    pub total_ticks: u64,
    pub final_time_secs: f64,

    /// Number of active entities at end
    pub final_entity_count: usize,

    /// First failure if any
    pub failure_reason: Option<String>,

    pub metrics: ScenarioMetrics,
}

/// Metrics collected during scenario execution.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScenarioMetrics {
    /// Tracking updates fed to the control loop
    pub updates: u64,

    pub cycles_published: u64,
    pub cycles_discarded: u64,

    /// Publishes the sink rejected
    pub sink_failures: u64,

    /// Envelopes the sink accepted
    pub envelopes: usize,
    pub bytes_published: usize,

    pub max_clusters: usize,
    pub mean_clusters: f64,
    pub max_iterations: usize,
    pub non_converged: u64,
    pub recalibrations: u64,
    pub splits: usize,
    pub dropped_clusters: usize,
    pub skipped_references: usize,
    pub sanitized: usize,

    /// Lowest and mean cluster quality over all cycles (None: no cluster)
    pub min_quality: Option<f64>,
    pub mean_quality: Option<f64>,

    pub mean_cycle_ms: f64,

    /// Invariant violations found
    pub violations: usize,
}

/// Checks every published snapshot for structural invariants.
#[derive(Debug)]
struct InvariantChecker {
    max_iterations: usize,
    min_quality: f64,
    max_quality: f64,
    last_version: u64,
    violations: Vec<String>,
}

impl InvariantChecker {
    fn new(config: &EngineConfig) -> Self {
        Self {
            max_iterations: config.refinement.max_iterations,
            min_quality: config.quality.min_quality,
            max_quality: config.quality.max_quality,
            last_version: 0,
            violations: Vec::new(),
        }
    }

    fn check(&mut self, snapshot: &ClusterSnapshot) {
        let v = snapshot.version;
        if v <= self.last_version {
            self.fail(format!("version {} not after {}", v, self.last_version));
        }
        self.last_version = v;

        if snapshot.iterations > self.max_iterations {
            self.fail(format!("v{}: {} refinement passes", v, snapshot.iterations));
        }

        let mut seen = HashSet::new();
        let mut ids = HashSet::new();
        for cluster in &snapshot.clusters {
            if !ids.insert(cluster.id) {
                self.fail(format!("v{}: duplicate cluster id {}", v, cluster.id));
            }
            if cluster.is_empty() {
                self.fail(format!("v{}: cluster {} is empty", v, cluster.id));
            }
            if !cluster.contains(&cluster.main_entity) {
                self.fail(format!("v{}: main entity of cluster {} is not a member", v, cluster.id));
            }
            if cluster.visible_viewers.is_empty() {
                self.fail(format!("v{}: cluster {} has no viewer", v, cluster.id));
            }
            let q = cluster.quality;
            if !q.is_finite()
                || q < self.min_quality - QUALITY_TOLERANCE
                || q > self.max_quality + QUALITY_TOLERANCE
            {
                self.fail(format!("v{}: cluster {} quality {}", v, cluster.id, q));
            }
            for member in &cluster.members {
                if !seen.insert(*member) {
                    self.fail(format!("v{}: entity {} in two clusters", v, member));
                }
                if snapshot.label_of(member) != ClusterLabel::Cluster(cluster.id) {
                    self.fail(format!("v{}: entity {} label disagrees with cluster {}", v, member, cluster.id));
                }
            }
        }

        let labelled = snapshot
            .assignment
            .values()
            .filter(|l| matches!(l, ClusterLabel::Cluster(_)))
            .count();
        if labelled != seen.len() {
            self.fail(format!("v{}: {} labelled entities, {} cluster members", v, labelled, seen.len()));
        }
    }

    fn fail(&mut self, message: String) {
        warn!("Invariant violated: {}", message);
        self.violations.push(message);
    }
}

/// Running totals used to build [`ScenarioMetrics`].
#[derive(Debug, Default)]
struct Tally {
    metrics: ScenarioMetrics,
    cluster_sum: usize,
    quality_sum: f64,
    quality_count: usize,
}

impl Tally {
    fn record(&mut self, snapshot: &ClusterSnapshot) {
        let m = &mut self.metrics;
        m.max_clusters = m.max_clusters.max(snapshot.clusters.len());
        m.max_iterations = m.max_iterations.max(snapshot.iterations);
        if !snapshot.converged {
            m.non_converged += 1;
        }
        if snapshot.recalibrated {
            m.recalibrations += 1;
        }
        m.splits += snapshot.report.splits;
        m.dropped_clusters += snapshot.report.dropped_clusters;
        m.skipped_references += snapshot.report.skipped_references;
        m.sanitized += snapshot.report.sanitized;

        self.cluster_sum += snapshot.clusters.len();
        for cluster in &snapshot.clusters {
            m.min_quality = Some(m.min_quality.map_or(cluster.quality, |q| q.min(cluster.quality)));
            self.quality_sum += cluster.quality;
            self.quality_count += 1;
        }
    }

    fn finish(mut self, cycles: u64) -> ScenarioMetrics {
        if cycles > 0 {
            self.metrics.mean_clusters = self.cluster_sum as f64 / cycles as f64;
        }
        if self.quality_count > 0 {
            self.metrics.mean_quality = Some(self.quality_sum / self.quality_count as f64);
        }
        self.metrics
    }
}

/// Runs stage scenarios.
pub struct ScenarioRunner {
    seed: u64,
    max_duration_secs: f64,
    config: EngineConfig,
}

impl ScenarioRunner {
    pub fn new(seed: u64) -> Self {
        Self {
            seed,
            max_duration_secs: 10.0,
            config: EngineConfig::default(),
        }
    }

    pub fn with_duration(mut self, secs: f64) -> Self {
        self.max_duration_secs = secs;
        self
    }

    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Runs a scenario and returns the result.
    pub async fn run(&self, scenario: ScenarioId) -> ScenarioResult {
        self.execute(scenario, None).await
    }

    /// Runs a scenario recording one frame per published cycle.
    pub async fn run_with_export(&self, scenario: ScenarioId) -> (ScenarioResult, SimExport) {
        let mut export = SimExport::new(scenario.name(), self.seed, self.config.strategy.name());
        let result = self.execute(scenario, Some(&mut export)).await;
        export.finalize(result.passed, result.failure_reason.clone());
        (result, export)
    }

    async fn execute(&self, scenario: ScenarioId, mut export: Option<&mut SimExport>) -> ScenarioResult {
        info!(
            "Starting scenario: {} (seed={}, strategy={})",
            scenario.name(),
            self.seed,
            self.config.strategy.name()
        );

        let physics_seed = self.seed.wrapping_mul(0x9e37_79b9_7f4a_7c15);
        let context = SimContext::shared(self.seed);
        let mut oracle = Oracle::new(physics_seed);
        let mut script: VecDeque<_> = scenario
            .stage(&mut oracle, &mut context.derive_rng(STAGE_STREAM))
            .into();

        let feed = Arc::new(SimFeed::new());
        let sink = Arc::new(RecordingSink::new());
        let mut control = ControlLoop::new(Arc::clone(&context), Arc::clone(&feed), Arc::clone(&sink), &self.config);

        let tick_rate_hz = self.config.control.tick_rate_hz.max(1);
        let dt = 1.0 / tick_rate_hz as f64;
        let cycle_every = u64::from(self.config.control.cycle_every_ticks.max(1));
        let target_ticks = (self.max_duration_secs * tick_rate_hz as f64) as u64;

        let mut checker = InvariantChecker::new(&self.config);
        let mut tally = Tally::default();
        let mut pending_events: Vec<SimEvent> = Vec::new();
        let mut fatal: Option<String> = None;

        if target_ticks < cycle_every {
            fatal = Some(format!(
                "duration {:.2}s shorter than one cycle period",
                self.max_duration_secs
            ));
        }

        for tick in 1..=target_ticks {
            if fatal.is_some() {
                break;
            }
            oracle.step(dt);
            context.advance_time(Duration::from_secs_f64(dt));

            while script
                .front()
                .is_some_and(|e| e.at * self.max_duration_secs <= oracle.time())
            {
                let Some(scripted) = script.pop_front() else { break };
                debug!("t={:.2}s: {}", oracle.time(), scripted.event.describe());
                pending_events.push(SimEvent::info(scripted.event.describe()));
                apply_event(&mut oracle, &sink, scripted.event);
            }

            let updates = oracle.updates();
            tally.metrics.updates += updates.len() as u64;
            feed.push_all(updates);
            control.drain_feed();

            if tick % cycle_every != 0 {
                continue;
            }

            let snapshot = match control.run_cycle().await {
                Ok(Some(snapshot)) => snapshot,
                Ok(None) => continue,
                Err(ControlError::Env(e)) => {
                    // Snapshot was swapped in before the sink refused it
                    debug!("Sink rejected cycle: {}", e);
                    tally.metrics.sink_failures += 1;
                    control.current()
                }
                Err(e) => {
                    fatal = Some(format!("cycle failed: {}", e));
                    break;
                }
            };

            checker.check(&snapshot);
            tally.record(&snapshot);

            if let Some(export) = export.as_deref_mut() {
                export.add_frame(SimFrame::capture(&oracle, &snapshot, std::mem::take(&mut pending_events)));
            }

            if tick % u64::from(tick_rate_hz) == 0 {
                debug!(
                    "  t={:.1}s | entities={} | clusters={} | ε={:.4}",
                    oracle.time(),
                    oracle.active_entity_count(),
                    snapshot.clusters.len(),
                    snapshot.epsilon
                );
            }
        }

        let (published, discarded) = control.cycle_counts();
        let mut metrics = tally.finish(published);
        metrics.cycles_published = published;
        metrics.cycles_discarded = discarded;
        metrics.envelopes = sink.len();
        metrics.bytes_published = sink.total_bytes();
        metrics.violations = checker.violations.len();
        metrics.mean_cycle_ms = control.metrics().map(|s| s.mean_duration_ms).unwrap_or(0.0);

        let failure_reason = fatal
            .or_else(|| checker.violations.first().cloned())
            .or_else(|| verify_publication(&sink, &metrics).err())
            .or_else(|| verify_outcome(scenario, &control.current(), &oracle, &metrics).err());

        let passed = failure_reason.is_none();
        info!(
            "Scenario {} finished: {} cycles, max {} clusters, {} envelopes{}",
            scenario.name(),
            metrics.cycles_published,
            metrics.max_clusters,
            metrics.envelopes,
            if passed { "" } else { " (FAILED)" }
        );

        ScenarioResult {
            scenario,
            seed: self.seed,
            passed,
            total_ticks: target_ticks,
            final_time_secs: oracle.time(),
            final_entity_count: oracle.active_entity_count(),
            failure_reason,
            metrics,
        }
    }
}

fn apply_event(oracle: &mut Oracle, sink: &RecordingSink, event: StageEvent) {
    match event {
        StageEvent::SpawnEntity {
            position,
            half_extents,
            motion,
        } => {
            oracle.spawn_entity(position, half_extents, motion);
        }
        StageEvent::RemoveEntity(id) => oracle.remove_entity(id),
        StageEvent::RemoveViewer(id) => oracle.remove_viewer(id),
        StageEvent::SetBandwidth { viewer, mbps } => oracle.set_bandwidth(viewer, mbps),
        StageEvent::SinkOutage(down) => sink.set_failing(down),
    }
}

/// Every cycle reached the sink once, in version order.
fn verify_publication(sink: &RecordingSink, metrics: &ScenarioMetrics) -> Result<(), String> {
    if metrics.cycles_published == 0 {
        return Err("no cycle was published".to_string());
    }
    let versions = sink.versions();
    if versions.windows(2).any(|w| w[0] >= w[1]) {
        return Err(format!("sink versions out of order: {:?}", versions));
    }
    let expected = metrics.cycles_published - metrics.sink_failures;
    if versions.len() as u64 != expected {
        return Err(format!("sink received {} envelopes, expected {}", versions.len(), expected));
    }
    Ok(())
}

/// Scenario-specific end-state checks.
fn verify_outcome(
    scenario: ScenarioId,
    last: &ClusterSnapshot,
    oracle: &Oracle,
    metrics: &ScenarioMetrics,
) -> Result<(), String> {
    match scenario {
        ScenarioId::ViewerChurn => {
            if !last.clusters.is_empty() {
                return Err(format!("{} clusters streamed with no viewer left", last.clusters.len()));
            }
            if last.assignment.len() != oracle.active_entity_count() {
                return Err(format!(
                    "{} entities labelled, {} in the scene",
                    last.assignment.len(),
                    oracle.active_entity_count()
                ));
            }
            if last.assignment.values().any(|l| *l != ClusterLabel::Noise) {
                return Err("entity left unlabelled after viewers left".to_string());
            }
        }
        ScenarioId::Blackout => {
            if metrics.sink_failures == 0 {
                return Err("outage never reached the sink".to_string());
            }
            if metrics.envelopes == 0 {
                return Err("no envelope delivered after the outage".to_string());
            }
        }
        ScenarioId::EmptyStage => {
            if metrics.max_clusters > 0 {
                return Err(format!("{} clusters without entities", metrics.max_clusters));
            }
        }
        _ => {}
    }
    Ok(())
}
