//! The "CLUSTER MANAGER" - owns one cycle from scene copy to published snapshot.
//!
//! Per cycle:
//! 1. Graph: rebuild entity ↔ entity and viewer ↔ entity edges
//! 2. Sharing: discount edges between entities whose previous clusters
//!    shared viewers
//! 3. Threshold: refit ε from the distance deltas (keeps ε on failure)
//! 4. Strategy: cluster, refine, size outputs
//! 5. Freeze: label every entity into a versioned snapshot
//!
//! A cycle only becomes the next cycle's history once it is committed. The
//! refitted threshold is staged with it, so a cycle discarded before
//! `commit` leaves no trace.
//!
//! The manager never blocks on degenerate input and never returns an error
//! from a cycle; problems are logged and counted in the snapshot report.

use crate::cluster::{ClusteringStrategy, CycleInput, OutputPlanner};
use crate::config::{EngineConfig, StrategyKind};
use crate::entity::ClusterLabel;
use crate::graph::WeightedGraphBuilder;
use crate::greedy::GreedyStrategy;
use crate::metrics::{CycleMetrics, CycleSample};
use crate::quality::QualityModel;
use crate::refinement::GraphStrategy;
use crate::scene::SceneSnapshot;
use crate::snapshot::ClusterSnapshot;
use crate::threshold::ThresholdEstimator;
use crate::visibility::VisibilityEvaluator;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info};
use volstream_env::{EntityId, ViewerId};

#[derive(Debug)]
pub struct ClusterManager {
    strategy: Box<dyn ClusteringStrategy>,
    builder: WeightedGraphBuilder,
    threshold: ThresholdEstimator,

    /// Apply the bandwidth-sharing discount each cycle
    bandwidth_sharing: bool,

    current: Arc<ClusterSnapshot>,

    /// Threshold state of the last cycle run, adopted when it is committed
    staged: Option<(u64, ThresholdEstimator)>,

    /// Last version handed out; discarded cycles still consume one
    last_version: u64,

    metrics: CycleMetrics,
}

impl ClusterManager {
    pub fn new(
        strategy: Box<dyn ClusteringStrategy>,
        builder: WeightedGraphBuilder,
        threshold: ThresholdEstimator,
    ) -> Self {
        Self {
            strategy,
            builder,
            threshold,
            bandwidth_sharing: true,
            current: Arc::new(ClusterSnapshot::empty()),
            staged: None,
            last_version: 0,
            metrics: CycleMetrics::default(),
        }
    }

    /// Wires every component from one configuration.
    pub fn from_config(config: &EngineConfig) -> Self {
        let planner = OutputPlanner::new(
            VisibilityEvaluator::new(config.visibility.clone()),
            QualityModel::new(config.quality.clone()),
            config.tiers.clone(),
        );
        let strategy: Box<dyn ClusteringStrategy> = match config.strategy {
            StrategyKind::Graph => Box::new(GraphStrategy::new(config.refinement.clone(), planner)),
            StrategyKind::Greedy => Box::new(GreedyStrategy::new(
                config.greedy.clone(),
                config.graph.clone(),
                planner,
            )),
        };

        let mut manager = Self::new(
            strategy,
            WeightedGraphBuilder::new(config.graph.clone()),
            ThresholdEstimator::new(config.threshold.clone()),
        );
        manager.bandwidth_sharing = config.bandwidth_sharing;
        manager
    }

    pub fn with_defaults() -> Self {
        Self::from_config(&EngineConfig::default())
    }

    /// Latest committed snapshot.
    pub fn current(&self) -> Arc<ClusterSnapshot> {
        Arc::clone(&self.current)
    }

    pub fn epsilon(&self) -> f64 {
        self.threshold.epsilon()
    }

    pub fn threshold_mut(&mut self) -> &mut ThresholdEstimator {
        &mut self.threshold
    }

    pub fn strategy_name(&self) -> &'static str {
        self.strategy.name()
    }

    pub fn metrics(&self) -> &CycleMetrics {
        &self.metrics
    }

    /// Runs one full cycle against the committed history.
    ///
    /// The result is not used as history until passed to [`commit`](Self::commit).
    pub fn run_cycle(&mut self, scene: &SceneSnapshot) -> Arc<ClusterSnapshot> {
        let started = Instant::now();
        let previous = Arc::clone(&self.current);
        let mut threshold = self.threshold.clone();

        // 1-2. Graph and sharing discount
        let mut graph = self.builder.build(scene);
        let (cluster_viewers, skipped) = previous_viewers(&previous, scene);
        if self.bandwidth_sharing && !cluster_viewers.is_empty() {
            self.builder.apply_bandwidth_sharing(&mut graph, &cluster_viewers);
        }

        // 3. Threshold
        let recalibration = threshold.recalibrate(&graph.distance_deltas());
        let epsilon = recalibration.epsilon();

        // 4. Strategy
        let outcome = self.strategy.cluster(&CycleInput {
            scene,
            graph: &graph,
            epsilon,
            previous: &previous,
        });

        // 5. Labels and publication
        let mut assignment: HashMap<EntityId, ClusterLabel> =
            scene.entities.iter().map(|e| (e.id, ClusterLabel::Noise)).collect();
        for cluster in &outcome.clusters {
            for member in &cluster.members {
                assignment.insert(*member, ClusterLabel::Cluster(cluster.id));
            }
        }

        let mut report = outcome.report;
        report.skipped_references += skipped;
        report.sanitized += graph.stats.sanitized;

        self.last_version += 1;
        let snapshot = Arc::new(ClusterSnapshot {
            version: self.last_version,
            time: scene.time,
            strategy: self.strategy.name().to_string(),
            epsilon,
            recalibrated: recalibration.is_updated(),
            clusters: outcome.clusters,
            assignment,
            iterations: outcome.iterations,
            converged: outcome.converged,
            report,
            graph: graph.stats,
        });

        self.metrics.record(CycleSample {
            duration: started.elapsed(),
            iterations: snapshot.iterations,
            converged: snapshot.converged,
            edges: graph.edge_count(),
            clusters: snapshot.clusters.len(),
            dropped: report.dropped_clusters,
        });

        if report.dropped_clusters > 0 || report.skipped_references > 0 {
            debug!(
                "Cycle {}: dropped {} clusters, skipped {} stale references",
                snapshot.version, report.dropped_clusters, report.skipped_references
            );
        }
        info!(
            "Cycle {} ({}): {} entities → {} clusters, ε={:.4}, {} passes{}",
            snapshot.version,
            snapshot.strategy,
            scene.entities.len(),
            snapshot.clusters.len(),
            epsilon,
            snapshot.iterations,
            if snapshot.converged { "" } else { " (budget exhausted)" }
        );

        self.staged = Some((snapshot.version, threshold));
        snapshot
    }

    /// Makes a cycle's snapshot the history for the next cycle.
    pub fn commit(&mut self, snapshot: Arc<ClusterSnapshot>) {
        if let Some((version, threshold)) = self.staged.take() {
            if version == snapshot.version {
                self.threshold = threshold;
            }
        }
        self.current = snapshot;
    }

    /// Runs a cycle and commits it at once.
    pub fn run_and_commit(&mut self, scene: &SceneSnapshot) -> Arc<ClusterSnapshot> {
        let snapshot = self.run_cycle(scene);
        self.commit(Arc::clone(&snapshot));
        snapshot
    }
}

/// Viewers of each entity's previous cluster, restricted to entities still
/// in the scene. Also returns how many stale members were skipped.
fn previous_viewers(
    previous: &ClusterSnapshot,
    scene: &SceneSnapshot,
) -> (HashMap<EntityId, BTreeSet<ViewerId>>, usize) {
    let mut map = HashMap::new();
    let mut skipped = 0;
    for cluster in &previous.clusters {
        for member in &cluster.members {
            if scene.entity_index(member).is_some() {
                map.insert(*member, cluster.visible_viewers.clone());
            } else {
                skipped += 1;
            }
        }
    }
    (map, skipped)
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::EntityState;
    use crate::viewer::ViewerState;
    use approx::assert_relative_eq;
    use nalgebra::{Point3, Vector3};
    use proptest::prelude::*;
    use volstream_env::ProjectionParams;

    fn entity(seed: u64, x: f64) -> EntityState {
        EntityState::new(
            EntityId::from_seed(seed),
            Point3::new(x, 0.0, 0.0),
            Vector3::zeros(),
            Vector3::new(0.25, 0.25, 0.25),
        )
    }

    fn viewer(seed: u64, x: f64) -> ViewerState {
        ViewerState::new(
            ViewerId::from_seed(seed),
            Point3::new(x, 0.0, 5.0),
            -Vector3::z(),
            Vector3::y(),
            ProjectionParams::default(),
        )
    }

    fn manager_with_epsilon(epsilon: f64) -> ClusterManager {
        let mut manager = ClusterManager::with_defaults();
        manager.threshold_mut().set_epsilon(epsilon);
        manager
    }

    #[test]
    fn test_one_cluster_when_close() {
        let mut manager = manager_with_epsilon(2.0);
        let scene = SceneSnapshot::from_parts(vec![entity(1, 0.0), entity(2, 1.0)], vec![viewer(1, 0.5)]);
        let snapshot = manager.run_and_commit(&scene);

        assert_eq!(snapshot.version, 1);
        assert_eq!(snapshot.clusters.len(), 1);
        assert_eq!(snapshot.cluster_of(&EntityId::from_seed(1)), Some(1));
        assert_eq!(snapshot.cluster_of(&EntityId::from_seed(2)), Some(1));
        assert!(snapshot.is_visible(1, &ViewerId::from_seed(1)));
        assert_eq!(snapshot.quality_of(1), Some(1.0));
        // Fewer than 3 samples: ε kept
        assert!(!snapshot.recalibrated);
        assert_eq!(snapshot.epsilon, 2.0);
    }

    #[test]
    fn test_two_singletons_when_far() {
        let mut manager = manager_with_epsilon(2.0);
        let scene = SceneSnapshot::from_parts(vec![entity(1, 0.0), entity(2, 10.0)], vec![viewer(1, 5.0)]);
        let snapshot = manager.run_and_commit(&scene);

        assert_eq!(snapshot.clusters.len(), 2);
        assert_ne!(
            snapshot.cluster_of(&EntityId::from_seed(1)),
            snapshot.cluster_of(&EntityId::from_seed(2))
        );
    }

    #[test]
    fn test_unseen_entities_are_noise() {
        let mut manager = manager_with_epsilon(2.0);
        let scene = SceneSnapshot::from_parts(vec![entity(1, 0.0), entity(2, 60.0)], vec![viewer(1, 0.0)]);
        let snapshot = manager.run_and_commit(&scene);

        assert_eq!(snapshot.label_of(&EntityId::from_seed(2)), ClusterLabel::Noise);
        assert_eq!(snapshot.report.dropped_clusters, 1);
        assert_eq!(snapshot.decisions().noise, vec![EntityId::from_seed(2)]);
    }

    #[test]
    fn test_versions_increase_and_stale_members_are_skipped() {
        let mut manager = manager_with_epsilon(2.0);
        let first = SceneSnapshot::from_parts(vec![entity(1, 0.0), entity(2, 1.0)], vec![viewer(1, 0.5)]);
        manager.run_and_commit(&first);

        let second = SceneSnapshot::from_parts(vec![entity(1, 0.0)], vec![viewer(1, 0.5)]);
        let snapshot = manager.run_and_commit(&second);

        assert_eq!(snapshot.version, 2);
        assert_eq!(snapshot.report.skipped_references, 1);
        assert_eq!(manager.current().version, 2);
        assert_eq!(manager.metrics().total_cycles(), 2);
    }

    #[test]
    fn test_uncommitted_cycle_leaves_history_untouched() {
        let mut manager = manager_with_epsilon(2.0);
        let scene = SceneSnapshot::from_parts(vec![entity(1, 0.0), entity(2, 1.0)], vec![viewer(1, 0.5)]);
        let dropped = manager.run_cycle(&scene);
        assert_eq!(dropped.clusters.len(), 1);

        assert_eq!(manager.current().version, 0);
        assert!(manager.current().clusters.is_empty());

        // Next cycle sees no previous clusters and takes a fresh version
        let snapshot = manager.run_and_commit(&scene);
        assert_eq!(snapshot.version, 2);
        assert_eq!(snapshot.report.skipped_references, 0);
        assert_eq!(manager.current().version, 2);
    }

    #[test]
    fn test_refit_threshold_is_adopted_on_commit_only() {
        let mut manager = ClusterManager::with_defaults();
        let mut entities: Vec<EntityState> = (0..4).map(|i| entity(i + 1, i as f64 * 2.0)).collect();
        for e in entities.iter_mut() {
            e.previous_position = e.position - Vector3::new(0.5, 0.0, 0.0);
        }
        let scene = SceneSnapshot::from_parts(entities, vec![viewer(1, 3.0)]);

        let dropped = manager.run_cycle(&scene);
        assert!(dropped.recalibrated);
        assert_eq!(manager.epsilon(), 1.0);

        let kept = manager.run_cycle(&scene);
        manager.commit(Arc::clone(&kept));
        assert_relative_eq!(manager.epsilon(), kept.epsilon);
    }

    #[test]
    fn test_threshold_recalibrates_with_enough_samples() {
        let mut manager = ClusterManager::with_defaults();
        // Rigid translation: all 6 distance deltas are 0
        let mut entities: Vec<EntityState> = (0..4).map(|i| entity(i + 1, i as f64 * 2.0)).collect();
        for e in entities.iter_mut() {
            e.previous_position = e.position - Vector3::new(0.5, 0.0, 0.0);
        }
        let scene = SceneSnapshot::from_parts(entities, vec![viewer(1, 3.0)]);
        let snapshot = manager.run_and_commit(&scene);

        assert!(snapshot.recalibrated);
        // Closed-form fit (−1e-3, 1e-3, 1) at p = 0.99
        assert_relative_eq!(snapshot.epsilon, -1e-3 + 1e-3 * 100f64.ln(), epsilon = 1e-9);
        assert!(snapshot.iterations <= 5);
        assert_eq!(snapshot.clusters.len(), 4);
    }

    #[test]
    fn test_greedy_strategy_from_config() {
        let mut manager = ClusterManager::from_config(&EngineConfig::default().with_strategy(StrategyKind::Greedy));
        assert_eq!(manager.strategy_name(), "greedy");

        let scene = SceneSnapshot::from_parts(vec![entity(1, 0.0), entity(2, 1.0)], vec![viewer(1, 0.5)]);
        let snapshot = manager.run_and_commit(&scene);
        assert_eq!(snapshot.strategy, "greedy");
        assert_eq!(snapshot.clusters.len(), 1);
        assert!(snapshot.report.greedy_loss.is_some());
    }

    #[test]
    fn test_empty_scene_publishes_empty_snapshot() {
        let mut manager = ClusterManager::with_defaults();
        let snapshot = manager.run_and_commit(&SceneSnapshot::from_parts(vec![], vec![]));
        assert_eq!(snapshot.version, 1);
        assert!(snapshot.clusters.is_empty());
        assert_eq!(snapshot.epsilon, 1.0);
    }

    proptest! {
        #[test]
        fn prop_linked_entities_share_a_label_without_splits(
            xs in prop::collection::vec(-6.0f64..6.0, 2..9),
            drift in prop::collection::vec(-1.0f64..1.0, 9),
            epsilon in 0.1f64..4.0,
        ) {
            let entities: Vec<EntityState> = xs
                .iter()
                .enumerate()
                .map(|(i, &x)| {
                    let mut e = entity(i as u64 + 1, x);
                    e.previous_position = Point3::new(x + drift[i], 0.0, 0.0);
                    e
                })
                .collect();
            let scene = SceneSnapshot::from_parts(entities, vec![viewer(1, 0.0), viewer(2, 4.0)]);

            let config = EngineConfig::default();
            let mut manager = manager_with_epsilon(epsilon);
            let snapshot = manager.run_and_commit(&scene);

            // First cycle: no sharing discount, same graph as the manager's
            let graph = WeightedGraphBuilder::new(config.graph.clone()).build(&scene);
            for edge in graph.entity_edges() {
                if snapshot.report.splits == 0 && config.refinement.link_policy.links(edge.weight, snapshot.epsilon) {
                    let a = scene.entities[edge.source].id;
                    let b = scene.entities[edge.target].id;
                    prop_assert_eq!(snapshot.label_of(&a), snapshot.label_of(&b));
                }
            }
        }
    }
}
