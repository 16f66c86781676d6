//! Greedy radius/speed clustering with an explicit bandwidth loss.
//!
//! Cheaper alternative to the graph strategy. Per cycle:
//! 1. Agglomerate: seed on the first unassigned entity, pull in unassigned
//!    entities that are close, similarly fast and not saturated
//! 2. Visibility `V[k,u]`: summed viewer weights under a limit, with
//!    hysteresis for pairs visible in the last published snapshot
//! 3. Quality `Q[k]`: best per-viewer quality, penalized by spread
//! 4. Bandwidth `B[k,u]` and the allocation loss
//!
//! ```text
//! loss = Σ V·(α·(B_calc − B_true)² + β/(Q + ε)) + γ·Σ_u max(0, Σ_k B_calc − budget)²
//! ```

use crate::cluster::{
    allotted_bandwidth, main_entity, max_distance_delta, ClusterDraft, ClusteringStrategy, CycleInput, CycleReport,
    OutputPlanner, StrategyOutcome,
};
use crate::entity::EntityState;
use crate::graph::{GraphConfig, WeightedGraphBuilder, SATURATED_WEIGHT};
use crate::snapshot::ClusterSnapshot;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use tracing::debug;
use volstream_env::{EntityId, ViewerId};

// ============================================================================
// CONFIGURATION
// ============================================================================

/// Loss coefficients.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LossConfig {
    /// Weight of the bandwidth mismatch term (default: 1.0)
    pub alpha: f64,

    /// Weight of the inverse quality term (default: 1.0)
    pub beta: f64,

    /// Weight of the per-viewer overshoot term (default: 10.0)
    pub gamma: f64,

    /// Keeps 1/Q finite (default: 1e-6)
    pub epsilon: f64,

    /// Per-viewer bandwidth budget (default: 50.0)
    pub viewer_budget: f64,
}

impl Default for LossConfig {
    fn default() -> Self {
        Self {
            alpha: 1.0,
            beta: 1.0,
            gamma: 10.0,
            epsilon: 1e-6,
            viewer_budget: 50.0,
        }
    }
}

/// Configuration for the GreedyStrategy
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GreedyConfig {
    /// Join radius around the seed (default: 5.0)
    pub join_radius: f64,

    /// Maximum speed difference to the seed (default: 2.0)
    pub max_speed_diff: f64,

    /// Summed viewer weight below which a cluster is visible (default: 2.0)
    pub visibility_limit: f64,

    /// Extra allowance for pairs visible last cycle (default: 0.5)
    pub hysteresis: f64,

    /// Entity ↔ entity weight scales: `a·dist + b·speedDiff` (default: 0.1, 0.1)
    pub pair_distance_scale: f64,
    pub pair_speed_scale: f64,

    /// Viewer ↔ entity weight scale: `c·dist` (default: 0.1)
    pub viewer_distance_scale: f64,

    /// Quality floor and the value used with no visible viewer (default: 0.5)
    pub min_quality: f64,

    /// Member spread variance that halves quality (default: 1.0)
    pub variance_limit: f64,

    /// `B = scale·(e^(exponent·Q) − 1)` (default: 2.8, 2.5)
    pub bandwidth_scale: f64,
    pub bandwidth_exponent: f64,

    pub loss: LossConfig,
}

impl Default for GreedyConfig {
    fn default() -> Self {
        Self {
            join_radius: 5.0,
            max_speed_diff: 2.0,
            visibility_limit: 2.0,
            hysteresis: 0.5,
            pair_distance_scale: 0.1,
            pair_speed_scale: 0.1,
            viewer_distance_scale: 0.1,
            min_quality: 0.5,
            variance_limit: 1.0,
            bandwidth_scale: 2.8,
            bandwidth_exponent: 2.5,
            loss: LossConfig::default(),
        }
    }
}

// ============================================================================
// GREEDY STRATEGY
// ============================================================================

/// Allocation of one cluster.
#[derive(Debug, Clone, PartialEq)]
pub struct Allocation {
    pub members: Vec<usize>,
    pub main: usize,

    /// Viewer arena indices with `V[k,u] = 1`
    pub visible: BTreeSet<usize>,

    /// `Q[k]`
    pub quality: f64,

    /// `B[k,u]` calc for each visible viewer
    pub calculated_bandwidth: f64,

    /// `B[k]` true: mean available bandwidth of the visible viewers
    pub true_bandwidth: f64,
}

#[derive(Debug, Clone)]
pub struct GreedyStrategy {
    config: GreedyConfig,
    motion: WeightedGraphBuilder,
    planner: OutputPlanner,
}

impl Default for GreedyStrategy {
    fn default() -> Self {
        Self::new(GreedyConfig::default(), GraphConfig::default(), OutputPlanner::default())
    }
}

impl GreedyStrategy {
    /// `graph` supplies the fast-mover threshold for the saturation check.
    pub fn new(config: GreedyConfig, graph: GraphConfig, planner: OutputPlanner) -> Self {
        Self {
            config,
            motion: WeightedGraphBuilder::new(graph),
            planner,
        }
    }

    pub fn config(&self) -> &GreedyConfig {
        &self.config
    }

    /// Seeded agglomeration in arena order.
    pub fn agglomerate(&self, entities: &[EntityState]) -> Vec<Vec<usize>> {
        let mut assigned = vec![false; entities.len()];
        let mut groups = Vec::new();

        for seed in 0..entities.len() {
            if assigned[seed] {
                continue;
            }
            assigned[seed] = true;
            let mut group = vec![seed];
            for other in (seed + 1)..entities.len() {
                if !assigned[other] && self.joins(&entities[seed], &entities[other]) {
                    assigned[other] = true;
                    group.push(other);
                }
            }
            groups.push(group);
        }

        groups
    }

    fn joins(&self, seed: &EntityState, other: &EntityState) -> bool {
        let distance = seed.distance_to(other);
        distance < self.config.join_radius
            && (seed.speed - other.speed).abs() < self.config.max_speed_diff
            && self.motion.motion_weight(distance, seed, other) < SATURATED_WEIGHT
    }

    /// `Σ w_oo` over member pairs.
    fn pair_weight_sum(&self, members: &[usize], entities: &[EntityState]) -> f64 {
        let mut sum = 0.0;
        for (k, &i) in members.iter().enumerate() {
            for &j in &members[k + 1..] {
                let (a, b) = (&entities[i], &entities[j]);
                sum += self.config.pair_distance_scale * a.distance_to(b)
                    + self.config.pair_speed_scale * (a.speed - b.speed).abs();
            }
        }
        sum
    }

    /// Variance of the members' distances to their centroid.
    fn spread_variance(members: &[usize], entities: &[EntityState]) -> f64 {
        let n = members.len() as f64;
        let centroid = members
            .iter()
            .fold(nalgebra::Vector3::zeros(), |acc, &i| acc + entities[i].position.coords)
            / n;
        let distances: Vec<f64> = members
            .iter()
            .map(|&i| (entities[i].position.coords - centroid).norm())
            .collect();
        let mean = distances.iter().sum::<f64>() / n;
        distances.iter().map(|d| (d - mean).powi(2)).sum::<f64>() / n
    }

    /// `scale·(e^(exponent·Q) − 1)`
    pub fn calculated_bandwidth(&self, quality: f64) -> f64 {
        self.config.bandwidth_scale * ((self.config.bandwidth_exponent * quality).exp() - 1.0)
    }

    /// Visibility, quality and bandwidth of one group.
    pub fn allocate(&self, members: Vec<usize>, main: usize, input: &CycleInput<'_>) -> Allocation {
        let entities = input.scene.entities.as_slice();
        let main_id = entities[main].id;

        let visible: BTreeSet<usize> = input
            .scene
            .viewers
            .iter()
            .enumerate()
            .filter(|(_, viewer)| {
                let weight: f64 = members
                    .iter()
                    .map(|&i| self.config.viewer_distance_scale * viewer.distance_to(&entities[i].position))
                    .sum();
                let limit = if was_visible(input.previous, &main_id, &viewer.id) {
                    self.config.visibility_limit + self.config.hysteresis
                } else {
                    self.config.visibility_limit
                };
                weight < limit
            })
            .map(|(vi, _)| vi)
            .collect();

        let quality = if visible.is_empty() {
            self.config.min_quality
        } else {
            // Identical for every visible viewer: Σ w_oo only depends on the members
            let mut base = 1.0 - self.pair_weight_sum(&members, entities) / (members.len() as f64 * 10.0);
            if Self::spread_variance(&members, entities) >= self.config.variance_limit {
                base *= 0.5;
            }
            if base.is_finite() {
                base.clamp(self.config.min_quality, 1.0)
            } else {
                self.config.min_quality
            }
        };

        let known: Vec<f64> = visible
            .iter()
            .filter_map(|&vi| input.scene.available_bandwidth(&input.scene.viewers[vi].id))
            .collect();
        let true_bandwidth = if known.is_empty() {
            0.0
        } else {
            known.iter().sum::<f64>() / known.len() as f64
        };

        Allocation {
            calculated_bandwidth: self.calculated_bandwidth(quality),
            true_bandwidth,
            members,
            main,
            visible,
            quality,
        }
    }

    /// Allocation loss over all clusters and viewers.
    pub fn loss(&self, allocations: &[Allocation], viewer_count: usize) -> f64 {
        let c = &self.config.loss;
        let mut per_viewer = vec![0.0; viewer_count];
        let mut total = 0.0;

        for a in allocations {
            for &vi in &a.visible {
                total += c.alpha * (a.calculated_bandwidth - a.true_bandwidth).powi(2) + c.beta / (a.quality + c.epsilon);
                if let Some(sum) = per_viewer.get_mut(vi) {
                    *sum += a.calculated_bandwidth;
                }
            }
        }

        let overshoot: f64 = per_viewer
            .iter()
            .map(|sum| (sum - c.viewer_budget).max(0.0).powi(2))
            .sum();
        total + c.gamma * overshoot
    }
}

impl ClusteringStrategy for GreedyStrategy {
    fn name(&self) -> &'static str {
        "greedy"
    }

    fn cluster(&mut self, input: &CycleInput<'_>) -> StrategyOutcome {
        let entities = input.scene.entities.as_slice();
        let mut report = CycleReport::default();

        let mut allocations = Vec::new();
        for group in self.agglomerate(entities) {
            match main_entity(&group, entities) {
                Some(main) => allocations.push(self.allocate(group, main, input)),
                None => report.dropped_clusters += 1,
            }
        }

        let loss = self.loss(&allocations, input.scene.viewers.len());
        report.greedy_loss = Some(loss);

        let model = self.planner.quality();
        let drafts: Vec<ClusterDraft> = allocations
            .into_iter()
            .map(|a| {
                let delta = max_distance_delta(&a.members, a.main, entities, &mut report.sanitized);
                let min_bandwidth = a
                    .visible
                    .iter()
                    .map(|&vi| allotted_bandwidth(model, &input.scene.viewers[vi].id, input))
                    .reduce(f64::min);
                let error = min_bandwidth
                    .map(|b| model.error(delta, model.bandwidth_cost(a.quality), b))
                    .unwrap_or(0.0);
                ClusterDraft {
                    members: a.members,
                    main: a.main,
                    viewers: a.visible,
                    quality: a.quality,
                    max_distance_delta: delta,
                    error,
                }
            })
            .collect();

        let (clusters, dropped) = self.planner.finalize(drafts, input);
        report.dropped_clusters += dropped;

        debug!("Greedy strategy: {} clusters, loss {:.3}", clusters.len(), loss);

        StrategyOutcome {
            clusters,
            iterations: 1,
            converged: true,
            report,
        }
    }
}

/// The pair was visible in the last published snapshot with `main` as the
/// cluster's main entity.
fn was_visible(previous: &ClusterSnapshot, main: &EntityId, viewer: &ViewerId) -> bool {
    previous
        .clusters
        .iter()
        .any(|c| c.main_entity == *main && c.is_visible_to(viewer))
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::WeightedGraphBuilder;
    use crate::scene::SceneSnapshot;
    use crate::viewer::ViewerState;
    use approx::assert_relative_eq;
    use nalgebra::{Point3, Vector3};
    use volstream_env::ProjectionParams;

    fn entity(seed: u64, x: f64, vx: f64) -> EntityState {
        EntityState::new(
            EntityId::from_seed(seed),
            Point3::new(x, 0.0, 0.0),
            Vector3::new(vx, 0.0, 0.0),
            Vector3::new(0.25, 0.25, 0.25),
        )
    }

    fn viewer(seed: u64, position: Point3<f64>) -> ViewerState {
        ViewerState::new(ViewerId::from_seed(seed), position, -Vector3::z(), Vector3::y(), ProjectionParams::default())
    }

    fn run(strategy: &mut GreedyStrategy, snapshot: &SceneSnapshot) -> StrategyOutcome {
        run_after(strategy, snapshot, &ClusterSnapshot::empty())
    }

    fn run_after(strategy: &mut GreedyStrategy, snapshot: &SceneSnapshot, previous: &ClusterSnapshot) -> StrategyOutcome {
        let graph = WeightedGraphBuilder::default().build(snapshot);
        strategy.cluster(&CycleInput {
            scene: snapshot,
            graph: &graph,
            epsilon: 1.0,
            previous,
        })
    }

    #[test]
    fn test_agglomerate_by_radius_and_speed() {
        let strategy = GreedyStrategy::default();
        let entities = vec![
            entity(1, 0.0, 0.0),
            entity(2, 3.0, 0.0),
            entity(3, 7.0, 0.0),
            // Close but fast: saturated
            entity(4, 1.0, 1.5),
        ];
        let groups = strategy.agglomerate(&entities);
        assert_eq!(groups, vec![vec![0, 1], vec![2], vec![3]]);
    }

    #[test]
    fn test_visible_cluster_quality() {
        let mut strategy = GreedyStrategy::default();
        let snapshot = SceneSnapshot::from_parts(
            vec![entity(1, 0.0, 0.0), entity(2, 1.0, 0.0)],
            vec![viewer(1, Point3::new(0.5, 0.0, 5.0))],
        );
        let outcome = run(&mut strategy, &snapshot);

        assert_eq!(outcome.clusters.len(), 1);
        let cluster = &outcome.clusters[0];
        // Σw_uo ≈ 0.1 · 2 · 5.02 < 2.0; base = 1 − 0.1/(2·10)
        assert!(cluster.is_visible_to(&ViewerId::from_seed(1)));
        assert_relative_eq!(cluster.quality, 0.995, epsilon = 1e-12);
        assert!(outcome.report.greedy_loss.is_some());
        assert_eq!(outcome.iterations, 1);
    }

    #[test]
    fn test_far_viewer_sees_nothing() {
        let mut strategy = GreedyStrategy::default();
        let snapshot = SceneSnapshot::from_parts(vec![entity(1, 0.0, 0.0)], vec![viewer(1, Point3::new(0.0, 0.0, 30.0))]);
        let outcome = run(&mut strategy, &snapshot);
        assert!(outcome.clusters.is_empty());
        assert_eq!(outcome.report.dropped_clusters, 1);
    }

    #[test]
    fn test_hysteresis_keeps_pair_visible() {
        let mut strategy = GreedyStrategy::default();
        // Σw_uo = 0.1 · 19 = 1.9 < 2.0: visible
        let first = SceneSnapshot::from_parts(vec![entity(1, 0.0, 0.0)], vec![viewer(1, Point3::new(0.0, 0.0, 19.0))]);
        let mut published = ClusterSnapshot::empty();
        published.clusters = run(&mut strategy, &first).clusters;
        assert_eq!(published.clusters.len(), 1);

        // 2.2 ≥ 2.0 but < 2.5 thanks to hysteresis
        let second = SceneSnapshot::from_parts(vec![entity(1, 0.0, 0.0)], vec![viewer(1, Point3::new(0.0, 0.0, 22.0))]);
        assert_eq!(run_after(&mut strategy, &second, &published).clusters.len(), 1);

        // Without a published history the pair is dropped
        assert!(run(&mut strategy, &second).clusters.is_empty());
    }

    #[test]
    fn test_spread_halves_quality_to_floor() {
        let strategy = GreedyStrategy::default();
        let entities = vec![
            entity(1, 0.0, 0.0),
            entity(2, 0.1, 0.0),
            entity(3, 0.2, 0.0),
            entity(4, 4.9, 0.0),
        ];
        assert!(GreedyStrategy::spread_variance(&[0, 1, 2, 3], &entities) >= 1.0);

        let snapshot = SceneSnapshot::from_parts(entities, vec![viewer(1, Point3::new(2.0, 0.0, 3.0))]);
        let graph = WeightedGraphBuilder::default().build(&snapshot);
        let previous = ClusterSnapshot::empty();
        let input = CycleInput {
            scene: &snapshot,
            graph: &graph,
            epsilon: 1.0,
            previous: &previous,
        };
        let allocation = strategy.allocate(vec![0, 1, 2, 3], 1, &input);
        assert_eq!(allocation.visible.len(), 1);
        assert_relative_eq!(allocation.quality, 0.5);
    }

    #[test]
    fn test_loss_terms() {
        let strategy = GreedyStrategy::default();
        let allocation = Allocation {
            members: vec![0],
            main: 0,
            visible: BTreeSet::from([0]),
            quality: 1.0,
            calculated_bandwidth: 30.0,
            true_bandwidth: 28.0,
        };
        // 1·(2)² + 1/(1 + 1e-6), no overshoot
        assert_relative_eq!(strategy.loss(&[allocation.clone()], 1), 4.0 + 1.0 / 1.000001, epsilon = 1e-9);

        // Two such clusters on one viewer: 60 > 50 → 10 · 10²
        let two = strategy.loss(&[allocation.clone(), allocation], 1);
        assert_relative_eq!(two, 2.0 * (4.0 + 1.0 / 1.000001) + 1000.0, epsilon = 1e-9);
    }

    #[test]
    fn test_true_bandwidth_is_mean_of_estimates() {
        let strategy = GreedyStrategy::default();
        let snapshot = SceneSnapshot::from_parts(
            vec![entity(1, 0.0, 0.0)],
            vec![viewer(1, Point3::new(0.0, 0.0, 3.0)), viewer(2, Point3::new(0.0, 0.0, 4.0))],
        )
        .with_bandwidth(ViewerId::from_seed(1), 10.0)
        .with_bandwidth(ViewerId::from_seed(2), 20.0);
        let graph = WeightedGraphBuilder::default().build(&snapshot);
        let previous = ClusterSnapshot::empty();
        let input = CycleInput {
            scene: &snapshot,
            graph: &graph,
            epsilon: 1.0,
            previous: &previous,
        };
        let allocation = strategy.allocate(vec![0], 0, &input);
        assert_relative_eq!(allocation.true_bandwidth, 15.0);
        assert_relative_eq!(allocation.calculated_bandwidth, 2.8 * (2.5f64.exp() - 1.0), epsilon = 1e-9);
    }
}
