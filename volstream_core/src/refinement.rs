//! The "REFINEMENT" Engine - graph clustering with iterative refinement.
//!
//! One cycle of [`GraphStrategy`]:
//! 1. Build: connected components of the entity graph under the link policy
//! 2. Main entity: member closest to the centroid
//! 3. Visibility: viewer in range AND per-viewer error within budget
//! 4. Error & re-split: worst error over the viewers in range; above the
//!    budget, members farther than ε from main leave together
//! 5. Quality: base × band factor × (1 − error)
//! 6. Convergence: stop when the partition no longer changes
//!
//! Steps 2-6 repeat at most `max_iterations` times. Whatever state the loop
//! ends in is applied; unseen clusters are dropped and their members become
//! noise.

use crate::cluster::{
    allotted_bandwidth, connected_components, main_entity, max_distance_delta, members_in_range,
    ClusterDraft, ClusteringStrategy, ConvergencePolicy, CycleInput, CycleReport, LinkPolicy, OutputPlanner,
    StrategyOutcome,
};
use crate::quality::{QualityAssessment, QualityInput};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use tracing::{debug, trace};

// ============================================================================
// CONFIGURATION
// ============================================================================

/// Configuration for the GraphStrategy
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RefinementConfig {
    /// Hard cap on refinement passes (default: 5)
    pub max_iterations: usize,

    /// Edge linking rule (default: CostBelowEpsilon)
    pub link_policy: LinkPolicy,

    /// Partition comparison (default: OrderedSequence)
    pub convergence_policy: ConvergencePolicy,
}

impl Default for RefinementConfig {
    fn default() -> Self {
        Self {
            max_iterations: 5,
            link_policy: LinkPolicy::CostBelowEpsilon,
            convergence_policy: ConvergencePolicy::OrderedSequence,
        }
    }
}

// ============================================================================
// GRAPH STRATEGY
// ============================================================================

/// Per-group evaluation inside one pass.
#[derive(Debug, Clone)]
struct GroupState {
    main: usize,
    delta: f64,
    viewers: BTreeSet<usize>,
    assessment: QualityAssessment,
}

#[derive(Debug, Clone, Default)]
pub struct GraphStrategy {
    config: RefinementConfig,
    planner: OutputPlanner,
}

impl GraphStrategy {
    pub fn new(config: RefinementConfig, planner: OutputPlanner) -> Self {
        Self { config, planner }
    }

    pub fn config(&self) -> &RefinementConfig {
        &self.config
    }

    /// Main, error input, visibility and quality of one group.
    fn evaluate(
        &self,
        group: &[usize],
        input: &CycleInput<'_>,
        budgets: &[f64],
        report: &mut CycleReport,
    ) -> Option<GroupState> {
        let entities = input.scene.entities.as_slice();
        let main = main_entity(group, entities)?;
        let delta = max_distance_delta(group, main, entities, &mut report.sanitized);
        let model = self.planner.quality();
        let cluster_weight = input.graph.cluster_weight(main);

        let assess = |viewer: usize, bandwidth: Option<f64>| {
            model.assess(&QualityInput {
                max_distance_delta: delta,
                epsilon: input.epsilon,
                aggregate_weight: cluster_weight * input.graph.viewer_weight(viewer, main),
                min_bandwidth: bandwidth,
            })
        };

        let in_range: Vec<(usize, QualityAssessment)> = input
            .scene
            .viewers
            .iter()
            .enumerate()
            .filter(|(_, viewer)| members_in_range(self.planner.visibility(), group, entities, viewer))
            .map(|(vi, _)| (vi, assess(vi, Some(budgets[vi]))))
            .collect();

        let viewers: BTreeSet<usize> = in_range
            .iter()
            .filter(|(_, a)| a.error <= model.error_budget())
            .map(|(vi, _)| *vi)
            .collect();

        // Worst case over every viewer in range
        let assessment = in_range
            .into_iter()
            .map(|(_, a)| a)
            .min_by(|a, b| a.quality.total_cmp(&b.quality))
            .unwrap_or_else(|| assess(usize::MAX, None));

        Some(GroupState {
            main,
            delta,
            viewers,
            assessment,
        })
    }

    /// Moves members farther than ε from main into one new group.
    fn split(&self, group: &[usize], main: usize, input: &CycleInput<'_>) -> Option<(Vec<usize>, Vec<usize>)> {
        let entities = input.scene.entities.as_slice();
        let (far, near): (Vec<usize>, Vec<usize>) = group
            .iter()
            .partition(|&&i| i != main && entities[i].distance_to(&entities[main]) > input.epsilon);
        if far.is_empty() {
            None
        } else {
            Some((near, far))
        }
    }
}

impl ClusteringStrategy for GraphStrategy {
    fn name(&self) -> &'static str {
        "graph"
    }

    fn cluster(&mut self, input: &CycleInput<'_>) -> StrategyOutcome {
        let entities = input.scene.entities.as_slice();
        let mut report = CycleReport::default();

        let model = self.planner.quality();
        let budgets: Vec<f64> = input
            .scene
            .viewers
            .iter()
            .map(|v| allotted_bandwidth(model, &v.id, input))
            .collect();

        let mut groups = connected_components(entities.len(), input.graph, input.epsilon, self.config.link_policy);
        let mut states: Vec<Option<GroupState>> = Vec::new();
        let mut iterations = 0;
        let mut converged = false;

        while iterations < self.config.max_iterations {
            iterations += 1;
            states = groups
                .iter()
                .map(|g| self.evaluate(g, input, &budgets, &mut report))
                .collect();

            let mut next = Vec::with_capacity(groups.len());
            for (group, state) in groups.iter().zip(&states) {
                let parts = state
                    .as_ref()
                    .filter(|s| s.assessment.exceeds_budget && group.len() > 1)
                    .and_then(|s| self.split(group, s.main, input));
                match parts {
                    Some((near, far)) => {
                        trace!("Splitting {} members off a group of {}", far.len(), group.len());
                        report.splits += 1;
                        next.push(near);
                        next.push(far);
                    }
                    None => next.push(group.clone()),
                }
            }

            if self.config.convergence_policy.same(&groups, &next) {
                converged = true;
                break;
            }
            groups = next;
        }

        // Budget exhausted: the last partition has not been evaluated yet
        if !converged {
            states = groups
                .iter()
                .map(|g| self.evaluate(g, input, &budgets, &mut report))
                .collect();
        }

        let mut drafts = Vec::with_capacity(groups.len());
        for (group, state) in groups.into_iter().zip(states) {
            match state {
                Some(s) => drafts.push(ClusterDraft {
                    members: group,
                    main: s.main,
                    viewers: s.viewers,
                    quality: s.assessment.quality,
                    max_distance_delta: s.delta,
                    error: s.assessment.error,
                }),
                None => report.dropped_clusters += 1,
            }
        }

        let (clusters, dropped) = self.planner.finalize(drafts, input);
        report.dropped_clusters += dropped;

        debug!(
            "Graph strategy: {} clusters after {} passes (converged: {}, splits: {})",
            clusters.len(),
            iterations,
            converged,
            report.splits
        );

        StrategyOutcome {
            clusters,
            iterations,
            converged,
            report,
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::EntityState;
    use crate::graph::WeightedGraphBuilder;
    use crate::scene::SceneSnapshot;
    use crate::snapshot::ClusterSnapshot;
    use crate::viewer::ViewerState;
    use nalgebra::{Point3, Vector3};
    use proptest::prelude::*;
    use volstream_env::{EntityId, ProjectionParams, ViewerId};

    fn entity(seed: u64, x: f64) -> EntityState {
        EntityState::new(
            EntityId::from_seed(seed),
            Point3::new(x, 0.0, 0.0),
            Vector3::zeros(),
            Vector3::new(0.25, 0.25, 0.25),
        )
    }

    fn overhead_viewer(seed: u64, x: f64) -> ViewerState {
        ViewerState::new(
            ViewerId::from_seed(seed),
            Point3::new(x, 0.0, 5.0),
            -Vector3::z(),
            Vector3::y(),
            ProjectionParams::default(),
        )
    }

    fn run(snapshot: &SceneSnapshot, epsilon: f64, strategy: &mut GraphStrategy) -> StrategyOutcome {
        let graph = WeightedGraphBuilder::default().build(snapshot);
        let previous = ClusterSnapshot::empty();
        strategy.cluster(&CycleInput {
            scene: snapshot,
            graph: &graph,
            epsilon,
            previous: &previous,
        })
    }

    #[test]
    fn test_close_stationary_entities_form_one_cluster() {
        let snapshot = SceneSnapshot::from_parts(vec![entity(1, 0.0), entity(2, 1.0)], vec![overhead_viewer(1, 0.5)]);
        let outcome = run(&snapshot, 2.0, &mut GraphStrategy::default());

        assert_eq!(outcome.clusters.len(), 1);
        let cluster = &outcome.clusters[0];
        assert_eq!(cluster.members, vec![EntityId::from_seed(1), EntityId::from_seed(2)]);
        assert!(cluster.contains(&cluster.main_entity));
        assert_eq!(cluster.quality, 1.0);
        assert!(outcome.converged);
        assert_eq!(outcome.iterations, 1);
    }

    #[test]
    fn test_distant_entities_form_singletons() {
        let snapshot = SceneSnapshot::from_parts(vec![entity(1, 0.0), entity(2, 10.0)], vec![overhead_viewer(1, 5.0)]);
        let outcome = run(&snapshot, 2.0, &mut GraphStrategy::default());

        assert_eq!(outcome.clusters.len(), 2);
        assert!(outcome.clusters.iter().all(|c| c.len() == 1));
        assert_eq!(outcome.clusters[0].id, 1);
        assert_eq!(outcome.clusters[1].id, 2);
    }

    #[test]
    fn test_out_of_range_cluster_is_dropped() {
        let snapshot = SceneSnapshot::from_parts(vec![entity(1, 0.0), entity(2, 50.0)], vec![overhead_viewer(1, 0.0)]);
        let outcome = run(&snapshot, 2.0, &mut GraphStrategy::default());

        assert_eq!(outcome.clusters.len(), 1);
        assert_eq!(outcome.report.dropped_clusters, 1);
        assert_eq!(outcome.clusters[0].members, vec![EntityId::from_seed(1)]);
    }

    #[test]
    fn test_moving_member_triggers_split() {
        // Chain 0 - 1.5 - 3.0 - 4.5 linked at ε = 2; the last member drifted
        let mut tail = entity(4, 4.5);
        tail.previous_position = Point3::new(4.3, 0.0, 0.0);
        let snapshot = SceneSnapshot::from_parts(
            vec![entity(1, 0.0), entity(2, 1.5), entity(3, 3.0), tail],
            vec![overhead_viewer(1, 2.25)],
        );
        let outcome = run(&snapshot, 2.0, &mut GraphStrategy::default());

        assert_eq!(outcome.report.splits, 1);
        assert_eq!(outcome.iterations, 2);
        assert!(outcome.converged);
        assert_eq!(outcome.clusters.len(), 2);
        assert_eq!(
            outcome.clusters[0].members,
            vec![EntityId::from_seed(1), EntityId::from_seed(2), EntityId::from_seed(3)]
        );
        assert_eq!(outcome.clusters[1].members, vec![EntityId::from_seed(4)]);
        assert_eq!(outcome.clusters[0].main_entity, EntityId::from_seed(2));
    }

    #[test]
    fn test_moving_cluster_within_epsilon_is_hidden() {
        // Drift between main and member without anyone beyond ε: no split, error too high to stream
        let mut drifting = entity(2, 1.0);
        drifting.previous_position = Point3::new(0.5, 0.0, 0.0);
        let snapshot = SceneSnapshot::from_parts(vec![entity(1, 0.0), drifting], vec![overhead_viewer(1, 0.5)]);
        let outcome = run(&snapshot, 3.0, &mut GraphStrategy::default());

        assert_eq!(outcome.report.splits, 0);
        assert!(outcome.clusters.is_empty());
        assert_eq!(outcome.report.dropped_clusters, 1);
    }

    #[test]
    fn test_split_moves_far_members_together() {
        let strategy = GraphStrategy::default();
        let snapshot = SceneSnapshot::from_parts(
            vec![entity(1, 0.0), entity(2, 0.5), entity(3, 3.0), entity(4, 4.0)],
            vec![],
        );
        let graph = WeightedGraphBuilder::default().build(&snapshot);
        let previous = ClusterSnapshot::empty();
        let input = CycleInput {
            scene: &snapshot,
            graph: &graph,
            epsilon: 2.0,
            previous: &previous,
        };
        let (near, far) = strategy.split(&[0, 1, 2, 3], 1, &input).unwrap();
        assert_eq!(near, vec![0, 1]);
        assert_eq!(far, vec![2, 3]);
        assert!(strategy.split(&[0, 1], 0, &input).is_none());
    }

    #[test]
    fn test_empty_scene() {
        let snapshot = SceneSnapshot::from_parts(vec![], vec![]);
        let outcome = run(&snapshot, 1.0, &mut GraphStrategy::default());
        assert!(outcome.clusters.is_empty());
        assert!(outcome.converged);
    }

    #[test]
    fn test_set_equality_policy_also_converges() {
        let mut strategy = GraphStrategy::new(
            RefinementConfig {
                convergence_policy: ConvergencePolicy::SetEquality,
                ..RefinementConfig::default()
            },
            OutputPlanner::default(),
        );
        let snapshot = SceneSnapshot::from_parts(vec![entity(1, 0.0), entity(2, 1.0)], vec![overhead_viewer(1, 0.5)]);
        let outcome = run(&snapshot, 2.0, &mut strategy);
        assert!(outcome.converged);
        assert_eq!(outcome.clusters.len(), 1);
    }

    proptest! {
        #[test]
        fn prop_iterations_capped_and_mains_are_members(
            xs in prop::collection::vec(-8.0f64..8.0, 1..10),
            prev in prop::collection::vec(-8.0f64..8.0, 10),
            epsilon in 0.0f64..6.0,
        ) {
            let entities: Vec<EntityState> = xs
                .iter()
                .enumerate()
                .map(|(i, &x)| {
                    let mut e = entity(i as u64 + 1, x);
                    e.previous_position = Point3::new(prev[i], 0.0, 0.0);
                    e
                })
                .collect();
            let snapshot = SceneSnapshot::from_parts(entities, vec![overhead_viewer(1, 0.0)]);
            let outcome = run(&snapshot, epsilon, &mut GraphStrategy::default());

            prop_assert!(outcome.iterations <= 5);
            let mut seen = std::collections::HashSet::new();
            for cluster in &outcome.clusters {
                prop_assert!(cluster.contains(&cluster.main_entity));
                prop_assert!(cluster.quality >= 0.1 && cluster.quality <= 1.0);
                for m in &cluster.members {
                    prop_assert!(seen.insert(*m));
                }
            }
        }
    }
}
