//! Clusters and the strategy seam.
//!
//! A [`ClusteringStrategy`] turns one cycle's scene and graph into clusters
//! with three outputs per cycle:
//! - `entityId → clusterId`
//! - `clusterId → quality`
//! - `(clusterId, viewerId) → visible`
//!
//! Shared building blocks for the strategies live here too: connected
//! components under a link policy, main-entity selection, distance-delta
//! error input, per-viewer allotted bandwidth and output sizing
//! ([`OutputPlanner`]).

use crate::entity::EntityState;
use crate::geometry::BoundingBox;
use crate::graph::WeightedGraph;
use crate::quality::{QualityModel, QualityTier, TierTable};
use crate::scene::SceneSnapshot;
use crate::snapshot::ClusterSnapshot;
use crate::visibility::{LodLevel, VisibilityEvaluator};
use nalgebra::Point3;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, VecDeque};
use std::fmt::Debug;
use volstream_env::{EntityId, ViewerId};

// ============================================================================
// POLICIES
// ============================================================================

/// When an entity ↔ entity edge joins its endpoints into one component.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkPolicy {
    /// Weight is a cost: link when `weight < ε`
    #[default]
    CostBelowEpsilon,
    /// Link when `weight ≥ ε`
    WeightAtLeastEpsilon,
}

impl LinkPolicy {
    /// Saturated edges never link.
    pub fn links(&self, weight: f64, epsilon: f64) -> bool {
        if !weight.is_finite() || weight >= crate::graph::SATURATED_WEIGHT {
            return false;
        }
        match self {
            LinkPolicy::CostBelowEpsilon => weight < epsilon,
            LinkPolicy::WeightAtLeastEpsilon => weight >= epsilon,
        }
    }
}

/// How two consecutive partitions are compared for convergence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConvergencePolicy {
    /// Same clusters, same order, same member order
    #[default]
    OrderedSequence,
    /// Same set of member sets
    SetEquality,
}

impl ConvergencePolicy {
    pub fn same(&self, previous: &[Vec<usize>], current: &[Vec<usize>]) -> bool {
        match self {
            ConvergencePolicy::OrderedSequence => previous == current,
            ConvergencePolicy::SetEquality => {
                let as_set = |groups: &[Vec<usize>]| -> BTreeSet<BTreeSet<usize>> {
                    groups.iter().map(|g| g.iter().copied().collect()).collect()
                };
                as_set(previous) == as_set(current)
            }
        }
    }
}

// ============================================================================
// CLUSTER
// ============================================================================

/// Output sizing of one cluster for one viewer that sees it.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ClusterView {
    pub viewer: ViewerId,

    /// At least one corner of the cluster box is inside the viewer's frustum
    pub in_frustum: bool,

    /// Weight-adjusted on-screen size ratio in [0.3, 1]
    pub size_ratio: f64,

    pub resolution: (u32, u32),
    pub lod: LodLevel,

    /// Orthographic half height framing the cluster (0 when out of frustum)
    pub ortho_size: f64,
}

/// A group of entities captured and streamed together.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cluster {
    /// 1-based, unique within a snapshot
    pub id: u32,

    /// Members in arena order
    pub members: Vec<EntityId>,

    /// Member closest to the centroid
    pub main_entity: EntityId,

    pub visible_viewers: BTreeSet<ViewerId>,

    /// Streaming quality in [0.1, 1.0]
    pub quality: f64,

    pub max_distance_delta: f64,
    pub error: f64,

    pub tier: QualityTier,

    /// Most detailed level requested by any viewer
    pub lod: LodLevel,

    pub views: Vec<ClusterView>,
}

impl Cluster {
    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn contains(&self, entity: &EntityId) -> bool {
        self.members.contains(entity)
    }

    pub fn is_visible_to(&self, viewer: &ViewerId) -> bool {
        self.visible_viewers.contains(viewer)
    }

    pub fn view_for(&self, viewer: &ViewerId) -> Option<&ClusterView> {
        self.views.iter().find(|v| &v.viewer == viewer)
    }
}

// ============================================================================
// STRATEGY SEAM
// ============================================================================

/// Everything a strategy may read during one cycle.
#[derive(Debug, Clone, Copy)]
pub struct CycleInput<'a> {
    pub scene: &'a SceneSnapshot,
    pub graph: &'a WeightedGraph,
    pub epsilon: f64,

    /// Last published snapshot (hysteresis and allotted bandwidth)
    pub previous: &'a ClusterSnapshot,
}

/// Recoverable events counted during a cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct CycleReport {
    /// Clusters re-split because their error exceeded the budget
    pub splits: usize,

    /// Clusters dropped for lack of viewers or main entity
    pub dropped_clusters: usize,

    /// Ids from the previous snapshot no longer present in the scene
    pub skipped_references: usize,

    /// Non-finite values replaced by fallbacks
    pub sanitized: usize,

    /// Total loss of the greedy allocation, when that strategy ran
    pub greedy_loss: Option<f64>,
}

/// Result of one strategy run.
#[derive(Debug, Clone, Default)]
pub struct StrategyOutcome {
    pub clusters: Vec<Cluster>,
    pub iterations: usize,
    pub converged: bool,
    pub report: CycleReport,
}

/// Pluggable clustering algorithm.
pub trait ClusteringStrategy: Send + Debug {
    fn name(&self) -> &'static str;

    /// Builds this cycle's clusters. Must terminate and never panic on
    /// degenerate input.
    fn cluster(&mut self, input: &CycleInput<'_>) -> StrategyOutcome;
}

// ============================================================================
// SHARED BUILDING BLOCKS
// ============================================================================

/// Connected components over the linking entity edges, in arena order.
///
/// Each component's members are sorted by arena index; isolated entities
/// become singletons.
pub fn connected_components(
    entity_count: usize,
    graph: &WeightedGraph,
    epsilon: f64,
    policy: LinkPolicy,
) -> Vec<Vec<usize>> {
    let mut visited = vec![false; entity_count];
    let mut components = Vec::new();

    for start in 0..entity_count {
        if visited[start] {
            continue;
        }
        visited[start] = true;
        let mut component = vec![start];
        let mut queue = VecDeque::from([start]);

        while let Some(current) = queue.pop_front() {
            for edge in graph.edges_of(current) {
                let next = edge.other(current);
                if next < entity_count && !visited[next] && policy.links(edge.weight, epsilon) {
                    visited[next] = true;
                    component.push(next);
                    queue.push_back(next);
                }
            }
        }

        component.sort_unstable();
        components.push(component);
    }

    components
}

/// Member closest to the centroid; ties go to the earliest member.
///
/// Members with a non-finite position are ignored; `None` when no member
/// has a usable position.
pub fn main_entity(members: &[usize], entities: &[EntityState]) -> Option<usize> {
    let usable: Vec<usize> = members
        .iter()
        .copied()
        .filter(|&i| entities.get(i).is_some_and(|e| is_finite_point(&e.position)))
        .collect();
    if usable.is_empty() {
        return None;
    }

    let sum = usable
        .iter()
        .fold(nalgebra::Vector3::zeros(), |acc, &i| acc + entities[i].position.coords);
    let centroid = Point3::from(sum / usable.len() as f64);

    let mut best = usable[0];
    let mut best_distance = nalgebra::distance(&entities[best].position, &centroid);
    for &i in &usable[1..] {
        let d = nalgebra::distance(&entities[i].position, &centroid);
        if d < best_distance {
            best = i;
            best_distance = d;
        }
    }
    Some(best)
}

/// Largest `|d(member, main) − d(member@prev, main@prev)|` over non-main members.
///
/// Non-finite terms are skipped and counted in `sanitized`.
pub fn max_distance_delta(members: &[usize], main: usize, entities: &[EntityState], sanitized: &mut usize) -> f64 {
    let anchor = &entities[main];
    let mut max = 0.0f64;
    for &i in members {
        if i == main {
            continue;
        }
        let delta = (entities[i].distance_to(anchor) - entities[i].previous_distance_to(anchor)).abs();
        if delta.is_finite() {
            max = max.max(delta);
        } else {
            *sanitized += 1;
        }
    }
    max
}

/// Bandwidth a viewer is allotted this cycle.
///
/// Cost of the best quality the viewer observed last cycle (1.0 if it saw
/// nothing), capped by the transport's estimate when one is known.
pub fn allotted_bandwidth(model: &QualityModel, viewer: &ViewerId, input: &CycleInput<'_>) -> f64 {
    let observed = input.previous.observed_quality(viewer).unwrap_or(1.0);
    let allotted = model.viewer_bandwidth(observed);
    match input.scene.available_bandwidth(viewer) {
        Some(available) => allotted.min(available),
        None => allotted,
    }
}

/// Union of the members' bounding boxes.
pub fn cluster_bounds(members: &[usize], entities: &[EntityState]) -> Option<BoundingBox> {
    members
        .iter()
        .filter_map(|&i| entities.get(i))
        .map(EntityState::bounding_box)
        .reduce(|acc, b| acc.union(&b))
}

/// Whether any member is within the visibility radius of a viewer.
pub fn members_in_range(
    evaluator: &VisibilityEvaluator,
    members: &[usize],
    entities: &[EntityState],
    viewer: &crate::viewer::ViewerState,
) -> bool {
    evaluator.in_range(members.iter().filter_map(|&i| entities.get(i)).map(|e| &e.position), viewer)
}

fn is_finite_point(p: &Point3<f64>) -> bool {
    p.coords.iter().all(|c| c.is_finite())
}

// ============================================================================
// OUTPUT PLANNER
// ============================================================================

/// A cluster as decided by a strategy, before output sizing.
#[derive(Debug, Clone)]
pub struct ClusterDraft {
    /// Arena indices, sorted
    pub members: Vec<usize>,
    pub main: usize,

    /// Arena indices of the viewers that see it
    pub viewers: BTreeSet<usize>,

    pub quality: f64,
    pub max_distance_delta: f64,
    pub error: f64,
}

/// Turns drafts into published clusters: ids, tiers, per-viewer sizing.
#[derive(Debug, Clone, Default)]
pub struct OutputPlanner {
    visibility: VisibilityEvaluator,
    quality: QualityModel,
    tiers: TierTable,
}

impl OutputPlanner {
    pub fn new(visibility: VisibilityEvaluator, quality: QualityModel, tiers: TierTable) -> Self {
        Self {
            visibility,
            quality,
            tiers,
        }
    }

    pub fn visibility(&self) -> &VisibilityEvaluator {
        &self.visibility
    }

    pub fn quality(&self) -> &QualityModel {
        &self.quality
    }

    pub fn tiers(&self) -> &TierTable {
        &self.tiers
    }

    /// Drops drafts nobody sees and numbers the rest from 1.
    ///
    /// Returns the clusters and the number of dropped drafts.
    pub fn finalize(&self, drafts: Vec<ClusterDraft>, input: &CycleInput<'_>) -> (Vec<Cluster>, usize) {
        let mut clusters = Vec::with_capacity(drafts.len());
        let mut dropped = 0;

        for draft in drafts {
            if draft.viewers.is_empty() || draft.members.is_empty() {
                dropped += 1;
                continue;
            }
            let id = clusters.len() as u32 + 1;
            clusters.push(self.plan(id, draft, input));
        }

        (clusters, dropped)
    }

    fn plan(&self, id: u32, draft: ClusterDraft, input: &CycleInput<'_>) -> Cluster {
        let entities = input.scene.entities.as_slice();
        let viewers = input.scene.viewers.as_slice();
        let bounds = cluster_bounds(&draft.members, entities);
        let cluster_weight = input.graph.cluster_weight(draft.main);

        let views: Vec<ClusterView> = draft
            .viewers
            .iter()
            .filter_map(|&vi| viewers.get(vi).map(|v| (vi, v)))
            .map(|(vi, viewer)| {
                let report = bounds
                    .map(|b| self.visibility.evaluate_box(&b, viewer))
                    .unwrap_or_else(crate::visibility::ViewReport::hidden);
                let weight = cluster_weight * input.graph.viewer_weight(vi, draft.main);
                let ratio = self
                    .visibility
                    .adjusted_ratio(report.size_ratio, self.quality.weight_factor(weight));
                ClusterView {
                    viewer: viewer.id,
                    in_frustum: report.visible,
                    size_ratio: ratio,
                    resolution: self.visibility.resolution_for(ratio),
                    lod: self.visibility.lod_for(ratio),
                    ortho_size: report.ortho_size,
                }
            })
            .collect();

        let lod = views
            .iter()
            .map(|v| v.lod)
            .min_by_key(LodLevel::index)
            .unwrap_or(LodLevel::Low);
        let quality = self.quality.clamp_quality(draft.quality);

        Cluster {
            id,
            members: draft.members.iter().map(|&i| entities[i].id).collect(),
            main_entity: entities[draft.main].id,
            visible_viewers: views.iter().map(|v| v.viewer).collect(),
            quality,
            max_distance_delta: draft.max_distance_delta,
            error: draft.error,
            tier: self.tiers.lookup(quality),
            lod,
            views,
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================
