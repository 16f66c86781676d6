//! The weighted interaction graph over entities and viewers.
//!
//! Rebuilt from a [`SceneSnapshot`] every cycle, never persisted:
//! 1. Entity ↔ entity edges (motion or volatility weighting)
//! 2. Viewer ↔ entity edges (distance, view angle, motion alignment)
//! 3. Optional bandwidth-sharing refinement using the previous cycle's
//!    cluster viewers
//!
//! Edges reference entities and viewers by arena index into the snapshot
//! the graph was built from.

use crate::entity::EntityState;
use crate::geometry::direction_similarity;
use crate::scene::SceneSnapshot;
use crate::viewer::ViewerState;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use tracing::warn;
use volstream_env::{EntityId, ViewerId};

/// Weight assigned to pairs that must never be related.
pub const SATURATED_WEIGHT: f64 = f64::MAX;

/// Fallback when a distance itself is not finite.
const FALLBACK_DISTANCE: f64 = 1.0;

// ============================================================================
// CONFIGURATION
// ============================================================================

/// Entity ↔ entity weighting formula.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EdgeWeighting {
    /// `distance · (1 + speedDiff) · (1 − directionSimilarity)`, saturated for fast movers
    Motion,
    /// `distance + λ·|distance − previousDistance|`
    Volatility,
}

/// Configuration for the WeightedGraphBuilder
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GraphConfig {
    /// Entity ↔ entity formula (default: Volatility)
    pub weighting: EdgeWeighting,

    /// Speed at or above which Motion weights saturate (default: 1.0)
    pub fast_speed_threshold: f64,

    /// λ in the volatility formula (default: 1.0)
    pub volatility_lambda: f64,

    /// γ scaling the bandwidth-sharing discount (default: 0.0001)
    pub sharing_gamma: f64,

    /// Per-viewer bandwidth used by the sharing discount (default: 50.0)
    pub per_viewer_bandwidth: f64,

    /// Floor for discounted weights (default: 0.1)
    pub min_weight: f64,
}

impl Default for GraphConfig {
    fn default() -> Self {
        Self {
            weighting: EdgeWeighting::Volatility,
            fast_speed_threshold: 1.0,
            volatility_lambda: 1.0,
            sharing_gamma: 0.0001,
            per_viewer_bandwidth: 50.0,
            min_weight: 0.1,
        }
    }
}

// ============================================================================
// EDGES
// ============================================================================

/// Graph node as seen by collaborators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeRef {
    Entity(EntityId),
    Viewer(ViewerId),
}

/// Id-based view of an edge.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Edge {
    pub source: NodeRef,
    pub target: NodeRef,
    pub weight: f64,
}

/// Entity ↔ entity edge (arena indices, `source < target`).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EntityEdge {
    pub source: usize,
    pub target: usize,
    pub weight: f64,
    pub distance: f64,
    pub previous_distance: f64,
}

impl EntityEdge {
    pub fn is_saturated(&self) -> bool {
        self.weight >= SATURATED_WEIGHT
    }

    /// `|distance − previousDistance|`
    pub fn distance_delta(&self) -> f64 {
        (self.distance - self.previous_distance).abs()
    }

    pub fn other(&self, idx: usize) -> usize {
        if self.source == idx {
            self.target
        } else {
            self.source
        }
    }
}

/// Viewer ↔ entity edge (arena indices).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ViewerEdge {
    pub viewer: usize,
    pub entity: usize,
    pub weight: f64,
    pub distance: f64,
}

/// Counters gathered while building.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GraphStats {
    /// Non-finite intermediates replaced by a fallback
    pub sanitized: usize,

    /// Entity edges saturated by the fast-mover rule
    pub saturated: usize,

    /// Entity edges discounted by bandwidth sharing
    pub shared_discounts: usize,
}

// ============================================================================
// WEIGHTED GRAPH
// ============================================================================

/// Edge set for one cycle plus lookup helpers.
#[derive(Debug, Clone, Default)]
pub struct WeightedGraph {
    entity_ids: Vec<EntityId>,
    viewer_ids: Vec<ViewerId>,
    entity_edges: Vec<EntityEdge>,
    viewer_edges: Vec<ViewerEdge>,

    /// Entity arena index → indices into `entity_edges`
    adjacency: Vec<Vec<usize>>,

    /// (viewer index, entity index) → index into `viewer_edges`
    viewer_lookup: HashMap<(usize, usize), usize>,

    pub stats: GraphStats,
}

impl WeightedGraph {
    pub fn entity_edges(&self) -> &[EntityEdge] {
        &self.entity_edges
    }

    pub fn viewer_edges(&self) -> &[ViewerEdge] {
        &self.viewer_edges
    }

    pub fn edge_count(&self) -> usize {
        self.entity_edges.len() + self.viewer_edges.len()
    }

    pub fn entity_count(&self) -> usize {
        self.entity_ids.len()
    }

    /// Edges touching an entity.
    pub fn edges_of(&self, entity: usize) -> impl Iterator<Item = &EntityEdge> {
        self.adjacency
            .get(entity)
            .into_iter()
            .flatten()
            .map(move |&e| &self.entity_edges[e])
    }

    /// All edges as `(source, target, weight)` triples keyed by id.
    pub fn edges(&self) -> impl Iterator<Item = Edge> + '_ {
        let entity = self.entity_edges.iter().map(move |e| Edge {
            source: NodeRef::Entity(self.entity_ids[e.source]),
            target: NodeRef::Entity(self.entity_ids[e.target]),
            weight: e.weight,
        });
        let viewer = self.viewer_edges.iter().map(move |e| Edge {
            source: NodeRef::Viewer(self.viewer_ids[e.viewer]),
            target: NodeRef::Entity(self.entity_ids[e.entity]),
            weight: e.weight,
        });
        entity.chain(viewer)
    }

    /// Weight of the edge between two entities, if any.
    pub fn weight_between(&self, a: usize, b: usize) -> Option<f64> {
        self.edges_of(a).find(|e| e.other(a) == b).map(|e| e.weight)
    }

    /// Distance-delta samples for threshold calibration (finite only).
    pub fn distance_deltas(&self) -> Vec<f64> {
        self.entity_edges
            .iter()
            .map(EntityEdge::distance_delta)
            .filter(|d| d.is_finite())
            .collect()
    }

    /// Mean weight of the non-saturated edges touching `entity` (1.0 if none).
    pub fn cluster_weight(&self, entity: usize) -> f64 {
        let (sum, count) = self
            .edges_of(entity)
            .filter(|e| !e.is_saturated())
            .fold((0.0, 0usize), |(s, c), e| (s + e.weight, c + 1));
        if count == 0 {
            1.0
        } else {
            sum / count as f64
        }
    }

    /// Weight of the viewer → entity edge (1.0 if absent).
    pub fn viewer_weight(&self, viewer: usize, entity: usize) -> f64 {
        self.viewer_lookup
            .get(&(viewer, entity))
            .map(|&e| self.viewer_edges[e].weight)
            .unwrap_or(1.0)
    }

    fn push_entity_edge(&mut self, edge: EntityEdge) {
        let idx = self.entity_edges.len();
        self.adjacency[edge.source].push(idx);
        self.adjacency[edge.target].push(idx);
        self.entity_edges.push(edge);
    }

    fn push_viewer_edge(&mut self, edge: ViewerEdge) {
        self.viewer_lookup
            .insert((edge.viewer, edge.entity), self.viewer_edges.len());
        self.viewer_edges.push(edge);
    }
}

// ============================================================================
// BUILDER
// ============================================================================

/// Builds the weighted graph for one cycle. Never mutates entity or viewer state.
#[derive(Debug, Clone, Default)]
pub struct WeightedGraphBuilder {
    config: GraphConfig,
}

impl WeightedGraphBuilder {
    pub fn new(config: GraphConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &GraphConfig {
        &self.config
    }

    /// Builds every entity ↔ entity and viewer ↔ entity edge.
    pub fn build(&self, snapshot: &SceneSnapshot) -> WeightedGraph {
        let entities = snapshot.entities.as_slice();
        let viewers = snapshot.viewers.as_slice();

        let mut graph = WeightedGraph {
            entity_ids: entities.iter().map(|e| e.id).collect(),
            viewer_ids: viewers.iter().map(|v| v.id).collect(),
            adjacency: vec![Vec::new(); entities.len()],
            ..Default::default()
        };

        for i in 0..entities.len() {
            for j in (i + 1)..entities.len() {
                let edge = self.entity_edge(i, j, &entities[i], &entities[j], &mut graph.stats);
                graph.push_entity_edge(edge);
            }
        }

        for (vi, viewer) in viewers.iter().enumerate() {
            for (ei, entity) in entities.iter().enumerate() {
                let edge = self.viewer_edge(vi, ei, viewer, entity, &mut graph.stats);
                graph.push_viewer_edge(edge);
            }
        }

        graph
    }

    fn entity_edge(
        &self,
        i: usize,
        j: usize,
        a: &EntityState,
        b: &EntityState,
        stats: &mut GraphStats,
    ) -> EntityEdge {
        let distance = sanitize_distance(a.distance_to(b), stats);
        let previous_distance = sanitize_distance(a.previous_distance_to(b), stats);

        let raw = match self.config.weighting {
            EdgeWeighting::Motion => self.motion_weight(distance, a, b),
            EdgeWeighting::Volatility => {
                distance + self.config.volatility_lambda * (distance - previous_distance).abs()
            }
        };
        if raw >= SATURATED_WEIGHT {
            stats.saturated += 1;
        }

        EntityEdge {
            source: i,
            target: j,
            weight: sanitize_weight(raw, distance, stats),
            distance,
            previous_distance,
        }
    }

    /// Motion-aware weight; saturated when either entity is fast.
    pub fn motion_weight(&self, distance: f64, a: &EntityState, b: &EntityState) -> f64 {
        if a.speed >= self.config.fast_speed_threshold || b.speed >= self.config.fast_speed_threshold {
            return SATURATED_WEIGHT;
        }
        let speed_diff = (a.speed - b.speed).abs();
        let similarity = direction_similarity(&a.velocity, &b.velocity);
        distance * (1.0 + speed_diff) * (1.0 - similarity)
    }

    fn viewer_edge(
        &self,
        vi: usize,
        ei: usize,
        viewer: &ViewerState,
        entity: &EntityState,
        stats: &mut GraphStats,
    ) -> ViewerEdge {
        let distance = sanitize_distance(viewer.distance_to(&entity.position), stats);
        let raw = Self::viewer_weight(distance, viewer, entity);
        ViewerEdge {
            viewer: vi,
            entity: ei,
            weight: sanitize_weight(raw, distance, stats),
            distance,
        }
    }

    /// `distance · (1 + speed) · (1 − cos(forward, toObject)) · (1 − sim(forward, velocity))`
    pub fn viewer_weight(distance: f64, viewer: &ViewerState, entity: &EntityState) -> f64 {
        let view_cos = viewer.view_alignment(&entity.position);
        let motion_sim = direction_similarity(&viewer.forward, &entity.velocity);
        distance * (1.0 + entity.speed) * (1.0 - view_cos) * (1.0 - motion_sim)
    }

    /// Discounts entity edges whose endpoints' clusters share viewers.
    ///
    /// `cluster_viewers` maps each entity to the viewers of the cluster it
    /// belonged to in the previous cycle. Returns the number of discounted edges.
    pub fn apply_bandwidth_sharing(
        &self,
        graph: &mut WeightedGraph,
        cluster_viewers: &HashMap<EntityId, BTreeSet<ViewerId>>,
    ) -> usize {
        let discount_unit = self.config.sharing_gamma * self.config.per_viewer_bandwidth;
        let mut discounted = 0;

        for edge in graph.entity_edges.iter_mut() {
            if edge.is_saturated() {
                continue;
            }
            let (Some(a), Some(b)) = (
                cluster_viewers.get(&graph.entity_ids[edge.source]),
                cluster_viewers.get(&graph.entity_ids[edge.target]),
            ) else {
                continue;
            };
            let shared = a.intersection(b).count();
            if shared == 0 {
                continue;
            }
            edge.weight = (edge.weight - discount_unit * shared as f64).max(self.config.min_weight);
            discounted += 1;
        }

        graph.stats.shared_discounts += discounted;
        discounted
    }
}

fn sanitize_distance(distance: f64, stats: &mut GraphStats) -> f64 {
    if distance.is_finite() {
        distance
    } else {
        warn!("Non-finite distance replaced by {}", FALLBACK_DISTANCE);
        stats.sanitized += 1;
        FALLBACK_DISTANCE
    }
}

fn sanitize_weight(weight: f64, distance: f64, stats: &mut GraphStats) -> f64 {
    if weight.is_finite() {
        weight
    } else {
        warn!("Non-finite edge weight replaced by plain distance {:.3}", distance);
        stats.sanitized += 1;
        distance
    }
}

// ============================================================================
// TESTS
// ============================================================================
