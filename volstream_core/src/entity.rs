//! Per-object tracked state.
//!
//! An entity keeps two notions of "before":
//! 1. `previous_position`, replaced only once per recording interval, feeds
//!    the volatility edge weights and the cluster distance deltas
//! 2. a time-keyed position history for "N seconds ago" lookups

use crate::geometry::{BoundingBox, Frustum};
use nalgebra::{Point3, Vector3};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use tracing::warn;
use volstream_env::{EntityId, EntityUpdate, ViewerId};

// ============================================================================
// CONFIGURATION
// ============================================================================

/// Configuration shared by all entities of a scene.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EntityConfig {
    /// Seconds between `previous_position` samples (default: 1.0)
    pub record_interval: f64,

    /// Seconds of position history retained (default: 60.0)
    pub history_window: f64,
}

impl Default for EntityConfig {
    fn default() -> Self {
        Self {
            record_interval: 1.0,
            history_window: 60.0,
        }
    }
}

// ============================================================================
// CLUSTER LABEL
// ============================================================================

/// Cluster membership of an entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ClusterLabel {
    /// Not yet processed by a cycle
    #[default]
    Unclassified,
    /// Processed but not streamed (its cluster was dropped)
    Noise,
    /// Member of cluster `k` (k ≥ 1)
    Cluster(u32),
}

impl ClusterLabel {
    /// Integer encoding used by collaborators: 0, -1 or the cluster index.
    pub fn as_raw(&self) -> i64 {
        match self {
            ClusterLabel::Unclassified => 0,
            ClusterLabel::Noise => -1,
            ClusterLabel::Cluster(k) => i64::from(*k),
        }
    }

    pub fn cluster_id(&self) -> Option<u32> {
        match self {
            ClusterLabel::Cluster(k) => Some(*k),
            _ => None,
        }
    }
}

// ============================================================================
// POSITION HISTORY
// ============================================================================

/// Bounded, time-ordered queue of past positions.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PositionHistory {
    samples: VecDeque<(f64, Point3<f64>)>,
}

impl PositionHistory {
    /// Appends a sample and evicts everything older than `window` seconds.
    pub fn record(&mut self, time: f64, position: Point3<f64>, window: f64) {
        self.samples.push_back((time, position));
        while let Some(&(oldest, _)) = self.samples.front() {
            if time - oldest > window {
                self.samples.pop_front();
            } else {
                break;
            }
        }
    }

    /// Position recorded closest to `now - seconds_ago`.
    pub fn position_seconds_ago(&self, now: f64, seconds_ago: f64) -> Option<Point3<f64>> {
        let target = now - seconds_ago;
        self.samples
            .iter()
            .min_by(|a, b| (a.0 - target).abs().total_cmp(&(b.0 - target).abs()))
            .map(|(_, p)| *p)
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Time span covered by the retained samples.
    pub fn span(&self) -> f64 {
        match (self.samples.front(), self.samples.back()) {
            (Some(first), Some(last)) => last.0 - first.0,
            _ => 0.0,
        }
    }
}

// ============================================================================
// ENTITY STATE
// ============================================================================

/// Tracked state of one streamable object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntityState {
    pub id: EntityId,
    pub position: Point3<f64>,

    /// Position at the last recording tick (not the last frame)
    pub previous_position: Point3<f64>,

    pub velocity: Vector3<f64>,
    pub speed: f64,
    pub half_extents: Vector3<f64>,
    pub cluster: ClusterLabel,

    /// Last frustum test result per viewer
    pub visibility: HashMap<ViewerId, bool>,

    pub history: PositionHistory,

    /// Time of the last `previous_position` recording
    last_record_time: f64,
}

impl EntityState {
    /// Registers a new entity from its first update.
    pub fn from_update(update: &EntityUpdate, now: f64, config: &EntityConfig) -> Self {
        let position = Point3::from(update.position);
        let mut history = PositionHistory::default();
        history.record(now, position, config.history_window);

        let mut entity = Self {
            id: update.id,
            position,
            previous_position: position,
            velocity: Vector3::zeros(),
            speed: 0.0,
            half_extents: Vector3::from(update.half_extents).abs(),
            cluster: ClusterLabel::Unclassified,
            visibility: HashMap::new(),
            history,
            last_record_time: now,
        };
        entity.set_velocity(Vector3::from(update.velocity));
        entity
    }

    /// Builds an entity directly from geometry (tests and simulations).
    pub fn new(id: EntityId, position: Point3<f64>, velocity: Vector3<f64>, half_extents: Vector3<f64>) -> Self {
        let mut entity = Self {
            id,
            position,
            previous_position: position,
            velocity: Vector3::zeros(),
            speed: 0.0,
            half_extents: half_extents.abs(),
            cluster: ClusterLabel::Unclassified,
            visibility: HashMap::new(),
            history: PositionHistory::default(),
            last_record_time: 0.0,
        };
        entity.set_velocity(velocity);
        entity
    }

    /// Applies a motion update received at time `now`.
    ///
    /// `previous_position` is replaced by the pre-update position only when
    /// the recording interval has elapsed.
    pub fn apply_update(&mut self, update: &EntityUpdate, now: f64, config: &EntityConfig) {
        let position = Point3::from(update.position);
        if !position.coords.iter().all(|c| c.is_finite()) {
            warn!("Entity {} reported non-finite position, update ignored", self.id);
            return;
        }

        if now - self.last_record_time >= config.record_interval {
            self.previous_position = self.position;
            self.last_record_time = now;
        }

        self.position = position;
        self.half_extents = Vector3::from(update.half_extents).abs();
        self.set_velocity(Vector3::from(update.velocity));
        self.history.record(now, position, config.history_window);
    }

    fn set_velocity(&mut self, velocity: Vector3<f64>) {
        if velocity.iter().all(|c| c.is_finite()) {
            self.velocity = velocity;
            self.speed = velocity.norm();
        } else {
            warn!("Entity {} reported non-finite velocity, treating as stationary", self.id);
            self.velocity = Vector3::zeros();
            self.speed = 0.0;
        }
    }

    pub fn bounding_box(&self) -> BoundingBox {
        BoundingBox::from_center_extents(self.position, self.half_extents)
    }

    pub fn corners(&self) -> [Point3<f64>; 8] {
        self.bounding_box().corners()
    }

    /// Runs the frustum test and caches the result for `viewer`.
    pub fn refresh_visibility(&mut self, viewer: ViewerId, frustum: &Frustum) -> bool {
        let visible = frustum.contains_any_corner(&self.corners());
        self.visibility.insert(viewer, visible);
        visible
    }

    pub fn is_visible_to(&self, viewer: &ViewerId) -> bool {
        self.visibility.get(viewer).copied().unwrap_or(false)
    }

    pub fn distance_to(&self, other: &EntityState) -> f64 {
        nalgebra::distance(&self.position, &other.position)
    }

    pub fn previous_distance_to(&self, other: &EntityState) -> f64 {
        nalgebra::distance(&self.previous_position, &other.previous_position)
    }

    pub fn position_seconds_ago(&self, now: f64, seconds_ago: f64) -> Option<Point3<f64>> {
        self.history.position_seconds_ago(now, seconds_ago)
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn update(id: EntityId, position: [f64; 3], velocity: [f64; 3]) -> EntityUpdate {
        EntityUpdate {
            id,
            position,
            velocity,
            half_extents: [0.5, 1.0, 0.5],
        }
    }

    #[test]
    fn test_from_update_sets_speed() {
        let id = EntityId::from_seed(1);
        let entity = EntityState::from_update(&update(id, [0.0; 3], [3.0, 4.0, 0.0]), 0.0, &EntityConfig::default());
        assert_relative_eq!(entity.speed, 5.0);
        assert_eq!(entity.cluster, ClusterLabel::Unclassified);
        assert_eq!(entity.history.len(), 1);
    }

    #[test]
    fn test_previous_position_follows_record_interval() {
        let config = EntityConfig::default();
        let id = EntityId::from_seed(1);
        let mut entity = EntityState::from_update(&update(id, [0.0; 3], [0.0; 3]), 0.0, &config);

        entity.apply_update(&update(id, [1.0, 0.0, 0.0], [0.0; 3]), 0.5, &config);
        assert_eq!(entity.previous_position, Point3::origin());

        entity.apply_update(&update(id, [2.0, 0.0, 0.0], [0.0; 3]), 1.0, &config);
        // Recorded the position held just before this update
        assert_eq!(entity.previous_position, Point3::new(1.0, 0.0, 0.0));
        assert_eq!(entity.position, Point3::new(2.0, 0.0, 0.0));
    }

    #[test]
    fn test_nan_velocity_is_sanitized() {
        let config = EntityConfig::default();
        let id = EntityId::from_seed(1);
        let entity = EntityState::from_update(&update(id, [0.0; 3], [f64::NAN, 0.0, 0.0]), 0.0, &config);
        assert_eq!(entity.speed, 0.0);
        assert_eq!(entity.velocity, Vector3::zeros());
    }

    #[test]
    fn test_non_finite_position_is_ignored() {
        let config = EntityConfig::default();
        let id = EntityId::from_seed(1);
        let mut entity = EntityState::from_update(&update(id, [1.0; 3], [0.0; 3]), 0.0, &config);
        entity.apply_update(&update(id, [f64::INFINITY, 0.0, 0.0], [0.0; 3]), 2.0, &config);
        assert_eq!(entity.position, Point3::new(1.0, 1.0, 1.0));
    }

    #[test]
    fn test_history_window_evicts_old_samples() {
        let mut history = PositionHistory::default();
        for t in 0..100 {
            history.record(t as f64, Point3::new(t as f64, 0.0, 0.0), 60.0);
        }
        assert_eq!(history.len(), 61);
        assert_relative_eq!(history.span(), 60.0);
    }

    #[test]
    fn test_position_seconds_ago_picks_closest() {
        let mut history = PositionHistory::default();
        for t in 0..10 {
            history.record(t as f64, Point3::new(t as f64, 0.0, 0.0), 60.0);
        }
        let p = history.position_seconds_ago(9.0, 3.2).unwrap();
        assert_eq!(p, Point3::new(6.0, 0.0, 0.0));
        // Beyond the retained window: the oldest sample
        let p = history.position_seconds_ago(9.0, 500.0).unwrap();
        assert_eq!(p, Point3::origin());
    }

    #[test]
    fn test_cluster_label_raw_encoding() {
        assert_eq!(ClusterLabel::Unclassified.as_raw(), 0);
        assert_eq!(ClusterLabel::Noise.as_raw(), -1);
        assert_eq!(ClusterLabel::Cluster(4).as_raw(), 4);
        assert_eq!(ClusterLabel::Cluster(4).cluster_id(), Some(4));
        assert_eq!(ClusterLabel::Noise.cluster_id(), None);
    }
}
