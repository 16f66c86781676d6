//! Arena of tracked entities and viewers.
//!
//! Updates from the tracking, camera and transport layers land here as they
//! arrive. Each cycle works on a [`SceneSnapshot`], an owned copy taken
//! before the cycle starts, so in-flight updates never touch a running cycle.

use crate::entity::{EntityConfig, EntityState};
use crate::snapshot::ClusterSnapshot;
use crate::viewer::ViewerState;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;
use volstream_env::{EntityId, TrackingUpdate, ViewerId};

/// Mutable scene owned by the control loop (single writer).
#[derive(Debug, Clone, Default)]
pub struct Scene {
    entities: Vec<EntityState>,
    entity_index: HashMap<EntityId, usize>,
    viewers: Vec<ViewerState>,
    viewer_index: HashMap<ViewerId, usize>,

    /// Latest available-bandwidth estimate per viewer (Mbps)
    bandwidth: HashMap<ViewerId, f64>,

    config: EntityConfig,
}

impl Scene {
    pub fn new(config: EntityConfig) -> Self {
        Self {
            config,
            ..Default::default()
        }
    }

    /// Applies one collaborator update received at time `now` (seconds).
    pub fn apply(&mut self, update: &TrackingUpdate, now: f64) {
        match update {
            TrackingUpdate::Entity(u) => match self.entity_index.get(&u.id) {
                Some(&idx) => self.entities[idx].apply_update(u, now, &self.config),
                None => {
                    debug!("Registering entity {}", u.id);
                    self.insert_entity(EntityState::from_update(u, now, &self.config));
                }
            },
            TrackingUpdate::EntityRemoved(id) => {
                self.remove_entity(id);
            }
            TrackingUpdate::Viewer(u) => match self.viewer_index.get(&u.id) {
                Some(&idx) => self.viewers[idx].apply_update(u),
                None => {
                    debug!("Viewer {} connected", u.id);
                    self.insert_viewer(ViewerState::from_update(u));
                }
            },
            TrackingUpdate::ViewerRemoved(id) => {
                self.remove_viewer(id);
            }
            TrackingUpdate::Bandwidth(b) => {
                if b.available_mbps.is_finite() && b.available_mbps >= 0.0 {
                    self.bandwidth.insert(b.viewer, b.available_mbps);
                }
            }
        }
    }

    /// Inserts or replaces an entity.
    pub fn insert_entity(&mut self, entity: EntityState) {
        match self.entity_index.get(&entity.id) {
            Some(&idx) => self.entities[idx] = entity,
            None => {
                self.entity_index.insert(entity.id, self.entities.len());
                self.entities.push(entity);
            }
        }
    }

    /// Removes an entity, keeping the index consistent after the swap.
    pub fn remove_entity(&mut self, id: &EntityId) -> Option<EntityState> {
        let idx = self.entity_index.remove(id)?;
        let removed = self.entities.swap_remove(idx);
        if let Some(moved) = self.entities.get(idx) {
            self.entity_index.insert(moved.id, idx);
        }
        Some(removed)
    }

    pub fn insert_viewer(&mut self, viewer: ViewerState) {
        match self.viewer_index.get(&viewer.id) {
            Some(&idx) => self.viewers[idx] = viewer,
            None => {
                self.viewer_index.insert(viewer.id, self.viewers.len());
                self.viewers.push(viewer);
            }
        }
    }

    /// Disconnects a viewer and forgets its bandwidth estimate.
    pub fn remove_viewer(&mut self, id: &ViewerId) -> Option<ViewerState> {
        self.bandwidth.remove(id);
        let idx = self.viewer_index.remove(id)?;
        let removed = self.viewers.swap_remove(idx);
        if let Some(moved) = self.viewers.get(idx) {
            self.viewer_index.insert(moved.id, idx);
        }
        for entity in &mut self.entities {
            entity.visibility.remove(id);
        }
        Some(removed)
    }

    pub fn set_bandwidth(&mut self, viewer: ViewerId, mbps: f64) {
        self.bandwidth.insert(viewer, mbps);
    }

    pub fn entity(&self, id: &EntityId) -> Option<&EntityState> {
        self.entity_index.get(id).map(|&idx| &self.entities[idx])
    }

    pub fn entity_mut(&mut self, id: &EntityId) -> Option<&mut EntityState> {
        let idx = *self.entity_index.get(id)?;
        self.entities.get_mut(idx)
    }

    pub fn viewer(&self, id: &ViewerId) -> Option<&ViewerState> {
        self.viewer_index.get(id).map(|&idx| &self.viewers[idx])
    }

    pub fn entities(&self) -> impl Iterator<Item = &EntityState> {
        self.entities.iter()
    }

    pub fn viewers(&self) -> impl Iterator<Item = &ViewerState> {
        self.viewers.iter()
    }

    pub fn entity_count(&self) -> usize {
        self.entities.len()
    }

    pub fn viewer_count(&self) -> usize {
        self.viewers.len()
    }

    /// Writes a published cycle's labels and per-viewer visibility back.
    ///
    /// Entities the cycle never saw keep their state.
    pub fn apply_labels(&mut self, snapshot: &ClusterSnapshot) {
        let viewer_ids: Vec<ViewerId> = self.viewers.iter().map(|v| v.id).collect();
        for entity in &mut self.entities {
            let Some(label) = snapshot.assignment.get(&entity.id) else {
                continue;
            };
            entity.cluster = *label;
            let cluster = label.cluster_id().and_then(|id| snapshot.cluster(id));
            for viewer in &viewer_ids {
                let visible = cluster.is_some_and(|c| c.is_visible_to(viewer));
                entity.visibility.insert(*viewer, visible);
            }
        }
    }

    /// Copies the current state for one cycle.
    pub fn snapshot(&self, time: f64) -> SceneSnapshot {
        SceneSnapshot {
            time,
            entities: Arc::new(self.entities.clone()),
            index: Arc::new(self.entity_index.clone()),
            viewers: Arc::new(self.viewers.clone()),
            bandwidth: self.bandwidth.clone(),
        }
    }
}

/// Immutable copy of the scene taken at the start of a cycle.
#[derive(Debug, Clone)]
pub struct SceneSnapshot {
    /// Scene time (seconds) when the copy was taken
    pub time: f64,
    pub entities: Arc<Vec<EntityState>>,
    index: Arc<HashMap<EntityId, usize>>,
    pub viewers: Arc<Vec<ViewerState>>,
    pub bandwidth: HashMap<ViewerId, f64>,
}

impl SceneSnapshot {
    /// Builds a snapshot directly from states (tests and offline use).
    pub fn from_parts(entities: Vec<EntityState>, viewers: Vec<ViewerState>) -> Self {
        let index = entities.iter().enumerate().map(|(i, e)| (e.id, i)).collect();
        Self {
            time: 0.0,
            entities: Arc::new(entities),
            index: Arc::new(index),
            viewers: Arc::new(viewers),
            bandwidth: HashMap::new(),
        }
    }

    pub fn with_bandwidth(mut self, viewer: ViewerId, mbps: f64) -> Self {
        self.bandwidth.insert(viewer, mbps);
        self
    }

    /// Arena index of an entity id.
    pub fn entity_index(&self, id: &EntityId) -> Option<usize> {
        self.index.get(id).copied()
    }

    pub fn entity(&self, id: &EntityId) -> Option<&EntityState> {
        self.entity_index(id).and_then(|idx| self.entities.get(idx))
    }

    pub fn available_bandwidth(&self, viewer: &ViewerId) -> Option<f64> {
        self.bandwidth.get(viewer).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use volstream_env::{BandwidthUpdate, EntityUpdate, ProjectionParams, ViewerUpdate};

    fn entity_update(seed: u64, x: f64) -> TrackingUpdate {
        TrackingUpdate::Entity(EntityUpdate {
            id: EntityId::from_seed(seed),
            position: [x, 0.0, 0.0],
            velocity: [0.0; 3],
            half_extents: [0.5; 3],
        })
    }

    fn viewer_update(seed: u64) -> TrackingUpdate {
        TrackingUpdate::Viewer(ViewerUpdate {
            id: ViewerId::from_seed(seed),
            position: [0.0, 0.0, 10.0],
            forward: [0.0, 0.0, -1.0],
            up: [0.0, 1.0, 0.0],
            projection: ProjectionParams::default(),
        })
    }

    #[test]
    fn test_apply_registers_and_updates() {
        let mut scene = Scene::default();
        scene.apply(&entity_update(1, 0.0), 0.0);
        scene.apply(&entity_update(1, 2.0), 0.1);
        assert_eq!(scene.entity_count(), 1);
        assert_eq!(scene.entity(&EntityId::from_seed(1)).unwrap().position.x, 2.0);
    }

    #[test]
    fn test_remove_entity_keeps_index_consistent() {
        let mut scene = Scene::default();
        for seed in 1..=3 {
            scene.apply(&entity_update(seed, seed as f64), 0.0);
        }
        scene.apply(&TrackingUpdate::EntityRemoved(EntityId::from_seed(1)), 0.0);

        assert_eq!(scene.entity_count(), 2);
        assert!(scene.entity(&EntityId::from_seed(1)).is_none());
        assert_eq!(scene.entity(&EntityId::from_seed(3)).unwrap().position.x, 3.0);
        assert_eq!(scene.entity(&EntityId::from_seed(2)).unwrap().position.x, 2.0);
    }

    #[test]
    fn test_viewer_removal_drops_bandwidth() {
        let mut scene = Scene::default();
        scene.apply(&viewer_update(1), 0.0);
        scene.apply(
            &TrackingUpdate::Bandwidth(BandwidthUpdate {
                viewer: ViewerId::from_seed(1),
                available_mbps: 25.0,
            }),
            0.0,
        );
        assert_eq!(scene.snapshot(0.0).available_bandwidth(&ViewerId::from_seed(1)), Some(25.0));

        scene.apply(&TrackingUpdate::ViewerRemoved(ViewerId::from_seed(1)), 1.0);
        assert_eq!(scene.viewer_count(), 0);
        assert_eq!(scene.snapshot(1.0).available_bandwidth(&ViewerId::from_seed(1)), None);
    }

    #[test]
    fn test_invalid_bandwidth_is_ignored() {
        let mut scene = Scene::default();
        scene.apply(
            &TrackingUpdate::Bandwidth(BandwidthUpdate {
                viewer: ViewerId::from_seed(1),
                available_mbps: f64::NAN,
            }),
            0.0,
        );
        assert!(scene.snapshot(0.0).bandwidth.is_empty());
    }

    #[test]
    fn test_snapshot_is_isolated_from_later_updates() {
        let mut scene = Scene::default();
        scene.apply(&entity_update(1, 0.0), 0.0);
        let snapshot = scene.snapshot(0.0);
        scene.apply(&entity_update(1, 9.0), 0.5);

        assert_eq!(snapshot.entities[0].position.x, 0.0);
        assert_eq!(scene.entity(&EntityId::from_seed(1)).unwrap().position.x, 9.0);
    }

    #[test]
    fn test_apply_labels_writes_cluster_and_visibility() {
        use crate::entity::ClusterLabel;
        use crate::manager::ClusterManager;

        let mut scene = Scene::default();
        scene.apply(&entity_update(1, 0.0), 0.0);
        scene.apply(&entity_update(2, 40.0), 0.0);
        scene.apply(
            &TrackingUpdate::Viewer(ViewerUpdate {
                id: ViewerId::from_seed(1),
                position: [0.0, 0.0, 5.0],
                forward: [0.0, 0.0, -1.0],
                up: [0.0, 1.0, 0.0],
                projection: ProjectionParams::default(),
            }),
            0.0,
        );

        let snapshot = ClusterManager::with_defaults().run_cycle(&scene.snapshot(0.0));
        scene.apply_labels(&snapshot);

        let near = scene.entity(&EntityId::from_seed(1)).unwrap();
        assert!(matches!(near.cluster, ClusterLabel::Cluster(_)));
        assert!(near.is_visible_to(&ViewerId::from_seed(1)));

        let far = scene.entity(&EntityId::from_seed(2)).unwrap();
        assert_eq!(far.cluster, ClusterLabel::Noise);
        assert!(!far.is_visible_to(&ViewerId::from_seed(1)));
    }
}
