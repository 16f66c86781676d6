//! Published cycle results.
//!
//! A [`ClusterSnapshot`] is built once per cycle, then frozen behind an
//! `Arc` and only ever read. Collaborators query it by id; the streaming
//! side receives the compact [`DecisionBatch`] instead.

use crate::cluster::{Cluster, ClusterView, CycleReport};
use crate::entity::ClusterLabel;
use crate::graph::GraphStats;
use crate::quality::QualityTier;
use crate::visibility::LodLevel;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use volstream_env::{DecisionEnvelope, EntityId, ViewerId};

/// Immutable result of one clustering cycle.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClusterSnapshot {
    /// Monotonic, 0 for the initial empty snapshot
    pub version: u64,

    /// Scene time of the input snapshot (seconds)
    pub time: f64,

    /// Name of the strategy that produced it
    pub strategy: String,

    pub epsilon: f64,

    /// Whether ε was refitted this cycle
    pub recalibrated: bool,

    pub clusters: Vec<Cluster>,

    /// Label of every entity present in the cycle
    pub assignment: HashMap<EntityId, ClusterLabel>,

    pub iterations: usize,
    pub converged: bool,
    pub report: CycleReport,
    pub graph: GraphStats,
}

impl ClusterSnapshot {
    /// Snapshot published before the first cycle.
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn cluster(&self, id: u32) -> Option<&Cluster> {
        // Ids are dense and 1-based
        self.clusters
            .get((id as usize).wrapping_sub(1))
            .filter(|c| c.id == id)
            .or_else(|| self.clusters.iter().find(|c| c.id == id))
    }

    /// Label of an entity; `Unclassified` if the cycle never saw it.
    pub fn label_of(&self, entity: &EntityId) -> ClusterLabel {
        self.assignment.get(entity).copied().unwrap_or_default()
    }

    pub fn cluster_of(&self, entity: &EntityId) -> Option<u32> {
        self.label_of(entity).cluster_id()
    }

    pub fn quality_of(&self, cluster: u32) -> Option<f64> {
        self.cluster(cluster).map(|c| c.quality)
    }

    pub fn is_visible(&self, cluster: u32, viewer: &ViewerId) -> bool {
        self.cluster(cluster).is_some_and(|c| c.is_visible_to(viewer))
    }

    pub fn tier_of(&self, cluster: u32) -> Option<QualityTier> {
        self.cluster(cluster).map(|c| c.tier)
    }

    /// Entities labelled `Noise`.
    pub fn noise(&self) -> impl Iterator<Item = &EntityId> {
        self.assignment
            .iter()
            .filter(|(_, label)| **label == ClusterLabel::Noise)
            .map(|(id, _)| id)
    }

    /// Each clustered entity mapped to the viewers of its cluster.
    pub fn viewers_by_entity(&self) -> HashMap<EntityId, BTreeSet<ViewerId>> {
        self.clusters
            .iter()
            .flat_map(|c| c.members.iter().map(move |m| (*m, c.visible_viewers.clone())))
            .collect()
    }

    /// Best quality among the clusters a viewer sees.
    pub fn observed_quality(&self, viewer: &ViewerId) -> Option<f64> {
        self.clusters
            .iter()
            .filter(|c| c.is_visible_to(viewer))
            .map(|c| c.quality)
            .reduce(f64::max)
    }

    pub fn entity_count(&self) -> usize {
        self.assignment.len()
    }

    /// Compact decision batch for the streaming side.
    pub fn decisions(&self) -> DecisionBatch {
        let mut noise: Vec<EntityId> = self.noise().copied().collect();
        noise.sort();
        DecisionBatch {
            version: self.version,
            time: self.time,
            epsilon: self.epsilon,
            clusters: self
                .clusters
                .iter()
                .map(|c| ClusterDecision {
                    id: c.id,
                    members: c.members.clone(),
                    main_entity: c.main_entity,
                    quality: c.quality,
                    tier: c.tier,
                    lod: c.lod,
                    views: c.views.clone(),
                })
                .collect(),
            noise,
        }
    }
}

// ============================================================================
// DECISIONS
// ============================================================================

/// Capture and encoding decision for one cluster.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterDecision {
    pub id: u32,
    pub members: Vec<EntityId>,
    pub main_entity: EntityId,
    pub quality: f64,
    pub tier: QualityTier,
    pub lod: LodLevel,
    pub views: Vec<ClusterView>,
}

/// Everything the streaming side needs from one cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionBatch {
    pub version: u64,
    pub time: f64,
    pub epsilon: f64,
    pub clusters: Vec<ClusterDecision>,

    /// Entities not streamed this cycle
    pub noise: Vec<EntityId>,
}

impl DecisionBatch {
    /// Serializes into a sink envelope.
    pub fn to_envelope(&self, timestamp_ms: u64) -> Result<DecisionEnvelope, serde_json::Error> {
        let payload = serde_json::to_vec(self)?;
        Ok(DecisionEnvelope::new(payload, timestamp_ms, self.version))
    }

    pub fn from_envelope(envelope: &DecisionEnvelope) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(&envelope.payload)
    }
}

// ============================================================================
// TESTS
// ============================================================================
