//! VolStream Core - Adaptive Clustering & Quality Allocation for Volumetric Streaming
//!
//! Groups moving entities into clusters that can be captured and encoded
//! together, then picks a quality level per cluster that fits each viewer's
//! bandwidth:
//! 1. **Graph**: entity-entity edges weighted by distance and motion
//!    similarity, viewer-entity edges weighted by distance
//! 2. **Threshold**: the link cutoff ε recalibrated from a Weibull fit of
//!    observed distance changes
//! 3. **Refinement**: components are re-checked against visibility, error
//!    budget and quality until they stop changing (at most 5 passes)
//! 4. **Publication**: a versioned, immutable snapshot swapped atomically

pub mod cluster;
pub mod config;
pub mod control;
pub mod entity;
pub mod geometry;
pub mod graph;
pub mod greedy;
pub mod manager;
pub mod metrics;
pub mod quality;
pub mod refinement;
pub mod scene;
pub mod snapshot;
pub mod threshold;
pub mod viewer;
pub mod visibility;

// Re-export key types for convenience
pub use cluster::{Cluster, ClusteringStrategy, ConvergencePolicy, CycleReport, LinkPolicy};
pub use config::{ConfigError, EngineConfig, StrategyKind};
pub use control::{ControlConfig, ControlError, ControlLoop};
pub use entity::{ClusterLabel, EntityState};
pub use geometry::{BoundingBox, Frustum, Plane, ScreenRect};
pub use graph::{EdgeWeighting, WeightedGraph, WeightedGraphBuilder};
pub use greedy::GreedyStrategy;
pub use manager::ClusterManager;
pub use metrics::{CycleMetrics, MetricsSummary};
pub use quality::{QualityModel, QualityTier, TierTable};
pub use refinement::GraphStrategy;
pub use scene::{Scene, SceneSnapshot};
pub use snapshot::{ClusterDecision, ClusterSnapshot, DecisionBatch};
pub use threshold::{ThresholdError, ThresholdEstimator, WeibullFit};
pub use viewer::ViewerState;
pub use visibility::{LodLevel, VisibilityEvaluator};
