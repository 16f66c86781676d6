//! The "QUALITY" Engine - bandwidth cost, error and quality per cluster.
//!
//! ```text
//! cost(q)          = α · (e^(N·q) − 1)
//! error(Δ, c, B)   = Δ · c / B
//! base(Δ, ε)       = clamp(1 − Δ/ε, q_min, q_max)
//! quality          = clamp(base · bandFactor(W) · (1 − error), q_min, q_max)
//! ```
//!
//! Quality is always inside `[q_min, q_max]`, including for zero distance,
//! zero bandwidth and non-finite inputs.

use serde::{Deserialize, Serialize};

// ============================================================================
// CONFIGURATION
// ============================================================================

/// One weight-adjustment band: weights up to `max_weight` scale quality by `factor`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WeightBand {
    pub max_weight: f64,
    pub factor: f64,
}

/// Configuration for the QualityModel
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QualityConfig {
    /// α in the bandwidth cost (default: 1.0)
    pub alpha: f64,

    /// N in the bandwidth cost exponent (default: 1.0)
    pub exponent: f64,

    /// γ, the tolerated error before a cluster is split (default: 0.0001)
    pub error_budget: f64,

    /// Lower quality bound (default: 0.1)
    pub min_quality: f64,

    /// Upper quality bound (default: 1.0)
    pub max_quality: f64,

    /// Ascending weight bands (default: 5 → 1.0, 10 → 0.8, 20 → 0.6, 30 → 0.4)
    pub weight_bands: Vec<WeightBand>,

    /// Factor beyond the last band (default: 0.3)
    pub overflow_factor: f64,
}

impl Default for QualityConfig {
    fn default() -> Self {
        Self {
            alpha: 1.0,
            exponent: 1.0,
            error_budget: 0.0001,
            min_quality: 0.1,
            max_quality: 1.0,
            weight_bands: vec![
                WeightBand { max_weight: 5.0, factor: 1.0 },
                WeightBand { max_weight: 10.0, factor: 0.8 },
                WeightBand { max_weight: 20.0, factor: 0.6 },
                WeightBand { max_weight: 30.0, factor: 0.4 },
            ],
            overflow_factor: 0.3,
        }
    }
}

// ============================================================================
// QUALITY MODEL
// ============================================================================

/// Everything the model needs about one cluster.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QualityInput {
    /// Largest member-to-main distance change since the last recording
    pub max_distance_delta: f64,

    /// Current clustering threshold
    pub epsilon: f64,

    /// Cluster weight × viewer weight
    pub aggregate_weight: f64,

    /// Smallest allotted bandwidth among viewers that see the cluster
    pub min_bandwidth: Option<f64>,
}

/// Breakdown of one quality computation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct QualityAssessment {
    pub base: f64,
    pub weight_factor: f64,
    pub cost: f64,
    pub error: f64,
    pub quality: f64,

    /// Error above the budget: the cluster should be re-split
    pub exceeds_budget: bool,
}

#[derive(Debug, Clone, Default)]
pub struct QualityModel {
    config: QualityConfig,
}

impl QualityModel {
    pub fn new(config: QualityConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &QualityConfig {
        &self.config
    }

    pub fn error_budget(&self) -> f64 {
        self.config.error_budget
    }

    /// `α · (e^(N·q) − 1)`
    pub fn bandwidth_cost(&self, quality: f64) -> f64 {
        self.config.alpha * ((self.config.exponent * quality).exp() - 1.0)
    }

    /// `Δ · cost / minBandwidth`; a zero budget yields 0 for zero demand, +∞ otherwise.
    pub fn error(&self, distance_delta: f64, cost: f64, min_bandwidth: f64) -> f64 {
        let demand = distance_delta * cost;
        if !demand.is_finite() {
            return f64::INFINITY;
        }
        if demand <= 0.0 {
            return 0.0;
        }
        if !min_bandwidth.is_finite() || min_bandwidth <= 0.0 {
            return f64::INFINITY;
        }
        demand / min_bandwidth
    }

    /// `clamp(1 − Δ/ε)`; with ε ≤ 0 only a motionless cluster gets full quality.
    pub fn base_quality(&self, max_distance_delta: f64, epsilon: f64) -> f64 {
        let raw = if epsilon > 0.0 && epsilon.is_finite() {
            1.0 - max_distance_delta / epsilon
        } else if max_distance_delta == 0.0 {
            1.0
        } else {
            0.0
        };
        self.clamp_quality(raw)
    }

    /// Band factor for an aggregate weight.
    pub fn weight_factor(&self, total_weight: f64) -> f64 {
        if total_weight.is_nan() {
            return self.config.overflow_factor;
        }
        self.config
            .weight_bands
            .iter()
            .find(|band| total_weight <= band.max_weight)
            .map(|band| band.factor)
            .unwrap_or(self.config.overflow_factor)
    }

    /// Allotted bandwidth of a viewer whose observed cluster has quality `q`.
    pub fn viewer_bandwidth(&self, observed_quality: f64) -> f64 {
        self.bandwidth_cost(self.clamp_quality(observed_quality))
    }

    /// Computes quality and error for one cluster.
    pub fn assess(&self, input: &QualityInput) -> QualityAssessment {
        let base = self.base_quality(input.max_distance_delta, input.epsilon);
        let weight_factor = self.weight_factor(input.aggregate_weight);
        let adjusted = self.clamp_quality(base * weight_factor);
        let cost = self.bandwidth_cost(adjusted);

        let Some(min_bandwidth) = input.min_bandwidth else {
            // Nobody sees it: keep it alive at the floor
            return QualityAssessment {
                base,
                weight_factor,
                cost,
                error: 0.0,
                quality: self.config.min_quality,
                exceeds_budget: false,
            };
        };

        let error = self.error(input.max_distance_delta, cost, min_bandwidth);
        let quality = self.clamp_quality(adjusted * (1.0 - error.min(1.0)));

        QualityAssessment {
            base,
            weight_factor,
            cost,
            error,
            quality,
            exceeds_budget: error > self.config.error_budget,
        }
    }

    /// Clamps into `[q_min, q_max]`, mapping NaN to `q_min`.
    pub fn clamp_quality(&self, q: f64) -> f64 {
        if q.is_nan() {
            self.config.min_quality
        } else {
            q.clamp(self.config.min_quality, self.config.max_quality)
        }
    }
}

// ============================================================================
// QUALITY TIERS
// ============================================================================

/// Compression strength handed to the encoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Compression {
    High,
    Medium,
    Low,
}

/// One row of the output lookup table.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct QualityTier {
    /// Minimum quality for this tier
    pub quality: f64,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub compression: Compression,
}

/// Quantized quality → encoder settings. Never empty.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "Vec<QualityTier>", into = "Vec<QualityTier>")]
pub struct TierTable {
    tiers: Vec<QualityTier>,
}

impl Default for TierTable {
    fn default() -> Self {
        Self::new(vec![
            QualityTier { quality: 0.1, width: 640, height: 480, fps: 15, compression: Compression::High },
            QualityTier { quality: 0.5, width: 1280, height: 720, fps: 30, compression: Compression::Medium },
            QualityTier { quality: 1.0, width: 1920, height: 1080, fps: 60, compression: Compression::Low },
        ])
    }
}

impl From<Vec<QualityTier>> for TierTable {
    fn from(tiers: Vec<QualityTier>) -> Self {
        Self::new(tiers)
    }
}

impl From<TierTable> for Vec<QualityTier> {
    fn from(table: TierTable) -> Self {
        table.tiers
    }
}

impl TierTable {
    /// Builds a table, sorting rows by quality; an empty list gives the default table.
    pub fn new(mut tiers: Vec<QualityTier>) -> Self {
        tiers.retain(|t| t.quality.is_finite());
        tiers.sort_by(|a, b| a.quality.total_cmp(&b.quality));
        if tiers.is_empty() {
            return Self::default();
        }
        Self { tiers }
    }

    /// Highest tier whose threshold is ≤ q; the lowest tier otherwise.
    pub fn lookup(&self, quality: f64) -> QualityTier {
        let lowest = self.minimum();
        if quality.is_nan() {
            return lowest;
        }
        self.tiers
            .iter()
            .rev()
            .find(|tier| tier.quality <= quality + 1e-9)
            .copied()
            .unwrap_or(lowest)
    }

    /// The minimum streaming tier.
    pub fn minimum(&self) -> QualityTier {
        self.tiers[0]
    }

    pub fn tiers(&self) -> &[QualityTier] {
        &self.tiers
    }
}

// ============================================================================
// TESTS
// ============================================================================
