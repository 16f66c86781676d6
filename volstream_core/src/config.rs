//! Engine-wide configuration.
//!
//! Every component keeps its own config struct with documented defaults;
//! [`EngineConfig`] aggregates them so a deployment can override any subset
//! from one JSON document. Missing fields fall back to the defaults.

use crate::control::ControlConfig;
use crate::entity::EntityConfig;
use crate::graph::GraphConfig;
use crate::greedy::GreedyConfig;
use crate::quality::{QualityConfig, TierTable};
use crate::refinement::RefinementConfig;
use crate::threshold::ThresholdConfig;
use crate::visibility::VisibilityConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::str::FromStr;

/// Which clustering strategy the manager runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    /// Connected components + iterative refinement
    #[default]
    Graph,
    /// Radius/speed agglomeration with an explicit loss
    Greedy,
}

impl StrategyKind {
    pub fn name(&self) -> &'static str {
        match self {
            StrategyKind::Graph => "graph",
            StrategyKind::Greedy => "greedy",
        }
    }
}

impl FromStr for StrategyKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "graph" => Ok(StrategyKind::Graph),
            "greedy" => Ok(StrategyKind::Greedy),
            other => Err(ConfigError::UnknownStrategy(other.to_string())),
        }
    }
}

/// Configuration of the whole engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub strategy: StrategyKind,
    pub entity: EntityConfig,
    pub graph: GraphConfig,

    /// Apply the bandwidth-sharing discount before clustering (default: true)
    pub bandwidth_sharing: bool,

    pub threshold: ThresholdConfig,
    pub visibility: VisibilityConfig,
    pub quality: QualityConfig,
    pub tiers: TierTable,
    pub refinement: RefinementConfig,
    pub greedy: GreedyConfig,
    pub control: ControlConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            strategy: StrategyKind::Graph,
            entity: EntityConfig::default(),
            graph: GraphConfig::default(),
            bandwidth_sharing: true,
            threshold: ThresholdConfig::default(),
            visibility: VisibilityConfig::default(),
            quality: QualityConfig::default(),
            tiers: TierTable::default(),
            refinement: RefinementConfig::default(),
            greedy: GreedyConfig::default(),
            control: ControlConfig::default(),
        }
    }
}

impl EngineConfig {
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path.as_ref())?;
        Self::from_json_str(&text)
    }

    pub fn with_strategy(mut self, strategy: StrategyKind) -> Self {
        self.strategy = strategy;
        self
    }

    /// Rejects values no component can work with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let q = &self.quality;
        if !(q.min_quality.is_finite() && q.max_quality.is_finite()) || q.min_quality > q.max_quality {
            return Err(ConfigError::Invalid(format!(
                "quality range [{}, {}] is empty",
                q.min_quality, q.max_quality
            )));
        }
        if !(0.0..1.0).contains(&self.threshold.confidence) {
            return Err(ConfigError::Invalid(format!(
                "threshold confidence {} outside [0, 1)",
                self.threshold.confidence
            )));
        }
        if self.control.tick_rate_hz == 0 {
            return Err(ConfigError::Invalid("tick rate must be positive".to_string()));
        }
        Ok(())
    }
}

// ============================================================================
// ERRORS
// ============================================================================

/// Errors that can occur while loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid config: {0}")]
    Invalid(String),

    #[error("Unknown strategy: {0}")]
    UnknownStrategy(String),
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::EdgeWeighting;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.strategy, StrategyKind::Graph);
        assert_eq!(config.refinement.max_iterations, 5);
        assert_eq!(config.threshold.initial_epsilon, 1.0);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config = EngineConfig::from_json_str(
            r#"{ "strategy": "greedy", "graph": { "weighting": "motion" }, "quality": { "error_budget": 0.01 } }"#,
        )
        .unwrap();
        assert_eq!(config.strategy, StrategyKind::Greedy);
        assert_eq!(config.graph.weighting, EdgeWeighting::Motion);
        assert_eq!(config.graph.volatility_lambda, 1.0);
        assert_eq!(config.quality.error_budget, 0.01);
        assert_eq!(config.quality.weight_bands.len(), 4);
        assert_eq!(config.control.cycle_every_ticks, 10);
        assert!(config.bandwidth_sharing);
    }

    #[test]
    fn test_invalid_json() {
        assert!(matches!(EngineConfig::from_json_str("{ nope"), Err(ConfigError::Parse(_))));
        assert!(matches!(
            EngineConfig::from_json_str(r#"{ "quality": { "min_quality": 0.9, "max_quality": 0.2 } }"#),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn test_missing_file() {
        assert!(matches!(EngineConfig::load("/nonexistent/volstream.json"), Err(ConfigError::Io(_))));
    }

    #[test]
    fn test_strategy_from_str() {
        assert_eq!("Greedy".parse::<StrategyKind>().unwrap(), StrategyKind::Greedy);
        assert!("kmeans".parse::<StrategyKind>().is_err());
    }

    #[test]
    fn test_round_trip_through_json() {
        let json = serde_json::to_string(&EngineConfig::default()).unwrap();
        let config = EngineConfig::from_json_str(&json).unwrap();
        assert_eq!(config.tiers, TierTable::default());
    }
}
