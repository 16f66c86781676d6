//! Rolling cycle statistics.
//!
//! Tracks the last N cycles for:
//! - **Duration**: wall time of graph build + strategy
//! - **Iterations**: refinement passes used, and how often the cap was hit
//! - **Graph size**: edges built per cycle
//! - **Output**: clusters and dropped clusters per cycle

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::Duration;

/// Default number of cycles kept.
pub const DEFAULT_WINDOW: usize = 100;

/// One cycle's measurements.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CycleSample {
    pub duration: Duration,
    pub iterations: usize,
    pub converged: bool,
    pub edges: usize,
    pub clusters: usize,
    pub dropped: usize,
}

/// Aggregates over the current window.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricsSummary {
    pub cycles: usize,
    pub mean_duration_ms: f64,
    pub max_duration_ms: f64,
    pub mean_iterations: f64,

    /// Fraction of cycles that stopped on the iteration cap
    pub non_converged_ratio: f64,

    pub mean_edges: f64,
    pub mean_clusters: f64,
    pub total_dropped: usize,
}

#[derive(Debug, Clone)]
pub struct CycleMetrics {
    window: usize,
    samples: VecDeque<CycleSample>,
    total_cycles: u64,
}

impl Default for CycleMetrics {
    fn default() -> Self {
        Self::new(DEFAULT_WINDOW)
    }
}

impl CycleMetrics {
    pub fn new(window: usize) -> Self {
        let window = window.max(1);
        Self {
            window,
            samples: VecDeque::with_capacity(window),
            total_cycles: 0,
        }
    }

    pub fn record(&mut self, sample: CycleSample) {
        if self.samples.len() == self.window {
            self.samples.pop_front();
        }
        self.samples.push_back(sample);
        self.total_cycles += 1;
    }

    /// Cycles recorded since creation, including those out of the window.
    pub fn total_cycles(&self) -> u64 {
        self.total_cycles
    }

    pub fn last(&self) -> Option<&CycleSample> {
        self.samples.back()
    }

    pub fn summary(&self) -> MetricsSummary {
        let n = self.samples.len();
        if n == 0 {
            return MetricsSummary::default();
        }
        let nf = n as f64;
        let ms = |d: Duration| d.as_secs_f64() * 1000.0;

        MetricsSummary {
            cycles: n,
            mean_duration_ms: self.samples.iter().map(|s| ms(s.duration)).sum::<f64>() / nf,
            max_duration_ms: self.samples.iter().map(|s| ms(s.duration)).fold(0.0, f64::max),
            mean_iterations: self.samples.iter().map(|s| s.iterations as f64).sum::<f64>() / nf,
            non_converged_ratio: self.samples.iter().filter(|s| !s.converged).count() as f64 / nf,
            mean_edges: self.samples.iter().map(|s| s.edges as f64).sum::<f64>() / nf,
            mean_clusters: self.samples.iter().map(|s| s.clusters as f64).sum::<f64>() / nf,
            total_dropped: self.samples.iter().map(|s| s.dropped).sum(),
        }
    }
}
