//! The "THRESHOLD" Engine - self-calibrating clustering cutoff.
//!
//! Derives ε from recent distance-change samples with an extreme-value fit:
//! 1. Three-parameter Weibull negative log-likelihood over the samples
//! 2. Derivative-free Nelder–Mead minimization from `(0.9·min, mean, 1)`
//! 3. ε = μ + σ·(−ln(1 − p))^(1/ξ) at confidence p
//!
//! Densities and quantiles come from `statrs`; the simplex is local.
//!
//! Every failure is recoverable: the estimator keeps the previous ε.

use nalgebra::Vector3;
use serde::{Deserialize, Serialize};
use statrs::distribution::{Continuous, ContinuousCDF, Weibull};
use tracing::{debug, warn};

/// Minimum number of samples for a fit.
pub const MIN_SAMPLES: usize = 3;

// ============================================================================
// CONFIGURATION
// ============================================================================

/// Configuration for the ThresholdEstimator
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ThresholdConfig {
    /// Quantile p used to derive ε (default: 0.99)
    pub confidence: f64,

    /// ε before the first successful fit (default: 1.0)
    pub initial_epsilon: f64,

    /// Simplex convergence tolerance (default: 1e-8)
    pub tolerance: f64,

    /// Simplex iteration budget (default: 10 000)
    pub max_iterations: usize,

    /// Samples fed to one fit; larger sets are thinned by a fixed stride (default: 2048)
    pub max_samples: usize,
}

impl Default for ThresholdConfig {
    fn default() -> Self {
        Self {
            confidence: 0.99,
            initial_epsilon: 1.0,
            tolerance: 1e-8,
            max_iterations: 10_000,
            max_samples: 2048,
        }
    }
}

// ============================================================================
// NELDER–MEAD
// ============================================================================

/// Result of a simplex minimization.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Minimum {
    pub point: Vector3<f64>,
    pub value: f64,
    pub iterations: usize,
}

/// Derivative-free simplex minimizer over three parameters.
#[derive(Debug, Clone, Copy)]
pub struct NelderMead {
    pub tolerance: f64,
    pub max_iterations: usize,
}

impl NelderMead {
    const REFLECTION: f64 = 1.0;
    const EXPANSION: f64 = 2.0;
    const CONTRACTION: f64 = 0.5;
    const SHRINK: f64 = 0.5;
    const JITTER: f64 = 1e-10;

    pub fn new(tolerance: f64, max_iterations: usize) -> Self {
        Self {
            tolerance,
            max_iterations,
        }
    }

    /// Minimizes `f` starting from `start`.
    ///
    /// The initial simplex perturbs each coordinate by 5% (0.00025 for zero
    /// coordinates). Fails with `NonConvergence` when the budget runs out.
    pub fn minimize<F>(&self, f: F, start: Vector3<f64>) -> Result<Minimum, ThresholdError>
    where
        F: Fn(&Vector3<f64>) -> f64,
    {
        let mut simplex: Vec<(Vector3<f64>, f64)> = Vec::with_capacity(4);
        simplex.push((start, f(&start)));
        for axis in 0..3 {
            let mut vertex = start;
            vertex[axis] = if vertex[axis] != 0.0 {
                vertex[axis] * 1.05
            } else {
                0.00025
            };
            simplex.push((vertex, f(&vertex)));
        }

        for iteration in 0..self.max_iterations {
            simplex.sort_by(|a, b| a.1.total_cmp(&b.1));

            if self.converged(&simplex) {
                let (point, value) = simplex[0];
                return Ok(Minimum {
                    point,
                    value,
                    iterations: iteration,
                });
            }

            let centroid = (simplex[0].0 + simplex[1].0 + simplex[2].0) / 3.0;
            let worst = simplex[3];

            let reflected = centroid + (centroid - worst.0) * Self::REFLECTION;
            let f_reflected = f(&reflected);

            if f_reflected < simplex[0].1 {
                let expanded = centroid + (reflected - centroid) * Self::EXPANSION;
                let f_expanded = f(&expanded);
                simplex[3] = if f_expanded < f_reflected {
                    (expanded, f_expanded)
                } else {
                    (reflected, f_reflected)
                };
                continue;
            }

            if f_reflected < simplex[2].1 {
                simplex[3] = (reflected, f_reflected);
                continue;
            }

            // Contract towards the better of the worst and reflected points
            let (toward, f_toward) = if f_reflected < worst.1 {
                (reflected, f_reflected)
            } else {
                (worst.0, worst.1)
            };
            let contracted = centroid + (toward - centroid) * Self::CONTRACTION;
            let f_contracted = f(&contracted);
            if f_contracted < f_toward {
                simplex[3] = (contracted, f_contracted);
                continue;
            }

            let best = simplex[0].0;
            for vertex in simplex.iter_mut().skip(1) {
                let shrunk = best + (vertex.0 - best) * Self::SHRINK;
                *vertex = (shrunk, f(&shrunk));
            }
        }

        Err(ThresholdError::NonConvergence {
            iterations: self.max_iterations,
        })
    }

    /// Relative spread between the best and worst values is within
    /// tolerance, or the simplex has collapsed to a single point.
    fn converged(&self, simplex: &[(Vector3<f64>, f64)]) -> bool {
        let (best, f_lo) = simplex[0];
        let f_hi = simplex[3].1;
        if !f_lo.is_finite() {
            return false;
        }
        if f_hi.is_finite() {
            let spread = 2.0 * (f_hi - f_lo).abs() / (f_hi.abs() + f_lo.abs() + Self::JITTER);
            if spread <= self.tolerance {
                return true;
            }
        }
        let extent = f64::EPSILON * best.amax().max(1.0);
        simplex[1..].iter().all(|(point, _)| (point - best).amax() <= extent)
    }
}

// ============================================================================
// WEIBULL FIT
// ============================================================================

/// Fitted three-parameter Weibull distribution.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WeibullFit {
    /// μ
    pub location: f64,
    /// σ
    pub scale: f64,
    /// ξ
    pub shape: f64,
}

impl WeibullFit {
    /// Quantile `μ + σ·(−ln(1 − p))^(1/ξ)`; NaN for unusable parameters
    /// or p outside [0, 1).
    pub fn quantile(&self, p: f64) -> f64 {
        if !(0.0..1.0).contains(&p) {
            return f64::NAN;
        }
        match Weibull::new(self.shape, self.scale) {
            Ok(distribution) => self.location + distribution.inverse_cdf(p),
            Err(_) => f64::NAN,
        }
    }

    pub fn is_finite(&self) -> bool {
        self.location.is_finite() && self.scale.is_finite() && self.shape.is_finite()
    }
}

/// Negative log-likelihood of the samples; +∞ outside the feasible region.
pub fn weibull_nll(params: &Vector3<f64>, samples: &[f64]) -> f64 {
    let (location, scale, shape) = (params[0], params[1], params[2]);
    if scale <= 0.0 || shape <= 0.0 || !location.is_finite() {
        return f64::INFINITY;
    }
    let Ok(distribution) = Weibull::new(shape, scale) else {
        return f64::INFINITY;
    };

    let mut log_likelihood = 0.0;
    for &x in samples {
        if x <= location {
            return f64::INFINITY;
        }
        log_likelihood += distribution.ln_pdf(x - location);
    }

    let nll = -log_likelihood;
    if nll.is_nan() {
        f64::INFINITY
    } else {
        nll
    }
}

/// Maximum-likelihood Weibull fitter.
#[derive(Debug, Clone, Copy)]
pub struct WeibullFitter {
    optimizer: NelderMead,
}

impl Default for WeibullFitter {
    fn default() -> Self {
        let config = ThresholdConfig::default();
        Self::new(config.tolerance, config.max_iterations)
    }
}

impl WeibullFitter {
    pub fn new(tolerance: f64, max_iterations: usize) -> Self {
        Self {
            optimizer: NelderMead::new(tolerance, max_iterations),
        }
    }

    /// Fits `(location, scale, shape)` to the samples.
    ///
    /// Deterministic for a given sample slice.
    pub fn fit(&self, samples: &[f64]) -> Result<WeibullFit, ThresholdError> {
        if samples.len() < MIN_SAMPLES {
            return Err(ThresholdError::InsufficientSamples {
                got: samples.len(),
                required: MIN_SAMPLES,
            });
        }
        if samples.iter().any(|x| !x.is_finite()) {
            return Err(ThresholdError::NonFiniteSample);
        }

        let min = samples.iter().copied().fold(f64::INFINITY, f64::min);
        let max = samples.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        let mean = samples.iter().sum::<f64>() / samples.len() as f64;

        // Identical samples: the likelihood is unbounded, use a closed form
        if max - min <= f64::EPSILON * max.abs().max(1.0) {
            let margin = (0.1 * min.abs()).max(1e-3);
            return Ok(WeibullFit {
                location: min - margin,
                scale: margin,
                shape: 1.0,
            });
        }

        let mut location = 0.9 * min;
        if location >= min {
            location = min - 0.1 * (max - min);
        }
        let scale = if mean > 0.0 { mean } else { max - min };
        let start = Vector3::new(location, scale, 1.0);

        let minimum = self.optimizer.minimize(|p| weibull_nll(p, samples), start)?;
        if !minimum.value.is_finite() {
            return Err(ThresholdError::Infeasible);
        }

        let fit = WeibullFit {
            location: minimum.point[0],
            scale: minimum.point[1],
            shape: minimum.point[2],
        };
        debug!(
            "Weibull fit μ={:.4} σ={:.4} ξ={:.4} after {} iterations",
            fit.location, fit.scale, fit.shape, minimum.iterations
        );
        Ok(fit)
    }
}

// ============================================================================
// THRESHOLD ESTIMATOR
// ============================================================================

/// Outcome of one recalibration attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum Recalibration {
    /// ε replaced by a fresh fit
    Updated { epsilon: f64, fit: WeibullFit },
    /// ε unchanged; the reason is kept for reporting
    Retained { epsilon: f64, reason: ThresholdError },
}

impl Recalibration {
    pub fn epsilon(&self) -> f64 {
        match self {
            Recalibration::Updated { epsilon, .. } | Recalibration::Retained { epsilon, .. } => *epsilon,
        }
    }

    pub fn is_updated(&self) -> bool {
        matches!(self, Recalibration::Updated { .. })
    }
}

/// Holds the current ε and the fit it came from.
#[derive(Debug, Clone)]
pub struct ThresholdEstimator {
    config: ThresholdConfig,
    fitter: WeibullFitter,
    epsilon: f64,
    fit: Option<WeibullFit>,
}

impl Default for ThresholdEstimator {
    fn default() -> Self {
        Self::new(ThresholdConfig::default())
    }
}

impl ThresholdEstimator {
    pub fn new(config: ThresholdConfig) -> Self {
        let epsilon = if config.initial_epsilon.is_finite() {
            config.initial_epsilon.max(0.0)
        } else {
            1.0
        };
        Self {
            fitter: WeibullFitter::new(config.tolerance, config.max_iterations),
            config,
            epsilon,
            fit: None,
        }
    }

    /// Current ε (always ≥ 0).
    pub fn epsilon(&self) -> f64 {
        self.epsilon
    }

    pub fn last_fit(&self) -> Option<WeibullFit> {
        self.fit
    }

    /// Overrides ε (tests and manual tuning); negative values clamp to 0.
    pub fn set_epsilon(&mut self, epsilon: f64) {
        if epsilon.is_finite() {
            self.epsilon = epsilon.max(0.0);
        }
    }

    /// Refits from the samples, keeping the previous ε on any failure.
    pub fn recalibrate(&mut self, samples: &[f64]) -> Recalibration {
        let thinned;
        let samples = if self.config.max_samples >= MIN_SAMPLES && samples.len() > self.config.max_samples {
            thinned = thin(samples, self.config.max_samples);
            thinned.as_slice()
        } else {
            samples
        };

        let fit = match self.fitter.fit(samples) {
            Ok(fit) => fit,
            Err(reason) => {
                if matches!(reason, ThresholdError::InsufficientSamples { .. }) {
                    debug!("Threshold kept at {:.4}: {}", self.epsilon, reason);
                } else {
                    warn!("Threshold kept at {:.4}: {}", self.epsilon, reason);
                }
                return Recalibration::Retained {
                    epsilon: self.epsilon,
                    reason,
                };
            }
        };

        let epsilon = fit.quantile(self.config.confidence);
        if !epsilon.is_finite() || epsilon < 0.0 {
            warn!("Threshold kept at {:.4}: derived ε={} is unusable", self.epsilon, epsilon);
            return Recalibration::Retained {
                epsilon: self.epsilon,
                reason: ThresholdError::InvalidThreshold(epsilon),
            };
        }

        self.epsilon = epsilon;
        self.fit = Some(fit);
        Recalibration::Updated { epsilon, fit }
    }
}

/// Every k-th sample so that at most `limit` remain.
fn thin(samples: &[f64], limit: usize) -> Vec<f64> {
    let stride = samples.len().div_ceil(limit);
    samples.iter().step_by(stride).copied().collect()
}

// ============================================================================
// ERRORS
// ============================================================================

/// Errors that can occur while fitting the threshold distribution.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ThresholdError {
    #[error("Insufficient samples: got {got}, need at least {required}")]
    InsufficientSamples { got: usize, required: usize },

    #[error("Sample set contains a non-finite value")]
    NonFiniteSample,

    #[error("Optimizer did not converge within {iterations} iterations")]
    NonConvergence { iterations: usize },

    #[error("No feasible parameters found")]
    Infeasible,

    #[error("Derived threshold {0} is not a valid distance")]
    InvalidThreshold(f64),
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_nelder_mead_quadratic() {
        let optimizer = NelderMead::new(1e-10, 10_000);
        let target = Vector3::new(1.0, -2.0, 3.0);
        let minimum = optimizer
            .minimize(|p| (p - target).norm_squared(), Vector3::new(0.0, 0.0, 0.0))
            .unwrap();
        assert_relative_eq!(minimum.point, target, epsilon = 1e-4);
        assert!(minimum.value < 1e-8);
    }

    #[test]
    fn test_nelder_mead_reports_budget_exhaustion() {
        let optimizer = NelderMead::new(1e-12, 3);
        let result = optimizer.minimize(|p| p.norm_squared(), Vector3::new(5.0, 5.0, 5.0));
        assert_eq!(result, Err(ThresholdError::NonConvergence { iterations: 3 }));
    }

    #[test]
    fn test_nll_infeasible_regions() {
        let samples = [1.0, 2.0, 3.0];
        assert_eq!(weibull_nll(&Vector3::new(0.0, -1.0, 1.0), &samples), f64::INFINITY);
        assert_eq!(weibull_nll(&Vector3::new(0.0, 1.0, 0.0), &samples), f64::INFINITY);
        assert_eq!(weibull_nll(&Vector3::new(1.0, 1.0, 1.0), &samples), f64::INFINITY);
        assert!(weibull_nll(&Vector3::new(0.5, 1.0, 1.0), &samples).is_finite());
    }

    #[test]
    fn test_nll_exponential_case() {
        // ξ = 1, μ = 0, σ = 1 reduces to Σx
        let samples = [0.5, 1.0, 2.5];
        assert_relative_eq!(weibull_nll(&Vector3::new(0.0, 1.0, 1.0), &samples), 4.0, epsilon = 1e-9);
    }

    #[test]
    fn test_fit_requires_three_samples() {
        let fitter = WeibullFitter::default();
        assert_eq!(
            fitter.fit(&[1.0, 2.0]),
            Err(ThresholdError::InsufficientSamples { got: 2, required: 3 })
        );
    }

    #[test]
    fn test_fit_identical_samples_is_finite() {
        let fit = WeibullFitter::default().fit(&[1.0, 1.0, 1.0]).unwrap();
        assert!(fit.is_finite());
        assert!(fit.location < 1.0);
        assert!(fit.scale > 0.0);
        assert!(fit.shape > 0.0);
    }

    #[test]
    fn test_fit_all_zero_samples_is_finite() {
        let fit = WeibullFitter::default().fit(&[0.0, 0.0, 0.0, 0.0]).unwrap();
        assert!(fit.is_finite());
        assert!(fit.quantile(0.99) >= 0.0);
    }

    #[test]
    fn test_fit_is_deterministic() {
        let samples = [0.12, 0.4, 0.33, 0.9, 0.05, 0.27, 0.61, 0.18];
        let fitter = WeibullFitter::default();
        let first = fitter.fit(&samples);
        let second = fitter.fit(&samples);
        assert_eq!(first, second);
    }

    #[test]
    fn test_fit_location_below_minimum() {
        let samples = [0.12, 0.4, 0.33, 0.9, 0.05, 0.27, 0.61, 0.18];
        let fit = WeibullFitter::default().fit(&samples).unwrap();
        assert!(fit.is_finite());
        assert!(fit.location < 0.05);
        assert!(fit.scale > 0.0 && fit.shape > 0.0);
        assert!(fit.quantile(0.99) > fit.location);
    }

    #[test]
    fn test_fit_converges_on_ordinary_samples() {
        let fitter = WeibullFitter::default();
        let sets: [&[f64]; 3] = [
            &[0.12, 0.4, 0.33, 0.9, 0.05, 0.27, 0.61, 0.18],
            &[0.5, 1.0, 2.5],
            &[1.0, 2.0, 3.0, 4.0, 5.0],
        ];
        for samples in sets {
            let fit = fitter.fit(samples).unwrap();
            let min = samples.iter().copied().fold(f64::INFINITY, f64::min);
            assert!(fit.location < min, "{:?}", fit);
            assert!(weibull_nll(&Vector3::new(fit.location, fit.scale, fit.shape), samples).is_finite());
        }
    }

    #[test]
    fn test_estimator_recalibrates_on_ordinary_samples() {
        let samples = [1.0, 2.0, 3.0, 4.0, 5.0];
        let mut estimator = ThresholdEstimator::default();
        let outcome = estimator.recalibrate(&samples);
        assert!(outcome.is_updated(), "{:?}", outcome);
        assert!(estimator.epsilon() > 1.0);
        assert!(estimator.last_fit().is_some());
    }

    #[test]
    fn test_quantile_rejects_out_of_range_confidence() {
        let fit = WeibullFit {
            location: 0.0,
            scale: 1.0,
            shape: 1.0,
        };
        assert!(fit.quantile(1.0).is_nan());
        assert!(fit.quantile(-0.1).is_nan());
    }

    #[test]
    fn test_quantile_formula() {
        let fit = WeibullFit {
            location: 0.5,
            scale: 2.0,
            shape: 1.0,
        };
        // 0.5 + 2 * ln(100)
        assert_relative_eq!(fit.quantile(0.99), 0.5 + 2.0 * 100f64.ln(), epsilon = 1e-6);
    }

    #[test]
    fn test_estimator_keeps_epsilon_on_insufficient_samples() {
        let mut estimator = ThresholdEstimator::default();
        let outcome = estimator.recalibrate(&[0.3]);
        assert!(!outcome.is_updated());
        assert_relative_eq!(estimator.epsilon(), 1.0);
        assert_relative_eq!(outcome.epsilon(), 1.0);
    }

    #[test]
    fn test_estimator_keeps_epsilon_on_non_convergence() {
        let mut estimator = ThresholdEstimator::new(ThresholdConfig {
            max_iterations: 1,
            initial_epsilon: 2.5,
            ..ThresholdConfig::default()
        });
        let outcome = estimator.recalibrate(&[0.1, 0.5, 0.2, 0.9]);
        assert!(matches!(
            outcome,
            Recalibration::Retained {
                reason: ThresholdError::NonConvergence { .. },
                ..
            }
        ));
        assert_relative_eq!(estimator.epsilon(), 2.5);
    }

    #[test]
    fn test_estimator_updates_on_identical_samples() {
        let mut estimator = ThresholdEstimator::default();
        let outcome = estimator.recalibrate(&[1.0, 1.0, 1.0]);
        assert!(outcome.is_updated());
        assert!(estimator.epsilon() >= 1.0);
        assert!(estimator.last_fit().is_some());
    }

    #[test]
    fn test_large_sample_sets_are_thinned() {
        let samples: Vec<f64> = (0..10_000).map(|i| (i % 97) as f64 * 0.01 + 0.001).collect();
        let thinned = thin(&samples, 2048);
        assert!(thinned.len() <= 2048);
        assert_eq!(thinned[0], samples[0]);

        let mut estimator = ThresholdEstimator::new(ThresholdConfig {
            max_samples: 64,
            ..ThresholdConfig::default()
        });
        let first = estimator.recalibrate(&samples);
        let second = estimator.recalibrate(&samples);
        assert_eq!(first, second);
        assert!(estimator.epsilon() >= 0.0);
    }

    #[test]
    fn test_set_epsilon_never_negative() {
        let mut estimator = ThresholdEstimator::default();
        estimator.set_epsilon(-3.0);
        assert_eq!(estimator.epsilon(), 0.0);
        estimator.set_epsilon(f64::NAN);
        assert_eq!(estimator.epsilon(), 0.0);
    }
}
