//! Next-point sampling algorithms.
//!
//! Epistemic foundation:
//! - K_i: Every algorithm draws reproducibly from `(seed, iteration)` streams
//! - K_i: `export_state()` always reflects the last draw or result update
//! - B_i: A persisted state may not match the iteration being resumed → Result
//! - I^B: Scores can collapse the weights to zero → InsufficientSupport

mod gaussian;
mod history;
mod imis;
mod prior;
mod prior_sampling;

pub use gaussian::*;
pub use history::*;
pub use imis::*;
pub use prior::*;
pub use prior_sampling::*;

use crate::models::{CalibError, FinalSamples, Result, SampleBatch};
use rand::SeedableRng;
use rand_xoshiro::Xoshiro256PlusPlus;
use serde::{Deserialize, Serialize};

/// Version written into every persisted algorithm state.
pub const ALGORITHM_STATE_VERSION: u32 = 1;

/// Stream id of the final resampling draw.
const FINAL_STREAM: u64 = u64::MAX;

/// Lifecycle shared by every next-point strategy.
pub trait SamplingAlgorithm: Send {
    /// Short identifier used in logs.
    fn name(&self) -> &'static str;

    fn param_names(&self) -> &[String];

    /// Draw the iteration-0 batch from the prior.
    fn initial_samples(&mut self) -> Result<SampleBatch>;

    /// Draw the batch for `iteration ≥ 1` from the current proposal.
    fn next_samples(&mut self, iteration: u32) -> Result<SampleBatch>;

    /// Reload a batch already drawn.
    fn samples_for_iteration(&self, iteration: u32) -> Result<SampleBatch>;

    /// Feed back one score per sample of the latest batch.
    fn record_results(&mut self, iteration: u32, results: &[f64]) -> Result<()>;

    fn export_state(&self) -> AlgorithmState;

    /// Restore a state whose latest drawn batch is `iteration`.
    fn import_state(&mut self, state: &AlgorithmState, iteration: u32) -> Result<()>;

    fn has_converged(&self) -> bool;

    /// Weighted samples summarizing the calibration.
    fn final_samples(&self) -> Result<FinalSamples>;

    /// Drop all history.
    fn reset(&mut self);
}

/// Serialized state of a sampling algorithm.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "algorithm", content = "state", rename_all = "snake_case")]
pub enum AlgorithmState {
    Imis(ImisState),
    PriorSampling(PriorSamplingState),
}

impl AlgorithmState {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Imis(_) => "imis",
            Self::PriorSampling(_) => "prior_sampling",
        }
    }
}

/// How scores map to likelihoods.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScoreScale {
    /// Scores are log-likelihoods (default)
    #[default]
    LogLikelihood,
    /// Scores are raw non-negative likelihoods
    Likelihood,
}

impl ScoreScale {
    /// Convert scores to log-likelihoods, rejecting values that have none.
    pub fn to_log_likelihoods(self, scores: &[f64]) -> Result<Vec<f64>> {
        scores
            .iter()
            .enumerate()
            .map(|(sample_index, &value)| {
                if value.is_nan() {
                    return Err(CalibError::InvalidScore {
                        sample_index,
                        value,
                        reason: "score is not a number",
                    });
                }
                match self {
                    Self::LogLikelihood if value == f64::INFINITY => Err(CalibError::InvalidScore {
                        sample_index,
                        value,
                        reason: "log-likelihood is infinite",
                    }),
                    Self::LogLikelihood => Ok(value),
                    Self::Likelihood if value < 0.0 || value.is_infinite() => {
                        Err(CalibError::InvalidScore {
                            sample_index,
                            value,
                            reason: "likelihood must be finite and non-negative",
                        })
                    }
                    Self::Likelihood => Ok(value.ln()),
                }
            })
            .collect()
    }
}

/// Algorithm selection and settings, as configured under `[algorithm]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AlgorithmSettings {
    Imis(ImisSettings),
    PriorSampling(PriorSamplingSettings),
}

impl AlgorithmSettings {
    /// Build the configured algorithm over `prior`.
    pub fn build(&self, prior: PriorDistribution, seed: u64) -> Result<Box<dyn SamplingAlgorithm>> {
        Ok(match self {
            Self::Imis(settings) => Box::new(Imis::new(prior, settings.clone(), seed)?),
            Self::PriorSampling(settings) => {
                Box::new(PriorSampling::new(prior, settings.clone(), seed)?)
            }
        })
    }
}

/// RNG for the draws of `iteration`.
pub(crate) fn iteration_rng(seed: u64, iteration: u32) -> Xoshiro256PlusPlus {
    stream_rng(seed, u64::from(iteration))
}

/// RNG for the final resampling.
pub(crate) fn final_rng(seed: u64) -> Xoshiro256PlusPlus {
    stream_rng(seed, FINAL_STREAM)
}

fn stream_rng(seed: u64, stream: u64) -> Xoshiro256PlusPlus {
    // splitmix64 finalizer keeps neighbouring streams uncorrelated
    let mut z = seed ^ stream.wrapping_add(1).wrapping_mul(0x9E37_79B9_7F4A_7C15);
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    Xoshiro256PlusPlus::seed_from_u64(z ^ (z >> 31))
}

/// Normalize log weights so the weights sum to one.
///
/// Fails with `InsufficientSupport` when no weight is positive.
pub fn normalize_log_weights(log_weights: &[f64]) -> Result<Vec<f64>> {
    let max = log_weights
        .iter()
        .copied()
        .filter(|x| !x.is_nan())
        .fold(f64::NEG_INFINITY, f64::max);
    if !max.is_finite() {
        return Err(CalibError::InsufficientSupport {
            weights: log_weights.to_vec(),
        });
    }
    let raw: Vec<f64> = log_weights
        .iter()
        .map(|&x| if x.is_nan() { 0.0 } else { (x - max).exp() })
        .collect();
    let total: f64 = raw.iter().sum();
    Ok(raw.into_iter().map(|w| w / total).collect())
}

/// Expected fraction of unique points criterion: `Σ (1 − (1−w)^R) > (1 − e⁻¹)·R`.
pub fn expected_unique_converged(weights: &[f64], n_resamples: usize) -> bool {
    if weights.is_empty() {
        return false;
    }
    let r = n_resamples as f64;
    let expected_unique: f64 = weights.iter().map(|w| 1.0 - (1.0 - w).powf(r)).sum();
    expected_unique > (1.0 - (-1.0f64).exp()) * r
}

/// Resample `n` points with replacement proportionally to `weights`.
pub(crate) fn resample(
    param_names: &[String],
    points: &[Vec<f64>],
    weights: &[f64],
    n: usize,
    seed: u64,
) -> Result<FinalSamples> {
    use rand::distr::weighted::WeightedIndex;
    use rand::distr::Distribution;

    if !weights.iter().any(|&w| w > 0.0) {
        return Err(CalibError::InsufficientSupport {
            weights: weights.to_vec(),
        });
    }
    let index = WeightedIndex::new(weights)
        .map_err(|e| CalibError::Internal(format!("building resampling index: {e}")))?;
    let mut rng = final_rng(seed);
    let picks: Vec<usize> = (0..n).map(|_| index.sample(&mut rng)).collect();

    Ok(FinalSamples {
        param_names: param_names.to_vec(),
        samples: picks.iter().map(|&i| points[i].clone()).collect(),
        weights: picks.iter().map(|&i| weights[i]).collect(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rand::Rng;

    #[test]
    fn test_score_scales() {
        let ll = ScoreScale::LogLikelihood.to_log_likelihoods(&[-1.0, f64::NEG_INFINITY]).unwrap();
        assert_eq!(ll, vec![-1.0, f64::NEG_INFINITY]);

        let l = ScoreScale::Likelihood.to_log_likelihoods(&[1.0, 0.0]).unwrap();
        assert_eq!(l, vec![0.0, f64::NEG_INFINITY]);

        let err = ScoreScale::Likelihood.to_log_likelihoods(&[0.5, -0.1]).unwrap_err();
        assert!(matches!(err, CalibError::InvalidScore { sample_index: 1, .. }));
        assert!(ScoreScale::LogLikelihood.to_log_likelihoods(&[f64::NAN]).is_err());
    }

    #[test]
    fn test_normalize_all_zero_is_insufficient_support() {
        let err = normalize_log_weights(&[f64::NEG_INFINITY; 3]).unwrap_err();
        assert!(matches!(err, CalibError::InsufficientSupport { ref weights } if weights.len() == 3));

        // The log weights themselves are reported, NaN included.
        let err = normalize_log_weights(&[f64::NEG_INFINITY, f64::NAN]).unwrap_err();
        match err {
            CalibError::InsufficientSupport { weights } => {
                assert_eq!(weights[0], f64::NEG_INFINITY);
                assert!(weights[1].is_nan());
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_normalize_survives_large_magnitudes() {
        let w = normalize_log_weights(&[-1000.0, -1001.0]).unwrap();
        let e = (-1.0f64).exp();
        assert!((w[0] - 1.0 / (1.0 + e)).abs() < 1e-12);
    }

    #[test]
    fn test_uniform_weights_converge() {
        let n = 5000;
        assert!(expected_unique_converged(&vec![1.0 / n as f64; n], 3000));
        let mut peaked = vec![0.0; n];
        peaked[0] = 1.0;
        assert!(!expected_unique_converged(&peaked, 3000));
    }

    #[test]
    fn test_resample_rejects_zero_weights() {
        let names = vec!["x".to_string()];
        let err = resample(&names, &[vec![1.0], vec![2.0]], &[0.0, 0.0], 10, 1).unwrap_err();
        assert!(matches!(err, CalibError::InsufficientSupport { .. }));
    }

    #[test]
    fn test_resample_only_picks_positive_weights() {
        let names = vec!["x".to_string()];
        let out = resample(&names, &[vec![1.0], vec![2.0]], &[0.0, 1.0], 50, 9).unwrap();
        assert_eq!(out.len(), 50);
        assert!(out.samples.iter().all(|s| s == &vec![2.0]));
    }

    #[test]
    fn test_streams_differ() {
        let a: u64 = iteration_rng(1, 0).random();
        let b: u64 = iteration_rng(1, 1).random();
        let c: u64 = iteration_rng(1, 0).random();
        assert_ne!(a, b);
        assert_eq!(a, c);
    }

    proptest! {
        #[test]
        fn prop_normalized_weights_sum_to_one(logs in prop::collection::vec(-500.0f64..50.0, 1..100)) {
            let w = normalize_log_weights(&logs).unwrap();
            let total: f64 = w.iter().sum();
            prop_assert!((total - 1.0).abs() < 1e-9);
            prop_assert!(w.iter().all(|&x| x >= 0.0));
        }

        #[test]
        fn prop_convergence_is_idempotent(raw in prop::collection::vec(0.0f64..1.0, 1..200), r in 1usize..5000) {
            let total: f64 = raw.iter().sum();
            prop_assume!(total > 0.0);
            let w: Vec<f64> = raw.iter().map(|x| x / total).collect();
            prop_assert_eq!(expected_unique_converged(&w, r), expected_unique_converged(&w, r));
        }
    }
}
