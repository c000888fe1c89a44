//! Incremental mixture importance sampling.
//!
//! The proposal starts as the prior. After each scored iteration a
//! Gaussian kernel is centred on the highest-weight sample, fitted to the
//! weighted covariance of its nearest neighbours, and added to the mixture
//! the next batch is drawn from.
//!
//! Epistemic foundation:
//! - K_i: `gaussian_probs[j][i]` is kernel `j`'s density at sample `i`
//! - K_i: Weights cover every scored sample and sum to one
//! - B_i: Kernel draws may leave the prior support → bounded redraws
//! - I^B: Covariances may be singular → jitter, then DegenerateCovariance

use super::{
    expected_unique_converged, iteration_rng, normalize_log_weights, resample, sample_variances,
    seuclidean, weighted_covariance, AlgorithmState, Gaussian, PriorDistribution, SampleHistory,
    SamplingAlgorithm, ScoreScale, ALGORITHM_STATE_VERSION,
};
use crate::models::{CalibError, FinalSamples, Result, SampleBatch, SampleTable};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use tracing::{debug, info};

/// Redraw rounds for kernel samples outside the prior support.
pub const MAX_RESAMPLING_ATTEMPTS: usize = 100;

/// IMIS settings, as configured under `[algorithm]` with `kind = "imis"`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ImisSettings {
    /// Samples drawn from the prior at iteration 0 (N₀)
    pub initial_samples: usize,
    /// Samples drawn from each new kernel (B)
    pub samples_per_iteration: usize,
    /// Size of the final resample (R)
    pub n_resamples: usize,
    pub score_scale: ScoreScale,
}

impl Default for ImisSettings {
    fn default() -> Self {
        Self {
            initial_samples: 10_000,
            samples_per_iteration: 1_000,
            n_resamples: 3_000,
            score_scale: ScoreScale::LogLikelihood,
        }
    }
}

/// Persisted IMIS state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ImisState {
    pub version: u32,
    pub n_initial_samples: usize,
    pub gaussian_centers: Vec<Vec<f64>>,
    pub gaussian_covariances: Vec<Vec<Vec<f64>>>,
    /// Kernel × sample densities
    pub gaussian_probs: Vec<Vec<f64>>,
    pub weights: Vec<f64>,
    pub history: SampleTable,
}

/// The IMIS next-point algorithm.
pub struct Imis {
    prior: PriorDistribution,
    settings: ImisSettings,
    seed: u64,
    history: SampleHistory,
    kernels: Vec<Gaussian>,
    gaussian_probs: Vec<Vec<f64>>,
    weights: Vec<f64>,
    /// Per-dimension variance of the iteration-0 batch
    prior_variances: Vec<f64>,
}

impl Imis {
    /// B_i(B ≤ N₀ and B > dims) → Result
    pub fn new(prior: PriorDistribution, settings: ImisSettings, seed: u64) -> Result<Self> {
        let dims = prior.n_dims();
        if settings.initial_samples == 0 || settings.n_resamples == 0 {
            return Err(CalibError::InvalidSettings(
                "initial_samples and n_resamples must be positive".to_string(),
            ));
        }
        if settings.samples_per_iteration > settings.initial_samples {
            return Err(CalibError::InvalidSettings(format!(
                "samples_per_iteration ({}) cannot exceed initial_samples ({})",
                settings.samples_per_iteration, settings.initial_samples
            )));
        }
        if settings.samples_per_iteration <= dims {
            return Err(CalibError::InvalidSettings(format!(
                "samples_per_iteration ({}) must exceed the number of parameters ({dims})",
                settings.samples_per_iteration
            )));
        }

        info!(
            initial = settings.initial_samples,
            per_iteration = settings.samples_per_iteration,
            dims,
            "IMIS configured"
        );

        Ok(Self {
            history: SampleHistory::new(prior.names().to_vec()),
            prior,
            settings,
            seed,
            kernels: Vec::new(),
            gaussian_probs: Vec::new(),
            weights: Vec::new(),
            prior_variances: Vec::new(),
        })
    }

    pub fn weights(&self) -> &[f64] {
        &self.weights
    }

    pub fn n_kernels(&self) -> usize {
        self.kernels.len()
    }

    /// Importance weights of every sample in `history`, which must be fully scored.
    fn compute_weights(&self, history: &SampleHistory) -> Result<Vec<f64>> {
        let log_likelihoods = self
            .settings
            .score_scale
            .to_log_likelihoods(&history.scored_results())?;
        let priors = history.priors();

        let n0 = history.n_initial() as f64;
        let b = self.settings.samples_per_iteration as f64;
        let nk = n0 + b * self.kernels.len() as f64;

        let log_weights: Vec<f64> = (0..history.len())
            .map(|i| {
                let p = priors[i];
                if p <= 0.0 {
                    return f64::NEG_INFINITY;
                }
                let q = if self.kernels.is_empty() {
                    p
                } else {
                    let mixture: f64 = self.gaussian_probs.iter().map(|row| row[i]).sum();
                    (n0 / nk) * p + (b / nk) * mixture
                };
                p.ln() + log_likelihoods[i] - q.ln()
            })
            .collect();

        let weights = normalize_log_weights(&log_weights)?;
        debug!(?weights, "IMIS importance weights");
        Ok(weights)
    }

    /// Draw `n` kernel samples, redrawing those with zero prior density.
    fn draw_valid(&self, kernel: &Gaussian, n: usize, iteration: u32) -> Result<Vec<Vec<f64>>> {
        let mut rng = iteration_rng(self.seed, iteration);
        let mut valid: Vec<Vec<f64>> = Vec::with_capacity(n);
        let mut invalid = n;

        for attempt in 0..MAX_RESAMPLING_ATTEMPTS {
            for _ in 0..invalid {
                let point = kernel.sample(&mut rng);
                if self.prior.density_at(&point) > 0.0 {
                    valid.push(point);
                }
            }
            invalid = n - valid.len();
            if invalid == 0 {
                return Ok(valid);
            }
            debug!(attempt, invalid, "Redrawing samples outside prior support");
        }

        Err(CalibError::ExhaustedResampling {
            attempts: MAX_RESAMPLING_ATTEMPTS,
            invalid,
            weights: self.weights.clone(),
        })
    }
}

impl SamplingAlgorithm for Imis {
    fn name(&self) -> &'static str {
        "imis"
    }

    fn param_names(&self) -> &[String] {
        self.prior.names()
    }

    fn initial_samples(&mut self) -> Result<SampleBatch> {
        self.reset();
        let mut rng = iteration_rng(self.seed, 0);
        let points = self.prior.draw(self.settings.initial_samples, &mut rng);
        let priors = self.prior.density(&points);
        let batch = SampleBatch::new(0, self.prior.names().to_vec(), points);

        self.history.push_batch(&batch, &priors)?;
        self.prior_variances = sample_variances(self.history.points(), self.prior.n_dims());
        debug!(variances = ?self.prior_variances, "Variance of initial samples");

        info!(samples = batch.len(), "IMIS drew initial samples from the prior");
        Ok(batch)
    }

    fn next_samples(&mut self, iteration: u32) -> Result<SampleBatch> {
        let latest = self.history.latest_iteration();
        if iteration == 0 || latest.map(|k| k + 1) != Some(iteration) {
            return Err(CalibError::InconsistentState(format!(
                "cannot draw iteration {iteration} after iteration {latest:?}"
            )));
        }
        if !self.history.all_scored() || self.weights.len() != self.history.len() {
            return Err(CalibError::InconsistentState(format!(
                "iteration {} has no recorded results",
                iteration - 1
            )));
        }

        // Center on the maximum-weight sample.
        let points = self.history.points();
        let center_idx = self
            .weights
            .iter()
            .enumerate()
            .fold(0, |best, (i, &w)| if w > self.weights[best] { i } else { best });
        let center = points[center_idx].clone();
        debug!(?center, "New kernel center");

        // Fit the covariance from the B closest samples.
        let distances: Vec<f64> = points
            .iter()
            .map(|p| seuclidean(p, &center, &self.prior_variances))
            .collect();
        let mut order: Vec<usize> = (0..points.len()).collect();
        order.sort_by(|&a, &b| {
            distances[a]
                .partial_cmp(&distances[b])
                .unwrap_or(Ordering::Equal)
        });
        let closest = &order[..self.settings.samples_per_iteration];

        let n_total = self.weights.len() as f64;
        let closest_points: Vec<&[f64]> = closest.iter().map(|&i| points[i].as_slice()).collect();
        let closest_weights: Vec<f64> = closest
            .iter()
            .map(|&i| self.weights[i] + 1.0 / n_total)
            .collect();
        let covariance = weighted_covariance(&closest_points, &closest_weights, &center);
        debug!(?covariance, "New kernel covariance");

        let kernel = Gaussian::new(&center, &covariance).ok_or_else(|| {
            CalibError::DegenerateCovariance {
                iteration,
                weights: self.weights.clone(),
            }
        })?;

        let new_points = self.draw_valid(&kernel, self.settings.samples_per_iteration, iteration)?;
        let priors = self.prior.density(&new_points);
        let batch = SampleBatch::new(iteration, self.prior.names().to_vec(), new_points);

        // Extend existing kernel rows with the new samples, then add the new
        // kernel's row over every sample.
        let mut history = self.history.clone();
        history.push_batch(&batch, &priors)?;
        for (row, existing) in self.gaussian_probs.iter_mut().zip(&self.kernels) {
            row.extend(batch.samples.iter().map(|s| existing.pdf(&s.values)));
        }
        self.gaussian_probs
            .push(history.points().iter().map(|p| kernel.pdf(p)).collect());
        self.kernels.push(kernel);
        self.history = history;

        info!(
            iteration,
            samples = batch.len(),
            kernels = self.kernels.len(),
            "IMIS drew samples from new kernel"
        );
        Ok(batch)
    }

    fn samples_for_iteration(&self, iteration: u32) -> Result<SampleBatch> {
        self.history.batch(iteration)
    }

    fn record_results(&mut self, iteration: u32, results: &[f64]) -> Result<()> {
        let mut history = self.history.clone();
        history.record_results(iteration, results)?;
        let weights = self.compute_weights(&history)?;

        self.history = history;
        self.weights = weights;
        info!(
            iteration,
            samples = self.weights.len(),
            "IMIS weights updated"
        );
        Ok(())
    }

    fn export_state(&self) -> AlgorithmState {
        AlgorithmState::Imis(ImisState {
            version: ALGORITHM_STATE_VERSION,
            n_initial_samples: self.history.n_initial(),
            gaussian_centers: self.kernels.iter().map(Gaussian::mean).collect(),
            gaussian_covariances: self.kernels.iter().map(Gaussian::covariance).collect(),
            gaussian_probs: self.gaussian_probs.clone(),
            weights: self.weights.clone(),
            history: self.history.to_table(),
        })
    }

    fn import_state(&mut self, state: &AlgorithmState, iteration: u32) -> Result<()> {
        let AlgorithmState::Imis(state) = state else {
            return Err(CalibError::InconsistentState(format!(
                "expected imis state, found {}",
                state.kind()
            )));
        };
        if state.version != ALGORITHM_STATE_VERSION {
            return Err(CalibError::StateVersion {
                what: "IMIS state",
                found: state.version,
                expected: ALGORITHM_STATE_VERSION,
            });
        }

        let history = SampleHistory::from_table(self.prior.names(), &state.history)?;
        if history.latest_iteration() != Some(iteration) {
            return Err(CalibError::InconsistentState(format!(
                "IMIS state ends at iteration {:?}, expected {iteration}",
                history.latest_iteration()
            )));
        }
        if state.n_initial_samples != history.n_initial() {
            return Err(CalibError::InconsistentState(format!(
                "n_initial_samples is {} but history holds {} initial samples",
                state.n_initial_samples,
                history.n_initial()
            )));
        }

        let n_kernels = iteration as usize;
        if state.gaussian_centers.len() != n_kernels
            || state.gaussian_covariances.len() != n_kernels
            || state.gaussian_probs.len() != n_kernels
        {
            return Err(CalibError::InconsistentState(format!(
                "iteration {iteration} needs {n_kernels} kernels, state has {} centers, {} covariances, {} probability rows",
                state.gaussian_centers.len(),
                state.gaussian_covariances.len(),
                state.gaussian_probs.len()
            )));
        }
        if let Some(row) = state.gaussian_probs.iter().find(|r| r.len() != history.len()) {
            return Err(CalibError::InconsistentState(format!(
                "kernel probability row has {} entries for {} samples",
                row.len(),
                history.len()
            )));
        }
        if state.weights.len() != history.scored_results().len() {
            return Err(CalibError::InconsistentState(format!(
                "{} weights for {} scored samples",
                state.weights.len(),
                history.scored_results().len()
            )));
        }

        let kernels = state
            .gaussian_centers
            .iter()
            .zip(&state.gaussian_covariances)
            .enumerate()
            .map(|(j, (center, cov))| {
                Gaussian::new(center, cov).ok_or_else(|| CalibError::DegenerateCovariance {
                    iteration: j as u32 + 1,
                    weights: state.weights.clone(),
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let initial: Vec<Vec<f64>> = history.points()[history.rows(0)].to_vec();
        self.prior_variances = sample_variances(&initial, self.prior.n_dims());
        self.kernels = kernels;
        self.gaussian_probs = state.gaussian_probs.clone();
        self.weights = state.weights.clone();
        self.history = history;

        debug!(iteration, kernels = self.kernels.len(), "IMIS state imported");
        Ok(())
    }

    fn has_converged(&self) -> bool {
        if self.weights.is_empty() {
            return false;
        }
        let converged = expected_unique_converged(&self.weights, self.settings.n_resamples);
        if converged {
            info!(kernels = self.kernels.len(), "IMIS weights are near uniform; stopping");
        } else {
            info!(kernels = self.kernels.len(), "IMIS weights still concentrated; continuing");
        }
        converged
    }

    fn final_samples(&self) -> Result<FinalSamples> {
        let points = &self.history.points()[..self.weights.len()];
        resample(
            self.prior.names(),
            points,
            &self.weights,
            self.settings.n_resamples,
            self.seed,
        )
    }

    fn reset(&mut self) {
        self.history = SampleHistory::new(self.prior.names().to_vec());
        self.kernels.clear();
        self.gaussian_probs.clear();
        self.weights.clear();
        self.prior_variances.clear();
    }
}
