//! Baseline strategy: every batch is drawn from the prior.
//!
//! K_i: Never converges on its own; the driver stops it at `max_iterations`.

use super::{
    iteration_rng, normalize_log_weights, resample, AlgorithmState, PriorDistribution,
    SampleHistory, SamplingAlgorithm, ScoreScale, ALGORITHM_STATE_VERSION,
};
use crate::models::{CalibError, FinalSamples, Result, SampleBatch, SampleTable};
use serde::{Deserialize, Serialize};
use tracing::info;

/// Settings for `kind = "prior_sampling"`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PriorSamplingSettings {
    pub initial_samples: usize,
    pub samples_per_iteration: usize,
    pub n_resamples: usize,
    pub score_scale: ScoreScale,
}

impl Default for PriorSamplingSettings {
    fn default() -> Self {
        Self {
            initial_samples: 1_000,
            samples_per_iteration: 1_000,
            n_resamples: 3_000,
            score_scale: ScoreScale::LogLikelihood,
        }
    }
}

/// Persisted prior-sampling state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PriorSamplingState {
    pub version: u32,
    pub history: SampleTable,
}

pub struct PriorSampling {
    prior: PriorDistribution,
    settings: PriorSamplingSettings,
    seed: u64,
    history: SampleHistory,
    weights: Vec<f64>,
}

impl PriorSampling {
    pub fn new(prior: PriorDistribution, settings: PriorSamplingSettings, seed: u64) -> Result<Self> {
        if settings.initial_samples == 0
            || settings.samples_per_iteration == 0
            || settings.n_resamples == 0
        {
            return Err(CalibError::InvalidSettings(
                "prior sampling needs positive sample counts".to_string(),
            ));
        }
        Ok(Self {
            history: SampleHistory::new(prior.names().to_vec()),
            prior,
            settings,
            seed,
            weights: Vec::new(),
        })
    }

    fn weights_of(&self, history: &SampleHistory) -> Result<Vec<f64>> {
        let log_likelihoods = self
            .settings
            .score_scale
            .to_log_likelihoods(&history.scored_results())?;
        normalize_log_weights(&log_likelihoods)
    }

    fn draw(&mut self, iteration: u32, n: usize) -> Result<SampleBatch> {
        let mut rng = iteration_rng(self.seed, iteration);
        let points = self.prior.draw(n, &mut rng);
        let priors = self.prior.density(&points);
        let batch = SampleBatch::new(iteration, self.prior.names().to_vec(), points);
        self.history.push_batch(&batch, &priors)?;
        info!(iteration, samples = batch.len(), "Drew samples from the prior");
        Ok(batch)
    }
}

impl SamplingAlgorithm for PriorSampling {
    fn name(&self) -> &'static str {
        "prior_sampling"
    }

    fn param_names(&self) -> &[String] {
        self.prior.names()
    }

    fn initial_samples(&mut self) -> Result<SampleBatch> {
        self.reset();
        self.draw(0, self.settings.initial_samples)
    }

    fn next_samples(&mut self, iteration: u32) -> Result<SampleBatch> {
        let latest = self.history.latest_iteration();
        if iteration == 0 || latest.map(|k| k + 1) != Some(iteration) || !self.history.all_scored() {
            return Err(CalibError::InconsistentState(format!(
                "cannot draw iteration {iteration} after iteration {latest:?}"
            )));
        }
        self.draw(iteration, self.settings.samples_per_iteration)
    }

    fn samples_for_iteration(&self, iteration: u32) -> Result<SampleBatch> {
        self.history.batch(iteration)
    }

    fn record_results(&mut self, iteration: u32, results: &[f64]) -> Result<()> {
        let mut history = self.history.clone();
        history.record_results(iteration, results)?;
        self.weights = self.weights_of(&history)?;
        self.history = history;
        Ok(())
    }

    fn export_state(&self) -> AlgorithmState {
        AlgorithmState::PriorSampling(PriorSamplingState {
            version: ALGORITHM_STATE_VERSION,
            history: self.history.to_table(),
        })
    }

    fn import_state(&mut self, state: &AlgorithmState, iteration: u32) -> Result<()> {
        let AlgorithmState::PriorSampling(state) = state else {
            return Err(CalibError::InconsistentState(format!(
                "expected prior_sampling state, found {}",
                state.kind()
            )));
        };
        if state.version != ALGORITHM_STATE_VERSION {
            return Err(CalibError::StateVersion {
                what: "prior sampling state",
                found: state.version,
                expected: ALGORITHM_STATE_VERSION,
            });
        }
        let history = SampleHistory::from_table(self.prior.names(), &state.history)?;
        if history.latest_iteration() != Some(iteration) {
            return Err(CalibError::InconsistentState(format!(
                "prior sampling state ends at iteration {:?}, expected {iteration}",
                history.latest_iteration()
            )));
        }
        self.weights = if history.scored_results().is_empty() {
            Vec::new()
        } else {
            self.weights_of(&history)?
        };
        self.history = history;
        Ok(())
    }

    fn has_converged(&self) -> bool {
        false
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
        self.weights.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sampling::{AlgorithmSettings, ParameterSpec, Univariate};

    fn algorithm() -> Box<dyn SamplingAlgorithm> {
        let prior = PriorDistribution::new(vec![ParameterSpec::new(
            "x",
            Univariate::Uniform { min: 0.0, max: 1.0 },
        )])
        .unwrap();
        AlgorithmSettings::PriorSampling(PriorSamplingSettings {
            initial_samples: 5,
            samples_per_iteration: 2,
            n_resamples: 20,
            score_scale: ScoreScale::Likelihood,
        })
        .build(prior, 3)
        .unwrap()
    }

    #[test]
    fn test_draws_from_prior_every_iteration() {
        let mut algo = algorithm();
        assert_eq!(algo.name(), "prior_sampling");
        assert_eq!(algo.initial_samples().unwrap().len(), 5);
        assert!(algo.next_samples(1).is_err());
        algo.record_results(0, &[1.0, 0.0, 0.0, 0.0, 0.0]).unwrap();
        assert_eq!(algo.next_samples(1).unwrap().len(), 2);
        assert!(!algo.has_converged());
    }

    #[test]
    fn test_final_samples_follow_likelihood() {
        let mut algo = algorithm();
        let batch = algo.initial_samples().unwrap();
        algo.record_results(0, &[0.0, 0.0, 3.0, 0.0, 0.0]).unwrap();
        let out = algo.final_samples().unwrap();
        assert!(out.samples.iter().all(|s| s == &batch.samples[2].values));
    }

    #[test]
    fn test_state_round_trip_recomputes_weights() {
        let mut algo = algorithm();
        algo.initial_samples().unwrap();
        algo.record_results(0, &[1.0, 2.0, 3.0, 4.0, 5.0]).unwrap();
        let state = algo.export_state();

        let mut other = algorithm();
        other.import_state(&state, 0).unwrap();
        assert_eq!(other.final_samples().unwrap(), algo.final_samples().unwrap());
    }
}
