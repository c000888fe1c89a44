//! Prior distributions over named parameter vectors.
//!
//! K_i: Dimensions are independent; the joint density is the product of the
//! per-parameter densities and is zero outside the support.

use crate::models::{CalibError, Result};
use rand::Rng;
use rand_distr::StandardNormal;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::f64::consts::PI;

/// A univariate prior family.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "distribution", rename_all = "snake_case")]
pub enum Univariate {
    /// Flat on `[min, max]`
    Uniform { min: f64, max: f64 },
    /// Flat in `ln x` on `[min, max]`; requires `0 < min`
    LogUniform { min: f64, max: f64 },
    /// Gaussian with unbounded support
    Normal { mean: f64, std: f64 },
}

impl Univariate {
    /// B_i(range is well formed) → Result
    fn validate(&self, param: &str) -> Result<()> {
        match *self {
            Self::Uniform { min, max } => {
                if !(min.is_finite() && max.is_finite()) {
                    return Err(CalibError::invalid_range(param, "bounds must be finite"));
                }
                if max <= min {
                    return Err(CalibError::invalid_range(
                        param,
                        format!("max ({max}) must exceed min ({min})"),
                    ));
                }
                let width = max - min;
                if !(width.is_finite() && width.recip().is_finite()) {
                    return Err(CalibError::invalid_range(
                        param,
                        format!("width of [{min}, {max}] is not representable"),
                    ));
                }
            }
            Self::LogUniform { min, max } => {
                if !(min.is_finite() && max.is_finite()) {
                    return Err(CalibError::invalid_range(param, "bounds must be finite"));
                }
                if min <= 0.0 {
                    return Err(CalibError::invalid_range(
                        param,
                        format!("log-uniform needs a positive lower bound, got {min}"),
                    ));
                }
                if max <= min {
                    return Err(CalibError::invalid_range(
                        param,
                        format!("max ({max}) must exceed min ({min})"),
                    ));
                }
                let log_width = (max / min).ln();
                if !(log_width.is_finite() && log_width > 0.0) {
                    return Err(CalibError::invalid_range(
                        param,
                        format!("ln(max / min) for [{min}, {max}] is not representable"),
                    ));
                }
            }
            Self::Normal { mean, std } => {
                if !mean.is_finite() {
                    return Err(CalibError::invalid_range(param, "mean must be finite"));
                }
                if !(std.is_finite() && std > 0.0) {
                    return Err(CalibError::invalid_range(
                        param,
                        format!("std must be positive, got {std}"),
                    ));
                }
            }
        }
        Ok(())
    }

    /// Density at `x`.
    pub fn density(&self, x: f64) -> f64 {
        match *self {
            Self::Uniform { min, max } => {
                if (min..=max).contains(&x) {
                    1.0 / (max - min)
                } else {
                    0.0
                }
            }
            Self::LogUniform { min, max } => {
                if (min..=max).contains(&x) {
                    1.0 / (x * (max / min).ln())
                } else {
                    0.0
                }
            }
            Self::Normal { mean, std } => {
                let z = (x - mean) / std;
                (-0.5 * z * z).exp() / (std * (2.0 * PI).sqrt())
            }
        }
    }

    /// One draw.
    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> f64 {
        match *self {
            Self::Uniform { min, max } => min + rng.random::<f64>() * (max - min),
            Self::LogUniform { min, max } => {
                let (lo, hi) = (min.ln(), max.ln());
                (lo + rng.random::<f64>() * (hi - lo)).exp().clamp(min, max)
            }
            Self::Normal { mean, std } => {
                let z: f64 = rng.sample(StandardNormal);
                mean + std * z
            }
        }
    }
}

/// A named parameter with its prior.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterSpec {
    pub name: String,
    #[serde(flatten)]
    pub distribution: Univariate,
}

impl ParameterSpec {
    pub fn new(name: impl Into<String>, distribution: Univariate) -> Self {
        Self {
            name: name.into(),
            distribution,
        }
    }
}

/// Column names used by sample and summary tables.
const RESERVED_NAMES: &[&str] = &["iteration", "sample_index", "prior", "result", "total"];

/// Product of independent univariate priors.
#[derive(Debug, Clone, PartialEq)]
pub struct PriorDistribution {
    params: Vec<ParameterSpec>,
    names: Vec<String>,
}

impl PriorDistribution {
    /// Build a prior, rejecting degenerate ranges and duplicate names.
    pub fn new(params: Vec<ParameterSpec>) -> Result<Self> {
        if params.is_empty() {
            return Err(CalibError::InvalidSettings(
                "a prior needs at least one parameter".to_string(),
            ));
        }
        let mut seen = HashSet::new();
        for param in &params {
            if !seen.insert(param.name.as_str()) {
                return Err(CalibError::invalid_range(&param.name, "duplicate parameter name"));
            }
            if RESERVED_NAMES.contains(&param.name.as_str()) {
                return Err(CalibError::invalid_range(&param.name, "name is reserved for a table column"));
            }
            param.distribution.validate(&param.name)?;
        }
        let names = params.iter().map(|p| p.name.clone()).collect();
        Ok(Self { params, names })
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn n_dims(&self) -> usize {
        self.params.len()
    }

    pub fn params(&self) -> &[ParameterSpec] {
        &self.params
    }

    /// Joint density at one point.
    pub fn density_at(&self, point: &[f64]) -> f64 {
        if point.len() != self.params.len() {
            return 0.0;
        }
        self.params
            .iter()
            .zip(point)
            .map(|(p, &x)| p.distribution.density(x))
            .product()
    }

    /// Joint density at each point.
    pub fn density(&self, points: &[Vec<f64>]) -> Vec<f64> {
        points.iter().map(|p| self.density_at(p)).collect()
    }

    /// `n` independent draws, one row per draw.
    pub fn draw<R: Rng + ?Sized>(&self, n: usize, rng: &mut R) -> Vec<Vec<f64>> {
        (0..n)
            .map(|_| {
                self.params
                    .iter()
                    .map(|p| p.distribution.sample(rng))
                    .collect()
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rand::SeedableRng;
    use rand_xoshiro::Xoshiro256PlusPlus;

    fn two_uniforms() -> PriorDistribution {
        PriorDistribution::new(vec![
            ParameterSpec::new("a", Univariate::Uniform { min: 0.4, max: 0.7 }),
            ParameterSpec::new("b", Univariate::Uniform { min: 0.1, max: 0.9 }),
        ])
        .unwrap()
    }

    #[test]
    fn test_rejects_degenerate_range() {
        let err = PriorDistribution::new(vec![ParameterSpec::new(
            "x",
            Univariate::Uniform { min: 1.0, max: 1.0 },
        )])
        .unwrap_err();
        assert!(matches!(err, CalibError::InvalidRange { ref param, .. } if param == "x"));
    }

    #[test]
    fn test_rejects_unrepresentable_width() {
        for distribution in [
            Univariate::Uniform { min: -1e308, max: 1e308 },
            Univariate::Uniform { min: 0.0, max: 1e-320 },
            Univariate::LogUniform { min: 1e-320, max: 1e300 },
        ] {
            let err = PriorDistribution::new(vec![ParameterSpec::new("x", distribution.clone())])
                .unwrap_err();
            assert!(
                matches!(err, CalibError::InvalidRange { ref param, .. } if param == "x"),
                "{distribution:?} was accepted"
            );
        }
    }

    #[test]
    fn test_log_uniform_needs_positive_lower_bound() {
        let err = PriorDistribution::new(vec![ParameterSpec::new(
            "x",
            Univariate::LogUniform { min: 0.0, max: 10.0 },
        )])
        .unwrap_err();
        assert!(err.to_string().contains("positive lower bound"));
    }

    #[test]
    fn test_rejects_duplicate_names() {
        let spec = ParameterSpec::new("x", Univariate::Uniform { min: 0.0, max: 1.0 });
        assert!(PriorDistribution::new(vec![spec.clone(), spec]).is_err());
    }

    #[test]
    fn test_rejects_reserved_name() {
        let spec = ParameterSpec::new("total", Univariate::Uniform { min: 0.0, max: 1.0 });
        assert!(PriorDistribution::new(vec![spec]).is_err());
    }

    #[test]
    fn test_density_is_product_and_zero_outside() {
        let prior = two_uniforms();
        let expected = (1.0 / 0.3) * (1.0 / 0.8);
        assert!((prior.density_at(&[0.5, 0.5]) - expected).abs() < 1e-12);
        assert_eq!(prior.density_at(&[0.8, 0.5]), 0.0);
        assert_eq!(prior.density_at(&[0.5]), 0.0);
    }

    #[test]
    fn test_log_uniform_density_integrates_to_one() {
        let d = Univariate::LogUniform { min: 1.0, max: 100.0 };
        let n = 100_000;
        let step = 99.0 / n as f64;
        let integral: f64 = (0..n)
            .map(|i| d.density(1.0 + (i as f64 + 0.5) * step) * step)
            .sum();
        assert!((integral - 1.0).abs() < 1e-3);
    }

    #[test]
    fn test_spec_parses_from_toml() {
        let spec: ParameterSpec =
            toml::from_str("name = \"x\"\ndistribution = \"normal\"\nmean = 1.0\nstd = 2.0").unwrap();
        assert_eq!(spec.distribution, Univariate::Normal { mean: 1.0, std: 2.0 });
    }

    proptest! {
        #[test]
        fn prop_draws_have_positive_density(seed in any::<u64>(), n in 1usize..64) {
            let prior = PriorDistribution::new(vec![
                ParameterSpec::new("a", Univariate::Uniform { min: -1.0, max: 2.0 }),
                ParameterSpec::new("b", Univariate::LogUniform { min: 1e-3, max: 1e3 }),
                ParameterSpec::new("c", Univariate::Normal { mean: 0.0, std: 0.5 }),
            ]).unwrap();
            let mut rng = Xoshiro256PlusPlus::seed_from_u64(seed);
            let points = prior.draw(n, &mut rng);
            prop_assert_eq!(points.len(), n);
            for p in &points {
                prop_assert_eq!(p.len(), 3);
                prop_assert!(prior.density_at(p) > 0.0);
            }
        }
    }
}
