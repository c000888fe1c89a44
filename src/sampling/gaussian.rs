//! Multivariate normal kernels and the weighted statistics that fit them.

use nalgebra::{Cholesky, DMatrix, DVector, Dyn};
use rand::Rng;
use rand_distr::StandardNormal;
use std::f64::consts::PI;

/// Jitter attempts before a covariance is declared degenerate.
const MAX_JITTER_ATTEMPTS: u32 = 8;

/// A multivariate normal density with a factored covariance.
#[derive(Debug, Clone)]
pub struct Gaussian {
    mean: DVector<f64>,
    covariance: DMatrix<f64>,
    cholesky: Cholesky<f64, Dyn>,
    log_norm: f64,
}

impl Gaussian {
    /// Factor `covariance`, adding diagonal jitter proportional to its trace
    /// when it is not positive definite.
    ///
    /// Returns `None` when no jitter makes it factorable.
    pub fn new(mean: &[f64], covariance: &[Vec<f64>]) -> Option<Self> {
        let n = mean.len();
        if covariance.len() != n || covariance.iter().any(|row| row.len() != n) {
            return None;
        }
        let base = DMatrix::from_fn(n, n, |i, j| covariance[i][j]);
        if base.iter().any(|v| !v.is_finite()) {
            return None;
        }

        let scale = (base.trace() / n as f64).abs().max(f64::MIN_POSITIVE);
        let mut candidate = base.clone();
        for attempt in 0..=MAX_JITTER_ATTEMPTS {
            if attempt > 0 {
                let jitter = scale * 10f64.powi(attempt as i32 - 11);
                candidate = &base + DMatrix::identity(n, n) * jitter;
            }
            if let Some(cholesky) = Cholesky::new(candidate.clone()) {
                let log_det_half: f64 = cholesky.l_dirty().diagonal().iter().map(|d| d.ln()).sum();
                return Some(Self {
                    mean: DVector::from_column_slice(mean),
                    covariance: candidate,
                    cholesky,
                    log_norm: -0.5 * n as f64 * (2.0 * PI).ln() - log_det_half,
                });
            }
        }
        None
    }

    pub fn dims(&self) -> usize {
        self.mean.len()
    }

    pub fn mean(&self) -> Vec<f64> {
        self.mean.iter().copied().collect()
    }

    /// The covariance actually factored, jitter included.
    pub fn covariance(&self) -> Vec<Vec<f64>> {
        self.covariance
            .row_iter()
            .map(|row| row.iter().copied().collect())
            .collect()
    }

    /// Log density at `x`.
    pub fn ln_pdf(&self, x: &[f64]) -> f64 {
        if x.len() != self.dims() {
            return f64::NEG_INFINITY;
        }
        let diff = DVector::from_column_slice(x) - &self.mean;
        match self.cholesky.l_dirty().solve_lower_triangular(&diff) {
            Some(z) => self.log_norm - 0.5 * z.norm_squared(),
            None => f64::NEG_INFINITY,
        }
    }

    /// Density at `x`.
    pub fn pdf(&self, x: &[f64]) -> f64 {
        self.ln_pdf(x).exp()
    }

    /// One draw: `mean + L z` with `z` standard normal.
    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> Vec<f64> {
        let z = DVector::from_fn(self.dims(), |_, _| rng.sample::<f64, _>(StandardNormal));
        let x = &self.mean + self.cholesky.l() * z;
        x.iter().copied().collect()
    }
}

/// Per-dimension sample variance (n−1 denominator) of `points`.
///
/// Dimensions with zero or undefined variance fall back to 1.0.
pub fn sample_variances(points: &[Vec<f64>], dims: usize) -> Vec<f64> {
    let n = points.len();
    (0..dims)
        .map(|d| {
            if n < 2 {
                return 1.0;
            }
            let mean = points.iter().map(|p| p[d]).sum::<f64>() / n as f64;
            let var = points.iter().map(|p| (p[d] - mean).powi(2)).sum::<f64>() / (n - 1) as f64;
            if var.is_finite() && var > 0.0 {
                var
            } else {
                1.0
            }
        })
        .collect()
}

/// Standardized Euclidean distance between `a` and `b`.
pub fn seuclidean(a: &[f64], b: &[f64], variances: &[f64]) -> f64 {
    a.iter()
        .zip(b)
        .zip(variances)
        .map(|((x, y), v)| (x - y).powi(2) / v)
        .sum::<f64>()
        .sqrt()
}

/// Weighted covariance of `points` around `center`, following R's `cov.wt`.
///
/// Weights are normalized to sum to one. With more than one dimension the
/// result is scaled by `1 / (1 − Σw²)`; a single dimension uses the plain
/// weighted mean squared deviation.
pub fn weighted_covariance(points: &[&[f64]], weights: &[f64], center: &[f64]) -> Vec<Vec<f64>> {
    let dims = center.len();
    let total: f64 = weights.iter().sum();
    let w: Vec<f64> = weights.iter().map(|x| x / total).collect();

    let mut cov = vec![vec![0.0; dims]; dims];
    for (point, &wi) in points.iter().zip(&w) {
        for i in 0..dims {
            let di = point[i] - center[i];
            for j in 0..dims {
                cov[i][j] += wi * di * (point[j] - center[j]);
            }
        }
    }

    if dims > 1 {
        let correction = 1.0 / (1.0 - w.iter().map(|x| x * x).sum::<f64>());
        for row in &mut cov {
            for value in row.iter_mut() {
                *value *= correction;
            }
        }
    }
    cov
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand_xoshiro::Xoshiro256PlusPlus;

    #[test]
    fn test_standard_normal_density() {
        let g = Gaussian::new(&[0.0, 0.0], &[vec![1.0, 0.0], vec![0.0, 1.0]]).unwrap();
        let expected = 1.0 / (2.0 * PI);
        assert!((g.pdf(&[0.0, 0.0]) - expected).abs() < 1e-12);
        let at_one = expected * (-0.5f64).exp();
        assert!((g.pdf(&[1.0, 0.0]) - at_one).abs() < 1e-12);
    }

    #[test]
    fn test_correlated_density_matches_closed_form() {
        let cov = vec![vec![2.0, 0.6], vec![0.6, 1.0]];
        let g = Gaussian::new(&[1.0, -1.0], &cov).unwrap();
        let det: f64 = 2.0 * 1.0 - 0.36;
        let (dx, dy) = (0.5, 0.25);
        let maha = (1.0 * dx * dx - 2.0 * 0.6 * dx * dy + 2.0 * dy * dy) / det;
        let expected = (-0.5 * maha).exp() / (2.0 * PI * det.sqrt());
        assert!((g.pdf(&[1.5, -0.75]) - expected).abs() < 1e-12);
    }

    #[test]
    fn test_singular_covariance_gets_jitter() {
        let g = Gaussian::new(&[0.0, 0.0], &[vec![1.0, 1.0], vec![1.0, 1.0]]).unwrap();
        let cov = g.covariance();
        assert!(cov[0][0] > 1.0);
        assert!(g.pdf(&[0.0, 0.0]).is_finite());
    }

    #[test]
    fn test_rejects_non_finite_covariance() {
        assert!(Gaussian::new(&[0.0], &[vec![f64::NAN]]).is_none());
        assert!(Gaussian::new(&[0.0, 0.0], &[vec![1.0]]).is_none());
    }

    #[test]
    fn test_sample_moments() {
        let g = Gaussian::new(&[3.0], &[vec![4.0]]).unwrap();
        let mut rng = Xoshiro256PlusPlus::seed_from_u64(7);
        let n = 20_000;
        let draws: Vec<f64> = (0..n).map(|_| g.sample(&mut rng)[0]).collect();
        let mean = draws.iter().sum::<f64>() / n as f64;
        let var = draws.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / n as f64;
        assert!((mean - 3.0).abs() < 0.1);
        assert!((var - 4.0).abs() < 0.2);
    }

    #[test]
    fn test_weighted_covariance_one_dimension() {
        let points: Vec<&[f64]> = vec![&[1.0], &[3.0]];
        let cov = weighted_covariance(&points, &[1.0, 3.0], &[2.0]);
        assert!((cov[0][0] - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_weighted_covariance_applies_cov_wt_correction() {
        let points: Vec<&[f64]> = vec![&[1.0, 0.0], &[-1.0, 0.0]];
        let cov = weighted_covariance(&points, &[1.0, 1.0], &[0.0, 0.0]);
        // plain weighted second moment is 1.0, corrected by 1 / (1 - 0.5)
        assert!((cov[0][0] - 2.0).abs() < 1e-12);
        assert_eq!(cov[1][1], 0.0);
    }

    #[test]
    fn test_seuclidean_and_variances() {
        let points = vec![vec![0.0, 5.0], vec![2.0, 5.0]];
        let v = sample_variances(&points, 2);
        assert_eq!(v, vec![2.0, 1.0]);
        assert!((seuclidean(&[0.0, 0.0], &[2.0, 1.0], &v) - 3f64.sqrt()).abs() < 1e-12);
    }
}
