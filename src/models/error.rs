//! Error types for calibrix.
//!
//! Epistemic taxonomy:
//! - B_i falsified: Configuration rejected at construction (bad ranges, bad settings)
//! - B_i falsified: Persisted state disagrees with what a resume needs
//! - K_i violated: The sampling distribution collapsed (statistically meaningless state)
//! - I^B materialized: The execution backend failed or moved under us

use crate::checkpoint::ResumePoint;
use crate::pool::Location;
use std::path::PathBuf;
use thiserror::Error;

/// Top-level error type for calibrix.
#[derive(Debug, Error)]
pub enum CalibError {
    // ═══════════════════════════════════════════════════════════════════
    // CONFIGURATION: fail fast
    // ═══════════════════════════════════════════════════════════════════

    #[error("Configuration error: {0}")]
    Config(#[from] super::ConfigError),

    #[error("Invalid range for parameter '{param}': {reason}")]
    InvalidRange { param: String, reason: String },

    #[error("Invalid settings: {0}")]
    InvalidSettings(String),

    // ═══════════════════════════════════════════════════════════════════
    // RESUME CONSISTENCY: fatal unless the operator confirms a fallback
    // ═══════════════════════════════════════════════════════════════════

    #[error("Calibration '{0}' already exists; use resume to continue it")]
    CalibrationExists(String),

    #[error("No calibration metadata found at {}", path.display())]
    MissingMetadata { path: PathBuf },

    #[error("Requested resume at {requested} but iteration {iteration} only reached {available}")]
    ResumeUnavailable {
        iteration: u32,
        requested: ResumePoint,
        available: ResumePoint,
    },

    #[error("Unsupported state version {found} in {what} (expected {expected})")]
    StateVersion {
        what: &'static str,
        found: u32,
        expected: u32,
    },

    #[error("Inconsistent state: {0}")]
    InconsistentState(String),

    // ═══════════════════════════════════════════════════════════════════
    // ALGORITHMIC: the sampling distribution collapsed
    // ═══════════════════════════════════════════════════════════════════

    /// `weights` are the log weights when raised while normalizing
    #[error("No sample has positive importance weight (weights: {weights:?})")]
    InsufficientSupport { weights: Vec<f64> },

    #[error("Resampling exhausted after {attempts} attempts: {invalid} samples still outside prior support")]
    ExhaustedResampling {
        attempts: usize,
        invalid: usize,
        weights: Vec<f64>,
    },

    #[error("Kernel covariance for iteration {iteration} is not positive definite")]
    DegenerateCovariance { iteration: u32, weights: Vec<f64> },

    #[error("Invalid score {value} for sample {sample_index}: {reason}")]
    InvalidScore {
        sample_index: usize,
        value: f64,
        reason: &'static str,
    },

    // ═══════════════════════════════════════════════════════════════════
    // EXECUTION: surfaced behind a confirm/deny gate
    // ═══════════════════════════════════════════════════════════════════

    #[error("Iteration {iteration}: {} simulation(s) failed (samples {failed:?})", failed.len())]
    ExecutionFailed { iteration: u32, failed: Vec<usize> },

    #[error("Execution location changed from {previous} to {current}")]
    LocationChanged { previous: Location, current: Location },

    #[error("Execution backend error: {0}")]
    Backend(String),

    #[error("Scoring error: {0}")]
    Scoring(String),

    #[error("Calibration wait cancelled")]
    Cancelled,

    // ═══════════════════════════════════════════════════════════════════
    // INFRASTRUCTURE
    // ═══════════════════════════════════════════════════════════════════

    #[error("IO error: {context}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Configuration file errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    FileRead {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("Invalid value for '{field}': {reason}")]
    InvalidValue { field: String, reason: String },
}

impl CalibError {
    /// Create an IO error with context.
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    /// Create an invalid-range error for a named parameter.
    pub fn invalid_range(param: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidRange {
            param: param.into(),
            reason: reason.into(),
        }
    }

    /// Whether this error means the sampling distribution itself collapsed.
    ///
    /// These are never retried: resuming would reproduce the same state.
    pub fn is_algorithmic(&self) -> bool {
        matches!(
            self,
            Self::InsufficientSupport { .. }
                | Self::ExhaustedResampling { .. }
                | Self::DegenerateCovariance { .. }
                | Self::InvalidScore { .. }
        )
    }

    /// Whether the calibration can be picked up again with `resume`.
    pub fn is_resumable(&self) -> bool {
        matches!(
            self,
            Self::Cancelled
                | Self::Backend(_)
                | Self::Scoring(_)
                | Self::Io { .. }
                | Self::ExecutionFailed { .. }
        )
    }
}

/// Result type alias for calibrix.
pub type Result<T> = std::result::Result<T, CalibError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_algorithmic_errors_are_not_resumable() {
        let err = CalibError::InsufficientSupport {
            weights: vec![0.0, 0.0],
        };
        assert!(err.is_algorithmic());
        assert!(!err.is_resumable());
        assert!(err.to_string().contains("[0.0, 0.0]"));
    }

    #[test]
    fn test_execution_failure_message() {
        let err = CalibError::ExecutionFailed {
            iteration: 3,
            failed: vec![1, 4],
        };
        assert_eq!(
            err.to_string(),
            "Iteration 3: 2 simulation(s) failed (samples [1, 4])"
        );
        assert!(err.is_resumable());
    }

    #[test]
    fn test_scoring_failures_are_resumable() {
        let err = CalibError::Scoring("outputs not readable".to_string());
        assert!(err.is_resumable());
        assert!(!err.is_algorithmic());
    }

    #[test]
    fn test_collapse_errors_carry_weights() {
        let err = CalibError::DegenerateCovariance {
            iteration: 2,
            weights: vec![1.0, 0.0],
        };
        assert!(err.is_algorithmic());
        assert!(matches!(err, CalibError::DegenerateCovariance { ref weights, .. } if weights == &[1.0, 0.0]));
    }
}
