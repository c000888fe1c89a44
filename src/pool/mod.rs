//! Execution and scoring collaborators.
//!
//! Epistemic foundation:
//! - K_i: A run is identified by its handle; the handle is persisted with the iteration
//! - B_i: Simulations may fail or never finish → per-sample status
//! - I^B: The backend may move between locations across a resume

mod local;
mod scoring;

pub use local::*;
pub use scoring::*;

use crate::models::{Result, SampleBatch};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use uuid::Uuid;

/// Where simulations execute.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Location {
    /// On this machine
    #[default]
    Local,
    /// On a remote cluster
    Cluster,
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Local => f.write_str("local"),
            Self::Cluster => f.write_str("cluster"),
        }
    }
}

/// Opaque handle to a commissioned run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RunHandle {
    pub run_id: Uuid,
    pub iteration: u32,
    pub n_samples: usize,
    pub location: Location,
    /// Where the run writes its outputs, if on a reachable filesystem
    #[serde(default)]
    pub output_dir: Option<PathBuf>,
    pub created_at: DateTime<Utc>,
}

impl RunHandle {
    pub fn new(iteration: u32, n_samples: usize, location: Location, output_dir: Option<PathBuf>) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            iteration,
            n_samples,
            location,
            output_dir,
            created_at: Utc::now(),
        }
    }
}

/// Status of one sample's simulations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SimStatus {
    Pending,
    Succeeded,
    Failed,
}

/// Counts over a run's per-sample statuses.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunProgress {
    pub pending: usize,
    pub succeeded: usize,
    /// Sample indices whose simulations failed
    pub failed: Vec<usize>,
}

impl RunProgress {
    pub fn from_statuses(statuses: &[SimStatus]) -> Self {
        let mut progress = Self::default();
        for (sample_index, status) in statuses.iter().enumerate() {
            match status {
                SimStatus::Pending => progress.pending += 1,
                SimStatus::Succeeded => progress.succeeded += 1,
                SimStatus::Failed => progress.failed.push(sample_index),
            }
        }
        progress
    }

    pub fn total(&self) -> usize {
        self.pending + self.succeeded + self.failed.len()
    }

    /// No sample is still pending.
    pub fn is_finished(&self) -> bool {
        self.pending == 0
    }
}

/// Runs simulations for a batch of samples.
#[async_trait]
pub trait ExecutionBackend: Send + Sync {
    fn location(&self) -> Location;

    /// Start simulations for every sample of `batch`.
    async fn commission(&self, batch: &SampleBatch) -> Result<RunHandle>;

    /// One status per sample, in sample-index order.
    async fn poll(&self, handle: &RunHandle) -> Result<Vec<SimStatus>>;

    async fn cancel(&self, handle: &RunHandle) -> Result<()>;

    /// Delete local artifacts of a run.
    async fn purge(&self, _handle: &RunHandle) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_progress_counts() {
        let progress = RunProgress::from_statuses(&[
            SimStatus::Succeeded,
            SimStatus::Failed,
            SimStatus::Pending,
            SimStatus::Failed,
        ]);
        assert_eq!(progress.pending, 1);
        assert_eq!(progress.succeeded, 1);
        assert_eq!(progress.failed, vec![1, 3]);
        assert_eq!(progress.total(), 4);
        assert!(!progress.is_finished());
    }

    #[test]
    fn test_location_serde() {
        assert_eq!(serde_json::to_string(&Location::Cluster).unwrap(), "\"cluster\"");
        assert_eq!(Location::Local.to_string(), "local");
    }
}
