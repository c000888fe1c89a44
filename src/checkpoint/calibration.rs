//! Calibration-level metadata and the cumulative summary table.
//!
//! K_i: The summary holds one row per scored sample, sorted by `total`
//! descending; rows of an iteration are replaced, never duplicated.

use crate::models::{
    CalibError, Column, ColumnData, FinalSamples, Result, SampleTable, SiteConfig, ITERATION,
    TOTAL,
};
use crate::pool::Location;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Version written into every persisted calibration record.
pub const CALIBRATION_RECORD_VERSION: u32 = 1;

/// Persisted calibration metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CalibrationRecord {
    pub version: u32,
    pub name: String,
    pub location: Location,
    /// Identifies this calibration's runs across iterations
    pub suite_id: Uuid,
    /// Latest iteration started
    pub iteration: u32,
    /// Algorithm kind the calibration was started with
    pub algorithm: String,
    pub param_names: Vec<String>,
    /// Sites and their analyzers
    pub sites: Vec<SiteConfig>,
    /// Every scored sample so far, best first
    pub summary: SampleTable,
    /// Set once the calibration has ended
    #[serde(default)]
    pub final_samples: Option<FinalSamples>,
    /// Whether it ended by convergence rather than the iteration limit
    #[serde(default)]
    pub converged: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl CalibrationRecord {
    pub fn new(
        name: impl Into<String>,
        location: Location,
        algorithm: impl Into<String>,
        param_names: Vec<String>,
        sites: Vec<SiteConfig>,
    ) -> Self {
        let now = Utc::now();
        Self {
            version: CALIBRATION_RECORD_VERSION,
            name: name.into(),
            location,
            suite_id: Uuid::new_v4(),
            iteration: 0,
            algorithm: algorithm.into(),
            param_names,
            sites,
            summary: SampleTable::new(),
            final_samples: None,
            converged: false,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.version != CALIBRATION_RECORD_VERSION {
            return Err(CalibError::StateVersion {
                what: "calibration record",
                found: self.version,
                expected: CALIBRATION_RECORD_VERSION,
            });
        }
        Ok(())
    }

    pub fn is_finished(&self) -> bool {
        self.final_samples.is_some()
    }

    /// Replace the summary rows of `iteration` with `samples` joined to `results`.
    ///
    /// `samples` and `results` are the iteration's tables, both with one row
    /// per sample in sample-index order.
    pub fn merge_results(
        &mut self,
        iteration: u32,
        samples: &SampleTable,
        results: &SampleTable,
    ) -> Result<()> {
        if samples.len() != results.len() {
            return Err(CalibError::InconsistentState(format!(
                "iteration {iteration}: {} samples but {} results",
                samples.len(),
                results.len()
            )));
        }

        let mut columns = vec![Column::int(ITERATION, vec![i64::from(iteration); samples.len()])];
        columns.extend(samples.columns().iter().cloned());
        columns.extend(
            results
                .columns()
                .iter()
                .filter(|c| samples.column(&c.name).is_none())
                .cloned(),
        );
        let rows = SampleTable::from_columns(columns)?;

        let mut summary = self.summary.clone();
        if let Ok(iterations) = summary.ints(ITERATION) {
            let stale: Vec<bool> = iterations.iter().map(|&k| k == i64::from(iteration)).collect();
            summary.retain_rows(|row| !stale[row]);
        }
        if summary.is_empty() {
            summary = SampleTable::new();
        }
        summary.append(&rows)?;
        summary.sort_by_float_desc(TOTAL)?;
        self.summary = summary;
        self.touch();
        Ok(())
    }

    /// Keep only rows of iterations `≤ max_iteration`; `None` clears the summary.
    pub fn truncate_summary(&mut self, max_iteration: Option<u32>) {
        self.summary = match max_iteration {
            Some(max) => rows_through(&self.summary, max),
            None => SampleTable::new(),
        };
    }

    /// Summary truncated to iterations `≤ max_iteration`, leaving `self` untouched.
    pub fn summary_through(&self, max_iteration: u32) -> SampleTable {
        rows_through(&self.summary, max_iteration)
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

fn rows_through(summary: &SampleTable, max_iteration: u32) -> SampleTable {
    match summary.column(ITERATION).map(|c| &c.data) {
        Some(ColumnData::Int(values)) => {
            let rows: Vec<usize> = values
                .iter()
                .enumerate()
                .filter(|(_, &k)| k <= i64::from(max_iteration))
                .map(|(row, _)| row)
                .collect();
            summary.select_rows(&rows)
        }
        _ => summary.clone(),
    }
}
