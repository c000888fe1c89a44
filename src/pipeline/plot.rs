//! Visualization hooks.
//!
//! Plotters observe an iteration; they never mutate calibration state.

use crate::checkpoint::{CalibrationRecord, IterationRecord, ResumePoint};
use crate::models::{Result, SampleTable, ITERATION, SAMPLE_INDEX, TOTAL};
use tracing::info;

/// What a plotter sees of one iteration.
#[derive(Debug, Clone, Copy)]
pub struct IterationView<'a> {
    pub iteration: u32,
    /// Stage the view was produced at
    pub stage: ResumePoint,
    pub calibration: &'a CalibrationRecord,
    pub record: &'a IterationRecord,
    /// Cumulative summary up to the iteration being shown
    pub summary: &'a SampleTable,
}

pub trait Plotter: Send + Sync {
    fn name(&self) -> &str;

    fn visualize(&self, view: &IterationView<'_>) -> Result<()>;
}

/// Logs the best-ranked samples of the summary.
pub struct SummaryLogger {
    num_to_plot: usize,
}

impl SummaryLogger {
    pub fn new(num_to_plot: usize) -> Self {
        Self { num_to_plot }
    }

    /// One line per row of the best `num_to_plot` rows.
    pub fn lines(&self, view: &IterationView<'_>) -> Result<Vec<String>> {
        let summary = view.summary;
        let n = summary.len().min(self.num_to_plot);
        if n == 0 {
            return Ok(Vec::new());
        }
        let iterations = summary.ints(ITERATION)?;
        let indices = summary.ints(SAMPLE_INDEX)?;
        let totals = summary.optional_floats(TOTAL)?;
        let params = view
            .calibration
            .param_names
            .iter()
            .map(|name| Ok((name.as_str(), summary.floats(name)?)))
            .collect::<Result<Vec<_>>>()?;

        Ok((0..n)
            .map(|row| {
                let values: Vec<String> = params
                    .iter()
                    .map(|(name, column)| format!("{name}={:.6}", column[row]))
                    .collect();
                let total = totals[row].map_or_else(|| "-".to_string(), |t| format!("{t:.4}"));
                format!(
                    "#{} iter {} sample {} total {} [{}]",
                    row + 1,
                    iterations[row],
                    indices[row],
                    total,
                    values.join(", ")
                )
            })
            .collect())
    }
}

impl Plotter for SummaryLogger {
    fn name(&self) -> &str {
        "summary"
    }

    fn visualize(&self, view: &IterationView<'_>) -> Result<()> {
        match view.stage {
            ResumePoint::Commission => {
                let n_samples = view.record.samples.as_ref().map_or(0, SampleTable::len);
                info!(iteration = view.iteration, samples = n_samples, "Commissioned samples");
            }
            _ => {
                for line in self.lines(view)? {
                    info!(iteration = view.iteration, "{line}");
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Column, SampleBatch};
    use crate::pool::Location;

    #[test]
    fn test_lines_rank_best_first() {
        let mut calibration = CalibrationRecord::new(
            "c",
            Location::Local,
            "imis",
            vec!["x".to_string()],
            Vec::new(),
        );
        let samples = SampleBatch::new(0, vec!["x".to_string()], vec![vec![0.25], vec![0.5]]).to_table();
        let results = SampleTable::from_columns(vec![
            Column::int(SAMPLE_INDEX, vec![0, 1]),
            Column::float(TOTAL, vec![-4.0, -2.0]),
        ])
        .unwrap();
        calibration.merge_results(0, &samples, &results).unwrap();
        let record = IterationRecord::new(0);
        let view = IterationView {
            iteration: 0,
            stage: ResumePoint::Plot,
            calibration: &calibration,
            record: &record,
            summary: &calibration.summary,
        };

        let lines = SummaryLogger::new(1).lines(&view).unwrap();
        assert_eq!(lines.len(), 1);
        assert!(lines[0].starts_with("#1 iter 0 sample 1 total -2.0000"));
        assert!(lines[0].contains("x=0.500000"));
        SummaryLogger::new(5).visualize(&view).unwrap();
    }
}
