//! Cumulative sample history shared by the sampling algorithms.
//!
//! K_i: Rows are grouped by iteration in drawing order; iterations are
//! contiguous from 0 and sample indices restart at 0 in each iteration.
//! K_i: Results form a prefix of whole iterations.

use crate::models::{
    CalibError, Column, ColumnType, Result, SampleBatch, SampleTable, ITERATION, SAMPLE_INDEX,
};
use std::ops::Range;

/// Column holding the prior density of each sample.
pub const PRIOR: &str = "prior";

/// Column holding the score of each sample (missing until scored).
pub const RESULT: &str = "result";

/// Every sample drawn so far, with prior density and score.
#[derive(Debug, Clone, PartialEq)]
pub struct SampleHistory {
    param_names: Vec<String>,
    iterations: Vec<u32>,
    sample_indices: Vec<usize>,
    points: Vec<Vec<f64>>,
    priors: Vec<f64>,
    results: Vec<Option<f64>>,
}

impl SampleHistory {
    pub fn new(param_names: Vec<String>) -> Self {
        Self {
            param_names,
            iterations: Vec::new(),
            sample_indices: Vec::new(),
            points: Vec::new(),
            priors: Vec::new(),
            results: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn param_names(&self) -> &[String] {
        &self.param_names
    }

    pub fn points(&self) -> &[Vec<f64>] {
        &self.points
    }

    pub fn priors(&self) -> &[f64] {
        &self.priors
    }

    /// Iteration of the most recently drawn batch.
    pub fn latest_iteration(&self) -> Option<u32> {
        self.iterations.last().copied()
    }

    /// Row range of one iteration's batch.
    pub fn rows(&self, iteration: u32) -> Range<usize> {
        let start = self.iterations.partition_point(|&k| k < iteration);
        let end = self.iterations.partition_point(|&k| k <= iteration);
        start..end
    }

    /// Number of rows drawn in iteration 0.
    pub fn n_initial(&self) -> usize {
        self.rows(0).len()
    }

    /// Append the batch drawn for the next iteration.
    pub fn push_batch(&mut self, batch: &SampleBatch, priors: &[f64]) -> Result<()> {
        let expected = self.latest_iteration().map_or(0, |k| k + 1);
        if batch.iteration != expected {
            return Err(CalibError::InconsistentState(format!(
                "cannot append iteration {} after iteration {:?}",
                batch.iteration,
                self.latest_iteration()
            )));
        }
        if priors.len() != batch.len() {
            return Err(CalibError::Internal(format!(
                "{} prior densities for {} samples",
                priors.len(),
                batch.len()
            )));
        }
        for (sample, &prior) in batch.samples.iter().zip(priors) {
            self.iterations.push(batch.iteration);
            self.sample_indices.push(sample.sample_index);
            self.points.push(sample.values.clone());
            self.priors.push(prior);
            self.results.push(None);
        }
        Ok(())
    }

    /// Reload a batch already drawn.
    pub fn batch(&self, iteration: u32) -> Result<SampleBatch> {
        let rows = self.rows(iteration);
        if rows.is_empty() {
            return Err(CalibError::InconsistentState(format!(
                "no samples recorded for iteration {iteration}"
            )));
        }
        Ok(SampleBatch::new(
            iteration,
            self.param_names.clone(),
            self.points[rows].to_vec(),
        ))
    }

    /// Whether scores have been recorded for `iteration`.
    pub fn has_results(&self, iteration: u32) -> bool {
        let rows = self.rows(iteration);
        !rows.is_empty() && self.results[rows.start].is_some()
    }

    /// Store the scores of the latest batch.
    ///
    /// B_i(iteration is the latest batch and unscored) → Result
    pub fn record_results(&mut self, iteration: u32, results: &[f64]) -> Result<()> {
        if self.latest_iteration() != Some(iteration) {
            return Err(CalibError::InconsistentState(format!(
                "results for iteration {iteration} but latest batch is {:?}",
                self.latest_iteration()
            )));
        }
        if self.has_results(iteration) {
            return Err(CalibError::InconsistentState(format!(
                "results for iteration {iteration} already recorded"
            )));
        }
        let rows = self.rows(iteration);
        if results.len() != rows.len() {
            return Err(CalibError::InconsistentState(format!(
                "{} results for {} samples in iteration {iteration}",
                results.len(),
                rows.len()
            )));
        }
        for (slot, &value) in self.results[rows].iter_mut().zip(results) {
            *slot = Some(value);
        }
        Ok(())
    }

    /// Scores of every scored row, in row order.
    pub fn scored_results(&self) -> Vec<f64> {
        self.results.iter().map_while(|r| *r).collect()
    }

    /// Whether every drawn row has a score.
    pub fn all_scored(&self) -> bool {
        self.results.iter().all(Option::is_some)
    }

    pub fn to_table(&self) -> SampleTable {
        let mut columns = vec![
            Column::int(
                ITERATION,
                self.iterations.iter().map(|&k| i64::from(k)).collect(),
            ),
            Column::int(
                SAMPLE_INDEX,
                self.sample_indices.iter().map(|&i| i as i64).collect(),
            ),
        ];
        for (dim, name) in self.param_names.iter().enumerate() {
            columns.push(Column::float(
                name.clone(),
                self.points.iter().map(|p| p[dim]).collect(),
            ));
        }
        columns.push(Column::float(PRIOR, self.priors.clone()));
        columns.push(Column::optional_float(RESULT, self.results.clone()));
        // Parameter names never collide with the reserved columns.
        SampleTable::from_columns(columns).unwrap_or_default()
    }

    /// Schema of [`SampleHistory::to_table`] for the given parameters.
    pub fn schema(param_names: &[String]) -> Vec<(String, ColumnType)> {
        let mut schema = vec![
            (ITERATION.to_string(), ColumnType::Int),
            (SAMPLE_INDEX.to_string(), ColumnType::Int),
        ];
        schema.extend(param_names.iter().map(|n| (n.clone(), ColumnType::Float)));
        schema.push((PRIOR.to_string(), ColumnType::Float));
        schema.push((RESULT.to_string(), ColumnType::Float));
        schema
    }

    /// Rebuild a history from its table, checking row ordering and the
    /// result prefix.
    pub fn from_table(param_names: &[String], table: &SampleTable) -> Result<Self> {
        if table.schema() != Self::schema(param_names) {
            return Err(CalibError::InconsistentState(format!(
                "history table has schema {:?}",
                table.schema()
            )));
        }

        let mut history = Self::new(param_names.to_vec());
        let iterations = table.ints(ITERATION)?;
        let indices = table.ints(SAMPLE_INDEX)?;
        let columns = param_names
            .iter()
            .map(|n| table.floats(n))
            .collect::<Result<Vec<_>>>()?;
        let priors = table.floats(PRIOR)?;
        let results = table.optional_floats(RESULT)?;

        let mut unscored_seen = false;
        for row in 0..table.len() {
            let iteration = u32::try_from(iterations[row]).map_err(|_| {
                CalibError::InconsistentState(format!("negative iteration at row {row}"))
            })?;
            let expected_index = match history.iterations.last() {
                Some(&prev) if prev == iteration => history.sample_indices[row - 1] + 1,
                Some(&prev) if prev + 1 == iteration => 0,
                None if iteration == 0 => 0,
                _ => {
                    return Err(CalibError::InconsistentState(format!(
                        "iteration {iteration} out of order at row {row}"
                    )))
                }
            };
            if indices[row] != expected_index as i64 {
                return Err(CalibError::InconsistentState(format!(
                    "sample index {} at row {row}, expected {expected_index}",
                    indices[row]
                )));
            }
            match results[row] {
                Some(_) if unscored_seen => {
                    return Err(CalibError::InconsistentState(format!(
                        "scored row {row} follows unscored rows"
                    )))
                }
                Some(_) => {}
                None => unscored_seen = true,
            }

            history.iterations.push(iteration);
            history.sample_indices.push(expected_index);
            history.points.push(columns.iter().map(|c| c[row]).collect());
            history.priors.push(priors[row]);
            history.results.push(results[row]);
        }

        for k in 0..=history.latest_iteration().unwrap_or(0) {
            let rows = history.rows(k);
            if rows.is_empty() {
                continue;
            }
            let scored = history.results[rows.clone()].iter().filter(|r| r.is_some()).count();
            if scored != 0 && scored != rows.len() {
                return Err(CalibError::InconsistentState(format!(
                    "iteration {k} is partially scored"
                )));
            }
        }

        Ok(history)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names() -> Vec<String> {
        vec!["a".to_string(), "b".to_string()]
    }

    fn history() -> SampleHistory {
        let mut h = SampleHistory::new(names());
        let b0 = SampleBatch::new(0, names(), vec![vec![0.1, 0.2], vec![0.3, 0.4], vec![0.5, 0.6]]);
        h.push_batch(&b0, &[1.0, 1.0, 1.0]).unwrap();
        h.record_results(0, &[-1.0, -2.0, -3.0]).unwrap();
        let b1 = SampleBatch::new(1, names(), vec![vec![0.7, 0.8]]);
        h.push_batch(&b1, &[0.5]).unwrap();
        h
    }

    #[test]
    fn test_rows_and_batches() {
        let h = history();
        assert_eq!(h.rows(0), 0..3);
        assert_eq!(h.rows(1), 3..4);
        assert_eq!(h.n_initial(), 3);
        assert_eq!(h.batch(1).unwrap().points(), vec![vec![0.7, 0.8]]);
        assert!(h.batch(2).is_err());
        assert_eq!(h.scored_results(), vec![-1.0, -2.0, -3.0]);
        assert!(!h.all_scored());
    }

    #[test]
    fn test_record_results_guards() {
        let mut h = history();
        assert!(h.record_results(0, &[0.0, 0.0, 0.0]).is_err());
        assert!(h.record_results(1, &[0.0, 0.0]).is_err());
        h.record_results(1, &[-0.5]).unwrap();
        assert!(h.record_results(1, &[-0.5]).is_err());
        assert!(h.all_scored());
    }

    #[test]
    fn test_push_batch_requires_next_iteration() {
        let mut h = history();
        let b3 = SampleBatch::new(3, names(), vec![vec![0.0, 0.0]]);
        assert!(h.push_batch(&b3, &[1.0]).is_err());
    }

    #[test]
    fn test_table_round_trip_keeps_missing_results() {
        let h = history();
        let table = h.to_table();
        assert_eq!(table.schema(), SampleHistory::schema(&names()));
        let restored = SampleHistory::from_table(&names(), &table).unwrap();
        assert_eq!(restored, h);
    }

    #[test]
    fn test_from_table_rejects_result_gap() {
        let mut table = history().to_table();
        table.retain_rows(|row| row != 1);
        // iteration 0 now skips sample index 1
        assert!(SampleHistory::from_table(&names(), &table).is_err());
    }
}
