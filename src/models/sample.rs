//! Sample and result types for calibrix.
//!
//! K_i: These types represent the core data flow through an iteration.

use crate::models::{CalibError, Column, ColumnType, Result, SampleTable};
use serde::{Deserialize, Serialize};

/// Name of the per-iteration sample index column.
pub const SAMPLE_INDEX: &str = "sample_index";

/// Name of the iteration column in cumulative tables.
pub const ITERATION: &str = "iteration";

/// Name of the combined score column.
pub const TOTAL: &str = "total";

/// One parameter point.
///
/// K_i: `sample_index` is zero-based and unique within its iteration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    /// Iteration that drew this sample
    pub iteration: u32,
    /// Position within the iteration's batch
    pub sample_index: usize,
    /// Parameter values, ordered like the batch's parameter names
    pub values: Vec<f64>,
}

/// The batch of samples proposed for one iteration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SampleBatch {
    pub iteration: u32,
    pub param_names: Vec<String>,
    pub samples: Vec<Sample>,
}

impl SampleBatch {
    /// Build a batch from raw points, assigning sample indices in order.
    pub fn new(iteration: u32, param_names: Vec<String>, points: Vec<Vec<f64>>) -> Self {
        let samples = points
            .into_iter()
            .enumerate()
            .map(|(sample_index, values)| Sample {
                iteration,
                sample_index,
                values,
            })
            .collect();
        Self {
            iteration,
            param_names,
            samples,
        }
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Parameter values of every sample, in sample-index order.
    pub fn points(&self) -> Vec<Vec<f64>> {
        self.samples.iter().map(|s| s.values.clone()).collect()
    }

    /// `(name, value)` pairs for one sample.
    pub fn named_values(&self, sample_index: usize) -> Vec<(&str, f64)> {
        self.samples
            .get(sample_index)
            .map(|s| {
                self.param_names
                    .iter()
                    .map(String::as_str)
                    .zip(s.values.iter().copied())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Table with an integer `sample_index` column and one float column per parameter.
    pub fn to_table(&self) -> SampleTable {
        let mut columns = Vec::with_capacity(self.param_names.len() + 1);
        columns.push(Column::int(
            SAMPLE_INDEX,
            self.samples.iter().map(|s| s.sample_index as i64).collect(),
        ));
        for (dim, name) in self.param_names.iter().enumerate() {
            columns.push(Column::float(
                name.clone(),
                self.samples.iter().map(|s| s.values[dim]).collect(),
            ));
        }
        // Parameter names are unique (checked when the prior is built) and
        // every column has one value per sample.
        SampleTable::from_columns(columns).unwrap_or_default()
    }

    /// Rebuild a batch from a table written by [`SampleBatch::to_table`].
    pub fn from_table(iteration: u32, param_names: &[String], table: &SampleTable) -> Result<Self> {
        let indices = table.ints(SAMPLE_INDEX)?;
        let columns = param_names
            .iter()
            .map(|name| table.floats(name))
            .collect::<Result<Vec<_>>>()?;

        let mut samples = Vec::with_capacity(indices.len());
        for (row, &index) in indices.iter().enumerate() {
            if index != row as i64 {
                return Err(CalibError::InconsistentState(format!(
                    "iteration {iteration}: sample index {index} stored at row {row}"
                )));
            }
            samples.push(Sample {
                iteration,
                sample_index: row,
                values: columns.iter().map(|c| c[row]).collect(),
            });
        }

        Ok(Self {
            iteration,
            param_names: param_names.to_vec(),
            samples,
        })
    }

    /// Schema of the tables produced by [`SampleBatch::to_table`].
    pub fn schema(param_names: &[String]) -> Vec<(String, ColumnType)> {
        std::iter::once((SAMPLE_INDEX.to_string(), ColumnType::Int))
            .chain(param_names.iter().map(|n| (n.clone(), ColumnType::Float)))
            .collect()
    }
}

/// Weighted samples produced when a calibration ends.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FinalSamples {
    pub param_names: Vec<String>,
    pub samples: Vec<Vec<f64>>,
    pub weights: Vec<f64>,
}

impl FinalSamples {
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names() -> Vec<String> {
        vec!["a".to_string(), "b".to_string()]
    }

    #[test]
    fn test_batch_assigns_indices() {
        let batch = SampleBatch::new(2, names(), vec![vec![0.1, 0.2], vec![0.3, 0.4]]);
        assert_eq!(batch.len(), 2);
        assert_eq!(batch.samples[1].sample_index, 1);
        assert_eq!(batch.samples[1].iteration, 2);
        assert_eq!(batch.named_values(1), vec![("a", 0.3), ("b", 0.4)]);
    }

    #[test]
    fn test_table_round_trip() {
        let batch = SampleBatch::new(1, names(), vec![vec![0.1, 0.2], vec![0.3, 0.4]]);
        let table = batch.to_table();
        assert_eq!(table.schema(), SampleBatch::schema(&names()));
        let restored = SampleBatch::from_table(1, &names(), &table).unwrap();
        assert_eq!(restored, batch);
    }

    #[test]
    fn test_from_table_rejects_shuffled_indices() {
        let table = SampleTable::from_columns(vec![
            Column::int(SAMPLE_INDEX, vec![1, 0]),
            Column::float("a", vec![0.1, 0.2]),
            Column::float("b", vec![0.1, 0.2]),
        ])
        .unwrap();
        assert!(SampleBatch::from_table(0, &names(), &table).is_err());
    }
}
