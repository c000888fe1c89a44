//! Scoring of completed runs.
//!
//! Epistemic foundation:
//! - K_i: Each analyzer yields one log-likelihood per sample
//! - K_i: Site score = analyzer scores combined per site; total = sum over sites
//! - B_i: Score files may be missing or malformed → Result

use super::{LocalPool, RunHandle};
use crate::models::{
    CalibError, Column, Result, SampleBatch, SampleTable, SiteConfig, SAMPLE_INDEX, TOTAL,
};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use tracing::debug;

/// Scores for every sample of a run.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoreSet {
    /// `(column name, one score per sample)` per site and analyzer
    pub analyzer_scores: Vec<(String, Vec<f64>)>,
    /// Combined score per sample
    pub totals: Vec<f64>,
    /// Analyzer-specific cached artifacts
    pub artifacts: BTreeMap<String, Value>,
}

/// Column name of one site's analyzer.
pub fn analyzer_column(site: &str, analyzer: &str) -> String {
    format!("{site}.{analyzer}")
}

impl ScoreSet {
    /// Build a score set by looking up each analyzer score, then combining
    /// per site and summing across sites.
    pub fn from_lookup(
        sites: &[SiteConfig],
        n_samples: usize,
        mut lookup: impl FnMut(&str, &str, usize) -> Result<f64>,
    ) -> Result<Self> {
        let mut analyzer_scores = Vec::new();
        let mut totals = vec![0.0; n_samples];

        for site in sites {
            let mut columns = Vec::with_capacity(site.analyzers.len());
            for analyzer in &site.analyzers {
                let scores = (0..n_samples)
                    .map(|i| lookup(&site.name, analyzer, i))
                    .collect::<Result<Vec<f64>>>()?;
                columns.push(scores);
            }
            for (i, total) in totals.iter_mut().enumerate() {
                let per_analyzer: Vec<f64> = columns.iter().map(|c| c[i]).collect();
                *total += site.combine.apply(&per_analyzer).unwrap_or(0.0);
            }
            for (analyzer, scores) in site.analyzers.iter().zip(columns) {
                analyzer_scores.push((analyzer_column(&site.name, analyzer), scores));
            }
        }

        let artifacts = analyzer_scores
            .iter()
            .map(|(name, scores)| (name.clone(), summarize(scores)))
            .collect();

        Ok(Self {
            analyzer_scores,
            totals,
            artifacts,
        })
    }

    pub fn len(&self) -> usize {
        self.totals.len()
    }

    pub fn is_empty(&self) -> bool {
        self.totals.is_empty()
    }

    /// Results table: `sample_index`, one column per analyzer, `total`.
    pub fn to_table(&self) -> Result<SampleTable> {
        let mut columns = vec![Column::int(
            SAMPLE_INDEX,
            (0..self.totals.len() as i64).collect(),
        )];
        for (name, scores) in &self.analyzer_scores {
            columns.push(Column::float(name.clone(), scores.clone()));
        }
        columns.push(Column::float(TOTAL, self.totals.clone()));
        SampleTable::from_columns(columns)
    }
}

/// Best sample and score range of one analyzer column.
fn summarize(scores: &[f64]) -> Value {
    let best = scores
        .iter()
        .enumerate()
        .filter(|(_, s)| !s.is_nan())
        .max_by(|a, b| a.1.total_cmp(b.1));
    let worst = scores.iter().copied().filter(|s| !s.is_nan()).fold(f64::INFINITY, f64::min);
    match best {
        Some((index, &score)) => json!({
            "best_sample": index,
            "best_score": score,
            "worst_score": worst,
        }),
        None => Value::Null,
    }
}

/// Produces one score per sample for a completed run.
#[async_trait]
pub trait ScoringProvider: Send + Sync {
    async fn score(
        &self,
        handle: &RunHandle,
        batch: &SampleBatch,
        sites: &[SiteConfig],
    ) -> Result<ScoreSet>;
}

/// Reads a JSON object `{ "<analyzer>": <score>, ... }` from each job directory.
pub struct FileScorer {
    score_file: String,
}

impl FileScorer {
    pub fn new(score_file: impl Into<String>) -> Self {
        Self {
            score_file: score_file.into(),
        }
    }

    fn read_scores(&self, path: &Path) -> Result<BTreeMap<String, f64>> {
        let content = fs::read_to_string(path)
            .map_err(|e| CalibError::Scoring(format!("reading {}: {e}", path.display())))?;
        serde_json::from_str(&content)
            .map_err(|e| CalibError::Scoring(format!("parsing {}: {e}", path.display())))
    }
}

#[async_trait]
impl ScoringProvider for FileScorer {
    async fn score(
        &self,
        handle: &RunHandle,
        batch: &SampleBatch,
        sites: &[SiteConfig],
    ) -> Result<ScoreSet> {
        let output_dir = handle.output_dir.clone().ok_or_else(|| {
            CalibError::Scoring(format!("run {} has no output directory", handle.run_id))
        })?;

        let mut cache: BTreeMap<(String, usize), BTreeMap<String, f64>> = BTreeMap::new();
        let scores = ScoreSet::from_lookup(sites, batch.len(), |site, analyzer, sample_index| {
            let key = (site.to_string(), sample_index);
            if !cache.contains_key(&key) {
                let path = LocalPool::job_dir(&output_dir, site, sample_index).join(&self.score_file);
                cache.insert(key.clone(), self.read_scores(&path)?);
            }
            cache
                .get(&key)
                .and_then(|scores| scores.get(analyzer))
                .copied()
                .ok_or_else(|| {
                    CalibError::Scoring(format!(
                        "no score for analyzer '{analyzer}' at site '{site}', sample {sample_index}"
                    ))
                })
        })?;

        debug!(
            run_id = %handle.run_id,
            samples = scores.len(),
            "Scored run from files"
        );
        Ok(scores)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Combine;
    use crate::pool::Location;
    use tempfile::TempDir;

    fn sites() -> Vec<SiteConfig> {
        vec![
            SiteConfig {
                name: "a".to_string(),
                analyzers: vec!["p".to_string(), "q".to_string()],
                combine: Combine::Mean,
            },
            SiteConfig {
                name: "b".to_string(),
                analyzers: vec!["p".to_string()],
                combine: Combine::Sum,
            },
        ]
    }

    #[test]
    fn test_combines_per_site_then_sums() {
        let scores = ScoreSet::from_lookup(&sites(), 2, |site, analyzer, i| {
            Ok(match (site, analyzer) {
                ("a", "p") => -2.0,
                ("a", "q") => -4.0,
                _ => -(i as f64),
            })
        })
        .unwrap();
        assert_eq!(scores.totals, vec![-3.0, -4.0]);
        assert_eq!(scores.analyzer_scores.len(), 3);
        assert_eq!(scores.analyzer_scores[1].0, "a.q");
        assert_eq!(scores.artifacts["b.p"]["best_sample"], 0);

        let table = scores.to_table().unwrap();
        assert_eq!(table.names(), vec!["sample_index", "a.p", "a.q", "b.p", "total"]);
    }

    #[tokio::test]
    async fn test_file_scorer_reads_job_files() {
        let dir = TempDir::new().unwrap();
        let mut handle = RunHandle::new(0, 2, Location::Local, None);
        handle.output_dir = Some(dir.path().to_path_buf());
        for i in 0..2 {
            for (site, body) in [("a", r#"{"p": -1.0, "q": -3.0}"#), ("b", r#"{"p": -0.5}"#)] {
                let job = LocalPool::job_dir(dir.path(), site, i);
                fs::create_dir_all(&job).unwrap();
                fs::write(job.join("scores.json"), body).unwrap();
            }
        }
        let batch = SampleBatch::new(0, vec!["x".to_string()], vec![vec![0.1], vec![0.2]]);

        let scores = FileScorer::new("scores.json")
            .score(&handle, &batch, &sites())
            .await
            .unwrap();
        assert_eq!(scores.totals, vec![-2.5, -2.5]);
    }

    #[tokio::test]
    async fn test_file_scorer_reports_missing_analyzer() {
        let dir = TempDir::new().unwrap();
        let mut handle = RunHandle::new(0, 1, Location::Local, None);
        handle.output_dir = Some(dir.path().to_path_buf());
        for site in ["a", "b"] {
            let job = LocalPool::job_dir(dir.path(), site, 0);
            fs::create_dir_all(&job).unwrap();
            fs::write(job.join("scores.json"), r#"{"p": -1.0}"#).unwrap();
        }
        let batch = SampleBatch::new(0, vec!["x".to_string()], vec![vec![0.1]]);

        let err = FileScorer::new("scores.json")
            .score(&handle, &batch, &sites())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("analyzer 'q'"));
    }
}
