//! Per-iteration state and the resume-point state machine.
//!
//! Epistemic foundation:
//! - K_i: Resume points are totally ordered; `resume_point` is the stage entered
//! - K_i: Entering a stage clears every field produced at that stage or later
//! - B_i: A loaded record may violate its invariants → validate() → Result

use crate::models::{CalibError, Result, SampleTable};
use crate::pool::RunHandle;
use crate::sampling::AlgorithmState;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Version written into every persisted iteration record.
pub const ITERATION_RECORD_VERSION: u32 = 1;

/// Stages of one iteration, in execution order.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum ResumePoint {
    #[default]
    IterationStart,
    Commission,
    Analyze,
    Plot,
    NextPoint,
}

impl ResumePoint {
    pub const ALL: [ResumePoint; 5] = [
        Self::IterationStart,
        Self::Commission,
        Self::Analyze,
        Self::Plot,
        Self::NextPoint,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::IterationStart => "iteration_start",
            Self::Commission => "commission",
            Self::Analyze => "analyze",
            Self::Plot => "plot",
            Self::NextPoint => "next_point",
        }
    }

    /// The stage after this one; `None` for `NextPoint`.
    pub fn next(self) -> Option<Self> {
        match self {
            Self::IterationStart => Some(Self::Commission),
            Self::Commission => Some(Self::Analyze),
            Self::Analyze => Some(Self::Plot),
            Self::Plot => Some(Self::NextPoint),
            Self::NextPoint => None,
        }
    }
}

impl fmt::Display for ResumePoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResumePoint {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|p| p.as_str() == s)
            .ok_or_else(|| {
                format!(
                    "unknown stage '{s}' (expected one of: {})",
                    Self::ALL.map(|p| p.as_str()).join(", ")
                )
            })
    }
}

/// Persisted state of one iteration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct IterationRecord {
    pub version: u32,
    pub iteration: u32,
    pub resume_point: ResumePoint,
    /// Samples proposed for this iteration
    #[serde(default)]
    pub samples: Option<SampleTable>,
    /// Handle of the commissioned run
    #[serde(default)]
    pub simulation_link: Option<RunHandle>,
    /// One row per sample: analyzer scores and `total`
    #[serde(default)]
    pub results: Option<SampleTable>,
    /// Analyzer-specific cached artifacts
    #[serde(default)]
    pub analyzers: BTreeMap<String, serde_json::Value>,
    /// Algorithm state right after this iteration's samples were drawn
    #[serde(default)]
    pub algorithm_state: Option<AlgorithmState>,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl IterationRecord {
    pub fn new(iteration: u32) -> Self {
        let now = Utc::now();
        Self {
            version: ITERATION_RECORD_VERSION,
            iteration,
            resume_point: ResumePoint::IterationStart,
            samples: None,
            simulation_link: None,
            results: None,
            analyzers: BTreeMap::new(),
            algorithm_state: None,
            started_at: now,
            updated_at: now,
        }
    }

    /// Enter `point`, clearing the fields it and later stages produce.
    pub fn enter(&mut self, point: ResumePoint) {
        match point {
            ResumePoint::IterationStart | ResumePoint::Commission => {
                self.samples = None;
                self.simulation_link = None;
                self.results = None;
                self.analyzers.clear();
                self.algorithm_state = None;
            }
            ResumePoint::Analyze => {
                self.results = None;
                self.analyzers.clear();
            }
            ResumePoint::Plot | ResumePoint::NextPoint => {}
        }
        self.resume_point = point;
        self.touch();
    }

    /// Move to the stage after the current one, clearing as `enter` does.
    pub fn advance(&mut self) -> Result<ResumePoint> {
        let next = self.resume_point.next().ok_or_else(|| {
            CalibError::Internal(format!(
                "iteration {} is already at {}",
                self.iteration, self.resume_point
            ))
        })?;
        self.enter(next);
        Ok(next)
    }

    /// Store this iteration's scores.
    ///
    /// B_i(one row per sample) → Result
    pub fn set_results(
        &mut self,
        results: SampleTable,
        analyzers: BTreeMap<String, serde_json::Value>,
    ) -> Result<()> {
        let n_samples = self.samples.as_ref().map_or(0, SampleTable::len);
        if !results.is_empty() && results.len() != n_samples {
            return Err(CalibError::InconsistentState(format!(
                "iteration {}: {} result rows for {} samples",
                self.iteration,
                results.len(),
                n_samples
            )));
        }
        self.results = Some(results);
        self.analyzers = analyzers;
        self.touch();
        Ok(())
    }

    /// Whether this record has reached `point`.
    pub fn reached(&self, point: ResumePoint) -> bool {
        self.resume_point >= point
    }

    /// Check invariants of a loaded record.
    pub fn validate(&self) -> Result<()> {
        if self.version != ITERATION_RECORD_VERSION {
            return Err(CalibError::StateVersion {
                what: "iteration record",
                found: self.version,
                expected: ITERATION_RECORD_VERSION,
            });
        }
        if let (Some(samples), Some(results)) = (&self.samples, &self.results) {
            if !results.is_empty() && results.len() != samples.len() {
                return Err(CalibError::InconsistentState(format!(
                    "iteration {}: {} result rows for {} samples",
                    self.iteration,
                    results.len(),
                    samples.len()
                )));
            }
        }
        if self.results.is_some() && self.resume_point < ResumePoint::Analyze {
            return Err(CalibError::InconsistentState(format!(
                "iteration {} holds results at stage {}",
                self.iteration, self.resume_point
            )));
        }
        Ok(())
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Column;
    use crate::pool::Location;

    fn table(n: usize) -> SampleTable {
        SampleTable::from_columns(vec![Column::int(
            "sample_index",
            (0..n as i64).collect(),
        )])
        .unwrap()
    }

    fn filled() -> IterationRecord {
        let mut record = IterationRecord::new(2);
        record.enter(ResumePoint::Commission);
        record.samples = Some(table(3));
        record.simulation_link = Some(RunHandle::new(2, 3, Location::Local, None));
        record.enter(ResumePoint::Analyze);
        record.set_results(table(3), BTreeMap::new()).unwrap();
        record.enter(ResumePoint::Plot);
        record
    }

    #[test]
    fn test_points_are_ordered() {
        assert!(ResumePoint::IterationStart < ResumePoint::Commission);
        assert!(ResumePoint::Commission < ResumePoint::Analyze);
        assert!(ResumePoint::Analyze < ResumePoint::Plot);
        assert!(ResumePoint::Plot < ResumePoint::NextPoint);
        assert_eq!(ResumePoint::NextPoint.next(), None);
    }

    #[test]
    fn test_parse_and_display() {
        for point in ResumePoint::ALL {
            assert_eq!(point.to_string().parse::<ResumePoint>().unwrap(), point);
        }
        assert!("later".parse::<ResumePoint>().is_err());
        assert_eq!(
            serde_json::to_string(&ResumePoint::NextPoint).unwrap(),
            "\"next_point\""
        );
    }

    #[test]
    fn test_entering_analyze_clears_results_only() {
        let mut record = filled();
        record.enter(ResumePoint::Analyze);
        assert!(record.results.is_none());
        assert!(record.samples.is_some());
        assert!(record.simulation_link.is_some());
    }

    #[test]
    fn test_entering_commission_clears_everything() {
        let mut record = filled();
        record.enter(ResumePoint::Commission);
        assert!(record.samples.is_none());
        assert!(record.simulation_link.is_none());
        assert!(record.results.is_none());
        assert!(record.algorithm_state.is_none());
        assert_eq!(record.resume_point, ResumePoint::Commission);
    }

    #[test]
    fn test_results_must_match_samples() {
        let mut record = filled();
        record.enter(ResumePoint::Analyze);
        assert!(record.set_results(table(2), BTreeMap::new()).is_err());
    }

    #[test]
    fn test_advance_stops_at_next_point() {
        let mut record = filled();
        assert_eq!(record.advance().unwrap(), ResumePoint::NextPoint);
        assert!(record.advance().is_err());
    }

    #[test]
    fn test_unknown_fields_rejected() {
        let mut value = serde_json::to_value(IterationRecord::new(0)).unwrap();
        value["extra"] = serde_json::json!(1);
        assert!(serde_json::from_value::<IterationRecord>(value).is_err());
    }

    #[test]
    fn test_validate_catches_version_and_results() {
        let mut record = filled();
        record.validate().unwrap();
        record.version = 9;
        assert!(matches!(
            record.validate(),
            Err(CalibError::StateVersion { found: 9, .. })
        ));

        let mut record = filled();
        record.resume_point = ResumePoint::Commission;
        assert!(record.validate().is_err());
    }
}
