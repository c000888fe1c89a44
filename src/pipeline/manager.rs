//! Calibration driver.
//!
//! Pipeline flow, per iteration:
//! draw samples → commission → wait → score → update algorithm → plot → next point
//!
//! Epistemic foundation:
//! - K_i: Each stage persists its outputs before the record advances
//! - K_i: Record `k` holds the algorithm state right after iteration `k` was drawn
//! - B_i: Persisted state may be behind the requested resume point → Decider
//! - I^B: Simulations fail or hang → RestartAfterFailure prompt, cancellation

use super::{CancellationToken, Decider, Decision, IterationView, Plotter, Prompt};
use crate::checkpoint::{CalibStore, CalibrationRecord, IterationRecord, ResumePoint};
use crate::models::{CalibConfig, CalibError, FinalSamples, Result, SampleBatch, TOTAL};
use crate::pool::{ExecutionBackend, Location, RunHandle, RunProgress, ScoringProvider};
use crate::sampling::{PriorDistribution, SamplingAlgorithm};
use indicatif::{ProgressBar, ProgressStyle};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// External collaborators of the driver.
#[derive(Clone)]
pub struct Collaborators {
    pub backend: Arc<dyn ExecutionBackend>,
    pub scorer: Arc<dyn ScoringProvider>,
    pub decider: Arc<dyn Decider>,
    pub plotters: Vec<Arc<dyn Plotter>>,
}

/// How a calibration ended.
#[derive(Debug, Clone, PartialEq)]
pub struct CalibrationOutcome {
    /// Last iteration that ran
    pub iteration: u32,
    /// Whether the algorithm converged before the iteration limit
    pub converged: bool,
    pub final_samples: FinalSamples,
}

/// Snapshot of a calibration on disk.
#[derive(Debug, Clone, PartialEq)]
pub struct CalibStatus {
    pub name: String,
    pub location: Location,
    pub iteration: u32,
    /// Stage of the latest iteration, if its record exists
    pub resume_point: Option<ResumePoint>,
    pub finished: bool,
    pub converged: bool,
    /// Number of scored samples
    pub scored: usize,
    pub best_total: Option<f64>,
}

impl fmt::Display for CalibStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Calibration:  {}", self.name)?;
        writeln!(f, "Location:     {}", self.location)?;
        writeln!(f, "Iteration:    {}", self.iteration)?;
        match self.resume_point {
            Some(point) => writeln!(f, "Stage:        {point}")?,
            None => writeln!(f, "Stage:        (not started)")?,
        }
        writeln!(f, "Scored:       {}", self.scored)?;
        if let Some(best) = self.best_total {
            writeln!(f, "Best total:   {best:.4}")?;
        }
        let state = match (self.finished, self.converged) {
            (true, true) => "finished (converged)",
            (true, false) => "finished (iteration limit)",
            (false, _) => "in progress",
        };
        write!(f, "State:        {state}")
    }
}

/// Drives a named calibration through its iterations.
pub struct CalibManager {
    config: CalibConfig,
    store: CalibStore,
    algorithm: Box<dyn SamplingAlgorithm>,
    backend: Arc<dyn ExecutionBackend>,
    scorer: Arc<dyn ScoringProvider>,
    decider: Arc<dyn Decider>,
    plotters: Vec<Arc<dyn Plotter>>,
    cancel: CancellationToken,
    poll_interval: Duration,
}

impl CalibManager {
    /// Create a driver from configuration.
    ///
    /// B_i(config is valid) → Result
    /// B_i(priors and algorithm settings are consistent) → Result
    pub fn new(config: CalibConfig, collaborators: Collaborators) -> Result<Self> {
        config.validate()?;
        let prior = PriorDistribution::new(config.parameters.clone())?;
        let algorithm = config.algorithm.build(prior, config.calibration.seed)?;
        let store = CalibStore::new(&config.calibration.root, &config.calibration.name);
        let poll_interval = Duration::from_secs(config.calibration.poll_interval_secs);

        Ok(Self {
            config,
            store,
            algorithm,
            backend: collaborators.backend,
            scorer: collaborators.scorer,
            decider: collaborators.decider,
            plotters: collaborators.plotters,
            cancel: CancellationToken::new(),
            poll_interval,
        })
    }

    /// Override the backend poll interval.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Token that interrupts the wait for simulations.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn store(&self) -> &CalibStore {
        &self.store
    }

    // ═══════════════════════════════════════════════════════════════════
    // ENTRY POINTS
    // ═══════════════════════════════════════════════════════════════════

    /// Start a new calibration.
    pub async fn run(&mut self) -> Result<CalibrationOutcome> {
        let name = self.config.calibration.name.clone();
        if self.store.dir().exists() {
            let prompt = Prompt::OverwriteExisting { name: name.clone() };
            match self.decider.decide(&prompt).await? {
                Decision::Proceed => self.cleanup().await?,
                Decision::Abort => return Err(CalibError::CalibrationExists(name)),
            }
        }

        self.store.create()?;
        self.algorithm.reset();
        let mut calib = CalibrationRecord::new(
            name,
            self.backend.location(),
            self.algorithm.name(),
            self.algorithm.param_names().to_vec(),
            self.config.sites.clone(),
        );
        self.store.save_calibration(&calib)?;
        self.store.save_summary(&calib.summary)?;

        let mut record = IterationRecord::new(0);
        self.store.save_iteration(&record)?;

        info!(
            name = %calib.name,
            algorithm = %calib.algorithm,
            parameters = calib.param_names.len(),
            sites = calib.sites.len(),
            max_iterations = self.config.calibration.max_iterations,
            "Starting calibration"
        );
        self.drive(&mut calib, &mut record).await
    }

    /// Continue a calibration from `iteration` (default: latest) at `stage`
    /// (default: what the record reached).
    pub async fn resume(
        &mut self,
        iteration: Option<u32>,
        stage: Option<ResumePoint>,
    ) -> Result<CalibrationOutcome> {
        let mut calib = self.store.load_calibration()?;
        self.check_compatible(&calib)?;
        if let Some(outcome) = finished_outcome(&calib) {
            info!(name = %calib.name, "Calibration already finished; nothing to resume");
            return Ok(outcome);
        }

        let k = self.pick_iteration(&calib, iteration);
        let mut record = self.load_or_new(k)?;
        let available = record.resume_point;
        let mut target = stage.unwrap_or(available);

        if target > available {
            let prompt = Prompt::ResumeFallback {
                iteration: k,
                requested: target,
                available,
            };
            match self.decider.decide(&prompt).await? {
                Decision::Proceed => {
                    warn!(iteration = k, requested = %target, available = %available, "Falling back");
                    target = available;
                }
                Decision::Abort => {
                    return Err(CalibError::ResumeUnavailable {
                        iteration: k,
                        requested: target,
                        available,
                    })
                }
            }
        }

        let current = self.backend.location();
        if calib.location != current {
            let prompt = Prompt::LocationChanged {
                previous: calib.location,
                current,
            };
            match self.decider.decide(&prompt).await? {
                Decision::Proceed => {
                    warn!(previous = %calib.location, current = %current, "Restarting iteration at new location");
                    calib.location = current;
                    target = target.min(ResumePoint::Commission);
                }
                Decision::Abort => {
                    return Err(CalibError::LocationChanged {
                        previous: calib.location,
                        current,
                    })
                }
            }
        }

        self.rewind(&mut calib, &mut record, target)?;

        if target == ResumePoint::Plot {
            if let Some(handle) = record.simulation_link.clone() {
                let progress = self.wait_for_run(&handle).await?;
                if !progress.failed.is_empty() {
                    warn!(iteration = k, failed = ?progress.failed, "Scored run has failed simulations");
                }
            }
        }

        info!(iteration = k, stage = %target, "Resuming calibration");
        self.drive(&mut calib, &mut record).await
    }

    /// Re-score the stored outputs of `iteration` (default: latest) and
    /// continue the calibration from there.
    pub async fn reanalyze(&mut self, iteration: Option<u32>) -> Result<CalibrationOutcome> {
        let mut calib = self.store.load_calibration()?;
        self.check_compatible(&calib)?;
        let k = self.pick_iteration(&calib, iteration);
        let mut record = self.store.load_iteration(k)?;
        if !record.reached(ResumePoint::Analyze) {
            return Err(CalibError::ResumeUnavailable {
                iteration: k,
                requested: ResumePoint::Analyze,
                available: record.resume_point,
            });
        }

        calib.final_samples = None;
        calib.converged = false;
        self.rewind(&mut calib, &mut record, ResumePoint::Analyze)?;

        info!(iteration = k, "Reanalyzing iteration");
        self.drive(&mut calib, &mut record).await
    }

    /// Replay plotting of every iteration up to the current one that reached
    /// the plot stage.
    ///
    /// Returns the number of iterations plotted; never writes state.
    pub async fn replot(&self) -> Result<usize> {
        let calib = self.store.load_calibration()?;
        let mut plotted = 0;
        for k in self.store.list_iterations()? {
            // Records past the current iteration belong to an abandoned branch.
            if k > calib.iteration {
                debug!(iteration = k, latest = calib.iteration, "Skipping stale iteration");
                continue;
            }
            let record = self.store.load_iteration(k)?;
            if !record.reached(ResumePoint::Plot) {
                continue;
            }
            let summary = calib.summary_through(k);
            let view = IterationView {
                iteration: k,
                stage: ResumePoint::Plot,
                calibration: &calib,
                record: &record,
                summary: &summary,
            };
            self.visualize(&view);
            plotted += 1;
        }
        info!(iterations = plotted, "Replotted calibration");
        Ok(plotted)
    }

    /// Purge local run artifacts and delete the calibration directory.
    pub async fn cleanup(&self) -> Result<()> {
        if !self.store.dir().exists() {
            info!(dir = %self.store.dir().display(), "Nothing to clean up");
            return Ok(());
        }

        match self.store.load_calibration() {
            Ok(calib) if calib.location == Location::Local => {
                for k in self.store.list_iterations()? {
                    let handle = match self.store.load_iteration(k) {
                        Ok(record) => record.simulation_link,
                        Err(e) => {
                            warn!(iteration = k, error = %e, "Skipping unreadable iteration");
                            None
                        }
                    };
                    if let Some(handle) = handle {
                        self.backend.purge(&handle).await?;
                        debug!(iteration = k, run_id = %handle.run_id, "Purged run");
                    }
                }
            }
            Ok(_) => {}
            Err(CalibError::MissingMetadata { .. }) => {}
            Err(e) => warn!(error = %e, "Calibration metadata unreadable; removing directory anyway"),
        }

        self.store.remove()
    }

    /// Cancel the in-flight run of the latest iteration.
    ///
    /// Returns whether a run was cancelled.
    pub async fn kill(&self) -> Result<bool> {
        let calib = self.store.load_calibration()?;
        if !self.store.has_iteration(calib.iteration) {
            return Ok(false);
        }
        let record = self.store.load_iteration(calib.iteration)?;
        let in_flight = matches!(
            record.resume_point,
            ResumePoint::Commission | ResumePoint::Analyze
        );
        match (&record.simulation_link, in_flight) {
            (Some(handle), true) => {
                self.backend.cancel(handle).await?;
                info!(iteration = record.iteration, run_id = %handle.run_id, "Cancelled run");
                Ok(true)
            }
            _ => {
                info!(iteration = record.iteration, stage = %record.resume_point, "No run in flight");
                Ok(false)
            }
        }
    }

    pub fn status(&self) -> Result<CalibStatus> {
        let calib = self.store.load_calibration()?;
        let resume_point = if self.store.has_iteration(calib.iteration) {
            Some(self.store.load_iteration(calib.iteration)?.resume_point)
        } else {
            None
        };
        let best_total = calib
            .summary
            .optional_floats(TOTAL)
            .ok()
            .and_then(|totals| totals.first().copied().flatten());

        Ok(CalibStatus {
            name: calib.name.clone(),
            location: calib.location,
            iteration: calib.iteration,
            resume_point,
            finished: calib.is_finished(),
            converged: calib.converged,
            scored: calib.summary.len(),
            best_total,
        })
    }

    // ═══════════════════════════════════════════════════════════════════
    // ITERATION LOOP
    // ═══════════════════════════════════════════════════════════════════

    async fn drive(
        &mut self,
        calib: &mut CalibrationRecord,
        record: &mut IterationRecord,
    ) -> Result<CalibrationOutcome> {
        loop {
            debug!(iteration = record.iteration, stage = %record.resume_point, "Entering stage");
            match record.resume_point {
                ResumePoint::IterationStart => {
                    record.advance()?;
                    self.store.save_iteration(record)?;
                }
                ResumePoint::Commission => self.commission(calib, record).await?,
                ResumePoint::Analyze => self.analyze(calib, record).await?,
                ResumePoint::Plot => self.plot(calib, record)?,
                ResumePoint::NextPoint => {
                    if let Some(outcome) = self.next_point(calib, record)? {
                        return Ok(outcome);
                    }
                }
            }
        }
    }

    async fn commission(
        &mut self,
        calib: &CalibrationRecord,
        record: &mut IterationRecord,
    ) -> Result<()> {
        let k = record.iteration;
        let batch = match &record.samples {
            Some(table) => SampleBatch::from_table(k, &calib.param_names, table)?,
            None => {
                let batch = if k == 0 {
                    self.algorithm.initial_samples()?
                } else {
                    self.algorithm.next_samples(k)?
                };
                record.samples = Some(batch.to_table());
                record.algorithm_state = Some(self.algorithm.export_state());
                self.store.save_iteration(record)?;
                info!(iteration = k, samples = batch.len(), "Drew samples");
                batch
            }
        };

        match &record.simulation_link {
            Some(handle) => {
                info!(iteration = k, run_id = %handle.run_id, "Run already commissioned");
            }
            None => {
                let handle = self.backend.commission(&batch).await?;
                info!(
                    iteration = k,
                    run_id = %handle.run_id,
                    samples = handle.n_samples,
                    location = %handle.location,
                    "Commissioned run"
                );
                record.simulation_link = Some(handle);
                self.store.save_iteration(record)?;
            }
        }

        let view = IterationView {
            iteration: k,
            stage: ResumePoint::Commission,
            calibration: calib,
            record: &*record,
            summary: &calib.summary,
        };
        self.visualize(&view);

        record.advance()?;
        self.store.save_iteration(record)
    }

    async fn analyze(
        &mut self,
        calib: &mut CalibrationRecord,
        record: &mut IterationRecord,
    ) -> Result<()> {
        let k = record.iteration;
        let samples = record.samples.clone().ok_or_else(|| {
            CalibError::InconsistentState(format!("iteration {k} reached analyze without samples"))
        })?;
        let handle = record.simulation_link.clone().ok_or_else(|| {
            CalibError::InconsistentState(format!("iteration {k} reached analyze without a run"))
        })?;
        let batch = SampleBatch::from_table(k, &calib.param_names, &samples)?;

        let progress = self.wait_for_run(&handle).await?;
        if !progress.failed.is_empty() {
            warn!(iteration = k, failed = progress.failed.len(), "Simulations failed");
            let prompt = Prompt::RestartAfterFailure {
                iteration: k,
                failed: progress.failed.clone(),
            };
            return match self.decider.decide(&prompt).await? {
                Decision::Proceed => {
                    self.store.backup_iteration(k)?;
                    record.enter(ResumePoint::Commission);
                    self.restore_algorithm(record)?;
                    self.store.save_iteration(record)
                }
                Decision::Abort => Err(CalibError::ExecutionFailed {
                    iteration: k,
                    failed: progress.failed,
                }),
            };
        }

        let scores = self.scorer.score(&handle, &batch, &calib.sites).await?;
        if scores.len() != batch.len() {
            return Err(CalibError::Scoring(format!(
                "iteration {k}: {} scores for {} samples",
                scores.len(),
                batch.len()
            )));
        }
        self.algorithm.record_results(k, &scores.totals)?;

        let results = scores.to_table()?;
        calib.merge_results(k, &samples, &results)?;
        record.set_results(results, scores.artifacts)?;
        record.advance()?;

        self.store.save_calibration(calib)?;
        self.store.save_summary(&calib.summary)?;
        self.store.save_iteration(record)?;

        let best = scores.totals.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        info!(iteration = k, samples = batch.len(), best_total = best, "Analyzed iteration");
        Ok(())
    }

    fn plot(&self, calib: &CalibrationRecord, record: &mut IterationRecord) -> Result<()> {
        let view = IterationView {
            iteration: record.iteration,
            stage: ResumePoint::Plot,
            calibration: calib,
            record: &*record,
            summary: &calib.summary,
        };
        self.visualize(&view);

        record.advance()?;
        self.store.save_iteration(record)
    }

    /// Stop, or hand over to a fresh record for the next iteration.
    fn next_point(
        &mut self,
        calib: &mut CalibrationRecord,
        record: &mut IterationRecord,
    ) -> Result<Option<CalibrationOutcome>> {
        let k = record.iteration;
        let converged = self.algorithm.has_converged();
        let exhausted = k + 1 >= self.config.calibration.max_iterations;

        if converged || exhausted {
            let final_samples = self.algorithm.final_samples()?;
            calib.final_samples = Some(final_samples.clone());
            calib.converged = converged;
            calib.touch();
            self.store.save_calibration(calib)?;
            info!(
                iteration = k,
                converged,
                final_samples = final_samples.len(),
                "Calibration finished"
            );
            return Ok(Some(CalibrationOutcome {
                iteration: k,
                converged,
                final_samples,
            }));
        }

        let next = k + 1;
        if self.store.has_iteration(next) {
            self.store.backup_iteration(next)?;
        }
        *record = IterationRecord::new(next);
        calib.iteration = next;
        calib.touch();
        self.store.save_calibration(calib)?;
        self.store.save_iteration(record)?;
        info!(iteration = next, "Starting iteration");
        Ok(None)
    }

    // ═══════════════════════════════════════════════════════════════════
    // RESUME HELPERS
    // ═══════════════════════════════════════════════════════════════════

    /// Move `record` to `target`, restore the algorithm and trim the summary.
    fn rewind(
        &mut self,
        calib: &mut CalibrationRecord,
        record: &mut IterationRecord,
        target: ResumePoint,
    ) -> Result<()> {
        let k = record.iteration;
        if target < record.resume_point {
            self.store.backup_iteration(k)?;
            record.enter(target);
        }
        self.restore_algorithm(record)?;

        calib.iteration = k;
        let keep = if target < ResumePoint::Plot {
            k.checked_sub(1)
        } else {
            Some(k)
        };
        calib.truncate_summary(keep);
        calib.touch();

        self.store.save_iteration(record)?;
        self.store.save_calibration(calib)?;
        self.store.save_summary(&calib.summary)
    }

    /// Bring the algorithm to the state `record` expects at its stage.
    fn restore_algorithm(&mut self, record: &IterationRecord) -> Result<()> {
        let k = record.iteration;
        match record.resume_point {
            ResumePoint::IterationStart | ResumePoint::Commission => {
                if record.samples.is_some() {
                    return self.import_own_state(record);
                }
                match k.checked_sub(1) {
                    None => {
                        self.algorithm.reset();
                        Ok(())
                    }
                    Some(previous) => {
                        let previous = self.store.load_iteration(previous)?;
                        self.import_own_state(&previous)?;
                        self.replay_results(&previous)
                    }
                }
            }
            ResumePoint::Analyze => self.import_own_state(record),
            ResumePoint::Plot | ResumePoint::NextPoint => {
                self.import_own_state(record)?;
                self.replay_results(record)
            }
        }
    }

    fn import_own_state(&mut self, record: &IterationRecord) -> Result<()> {
        let state = record.algorithm_state.as_ref().ok_or_else(|| {
            CalibError::InconsistentState(format!(
                "iteration {} has no algorithm state",
                record.iteration
            ))
        })?;
        self.algorithm.import_state(state, record.iteration)?;
        debug!(iteration = record.iteration, algorithm = state.kind(), "Imported algorithm state");
        Ok(())
    }

    fn replay_results(&mut self, record: &IterationRecord) -> Result<()> {
        let results = record
            .results
            .as_ref()
            .filter(|r| !r.is_empty())
            .ok_or_else(|| {
                CalibError::InconsistentState(format!(
                    "iteration {} has no results to replay",
                    record.iteration
                ))
            })?;
        let totals = results.floats(TOTAL)?;
        self.algorithm.record_results(record.iteration, &totals)
    }

    fn pick_iteration(&self, calib: &CalibrationRecord, requested: Option<u32>) -> u32 {
        match requested {
            Some(k) if k > calib.iteration => {
                warn!(requested = k, latest = calib.iteration, "Iteration not reached; using latest");
                calib.iteration
            }
            Some(k) => k,
            None => calib.iteration,
        }
    }

    fn load_or_new(&self, iteration: u32) -> Result<IterationRecord> {
        if self.store.has_iteration(iteration) {
            self.store.load_iteration(iteration)
        } else {
            Ok(IterationRecord::new(iteration))
        }
    }

    fn check_compatible(&self, calib: &CalibrationRecord) -> Result<()> {
        if calib.param_names != self.algorithm.param_names() {
            return Err(CalibError::InconsistentState(format!(
                "calibration was started with parameters {:?}, config has {:?}",
                calib.param_names,
                self.algorithm.param_names()
            )));
        }
        if calib.algorithm != self.algorithm.name() {
            return Err(CalibError::InconsistentState(format!(
                "calibration was started with algorithm {}, config has {}",
                calib.algorithm,
                self.algorithm.name()
            )));
        }
        Ok(())
    }

    // ═══════════════════════════════════════════════════════════════════
    // COLLABORATORS
    // ═══════════════════════════════════════════════════════════════════

    /// Poll the backend until no simulation is pending.
    async fn wait_for_run(&self, handle: &RunHandle) -> Result<RunProgress> {
        let pb = ProgressBar::new(handle.n_samples as u64);
        if let Ok(style) = ProgressStyle::default_bar()
            .template("[{elapsed_precise}] {bar:40.cyan/blue} {pos}/{len} ({percent}%) {msg}")
        {
            pb.set_style(style.progress_chars("##-"));
        }

        loop {
            let statuses = self.backend.poll(handle).await?;
            if statuses.len() != handle.n_samples {
                pb.abandon();
                return Err(CalibError::Backend(format!(
                    "run {} reported {} statuses for {} samples",
                    handle.run_id,
                    statuses.len(),
                    handle.n_samples
                )));
            }
            let progress = RunProgress::from_statuses(&statuses);
            pb.set_position((progress.succeeded + progress.failed.len()) as u64);
            pb.set_message(format!("failed: {}", progress.failed.len()));

            if progress.is_finished() {
                pb.finish_and_clear();
                debug!(
                    run_id = %handle.run_id,
                    succeeded = progress.succeeded,
                    failed = progress.failed.len(),
                    "Run finished"
                );
                return Ok(progress);
            }
            if self.cancel.is_cancelled() {
                pb.abandon();
                info!(run_id = %handle.run_id, "Wait cancelled; state saved for resume");
                return Err(CalibError::Cancelled);
            }

            tokio::select! {
                _ = tokio::time::sleep(self.poll_interval) => {}
                _ = self.cancel.cancelled() => {}
            }
        }
    }

    fn visualize(&self, view: &IterationView<'_>) {
        for plotter in &self.plotters {
            if let Err(e) = plotter.visualize(view) {
                warn!(plotter = plotter.name(), iteration = view.iteration, error = %e, "Plotter failed");
            }
        }
    }
}

fn finished_outcome(calib: &CalibrationRecord) -> Option<CalibrationOutcome> {
    calib.final_samples.clone().map(|final_samples| CalibrationOutcome {
        iteration: calib.iteration,
        converged: calib.converged,
        final_samples,
    })
}
