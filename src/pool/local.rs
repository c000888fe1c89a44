//! Local process pool.
//!
//! Epistemic foundation:
//! - K_i: One shell job per sample and site, in `<run>/<site>/<sample_index>/`
//! - K_i: A job is finished iff its `exit_code` marker exists
//! - B_i: Jobs may fail → non-zero exit code → Failed
//! - I^B: Jobs of a run this process did not start cannot be watched → Failed

use super::{ExecutionBackend, Location, RunHandle, SimStatus};
use crate::models::{expand_with, BackendConfig, CalibError, Result, SampleBatch};
use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::process::Command;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Marker file holding a finished job's exit code.
pub const EXIT_CODE_FILE: &str = "exit_code";

/// Jobs spawned for one run.
struct RunJobs {
    handles: Vec<JoinHandle<()>>,
    cancelled: AtomicBool,
}

/// Runs the configured command template as local processes.
pub struct LocalPool {
    /// Command template with `${...}` placeholders
    command: String,
    /// Site names; one job per site and sample
    sites: Vec<String>,
    /// Parent directory of run directories
    run_dir: PathBuf,
    /// Semaphore for concurrency control
    semaphore: Arc<Semaphore>,
    /// Runs started by this process
    runs: DashMap<Uuid, RunJobs>,
}

impl LocalPool {
    /// Create a new local pool.
    pub fn new(config: &BackendConfig, sites: Vec<String>, run_dir: PathBuf) -> Result<Self> {
        if config.command.trim().is_empty() {
            return Err(CalibError::InvalidSettings(
                "backend.command is required for local execution".to_string(),
            ));
        }
        if sites.is_empty() {
            return Err(CalibError::InvalidSettings(
                "local execution needs at least one site".to_string(),
            ));
        }
        Ok(Self {
            command: config.command.clone(),
            sites,
            run_dir,
            semaphore: Arc::new(Semaphore::new(config.max_parallel.max(1))),
            runs: DashMap::new(),
        })
    }

    /// Output directory of one job.
    pub fn job_dir(output_dir: &Path, site: &str, sample_index: usize) -> PathBuf {
        output_dir.join(site).join(sample_index.to_string())
    }

    /// Expand the command template for one job.
    ///
    /// Sample values and job fields take precedence over environment variables.
    fn render(&self, batch: &SampleBatch, sample_index: usize, site: &str, dir: &Path) -> String {
        let mut vars: HashMap<&str, String> = batch
            .named_values(sample_index)
            .into_iter()
            .map(|(name, value)| (name, value.to_string()))
            .collect();
        vars.insert("site", site.to_string());
        vars.insert("sample_index", sample_index.to_string());
        vars.insert("iteration", batch.iteration.to_string());
        vars.insert("output_dir", dir.display().to_string());

        expand_with(&self.command, |name| {
            vars.get(name).cloned().or_else(|| std::env::var(name).ok())
        })
    }

    fn output_dir(handle: &RunHandle) -> Result<&Path> {
        handle.output_dir.as_deref().ok_or_else(|| {
            CalibError::Backend(format!("run {} has no output directory", handle.run_id))
        })
    }
}

/// Run one job to completion and write its exit-code marker.
async fn run_job(command: String, dir: PathBuf, semaphore: Arc<Semaphore>) -> Result<i32> {
    let _permit = semaphore
        .acquire_owned()
        .await
        .map_err(|_| CalibError::Internal("Semaphore closed".to_string()))?;

    let stdout = fs::File::create(dir.join("stdout.txt"))
        .map_err(|e| CalibError::io("creating job stdout", e))?;
    let stderr = fs::File::create(dir.join("stderr.txt"))
        .map_err(|e| CalibError::io("creating job stderr", e))?;

    debug!(dir = %dir.display(), command = %command, "Starting job");
    let status = Command::new("sh")
        .arg("-c")
        .arg(&command)
        .current_dir(&dir)
        .stdin(Stdio::null())
        .stdout(Stdio::from(stdout))
        .stderr(Stdio::from(stderr))
        .kill_on_drop(true)
        .status()
        .await
        .map_err(|e| CalibError::io("running job", e))?;

    // Killed by a signal: no exit code
    let code = status.code().unwrap_or(-1);
    let tmp = dir.join(format!("{EXIT_CODE_FILE}.tmp"));
    fs::write(&tmp, code.to_string()).map_err(|e| CalibError::io("writing exit code", e))?;
    fs::rename(&tmp, dir.join(EXIT_CODE_FILE))
        .map_err(|e| CalibError::io("renaming exit code", e))?;
    Ok(code)
}

/// Exit code recorded in a job directory, if the job finished.
fn read_exit_code(dir: &Path) -> Option<i32> {
    fs::read_to_string(dir.join(EXIT_CODE_FILE))
        .ok()
        .and_then(|s| s.trim().parse().ok())
}

#[async_trait]
impl ExecutionBackend for LocalPool {
    fn location(&self) -> Location {
        Location::Local
    }

    async fn commission(&self, batch: &SampleBatch) -> Result<RunHandle> {
        let mut handle = RunHandle::new(batch.iteration, batch.len(), Location::Local, None);
        let output_dir = self.run_dir.join(handle.run_id.to_string());
        handle.output_dir = Some(output_dir.clone());

        let mut handles = Vec::with_capacity(batch.len() * self.sites.len());
        for sample in &batch.samples {
            for site in &self.sites {
                let dir = Self::job_dir(&output_dir, site, sample.sample_index);
                fs::create_dir_all(&dir).map_err(|e| CalibError::io("creating job dir", e))?;
                let command = self.render(batch, sample.sample_index, site, &dir);
                let semaphore = Arc::clone(&self.semaphore);
                let site = site.clone();
                let sample_index = sample.sample_index;

                handles.push(tokio::spawn(async move {
                    match run_job(command, dir, semaphore).await {
                        Ok(0) => {}
                        Ok(code) => warn!(site = %site, sample_index, code, "Job exited with failure"),
                        Err(e) => warn!(site = %site, sample_index, error = %e, "Job could not run"),
                    }
                }));
            }
        }

        info!(
            run_id = %handle.run_id,
            iteration = batch.iteration,
            jobs = handles.len(),
            "Commissioned local run"
        );
        self.runs.insert(
            handle.run_id,
            RunJobs {
                handles,
                cancelled: AtomicBool::new(false),
            },
        );
        Ok(handle)
    }

    async fn poll(&self, handle: &RunHandle) -> Result<Vec<SimStatus>> {
        let output_dir = Self::output_dir(handle)?;
        let jobs = self.runs.get(&handle.run_id);
        let cancelled = jobs
            .as_ref()
            .is_some_and(|j| j.cancelled.load(Ordering::Relaxed));

        let mut statuses = Vec::with_capacity(handle.n_samples);
        for sample_index in 0..handle.n_samples {
            let mut status = SimStatus::Succeeded;
            for (site_pos, site) in self.sites.iter().enumerate() {
                let job = match read_exit_code(&Self::job_dir(output_dir, site, sample_index)) {
                    Some(0) => SimStatus::Succeeded,
                    Some(_) => SimStatus::Failed,
                    None => {
                        // A job this process never spawned cannot finish.
                        let task_done = jobs.as_ref().map_or(true, |j| {
                            j.handles
                                .get(sample_index * self.sites.len() + site_pos)
                                .map_or(true, JoinHandle::is_finished)
                        });
                        if cancelled || task_done {
                            SimStatus::Failed
                        } else {
                            SimStatus::Pending
                        }
                    }
                };
                status = match (status, job) {
                    (SimStatus::Failed, _) | (_, SimStatus::Failed) => SimStatus::Failed,
                    (SimStatus::Pending, _) | (_, SimStatus::Pending) => SimStatus::Pending,
                    _ => SimStatus::Succeeded,
                };
            }
            statuses.push(status);
        }
        Ok(statuses)
    }

    async fn cancel(&self, handle: &RunHandle) -> Result<()> {
        match self.runs.get(&handle.run_id) {
            Some(jobs) => {
                jobs.cancelled.store(true, Ordering::Relaxed);
                for task in &jobs.handles {
                    task.abort();
                }
                info!(run_id = %handle.run_id, "Cancelled local run");
            }
            None => warn!(run_id = %handle.run_id, "Run was not started by this process"),
        }
        Ok(())
    }

    async fn purge(&self, handle: &RunHandle) -> Result<()> {
        if let Some((_, jobs)) = self.runs.remove(&handle.run_id) {
            for task in &jobs.handles {
                task.abort();
            }
        }
        if let Some(dir) = &handle.output_dir {
            if dir.exists() {
                fs::remove_dir_all(dir).map_err(|e| CalibError::io("purging run dir", e))?;
                debug!(dir = %dir.display(), "Purged run outputs");
            }
        }
        Ok(())
    }
}
