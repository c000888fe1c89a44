//! On-disk layout of a calibration.
//!
//! Epistemic foundation:
//! - K_i: Every record is written atomically (write temp, then rename)
//! - K_i: Layout is `<root>/<name>/CalibManager.json`, `iter<k>/IterationState.json`
//! - B_i: Files on disk may be absent, truncated or from another version → Result

use super::{CalibrationRecord, IterationRecord};
use crate::models::{CalibError, Result, SampleTable};
use chrono::Utc;
use serde::{de::DeserializeOwned, Serialize};
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Calibration metadata file name.
pub const CALIBRATION_FILE: &str = "CalibManager.json";
/// Per-iteration state file name.
pub const ITERATION_FILE: &str = "IterationState.json";
/// Human-readable summary, rewritten after every analysis.
pub const SUMMARY_FILE: &str = "summary.json";

/// Reads and writes calibration and iteration records under one directory.
#[derive(Debug, Clone)]
pub struct CalibStore {
    dir: PathBuf,
}

impl CalibStore {
    pub fn new(root: &Path, name: &str) -> Self {
        Self {
            dir: root.join(name),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Whether calibration metadata exists on disk.
    pub fn exists(&self) -> bool {
        self.calibration_path().exists()
    }

    pub fn create(&self) -> Result<()> {
        fs::create_dir_all(&self.dir)
            .map_err(|e| CalibError::io(format!("creating {}", self.dir.display()), e))
    }

    pub fn calibration_path(&self) -> PathBuf {
        self.dir.join(CALIBRATION_FILE)
    }

    pub fn iteration_dir(&self, iteration: u32) -> PathBuf {
        self.dir.join(format!("iter{iteration}"))
    }

    pub fn iteration_path(&self, iteration: u32) -> PathBuf {
        self.iteration_dir(iteration).join(ITERATION_FILE)
    }

    pub fn summary_path(&self) -> PathBuf {
        self.dir.join(SUMMARY_FILE)
    }

    pub fn load_calibration(&self) -> Result<CalibrationRecord> {
        let path = self.calibration_path();
        if !path.exists() {
            return Err(CalibError::MissingMetadata { path });
        }
        let record: CalibrationRecord = read_json(&path)?;
        record.validate()?;
        Ok(record)
    }

    pub fn save_calibration(&self, record: &CalibrationRecord) -> Result<()> {
        write_json(&self.calibration_path(), record)?;
        debug!(iteration = record.iteration, "Calibration record saved");
        Ok(())
    }

    pub fn has_iteration(&self, iteration: u32) -> bool {
        self.iteration_path(iteration).exists()
    }

    pub fn load_iteration(&self, iteration: u32) -> Result<IterationRecord> {
        let path = self.iteration_path(iteration);
        if !path.exists() {
            return Err(CalibError::MissingMetadata { path });
        }
        let record: IterationRecord = read_json(&path)?;
        record.validate()?;
        if record.iteration != iteration {
            return Err(CalibError::InconsistentState(format!(
                "{} holds iteration {}",
                path.display(),
                record.iteration
            )));
        }
        Ok(record)
    }

    pub fn save_iteration(&self, record: &IterationRecord) -> Result<()> {
        let dir = self.iteration_dir(record.iteration);
        fs::create_dir_all(&dir)
            .map_err(|e| CalibError::io(format!("creating {}", dir.display()), e))?;
        write_json(&self.iteration_path(record.iteration), record)?;
        debug!(
            iteration = record.iteration,
            resume_point = %record.resume_point,
            "Iteration record saved"
        );
        Ok(())
    }

    /// Copy an iteration record aside before it is rewound.
    ///
    /// Returns the backup path, or `None` if there was nothing to back up.
    pub fn backup_iteration(&self, iteration: u32) -> Result<Option<PathBuf>> {
        let path = self.iteration_path(iteration);
        if !path.exists() {
            return Ok(None);
        }
        let stamp = Utc::now().format("%Y%m%d_%H%M%S_%6f");
        let backup = self
            .iteration_dir(iteration)
            .join(format!("IterationState_backup_{stamp}.json"));
        fs::copy(&path, &backup)
            .map_err(|e| CalibError::io(format!("backing up {}", path.display()), e))?;
        info!(iteration, backup = %backup.display(), "Backed up iteration state");
        Ok(Some(backup))
    }

    /// Backups of one iteration, oldest first.
    pub fn list_backups(&self, iteration: u32) -> Result<Vec<PathBuf>> {
        let pattern = self
            .iteration_dir(iteration)
            .join("IterationState_backup_*.json");
        glob_sorted(&pattern)
    }

    /// Iterations with a record on disk, ascending.
    pub fn list_iterations(&self) -> Result<Vec<u32>> {
        let pattern = self.dir.join("iter*").join(ITERATION_FILE);
        let mut iterations: Vec<u32> = glob_sorted(&pattern)?
            .iter()
            .filter_map(|path| {
                path.parent()?
                    .file_name()?
                    .to_str()?
                    .strip_prefix("iter")?
                    .parse()
                    .ok()
            })
            .collect();
        iterations.sort_unstable();
        Ok(iterations)
    }

    pub fn save_summary(&self, summary: &SampleTable) -> Result<()> {
        write_json(&self.summary_path(), summary)
    }

    /// Delete the whole calibration directory.
    pub fn remove(&self) -> Result<()> {
        if self.dir.exists() {
            fs::remove_dir_all(&self.dir)
                .map_err(|e| CalibError::io(format!("removing {}", self.dir.display()), e))?;
            info!(dir = %self.dir.display(), "Removed calibration directory");
        }
        Ok(())
    }
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let file = File::open(path)
        .map_err(|e| CalibError::io(format!("opening {}", path.display()), e))?;
    serde_json::from_reader(BufReader::new(file))
        .map_err(|e| CalibError::ParseError(format!("Invalid {}: {e}", path.display())))
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let temp_path = path.with_extension("tmp.json");
    {
        let file = File::create(&temp_path)
            .map_err(|e| CalibError::io(format!("creating {}", temp_path.display()), e))?;
        let mut writer = BufWriter::new(file);
        serde_json::to_writer_pretty(&mut writer, value)
            .map_err(|e| CalibError::Internal(format!("Serializing {}: {e}", path.display())))?;
        writer
            .flush()
            .map_err(|e| CalibError::io(format!("flushing {}", temp_path.display()), e))?;
    }
    fs::rename(&temp_path, path)
        .map_err(|e| CalibError::io(format!("renaming {}", temp_path.display()), e))
}

fn glob_sorted(pattern: &Path) -> Result<Vec<PathBuf>> {
    let pattern = pattern.to_string_lossy();
    let mut paths: Vec<PathBuf> = glob::glob(&pattern)
        .map_err(|e| CalibError::Internal(format!("bad glob pattern {pattern}: {e}")))?
        .filter_map(|entry| entry.ok())
        .collect();
    paths.sort();
    Ok(paths)
}
