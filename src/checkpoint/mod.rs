//! Checkpointing for resumable calibrations.
//!
//! Provides:
//! - `ResumePoint`, `IterationRecord`: per-iteration stage and artifacts
//! - `CalibrationRecord`: calibration metadata and the cumulative summary
//! - `CalibStore`: atomic persistence of both

mod calibration;
mod state;
mod store;

pub use calibration::*;
pub use state::*;
pub use store::*;
