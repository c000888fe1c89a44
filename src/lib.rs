//! calibrix - Resumable multi-iteration calibration of stochastic simulation models.
//!
//! ## Architecture
//!
//! Each iteration of a calibration moves through fixed stages:
//! - **Commission**: the sampling algorithm proposes parameter samples and the
//!   execution backend starts one simulation per sample
//! - **Analyze**: once the run finishes, the scoring provider turns outputs
//!   into one log-likelihood per sample, fed back into the algorithm
//! - **Plot**: plotters observe the cumulative summary
//! - **Next point**: stop on convergence, or open the next iteration
//!
//! Every stage persists its outputs before advancing, so a calibration can be
//! resumed from any stage of any iteration.
//!
//! ## Sampling
//!
//! - **IMIS**: incremental mixture importance sampling; each iteration adds a
//!   Gaussian kernel around the highest-weight sample
//! - **Prior sampling**: every batch from the prior; never converges
//!
//! ## Epistemic Design
//!
//! - K_i (Knowledge): Compile-time enforced invariants (types, enums)
//! - B_i (Beliefs): Runtime fallible operations (Result, Option)
//! - I^R (Resolvable): User-configurable parameters
//! - I^B (Bounded): Simulation failures, operator decisions

pub mod checkpoint;
pub mod models;
pub mod pipeline;
pub mod pool;
pub mod sampling;

// Re-exports for convenience
pub use checkpoint::{CalibStore, CalibrationRecord, IterationRecord, ResumePoint};
pub use models::{
    CalibConfig, CalibError, ConfigError, FinalSamples, Result, SampleBatch, SampleTable,
    EXAMPLE_CONFIG,
};
pub use pipeline::{
    AlwaysAbort, AlwaysProceed, CalibManager, CalibStatus, CalibrationOutcome, CancellationToken,
    Collaborators, Decider, Decision, IterationView, Plotter, Prompt, StdinDecider, SummaryLogger,
};
pub use pool::{
    ExecutionBackend, FileScorer, LocalPool, Location, RunHandle, ScoreSet, ScoringProvider,
    SimStatus,
};
pub use sampling::{
    AlgorithmSettings, AlgorithmState, Imis, ImisSettings, PriorDistribution, PriorSampling,
    SamplingAlgorithm,
};
