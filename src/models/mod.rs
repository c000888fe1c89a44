//! Core data models for calibrix.
//!
//! Epistemic mapping:
//! - K_i (Knowledge): Concrete types with compile-time guarantees
//! - B_i (Beliefs): Wrapped in Result/Option
//! - I^R (Resolvable): Config parameters
//! - I^B (Bounded): Error variants surfaced to the operator

mod config;
mod error;
mod sample;
mod table;

pub use config::*;
pub use error::*;
pub use sample::*;
pub use table::*;
