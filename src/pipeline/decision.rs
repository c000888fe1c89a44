//! Operator confirmations.
//!
//! The driver never exits the process on its own: every point where a human
//! would be asked goes through a `Decider`.

use crate::checkpoint::ResumePoint;
use crate::models::{CalibError, Result};
use crate::pool::Location;
use async_trait::async_trait;
use std::fmt;
use std::io::{self, BufRead, Write};
use tracing::info;

/// A question put to the operator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Prompt {
    /// A calibration with this name already exists on disk
    OverwriteExisting { name: String },
    /// The requested resume point is farther than the record reached
    ResumeFallback {
        iteration: u32,
        requested: ResumePoint,
        available: ResumePoint,
    },
    /// Stored runs were executed elsewhere
    LocationChanged { previous: Location, current: Location },
    /// Some simulations of the iteration failed
    RestartAfterFailure { iteration: u32, failed: Vec<usize> },
}

impl fmt::Display for Prompt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OverwriteExisting { name } => {
                write!(f, "Calibration '{name}' already exists. Delete it and start over?")
            }
            Self::ResumeFallback {
                iteration,
                requested,
                available,
            } => write!(
                f,
                "Iteration {iteration} only reached {available}, not {requested}. Resume from {available} instead?"
            ),
            Self::LocationChanged { previous, current } => write!(
                f,
                "Simulations ran on {previous} but the backend is now {current}. Restart the iteration from commission?"
            ),
            Self::RestartAfterFailure { iteration, failed } => write!(
                f,
                "{} simulation(s) of iteration {iteration} failed. Re-commission the iteration?",
                failed.len()
            ),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Proceed,
    Abort,
}

/// Answers operator prompts.
#[async_trait]
pub trait Decider: Send + Sync {
    async fn decide(&self, prompt: &Prompt) -> Result<Decision>;
}

/// Says yes to everything.
pub struct AlwaysProceed;

#[async_trait]
impl Decider for AlwaysProceed {
    async fn decide(&self, _prompt: &Prompt) -> Result<Decision> {
        Ok(Decision::Proceed)
    }
}

/// Says no to everything.
pub struct AlwaysAbort;

#[async_trait]
impl Decider for AlwaysAbort {
    async fn decide(&self, _prompt: &Prompt) -> Result<Decision> {
        Ok(Decision::Abort)
    }
}

/// Asks on the terminal; `assume_yes` answers every prompt with yes.
pub struct StdinDecider {
    assume_yes: bool,
}

impl StdinDecider {
    pub fn new(assume_yes: bool) -> Self {
        Self { assume_yes }
    }
}

#[async_trait]
impl Decider for StdinDecider {
    async fn decide(&self, prompt: &Prompt) -> Result<Decision> {
        if self.assume_yes {
            info!(prompt = %prompt, "Proceeding without confirmation");
            return Ok(Decision::Proceed);
        }

        let question = prompt.to_string();
        let answer = tokio::task::spawn_blocking(move || -> io::Result<String> {
            let mut stderr = io::stderr();
            write!(stderr, "{question} [y/N]: ")?;
            stderr.flush()?;
            let mut line = String::new();
            io::stdin().lock().read_line(&mut line)?;
            Ok(line)
        })
        .await
        .map_err(|e| CalibError::Internal(format!("prompt task failed: {e}")))?
        .map_err(|e| CalibError::io("reading confirmation", e))?;

        Ok(parse_answer(&answer))
    }
}

fn parse_answer(answer: &str) -> Decision {
    match answer.trim().to_ascii_lowercase().as_str() {
        "y" | "yes" => Decision::Proceed,
        _ => Decision::Abort,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_answer() {
        assert_eq!(parse_answer("y\n"), Decision::Proceed);
        assert_eq!(parse_answer(" YES "), Decision::Proceed);
        assert_eq!(parse_answer("\n"), Decision::Abort);
        assert_eq!(parse_answer("nope"), Decision::Abort);
    }

    #[test]
    fn test_prompt_text_names_the_stages() {
        let prompt = Prompt::ResumeFallback {
            iteration: 2,
            requested: ResumePoint::Plot,
            available: ResumePoint::Commission,
        };
        let text = prompt.to_string();
        assert!(text.contains("iteration 2") || text.contains("Iteration 2"));
        assert!(text.contains("commission"));
        assert!(text.contains("plot"));
    }

    #[tokio::test]
    async fn test_assume_yes_never_reads_stdin() {
        let decider = StdinDecider::new(true);
        let prompt = Prompt::OverwriteExisting {
            name: "c".to_string(),
        };
        assert_eq!(decider.decide(&prompt).await.unwrap(), Decision::Proceed);
        assert_eq!(AlwaysAbort.decide(&prompt).await.unwrap(), Decision::Abort);
    }
}
