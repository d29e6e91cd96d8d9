//! Error Types
//!
//! Runtime error taxonomy of the engine. Graph problems are reported as
//! [`ValidationError`] before any task exists; everything else surfaces as
//! a [`FlowError`], wrapped in a [`Failure`] once it halts a run.

use std::fmt;

use thiserror::Error;

pub use crate::workflow::validator::ValidationError;

/// Errors that can halt a run.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum FlowError {
    #[error("invalid flow: {0}")]
    Validation(#[from] ValidationError),

    #[error("step '{step}' failed: {message}")]
    StepExecution { step: String, message: String },

    #[error("step '{step}': foreach source '{field}' {reason}")]
    InvalidForeachSource {
        step: String,
        field: String,
        reason: String,
    },

    #[error("join step '{step}' left conflicting artifacts unresolved: {}", .keys.join(", "))]
    ArtifactConflict { step: String, keys: Vec<String> },

    #[error("run stalled with joins still waiting: {}", .pending.join(", "))]
    Stalled { pending: Vec<String> },

    #[error("worker lost: {0}")]
    WorkerLost(String),
}

impl FlowError {
    /// Whether the retry policy may re-attempt after this error.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::StepExecution { .. })
    }
}

/// Terminal failure of a run.
#[derive(Debug, Clone, PartialEq)]
pub struct Failure {
    pub step: String,
    /// Foreach position of the failing task, if any
    pub index: Option<usize>,
    /// Attempts made before giving up
    pub attempts: u32,
    pub error: FlowError,
}

impl Failure {
    pub fn new(step: impl Into<String>, index: Option<usize>, attempts: u32, error: FlowError) -> Self {
        Self {
            step: step.into(),
            index,
            attempts,
            error,
        }
    }
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.index {
            Some(index) => write!(f, "step '{}'[{}]", self.step, index)?,
            None => write!(f, "step '{}'", self.step)?,
        }
        write!(f, " after {} attempt(s): {}", self.attempts, self.error)
    }
}

impl std::error::Error for Failure {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.error)
    }
}
