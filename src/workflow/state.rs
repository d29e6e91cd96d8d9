//! Run State
//!
//! Tracks the status of a single run (`Pending -> Running -> Completed |
//! Failed`) together with its timestamps. The state is serializable so it
//! can be printed as JSON at the end of a run; it is never persisted.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Lifecycle of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Error, PartialEq)]
#[error("cannot move run from {from} to {to}")]
pub struct StateError {
    pub from: RunStatus,
    pub to: RunStatus,
}

/// Status record of one run.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct RunState {
    /// Identifier derived from the creation time
    pub run_id: String,

    pub flow_name: String,

    pub status: RunStatus,

    pub created_at: DateTime<Utc>,

    pub started_at: Option<DateTime<Utc>>,

    pub finished_at: Option<DateTime<Utc>>,

    /// Tasks that finished successfully
    pub completed_tasks: usize,

    /// Step whose failure ended the run
    pub failed_step: Option<String>,
}

impl RunState {
    /// Creates a pending state for `flow_name`.
    pub fn new(flow_name: &str) -> Self {
        let created_at = Utc::now();
        Self {
            run_id: created_at.format("%Y%m%d-%H%M%S%.3f").to_string(),
            flow_name: flow_name.to_string(),
            status: RunStatus::Pending,
            created_at,
            started_at: None,
            finished_at: None,
            completed_tasks: 0,
            failed_step: None,
        }
    }

    fn transition(&mut self, to: RunStatus) -> Result<(), StateError> {
        let allowed = matches!(
            (self.status, to),
            (RunStatus::Pending, RunStatus::Running)
                | (RunStatus::Running, RunStatus::Completed)
                | (RunStatus::Running, RunStatus::Failed)
        );
        if !allowed {
            return Err(StateError { from: self.status, to });
        }
        self.status = to;
        Ok(())
    }

    /// Marks the run as started.
    pub fn start(&mut self) -> Result<(), StateError> {
        self.transition(RunStatus::Running)?;
        self.started_at = Some(Utc::now());
        Ok(())
    }

    pub fn mark_task_completed(&mut self) {
        self.completed_tasks += 1;
    }

    /// Marks the run as completed successfully.
    pub fn complete(&mut self) -> Result<(), StateError> {
        self.transition(RunStatus::Completed)?;
        self.finished_at = Some(Utc::now());
        Ok(())
    }

    /// Marks the run as failed at `step`.
    pub fn fail(&mut self, step: &str) -> Result<(), StateError> {
        self.transition(RunStatus::Failed)?;
        self.failed_step = Some(step.to_string());
        self.finished_at = Some(Utc::now());
        Ok(())
    }

    /// Wall-clock duration of a finished run.
    pub fn duration(&self) -> Option<chrono::Duration> {
        Some(self.finished_at? - self.started_at?)
    }
}
