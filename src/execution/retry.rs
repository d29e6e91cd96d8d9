//! Retry Policy
//!
//! Wraps step execution with a bounded number of attempts and a constant
//! backoff between them. Every attempt starts from the same input snapshot.

use std::thread;
use std::time::Duration;

use log::{info, warn};

use crate::artifacts::Snapshot;
use crate::error::{Failure, FlowError};
use crate::workflow::StepDefinition;

use super::step::execute_step;
use super::task::Task;

/// Attempt budget for a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first (at least 1)
    pub max_attempts: u32,
    /// Constant wait between attempts
    pub backoff: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, backoff: Duration) -> Self {
        Self {
            max_attempts,
            backoff,
        }
    }

    /// A policy that never retries.
    pub fn once() -> Self {
        Self::new(1, Duration::ZERO)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::once()
    }
}

/// Successful outcome of a retried step.
#[derive(Debug, Clone)]
pub struct StepRun {
    pub snapshot: Snapshot,
    /// Attempts used, including the successful one
    pub attempts: u32,
}

/// Runs `step` for `task`, re-attempting retryable failures per `policy`.
///
/// Sleeps only the calling thread between attempts. Non-retryable errors
/// (unresolved conflicts) end the loop immediately.
pub fn run_with_retry(step: &StepDefinition, task: &Task, policy: RetryPolicy) -> Result<StepRun, Failure> {
    run_with_retry_notify(step, task, policy, |_, _| {})
}

/// Same as [`run_with_retry`], calling `on_retry(failed_attempt, error)`
/// before each backoff wait.
pub fn run_with_retry_notify<F>(
    step: &StepDefinition,
    task: &Task,
    policy: RetryPolicy,
    mut on_retry: F,
) -> Result<StepRun, Failure>
where
    F: FnMut(u32, &FlowError),
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0;

    loop {
        attempt += 1;

        match execute_step(step, task, attempt) {
            Ok(snapshot) => {
                if attempt > 1 {
                    info!("Task {} succeeded on attempt {}/{}", task, attempt, max_attempts);
                }
                return Ok(StepRun {
                    snapshot,
                    attempts: attempt,
                });
            }
            Err(e) if e.is_retryable() && attempt < max_attempts => {
                warn!(
                    "Task {} attempt {}/{} failed, retrying in {:?}: {}",
                    task, attempt, max_attempts, policy.backoff, e
                );
                on_retry(attempt, &e);
                if !policy.backoff.is_zero() {
                    thread::sleep(policy.backoff);
                }
            }
            Err(e) => {
                return Err(Failure::new(&step.name, task.foreach_index(), attempt, e));
            }
        }
    }
}
