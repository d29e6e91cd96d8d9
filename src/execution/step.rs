//! Individual Step Execution
//!
//! Runs one attempt of a step handler against a task:
//! - Builds a fresh [`StepContext`] from the task's snapshot
//! - Converts handler errors and panics into [`FlowError::StepExecution`]
//! - Checks that a join handler resolved every merge conflict

use std::collections::BTreeSet;
use std::panic::{self, AssertUnwindSafe};

use log::{debug, error};
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::artifacts::{ArtifactError, Conflicts, Snapshot, INPUT_KEY};
use crate::error::FlowError;
use crate::workflow::StepDefinition;

use super::task::{JoinInput, Task};

/// The view a handler gets of its task.
///
/// Writes go to a private copy of the task's snapshot; nothing is visible to
/// other tasks until the attempt succeeds.
#[derive(Debug)]
pub struct StepContext {
    step: String,
    attempt: u32,
    index: Option<usize>,
    artifacts: Snapshot,
    inputs: Vec<JoinInput>,
    conflicts: Conflicts,
    touched: BTreeSet<String>,
}

impl StepContext {
    pub(crate) fn new(task: &Task, attempt: u32) -> Self {
        Self {
            step: task.step.clone(),
            attempt,
            index: task.foreach_index(),
            artifacts: task.snapshot.clone(),
            inputs: task.inputs.clone(),
            conflicts: task.conflicts.clone(),
            touched: BTreeSet::new(),
        }
    }

    /// Name of the running step.
    pub fn step(&self) -> &str {
        &self.step
    }

    /// 1-based attempt number.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Position within the enclosing foreach.
    pub fn index(&self) -> Option<usize> {
        self.index
    }

    /// Element assigned by the enclosing foreach.
    pub fn input(&self) -> Option<&Value> {
        self.artifacts.get(INPUT_KEY)
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.artifacts.get(key)
    }

    /// Reads an artifact as `T`, failing if it is missing or mistyped.
    pub fn require<T: DeserializeOwned>(&self, key: &str) -> Result<T, ArtifactError> {
        self.artifacts.require(key)
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        let key = key.into();
        self.touched.insert(key.clone());
        self.artifacts.set(key, value)
    }

    /// Removes an artifact. Removing a conflicting key resolves it.
    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.touched.insert(key.to_string());
        self.artifacts.remove(key)
    }

    pub fn artifacts(&self) -> &Snapshot {
        &self.artifacts
    }

    /// Predecessor results of a join, ordered by branch or foreach index.
    pub fn inputs(&self) -> &[JoinInput] {
        &self.inputs
    }

    /// Collects artifact `key` from every join input, in order.
    pub fn collect<T: DeserializeOwned>(&self, key: &str) -> Result<Vec<T>, ArtifactError> {
        self.inputs
            .iter()
            .map(|input| input.artifacts.require(key))
            .collect()
    }

    /// Keys the predecessors of a join defined differently.
    pub fn conflicts(&self) -> &Conflicts {
        &self.conflicts
    }

    /// Conflicting keys not yet set or removed by this handler.
    pub fn unresolved(&self) -> Vec<String> {
        self.conflicts
            .keys()
            .filter(|key| !self.touched.contains(*key))
            .cloned()
            .collect()
    }

    fn into_artifacts(self) -> Snapshot {
        self.artifacts
    }
}

/// Executes a single attempt of `step` for `task`.
///
/// # Returns
///
/// * `Ok(Snapshot)` - The task's artifacts after the handler ran
/// * `Err(FlowError::StepExecution)` - The handler failed or panicked
/// * `Err(FlowError::ArtifactConflict)` - A join left conflicts unresolved
pub fn execute_step(step: &StepDefinition, task: &Task, attempt: u32) -> Result<Snapshot, FlowError> {
    let mut ctx = StepContext::new(task, attempt);
    let handler = step.handler();

    let outcome = panic::catch_unwind(AssertUnwindSafe(|| handler.run(&mut ctx)));

    match outcome {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            error!("Task {} attempt {} failed: {}", task, attempt, e);
            return Err(FlowError::StepExecution {
                step: step.name.clone(),
                message: e.to_string(),
            });
        }
        Err(payload) => {
            let message = panic_message(payload.as_ref());
            error!("Task {} attempt {} panicked: {}", task, attempt, message);
            return Err(FlowError::StepExecution {
                step: step.name.clone(),
                message: format!("panicked: {}", message),
            });
        }
    }

    let unresolved = ctx.unresolved();
    if !unresolved.is_empty() {
        return Err(FlowError::ArtifactConflict {
            step: step.name.clone(),
            keys: unresolved,
        });
    }

    debug!("Task {} attempt {} succeeded", task, attempt);
    Ok(ctx.into_artifacts())
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
