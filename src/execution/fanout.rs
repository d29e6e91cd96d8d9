//! Fan-out Controller
//!
//! Expands a finished task into sibling tasks (static branches or one child
//! per foreach element) and collapses the siblings of a split back into a
//! single join task.

use log::{debug, info};
use serde_json::Value;

use crate::artifacts::{merge, Snapshot, INPUT_KEY};
use crate::error::FlowError;

use super::task::{JoinInput, SplitFrame, SplitId, SplitKind, Task, TaskId};

/// A sibling produced by a split, not yet bound to a task id.
///
/// Siblings whose step is a join are routed straight to the join record
/// instead of becoming tasks.
#[derive(Debug, Clone)]
pub struct Child {
    pub step: String,
    pub snapshot: Snapshot,
    pub frames: Vec<SplitFrame>,
}

/// Reads `source_field` from `parent` and creates one child per element.
///
/// Each child sees all of the parent's artifacts plus `input` set to its
/// element. Fails with [`FlowError::InvalidForeachSource`] if the field is
/// missing, not a sequence, or longer than `max_fanout`.
pub fn split(
    parent: &Task,
    output: &Snapshot,
    source_field: &str,
    successor: &str,
    split_id: SplitId,
    max_fanout: usize,
) -> Result<Vec<Child>, FlowError> {
    let invalid = |reason: String| FlowError::InvalidForeachSource {
        step: parent.step.clone(),
        field: source_field.to_string(),
        reason,
    };

    let elements = match output.get(source_field) {
        None => return Err(invalid("is missing".to_string())),
        Some(Value::Array(elements)) => elements,
        Some(other) => return Err(invalid(format!("is not a sequence (found {})", type_name(other)))),
    };

    if elements.len() > max_fanout {
        return Err(invalid(format!(
            "has {} elements, more than the limit of {}",
            elements.len(),
            max_fanout
        )));
    }

    info!(
        "Task {} fans out over '{}' into {} x '{}' ({})",
        parent,
        source_field,
        elements.len(),
        successor,
        split_id
    );

    let children = elements
        .iter()
        .enumerate()
        .map(|(index, element)| {
            let mut snapshot = output.clone();
            snapshot.set(INPUT_KEY, element.clone());

            let mut frames = parent.frames.clone();
            frames.push(SplitFrame {
                id: split_id,
                kind: SplitKind::Foreach {
                    input: element.clone(),
                },
                index,
                cardinality: elements.len(),
            });

            Child {
                step: successor.to_string(),
                snapshot,
                frames,
            }
        })
        .collect();

    Ok(children)
}

/// Creates one child per declared successor of a static branch.
///
/// Children share the parent's output snapshot until one of them writes.
pub fn branch(parent: &Task, output: &Snapshot, successors: &[String], split_id: SplitId) -> Vec<Child> {
    debug!("Task {} branches into {:?} ({})", parent, successors, split_id);

    successors
        .iter()
        .enumerate()
        .map(|(index, step)| {
            let mut frames = parent.frames.clone();
            frames.push(SplitFrame {
                id: split_id,
                kind: SplitKind::Branch,
                index,
                cardinality: successors.len(),
            });

            Child {
                step: step.clone(),
                snapshot: output.clone(),
                frames,
            }
        })
        .collect()
}

/// Collapses the completed siblings of one split into a join task.
///
/// `arrivals` must be ordered by sibling index and `frames` must be the
/// siblings' frames with the closed split already removed.
pub fn collapse(
    join_step: &str,
    closed: &SplitFrame,
    frames: Vec<SplitFrame>,
    arrivals: Vec<JoinInput>,
    id: TaskId,
) -> Task {
    let inputs = arrivals;

    // each input keeps its element; only the merged view drops it
    let snapshots: Vec<Snapshot> = inputs
        .iter()
        .map(|input| {
            let mut artifacts = input.artifacts.clone();
            if closed.is_foreach() {
                artifacts.remove(INPUT_KEY);
            }
            artifacts
        })
        .collect();
    let outcome = merge(&snapshots);

    let mut snapshot = outcome.merged;
    restore_enclosing_input(&mut snapshot, &frames);

    info!(
        "Join '{}' collapses {} ({} inputs, {} conflicting keys)",
        join_step,
        closed.id,
        inputs.len(),
        outcome.conflicts.len()
    );

    let mut task = Task::new(id, join_step, snapshot, frames);
    task.inputs = inputs;
    task.conflicts = outcome.conflicts;
    task
}

/// Collapses a foreach over an empty sequence: the join receives the
/// foreach step's own snapshot and no inputs.
pub fn collapse_empty(join_step: &str, parent: &Task, output: &Snapshot, id: TaskId) -> Task {
    info!(
        "Task {} fans out over an empty sequence; '{}' runs with no inputs",
        parent, join_step
    );
    let mut snapshot = output.clone();
    restore_enclosing_input(&mut snapshot, &parent.frames);
    Task::new(id, join_step, snapshot, parent.frames.clone())
}

/// Re-exposes the element of the nearest enclosing foreach as `input`.
fn restore_enclosing_input(snapshot: &mut Snapshot, frames: &[SplitFrame]) {
    if let Some(input) = frames.iter().rev().find_map(SplitFrame::input) {
        snapshot.set(INPUT_KEY, input.clone());
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "a sequence",
        Value::Object(_) => "an object",
    }
}
