//! Runtime Tasks
//!
//! A task is one execution of a step. Besides its artifact snapshot it
//! carries the stack of splits it was created under, so joins can group
//! siblings without inferring structure from the graph at run time.

use std::fmt;

use serde_json::Value;

use crate::artifacts::{Conflicts, Snapshot};

/// Identifier of a task within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TaskId(pub u64);

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "t{}", self.0)
    }
}

/// Identifier shared by the sibling tasks of one split.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SplitId(pub u64);

impl fmt::Display for SplitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "s{}", self.0)
    }
}

/// How a split produced its siblings.
#[derive(Debug, Clone, PartialEq)]
pub enum SplitKind {
    /// One sibling per declared successor
    Branch,
    /// One sibling per element; `input` is this sibling's element
    Foreach { input: Value },
}

/// Membership of a task in one split.
#[derive(Debug, Clone, PartialEq)]
pub struct SplitFrame {
    pub id: SplitId,
    pub kind: SplitKind,
    /// Position among siblings (element index or branch position)
    pub index: usize,
    /// Number of siblings the join waits for
    pub cardinality: usize,
}

impl SplitFrame {
    pub fn is_foreach(&self) -> bool {
        matches!(self.kind, SplitKind::Foreach { .. })
    }

    /// Element this frame fans out over, for foreach frames.
    pub fn input(&self) -> Option<&Value> {
        match &self.kind {
            SplitKind::Foreach { input } => Some(input),
            SplitKind::Branch => None,
        }
    }
}

/// One predecessor's result as seen by a join step.
#[derive(Debug, Clone, PartialEq)]
pub struct JoinInput {
    /// Step that produced the result
    pub step: String,
    /// Position within the collapsed split
    pub index: usize,
    pub artifacts: Snapshot,
}

/// One execution instance of a step.
#[derive(Debug, Clone)]
pub struct Task {
    pub id: TaskId,
    pub step: String,
    pub snapshot: Snapshot,
    /// Enclosing splits, outermost first
    pub frames: Vec<SplitFrame>,
    /// Ordered predecessor results, populated for join tasks
    pub inputs: Vec<JoinInput>,
    /// Keys the join handler must resolve
    pub conflicts: Conflicts,
}

impl Task {
    pub fn new(id: TaskId, step: impl Into<String>, snapshot: Snapshot, frames: Vec<SplitFrame>) -> Self {
        Self {
            id,
            step: step.into(),
            snapshot,
            frames,
            inputs: Vec::new(),
            conflicts: Conflicts::new(),
        }
    }

    /// Position within the nearest enclosing foreach, if any.
    pub fn foreach_index(&self) -> Option<usize> {
        self.frames
            .iter()
            .rev()
            .find(|frame| frame.is_foreach())
            .map(|frame| frame.index)
    }
}

impl fmt::Display for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.foreach_index() {
            Some(index) => write!(f, "{}[{}] ({})", self.step, index, self.id),
            None => write!(f, "{} ({})", self.step, self.id),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn frame(id: u64, kind: SplitKind, index: usize) -> SplitFrame {
        SplitFrame {
            id: SplitId(id),
            kind,
            index,
            cardinality: 3,
        }
    }

    #[test]
    fn test_plain_task_has_no_index() {
        let task = Task::new(TaskId(1), "start", Snapshot::new(), Vec::new());
        assert_eq!(task.foreach_index(), None);
        assert_eq!(task.to_string(), "start (t1)");
    }

    #[test]
    fn test_foreach_index_skips_branch_frames() {
        let frames = vec![
            frame(1, SplitKind::Foreach { input: json!("x") }, 2),
            frame(2, SplitKind::Branch, 0),
        ];
        let task = Task::new(TaskId(7), "body", Snapshot::new(), frames);

        assert_eq!(task.foreach_index(), Some(2));
        assert_eq!(task.to_string(), "body[2] (t7)");
    }

    #[test]
    fn test_frame_input() {
        let foreach = frame(1, SplitKind::Foreach { input: json!(5) }, 0);
        let branch = frame(2, SplitKind::Branch, 1);

        assert_eq!(foreach.input(), Some(&json!(5)));
        assert!(foreach.is_foreach());
        assert_eq!(branch.input(), None);
    }
}
