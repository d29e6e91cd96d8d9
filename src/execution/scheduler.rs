//! Task Scheduler
//!
//! Manages the ready-queue and join records of a single run:
//! - Creates the start task from the initial snapshot
//! - Advances a completed task to its successors (linear, branch, foreach)
//! - Holds join arrivals until every sibling of a split has completed
//! - Captures the end step's snapshot
//!
//! The scheduler is owned by the run loop; worker threads never touch it,
//! so enqueue and join registration are serialized by construction.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;

use log::{debug, info};

use crate::artifacts::Snapshot;
use crate::error::{FlowError, ValidationError};
use crate::workflow::validator::Topology;
use crate::workflow::Flow;

use super::fanout::{self, Child};
use super::task::{JoinInput, SplitFrame, SplitId, Task, TaskId};

/// Arrivals collected for one open split.
#[derive(Debug)]
struct JoinRecord {
    step: String,
    expected: usize,
    /// Frame of the split being closed, as seen by the first arrival
    closed: SplitFrame,
    /// Frames enclosing the split
    outer: Vec<SplitFrame>,
    arrived: BTreeMap<usize, JoinInput>,
}

/// Ready-queue and join bookkeeping for one run.
pub struct Scheduler {
    flow: Arc<Flow>,
    topology: Topology,
    max_fanout: usize,
    ready: VecDeque<Task>,
    joins: HashMap<SplitId, JoinRecord>,
    next_task: u64,
    next_split: u64,
    end: Option<Snapshot>,
}

impl Scheduler {
    /// Creates a scheduler with the start task already enqueued.
    pub fn new(flow: Arc<Flow>, topology: Topology, initial: Snapshot, max_fanout: usize) -> Self {
        let mut scheduler = Self {
            flow,
            topology,
            max_fanout,
            ready: VecDeque::new(),
            joins: HashMap::new(),
            next_task: 0,
            next_split: 0,
            end: None,
        };

        let id = scheduler.task_id();
        let start = Task::new(id, scheduler.topology.start.clone(), initial, Vec::new());
        debug!("Enqueued start task {}", start);
        scheduler.ready.push_back(start);
        scheduler
    }

    /// Pops the next ready task.
    pub fn next_ready(&mut self) -> Option<Task> {
        self.ready.pop_front()
    }

    pub fn ready_len(&self) -> usize {
        self.ready.len()
    }

    /// True once the end step has completed.
    pub fn is_finished(&self) -> bool {
        self.end.is_some()
    }

    /// Snapshot produced by the end step.
    pub fn take_end(&mut self) -> Option<Snapshot> {
        self.end.take()
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    /// Joins still waiting for siblings, as `step (arrived/expected)`.
    pub fn pending_joins(&self) -> Vec<String> {
        let mut pending: Vec<String> = self
            .joins
            .values()
            .map(|record| format!("{} ({}/{})", record.step, record.arrived.len(), record.expected))
            .collect();
        pending.sort();
        pending
    }

    /// Records the output of a completed task and enqueues whatever became
    /// ready as a result.
    pub fn complete(&mut self, task: &Task, output: Snapshot) -> Result<(), FlowError> {
        let flow = Arc::clone(&self.flow);
        let step = flow.get_step(&task.step).ok_or_else(|| FlowError::StepExecution {
            step: task.step.clone(),
            message: "step is not defined in the flow".to_string(),
        })?;

        if step.is_terminal() {
            info!("End step reached by task {}", task);
            self.end = Some(output);
            return Ok(());
        }

        if let Some(source) = &step.foreach {
            let successor = &step.next[0];
            let split_id = self.split_id();
            let children = fanout::split(task, &output, source, successor, split_id, self.max_fanout)?;

            if children.is_empty() {
                let join = self.topology.matching_join(&step.name).ok_or_else(|| {
                    ValidationError::UnclosedSplit {
                        step: successor.clone(),
                        split: step.name.clone(),
                    }
                })?;
                let join = join.to_string();
                let id = self.task_id();
                self.ready.push_back(fanout::collapse_empty(&join, task, &output, id));
                return Ok(());
            }

            for child in children {
                self.route(&task.step, child)?;
            }
        } else if step.next.len() > 1 {
            let split_id = self.split_id();
            for child in fanout::branch(task, &output, &step.next, split_id) {
                self.route(&task.step, child)?;
            }
        } else {
            let child = Child {
                step: step.next[0].clone(),
                snapshot: output,
                frames: task.frames.clone(),
            };
            self.route(&task.step, child)?;
        }

        Ok(())
    }

    /// Enqueues `child` as a task, or registers it with its join.
    fn route(&mut self, from: &str, child: Child) -> Result<(), FlowError> {
        let is_join = self.flow.get_step(&child.step).map_or(false, |s| s.join);
        if is_join {
            return self.arrive(from, child);
        }

        let id = self.task_id();
        let task = Task::new(id, child.step, child.snapshot, child.frames);
        debug!("Enqueued task {}", task);
        self.ready.push_back(task);
        Ok(())
    }

    fn arrive(&mut self, from: &str, child: Child) -> Result<(), FlowError> {
        let mut frames = child.frames;
        let closed = frames
            .pop()
            .ok_or_else(|| ValidationError::JoinWithoutSplit { step: child.step.clone() })?;

        let record = self.joins.entry(closed.id).or_insert_with(|| JoinRecord {
            step: child.step.clone(),
            expected: closed.cardinality,
            closed: closed.clone(),
            outer: frames,
            arrived: BTreeMap::new(),
        });

        record.arrived.insert(
            closed.index,
            JoinInput {
                step: from.to_string(),
                index: closed.index,
                artifacts: child.snapshot,
            },
        );

        debug!(
            "Join '{}' ({}): {}/{} arrived",
            record.step,
            closed.id,
            record.arrived.len(),
            record.expected
        );

        if record.arrived.len() < record.expected {
            return Ok(());
        }

        if let Some(record) = self.joins.remove(&closed.id) {
            let id = self.task_id();
            let arrivals: Vec<JoinInput> = record.arrived.into_values().collect();
            let task = fanout::collapse(&record.step, &record.closed, record.outer, arrivals, id);
            self.ready.push_back(task);
        }
        Ok(())
    }

    fn task_id(&mut self) -> TaskId {
        self.next_task += 1;
        TaskId(self.next_task)
    }

    fn split_id(&mut self) -> SplitId {
        self.next_split += 1;
        SplitId(self.next_split)
    }
}
