//! Flow Validation
//!
//! Checks a flow before any task is created:
//! - Step names, successor references and retry/foreach declarations
//! - Single start, single end, reachability
//! - Acyclicity (Kahn's algorithm, which also yields the topological order)
//! - Join placement: every split is closed by exactly one join, splits nest
//!   properly and nothing interleaves with an unrelated branch
//!
//! A successful analysis returns a [`Topology`] the scheduler uses at run
//! time (predecessor lists and the join that closes each split).

use std::collections::{HashMap, HashSet, VecDeque};

use log::{debug, info};
use thiserror::Error;

use super::model::{Flow, StepDefinition};

/// Malformed-graph errors, reported before a run starts.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ValidationError {
    #[error("flow has no steps")]
    EmptyFlow,

    #[error("a step has an empty or whitespace-only name")]
    EmptyStepName,

    #[error("duplicate step name: '{0}'")]
    DuplicateStep(String),

    #[error("step '{step}' names unknown successor '{successor}'")]
    UnknownSuccessor { step: String, successor: String },

    #[error("step '{step}' lists successor '{successor}' more than once")]
    DuplicateTransition { step: String, successor: String },

    #[error("step '{step}' has a retry policy with zero attempts")]
    InvalidRetryPolicy { step: String },

    #[error("foreach step '{step}' {reason}")]
    InvalidForeach { step: String, reason: String },

    #[error("flow has no start step (every step has a predecessor)")]
    NoStart,

    #[error("flow has several start steps: {}", .0.join(", "))]
    MultipleStarts(Vec<String>),

    #[error("flow has no end step (every step has a successor)")]
    NoEnd,

    #[error("flow has several end steps: {}", .0.join(", "))]
    MultipleEnds(Vec<String>),

    #[error("steps not reachable from the start: {}", .0.join(", "))]
    Unreachable(Vec<String>),

    #[error("flow contains a cycle through: {}", .0.join(", "))]
    Cycle(Vec<String>),

    #[error("step '{step}' has several predecessors ({}) but is not marked join", .predecessors.join(", "))]
    UnflaggedJoin { step: String, predecessors: Vec<String> },

    #[error("join step '{step}' does not close any split")]
    JoinWithoutSplit { step: String },

    #[error("join step '{step}' merges branches of different splits")]
    MismatchedJoin { step: String },

    #[error("join step '{step}' closes split '{split}' expecting {expected} predecessor(s), found {found}")]
    JoinArity {
        step: String,
        split: String,
        expected: usize,
        found: usize,
    },

    #[error("split '{split}' is never joined before step '{step}'")]
    UnclosedSplit { step: String, split: String },
}

/// Static structure of a validated flow.
#[derive(Debug, Clone, PartialEq)]
pub struct Topology {
    pub start: String,
    pub end: String,
    /// Step names in topological order
    pub order: Vec<String>,
    /// Predecessors of each step, in declaration order
    pub predecessors: HashMap<String, Vec<String>>,
    /// Split step name to the join step that closes it
    pub joins: HashMap<String, String>,
}

impl Topology {
    pub fn predecessors(&self, step: &str) -> &[String] {
        self.predecessors.get(step).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Join step that closes the split opened by `split`.
    pub fn matching_join(&self, split: &str) -> Option<&str> {
        self.joins.get(split).map(String::as_str)
    }
}

/// Validates `flow`, discarding the topology.
pub fn validate(flow: &Flow) -> Result<(), ValidationError> {
    analyze(flow).map(|_| ())
}

/// Validates `flow` and returns its topology.
///
/// Checks run in order and the first failing class is reported.
pub fn analyze(flow: &Flow) -> Result<Topology, ValidationError> {
    info!("Validating flow '{}' with {} steps", flow.name, flow.len());

    check_steps(flow)?;

    let predecessors = predecessor_map(flow);
    let (start, end) = find_endpoints(flow, &predecessors)?;
    check_reachable(flow, &start)?;
    let order = topological_sort(flow, &predecessors)?;
    debug!("Topological order: {:?}", order);

    check_unflagged_joins(flow, &predecessors)?;
    let joins = check_scopes(flow, &order, &predecessors, &end)?;

    info!(
        "Flow '{}' validated: start '{}', end '{}', {} split(s)",
        flow.name,
        start,
        end,
        joins.len()
    );

    Ok(Topology {
        start,
        end,
        order,
        predecessors,
        joins,
    })
}

/// Per-step field checks and successor integrity.
fn check_steps(flow: &Flow) -> Result<(), ValidationError> {
    if flow.is_empty() {
        return Err(ValidationError::EmptyFlow);
    }

    let mut names: HashSet<&str> = HashSet::new();
    for step in &flow.steps {
        if step.name.is_empty() {
            return Err(ValidationError::EmptyStepName);
        }
        if !names.insert(step.name.as_str()) {
            return Err(ValidationError::DuplicateStep(step.name.clone()));
        }
    }

    for step in &flow.steps {
        let mut seen: HashSet<&str> = HashSet::new();
        for successor in &step.next {
            if !names.contains(successor.as_str()) {
                return Err(ValidationError::UnknownSuccessor {
                    step: step.name.clone(),
                    successor: successor.clone(),
                });
            }
            if !seen.insert(successor.as_str()) {
                return Err(ValidationError::DuplicateTransition {
                    step: step.name.clone(),
                    successor: successor.clone(),
                });
            }
        }

        if step.retry.map_or(false, |policy| policy.max_attempts == 0) {
            return Err(ValidationError::InvalidRetryPolicy {
                step: step.name.clone(),
            });
        }

        if let Some(source) = &step.foreach {
            check_foreach(step, source)?;
        }
    }

    Ok(())
}

fn check_foreach(step: &StepDefinition, source: &str) -> Result<(), ValidationError> {
    let reason = if source.trim().is_empty() {
        "has an empty source field name".to_string()
    } else if step.next.len() != 1 {
        format!("must have exactly one successor, found {}", step.next.len())
    } else {
        return Ok(());
    };

    Err(ValidationError::InvalidForeach {
        step: step.name.clone(),
        reason,
    })
}

fn predecessor_map(flow: &Flow) -> HashMap<String, Vec<String>> {
    let mut map: HashMap<String, Vec<String>> = flow
        .steps
        .iter()
        .map(|step| (step.name.clone(), Vec::new()))
        .collect();

    for step in &flow.steps {
        for successor in &step.next {
            if let Some(preds) = map.get_mut(successor) {
                preds.push(step.name.clone());
            }
        }
    }

    map
}

fn find_endpoints(
    flow: &Flow,
    predecessors: &HashMap<String, Vec<String>>,
) -> Result<(String, String), ValidationError> {
    let starts: Vec<String> = flow
        .steps
        .iter()
        .filter(|step| predecessors.get(&step.name).map_or(true, Vec::is_empty))
        .map(|step| step.name.clone())
        .collect();

    let start = match starts.len() {
        0 => return Err(ValidationError::NoStart),
        1 => starts[0].clone(),
        _ => return Err(ValidationError::MultipleStarts(starts)),
    };

    let ends: Vec<String> = flow
        .steps
        .iter()
        .filter(|step| step.is_terminal())
        .map(|step| step.name.clone())
        .collect();

    let end = match ends.len() {
        0 => return Err(ValidationError::NoEnd),
        1 => ends[0].clone(),
        _ => return Err(ValidationError::MultipleEnds(ends)),
    };

    debug!("Start step '{}', end step '{}'", start, end);
    Ok((start, end))
}

fn check_reachable(flow: &Flow, start: &str) -> Result<(), ValidationError> {
    let mut visited: HashSet<&str> = HashSet::new();
    let mut queue: VecDeque<&str> = VecDeque::new();
    visited.insert(start);
    queue.push_back(start);

    while let Some(current) = queue.pop_front() {
        if let Some(step) = flow.get_step(current) {
            for successor in &step.next {
                if visited.insert(successor.as_str()) {
                    queue.push_back(successor.as_str());
                }
            }
        }
    }

    let unreachable: Vec<String> = flow
        .steps
        .iter()
        .filter(|step| !visited.contains(step.name.as_str()))
        .map(|step| step.name.clone())
        .collect();

    if unreachable.is_empty() {
        Ok(())
    } else {
        Err(ValidationError::Unreachable(unreachable))
    }
}

/// Kahn's algorithm. Steps left with incoming edges form or follow a cycle.
fn topological_sort(
    flow: &Flow,
    predecessors: &HashMap<String, Vec<String>>,
) -> Result<Vec<String>, ValidationError> {
    let mut in_degree: HashMap<&str, usize> = flow
        .steps
        .iter()
        .map(|step| {
            let degree = predecessors.get(&step.name).map_or(0, Vec::len);
            (step.name.as_str(), degree)
        })
        .collect();

    let mut queue: VecDeque<&str> = flow
        .steps
        .iter()
        .filter(|step| in_degree.get(step.name.as_str()) == Some(&0))
        .map(|step| step.name.as_str())
        .collect();

    let mut order: Vec<String> = Vec::with_capacity(flow.len());

    while let Some(current) = queue.pop_front() {
        order.push(current.to_string());

        let Some(step) = flow.get_step(current) else {
            continue;
        };
        for successor in &step.next {
            if let Some(degree) = in_degree.get_mut(successor.as_str()) {
                *degree -= 1;
                if *degree == 0 {
                    queue.push_back(successor.as_str());
                }
            }
        }
    }

    if order.len() != flow.len() {
        let mut remaining: Vec<String> = in_degree
            .into_iter()
            .filter(|(_, degree)| *degree > 0)
            .map(|(name, _)| name.to_string())
            .collect();
        remaining.sort();
        return Err(ValidationError::Cycle(remaining));
    }

    Ok(order)
}

fn check_unflagged_joins(
    flow: &Flow,
    predecessors: &HashMap<String, Vec<String>>,
) -> Result<(), ValidationError> {
    for step in &flow.steps {
        let preds = predecessors.get(&step.name).cloned().unwrap_or_default();
        if preds.len() > 1 && !step.join {
            return Err(ValidationError::UnflaggedJoin {
                step: step.name.clone(),
                predecessors: preds,
            });
        }
    }
    Ok(())
}

/// Walks the steps in topological order tracking the stack of open splits.
///
/// A step inherits its predecessor's stack, plus the predecessor itself if
/// that predecessor is a split. A join must see the same non-empty stack
/// from every predecessor and closes its innermost split. The end step must
/// see an empty stack.
fn check_scopes(
    flow: &Flow,
    order: &[String],
    predecessors: &HashMap<String, Vec<String>>,
    end: &str,
) -> Result<HashMap<String, String>, ValidationError> {
    let mut scopes: HashMap<&str, Vec<String>> = HashMap::new();
    let mut joins: HashMap<String, String> = HashMap::new();

    for name in order {
        let Some(step) = flow.get_step(name) else {
            continue;
        };
        let preds = predecessors.get(name).map(Vec::as_slice).unwrap_or(&[]);

        let candidates: Vec<Vec<String>> = preds
            .iter()
            .filter_map(|pred| {
                let pred_step = flow.get_step(pred)?;
                let mut scope = scopes.get(pred.as_str()).cloned().unwrap_or_default();
                if pred_step.is_split() {
                    scope.push(pred.clone());
                }
                Some(scope)
            })
            .collect();

        let mut scope = candidates.first().cloned().unwrap_or_default();

        if step.join {
            if candidates.iter().any(|candidate| *candidate != scope) {
                return Err(ValidationError::MismatchedJoin { step: name.clone() });
            }
            let Some(split) = scope.pop() else {
                return Err(ValidationError::JoinWithoutSplit { step: name.clone() });
            };

            let expected = flow
                .get_step(&split)
                .map_or(0, |s| if s.foreach.is_some() { 1 } else { s.next.len() });
            if preds.len() != expected {
                return Err(ValidationError::JoinArity {
                    step: name.clone(),
                    split,
                    expected,
                    found: preds.len(),
                });
            }

            debug!("Join '{}' closes split '{}'", name, split);
            joins.insert(split, name.clone());
        }

        if name == end {
            if let Some(split) = scope.last() {
                return Err(ValidationError::UnclosedSplit {
                    step: name.clone(),
                    split: split.clone(),
                });
            }
        }

        scopes.insert(name.as_str(), scope);
    }

    Ok(joins)
}
