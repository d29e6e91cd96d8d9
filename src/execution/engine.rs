//! Flow Execution Engine
//!
//! The core engine that orchestrates a run:
//! - Validates the flow before any task is created
//! - Builds the start snapshot from declared defaults and supplied parameters
//! - Runs ready tasks on worker threads, up to `max_parallel` at once
//! - Feeds completed tasks back to the scheduler
//! - Stops scheduling on the first failure and drains in-flight tasks

use std::collections::HashMap;
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, error, info, warn};

use crate::artifacts::Snapshot;
use crate::error::{Failure, FlowError, ValidationError};
use crate::monitoring::{EventType, ExecutionTimeline};
use crate::workflow::params::Parameters;
use crate::workflow::state::{RunState, RunStatus};
use crate::workflow::validator::{analyze, Topology};
use crate::workflow::Flow;

use super::retry::{run_with_retry_notify, StepRun};
use super::scheduler::Scheduler;
use super::task::{Task, TaskId};

/// Default upper bound on foreach cardinality.
pub const DEFAULT_MAX_FANOUT: usize = 10_000;

/// Messages sent from worker threads to the run loop.
enum WorkerMessage {
    Retrying { task: TaskId, label: String, attempt: u32 },
    Finished { task: Task, result: Result<StepRun, Failure> },
}

/// Outcome of one task.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskReport {
    pub id: TaskId,
    pub step: String,
    pub index: Option<usize>,
    pub attempts: u32,
    pub succeeded: bool,
}

/// Everything a run produced.
#[derive(Debug, Clone)]
pub struct RunResult {
    pub status: RunStatus,
    /// Snapshot of the end step, for completed runs
    pub artifacts: Option<Snapshot>,
    /// The failure that halted the run
    pub failure: Option<Failure>,
    /// Finished tasks in completion order
    pub tasks: Vec<TaskReport>,
    pub timeline: ExecutionTimeline,
    pub state: RunState,
    pub elapsed: Duration,
}

impl RunResult {
    pub fn is_success(&self) -> bool {
        self.status == RunStatus::Completed
    }

    /// Reports of every task that ran `step`, in completion order.
    pub fn tasks_for(&self, step: &str) -> Vec<&TaskReport> {
        self.tasks.iter().filter(|t| t.step == step).collect()
    }

    /// Total attempts made by all tasks of `step`.
    pub fn attempts_for(&self, step: &str) -> u32 {
        self.tasks_for(step).iter().map(|t| t.attempts).sum()
    }
}

/// Flow execution engine.
///
/// # Example
///
/// ```
/// use stepflow::execution::Engine;
/// use stepflow::workflow::{Flow, Parameters, StepDefinition};
///
/// let flow = Flow::new("double")
///     .with_step(StepDefinition::new("start", |ctx| {
///         let x: i64 = ctx.require("x")?;
///         ctx.set("x", x * 2);
///         Ok(())
///     }).then("end"))
///     .with_step(StepDefinition::new("end", |_| Ok(())));
///
/// let mut engine = Engine::new(flow);
/// engine.set_max_parallel(2);
///
/// let result = engine.run(Parameters::new().with("x", 21)).unwrap();
/// assert!(result.is_success());
/// assert_eq!(result.artifacts.unwrap().get("x"), Some(&serde_json::json!(42)));
/// ```
pub struct Engine {
    flow: Arc<Flow>,
    max_parallel: usize,
    max_fanout: usize,
}

impl Engine {
    /// Creates a new execution engine for a flow.
    pub fn new(flow: Flow) -> Self {
        Self {
            flow: Arc::new(flow),
            max_parallel: num_cpus::get().max(1),
            max_fanout: DEFAULT_MAX_FANOUT,
        }
    }

    /// Sets the maximum number of tasks running at once.
    pub fn set_max_parallel(&mut self, max: usize) {
        self.max_parallel = max.max(1);
    }

    /// Sets the largest sequence a foreach step may fan out over.
    pub fn set_max_fanout(&mut self, max: usize) {
        self.max_fanout = max;
    }

    pub fn max_parallel(&self) -> usize {
        self.max_parallel
    }

    pub fn flow(&self) -> &Flow {
        &self.flow
    }

    /// Validates the flow without running it.
    pub fn validate(&self) -> Result<Topology, ValidationError> {
        analyze(&self.flow)
    }

    /// Executes the flow.
    ///
    /// # Returns
    ///
    /// * `Ok(RunResult)` - The run finished, successfully or not; check
    ///   [`RunResult::status`]
    /// * `Err(ValidationError)` - The flow is malformed and nothing ran
    pub fn run(&self, params: Parameters) -> Result<RunResult, ValidationError> {
        let start_time = Instant::now();
        let topology = analyze(&self.flow)?;

        let mut state = RunState::new(&self.flow.name);
        if let Err(e) = state.start() {
            warn!("{}", e);
        }

        info!(
            "Starting run {} of '{}' (max parallel: {}, max fan-out: {})",
            state.run_id, self.flow.name, self.max_parallel, self.max_fanout
        );

        let initial = self.initial_snapshot(params);
        let mut scheduler = Scheduler::new(Arc::clone(&self.flow), topology, initial, self.max_fanout);
        let mut timeline = ExecutionTimeline::new();
        let mut reports: Vec<TaskReport> = Vec::new();
        let mut failure: Option<Failure> = None;

        let (tx, rx): (Sender<WorkerMessage>, Receiver<WorkerMessage>) = channel();
        // dropped once scheduling stops, so `recv` fails if every worker vanishes
        let mut tx = Some(tx);
        let mut running_count = 0;

        // Main execution loop
        loop {
            // Schedule ready tasks unless the run already failed
            if failure.is_some() {
                tx = None;
            }
            while let Some(sender) = tx.as_ref() {
                if running_count >= self.max_parallel {
                    break;
                }
                let Some(task) = scheduler.next_ready() else {
                    break;
                };

                info!("Starting task {}", task);
                timeline.add_event(task.id, label(&task), EventType::Started);
                self.spawn_worker(task, sender.clone());
                running_count += 1;
            }

            if running_count == 0 {
                break;
            }

            let message = match rx.recv() {
                Ok(message) => message,
                Err(e) => {
                    error!("Failed to receive task completion: {}", e);
                    failure.get_or_insert_with(|| {
                        Failure::new(&self.flow.name, None, 0, FlowError::WorkerLost(e.to_string()))
                    });
                    break;
                }
            };

            let (task, result) = match message {
                WorkerMessage::Retrying { task, label, attempt } => {
                    timeline.add_event(task, label, EventType::Retrying { attempt });
                    continue;
                }
                WorkerMessage::Finished { task, result } => (task, result),
            };

            running_count -= 1;

            let outcome = result.and_then(|run| {
                let attempts = run.attempts;
                if failure.is_some() {
                    debug!("Discarding output of task {} after run failure", task);
                    return Ok(attempts);
                }
                scheduler
                    .complete(&task, run.snapshot)
                    .map(|()| attempts)
                    .map_err(|e| Failure::new(&task.step, task.foreach_index(), attempts, e))
            });

            match outcome {
                Ok(attempts) => {
                    info!("Task {} completed", task);
                    timeline.add_event(task.id, label(&task), EventType::Completed);
                    state.mark_task_completed();
                    reports.push(report(&task, attempts, true));
                }
                Err(f) => {
                    error!("Task {} failed: {}", task, f);
                    timeline.add_event(task.id, label(&task), EventType::Failed);
                    reports.push(report(&task, f.attempts, false));
                    if failure.is_none() {
                        if running_count > 0 {
                            info!("Waiting for {} running task(s) to settle", running_count);
                        }
                        failure = Some(f);
                    }
                }
            }
        }

        if failure.is_none() && !scheduler.is_finished() {
            let end = scheduler.topology().end.clone();
            failure = Some(Failure::new(
                end,
                None,
                0,
                FlowError::Stalled {
                    pending: scheduler.pending_joins(),
                },
            ));
        }

        let transition = match &failure {
            None => state.complete(),
            Some(f) => state.fail(&f.step),
        };
        if let Err(e) = transition {
            warn!("{}", e);
        }

        let elapsed = start_time.elapsed();
        match &failure {
            None => info!(
                "Run of '{}' completed: {} task(s) in {:.2?}",
                self.flow.name,
                reports.len(),
                elapsed
            ),
            Some(f) => error!("Run of '{}' failed: {}", self.flow.name, f),
        }

        Ok(RunResult {
            status: state.status,
            artifacts: scheduler.take_end(),
            failure,
            tasks: reports,
            timeline,
            state,
            elapsed,
        })
    }

    /// Declared defaults first, then supplied values on top.
    fn initial_snapshot(&self, params: Parameters) -> Snapshot {
        let mut snapshot = Snapshot::new();

        for parameter in &self.flow.parameters {
            if !parameter.default.is_null() {
                snapshot.set(parameter.name.clone(), parameter.default.clone());
            }
        }

        for (name, value) in params.iter() {
            if self.flow.get_parameter(name).is_none() {
                warn!(
                    "Parameter '{}' is not declared by flow '{}'; injecting it anyway",
                    name, self.flow.name
                );
            }
            snapshot.set(name.clone(), value.clone());
        }

        for parameter in &self.flow.parameters {
            if !snapshot.contains(&parameter.name) {
                warn!("Parameter '{}' has no value and no default", parameter.name);
            }
        }

        snapshot
    }

    fn spawn_worker(&self, task: Task, tx: Sender<WorkerMessage>) {
        let flow = Arc::clone(&self.flow);

        thread::spawn(move || {
            let completion = Completion::new(tx.clone(), task.clone());
            let result = match flow.get_step(&task.step) {
                Some(step) => {
                    let task_label = label(&task);
                    let retry_tx = tx.clone();
                    run_with_retry_notify(step, &task, step.retry_policy(), |attempt, _| {
                        let message = WorkerMessage::Retrying {
                            task: task.id,
                            label: task_label.clone(),
                            attempt,
                        };
                        if retry_tx.send(message).is_err() {
                            debug!("Run loop gone; dropping retry notice");
                        }
                    })
                }
                None => Err(Failure::new(
                    &task.step,
                    task.foreach_index(),
                    0,
                    FlowError::WorkerLost(format!("step '{}' is not defined", task.step)),
                )),
            };

            completion.send(result);
        });
    }
}

/// Guarantees a worker reports exactly once, even if its thread unwinds.
struct Completion {
    tx: Sender<WorkerMessage>,
    task: Option<Task>,
}

impl Completion {
    fn new(tx: Sender<WorkerMessage>, task: Task) -> Self {
        Self { tx, task: Some(task) }
    }

    fn send(mut self, result: Result<StepRun, Failure>) {
        if let Some(task) = self.task.take() {
            self.deliver(task, result);
        }
    }

    fn deliver(&self, task: Task, result: Result<StepRun, Failure>) {
        if let Err(e) = self.tx.send(WorkerMessage::Finished { task, result }) {
            error!("Failed to send completion signal: {}", e);
        }
    }
}

impl Drop for Completion {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            error!("Worker for task {} exited without reporting", task);
            let failure = Failure::new(
                &task.step,
                task.foreach_index(),
                0,
                FlowError::WorkerLost(format!("worker for task {} exited without reporting", task)),
            );
            self.deliver(task, Err(failure));
        }
    }
}

fn label(task: &Task) -> String {
    match task.foreach_index() {
        Some(index) => format!("{}[{}]", task.step, index),
        None => task.step.clone(),
    }
}

fn report(task: &Task, attempts: u32, succeeded: bool) -> TaskReport {
    TaskReport {
        id: task.id,
        step: task.step.clone(),
        index: task.foreach_index(),
        attempts,
        succeeded,
    }
}

/// Counts tasks per step, e.g. for summaries.
pub fn task_counts(reports: &[TaskReport]) -> HashMap<&str, usize> {
    let mut counts = HashMap::new();
    for report in reports {
        *counts.entry(report.step.as_str()).or_insert(0) += 1;
    }
    counts
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifacts::INPUT_KEY;
    use crate::workflow::params::{ParamKind, Parameter};
    use crate::workflow::StepDefinition;
    use serde_json::{json, Value};
    use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
    use std::sync::Mutex;

    fn noop(name: &str) -> StepDefinition {
        StepDefinition::new(name, |_| Ok(()))
    }

    fn run(flow: Flow, params: Parameters) -> RunResult {
        let mut engine = Engine::new(flow);
        engine.set_max_parallel(4);
        engine.run(params).unwrap()
    }

    fn increment(name: &str) -> StepDefinition {
        StepDefinition::new(name, |ctx| {
            let x: i64 = ctx.require("x")?;
            ctx.set("x", x + 1);
            Ok(())
        })
    }

    #[test]
    fn test_engine_configuration() {
        let mut engine = Engine::new(Flow::new("f"));
        assert!(engine.max_parallel() >= 1);

        engine.set_max_parallel(0);
        assert_eq!(engine.max_parallel(), 1);

        engine.set_max_fanout(5);
        assert_eq!(engine.max_fanout, 5);
    }

    #[test]
    fn test_invalid_flow_never_runs() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let flow = Flow::new("invalid")
            .with_step(StepDefinition::new("a", move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }).then("end"))
            .with_step(noop("b").then("end"))
            .with_step(noop("end").join());

        let err = Engine::new(flow).run(Parameters::new()).unwrap_err();
        assert!(matches!(err, ValidationError::MultipleStarts(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_linear_flow_increments_in_order() {
        let n = 5;
        let mut flow = Flow::new("linear").with_step(increment("s0").then("s1"));
        for i in 1..n {
            flow = flow.with_step(increment(&format!("s{}", i)).then(format!("s{}", i + 1)));
        }
        flow = flow.with_step(increment(&format!("s{}", n)));

        let result = run(flow, Parameters::new().with("x", 0));
        assert!(result.is_success());
        assert_eq!(result.artifacts.clone().unwrap().get("x"), Some(&json!(n + 1)));

        let order: Vec<&str> = result.tasks.iter().map(|t| t.step.as_str()).collect();
        let expected: Vec<String> = (0..=n).map(|i| format!("s{}", i)).collect();
        assert_eq!(order, expected);
    }

    fn append_name(name: &str) -> StepDefinition {
        StepDefinition::new(name, |ctx| {
            let mut seen: Vec<String> = ctx.require("seen")?;
            seen.push(ctx.step().to_string());
            ctx.set("seen", seen);
            Ok(())
        })
    }

    #[test]
    fn test_linear_flow_appends_every_step_name() {
        for n in 1..=5 {
            let names: Vec<String> = (1..=n).map(|i| format!("s{}", i)).collect();
            let mut flow = Flow::new("linear");
            for (i, name) in names.iter().enumerate() {
                let step = match names.get(i + 1) {
                    Some(next) => append_name(name).then(next.clone()),
                    None => append_name(name),
                };
                flow = flow.with_step(step);
            }

            let result = run(flow, Parameters::new().with("seen", json!([])));
            assert!(result.is_success(), "n = {}: {:?}", n, result.failure);
            assert_eq!(
                result.artifacts.clone().unwrap().get("seen"),
                Some(&json!(names)),
                "n = {}",
                n
            );
        }
    }

    #[test]
    fn test_join_inputs_keep_their_element() {
        let flow = Flow::new("pairs")
            .with_step(noop("start").foreach("items", "body"))
            .with_step(StepDefinition::new("body", |ctx| {
                let value = ctx.input().and_then(Value::as_i64).unwrap_or(0);
                ctx.set("doubled", value * 2);
                Ok(())
            }).then("join"))
            .with_step(StepDefinition::new("join", |ctx| {
                let elements: Vec<i64> = ctx.collect(INPUT_KEY)?;
                let doubled: Vec<i64> = ctx.collect("doubled")?;
                let pairs: Vec<(i64, i64)> = elements.into_iter().zip(doubled).collect();
                ctx.set("pairs", serde_json::to_value(pairs)?);
                ctx.remove("doubled");
                Ok(())
            }).join().then("end"))
            .with_step(noop("end"));

        let result = run(flow, Parameters::new().with("items", json!([1, 2, 3])));
        assert!(result.is_success(), "{:?}", result.failure);

        let artifacts = result.artifacts.clone().unwrap();
        assert_eq!(artifacts.get("pairs"), Some(&json!([[1, 2], [2, 4], [3, 6]])));
        assert!(!artifacts.contains(INPUT_KEY));
    }

    #[test]
    fn test_worker_that_unwinds_still_reports() {
        let (tx, rx) = channel();
        let task = Task::new(TaskId(4), "body", Snapshot::new(), Vec::new());

        let handle = thread::spawn(move || {
            let _completion = Completion::new(tx, task);
            panic!("worker died before reporting");
        });
        assert!(handle.join().is_err());

        match rx.recv().unwrap() {
            WorkerMessage::Finished { task, result } => {
                assert_eq!(task.id, TaskId(4));
                let failure = result.unwrap_err();
                assert!(matches!(failure.error, FlowError::WorkerLost(_)));
                assert_eq!(failure.step, "body");
            }
            WorkerMessage::Retrying { .. } => panic!("unexpected retry notice"),
        }
        // exactly one report, then the channel closes
        assert!(rx.recv().is_err());
    }

    #[test]
    fn test_completion_reports_once() {
        let (tx, rx) = channel();
        let task = Task::new(TaskId(1), "start", Snapshot::new(), Vec::new());

        let run = StepRun {
            snapshot: Snapshot::new(),
            attempts: 1,
        };
        Completion::new(tx, task).send(Ok(run));

        assert!(matches!(
            rx.recv(),
            Ok(WorkerMessage::Finished { result: Ok(_), .. })
        ));
        assert!(rx.recv().is_err());
    }

    #[test]
    fn test_static_branch_join_sees_both_values() {
        let flow = Flow::new("branch")
            .with_step(noop("start").branch(["a", "b"]))
            .with_step(StepDefinition::new("a", |ctx| {
                ctx.set("a", 1);
                Ok(())
            }).then("join"))
            .with_step(StepDefinition::new("b", |ctx| {
                ctx.set("b", 2);
                Ok(())
            }).then("join"))
            .with_step(StepDefinition::new("join", |ctx| {
                let a: i64 = ctx.require("a")?;
                let b: i64 = ctx.require("b")?;
                ctx.set("sum", a + b);
                Ok(())
            }).join().then("end"))
            .with_step(noop("end"));

        let result = run(flow, Parameters::new());
        let artifacts = result.artifacts.clone().unwrap();
        assert_eq!(artifacts.get("a"), Some(&json!(1)));
        assert_eq!(artifacts.get("b"), Some(&json!(2)));
        assert_eq!(artifacts.get("sum"), Some(&json!(3)));
    }

    #[test]
    fn test_foreach_indices_and_ordered_join() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let recorder = Arc::clone(&seen);

        let flow = Flow::new("foreach")
            .with_step(noop("start").foreach("items", "body"))
            .with_step(StepDefinition::new("body", move |ctx| {
                let input = ctx.input().cloned().unwrap_or(Value::Null);
                if let Ok(mut seen) = recorder.lock() {
                    seen.push((ctx.index(), input.clone()));
                }
                // later elements finish first
                let delay = 30 - input.as_u64().unwrap_or(0) * 10;
                thread::sleep(Duration::from_millis(delay));
                ctx.set("result", input);
                Ok(())
            }).then("join"))
            .with_step(StepDefinition::new("join", |ctx| {
                assert!(ctx.input().is_none());
                let results: Vec<i64> = ctx.collect("result")?;
                ctx.set("results", results);
                ctx.remove("result");
                Ok(())
            }).join().then("end"))
            .with_step(noop("end"));

        let result = run(flow, Parameters::new().with("items", json!([1, 2, 3])));
        assert!(result.is_success(), "{:?}", result.failure);
        assert_eq!(result.artifacts.clone().unwrap().get("results"), Some(&json!([1, 2, 3])));

        let mut seen = seen.lock().unwrap().clone();
        seen.sort_by_key(|(index, _)| *index);
        assert_eq!(
            seen,
            vec![(Some(0), json!(1)), (Some(1), json!(2)), (Some(2), json!(3))]
        );

        let mut indices: Vec<Option<usize>> = result.tasks_for("body").iter().map(|t| t.index).collect();
        indices.sort();
        assert_eq!(indices, vec![Some(0), Some(1), Some(2)]);
    }

    #[test]
    fn test_retry_recovers_on_third_attempt() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);

        let flow = Flow::new("retry")
            .with_step(StepDefinition::new("start", move |ctx| {
                if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                    return Err(format!("attempt {} failed", ctx.attempt()).into());
                }
                ctx.set("ok", true);
                Ok(())
            }).retry(3, Duration::from_millis(5)).then("end"))
            .with_step(noop("end"));

        let result = run(flow, Parameters::new());
        assert!(result.is_success());
        assert_eq!(result.attempts_for("start"), 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        let retries = result
            .timeline
            .get_events()
            .iter()
            .filter(|e| matches!(e.event_type, EventType::Retrying { .. }))
            .count();
        assert_eq!(retries, 2);
    }

    #[test]
    fn test_retry_exhaustion_fails_run() {
        let downstream = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&downstream);

        let flow = Flow::new("exhaust")
            .with_step(StepDefinition::new("start", |_| Err("always".into()))
                .retry(3, Duration::ZERO)
                .then("next"))
            .with_step(StepDefinition::new("next", move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }).then("end"))
            .with_step(noop("end"));

        let result = run(flow, Parameters::new());
        assert_eq!(result.status, RunStatus::Failed);
        assert!(result.artifacts.is_none());

        let failure = result.failure.clone().unwrap();
        assert_eq!(failure.step, "start");
        assert_eq!(failure.attempts, 3);
        assert!(matches!(failure.error, FlowError::StepExecution { .. }));
        assert_eq!(downstream.load(Ordering::SeqCst), 0);
        assert_eq!(result.state.failed_step.as_deref(), Some("start"));
    }

    fn conflicting_flow(resolve: bool) -> Flow {
        Flow::new("conflict")
            .with_step(noop("start").branch(["a", "b"]))
            .with_step(StepDefinition::new("a", |ctx| {
                ctx.set("x", 1);
                Ok(())
            }).then("join"))
            .with_step(StepDefinition::new("b", |ctx| {
                ctx.set("x", 2);
                Ok(())
            }).then("join"))
            .with_step(StepDefinition::new("join", move |ctx| {
                if resolve {
                    let xs: Vec<i64> = ctx.collect("x")?;
                    ctx.set("x", xs.iter().max().copied().unwrap_or(0));
                }
                Ok(())
            }).join().retry(3, Duration::ZERO).then("end"))
            .with_step(noop("end"))
    }

    #[test]
    fn test_unresolved_conflict_fails_without_retry() {
        let result = run(conflicting_flow(false), Parameters::new());
        let failure = result.failure.clone().unwrap();
        assert_eq!(failure.step, "join");
        assert_eq!(failure.attempts, 1);
        assert_eq!(
            failure.error,
            FlowError::ArtifactConflict {
                step: "join".to_string(),
                keys: vec!["x".to_string()],
            }
        );
    }

    #[test]
    fn test_resolved_conflict_completes() {
        let result = run(conflicting_flow(true), Parameters::new());
        assert!(result.is_success());
        assert_eq!(result.artifacts.clone().unwrap().get("x"), Some(&json!(2)));
    }

    #[test]
    fn test_invalid_foreach_source_is_not_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);

        let flow = Flow::new("bad_source")
            .with_step(StepDefinition::new("start", move |ctx| {
                counter.fetch_add(1, Ordering::SeqCst);
                ctx.set("items", 7);
                Ok(())
            }).retry(3, Duration::ZERO).foreach("items", "body"))
            .with_step(noop("body").then("join"))
            .with_step(noop("join").join().then("end"))
            .with_step(noop("end"));

        let result = run(flow, Parameters::new());
        let failure = result.failure.clone().unwrap();
        assert!(matches!(failure.error, FlowError::InvalidForeachSource { .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(result.tasks_for("body").is_empty());
    }

    #[test]
    fn test_fanout_limit() {
        let flow = Flow::new("limit")
            .with_step(noop("start").foreach("items", "join"))
            .with_step(noop("join").join().then("end"))
            .with_step(noop("end"));

        let mut engine = Engine::new(flow);
        engine.set_max_fanout(2);
        let result = engine.run(Parameters::new().with("items", json!([1, 2, 3]))).unwrap();
        assert!(matches!(
            result.failure.map(|f| f.error),
            Some(FlowError::InvalidForeachSource { .. })
        ));
    }

    #[test]
    fn test_empty_foreach_runs_join_with_no_inputs() {
        let flow = Flow::new("empty")
            .with_step(noop("start").foreach("items", "body"))
            .with_step(StepDefinition::new("body", |_| Err("never runs".into())).then("join"))
            .with_step(StepDefinition::new("join", |ctx| {
                ctx.set("count", ctx.inputs().len());
                Ok(())
            }).join().then("end"))
            .with_step(noop("end"));

        let result = run(flow, Parameters::new().with("items", json!([])));
        assert!(result.is_success());
        assert_eq!(result.artifacts.clone().unwrap().get("count"), Some(&json!(0)));
        assert!(result.tasks_for("body").is_empty());
    }

    #[test]
    fn test_nested_foreach_inside_foreach() {
        let flow = Flow::new("nested")
            .with_step(noop("start").foreach("groups", "group"))
            .with_step(StepDefinition::new("group", |ctx| {
                let group: Vec<i64> = serde_json::from_value(ctx.input().cloned().unwrap_or_default())?;
                ctx.set("members", group);
                Ok(())
            }).foreach("members", "member"))
            .with_step(StepDefinition::new("member", |ctx| {
                let value = ctx.input().and_then(Value::as_i64).unwrap_or(0);
                ctx.set("square", value * value);
                Ok(())
            }).then("inner_join"))
            .with_step(StepDefinition::new("inner_join", |ctx| {
                // the enclosing group's element is visible again
                assert!(ctx.input().map_or(false, Value::is_array));
                let squares: Vec<i64> = ctx.collect("square")?;
                ctx.set("group_sum", squares.iter().sum::<i64>());
                ctx.remove("square");
                ctx.remove("members");
                Ok(())
            }).join().then("outer_join"))
            .with_step(StepDefinition::new("outer_join", |ctx| {
                let sums: Vec<i64> = ctx.collect("group_sum")?;
                ctx.set("sums", sums);
                ctx.remove("group_sum");
                Ok(())
            }).join().then("end"))
            .with_step(noop("end"));

        let result = run(flow, Parameters::new().with("groups", json!([[1, 2], [3], [4, 5, 6]])));
        assert!(result.is_success(), "{:?}", result.failure);
        assert_eq!(result.artifacts.clone().unwrap().get("sums"), Some(&json!([5, 9, 77])));
        assert_eq!(result.tasks_for("member").len(), 6);
    }

    #[test]
    fn test_branches_run_in_parallel() {
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let branch = |name: &str| {
            let active = Arc::clone(&active);
            let peak = Arc::clone(&peak);
            StepDefinition::new(name, move |_| {
                let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                thread::sleep(Duration::from_millis(50));
                active.fetch_sub(1, Ordering::SeqCst);
                Ok(())
            })
            .then("join")
        };

        let flow = Flow::new("parallel")
            .with_step(noop("start").branch(["a", "b", "c"]))
            .with_step(branch("a"))
            .with_step(branch("b"))
            .with_step(branch("c"))
            .with_step(noop("join").join().then("end"))
            .with_step(noop("end"));

        let result = run(flow, Parameters::new());
        assert!(result.is_success());
        assert!(peak.load(Ordering::SeqCst) >= 2);
    }

    #[test]
    fn test_failure_drains_running_siblings() {
        let finished = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&finished);

        let flow = Flow::new("drain")
            .with_step(noop("start").branch(["slow", "broken"]))
            .with_step(StepDefinition::new("slow", move |_| {
                thread::sleep(Duration::from_millis(50));
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }).then("join"))
            .with_step(StepDefinition::new("broken", |_| Err("boom".into())).then("join"))
            .with_step(noop("join").join().then("end"))
            .with_step(noop("end"));

        let result = run(flow, Parameters::new());
        assert_eq!(result.status, RunStatus::Failed);
        assert_eq!(finished.load(Ordering::SeqCst), 1);
        assert!(result.tasks_for("slow")[0].succeeded);
        assert!(result.tasks_for("join").is_empty());
        assert_eq!(result.failure.clone().unwrap().step, "broken");
    }

    #[test]
    fn test_defaults_and_undeclared_parameters() {
        let flow = Flow::new("params")
            .with_parameter(Parameter::new("start_value", ParamKind::Int, 5))
            .with_parameter(Parameter::new("label", ParamKind::String, "x"))
            .with_step(noop("start").then("end"))
            .with_step(noop("end"));

        let result = run(flow, Parameters::new().with("label", "y").with("extra", true));
        let artifacts = result.artifacts.clone().unwrap();
        assert_eq!(artifacts.get("start_value"), Some(&json!(5)));
        assert_eq!(artifacts.get("label"), Some(&json!("y")));
        assert_eq!(artifacts.get("extra"), Some(&json!(true)));
    }

    #[test]
    fn test_input_snapshot_unchanged_between_attempts() {
        let flow = Flow::new("idempotent")
            .with_step(StepDefinition::new("start", |ctx| {
                let x: i64 = ctx.require("x")?;
                ctx.set("x", x + 1);
                if ctx.attempt() < 3 {
                    return Err("retry me".into());
                }
                Ok(())
            }).retry(3, Duration::ZERO).then("end"))
            .with_step(noop("end"));

        let result = run(flow, Parameters::new().with("x", 10));
        assert_eq!(result.artifacts.clone().unwrap().get("x"), Some(&json!(11)));
    }

    #[test]
    fn test_run_state_and_task_counts() {
        let flow = Flow::new("counts")
            .with_step(noop("start").foreach("items", "body"))
            .with_step(noop("body").then("join"))
            .with_step(StepDefinition::new("join", |_| Ok(())).join().then("end"))
            .with_step(noop("end"));

        let result = run(flow, Parameters::new().with("items", json!(["a", "b"])));
        assert_eq!(result.state.status, RunStatus::Completed);
        assert_eq!(result.state.completed_tasks, 5);

        let counts = task_counts(&result.tasks);
        assert_eq!(counts.get("body"), Some(&2));
        assert!(!result.artifacts.clone().unwrap().contains(INPUT_KEY));
    }
}
