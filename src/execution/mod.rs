//! Flow Execution Module
//!
//! Provides the engine that runs a validated flow: scheduling ready tasks
//! onto worker threads, fanning out over branches and foreach sources,
//! joining results, and retrying failed steps.
//!
//! # Architecture
//!
//! - [`engine`]: Main execution engine orchestrating runs
//! - [`scheduler`]: Ready-queue and join bookkeeping
//! - [`fanout`]: Child creation for splits and collapse at joins
//! - [`retry`]: Attempt loop with constant backoff
//! - [`step`]: Individual step execution
//! - [`task`]: Task and split frame types

pub mod engine;
pub mod fanout;
pub mod retry;
pub mod scheduler;
pub mod step;
pub mod task;

pub use engine::{task_counts, Engine, RunResult, TaskReport, DEFAULT_MAX_FANOUT};
pub use retry::{run_with_retry, RetryPolicy, StepRun};
pub use scheduler::Scheduler;
pub use step::{execute_step, StepContext};
pub use task::{JoinInput, SplitFrame, SplitId, SplitKind, Task, TaskId};
