//! Run Monitoring Module
//!
//! Provides the execution timeline recorded during a run.
//!
//! # Components
//!
//! - [`ExecutionTimeline`]: Task start/retry/finish timing for Gantt charts

pub mod timeline;

pub use timeline::{EventType, ExecutionTimeline, TimelineEvent};
