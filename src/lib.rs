//! Stepflow - Step-Graph Execution Engine
//!
//! Runs flows declared as directed graphs of named steps inside a single
//! process. Steps pass immutable artifact snapshots along their edges,
//! fan out over static branches or over the elements of a sequence, meet
//! again at join steps, and are retried on failure.
//!
//! # Architecture
//!
//! The library is organized into the following modules:
//!
//! - [`workflow`]: Flow definitions, parameters, manifests and validation
//! - [`execution`]: Scheduler, fan-out, retries and the execution engine
//! - [`artifacts`]: Copy-on-write snapshots and join-time merging
//! - [`monitoring`]: Execution timeline
//! - [`flows`]: Built-in demonstration flows
//!
//! # Example
//!
//! ```rust,no_run
//! use stepflow::execution::Engine;
//! use stepflow::workflow::{Flow, Parameters, StepDefinition};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let flow = Flow::new("double")
//!         .with_step(StepDefinition::new("start", |ctx| {
//!             let n: i64 = ctx.require("n")?;
//!             ctx.set("doubled", n * 2);
//!             Ok(())
//!         }).then("end"))
//!         .with_step(StepDefinition::new("end", |_| Ok(())));
//!
//!     let mut engine = Engine::new(flow);
//!     engine.set_max_parallel(4);
//!
//!     let result = engine.run(Parameters::new().with("n", 21))?;
//!     println!("{:?}", result.artifacts);
//!     Ok(())
//! }
//! ```

pub mod artifacts;
pub mod error;
pub mod execution;
pub mod flows;
pub mod monitoring;
pub mod workflow;

// Re-export commonly used types
pub use artifacts::Snapshot;
pub use error::{Failure, FlowError};
pub use execution::engine::{Engine, RunResult};
pub use workflow::model::{Flow, StepDefinition};
pub use workflow::params::Parameters;
pub use workflow::parser::load_flow;
pub use workflow::validator::ValidationError;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application name
pub const APP_NAME: &str = "Stepflow";
