//! Flow Definition Module
//!
//! Provides data structures and utilities for declaring, loading, and
//! validating step graphs.
//!
//! # Structure
//!
//! - [`model`]: Core data structures (StepDefinition, Flow)
//! - [`params`]: Declared parameters and initial values
//! - [`parser`]: YAML manifests and handler binding
//! - [`validator`]: Graph validation and topology analysis
//! - [`state`]: Run lifecycle tracking

pub mod model;
pub mod params;
pub mod parser;
pub mod state;
pub mod validator;

pub use model::{Flow, StepDefinition, StepHandler, StepResult};
pub use params::{infer_value, split_assignment, ParamError, ParamKind, Parameter, Parameters};
pub use parser::{load_flow, parse_flow, save_manifest, FlowManifest, HandlerRegistry, ManifestError};
pub use state::{RunState, RunStatus};
pub use validator::{analyze, validate, Topology, ValidationError};
