//! Flow Data Model
//!
//! Core data structures representing steps, their transitions, and the
//! flow that groups them.
//!
//! # Example
//!
//! ```
//! use stepflow::workflow::{Flow, StepDefinition};
//!
//! let flow = Flow::new("hello")
//!     .with_step(StepDefinition::new("start", |ctx| {
//!         ctx.set("greeting", "hello");
//!         Ok(())
//!     }).then("end"))
//!     .with_step(StepDefinition::new("end", |_| Ok(())));
//!
//! assert_eq!(flow.len(), 2);
//! ```

use std::error::Error;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::execution::retry::RetryPolicy;
use crate::execution::step::StepContext;

use super::params::Parameter;

/// Result returned by step handlers.
pub type StepResult = Result<(), Box<dyn Error + Send + Sync>>;

/// Behaviour bound to a step.
///
/// Implemented for every `Fn(&mut StepContext) -> StepResult` closure, so
/// most flows never name this trait directly.
pub trait StepHandler: Send + Sync {
    fn run(&self, ctx: &mut StepContext) -> StepResult;
}

impl<F> StepHandler for F
where
    F: Fn(&mut StepContext) -> StepResult + Send + Sync,
{
    fn run(&self, ctx: &mut StepContext) -> StepResult {
        self(ctx)
    }
}

/// A single named step of a flow.
#[derive(Clone)]
pub struct StepDefinition {
    /// Unique step name
    pub name: String,

    /// Successor step names in declaration order
    pub next: Vec<String>,

    /// Artifact holding the sequence to fan out over
    pub foreach: Option<String>,

    /// Whether this step waits for every branch of a split
    pub join: bool,

    /// Re-attempt policy; `None` behaves as a single attempt
    pub retry: Option<RetryPolicy>,

    handler: Arc<dyn StepHandler>,
}

impl StepDefinition {
    /// Creates a terminal step running `handler`.
    pub fn new<F>(name: impl Into<String>, handler: F) -> Self
    where
        F: Fn(&mut StepContext) -> StepResult + Send + Sync + 'static,
    {
        Self::with_handler(name, Arc::new(handler))
    }

    /// Creates a step around an already shared handler.
    pub fn with_handler(name: impl Into<String>, handler: Arc<dyn StepHandler>) -> Self {
        Self {
            name: name.into().trim().to_string(),
            next: Vec::new(),
            foreach: None,
            join: false,
            retry: None,
            handler,
        }
    }

    /// Adds a successor.
    pub fn then(mut self, step: impl Into<String>) -> Self {
        self.next.push(step.into());
        self
    }

    /// Adds several successors, making this step a static branch.
    pub fn branch<I, S>(mut self, steps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.next.extend(steps.into_iter().map(Into::into));
        self
    }

    /// Fans out over the sequence stored in `source` into `step`.
    pub fn foreach(mut self, source: impl Into<String>, step: impl Into<String>) -> Self {
        self.foreach = Some(source.into());
        self.next.push(step.into());
        self
    }

    /// Marks the step as a join barrier.
    pub fn join(mut self) -> Self {
        self.join = true;
        self
    }

    /// Attaches a retry policy.
    pub fn retry(mut self, max_attempts: u32, backoff: Duration) -> Self {
        self.retry = Some(RetryPolicy::new(max_attempts, backoff));
        self
    }

    /// Effective retry policy.
    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry.unwrap_or_default()
    }

    pub fn handler(&self) -> &Arc<dyn StepHandler> {
        &self.handler
    }

    /// True for a foreach step or a step with several successors.
    pub fn is_split(&self) -> bool {
        self.foreach.is_some() || self.next.len() > 1
    }

    pub fn is_terminal(&self) -> bool {
        self.next.is_empty()
    }
}

impl fmt::Debug for StepDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StepDefinition")
            .field("name", &self.name)
            .field("next", &self.next)
            .field("foreach", &self.foreach)
            .field("join", &self.join)
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}

/// A complete flow: named steps plus declared parameters.
#[derive(Debug, Clone, Default)]
pub struct Flow {
    pub name: String,

    /// Steps in declaration order
    pub steps: Vec<StepDefinition>,

    /// Parameters accepted by the start step
    pub parameters: Vec<Parameter>,
}

impl Flow {
    /// Creates an empty flow.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            steps: Vec::new(),
            parameters: Vec::new(),
        }
    }

    /// Adds a step, builder style. Duplicates are reported by validation.
    pub fn with_step(mut self, step: StepDefinition) -> Self {
        self.steps.push(step);
        self
    }

    /// Declares a parameter, builder style.
    pub fn with_parameter(mut self, parameter: Parameter) -> Self {
        self.parameters.push(parameter);
        self
    }

    /// Gets a step by name.
    pub fn get_step(&self, name: &str) -> Option<&StepDefinition> {
        self.steps.iter().find(|s| s.name == name)
    }

    /// Gets a declared parameter by name.
    pub fn get_parameter(&self, name: &str) -> Option<&Parameter> {
        self.parameters.iter().find(|p| p.name == name)
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}
