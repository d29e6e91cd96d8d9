//! Flow Manifests
//!
//! Loads flow declarations from YAML. A manifest names steps, their
//! successors, foreach sources, join flags and retry policies; step
//! behaviour is bound by handler name from a [`HandlerRegistry`].
//!
//! ```yaml
//! name: squares
//! parameters:
//!   - name: numbers
//!     kind: json
//!     default: [1, 2, 3]
//! steps:
//!   - name: start
//!     foreach: numbers
//!     next: [square]
//!   - name: square
//!     retry: { max_attempts: 3, backoff_seconds: 1 }
//!     next: [join]
//!   - name: join
//!     join: true
//!     next: [end]
//!   - name: end
//! ```

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::execution::step::StepContext;

use super::model::{Flow, StepDefinition, StepHandler, StepResult};
use super::params::Parameter;
use super::validator::{validate, ValidationError};

/// Errors raised while loading or saving a manifest.
#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("failed to read manifest '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse manifest YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("step '{step}' uses unknown handler '{handler}'")]
    UnknownHandler { step: String, handler: String },

    #[error("step '{step}' has an invalid retry policy: {reason}")]
    BadRetry { step: String, reason: String },

    #[error(transparent)]
    Invalid(#[from] ValidationError),
}

/// Named step handlers that manifests can refer to.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: BTreeMap<String, Arc<dyn StepHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a closure under `name`, replacing any previous handler.
    pub fn register<F>(&mut self, name: impl Into<String>, handler: F) -> &mut Self
    where
        F: Fn(&mut StepContext) -> StepResult + Send + Sync + 'static,
    {
        self.handlers.insert(name.into(), Arc::new(handler));
        self
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn StepHandler>> {
        self.handlers.get(name).cloned()
    }

    /// Registered handler names, sorted.
    pub fn names(&self) -> Vec<&str> {
        self.handlers.keys().map(String::as_str).collect()
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("handlers", &self.names())
            .finish()
    }
}

/// Retry block of a step manifest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryManifest {
    pub max_attempts: u32,

    #[serde(default)]
    pub backoff_seconds: f64,
}

/// One step as written in YAML.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepManifest {
    pub name: String,

    /// Registry key; defaults to the step name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub handler: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub next: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub foreach: Option<String>,

    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub join: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryManifest>,
}

/// A complete flow manifest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowManifest {
    pub name: String,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub parameters: Vec<Parameter>,

    pub steps: Vec<StepManifest>,
}

impl FlowManifest {
    /// Describes an existing flow. Handlers are named after their steps.
    pub fn from_flow(flow: &Flow) -> Self {
        let steps = flow
            .steps
            .iter()
            .map(|step| StepManifest {
                name: step.name.clone(),
                handler: None,
                next: step.next.clone(),
                foreach: step.foreach.clone(),
                join: step.join,
                retry: step.retry.map(|policy| RetryManifest {
                    max_attempts: policy.max_attempts,
                    backoff_seconds: policy.backoff.as_secs_f64(),
                }),
            })
            .collect();

        Self {
            name: flow.name.clone(),
            parameters: flow.parameters.clone(),
            steps,
        }
    }

    /// Binds every step to its handler and builds the flow.
    pub fn bind(&self, registry: &HandlerRegistry) -> Result<Flow, ManifestError> {
        let mut flow = Flow::new(&self.name);
        flow.parameters = self.parameters.clone();

        for manifest in &self.steps {
            let handler_name = manifest.handler.as_deref().unwrap_or(&manifest.name);
            let handler = registry
                .get(handler_name)
                .ok_or_else(|| ManifestError::UnknownHandler {
                    step: manifest.name.clone(),
                    handler: handler_name.to_string(),
                })?;

            let mut step = StepDefinition::with_handler(&manifest.name, handler);
            step.next = manifest.next.clone();
            step.foreach = manifest.foreach.clone();
            step.join = manifest.join;

            if let Some(retry) = &manifest.retry {
                let backoff = Duration::try_from_secs_f64(retry.backoff_seconds).map_err(|e| {
                    ManifestError::BadRetry {
                        step: manifest.name.clone(),
                        reason: e.to_string(),
                    }
                })?;
                step = step.retry(retry.max_attempts, backoff);
            }

            debug!("Bound step '{}' to handler '{}'", step.name, handler_name);
            flow.steps.push(step);
        }

        Ok(flow)
    }
}

/// Parses a YAML manifest and binds it to `registry`.
///
/// The resulting flow is validated before it is returned.
pub fn parse_flow(yaml: &str, registry: &HandlerRegistry) -> Result<Flow, ManifestError> {
    let manifest: FlowManifest = serde_yaml::from_str(yaml)?;
    info!(
        "Parsed manifest '{}' with {} steps",
        manifest.name,
        manifest.steps.len()
    );

    let flow = manifest.bind(registry)?;
    validate(&flow)?;
    Ok(flow)
}

/// Loads a flow from a YAML manifest file.
///
/// # Example
///
/// ```rust,no_run
/// use stepflow::flows;
/// use stepflow::workflow::load_flow;
///
/// fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let registry = flows::builtin("squares").map(|b| (b.registry)()).unwrap_or_default();
///     let flow = load_flow("squares.yaml", &registry)?;
///     println!("Loaded {} steps", flow.len());
///     Ok(())
/// }
/// ```
pub fn load_flow(path: impl AsRef<Path>, registry: &HandlerRegistry) -> Result<Flow, ManifestError> {
    let path = path.as_ref();
    info!("Loading flow manifest from: {}", path.display());

    let yaml = fs::read_to_string(path).map_err(|source| ManifestError::Io {
        path: path.display().to_string(),
        source,
    })?;

    debug!("YAML content loaded ({} bytes)", yaml.len());
    parse_flow(&yaml, registry)
}

/// Writes `manifest` as YAML.
pub fn save_manifest(manifest: &FlowManifest, path: impl AsRef<Path>) -> Result<(), ManifestError> {
    let path = path.as_ref();
    let yaml = serde_yaml::to_string(manifest)?;
    fs::write(path, yaml).map_err(|source| ManifestError::Io {
        path: path.display().to_string(),
        source,
    })?;

    info!("Saved flow manifest to {}", path.display());
    Ok(())
}
