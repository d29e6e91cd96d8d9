//! Flow Parameters
//!
//! Declared parameters and the initial parameter mapping handed to the
//! start task. Values are plain JSON; a parameter's kind only drives how a
//! raw command-line string is coerced.

use std::collections::BTreeMap;
use std::fs;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Errors raised while coercing parameter values.
#[derive(Debug, Error)]
pub enum ParamError {
    #[error("expected NAME=VALUE, got '{0}'")]
    Malformed(String),

    #[error("parameter '{name}': cannot parse '{raw}' as {kind}")]
    Invalid {
        name: String,
        raw: String,
        kind: ParamKind,
    },

    #[error("parameter '{name}': cannot read file '{path}': {source}")]
    File {
        name: String,
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("unknown parameter kind '{0}'")]
    UnknownKind(String),
}

/// How a raw parameter string is interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParamKind {
    String,
    Int,
    Float,
    Bool,
    Json,
    /// Raw text content of the file at the given path
    File,
}

impl std::fmt::Display for ParamKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::String => "string",
            Self::Int => "int",
            Self::Float => "float",
            Self::Bool => "bool",
            Self::Json => "json",
            Self::File => "file",
        };
        f.write_str(name)
    }
}

impl FromStr for ParamKind {
    type Err = ParamError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "string" | "str" => Ok(Self::String),
            "int" | "integer" => Ok(Self::Int),
            "float" => Ok(Self::Float),
            "bool" | "boolean" => Ok(Self::Bool),
            "json" => Ok(Self::Json),
            "file" => Ok(Self::File),
            other => Err(ParamError::UnknownKind(other.to_string())),
        }
    }
}

/// A parameter declared by a flow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Parameter {
    pub name: String,

    #[serde(default = "default_kind")]
    pub kind: ParamKind,

    /// Value used when the parameter is not supplied
    #[serde(default)]
    pub default: Value,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub help: String,
}

fn default_kind() -> ParamKind {
    ParamKind::String
}

impl Parameter {
    pub fn new(name: impl Into<String>, kind: ParamKind, default: impl Into<Value>) -> Self {
        Self {
            name: name.into(),
            kind,
            default: default.into(),
            help: String::new(),
        }
    }

    pub fn with_help(mut self, help: impl Into<String>) -> Self {
        self.help = help.into();
        self
    }

    /// Converts a raw string into a value of this parameter's kind.
    ///
    /// File parameters accept either `path` or `@path`.
    pub fn coerce(&self, raw: &str) -> Result<Value, ParamError> {
        let invalid = || ParamError::Invalid {
            name: self.name.clone(),
            raw: raw.to_string(),
            kind: self.kind,
        };

        match self.kind {
            ParamKind::String => Ok(Value::String(raw.to_string())),
            ParamKind::Int => raw.trim().parse::<i64>().map(Value::from).map_err(|_| invalid()),
            ParamKind::Float => raw.trim().parse::<f64>().map(Value::from).map_err(|_| invalid()),
            ParamKind::Bool => match raw.trim().to_ascii_lowercase().as_str() {
                "true" | "yes" | "1" => Ok(Value::Bool(true)),
                "false" | "no" | "0" => Ok(Value::Bool(false)),
                _ => Err(invalid()),
            },
            ParamKind::Json => serde_json::from_str(raw).map_err(|_| invalid()),
            ParamKind::File => {
                let path = raw.strip_prefix('@').unwrap_or(raw);
                fs::read_to_string(path)
                    .map(Value::String)
                    .map_err(|source| ParamError::File {
                        name: self.name.clone(),
                        path: path.to_string(),
                        source,
                    })
            }
        }
    }
}

/// Initial parameter values supplied before the start task is created.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Parameters {
    values: BTreeMap<String, Value>,
}

impl Parameters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a value, builder style.
    pub fn with(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.insert(name, value);
        self
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        self.values.insert(name.into(), value.into())
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.values.get(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.values.iter()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Splits a `NAME=VALUE` argument.
pub fn split_assignment(arg: &str) -> Result<(&str, &str), ParamError> {
    match arg.split_once('=') {
        Some((name, value)) if !name.trim().is_empty() => Ok((name.trim(), value)),
        _ => Err(ParamError::Malformed(arg.to_string())),
    }
}

/// Coerces a raw value for a parameter the flow never declared.
///
/// Tries JSON first (numbers, booleans, lists) and falls back to a string.
pub fn infer_value(raw: &str) -> Value {
    if let Some(path) = raw.strip_prefix('@') {
        if let Ok(content) = fs::read_to_string(path) {
            return Value::String(content);
        }
    }
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}
