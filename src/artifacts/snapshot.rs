//! Artifact Snapshots
//!
//! A snapshot is the ordered name → value mapping a task reads and writes.
//! Storage is shared behind an [`Arc`] and copied on the first write, so
//! handing a snapshot to several successors costs a reference count until
//! one of them mutates it.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Name under which a foreach child receives its element.
pub const INPUT_KEY: &str = "input";

/// Errors raised by typed artifact access.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ArtifactError {
    #[error("artifact '{0}' is not set")]
    Missing(String),

    #[error("artifact '{key}' has an unexpected type: {message}")]
    Type { key: String, message: String },
}

/// Copy-on-write mapping of artifact names to opaque values.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Snapshot {
    entries: Arc<BTreeMap<String, Value>>,
}

impl Snapshot {
    /// Creates an empty snapshot.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the value stored under `key`.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.entries.get(key)
    }

    /// Deserializes the value stored under `key` into `T`.
    pub fn require<T: DeserializeOwned>(&self, key: &str) -> Result<T, ArtifactError> {
        let value = self
            .get(key)
            .ok_or_else(|| ArtifactError::Missing(key.to_string()))?;

        serde_json::from_value(value.clone()).map_err(|e| ArtifactError::Type {
            key: key.to_string(),
            message: e.to_string(),
        })
    }

    /// Stores a value, returning the previous one.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        Arc::make_mut(&mut self.entries).insert(key.into(), value.into())
    }

    /// Removes a value, returning it if it was present.
    pub fn remove(&mut self, key: &str) -> Option<Value> {
        if !self.entries.contains_key(key) {
            return None;
        }
        Arc::make_mut(&mut self.entries).remove(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    /// Artifact names in key order.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// True when both snapshots still point at the same storage.
    pub fn shares_storage(&self, other: &Snapshot) -> bool {
        Arc::ptr_eq(&self.entries, &other.entries)
    }

    /// Converts the snapshot into a JSON object.
    pub fn to_json(&self) -> Value {
        Value::Object(
            self.entries
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        )
    }
}

impl<K: Into<String>, V: Into<Value>> FromIterator<(K, V)> for Snapshot {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let entries = iter
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();
        Self {
            entries: Arc::new(entries),
        }
    }
}
