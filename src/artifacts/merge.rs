//! Artifact Merge
//!
//! Combines the snapshots arriving at a join. Keys that agree across every
//! snapshot defining them carry forward; keys with differing values are left
//! out of the merged snapshot and reported as conflicts for the join handler
//! to resolve.

use std::collections::BTreeMap;

use log::debug;
use serde_json::Value;

use super::snapshot::Snapshot;

/// Per-branch values of a conflicting key, aligned with the merge inputs.
pub type Conflicts = BTreeMap<String, Vec<Option<Value>>>;

/// Result of merging an ordered sequence of snapshots.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MergeOutcome {
    /// Artifacts that merged without disagreement
    pub merged: Snapshot,
    /// Keys defined differently by at least two inputs
    pub conflicts: Conflicts,
}

impl MergeOutcome {
    pub fn has_conflicts(&self) -> bool {
        !self.conflicts.is_empty()
    }
}

/// Merges `snapshots` in order.
pub fn merge(snapshots: &[Snapshot]) -> MergeOutcome {
    let mut candidates: BTreeMap<&str, Vec<Option<&Value>>> = BTreeMap::new();

    for (position, snapshot) in snapshots.iter().enumerate() {
        for (key, value) in snapshot.iter() {
            candidates
                .entry(key)
                .or_insert_with(|| vec![None; snapshots.len()])[position] = Some(value);
        }
    }

    let mut outcome = MergeOutcome::default();

    for (key, values) in candidates {
        let mut defined = values.iter().flatten();
        let Some(first) = defined.next() else {
            continue;
        };

        if defined.all(|value| value == first) {
            outcome.merged.set(key, (*first).clone());
        } else {
            debug!("Artifact '{}' conflicts across {} inputs", key, snapshots.len());
            outcome.conflicts.insert(
                key.to_string(),
                values.into_iter().map(|v| v.cloned()).collect(),
            );
        }
    }

    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn snapshot(pairs: &[(&str, Value)]) -> Snapshot {
        pairs.iter().map(|(k, v)| (*k, v.clone())).collect()
    }

    #[test]
    fn test_disjoint_keys_merge() {
        let a = snapshot(&[("a", json!(1))]);
        let b = snapshot(&[("b", json!(2))]);

        let outcome = merge(&[a, b]);
        assert!(!outcome.has_conflicts());
        assert_eq!(outcome.merged.get("a"), Some(&json!(1)));
        assert_eq!(outcome.merged.get("b"), Some(&json!(2)));
    }

    #[test]
    fn test_shared_equal_values_merge() {
        let a = snapshot(&[("x", json!(5)), ("a", json!(1))]);
        let b = snapshot(&[("x", json!(5)), ("b", json!(2))]);

        let outcome = merge(&[a, b]);
        assert!(!outcome.has_conflicts());
        assert_eq!(outcome.merged.get("x"), Some(&json!(5)));
        assert_eq!(outcome.merged.len(), 3);
    }

    #[test]
    fn test_conflict_is_surfaced_not_resolved() {
        let a = snapshot(&[("x", json!(1))]);
        let b = snapshot(&[("y", json!(0))]);
        let c = snapshot(&[("x", json!(2))]);

        let outcome = merge(&[a, b, c]);
        assert!(outcome.has_conflicts());
        assert!(!outcome.merged.contains("x"));
        assert_eq!(
            outcome.conflicts.get("x"),
            Some(&vec![Some(json!(1)), None, Some(json!(2))])
        );
        assert_eq!(outcome.merged.get("y"), Some(&json!(0)));
    }

    #[test]
    fn test_merge_commutative_without_collisions() {
        let a = snapshot(&[("a", json!([1, 2])), ("shared", json!("s"))]);
        let b = snapshot(&[("b", json!({"k": true})), ("shared", json!("s"))]);

        let ab = merge(&[a.clone(), b.clone()]);
        let ba = merge(&[b, a]);
        assert_eq!(ab.merged, ba.merged);
        assert!(ab.conflicts.is_empty() && ba.conflicts.is_empty());
    }

    #[test]
    fn test_merge_empty_input() {
        let outcome = merge(&[]);
        assert!(outcome.merged.is_empty());
        assert!(!outcome.has_conflicts());
    }
}
