//! Deterministic merging of parallel branch states
//!
//! At a join point the engine folds branch overlays into the base state
//! left to right: `merge(merge(base, o1), o2)`. Commutativity holds only
//! for `PreferBase`, `FailOnConflict`, and `Reduce` over commutative
//! reducers; everything else is order-dependent by design of the caller's
//! declared branch order.

use crate::error::{GraphError, Result};
use crate::state::ExecutionState;
use skein_core::Value;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Custom per-key reducer.
pub type MergeFn = Arc<dyn Fn(&Value, &Value) -> Result<Value> + Send + Sync>;

/// How a key conflict between base and overlay resolves.
#[derive(Clone)]
pub enum MergePolicy {
    /// Keep the base value
    PreferBase,
    /// Take the overlay value
    PreferOverlay,
    /// Sum numbers, concatenate lists, shallow-merge maps; anything else
    /// is a conflict
    Reduce,
    /// Any differing write is a hard error
    FailOnConflict,
    /// Caller-supplied reducer
    Custom(MergeFn),
}

impl MergePolicy {
    /// Stable name recorded in [`MergeOutcome::applied`].
    pub fn name(&self) -> &'static str {
        match self {
            Self::PreferBase => "prefer_base",
            Self::PreferOverlay => "prefer_overlay",
            Self::Reduce => "reduce",
            Self::FailOnConflict => "fail_on_conflict",
            Self::Custom(_) => "custom",
        }
    }
}

impl std::fmt::Debug for MergePolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Per-key policy table with a default.
#[derive(Debug, Clone)]
pub struct MergePolicies {
    default: MergePolicy,
    per_key: BTreeMap<String, MergePolicy>,
}

impl MergePolicies {
    pub fn new(default: MergePolicy) -> Self {
        Self { default, per_key: BTreeMap::new() }
    }

    /// Override the policy for one key.
    pub fn with_key(mut self, key: impl Into<String>, policy: MergePolicy) -> Self {
        self.per_key.insert(key.into(), policy);
        self
    }

    /// Policy applied to `key`.
    pub fn resolve(&self, key: &str) -> &MergePolicy {
        self.per_key.get(key).unwrap_or(&self.default)
    }
}

impl Default for MergePolicies {
    fn default() -> Self {
        Self::new(MergePolicy::PreferOverlay)
    }
}

/// A key the policy could not reconcile.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeConflict {
    pub key: String,
    pub policy: &'static str,
    pub reason: String,
}

/// Result of merging one overlay into a base state.
#[derive(Debug)]
pub struct MergeOutcome {
    /// The merged state
    pub state: ExecutionState,
    /// Keys left at their base value because the policy could not combine
    pub conflicts: Vec<MergeConflict>,
    /// Policy applied per conflicting key
    pub applied: BTreeMap<String, &'static str>,
}

/// Extract the overlay a derived state contributes relative to its base:
/// keys that are new or whose value changed. Joins and subgraph returns
/// merge overlays, never whole derived states, so `Reduce` counts each
/// branch's contribution exactly once.
pub fn overlay_of(base: &ExecutionState, derived: &ExecutionState) -> ExecutionState {
    let mut overlay = ExecutionState::new();
    for (key, value) in derived.entries() {
        if base.get(key) != Some(value) {
            // Fresh state, no prior type constraint to violate
            let _ = overlay.replace(key.clone(), value.clone());
        }
    }
    overlay
}

/// Merge `overlay` into `base` under the per-key policies.
///
/// The overlay is a set of contributions: keys present on one side only
/// carry over unchanged, and `Reduce`/`Custom` combine every overlay key
/// with its base value; an overlay entry equal to the base still counts
/// as a contribution. For the prefer/fail policies equal values are
/// no-ops. `FailOnConflict` errors on the first differing key; an
/// unreducible pair is recorded in [`MergeOutcome::conflicts`] and keeps
/// the base value.
pub fn merge(
    base: &ExecutionState,
    overlay: &ExecutionState,
    policies: &MergePolicies,
) -> Result<MergeOutcome> {
    let mut state = base.clone();
    let mut conflicts = vec![];
    let mut applied = BTreeMap::new();

    for (key, theirs) in overlay.entries() {
        let Some(ours) = base.get(key) else {
            state.replace(key.clone(), theirs.clone())?;
            continue;
        };

        let policy = policies.resolve(key);
        match policy {
            MergePolicy::PreferBase => {
                if ours != theirs {
                    applied.insert(key.clone(), policy.name());
                }
            }
            MergePolicy::PreferOverlay => {
                if ours != theirs {
                    applied.insert(key.clone(), policy.name());
                    state.replace(key.clone(), theirs.clone())?;
                }
            }
            MergePolicy::FailOnConflict => {
                if ours != theirs {
                    return Err(GraphError::MergeConflict(key.clone()));
                }
            }
            MergePolicy::Reduce => {
                applied.insert(key.clone(), policy.name());
                match reduce(ours, theirs) {
                    Ok(reduced) => state.replace(key.clone(), reduced)?,
                    Err(reason) => conflicts.push(MergeConflict {
                        key: key.clone(),
                        policy: policy.name(),
                        reason,
                    }),
                }
            }
            MergePolicy::Custom(f) => {
                applied.insert(key.clone(), policy.name());
                let combined = f(ours, theirs)?;
                state.replace(key.clone(), combined)?;
            }
        }
    }

    Ok(MergeOutcome { state, conflicts, applied })
}

/// The associative/commutative reducer behind [`MergePolicy::Reduce`].
fn reduce(ours: &Value, theirs: &Value) -> std::result::Result<Value, String> {
    match (ours, theirs) {
        (Value::Int(a), Value::Int(b)) => Ok(Value::Int(a + b)),
        (Value::Float(_), _) | (_, Value::Float(_))
            if ours.as_float().is_some() && theirs.as_float().is_some() =>
        {
            // Int/Float mixes widen to float
            let (a, b) = (ours.as_float().unwrap_or(0.0), theirs.as_float().unwrap_or(0.0));
            Ok(Value::Float(a + b))
        }
        (Value::List(a), Value::List(b)) => {
            let mut items = a.clone();
            items.extend(b.iter().cloned());
            Ok(Value::List(items))
        }
        (Value::Map(a), Value::Map(b)) => {
            let mut entries = a.clone();
            for (k, v) in b {
                entries.insert(k.clone(), v.clone());
            }
            Ok(Value::Map(entries))
        }
        _ => Err(format!("cannot reduce {} with {}", ours.kind(), theirs.kind())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state_with(entries: &[(&str, Value)]) -> ExecutionState {
        let mut state = ExecutionState::new();
        for (key, value) in entries {
            state.replace(*key, value.clone()).unwrap();
        }
        state
    }

    #[test]
    fn test_disjoint_keys_union() {
        let base = state_with(&[("a", Value::Int(1))]);
        let overlay = state_with(&[("b", Value::Int(2))]);

        let outcome = merge(&base, &overlay, &MergePolicies::default()).unwrap();
        assert_eq!(outcome.state.get_int("a"), Some(1));
        assert_eq!(outcome.state.get_int("b"), Some(2));
        assert!(outcome.conflicts.is_empty());
        assert!(outcome.applied.is_empty());
    }

    #[test]
    fn test_prefer_base_and_overlay() {
        let base = state_with(&[("k", Value::Int(1))]);
        let overlay = state_with(&[("k", Value::Int(9))]);

        let kept = merge(&base, &overlay, &MergePolicies::new(MergePolicy::PreferBase)).unwrap();
        assert_eq!(kept.state.get_int("k"), Some(1));

        let taken =
            merge(&base, &overlay, &MergePolicies::new(MergePolicy::PreferOverlay)).unwrap();
        assert_eq!(taken.state.get_int("k"), Some(9));
        assert_eq!(taken.applied.get("k"), Some(&"prefer_overlay"));
    }

    #[test]
    fn test_reduce_sums_and_concatenates() {
        let base = state_with(&[
            ("count", Value::Int(2)),
            ("tags", Value::List(vec![Value::from("a")])),
        ]);
        let overlay = state_with(&[
            ("count", Value::Int(3)),
            ("tags", Value::List(vec![Value::from("b")])),
        ]);

        let outcome = merge(&base, &overlay, &MergePolicies::new(MergePolicy::Reduce)).unwrap();
        assert_eq!(outcome.state.get_int("count"), Some(5));
        assert_eq!(
            outcome.state.get("tags").and_then(Value::as_list).map(<[Value]>::len),
            Some(2)
        );
    }

    #[test]
    fn test_reduce_shallow_map_merge() {
        let mut a = BTreeMap::new();
        a.insert("x".to_string(), Value::Int(1));
        let mut b = BTreeMap::new();
        b.insert("y".to_string(), Value::Int(2));

        let base = state_with(&[("m", Value::Map(a))]);
        let overlay = state_with(&[("m", Value::Map(b))]);

        let outcome = merge(&base, &overlay, &MergePolicies::new(MergePolicy::Reduce)).unwrap();
        let merged = outcome.state.get("m").and_then(Value::as_map).unwrap();
        assert_eq!(merged.len(), 2);
    }

    #[test]
    fn test_reduce_incompatible_records_conflict() {
        let base = state_with(&[("k", Value::from("text"))]);
        let overlay = state_with(&[("k", Value::from(true))]);

        let outcome = merge(&base, &overlay, &MergePolicies::new(MergePolicy::Reduce)).unwrap();
        assert_eq!(outcome.conflicts.len(), 1);
        assert_eq!(outcome.conflicts[0].key, "k");
        // Base value retained
        assert_eq!(outcome.state.get_str("k"), Some("text"));
    }

    #[test]
    fn test_fail_on_conflict() {
        let base = state_with(&[("k", Value::Int(1))]);
        let overlay = state_with(&[("k", Value::Int(2))]);

        let err =
            merge(&base, &overlay, &MergePolicies::new(MergePolicy::FailOnConflict)).unwrap_err();
        assert!(matches!(err, GraphError::MergeConflict(key) if key == "k"));
    }

    #[test]
    fn test_equal_values_are_not_conflicts() {
        let base = state_with(&[("k", Value::Int(1))]);
        let overlay = state_with(&[("k", Value::Int(1))]);

        let outcome =
            merge(&base, &overlay, &MergePolicies::new(MergePolicy::FailOnConflict)).unwrap();
        assert_eq!(outcome.state.get_int("k"), Some(1));
    }

    #[test]
    fn test_custom_reducer() {
        let max: MergeFn = Arc::new(|a, b| {
            let (x, y) = (a.as_float().unwrap_or(f64::MIN), b.as_float().unwrap_or(f64::MIN));
            Ok(Value::Float(x.max(y)))
        });
        let policies = MergePolicies::new(MergePolicy::PreferBase)
            .with_key("score", MergePolicy::Custom(max));

        let base = state_with(&[("score", Value::Float(0.4))]);
        let overlay = state_with(&[("score", Value::Float(0.9))]);

        let outcome = merge(&base, &overlay, &policies).unwrap();
        assert_eq!(outcome.state.get_float("score"), Some(0.9));
    }

    #[test]
    fn test_overlay_contains_only_contributions() {
        let base = state_with(&[("count", Value::Int(0)), ("name", Value::from("run"))]);
        let mut derived = base.clone();
        derived.set("count", 1i64).unwrap();
        derived.set("fresh", true).unwrap();

        let overlay = overlay_of(&base, &derived);
        assert!(overlay.contains("count"));
        assert!(overlay.contains("fresh"));
        assert!(!overlay.contains("name"));
    }

    #[test]
    fn test_reduce_counts_each_branch_once() {
        // Two branches each increment the same counter from 0 to 1; their
        // overlays must sum to 2 at the join even though the values match.
        let base = state_with(&[("count", Value::Int(0))]);
        let mut b1 = base.clone();
        b1.set("count", 1i64).unwrap();
        let mut b2 = base.clone();
        b2.set("count", 1i64).unwrap();

        let policies = MergePolicies::new(MergePolicy::Reduce);
        let after_first =
            merge(&base, &overlay_of(&base, &b1), &policies).unwrap().state;
        let after_second =
            merge(&after_first, &overlay_of(&base, &b2), &policies).unwrap().state;
        assert_eq!(after_second.get_int("count"), Some(2));
    }

    #[test]
    fn test_reduce_commutes_for_sums() {
        let base = state_with(&[("n", Value::Int(1))]);
        let o1 = state_with(&[("n", Value::Int(10))]);
        let o2 = state_with(&[("n", Value::Int(100))]);
        let policies = MergePolicies::new(MergePolicy::Reduce);

        let left = merge(&merge(&base, &o1, &policies).unwrap().state, &o2, &policies).unwrap();
        let right = merge(&merge(&base, &o2, &policies).unwrap().state, &o1, &policies).unwrap();
        assert_eq!(left.state.get_int("n"), right.state.get_int("n"));
        assert_eq!(left.state.get_int("n"), Some(111));
    }
}
