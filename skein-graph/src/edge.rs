//! Edges and predicate helpers
//!
//! Edges are owned by the graph and evaluated in declared order; the
//! first unconditional edge or satisfied predicate wins.

use crate::state::ExecutionState;
use skein_core::Value;
use std::sync::Arc;

/// Pure, side-effect-free predicate over state.
pub type EdgePredicate = Arc<dyn Fn(&ExecutionState) -> bool + Send + Sync>;

/// Directed connection between two nodes.
#[derive(Clone)]
pub struct Edge {
    pub from: String,
    pub to: String,
    pub predicate: Option<EdgePredicate>,
    pub label: Option<String>,
}

impl Edge {
    pub fn new(from: &str, to: &str) -> Self {
        Self { from: from.to_string(), to: to.to_string(), predicate: None, label: None }
    }

    pub fn with_predicate<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&ExecutionState) -> bool + Send + Sync + 'static,
    {
        self.predicate = Some(Arc::new(predicate));
        self
    }

    pub fn with_label(mut self, label: &str) -> Self {
        self.label = Some(label.to_string());
        self
    }

    /// Whether this edge admits the given state.
    pub fn admits(&self, state: &ExecutionState) -> bool {
        self.predicate.as_ref().is_none_or(|p| p(state))
    }

    /// True when the edge has no predicate.
    pub fn is_unconditional(&self) -> bool {
        self.predicate.is_none()
    }
}

impl std::fmt::Debug for Edge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Edge")
            .field("from", &self.from)
            .field("to", &self.to)
            .field("conditional", &self.predicate.is_some())
            .field("label", &self.label)
            .finish()
    }
}

/// Constructors for common predicate shapes.
pub struct Predicates;

impl Predicates {
    /// Key equals an expected value.
    pub fn key_equals(key: &str, expected: impl Into<Value>) -> impl Fn(&ExecutionState) -> bool + Send + Sync + Clone {
        let key = key.to_string();
        let expected = expected.into();
        move |state: &ExecutionState| state.get(&key) == Some(&expected)
    }

    /// Boolean key is set and true.
    pub fn flag_set(key: &str) -> impl Fn(&ExecutionState) -> bool + Send + Sync + Clone {
        let key = key.to_string();
        move |state: &ExecutionState| state.get_bool(&key).unwrap_or(false)
    }

    /// Numeric key is below a threshold (missing counts as zero).
    pub fn counter_below(key: &str, max: i64) -> impl Fn(&ExecutionState) -> bool + Send + Sync + Clone {
        let key = key.to_string();
        move |state: &ExecutionState| state.get_int(&key).unwrap_or(0) < max
    }

    /// Key is present at all.
    pub fn has_key(key: &str) -> impl Fn(&ExecutionState) -> bool + Send + Sync + Clone {
        let key = key.to_string();
        move |state: &ExecutionState| state.contains(&key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unconditional_edge_admits_everything() {
        let edge = Edge::new("a", "b");
        assert!(edge.admits(&ExecutionState::new()));
        assert!(edge.is_unconditional());
    }

    #[test]
    fn test_predicated_edge() {
        let edge = Edge::new("a", "b").with_predicate(Predicates::flag_set("go"));
        assert!(!edge.admits(&ExecutionState::new()));
        assert!(edge.admits(&ExecutionState::new().with_entry("go", true)));
    }

    #[test]
    fn test_key_equals() {
        let p = Predicates::key_equals("lane", "fast");
        assert!(p(&ExecutionState::new().with_entry("lane", "fast")));
        assert!(!p(&ExecutionState::new().with_entry("lane", "slow")));
        assert!(!p(&ExecutionState::new()));
    }

    #[test]
    fn test_counter_below() {
        let p = Predicates::counter_below("n", 3);
        assert!(p(&ExecutionState::new()));
        assert!(p(&ExecutionState::new().with_entry("n", 2i64)));
        assert!(!p(&ExecutionState::new().with_entry("n", 3i64)));
    }
}
