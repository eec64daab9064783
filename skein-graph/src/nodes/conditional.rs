//! Routing-only nodes: conditional branch and labeled switch

use crate::error::Result;
use crate::node::{Node, NodeContext, NodeResult};
use crate::state::ExecutionState;
use async_trait::async_trait;
use std::sync::Arc;

/// Pure predicate over state.
pub type StatePredicate = Arc<dyn Fn(&ExecutionState) -> bool + Send + Sync>;

/// Pure selector over state, returning a case label.
pub type StateSelector = Arc<dyn Fn(&ExecutionState) -> String + Send + Sync>;

/// Two-way branch. Never executes; always picks exactly one successor,
/// or terminates the branch when the else target is omitted and the
/// predicate is false.
pub struct ConditionalNode {
    id: String,
    predicate: StatePredicate,
    when_true: String,
    when_false: Option<String>,
}

impl ConditionalNode {
    pub fn new<F>(id: &str, predicate: F, when_true: &str) -> Self
    where
        F: Fn(&ExecutionState) -> bool + Send + Sync + 'static,
    {
        Self {
            id: id.to_string(),
            predicate: Arc::new(predicate),
            when_true: when_true.to_string(),
            when_false: None,
        }
    }

    /// Default branch taken when the predicate is false.
    pub fn with_else(mut self, when_false: &str) -> Self {
        self.when_false = Some(when_false.to_string());
        self
    }
}

#[async_trait]
impl Node for ConditionalNode {
    fn id(&self) -> &str {
        &self.id
    }

    fn is_executable(&self) -> bool {
        false
    }

    async fn execute(&self, _state: &mut ExecutionState, _ctx: &NodeContext) -> Result<NodeResult> {
        // Routing-only: the scheduler skips execution entirely.
        Ok(NodeResult::empty())
    }

    fn next_nodes(&self, _result: &NodeResult, state: &ExecutionState) -> Option<Vec<String>> {
        if (self.predicate)(state) {
            Some(vec![self.when_true.clone()])
        } else {
            Some(self.when_false.iter().cloned().collect())
        }
    }

    fn declared_successors(&self) -> Option<Vec<String>> {
        let mut targets = vec![self.when_true.clone()];
        targets.extend(self.when_false.iter().cloned());
        Some(targets)
    }
}

/// Multi-way branch over labeled cases with a required default.
pub struct SwitchNode {
    id: String,
    selector: StateSelector,
    cases: Vec<(String, String)>,
    default: String,
}

impl SwitchNode {
    pub fn new<F>(id: &str, selector: F, default: &str) -> Self
    where
        F: Fn(&ExecutionState) -> String + Send + Sync + 'static,
    {
        Self {
            id: id.to_string(),
            selector: Arc::new(selector),
            cases: vec![],
            default: default.to_string(),
        }
    }

    /// Add a labeled case. Declaration order is the tie-break order.
    pub fn case(mut self, label: &str, target: &str) -> Self {
        self.cases.push((label.to_string(), target.to_string()));
        self
    }
}

#[async_trait]
impl Node for SwitchNode {
    fn id(&self) -> &str {
        &self.id
    }

    fn is_executable(&self) -> bool {
        false
    }

    async fn execute(&self, _state: &mut ExecutionState, _ctx: &NodeContext) -> Result<NodeResult> {
        Ok(NodeResult::empty())
    }

    fn next_nodes(&self, _result: &NodeResult, state: &ExecutionState) -> Option<Vec<String>> {
        let label = (self.selector)(state);
        let target = self
            .cases
            .iter()
            .find(|(case, _)| *case == label)
            .map(|(_, target)| target.clone())
            .unwrap_or_else(|| self.default.clone());
        Some(vec![target])
    }

    fn declared_successors(&self) -> Option<Vec<String>> {
        let mut targets: Vec<String> =
            self.cases.iter().map(|(_, target)| target.clone()).collect();
        targets.push(self.default.clone());
        Some(targets)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_conditional_picks_branch() {
        let node = ConditionalNode::new(
            "check",
            |state| state.get_bool("ready").unwrap_or(false),
            "go",
        )
        .with_else("wait");

        let ready = ExecutionState::new().with_entry("ready", true);
        assert_eq!(
            node.next_nodes(&NodeResult::empty(), &ready),
            Some(vec!["go".to_string()])
        );

        let not_ready = ExecutionState::new();
        assert_eq!(
            node.next_nodes(&NodeResult::empty(), &not_ready),
            Some(vec!["wait".to_string()])
        );
    }

    #[test]
    fn test_conditional_without_else_terminates() {
        let node = ConditionalNode::new("check", |_| false, "go");
        assert_eq!(node.next_nodes(&NodeResult::empty(), &ExecutionState::new()), Some(vec![]));
    }

    #[test]
    fn test_switch_cases_and_default() {
        let node = SwitchNode::new(
            "route",
            |state| state.get_str("lane").unwrap_or("?").to_string(),
            "fallback",
        )
        .case("fast", "fast_lane")
        .case("slow", "slow_lane");

        let fast = ExecutionState::new().with_entry("lane", "fast");
        assert_eq!(
            node.next_nodes(&NodeResult::empty(), &fast),
            Some(vec!["fast_lane".to_string()])
        );

        let unknown = ExecutionState::new().with_entry("lane", "bizarre");
        assert_eq!(
            node.next_nodes(&NodeResult::empty(), &unknown),
            Some(vec!["fallback".to_string()])
        );
    }

    #[test]
    fn test_routing_nodes_are_not_executable() {
        assert!(!ConditionalNode::new("c", |_| true, "t").is_executable());
        assert!(!SwitchNode::new("s", |_| String::new(), "d").is_executable());
    }
}
