//! Subgraph composition node
//!
//! Runs a child graph over a scoped copy of the parent state and merges
//! the child's writes back under a declared merge policy. The child
//! inherits the parent's cancellation.

use crate::error::Result;
use crate::executor::{ExecutionOptions, Executor};
use crate::graph::Graph;
use crate::merge::{merge, overlay_of, MergePolicies};
use crate::node::{Node, NodeContext, NodeResult};
use crate::state::ExecutionState;
use async_trait::async_trait;
use std::sync::Arc;

/// Executes a nested graph as a single node of the parent.
pub struct SubgraphNode {
    id: String,
    graph: Arc<Graph>,
    merge: MergePolicies,
    options: ExecutionOptions,
}

impl SubgraphNode {
    pub fn new(id: &str, graph: Arc<Graph>) -> Self {
        let options = ExecutionOptions {
            // The parent owns streaming and checkpointing; the child runs
            // quietly inside this node's step.
            enable_streaming: false,
            enable_checkpointing: false,
            ..ExecutionOptions::default()
        };
        Self { id: id.to_string(), graph, merge: MergePolicies::default(), options }
    }

    /// How the child's writes fold back into the parent state.
    pub fn with_merge(mut self, merge: MergePolicies) -> Self {
        self.merge = merge;
        self
    }

    /// Options for the child execution (step limits, timeouts).
    pub fn with_options(mut self, options: ExecutionOptions) -> Self {
        self.options = options;
        self
    }
}

#[async_trait]
impl Node for SubgraphNode {
    fn id(&self) -> &str {
        &self.id
    }

    async fn execute(&self, state: &mut ExecutionState, ctx: &NodeContext) -> Result<NodeResult> {
        let executor =
            Executor::with_options(&format!("{}:subgraph", self.id), self.options.clone());

        let scope = state.branch_scope();
        let child_final = executor
            .execute(self.graph.clone(), scope, ctx.cancellation.child_token())
            .await?;

        // Fold the child's contributions back into the parent scope.
        let overlay = overlay_of(state, &child_final);
        let outcome = merge(state, &overlay, &self.merge)?;
        for conflict in &outcome.conflicts {
            tracing::warn!(
                subgraph = %self.id,
                key = %conflict.key,
                reason = %conflict.reason,
                "subgraph merge conflict; parent value kept"
            );
        }
        let mut merged = outcome.state;
        for step in child_final.history() {
            merged.record_step(step.clone());
        }
        *state = merged;

        Ok(NodeResult::empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::merge::MergePolicy;
    use crate::node::FunctionNode;
    use tokio_util::sync::CancellationToken;

    fn child_graph() -> Arc<Graph> {
        Arc::new(
            Graph::builder()
                .add_node(FunctionNode::new("inner", |state| {
                    let n = state.get_int("count").unwrap_or(0);
                    state.set("count", n + 5)?;
                    state.set("child_ran", true)?;
                    Ok(None)
                }))
                .mark_terminal("inner")
                .build()
                .unwrap(),
        )
    }

    #[tokio::test]
    async fn test_child_writes_merge_into_parent() {
        let node = SubgraphNode::new("sub", child_graph())
            .with_merge(MergePolicies::new(MergePolicy::PreferOverlay));

        let mut state = ExecutionState::new().with_entry("count", 1i64);
        node.execute(&mut state, &NodeContext::new("parent")).await.unwrap();

        assert_eq!(state.get_int("count"), Some(6));
        assert_eq!(state.get_bool("child_ran"), Some(true));
        // Child steps surface in the parent history
        assert!(state.history().iter().any(|s| s.node_id == "inner"));
    }

    #[tokio::test]
    async fn test_parent_state_is_isolated_from_child_failures() {
        let failing = Arc::new(
            Graph::builder()
                .add_node(FunctionNode::new("boom", |_state| {
                    Err(crate::error::GraphError::InvalidGraph("boom".into()))
                }))
                .mark_terminal("boom")
                .build()
                .unwrap(),
        );
        let node = SubgraphNode::new("sub", failing);

        let mut state = ExecutionState::new().with_entry("count", 1i64);
        let err = node.execute(&mut state, &NodeContext::new("parent")).await;
        assert!(err.is_err());
        // No partial child writes leaked
        assert_eq!(state.get_int("count"), Some(1));
        assert!(!state.contains("child_ran"));
    }

    #[tokio::test]
    async fn test_child_inherits_cancellation() {
        let slow = Arc::new(
            Graph::builder()
                .add_node(FunctionNode::new_async("sleepy", |_state, ctx| async move {
                    tokio::select! {
                        _ = ctx.cancellation.cancelled() => {
                            Err(crate::error::GraphError::Canceled { node: Some("sleepy".into()) })
                        }
                        _ = tokio::time::sleep(std::time::Duration::from_secs(60)) => Ok(None),
                    }
                }))
                .mark_terminal("sleepy")
                .build()
                .unwrap(),
        );
        let node = SubgraphNode::new("sub", slow);

        let token = CancellationToken::new();
        let ctx = NodeContext::new("parent").with_cancellation(token.clone());
        token.cancel();

        let mut state = ExecutionState::new();
        let err = node.execute(&mut state, &ctx).await.unwrap_err();
        assert_eq!(err.kind(), skein_core::ErrorKind::Cancellation);
    }
}
