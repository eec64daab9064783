//! Remote subgraph placeholder
//!
//! Distributed execution is out of scope; this node is the hook a
//! remote runner plugs into. Without a bound runner it fails cleanly.

use crate::error::{GraphError, Result};
use crate::node::{Node, NodeContext, NodeResult};
use crate::state::ExecutionState;
use async_trait::async_trait;
use skein_core::{ErrorContext, ErrorKind, ValueMap};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Executes a graph hosted elsewhere and returns its output entries.
#[async_trait]
pub trait RemoteSubgraphRunner: Send + Sync {
    async fn run(
        &self,
        graph_ref: &str,
        state: &ExecutionState,
        cancellation: &CancellationToken,
    ) -> Result<ValueMap>;
}

/// Placeholder node for a subgraph that runs on another machine.
pub struct RemoteSubgraphNode {
    id: String,
    graph_ref: String,
    runner: Option<Arc<dyn RemoteSubgraphRunner>>,
}

impl RemoteSubgraphNode {
    pub fn new(id: &str, graph_ref: &str) -> Self {
        Self { id: id.to_string(), graph_ref: graph_ref.to_string(), runner: None }
    }

    pub fn with_runner(mut self, runner: Arc<dyn RemoteSubgraphRunner>) -> Self {
        self.runner = Some(runner);
        self
    }
}

#[async_trait]
impl Node for RemoteSubgraphNode {
    fn id(&self) -> &str {
        &self.id
    }

    fn description(&self) -> &str {
        &self.graph_ref
    }

    async fn execute(&self, state: &mut ExecutionState, ctx: &NodeContext) -> Result<NodeResult> {
        let Some(runner) = &self.runner else {
            return Err(GraphError::NodeFailed {
                node: self.id.clone(),
                context: ErrorContext::new(
                    ErrorKind::NodeExecution,
                    format!("no remote runner bound for '{}'", self.graph_ref),
                ),
            });
        };

        let outputs = runner.run(&self.graph_ref, state, &ctx.cancellation).await?;
        for (key, value) in outputs {
            state.replace(key, value)?;
        }
        Ok(NodeResult::empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use skein_core::Value;

    struct StubRunner;

    #[async_trait]
    impl RemoteSubgraphRunner for StubRunner {
        async fn run(
            &self,
            graph_ref: &str,
            _state: &ExecutionState,
            _cancellation: &CancellationToken,
        ) -> Result<ValueMap> {
            let mut outputs = ValueMap::new();
            outputs.insert("remote_ran".to_string(), Value::from(graph_ref));
            Ok(outputs)
        }
    }

    #[tokio::test]
    async fn test_unbound_runner_fails() {
        let node = RemoteSubgraphNode::new("remote", "billing/v2");
        let mut state = ExecutionState::new();
        let err = node.execute(&mut state, &NodeContext::new("x")).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NodeExecution);
    }

    #[tokio::test]
    async fn test_bound_runner_applies_outputs() {
        let node =
            RemoteSubgraphNode::new("remote", "billing/v2").with_runner(Arc::new(StubRunner));
        let mut state = ExecutionState::new();
        node.execute(&mut state, &NodeContext::new("x")).await.unwrap();
        assert_eq!(state.get_str("remote_ran"), Some("billing/v2"));
    }
}
