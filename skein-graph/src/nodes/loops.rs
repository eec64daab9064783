//! Bounded loop nodes
//!
//! Loops are the only sanctioned back-edges in a graph. Both variants
//! keep their iteration cursor in engine metadata so a checkpoint
//! restore resumes mid-loop.

use crate::error::{GraphError, Result};
use crate::node::{Node, NodeContext, NodeResult};
use crate::nodes::conditional::StatePredicate;
use crate::state::ExecutionState;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;

fn counter_key(id: &str) -> String {
    format!("skein.loop.{id}.count")
}

fn started_key(id: &str) -> String {
    format!("skein.loop.{id}.entered")
}

fn done_key(id: &str) -> String {
    format!("skein.loop.{id}.done")
}

fn read_counter(state: &ExecutionState, id: &str) -> usize {
    state.metadata(&counter_key(id)).and_then(|v| v.parse().ok()).unwrap_or(0)
}

/// Re-enters its body while a predicate holds, up to a hard iteration
/// bound and an optional wall-clock bound.
pub struct WhileNode {
    id: String,
    predicate: StatePredicate,
    body: String,
    exit: Option<String>,
    max_iterations: usize,
    timeout: Option<Duration>,
}

impl WhileNode {
    pub fn new<F>(id: &str, predicate: F, body: &str, max_iterations: usize) -> Self
    where
        F: Fn(&ExecutionState) -> bool + Send + Sync + 'static,
    {
        Self {
            id: id.to_string(),
            predicate: Arc::new(predicate),
            body: body.to_string(),
            exit: None,
            max_iterations,
            timeout: None,
        }
    }

    /// Successor taken once the predicate turns false.
    pub fn with_exit(mut self, exit: &str) -> Self {
        self.exit = Some(exit.to_string());
        self
    }

    /// Wall-clock bound across all iterations.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

#[async_trait]
impl Node for WhileNode {
    fn id(&self) -> &str {
        &self.id
    }

    fn max_iterations(&self) -> Option<usize> {
        Some(self.max_iterations)
    }

    async fn execute(&self, state: &mut ExecutionState, _ctx: &NodeContext) -> Result<NodeResult> {
        if let Some(timeout) = self.timeout {
            let now = Utc::now();
            match state.metadata(&started_key(&self.id)) {
                Some(entered) => {
                    let entered: DateTime<Utc> = entered
                        .parse()
                        .map_err(|_| GraphError::InvalidGraph("bad loop timestamp".into()))?;
                    if (now - entered).to_std().unwrap_or_default() > timeout {
                        return Err(GraphError::Timeout {
                            scope: format!("loop '{}'", self.id),
                        });
                    }
                }
                None => state.set_engine_metadata(&started_key(&self.id), now.to_rfc3339()),
            }
        }

        if (self.predicate)(state) {
            let count = read_counter(state, &self.id);
            if count >= self.max_iterations {
                return Err(GraphError::LoopLimitExceeded {
                    node: self.id.clone(),
                    iterations: count,
                });
            }
            state.set_engine_metadata(&counter_key(&self.id), (count + 1).to_string());
        }
        Ok(NodeResult::empty())
    }

    fn next_nodes(&self, _result: &NodeResult, state: &ExecutionState) -> Option<Vec<String>> {
        if (self.predicate)(state) {
            Some(vec![self.body.clone()])
        } else {
            Some(self.exit.iter().cloned().collect())
        }
    }

    fn declared_successors(&self) -> Option<Vec<String>> {
        let mut targets = vec![self.body.clone()];
        targets.extend(self.exit.iter().cloned());
        Some(targets)
    }
}

/// Iterates a list from state, binding each item under a per-item key.
pub struct ForeachNode {
    id: String,
    collection_key: String,
    item_key: String,
    index_key: Option<String>,
    body: String,
    exit: Option<String>,
    max_iterations: usize,
}

impl ForeachNode {
    pub fn new(
        id: &str,
        collection_key: &str,
        item_key: &str,
        body: &str,
        max_iterations: usize,
    ) -> Self {
        Self {
            id: id.to_string(),
            collection_key: collection_key.to_string(),
            item_key: item_key.to_string(),
            index_key: None,
            body: body.to_string(),
            exit: None,
            max_iterations,
        }
    }

    pub fn with_exit(mut self, exit: &str) -> Self {
        self.exit = Some(exit.to_string());
        self
    }

    /// Also expose the current index under a state key.
    pub fn with_index_key(mut self, key: &str) -> Self {
        self.index_key = Some(key.to_string());
        self
    }
}

#[async_trait]
impl Node for ForeachNode {
    fn id(&self) -> &str {
        &self.id
    }

    fn max_iterations(&self) -> Option<usize> {
        Some(self.max_iterations)
    }

    fn input_keys(&self) -> &[String] {
        std::slice::from_ref(&self.collection_key)
    }

    async fn execute(&self, state: &mut ExecutionState, _ctx: &NodeContext) -> Result<NodeResult> {
        let items = state
            .try_get(&self.collection_key)?
            .as_list()
            .ok_or_else(|| GraphError::TypeMismatch {
                key: self.collection_key.clone(),
                expected: skein_core::ValueKind::List,
                actual: state
                    .get(&self.collection_key)
                    .map(skein_core::Value::kind)
                    .unwrap_or(skein_core::ValueKind::List),
            })?
            .to_vec();

        let index = read_counter(state, &self.id);
        let bound = items.len().min(self.max_iterations);
        if index >= bound {
            if index < items.len() {
                tracing::warn!(
                    node = %self.id,
                    index,
                    remaining = items.len() - index,
                    "foreach stopped at its iteration bound"
                );
            }
            state.set_engine_metadata(&done_key(&self.id), "true");
            return Ok(NodeResult::empty());
        }

        // Items may be heterogeneous, so bypass the scalar-type guard.
        state.replace(self.item_key.clone(), items[index].clone())?;
        if let Some(index_key) = &self.index_key {
            state.replace(index_key.clone(), index as i64)?;
        }
        state.set_engine_metadata(&counter_key(&self.id), (index + 1).to_string());
        Ok(NodeResult::empty())
    }

    fn next_nodes(&self, _result: &NodeResult, state: &ExecutionState) -> Option<Vec<String>> {
        // Execute marks the done flag on the visit that finds the cursor
        // at the bound; until then every visit bound a fresh item.
        if state.metadata(&done_key(&self.id)).is_some() {
            Some(self.exit.iter().cloned().collect())
        } else {
            Some(vec![self.body.clone()])
        }
    }

    fn declared_successors(&self) -> Option<Vec<String>> {
        let mut targets = vec![self.body.clone()];
        targets.extend(self.exit.iter().cloned());
        Some(targets)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use skein_core::Value;

    fn ctx() -> NodeContext {
        NodeContext::new("test")
    }

    #[tokio::test]
    async fn test_while_counts_and_fails_at_bound() {
        let node = WhileNode::new("w", |_| true, "body", 3);
        let mut state = ExecutionState::new();

        for expected in 1..=3usize {
            node.execute(&mut state, &ctx()).await.unwrap();
            assert_eq!(read_counter(&state, "w"), expected);
            assert_eq!(
                node.next_nodes(&NodeResult::empty(), &state),
                Some(vec!["body".to_string()])
            );
        }

        let err = node.execute(&mut state, &ctx()).await.unwrap_err();
        assert!(matches!(err, GraphError::LoopLimitExceeded { iterations: 3, .. }));
    }

    #[tokio::test]
    async fn test_while_exits_when_predicate_clears() {
        let node = WhileNode::new("w", |s| s.get_int("n").unwrap_or(0) < 2, "body", 10)
            .with_exit("done");
        let mut state = ExecutionState::new().with_entry("n", 0i64);

        node.execute(&mut state, &ctx()).await.unwrap();
        state.set("n", 5i64).unwrap();
        assert_eq!(
            node.next_nodes(&NodeResult::empty(), &state),
            Some(vec!["done".to_string()])
        );
    }

    #[tokio::test]
    async fn test_foreach_binds_items_in_order() {
        let node = ForeachNode::new("f", "items", "item", "body", 10)
            .with_exit("done")
            .with_index_key("i");
        let mut state = ExecutionState::new().with_entry(
            "items",
            Value::List(vec![Value::from("a"), Value::from("b")]),
        );

        node.execute(&mut state, &ctx()).await.unwrap();
        assert_eq!(state.get_str("item"), Some("a"));
        assert_eq!(state.get_int("i"), Some(0));
        assert_eq!(
            node.next_nodes(&NodeResult::empty(), &state),
            Some(vec!["body".to_string()])
        );

        node.execute(&mut state, &ctx()).await.unwrap();
        assert_eq!(state.get_str("item"), Some("b"));

        // Collection exhausted
        node.execute(&mut state, &ctx()).await.unwrap();
        assert_eq!(
            node.next_nodes(&NodeResult::empty(), &state),
            Some(vec!["done".to_string()])
        );
    }

    #[tokio::test]
    async fn test_foreach_requires_a_list() {
        let node = ForeachNode::new("f", "items", "item", "body", 10);
        let mut state = ExecutionState::new().with_entry("items", 42i64);
        assert!(node.execute(&mut state, &ctx()).await.is_err());
    }
}
