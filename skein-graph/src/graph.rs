//! Graph construction
//!
//! A [`GraphBuilder`] accumulates nodes and edges and validates into an
//! immutable [`Graph`]. Execution only ever sees the built form, so
//! nothing can mutate a graph after a run has begun.

use crate::edge::Edge;
use crate::error::{GraphError, Result};
use crate::node::{Node, NodeRef};
use crate::state::ExecutionState;
use crate::validator;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// Structural mutations reported to the builder's hook.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GraphMutation {
    NodeAdded(String),
    EdgeAdded { from: String, to: String },
    StartSet(String),
    TerminalMarked(String),
}

/// Observer invoked on every builder mutation.
pub type MutationHook = Arc<dyn Fn(&GraphMutation) + Send + Sync>;

/// Accumulates a graph under construction.
#[derive(Default)]
pub struct GraphBuilder {
    pub(crate) nodes: HashMap<String, NodeRef>,
    pub(crate) edges: Vec<Edge>,
    pub(crate) start: Option<String>,
    pub(crate) terminals: HashSet<String>,
    hook: Option<MutationHook>,
}

impl GraphBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Observe structural mutations (used by tooling and tests).
    pub fn with_mutation_hook<F>(mut self, hook: F) -> Self
    where
        F: Fn(&GraphMutation) + Send + Sync + 'static,
    {
        self.hook = Some(Arc::new(hook));
        self
    }

    /// Add a node. The first node added becomes the start node unless one
    /// is set explicitly.
    pub fn add_node<N: Node + 'static>(self, node: N) -> Self {
        self.add_node_ref(Arc::new(node))
    }

    /// Add an already-shared node.
    pub fn add_node_ref(mut self, node: NodeRef) -> Self {
        let id = node.id().to_string();
        if self.start.is_none() {
            self.start = Some(id.clone());
        }
        self.notify(&GraphMutation::NodeAdded(id.clone()));
        self.nodes.insert(id, node);
        self
    }

    /// Add an unconditional edge.
    pub fn add_edge(self, from: &str, to: &str) -> Self {
        self.add_edge_spec(Edge::new(from, to))
    }

    /// Add a predicated edge.
    pub fn add_edge_if<F>(self, from: &str, to: &str, predicate: F) -> Self
    where
        F: Fn(&ExecutionState) -> bool + Send + Sync + 'static,
    {
        self.add_edge_spec(Edge::new(from, to).with_predicate(predicate))
    }

    /// Add a fully-specified edge.
    pub fn add_edge_spec(mut self, edge: Edge) -> Self {
        self.notify(&GraphMutation::EdgeAdded { from: edge.from.clone(), to: edge.to.clone() });
        self.edges.push(edge);
        self
    }

    /// Declare the start node explicitly.
    pub fn set_start(mut self, id: &str) -> Self {
        self.notify(&GraphMutation::StartSet(id.to_string()));
        self.start = Some(id.to_string());
        self
    }

    /// Mark a node as an intended end of the workflow; dead ends that are
    /// not terminal produce validator warnings.
    pub fn mark_terminal(mut self, id: &str) -> Self {
        self.notify(&GraphMutation::TerminalMarked(id.to_string()));
        self.terminals.insert(id.to_string());
        self
    }

    /// Validate and freeze into an executable graph. Structural errors
    /// fail the build; warnings are logged.
    pub fn build(self) -> Result<Graph> {
        let report = validator::check(&self, None);
        for warning in &report.warnings {
            tracing::warn!(%warning, "graph validation warning");
        }
        if let Some(error) = report.errors.into_iter().next() {
            return Err(GraphError::InvalidGraph(error));
        }

        let start = self.start.ok_or(GraphError::MissingStartNode)?;
        Ok(Graph {
            nodes: self.nodes,
            edges: self.edges,
            start,
            terminals: self.terminals,
        })
    }

    fn notify(&self, mutation: &GraphMutation) {
        if let Some(hook) = &self.hook {
            hook(mutation);
        }
    }

    pub(crate) fn view(&self) -> validator::GraphView<'_> {
        validator::GraphView {
            nodes: &self.nodes,
            edges: &self.edges,
            start: self.start.as_deref(),
            terminals: &self.terminals,
        }
    }
}

/// An immutable, validated graph, shareable across concurrent
/// executions.
pub struct Graph {
    nodes: HashMap<String, NodeRef>,
    edges: Vec<Edge>,
    start: String,
    terminals: HashSet<String>,
}

impl Graph {
    /// Start building a graph.
    pub fn builder() -> GraphBuilder {
        GraphBuilder::new()
    }

    pub fn start(&self) -> &str {
        &self.start
    }

    pub fn node(&self, id: &str) -> Result<&NodeRef> {
        self.nodes.get(id).ok_or_else(|| GraphError::NodeNotFound(id.to_string()))
    }

    pub fn contains(&self, id: &str) -> bool {
        self.nodes.contains_key(id)
    }

    pub fn node_ids(&self) -> impl Iterator<Item = &str> {
        self.nodes.keys().map(String::as_str)
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn edges(&self) -> &[Edge] {
        &self.edges
    }

    /// Outgoing edges of a node, in declared order.
    pub fn edges_from(&self, id: &str) -> impl Iterator<Item = &Edge> {
        self.edges.iter().filter(move |e| e.from == id)
    }

    pub fn is_terminal(&self, id: &str) -> bool {
        self.terminals.contains(id)
    }

    pub(crate) fn view(&self) -> validator::GraphView<'_> {
        validator::GraphView {
            nodes: &self.nodes,
            edges: &self.edges,
            start: Some(&self.start),
            terminals: &self.terminals,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::FunctionNode;
    use std::sync::Mutex;

    fn noop(id: &str) -> FunctionNode {
        FunctionNode::new(id, |_s| Ok(None))
    }

    #[test]
    fn test_build_linear_graph() {
        let graph = Graph::builder()
            .add_node(noop("a"))
            .add_node(noop("b"))
            .add_edge("a", "b")
            .mark_terminal("b")
            .build()
            .unwrap();

        assert_eq!(graph.start(), "a");
        assert!(graph.contains("b"));
        assert_eq!(graph.edges_from("a").count(), 1);
        assert!(graph.is_terminal("b"));
    }

    #[test]
    fn test_first_node_is_default_start() {
        let graph = Graph::builder()
            .add_node(noop("first"))
            .add_node(noop("second"))
            .add_edge("first", "second")
            .mark_terminal("second")
            .build()
            .unwrap();
        assert_eq!(graph.start(), "first");
    }

    #[test]
    fn test_dangling_edge_rejected() {
        let result = Graph::builder().add_node(noop("a")).add_edge("a", "ghost").build();
        assert!(matches!(result, Err(GraphError::InvalidGraph(_))));
    }

    #[test]
    fn test_empty_graph_rejected() {
        assert!(Graph::builder().build().is_err());
    }

    #[test]
    fn test_mutation_hook_sees_changes() {
        let seen: Arc<Mutex<Vec<GraphMutation>>> = Arc::new(Mutex::new(vec![]));
        let seen_clone = seen.clone();

        let _ = Graph::builder()
            .with_mutation_hook(move |m| seen_clone.lock().unwrap().push(m.clone()))
            .add_node(noop("a"))
            .add_node(noop("b"))
            .add_edge("a", "b")
            .mark_terminal("b")
            .build()
            .unwrap();

        let seen = seen.lock().unwrap();
        assert!(seen.contains(&GraphMutation::NodeAdded("a".to_string())));
        assert!(seen
            .contains(&GraphMutation::EdgeAdded { from: "a".to_string(), to: "b".to_string() }));
        assert!(seen.contains(&GraphMutation::TerminalMarked("b".to_string())));
    }
}
