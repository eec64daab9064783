//! Successor selection
//!
//! Static routing walks a node's outgoing edges in declared order and
//! takes the first admitting one. Dynamic strategies, when enabled, are
//! consulted first and may pick any declared edge target; a choice
//! outside the declared targets falls back to static routing with a
//! warning.

use crate::error::{GraphError, Result};
use crate::graph::Graph;
use crate::metrics::MetricsCollector;
use crate::node::{Node, NodeResult};
use crate::state::ExecutionState;
use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use skein_core::EmbeddingProvider;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

/// Inputs a strategy may use besides the state.
#[derive(Clone)]
pub struct RoutingContext {
    pub execution_id: String,
    pub step: usize,
    /// Seed for reproducible randomized strategies
    pub seed: u64,
    pub metrics: Option<Arc<MetricsCollector>>,
}

impl RoutingContext {
    pub fn new(execution_id: &str, step: usize, seed: Option<u64>) -> Self {
        let seed = seed.unwrap_or_else(|| stable_hash(execution_id));
        Self { execution_id: execution_id.to_string(), step, seed, metrics: None }
    }

    pub fn with_metrics(mut self, metrics: Arc<MetricsCollector>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Deterministic RNG for this (execution, node, step) coordinate.
    pub fn rng_for(&self, node_id: &str) -> StdRng {
        let mut hasher = DefaultHasher::new();
        self.seed.hash(&mut hasher);
        node_id.hash(&mut hasher);
        self.step.hash(&mut hasher);
        StdRng::seed_from_u64(hasher.finish())
    }
}

fn stable_hash(s: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    s.hash(&mut hasher);
    hasher.finish()
}

/// What a dynamic strategy decided.
#[derive(Debug, Clone, PartialEq)]
pub enum RouteDecision {
    /// Route to this candidate
    Target(String),
    /// Sample a candidate from this distribution
    Weighted(Vec<(String, f64)>),
    /// No opinion; fall through to static routing
    Passthrough,
}

/// Pluggable successor picker consulted before static edges.
#[async_trait]
pub trait RoutingStrategy: Send + Sync {
    fn name(&self) -> &str;

    /// Choose among `candidates` (the node's declared edge targets, in
    /// declared order).
    async fn route(
        &self,
        node_id: &str,
        state: &ExecutionState,
        candidates: &[String],
        ctx: &RoutingContext,
    ) -> RouteDecision;
}

/// Default deterministic strategy: defer to the declared edge order.
pub struct FirstMatchRouting;

#[async_trait]
impl RoutingStrategy for FirstMatchRouting {
    fn name(&self) -> &str {
        "first_match"
    }

    async fn route(
        &self,
        _node_id: &str,
        _state: &ExecutionState,
        _candidates: &[String],
        _ctx: &RoutingContext,
    ) -> RouteDecision {
        RouteDecision::Passthrough
    }
}

/// Weighted random pick, seeded from the execution so runs reproduce.
pub struct ProbabilisticRouting {
    /// Weights by candidate id; unlisted candidates weigh 1.0
    weights: Vec<(String, f64)>,
}

impl ProbabilisticRouting {
    pub fn uniform() -> Self {
        Self { weights: vec![] }
    }

    pub fn with_weight(mut self, candidate: &str, weight: f64) -> Self {
        self.weights.push((candidate.to_string(), weight));
        self
    }

    fn weight_of(&self, candidate: &str) -> f64 {
        self.weights
            .iter()
            .find(|(id, _)| id == candidate)
            .map_or(1.0, |(_, w)| *w)
    }
}

#[async_trait]
impl RoutingStrategy for ProbabilisticRouting {
    fn name(&self) -> &str {
        "probabilistic"
    }

    async fn route(
        &self,
        _node_id: &str,
        _state: &ExecutionState,
        candidates: &[String],
        _ctx: &RoutingContext,
    ) -> RouteDecision {
        if candidates.is_empty() {
            return RouteDecision::Passthrough;
        }
        let distribution: Vec<(String, f64)> =
            candidates.iter().map(|c| (c.clone(), self.weight_of(c))).collect();
        RouteDecision::Weighted(distribution)
    }
}

/// Prefer successors that historically succeed most, then respond
/// fastest; falls through when no history exists.
pub struct HistoryRouting;

#[async_trait]
impl RoutingStrategy for HistoryRouting {
    fn name(&self) -> &str {
        "history"
    }

    async fn route(
        &self,
        _node_id: &str,
        _state: &ExecutionState,
        candidates: &[String],
        ctx: &RoutingContext,
    ) -> RouteDecision {
        let Some(metrics) = &ctx.metrics else {
            return RouteDecision::Passthrough;
        };

        let mut best: Option<(&String, f64, u64)> = None;
        let mut any_history = false;
        for candidate in candidates {
            let Some(snapshot) = metrics.node_snapshot(candidate) else {
                continue;
            };
            any_history = true;
            let score = (snapshot.success_ratio(), snapshot.latency.p50_ms());
            match best {
                Some((_, ratio, p50))
                    if score.0 < ratio || (score.0 == ratio && score.1 >= p50) => {}
                _ => best = Some((candidate, score.0, score.1)),
            }
        }

        match (any_history, best) {
            (true, Some((candidate, _, _))) => RouteDecision::Target(candidate.clone()),
            _ => RouteDecision::Passthrough,
        }
    }
}

/// Builds a query from state for embedding comparison.
pub type QueryBuilder = Arc<dyn Fn(&ExecutionState) -> String + Send + Sync>;

/// Pick the candidate whose description embeds closest to a query built
/// from the current state.
pub struct SimilarityRouting {
    provider: Arc<dyn EmbeddingProvider>,
    query_builder: QueryBuilder,
    /// Candidate id -> text to embed (usually the node description)
    candidate_text: Vec<(String, String)>,
}

impl SimilarityRouting {
    pub fn new<F>(provider: Arc<dyn EmbeddingProvider>, query_builder: F) -> Self
    where
        F: Fn(&ExecutionState) -> String + Send + Sync + 'static,
    {
        Self { provider, query_builder: Arc::new(query_builder), candidate_text: vec![] }
    }

    pub fn describe(mut self, candidate: &str, text: &str) -> Self {
        self.candidate_text.push((candidate.to_string(), text.to_string()));
        self
    }
}

fn cosine(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        0.0
    } else {
        dot / (norm_a * norm_b)
    }
}

#[async_trait]
impl RoutingStrategy for SimilarityRouting {
    fn name(&self) -> &str {
        "similarity"
    }

    async fn route(
        &self,
        _node_id: &str,
        state: &ExecutionState,
        candidates: &[String],
        _ctx: &RoutingContext,
    ) -> RouteDecision {
        let query = (self.query_builder)(state);
        let Ok(query_embedding) = self.provider.embed(&query).await else {
            return RouteDecision::Passthrough;
        };

        let mut best: Option<(&String, f32)> = None;
        for candidate in candidates {
            let Some((_, text)) =
                self.candidate_text.iter().find(|(id, _)| id == candidate)
            else {
                continue;
            };
            let Ok(embedding) = self.provider.embed(text).await else {
                continue;
            };
            let score = cosine(&query_embedding, &embedding);
            if best.is_none_or(|(_, s)| score > s) {
                best = Some((candidate, score));
            }
        }

        match best {
            Some((candidate, _)) => RouteDecision::Target(candidate.clone()),
            None => RouteDecision::Passthrough,
        }
    }
}

/// Resolves the successor set for one completed node.
pub struct Router {
    strategy: Option<Arc<dyn RoutingStrategy>>,
}

impl Router {
    pub fn static_only() -> Self {
        Self { strategy: None }
    }

    pub fn with_strategy(strategy: Arc<dyn RoutingStrategy>) -> Self {
        Self { strategy: Some(strategy) }
    }

    /// Compute successors of `node` after producing `result`.
    ///
    /// Order of consultation: the node's own routing, then the dynamic
    /// strategy, then static edges. An empty return terminates the
    /// branch.
    pub async fn successors(
        &self,
        graph: &Graph,
        node: &dyn Node,
        result: &NodeResult,
        state: &ExecutionState,
        ctx: &RoutingContext,
    ) -> Result<Vec<String>> {
        // Router nodes carry their own successor logic.
        if let Some(targets) = node.next_nodes(result, state) {
            for target in &targets {
                if !graph.contains(target) {
                    return Err(GraphError::NodeNotFound(target.clone()));
                }
            }
            return Ok(targets);
        }

        let candidates: Vec<String> =
            graph.edges_from(node.id()).map(|e| e.to.clone()).collect();

        if let Some(strategy) = &self.strategy {
            if !candidates.is_empty() {
                match strategy.route(node.id(), state, &candidates, ctx).await {
                    RouteDecision::Target(target) => {
                        if candidates.contains(&target) {
                            return Ok(vec![target]);
                        }
                        tracing::warn!(
                            strategy = strategy.name(),
                            node = node.id(),
                            %target,
                            "dynamic route is not a declared edge target; using static routing"
                        );
                    }
                    RouteDecision::Weighted(distribution) => {
                        if let Some(target) = sample(&distribution, &candidates, node.id(), ctx) {
                            return Ok(vec![target]);
                        }
                        tracing::warn!(
                            strategy = strategy.name(),
                            node = node.id(),
                            "weighted route produced no declared target; using static routing"
                        );
                    }
                    RouteDecision::Passthrough => {}
                }
            }
        }

        self.static_successors(graph, node, state)
    }

    fn static_successors(
        &self,
        graph: &Graph,
        node: &dyn Node,
        state: &ExecutionState,
    ) -> Result<Vec<String>> {
        let mut saw_edge = false;
        for edge in graph.edges_from(node.id()) {
            saw_edge = true;
            if edge.admits(state) {
                return Ok(vec![edge.to.clone()]);
            }
        }

        if saw_edge {
            // Edges exist but none matched: a predicate gap
            return Err(GraphError::RoutingDeadEnd(node.id().to_string()));
        }
        // No outgoing edges at all: the branch terminates here
        Ok(vec![])
    }
}

fn sample(
    distribution: &[(String, f64)],
    candidates: &[String],
    node_id: &str,
    ctx: &RoutingContext,
) -> Option<String> {
    let valid: Vec<&(String, f64)> = distribution
        .iter()
        .filter(|(id, weight)| *weight > 0.0 && candidates.contains(id))
        .collect();
    let total: f64 = valid.iter().map(|(_, w)| w).sum();
    if valid.is_empty() || total <= 0.0 {
        return None;
    }

    let mut rng = ctx.rng_for(node_id);
    let mut roll = rng.gen_range(0.0..total);
    for (id, weight) in &valid {
        if roll < *weight {
            return Some(id.clone());
        }
        roll -= weight;
    }
    valid.last().map(|(id, _)| id.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::Graph;
    use crate::node::FunctionNode;

    fn noop(id: &str) -> FunctionNode {
        FunctionNode::new(id, |_s| Ok(None))
    }

    fn diamond() -> Graph {
        Graph::builder()
            .add_node(noop("src"))
            .add_node(noop("a"))
            .add_node(noop("b"))
            .add_edge("src", "a")
            .add_edge("src", "b")
            .mark_terminal("a")
            .mark_terminal("b")
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn test_static_first_match_wins() {
        let graph = Graph::builder()
            .add_node(noop("src"))
            .add_node(noop("low"))
            .add_node(noop("high"))
            .add_edge_if("src", "high", |s| s.get_int("n").unwrap_or(0) > 10)
            .add_edge("src", "low")
            .mark_terminal("low")
            .mark_terminal("high")
            .build()
            .unwrap();

        let router = Router::static_only();
        let ctx = RoutingContext::new("x", 0, None);

        let state = ExecutionState::new().with_entry("n", 50i64);
        let node = graph.node("src").unwrap().clone();
        let next = router
            .successors(&graph, node.as_ref(), &NodeResult::empty(), &state, &ctx)
            .await
            .unwrap();
        assert_eq!(next, vec!["high".to_string()]);

        let state = ExecutionState::new().with_entry("n", 1i64);
        let next = router
            .successors(&graph, node.as_ref(), &NodeResult::empty(), &state, &ctx)
            .await
            .unwrap();
        assert_eq!(next, vec!["low".to_string()]);
    }

    #[tokio::test]
    async fn test_predicate_gap_is_a_dead_end() {
        let graph = Graph::builder()
            .add_node(noop("src"))
            .add_node(noop("a"))
            .add_edge_if("src", "a", |s| s.contains("go"))
            .mark_terminal("a")
            .build()
            .unwrap();

        let router = Router::static_only();
        let ctx = RoutingContext::new("x", 0, None);
        let node = graph.node("src").unwrap().clone();
        let err = router
            .successors(&graph, node.as_ref(), &NodeResult::empty(), &ExecutionState::new(), &ctx)
            .await
            .unwrap_err();
        assert!(matches!(err, GraphError::RoutingDeadEnd(_)));
    }

    #[tokio::test]
    async fn test_no_edges_terminates() {
        let graph = Graph::builder().add_node(noop("only")).mark_terminal("only").build().unwrap();
        let router = Router::static_only();
        let ctx = RoutingContext::new("x", 0, None);
        let node = graph.node("only").unwrap().clone();
        let next = router
            .successors(&graph, node.as_ref(), &NodeResult::empty(), &ExecutionState::new(), &ctx)
            .await
            .unwrap();
        assert!(next.is_empty());
    }

    #[tokio::test]
    async fn test_probabilistic_is_reproducible_per_seed() {
        let graph = diamond();
        let router = Router::with_strategy(Arc::new(ProbabilisticRouting::uniform()));
        let node = graph.node("src").unwrap().clone();
        let state = ExecutionState::new();

        let ctx = RoutingContext::new("exec", 3, Some(42));
        let first = router
            .successors(&graph, node.as_ref(), &NodeResult::empty(), &state, &ctx)
            .await
            .unwrap();
        let second = router
            .successors(&graph, node.as_ref(), &NodeResult::empty(), &state, &ctx)
            .await
            .unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_dynamic_choice_must_be_declared_target() {
        struct Rogue;

        #[async_trait]
        impl RoutingStrategy for Rogue {
            fn name(&self) -> &str {
                "rogue"
            }
            async fn route(
                &self,
                _node_id: &str,
                _state: &ExecutionState,
                _candidates: &[String],
                _ctx: &RoutingContext,
            ) -> RouteDecision {
                RouteDecision::Target("elsewhere".to_string())
            }
        }

        let graph = diamond();
        let router = Router::with_strategy(Arc::new(Rogue));
        let node = graph.node("src").unwrap().clone();
        let ctx = RoutingContext::new("x", 0, None);

        // Falls back to static: first declared edge target
        let next = router
            .successors(&graph, node.as_ref(), &NodeResult::empty(), &ExecutionState::new(), &ctx)
            .await
            .unwrap();
        assert_eq!(next, vec!["a".to_string()]);
    }

    #[tokio::test]
    async fn test_history_routing_prefers_reliable_nodes() {
        let graph = diamond();
        let metrics = Arc::new(MetricsCollector::new(true));
        metrics.node_success("a", 10);
        metrics.node_failure("a", skein_core::ErrorKind::Network, 10);
        metrics.node_success("b", 10);

        let router = Router::with_strategy(Arc::new(HistoryRouting));
        let node = graph.node("src").unwrap().clone();
        let ctx = RoutingContext::new("x", 0, None).with_metrics(metrics);

        let next = router
            .successors(&graph, node.as_ref(), &NodeResult::empty(), &ExecutionState::new(), &ctx)
            .await
            .unwrap();
        assert_eq!(next, vec!["b".to_string()]);
    }
}
