//! Node contract
//!
//! Nodes are the computational units of a graph. The trait is a
//! capability record: routing-only nodes override [`Node::next_nodes`],
//! fork points expose a [`ForkSpec`], everything else overrides
//! [`Node::execute`]. Only `execute` may mutate state.

use crate::error::Result;
use crate::governor::Priority;
use crate::merge::MergePolicies;
use crate::state::ExecutionState;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use skein_core::{ErrorContext, Value};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Per-step context handed to a node. Cheap to clone; the state itself
/// is passed separately so only `execute` can reach it mutably.
#[derive(Clone)]
pub struct NodeContext {
    /// Execution this step belongs to
    pub execution_id: String,
    /// Engine-wide step number
    pub step: usize,
    /// 1-based attempt number for this node
    pub attempt: u32,
    /// Cooperative cancellation signal; long-running nodes must observe it
    pub cancellation: CancellationToken,
}

impl NodeContext {
    pub fn new(execution_id: impl Into<String>) -> Self {
        Self {
            execution_id: execution_id.into(),
            step: 0,
            attempt: 1,
            cancellation: CancellationToken::new(),
        }
    }

    pub fn with_step(mut self, step: usize) -> Self {
        self.step = step;
        self
    }

    pub fn with_attempt(mut self, attempt: u32) -> Self {
        self.attempt = attempt;
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = token;
        self
    }
}

/// What to do when a suspension deadline elapses without a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeadlinePolicy {
    /// Treat the node as skipped and continue
    Skip,
    /// Fail the branch
    Fail,
    /// Route to the escalation path via the error-handler machinery
    Escalate,
}

/// Request to pause the branch for an external (human) response.
#[derive(Debug, Clone)]
pub struct SuspendRequest {
    /// Key the caller answers with
    pub request_id: String,
    /// Prompt shown to the approver
    pub prompt: String,
    /// Hard deadline for the response
    pub deadline: DateTime<Utc>,
    /// State key the response is written under on resume
    pub response_key: Option<String>,
    /// Deadline behavior
    pub on_deadline: DeadlinePolicy,
}

/// Outcome of a successful `execute`.
#[derive(Debug, Clone)]
pub enum NodeResult {
    /// Completed, optionally producing a value
    Value(Option<Value>),
    /// Pause the branch until the request is answered
    Suspend(SuspendRequest),
}

impl NodeResult {
    /// Completed with no output.
    pub fn empty() -> Self {
        Self::Value(None)
    }

    /// Completed with a value.
    pub fn value(value: impl Into<Value>) -> Self {
        Self::Value(Some(value.into()))
    }
}

/// Errors and warnings from a pre-execution validation pass.
#[derive(Debug, Clone, Default)]
pub struct ValidationReport {
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl ValidationReport {
    pub fn ok() -> Self {
        Self::default()
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self { errors: vec![message.into()], warnings: vec![] }
    }

    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn push_error(&mut self, message: impl Into<String>) {
        self.errors.push(message.into());
    }

    pub fn push_warning(&mut self, message: impl Into<String>) {
        self.warnings.push(message.into());
    }

    pub fn merge(&mut self, other: ValidationReport) {
        self.errors.extend(other.errors);
        self.warnings.extend(other.warnings);
    }
}

/// Fork capability: fan out into sibling branches joined at a sync point.
#[derive(Debug, Clone)]
pub struct ForkSpec {
    /// Entry node of each branch, in declared order
    pub branches: Vec<String>,
    /// Node where the branches join
    pub join: String,
    /// How branch overlays merge back into the parent state; `None`
    /// falls back to the execution options
    pub merge: Option<MergePolicies>,
}

/// A node in the graph.
///
/// Defaults make the minimal implementation a plain executable node:
/// always runs, validates its declared inputs, routes via static edges.
#[async_trait]
pub trait Node: Send + Sync {
    /// Stable identifier, unique within a graph
    fn id(&self) -> &str;

    /// Human-readable name
    fn name(&self) -> &str {
        self.id()
    }

    /// Optional description for diagnostics
    fn description(&self) -> &str {
        ""
    }

    /// Keys this node reads (advisory schema)
    fn input_keys(&self) -> &[String] {
        &[]
    }

    /// Keys this node writes (advisory schema)
    fn output_keys(&self) -> &[String] {
        &[]
    }

    /// Routing-only nodes return false and are never executed
    fn is_executable(&self) -> bool {
        true
    }

    /// Governor cost of one execution
    fn cost(&self) -> f64 {
        1.0
    }

    /// Governor priority of one execution
    fn priority(&self) -> Priority {
        Priority::Normal
    }

    /// Budget units charged before execution; zero means untagged
    fn budget_cost(&self) -> f64 {
        0.0
    }

    /// Fork capability probe; the executor fans out when this is Some
    fn fork_spec(&self) -> Option<&ForkSpec> {
        None
    }

    /// Iteration bound declared by loop nodes; the validator requires one
    /// on every cycle
    fn max_iterations(&self) -> Option<usize> {
        None
    }

    /// Cheap input check. Must not mutate state.
    fn validate(&self, state: &ExecutionState) -> ValidationReport {
        let mut report = ValidationReport::ok();
        for key in self.input_keys() {
            if !state.contains(key) {
                report.push_error(format!("missing required input key '{key}'"));
            }
        }
        report
    }

    /// Deterministic, side-effect-free skip predicate.
    fn should_execute(&self, _state: &ExecutionState) -> bool {
        true
    }

    /// Advisory pre-hook; failures are recorded as warnings.
    async fn before(&self, _state: &ExecutionState, _ctx: &NodeContext) -> Result<()> {
        Ok(())
    }

    /// The only mutating operation. Must honor `ctx.cancellation`.
    async fn execute(&self, state: &mut ExecutionState, ctx: &NodeContext) -> Result<NodeResult>;

    /// Advisory post-hook; failures are recorded as warnings.
    async fn after(&self, _state: &ExecutionState, _ctx: &NodeContext) -> Result<()> {
        Ok(())
    }

    /// Advisory failure hook; failures are recorded as warnings and never
    /// change the run's outcome.
    async fn on_failure(
        &self,
        _error: &ErrorContext,
        _state: &ExecutionState,
        _ctx: &NodeContext,
    ) -> Result<()> {
        Ok(())
    }

    /// Successor override. `None` defers to the graph's edges;
    /// `Some(vec![])` terminates the branch. Order is the declared
    /// tie-break order.
    fn next_nodes(&self, _result: &NodeResult, _state: &ExecutionState) -> Option<Vec<String>> {
        None
    }

    /// Static enumeration of every target [`Node::next_nodes`] can pick,
    /// so the validator can reason about connectivity and cycles without
    /// evaluating predicates. `None` means the node routes via edges only.
    fn declared_successors(&self) -> Option<Vec<String>> {
        None
    }
}

/// Shared, clonable node handle as stored in a graph.
pub type NodeRef = Arc<dyn Node>;

type SyncFn = Arc<dyn Fn(&mut ExecutionState) -> Result<Option<Value>> + Send + Sync>;
type AsyncFn =
    Arc<dyn Fn(ExecutionState, NodeContext) -> BoxFuture<'static, Result<Option<Value>>> + Send + Sync>;

enum Callable {
    /// Mutates state directly
    Sync(SyncFn),
    /// Awaits over a read view; the produced value lands under the
    /// declared output key
    Async(AsyncFn),
}

/// Wraps a single callable as an executable node.
pub struct FunctionNode {
    id: String,
    description: String,
    input_keys: Vec<String>,
    output_keys: Vec<String>,
    output_key: Option<String>,
    callable: Callable,
}

impl FunctionNode {
    /// Node over a synchronous callable with direct state access.
    pub fn new<F>(id: &str, func: F) -> Self
    where
        F: Fn(&mut ExecutionState) -> Result<Option<Value>> + Send + Sync + 'static,
    {
        Self {
            id: id.to_string(),
            description: String::new(),
            input_keys: vec![],
            output_keys: vec![],
            output_key: None,
            callable: Callable::Sync(Arc::new(func)),
        }
    }

    /// Node over an async callable. The callable sees a read view of the
    /// state; its returned value is stored under the output key, if any.
    pub fn new_async<F, Fut>(id: &str, func: F) -> Self
    where
        F: Fn(ExecutionState, NodeContext) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<Option<Value>>> + Send + 'static,
    {
        Self {
            id: id.to_string(),
            description: String::new(),
            input_keys: vec![],
            output_keys: vec![],
            output_key: None,
            callable: Callable::Async(Arc::new(move |state, ctx| Box::pin(func(state, ctx)))),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_input_keys(mut self, keys: &[&str]) -> Self {
        self.input_keys = keys.iter().map(|k| (*k).to_string()).collect();
        self
    }

    /// Declare where the callable's returned value is stored.
    pub fn with_output_key(mut self, key: impl Into<String>) -> Self {
        let key = key.into();
        self.output_keys = vec![key.clone()];
        self.output_key = Some(key);
        self
    }
}

#[async_trait]
impl Node for FunctionNode {
    fn id(&self) -> &str {
        &self.id
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn input_keys(&self) -> &[String] {
        &self.input_keys
    }

    fn output_keys(&self) -> &[String] {
        &self.output_keys
    }

    async fn execute(&self, state: &mut ExecutionState, ctx: &NodeContext) -> Result<NodeResult> {
        let produced = match &self.callable {
            Callable::Sync(f) => f(state)?,
            Callable::Async(f) => f(state.clone(), ctx.clone()).await?,
        };

        if let (Some(key), Some(value)) = (&self.output_key, produced.clone()) {
            state.set(key.clone(), value)?;
        }
        Ok(NodeResult::Value(produced))
    }
}

/// No-op node, useful as a terminal marker or join point.
pub struct PassthroughNode {
    id: String,
}

impl PassthroughNode {
    pub fn new(id: &str) -> Self {
        Self { id: id.to_string() }
    }
}

#[async_trait]
impl Node for PassthroughNode {
    fn id(&self) -> &str {
        &self.id
    }

    async fn execute(&self, _state: &mut ExecutionState, _ctx: &NodeContext) -> Result<NodeResult> {
        Ok(NodeResult::empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_sync_function_node() {
        let node = FunctionNode::new("double", |state| {
            let n = state.get_int("n").unwrap_or(0);
            state.set("n", n * 2)?;
            Ok(None)
        });

        let mut state = ExecutionState::new().with_entry("n", 21i64);
        node.execute(&mut state, &NodeContext::new("x")).await.unwrap();
        assert_eq!(state.get_int("n"), Some(42));
    }

    #[tokio::test]
    async fn test_async_function_node_stores_output() {
        let node = FunctionNode::new_async("upper", |state, _ctx| async move {
            let input = state.get_str("input").unwrap_or_default().to_uppercase();
            Ok(Some(Value::from(input)))
        })
        .with_input_keys(&["input"])
        .with_output_key("output");

        let mut state = ExecutionState::new().with_entry("input", "hello");
        node.execute(&mut state, &NodeContext::new("x")).await.unwrap();
        assert_eq!(state.get_str("output"), Some("HELLO"));
    }

    #[test]
    fn test_default_validate_checks_inputs() {
        let node = FunctionNode::new("n", |_s| Ok(None)).with_input_keys(&["needed"]);
        let report = node.validate(&ExecutionState::new());
        assert!(!report.is_ok());
        assert!(report.errors[0].contains("needed"));

        let state = ExecutionState::new().with_entry("needed", 1i64);
        assert!(node.validate(&state).is_ok());
    }

    #[tokio::test]
    async fn test_passthrough() {
        let node = PassthroughNode::new("end");
        let mut state = ExecutionState::new();
        let result = node.execute(&mut state, &NodeContext::new("x")).await.unwrap();
        assert!(matches!(result, NodeResult::Value(None)));
    }
}
