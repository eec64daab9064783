//! Recovery nodes: error-kind routing and the retry wrapper

use crate::error::{GraphError, Result};
use crate::node::{Node, NodeContext, NodeResult, ValidationReport};
use crate::policy::RetryPolicy;
use crate::state::ExecutionState;
use async_trait::async_trait;
use skein_core::{ErrorContext, ErrorKind};
use std::collections::HashSet;
use std::sync::Arc;

/// Metadata key the executor writes before routing into a handler.
pub const ERROR_KIND_KEY: &str = "skein.error.kind";
/// Metadata key naming the node whose failure is being handled.
pub const ERROR_NODE_KEY: &str = "skein.error.node";

/// No-op on the happy path; when the executor routes a failure here,
/// picks a successor by the classified error kind.
pub struct ErrorHandlerNode {
    id: String,
    routes: Vec<(ErrorKind, String)>,
    default: Option<String>,
}

impl ErrorHandlerNode {
    pub fn new(id: &str) -> Self {
        Self { id: id.to_string(), routes: vec![], default: None }
    }

    /// Route failures of `kind` to `target`.
    pub fn route(mut self, kind: ErrorKind, target: &str) -> Self {
        self.routes.push((kind, target.to_string()));
        self
    }

    /// Successor for kinds without an explicit route.
    pub fn with_default(mut self, target: &str) -> Self {
        self.default = Some(target.to_string());
        self
    }
}

#[async_trait]
impl Node for ErrorHandlerNode {
    fn id(&self) -> &str {
        &self.id
    }

    async fn execute(&self, _state: &mut ExecutionState, _ctx: &NodeContext) -> Result<NodeResult> {
        Ok(NodeResult::empty())
    }

    fn next_nodes(&self, _result: &NodeResult, state: &ExecutionState) -> Option<Vec<String>> {
        let kind = state
            .metadata(ERROR_KIND_KEY)
            .and_then(|raw| raw.parse::<ErrorKind>().ok());

        let target = kind
            .and_then(|kind| {
                self.routes.iter().find(|(k, _)| *k == kind).map(|(_, target)| target.clone())
            })
            .or_else(|| self.default.clone());

        Some(target.into_iter().collect())
    }

    fn declared_successors(&self) -> Option<Vec<String>> {
        let mut targets: Vec<String> =
            self.routes.iter().map(|(_, target)| target.clone()).collect();
        targets.extend(self.default.iter().cloned());
        Some(targets)
    }
}

/// Wraps an executable node and retries failures under its own policy,
/// independent of the executor-level registry. The attempt counter is
/// persisted in state metadata so retries survive checkpoint restores.
pub struct RetryNode {
    inner: Arc<dyn Node>,
    policy: RetryPolicy,
    /// Kinds this wrapper retries; `None` uses the kind defaults, which
    /// leave `BudgetExhausted` non-retryable
    retryable_kinds: Option<HashSet<ErrorKind>>,
}

impl RetryNode {
    pub fn new<N: Node + 'static>(inner: N, policy: RetryPolicy) -> Self {
        Self { inner: Arc::new(inner), policy, retryable_kinds: None }
    }

    pub fn wrap(inner: Arc<dyn Node>, policy: RetryPolicy) -> Self {
        Self { inner, policy, retryable_kinds: None }
    }

    pub fn with_retryable_kinds(mut self, kinds: &[ErrorKind]) -> Self {
        self.retryable_kinds = Some(kinds.iter().copied().collect());
        self
    }

    fn retryable(&self, kind: ErrorKind) -> bool {
        match &self.retryable_kinds {
            Some(set) => set.contains(&kind),
            None => kind.retryable_by_default(),
        }
    }
}

#[async_trait]
impl Node for RetryNode {
    fn id(&self) -> &str {
        self.inner.id()
    }

    fn name(&self) -> &str {
        self.inner.name()
    }

    fn description(&self) -> &str {
        self.inner.description()
    }

    fn input_keys(&self) -> &[String] {
        self.inner.input_keys()
    }

    fn output_keys(&self) -> &[String] {
        self.inner.output_keys()
    }

    fn is_executable(&self) -> bool {
        self.inner.is_executable()
    }

    fn cost(&self) -> f64 {
        self.inner.cost()
    }

    fn priority(&self) -> crate::governor::Priority {
        self.inner.priority()
    }

    fn budget_cost(&self) -> f64 {
        self.inner.budget_cost()
    }

    fn max_iterations(&self) -> Option<usize> {
        self.inner.max_iterations()
    }

    fn declared_successors(&self) -> Option<Vec<String>> {
        self.inner.declared_successors()
    }

    fn validate(&self, state: &ExecutionState) -> ValidationReport {
        self.inner.validate(state)
    }

    fn should_execute(&self, state: &ExecutionState) -> bool {
        self.inner.should_execute(state)
    }

    async fn before(&self, state: &ExecutionState, ctx: &NodeContext) -> Result<()> {
        self.inner.before(state, ctx).await
    }

    async fn after(&self, state: &ExecutionState, ctx: &NodeContext) -> Result<()> {
        self.inner.after(state, ctx).await
    }

    async fn on_failure(
        &self,
        error: &ErrorContext,
        state: &ExecutionState,
        ctx: &NodeContext,
    ) -> Result<()> {
        self.inner.on_failure(error, state, ctx).await
    }

    fn next_nodes(&self, result: &NodeResult, state: &ExecutionState) -> Option<Vec<String>> {
        self.inner.next_nodes(result, state)
    }

    async fn execute(&self, state: &mut ExecutionState, ctx: &NodeContext) -> Result<NodeResult> {
        let id = self.inner.id().to_string();
        // Resume from the persisted counter so a checkpoint round-trip
        // does not reset the budget.
        let prior_attempts = state.attempt_counter(&id);
        let mut failures = prior_attempts;

        loop {
            let attempt = failures + 1;
            state.set_attempt_counter(&id, attempt);
            let attempt_ctx = ctx.clone().with_attempt(attempt);

            match self.inner.execute(state, &attempt_ctx).await {
                Ok(result) => return Ok(result),
                Err(error) => {
                    let kind = error.kind();
                    failures += 1;
                    if kind == ErrorKind::Cancellation
                        || !self.retryable(kind)
                        || !self.policy.should_retry(failures)
                    {
                        return Err(error);
                    }

                    let delay = self.policy.delay_for(failures, &mut rand::thread_rng());
                    tracing::debug!(node = %id, attempt, ?delay, "retrying after failure");
                    tokio::select! {
                        _ = ctx.cancellation.cancelled() => {
                            return Err(GraphError::Canceled { node: Some(id) });
                        }
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }
}
