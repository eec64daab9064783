//! Graph executor
//!
//! Walks a graph one branch at a time: validate, admit (breaker, budget,
//! governor), execute under deadline, record, publish, route. Failures
//! run through the policy registry; fork nodes fan out into isolated
//! branch scopes merged deterministically at their join.

use crate::breaker::{BreakerRegistry, CircuitBreakerConfig, CircuitDecision, CircuitTransition};
use crate::budget::ResourceBudget;
use crate::checkpoint::{Checkpoint, CheckpointManager};
use crate::error::{GraphError, Result, SuspendedExecution};
use crate::governor::{GovernorConfig, LoadSampler, Priority, ResourceGovernor};
use crate::graph::Graph;
use crate::merge::{merge, overlay_of, MergePolicies};
use crate::metrics::{MetricsCollector, RunStatus};
use crate::node::{DeadlinePolicy, Node, NodeContext, NodeRef, NodeResult, SuspendRequest};
use crate::nodes::approval::HumanApprovalNode;
use crate::nodes::recovery::{ERROR_KIND_KEY, ERROR_NODE_KEY};
use crate::policy::{ErrorPolicyRegistry, PolicyRule, RecoveryAction};
use crate::routing::{Router, RoutingContext, RoutingStrategy};
use crate::state::{ExecutionState, ExecutionStep, StepStatus};
use crate::stream::{channel, EventPayload, EventReceiver, EventSink};
use crate::validator;
use chrono::Utc;
use futures::future::BoxFuture;
use futures::stream::{FuturesUnordered, StreamExt};
use rand::rngs::StdRng;
use rand::SeedableRng;
use skein_core::{CheckpointStore, ErrorContext, ErrorKind, TelemetrySink, Value};
use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, VecDeque};
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Metadata key persisting the engine-wide step count across
/// suspensions and checkpoints.
const STEPS_METADATA_KEY: &str = "skein.steps";

/// Immutable per-run option snapshot.
#[derive(Clone)]
pub struct ExecutionOptions {
    /// Hard engine-wide loop safety bound
    pub max_execution_steps: usize,
    /// Wall-clock bound for the whole run
    pub execution_timeout: Option<Duration>,
    /// Wall-clock bound per node execution
    pub node_timeout: Option<Duration>,
    pub enable_checkpointing: bool,
    pub checkpoint_every_n_nodes: usize,
    pub max_checkpoints_retained: usize,
    pub enable_metrics: bool,
    pub enable_streaming: bool,
    pub enable_dynamic_routing: bool,
    pub enable_resource_governance: bool,
    pub enable_error_recovery: bool,
    /// Sibling branches a fork may run concurrently
    pub max_parallel_nodes: usize,
    pub governor: GovernorConfig,
    /// Per-execution budget in abstract units; `None` is unlimited
    pub budget_units: Option<f64>,
    /// Join-time merge policies for forks that declare none
    pub merge_policies: MergePolicies,
    pub default_priority: Priority,
    /// Seed for reproducible randomized routing and jitter
    pub determinism_seed: Option<u64>,
    /// Grace period for cancellation drains and lifecycle event
    /// backpressure
    pub drain_window: Duration,
    /// Event stream buffer size
    pub event_buffer: usize,
}

impl Default for ExecutionOptions {
    fn default() -> Self {
        Self {
            max_execution_steps: 1_000,
            execution_timeout: None,
            node_timeout: None,
            enable_checkpointing: false,
            checkpoint_every_n_nodes: 5,
            max_checkpoints_retained: 10,
            enable_metrics: true,
            enable_streaming: true,
            enable_dynamic_routing: false,
            enable_resource_governance: false,
            enable_error_recovery: true,
            max_parallel_nodes: 4,
            governor: GovernorConfig::default(),
            budget_units: None,
            merge_policies: MergePolicies::default(),
            default_priority: Priority::Normal,
            determinism_seed: None,
            drain_window: Duration::from_secs(5),
            event_buffer: 256,
        }
    }
}

impl ExecutionOptions {
    pub fn with_max_steps(mut self, max: usize) -> Self {
        self.max_execution_steps = max.max(1);
        self
    }

    pub fn with_execution_timeout(mut self, timeout: Duration) -> Self {
        self.execution_timeout = Some(timeout);
        self
    }

    pub fn with_node_timeout(mut self, timeout: Duration) -> Self {
        self.node_timeout = Some(timeout);
        self
    }

    pub fn with_checkpointing(mut self, every_n_nodes: usize) -> Self {
        self.enable_checkpointing = true;
        self.checkpoint_every_n_nodes = every_n_nodes.max(1);
        self
    }

    pub fn with_budget(mut self, units: f64) -> Self {
        self.budget_units = Some(units);
        self
    }

    pub fn with_merge_policies(mut self, policies: MergePolicies) -> Self {
        self.merge_policies = policies;
        self
    }

    pub fn with_max_parallel_nodes(mut self, max: usize) -> Self {
        self.max_parallel_nodes = max.max(1);
        self
    }

    pub fn with_determinism_seed(mut self, seed: u64) -> Self {
        self.determinism_seed = Some(seed);
        self
    }

    pub fn with_dynamic_routing(mut self) -> Self {
        self.enable_dynamic_routing = true;
        self
    }

    pub fn with_resource_governance(mut self, governor: GovernorConfig) -> Self {
        self.enable_resource_governance = true;
        self.governor = governor;
        self
    }
}

/// A run parked on a human-approval suspension.
struct SuspendedRun {
    graph: Arc<Graph>,
    execution_id: String,
    state: ExecutionState,
    queue: VecDeque<String>,
    node_id: String,
    request: SuspendRequest,
}

/// Shared per-run context threaded through the step loop.
#[derive(Clone)]
struct RunContext {
    execution_id: String,
    cancellation: CancellationToken,
    deadline: Option<Instant>,
    steps: Arc<AtomicUsize>,
    budget: Arc<Mutex<ResourceBudget>>,
    completed_since_checkpoint: Arc<AtomicUsize>,
}

impl RunContext {
    fn for_branch(&self, cancellation: CancellationToken) -> Self {
        Self { cancellation, ..self.clone() }
    }
}

enum LoopOutcome {
    Done,
    Suspended { node_id: String, request: SuspendRequest },
}

enum StepOutcome {
    Completed(NodeResult),
    Skipped,
    Routed(Vec<String>),
    Suspended(SuspendRequest),
    Halted(GraphError),
}

/// Named graph executor. All registries (policies, breakers, routing,
/// migrations via the checkpoint codec) are scoped to the instance;
/// there is no process-wide state.
pub struct Executor {
    name: String,
    options: ExecutionOptions,
    policies: ErrorPolicyRegistry,
    breakers: BreakerRegistry,
    governor: ResourceGovernor,
    router: Router,
    metrics: Arc<MetricsCollector>,
    checkpoints: Option<Arc<CheckpointManager>>,
    events: EventSink,
    telemetry: Option<Arc<dyn TelemetrySink>>,
    suspended: Mutex<HashMap<String, SuspendedRun>>,
}

impl Executor {
    pub fn new(name: &str) -> Self {
        Self::with_options(name, ExecutionOptions::default())
    }

    pub fn with_options(name: &str, options: ExecutionOptions) -> Self {
        let metrics = Arc::new(MetricsCollector::new(options.enable_metrics));
        let governor = ResourceGovernor::new(options.governor.clone());
        Self {
            name: name.to_string(),
            options,
            policies: ErrorPolicyRegistry::new(),
            breakers: BreakerRegistry::new(),
            governor,
            router: Router::static_only(),
            metrics,
            checkpoints: None,
            events: EventSink::disabled(),
            telemetry: None,
            suspended: Mutex::new(HashMap::new()),
        }
    }

    /// Instance name, for diagnostics only.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn options(&self) -> &ExecutionOptions {
        &self.options
    }

    pub fn metrics(&self) -> &Arc<MetricsCollector> {
        &self.metrics
    }

    /// Register an error-policy rule.
    pub fn add_policy_rule(&mut self, rule: PolicyRule) -> &mut Self {
        self.policies.add_rule(rule);
        self
    }

    /// Replace the whole policy registry.
    pub fn set_policies(&mut self, policies: ErrorPolicyRegistry) -> &mut Self {
        self.policies = policies;
        self
    }

    /// Enable a circuit breaker for one node.
    pub fn configure_breaker(&mut self, node_id: &str, config: CircuitBreakerConfig) -> &mut Self {
        self.breakers.configure(node_id, config);
        self
    }

    /// Install a dynamic routing strategy. Ignored unless dynamic routing
    /// is enabled in the options.
    pub fn set_routing_strategy(&mut self, strategy: Arc<dyn RoutingStrategy>) -> &mut Self {
        if self.options.enable_dynamic_routing {
            self.router = Router::with_strategy(strategy);
        } else {
            tracing::warn!(
                executor = %self.name,
                "dynamic routing is disabled in the options; strategy ignored"
            );
        }
        self
    }

    /// Attach a checkpoint store; enables restore and suspension
    /// persistence.
    pub fn set_checkpoint_store(&mut self, store: Arc<dyn CheckpointStore>) -> &mut Self {
        let manager = CheckpointManager::new(store)
            .with_interval(self.options.checkpoint_every_n_nodes)
            .with_retain(self.options.max_checkpoints_retained);
        self.checkpoints = Some(Arc::new(manager));
        self
    }

    /// Attach a pre-built checkpoint manager (custom codec/migrations).
    pub fn set_checkpoint_manager(&mut self, manager: CheckpointManager) -> &mut Self {
        self.checkpoints = Some(Arc::new(manager));
        self
    }

    /// Attach a load sampler for adaptive governor throttling.
    pub fn set_load_sampler(&mut self, sampler: Arc<dyn LoadSampler>) -> &mut Self {
        let governor = ResourceGovernor::new(self.options.governor.clone());
        self.governor = governor.with_sampler(sampler);
        self
    }

    /// Attach a best-effort telemetry sink.
    pub fn set_telemetry(&mut self, sink: Arc<dyn TelemetrySink>) -> &mut Self {
        self.telemetry = Some(sink);
        self
    }

    /// Open the event stream and return its receiver. One receiver per
    /// executor; calling again replaces the stream.
    pub fn subscribe(&mut self) -> EventReceiver {
        let (sink, receiver) = channel(self.options.event_buffer, self.options.drain_window);
        self.events = if self.options.enable_streaming { sink } else { EventSink::disabled() };
        receiver
    }

    /// Execute a graph to completion (or suspension) against an initial
    /// state.
    pub async fn execute(
        &self,
        graph: Arc<Graph>,
        initial: ExecutionState,
        cancellation: CancellationToken,
    ) -> Result<ExecutionState> {
        let report = validator::check_graph(&graph, Some(&initial));
        for warning in &report.warnings {
            tracing::warn!(executor = %self.name, %warning, "pre-flight warning");
        }
        if let Some(error) = report.errors.into_iter().next() {
            return Err(GraphError::InvalidGraph(error));
        }

        let execution_id = uuid::Uuid::new_v4().to_string();
        let queue = VecDeque::from([graph.start().to_string()]);

        self.metrics.run_started(&execution_id);
        self.publish(&execution_id, EventPayload::ExecutionStarted).await?;
        self.drive(graph, execution_id, initial, queue, cancellation).await
    }

    /// Run a single node with full lifecycle outside any graph.
    pub async fn execute_node(
        &self,
        node: &dyn Node,
        state: &mut ExecutionState,
        cancellation: CancellationToken,
    ) -> Result<Option<Value>> {
        let report = node.validate(state);
        if !report.is_ok() {
            return Err(GraphError::ValidationFailed {
                node: node.id().to_string(),
                errors: report.errors,
            });
        }

        let ctx = NodeContext::new(uuid::Uuid::new_v4().to_string())
            .with_cancellation(cancellation);
        if let Err(error) = node.before(state, &ctx).await {
            tracing::warn!(node = node.id(), %error, "before hook failed");
        }

        let result = node.execute(state, &ctx).await;
        match result {
            Ok(NodeResult::Value(value)) => {
                if let Err(error) = node.after(state, &ctx).await {
                    tracing::warn!(node = node.id(), %error, "after hook failed");
                }
                Ok(value)
            }
            Ok(NodeResult::Suspend(request)) => Err(GraphError::Suspended(Box::new(
                SuspendedExecution {
                    execution_id: ctx.execution_id.clone(),
                    request_id: request.request_id.clone(),
                    node_id: node.id().to_string(),
                    prompt: request.prompt.clone(),
                    deadline: request.deadline,
                    checkpoint_id: None,
                    suspended_at: Utc::now(),
                },
            ))),
            Err(error) => {
                let context = self.classify(&error, node.id(), 1);
                if let Err(hook_error) = node.on_failure(&context, state, &ctx).await {
                    tracing::warn!(node = node.id(), %hook_error, "on_failure hook failed");
                }
                Err(error)
            }
        }
    }

    /// Run nodes in order against one state, stopping at the first
    /// failure. Returns the last produced value.
    pub async fn execute_sequence(
        &self,
        nodes: &[NodeRef],
        state: &mut ExecutionState,
        cancellation: CancellationToken,
    ) -> Result<Option<Value>> {
        let mut last = None;
        for node in nodes {
            last = self.execute_node(node.as_ref(), state, cancellation.clone()).await?;
        }
        Ok(last)
    }

    /// Edit a suspended run's state before resuming it, applying the
    /// caller's mutation under the run's normal state rules.
    pub fn update_suspended_state<F>(&self, request_id: &str, mutate: F) -> Result<()>
    where
        F: FnOnce(&mut ExecutionState) -> Result<()>,
    {
        let mut suspended = self.suspended.lock().unwrap_or_else(|e| e.into_inner());
        let run = suspended
            .get_mut(request_id)
            .ok_or_else(|| GraphError::CheckpointNotFound(request_id.to_string()))?;
        mutate(&mut run.state)
    }

    /// Deliver a response for a suspended run and drive it onward.
    pub async fn resume(
        &self,
        request_id: &str,
        response: Value,
        cancellation: CancellationToken,
    ) -> Result<ExecutionState> {
        let run = {
            let mut suspended = self.suspended.lock().unwrap_or_else(|e| e.into_inner());
            suspended
                .remove(request_id)
                .ok_or_else(|| GraphError::CheckpointNotFound(request_id.to_string()))?
        };

        let SuspendedRun { graph, execution_id, mut state, queue, node_id, request } = run;

        if Utc::now() > request.deadline {
            return self
                .resume_after_deadline(
                    graph,
                    execution_id,
                    state,
                    queue,
                    node_id,
                    request,
                    cancellation,
                )
                .await;
        }

        state.set_metadata(
            HumanApprovalNode::response_slot(&node_id),
            serde_json::to_string(&response)?,
        )?;
        self.publish(
            &execution_id,
            EventPayload::Resumed { node: node_id, request_id: request.request_id },
        )
        .await?;

        self.drive(graph, execution_id, state, queue, cancellation).await
    }

    /// Rebuild a run from its latest checkpoint (typically after a
    /// process restart) and continue, optionally answering the
    /// suspension that caused the checkpoint.
    pub async fn resume_from_checkpoint(
        &self,
        graph: Arc<Graph>,
        execution_id: &str,
        response: Option<Value>,
        cancellation: CancellationToken,
    ) -> Result<ExecutionState> {
        let manager = self
            .checkpoints
            .as_ref()
            .ok_or_else(|| GraphError::CheckpointNotFound(execution_id.to_string()))?;
        let checkpoint = manager
            .load_latest(execution_id)
            .await?
            .ok_or_else(|| GraphError::CheckpointNotFound(execution_id.to_string()))?;

        let mut state = checkpoint.state;
        let queue: VecDeque<String> = checkpoint.pending_successors.into();

        if let (Some(node_id), Some(response)) = (&checkpoint.current_node, response) {
            state.set_metadata(
                HumanApprovalNode::response_slot(node_id),
                serde_json::to_string(&response)?,
            )?;
            self.publish(
                execution_id,
                EventPayload::Resumed {
                    node: node_id.clone(),
                    request_id: String::new(),
                },
            )
            .await?;
        }

        self.drive(graph, execution_id.to_string(), state, queue, cancellation).await
    }

    #[allow(clippy::too_many_arguments)]
    async fn resume_after_deadline(
        &self,
        graph: Arc<Graph>,
        execution_id: String,
        mut state: ExecutionState,
        mut queue: VecDeque<String>,
        node_id: String,
        request: SuspendRequest,
        cancellation: CancellationToken,
    ) -> Result<ExecutionState> {
        match request.on_deadline {
            DeadlinePolicy::Skip => {
                // Drop the approval node from the queue and continue past it.
                if queue.front().map(String::as_str) == Some(node_id.as_str()) {
                    queue.pop_front();
                }
                state.record_step(ExecutionStep::finished(
                    &node_id,
                    Utc::now(),
                    StepStatus::Skipped,
                    1,
                ));
                self.publish(&execution_id, EventPayload::NodeSkipped { node: node_id.clone() })
                    .await?;
                self.metrics.node_skip(&node_id);

                let node = graph.node(&node_id)?.clone();
                let route_ctx = self.routing_context(&execution_id, 0);
                let successors = self
                    .router
                    .successors(&graph, node.as_ref(), &NodeResult::empty(), &state, &route_ctx)
                    .await?;
                for successor in successors {
                    queue.push_back(successor);
                }
                self.drive(graph, execution_id, state, queue, cancellation).await
            }
            DeadlinePolicy::Fail | DeadlinePolicy::Escalate => {
                let context = ErrorContext::new(
                    ErrorKind::Timeout,
                    format!("approval '{}' deadline elapsed", request.request_id),
                )
                .with_node(&node_id);
                self.publish(
                    &execution_id,
                    EventPayload::ExecutionFailed {
                        kind: context.kind,
                        node: Some(node_id.clone()),
                        message: context.message.clone(),
                    },
                )
                .await?;
                self.metrics.run_finished(&execution_id, RunStatus::Failed(context.kind));
                Err(GraphError::NodeFailed { node: node_id, context })
            }
        }
    }

    /// Shared driver for fresh, resumed, and restored runs.
    async fn drive(
        &self,
        graph: Arc<Graph>,
        execution_id: String,
        mut state: ExecutionState,
        mut queue: VecDeque<String>,
        cancellation: CancellationToken,
    ) -> Result<ExecutionState> {
        let prior_steps: usize =
            state.metadata(STEPS_METADATA_KEY).and_then(|v| v.parse().ok()).unwrap_or(0);
        let rt = RunContext {
            execution_id: execution_id.clone(),
            cancellation,
            deadline: self.options.execution_timeout.map(|t| Instant::now() + t),
            steps: Arc::new(AtomicUsize::new(prior_steps)),
            budget: Arc::new(Mutex::new(
                self.options
                    .budget_units
                    .map_or_else(ResourceBudget::unlimited, ResourceBudget::new),
            )),
            completed_since_checkpoint: Arc::new(AtomicUsize::new(0)),
        };

        let outcome = self.run_loop(&graph, &mut state, &mut queue, &rt, None).await;
        let steps = rt.steps.load(Ordering::SeqCst);
        state.set_engine_metadata(STEPS_METADATA_KEY, steps.to_string());

        match outcome {
            Ok(LoopOutcome::Done) => {
                self.publish(
                    &execution_id,
                    EventPayload::ExecutionCompleted { steps: steps as u64 },
                )
                .await?;
                self.metrics.run_finished(&execution_id, RunStatus::Completed);
                self.emit_telemetry(&execution_id, "execution_completed");
                Ok(state)
            }
            Ok(LoopOutcome::Suspended { node_id, request }) => {
                let checkpoint_id = match &self.checkpoints {
                    Some(manager) if self.options.enable_checkpointing => {
                        let checkpoint = Checkpoint::new(
                            &execution_id,
                            state.clone(),
                            Some(node_id.clone()),
                            queue.iter().cloned().collect(),
                        );
                        Some(manager.save(&checkpoint).await?)
                    }
                    _ => None,
                };

                self.publish(
                    &execution_id,
                    EventPayload::Suspended {
                        node: node_id.clone(),
                        request_id: request.request_id.clone(),
                    },
                )
                .await?;
                self.metrics.run_finished(&execution_id, RunStatus::Suspended);

                let info = SuspendedExecution {
                    execution_id: execution_id.clone(),
                    request_id: request.request_id.clone(),
                    node_id: node_id.clone(),
                    prompt: request.prompt.clone(),
                    deadline: request.deadline,
                    checkpoint_id,
                    suspended_at: Utc::now(),
                };

                let mut suspended = self.suspended.lock().unwrap_or_else(|e| e.into_inner());
                suspended.insert(
                    request.request_id.clone(),
                    SuspendedRun { graph, execution_id, state, queue, node_id, request },
                );
                Err(GraphError::Suspended(Box::new(info)))
            }
            Err(error) => {
                match error.kind() {
                    ErrorKind::Cancellation => {
                        self.publish(&execution_id, EventPayload::ExecutionCanceled).await?;
                        self.metrics.run_finished(&execution_id, RunStatus::Canceled);
                    }
                    kind => {
                        let node = match &error {
                            GraphError::NodeFailed { node, .. } => Some(node.clone()),
                            _ => None,
                        };
                        self.publish(
                            &execution_id,
                            EventPayload::ExecutionFailed {
                                kind,
                                node,
                                message: error.to_string(),
                            },
                        )
                        .await?;
                        self.metrics.run_finished(&execution_id, RunStatus::Failed(kind));
                    }
                }
                self.emit_telemetry(&execution_id, "execution_ended");
                Err(error)
            }
        }
    }

    /// One branch's step loop. `stop_at` marks a fork's join node: the
    /// branch stops *before* executing it.
    async fn run_loop(
        &self,
        graph: &Arc<Graph>,
        state: &mut ExecutionState,
        queue: &mut VecDeque<String>,
        rt: &RunContext,
        stop_at: Option<&str>,
    ) -> Result<LoopOutcome> {
        while let Some(node_id) = queue.pop_front() {
            if rt.cancellation.is_cancelled() {
                return Err(GraphError::Canceled { node: Some(node_id) });
            }
            if let Some(deadline) = rt.deadline {
                if Instant::now() >= deadline {
                    return Err(GraphError::Timeout { scope: "execution".to_string() });
                }
            }

            let step = rt.steps.fetch_add(1, Ordering::SeqCst) + 1;
            if step > self.options.max_execution_steps {
                return Err(GraphError::StepLimitExceeded(step));
            }

            let node = graph.node(&node_id)?.clone();
            self.metrics.step(&rt.execution_id, &node_id);

            if let Some(spec) = node.fork_spec() {
                self.handle_fork(graph, spec.clone(), state, rt).await?;
                self.enqueue(queue, vec![spec.join.clone()], stop_at);
                continue;
            }

            // Routing-only nodes and declined should_execute both skip
            // execution and route directly.
            if !node.is_executable() || !node.should_execute(state) {
                if node.is_executable() {
                    state.record_step(ExecutionStep::finished(
                        &node_id,
                        Utc::now(),
                        StepStatus::Skipped,
                        1,
                    ));
                    self.publish(
                        &rt.execution_id,
                        EventPayload::NodeSkipped { node: node_id.clone() },
                    )
                    .await?;
                    self.metrics.node_skip(&node_id);
                }
                let route_ctx = self.routing_context(&rt.execution_id, step);
                let successors = self
                    .router
                    .successors(graph, node.as_ref(), &NodeResult::empty(), state, &route_ctx)
                    .await?;
                self.enqueue(queue, successors, stop_at);
                continue;
            }

            match self.run_step(&node, state, rt, step).await? {
                StepOutcome::Completed(result) => {
                    let route_ctx = self.routing_context(&rt.execution_id, step);
                    let successors = self
                        .router
                        .successors(graph, node.as_ref(), &result, state, &route_ctx)
                        .await?;
                    self.enqueue(queue, successors, stop_at);
                    self.maybe_checkpoint(graph, state, queue, rt, &node_id).await?;
                }
                StepOutcome::Skipped => {
                    let route_ctx = self.routing_context(&rt.execution_id, step);
                    let successors = self
                        .router
                        .successors(graph, node.as_ref(), &NodeResult::empty(), state, &route_ctx)
                        .await?;
                    self.enqueue(queue, successors, stop_at);
                }
                StepOutcome::Routed(targets) => {
                    for target in &targets {
                        if !graph.contains(target) {
                            return Err(GraphError::NodeNotFound(target.clone()));
                        }
                    }
                    self.enqueue(queue, targets, stop_at);
                }
                StepOutcome::Suspended(request) => {
                    queue.push_front(node_id.clone());
                    return Ok(LoopOutcome::Suspended { node_id, request });
                }
                StepOutcome::Halted(error) => return Err(error),
            }
        }

        Ok(LoopOutcome::Done)
    }

    /// One node execution with admission, lifecycle, and the policy-driven
    /// retry loop.
    async fn run_step(
        &self,
        node: &NodeRef,
        state: &mut ExecutionState,
        rt: &RunContext,
        step: usize,
    ) -> Result<StepOutcome> {
        let node_id = node.id().to_string();

        // Validation failures flow through the policy pipeline like any
        // other failure.
        let report = node.validate(state);
        if !report.is_ok() {
            let context = ErrorContext::new(ErrorKind::Validation, report.errors.join("; "))
                .with_node(&node_id);
            return self.apply_policy(node, state, rt, context, None).await;
        }

        // Circuit breaker admission
        if let Some((decision, transition)) =
            self.breakers.with_breaker(&node_id, |b| b.admit())
        {
            self.publish_transition(&rt.execution_id, &node_id, transition).await?;
            if decision == CircuitDecision::Reject {
                let context = ErrorContext::new(
                    ErrorKind::CircuitBreakerOpen,
                    format!("circuit open for '{node_id}'"),
                )
                .with_node(&node_id);
                self.publish(
                    &rt.execution_id,
                    EventPayload::NodeFailed {
                        node: node_id.clone(),
                        kind: context.kind,
                        message: context.message.clone(),
                    },
                )
                .await?;
                return self.apply_policy(node, state, rt, context, None).await;
            }
        }

        // Budget is charged before the work happens
        let budget_cost = node.budget_cost();
        if budget_cost > 0.0 {
            let charge = {
                let mut budget = rt.budget.lock().unwrap_or_else(|e| e.into_inner());
                budget.charge(&node_id, budget_cost)
            };
            if let Err(error) = charge {
                let (requested, remaining) = match &error {
                    GraphError::BudgetExhausted { requested, remaining, .. } => {
                        (*requested, *remaining)
                    }
                    _ => (budget_cost, 0.0),
                };
                self.publish(
                    &rt.execution_id,
                    EventPayload::BudgetExceeded { node: node_id.clone(), requested, remaining },
                )
                .await?;
                if self.breakers.trips_on_budget(&node_id) {
                    let transition =
                        self.breakers.with_breaker(&node_id, |b| b.record_failure()).flatten();
                    self.publish_transition(&rt.execution_id, &node_id, transition).await?;
                }
                let context = ErrorContext::new(ErrorKind::BudgetExhausted, error.to_string())
                    .with_node(&node_id);
                return self.apply_policy(node, state, rt, context, None).await;
            }
        }

        // Governor lease, held for the whole step including retries.
        // Nodes at the default priority inherit the configured one.
        let _lease = if self.options.enable_resource_governance {
            let priority = match node.priority() {
                Priority::Normal => self.options.default_priority,
                declared => declared,
            };
            Some(self.governor.acquire(node.cost(), priority, &rt.cancellation).await?)
        } else {
            None
        };

        let mut attempt = state.attempt_counter(&node_id) + 1;

        loop {
            state.set_attempt_counter(&node_id, attempt);
            let ctx = NodeContext::new(rt.execution_id.clone())
                .with_step(step)
                .with_attempt(attempt)
                .with_cancellation(rt.cancellation.clone());

            self.publish(
                &rt.execution_id,
                EventPayload::NodeStarted { node: node_id.clone(), attempt },
            )
            .await?;

            if let Err(error) = node.before(state, &ctx).await {
                tracing::warn!(node = %node_id, %error, "before hook failed");
            }

            let started_utc = Utc::now();
            let started = Instant::now();
            let outcome = self.execute_bounded(node, state, rt, &ctx).await;
            let duration_ms = started.elapsed().as_millis() as u64;

            match outcome {
                Ok(NodeResult::Suspend(request)) => {
                    return Ok(StepOutcome::Suspended(request));
                }
                Ok(result) => {
                    if let Err(error) = node.after(state, &ctx).await {
                        tracing::warn!(node = %node_id, %error, "after hook failed");
                    }
                    let transition =
                        self.breakers.with_breaker(&node_id, |b| b.record_success()).flatten();
                    self.publish_transition(&rt.execution_id, &node_id, transition).await?;

                    self.metrics.node_success(&node_id, duration_ms);
                    state.record_step(ExecutionStep::finished(
                        &node_id,
                        started_utc,
                        StepStatus::Ok,
                        attempt,
                    ));
                    state.set_attempt_counter(&node_id, 0);
                    rt.completed_since_checkpoint.fetch_add(1, Ordering::SeqCst);
                    self.publish(
                        &rt.execution_id,
                        EventPayload::NodeCompleted { node: node_id.clone(), duration_ms },
                    )
                    .await?;
                    self.publish(
                        &rt.execution_id,
                        EventPayload::MetricSample {
                            data: serde_json::json!({
                                "node": node_id,
                                "duration_ms": duration_ms,
                                "attempt": attempt,
                                "step": step,
                            }),
                        },
                    )
                    .await?;
                    return Ok(StepOutcome::Completed(result));
                }
                Err(error) => {
                    let context = self.classify(&error, &node_id, attempt);
                    if let Err(hook_error) = node.on_failure(&context, state, &ctx).await {
                        tracing::warn!(node = %node_id, %hook_error, "on_failure hook failed");
                    }

                    self.metrics.node_failure(&node_id, context.kind, duration_ms);
                    self.publish(
                        &rt.execution_id,
                        EventPayload::NodeFailed {
                            node: node_id.clone(),
                            kind: context.kind,
                            message: context.message.clone(),
                        },
                    )
                    .await?;
                    if context.kind == ErrorKind::RateLimit {
                        self.publish(
                            &rt.execution_id,
                            EventPayload::RateLimited { node: node_id.clone() },
                        )
                        .await?;
                    }

                    if context.kind != ErrorKind::CircuitBreakerOpen {
                        let transition = self
                            .breakers
                            .with_breaker(&node_id, |b| b.record_failure())
                            .flatten();
                        self.publish_transition(&rt.execution_id, &node_id, transition).await?;
                    }

                    if !self.options.enable_error_recovery {
                        state.record_step(
                            ExecutionStep::finished(
                                &node_id,
                                started_utc,
                                StepStatus::Failed,
                                attempt,
                            )
                            .with_error_kind(context.kind),
                        );
                        return Ok(StepOutcome::Halted(GraphError::NodeFailed {
                            node: node_id,
                            context,
                        }));
                    }

                    let resolved = self.policies.resolve(&context, &node_id);
                    if resolved.action == RecoveryAction::Retry
                        && resolved.retryable
                        && resolved.retry.should_retry(attempt)
                    {
                        let mut rng = self.jitter_rng(rt, &node_id, attempt);
                        let delay = resolved.retry.delay_for(attempt, &mut rng);
                        self.publish(
                            &rt.execution_id,
                            EventPayload::NodeRetried {
                                node: node_id.clone(),
                                attempt: attempt + 1,
                                delay_ms: delay.as_millis() as u64,
                            },
                        )
                        .await?;
                        self.metrics.node_retry(&node_id);
                        state.record_step(ExecutionStep::finished(
                            &node_id,
                            started_utc,
                            StepStatus::Retried,
                            attempt,
                        ));

                        tokio::select! {
                            _ = rt.cancellation.cancelled() => {
                                return Ok(StepOutcome::Halted(GraphError::Canceled {
                                    node: Some(node_id),
                                }));
                            }
                            _ = tokio::time::sleep(delay) => {}
                        }
                        attempt += 1;
                        continue;
                    }

                    state.record_step(
                        ExecutionStep::finished(&node_id, started_utc, StepStatus::Failed, attempt)
                            .with_error_kind(context.kind),
                    );
                    return self.apply_policy(node, state, rt, context, Some(resolved)).await;
                }
            }
        }
    }

    /// Apply a resolved recovery action (everything except the in-loop
    /// Retry case).
    async fn apply_policy(
        &self,
        node: &NodeRef,
        state: &mut ExecutionState,
        rt: &RunContext,
        context: ErrorContext,
        resolved: Option<crate::policy::ResolvedPolicy>,
    ) -> Result<StepOutcome> {
        let node_id = node.id().to_string();
        if !self.options.enable_error_recovery {
            return Ok(StepOutcome::Halted(GraphError::NodeFailed { node: node_id, context }));
        }

        let resolved = resolved.unwrap_or_else(|| self.policies.resolve(&context, &node_id));
        match resolved.action {
            RecoveryAction::Skip => {
                state.record_step(ExecutionStep::finished(
                    &node_id,
                    Utc::now(),
                    StepStatus::Skipped,
                    context.attempt,
                ));
                self.publish(&rt.execution_id, EventPayload::NodeSkipped { node: node_id.clone() })
                    .await?;
                self.metrics.node_skip(&node_id);
                Ok(StepOutcome::Skipped)
            }
            RecoveryAction::Fallback | RecoveryAction::Escalate => {
                match resolved.fallback_node {
                    Some(target) => {
                        self.stash_error(state, &node_id, &context);
                        Ok(StepOutcome::Routed(vec![target]))
                    }
                    None => Ok(StepOutcome::Halted(GraphError::NodeFailed {
                        node: node_id,
                        context,
                    })),
                }
            }
            RecoveryAction::CircuitBreaker => {
                let transition =
                    self.breakers.with_breaker(&node_id, |b| b.force_open()).flatten();
                self.publish_transition(&rt.execution_id, &node_id, transition).await?;
                match resolved.fallback_node {
                    Some(target) => {
                        self.stash_error(state, &node_id, &context);
                        Ok(StepOutcome::Routed(vec![target]))
                    }
                    None => Ok(StepOutcome::Halted(GraphError::NodeFailed {
                        node: node_id,
                        context,
                    })),
                }
            }
            RecoveryAction::Rollback => {
                let rolled_back = state.rollback_innermost();
                if !rolled_back {
                    tracing::warn!(node = %node_id, "rollback requested with no open transaction");
                }
                match resolved.fallback_node {
                    Some(target) => {
                        self.stash_error(state, &node_id, &context);
                        Ok(StepOutcome::Routed(vec![target]))
                    }
                    None => Ok(StepOutcome::Halted(GraphError::NodeFailed {
                        node: node_id,
                        context,
                    })),
                }
            }
            RecoveryAction::Continue => {
                self.metrics.node_success(&node_id, 0);
                state.record_step(ExecutionStep::finished(
                    &node_id,
                    Utc::now(),
                    StepStatus::Ok,
                    context.attempt,
                ));
                self.publish(
                    &rt.execution_id,
                    EventPayload::NodeCompleted { node: node_id.clone(), duration_ms: 0 },
                )
                .await?;
                Ok(StepOutcome::Completed(NodeResult::empty()))
            }
            RecoveryAction::Retry | RecoveryAction::Halt => {
                Ok(StepOutcome::Halted(GraphError::NodeFailed { node: node_id, context }))
            }
        }
    }

    /// Execute one attempt under the node/run deadline and cancellation.
    async fn execute_bounded(
        &self,
        node: &NodeRef,
        state: &mut ExecutionState,
        rt: &RunContext,
        ctx: &NodeContext,
    ) -> Result<NodeResult> {
        let node_budget = self.options.node_timeout;
        let run_budget = rt.deadline.map(|d| d.saturating_duration_since(Instant::now()));
        let budget = match (node_budget, run_budget) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (Some(a), None) => Some(a),
            (None, Some(b)) => Some(b),
            (None, None) => None,
        };

        let cancellation = rt.cancellation.clone();
        let execute = node.execute(state, ctx);
        match budget {
            Some(budget) => tokio::select! {
                _ = cancellation.cancelled() => {
                    Err(GraphError::Canceled { node: Some(node.id().to_string()) })
                }
                result = tokio::time::timeout(budget, execute) => match result {
                    Ok(result) => result,
                    Err(_) => {
                        Err(GraphError::Timeout { scope: format!("node '{}'", node.id()) })
                    }
                },
            },
            None => tokio::select! {
                _ = cancellation.cancelled() => {
                    Err(GraphError::Canceled { node: Some(node.id().to_string()) })
                }
                result = execute => result,
            },
        }
    }

    /// Fan out a fork's branches, each over an isolated copy-on-write
    /// scope, and merge their overlays back in declared order.
    async fn handle_fork(
        &self,
        graph: &Arc<Graph>,
        spec: crate::node::ForkSpec,
        state: &mut ExecutionState,
        rt: &RunContext,
    ) -> Result<()> {
        self.checkpoint_boundary(graph, state, rt).await?;

        let fork_token = rt.cancellation.child_token();
        let base = state.clone();

        let mut pending: FuturesUnordered<BoxFuture<'_, (usize, Result<ExecutionState>)>> =
            FuturesUnordered::new();
        let mut waiting: VecDeque<(usize, &String)> =
            spec.branches.iter().enumerate().collect();
        let cap = self.options.max_parallel_nodes.max(1);

        let mut results: Vec<Option<Result<ExecutionState>>> =
            (0..spec.branches.len()).map(|_| None).collect();

        loop {
            while pending.len() < cap {
                let Some((index, entry)) = waiting.pop_front() else {
                    break;
                };
                let branch_rt = rt.for_branch(fork_token.clone());
                let branch_state = base.branch_scope();
                let fut = self.run_branch(
                    graph.clone(),
                    branch_state,
                    entry.clone(),
                    spec.join.clone(),
                    branch_rt,
                );
                pending.push(Box::pin(async move { (index, fut.await) }));
            }

            let Some((index, result)) = pending.next().await else {
                break;
            };
            if result.is_err() {
                // Let siblings wind down quickly
                fork_token.cancel();
            }
            results[index] = Some(result);
        }

        // First non-cancellation failure in declared branch order wins;
        // sibling cancellations triggered by that failure lose to it.
        let mut branch_states = Vec::with_capacity(results.len());
        let mut canceled = None;
        for result in results.into_iter().flatten() {
            match result {
                Ok(branch_state) => branch_states.push(branch_state),
                Err(error @ GraphError::Canceled { .. }) => canceled = Some(error),
                Err(error) => return Err(error),
            }
        }
        if let Some(error) = canceled {
            return Err(error);
        }

        // Merge each branch's overlay (its writes relative to the fork
        // point) left to right in declared order.
        let policies = spec.merge.as_ref().unwrap_or(&self.options.merge_policies);
        let mut merged = base.clone();
        let mut branch_steps = vec![];
        for branch_state in branch_states {
            branch_steps.extend(branch_state.history().to_vec());
            let overlay = overlay_of(&base, &branch_state);
            let outcome = merge(&merged, &overlay, policies)?;
            for conflict in &outcome.conflicts {
                tracing::warn!(
                    key = %conflict.key,
                    policy = conflict.policy,
                    reason = %conflict.reason,
                    "merge conflict at join; base value kept"
                );
            }
            merged = outcome.state;
        }
        for step in branch_steps {
            merged.record_step(step);
        }

        *state = merged;
        self.checkpoint_boundary(graph, state, rt).await?;
        Ok(())
    }

    /// One fork branch, boxed to allow nested forks.
    fn run_branch<'a>(
        &'a self,
        graph: Arc<Graph>,
        mut state: ExecutionState,
        entry: String,
        join: String,
        rt: RunContext,
    ) -> BoxFuture<'a, Result<ExecutionState>> {
        Box::pin(async move {
            let mut queue = VecDeque::from([entry]);
            match self.run_loop(&graph, &mut state, &mut queue, &rt, Some(&join)).await? {
                LoopOutcome::Done => Ok(state),
                LoopOutcome::Suspended { node_id, .. } => Err(GraphError::NodeFailed {
                    node: node_id.clone(),
                    context: ErrorContext::new(
                        ErrorKind::NodeExecution,
                        "suspension inside a parallel branch is not supported",
                    )
                    .with_node(node_id),
                }),
            }
        })
    }

    fn enqueue(&self, queue: &mut VecDeque<String>, successors: Vec<String>, stop_at: Option<&str>) {
        for successor in successors {
            if stop_at == Some(successor.as_str()) {
                continue;
            }
            queue.push_back(successor);
        }
    }

    async fn maybe_checkpoint(
        &self,
        _graph: &Arc<Graph>,
        state: &mut ExecutionState,
        queue: &VecDeque<String>,
        rt: &RunContext,
        current_node: &str,
    ) -> Result<()> {
        if !self.options.enable_checkpointing {
            return Ok(());
        }
        let Some(manager) = &self.checkpoints else {
            return Ok(());
        };
        let due = rt.completed_since_checkpoint.load(Ordering::SeqCst)
            >= self.options.checkpoint_every_n_nodes;
        if !due {
            return Ok(());
        }
        rt.completed_since_checkpoint.store(0, Ordering::SeqCst);

        state.set_engine_metadata(
            STEPS_METADATA_KEY,
            rt.steps.load(Ordering::SeqCst).to_string(),
        );
        let checkpoint = Checkpoint::new(
            &rt.execution_id,
            state.clone(),
            Some(current_node.to_string()),
            queue.iter().cloned().collect(),
        );
        let checkpoint_id = manager.save(&checkpoint).await?;
        self.publish(
            &rt.execution_id,
            EventPayload::CheckpointCreated { checkpoint_id, name: None },
        )
        .await
    }

    /// Fork/join boundary checkpoints are unconditional when enabled.
    async fn checkpoint_boundary(
        &self,
        _graph: &Arc<Graph>,
        state: &mut ExecutionState,
        rt: &RunContext,
    ) -> Result<()> {
        if !self.options.enable_checkpointing {
            return Ok(());
        }
        let Some(manager) = &self.checkpoints else {
            return Ok(());
        };
        state.set_engine_metadata(
            STEPS_METADATA_KEY,
            rt.steps.load(Ordering::SeqCst).to_string(),
        );
        let checkpoint =
            Checkpoint::new(&rt.execution_id, state.clone(), None, vec![]);
        let checkpoint_id = manager.save(&checkpoint).await?;
        self.publish(
            &rt.execution_id,
            EventPayload::CheckpointCreated { checkpoint_id, name: None },
        )
        .await
    }

    fn routing_context(&self, execution_id: &str, step: usize) -> RoutingContext {
        let mut ctx =
            RoutingContext::new(execution_id, step, self.options.determinism_seed);
        if self.options.enable_dynamic_routing {
            ctx = ctx.with_metrics(self.metrics.clone());
        }
        ctx
    }

    /// Classification happens once per failure; errors that already know
    /// their kind keep it, generic node failures go through the message
    /// rules.
    fn classify(&self, error: &GraphError, node_id: &str, attempt: u32) -> ErrorContext {
        if let GraphError::NodeFailed { context, .. } = error {
            return context.clone().with_node(node_id).with_attempt(attempt);
        }
        let kind = error.kind();
        let hint = if kind == ErrorKind::NodeExecution { None } else { Some(kind) };
        self.policies
            .classify(hint, &error.to_string())
            .with_node(node_id)
            .with_attempt(attempt)
    }

    fn stash_error(&self, state: &mut ExecutionState, node_id: &str, context: &ErrorContext) {
        state.set_engine_metadata(ERROR_KIND_KEY, context.kind.to_string());
        state.set_engine_metadata(ERROR_NODE_KEY, node_id);
    }

    fn jitter_rng(&self, rt: &RunContext, node_id: &str, attempt: u32) -> StdRng {
        match self.options.determinism_seed {
            Some(seed) => {
                let mut hasher = DefaultHasher::new();
                seed.hash(&mut hasher);
                rt.execution_id.hash(&mut hasher);
                node_id.hash(&mut hasher);
                attempt.hash(&mut hasher);
                StdRng::seed_from_u64(hasher.finish())
            }
            None => StdRng::from_entropy(),
        }
    }

    async fn publish(&self, execution_id: &str, payload: EventPayload) -> Result<()> {
        self.events.publish(execution_id, payload).await
    }

    async fn publish_transition(
        &self,
        execution_id: &str,
        node_id: &str,
        transition: Option<CircuitTransition>,
    ) -> Result<()> {
        match transition {
            Some(CircuitTransition::Opened) => {
                self.metrics.circuit_transition(node_id);
                self.publish(
                    execution_id,
                    EventPayload::CircuitOpened { node: node_id.to_string() },
                )
                .await
            }
            Some(CircuitTransition::Closed) => {
                self.metrics.circuit_transition(node_id);
                self.publish(
                    execution_id,
                    EventPayload::CircuitClosed { node: node_id.to_string() },
                )
                .await
            }
            Some(CircuitTransition::HalfOpened) | None => Ok(()),
        }
    }

    fn emit_telemetry(&self, execution_id: &str, event: &str) {
        if let Some(sink) = &self.telemetry {
            sink.emit(&serde_json::json!({
                "executor": self.name,
                "execution_id": execution_id,
                "event": event,
            }));
        }
    }
}
