//! # skein-graph
//!
//! Stateful workflow graph engine for LLM pipelines: nodes cooperating
//! through a shared typed key/value state, walked by a cooperative
//! scheduler with explicit fork/join parallelism, policy-driven error
//! recovery, circuit breakers, resource budgets, admission control,
//! checkpointing, and an ordered event stream.
//!
//! ## Quick start
//!
//! ```rust,ignore
//! use skein_graph::prelude::*;
//!
//! let graph = Graph::builder()
//!     .add_node(FunctionNode::new("upper", |state| {
//!         let input = state.get_str("input").unwrap_or_default().to_uppercase();
//!         state.set("output", input)?;
//!         Ok(None)
//!     }))
//!     .mark_terminal("upper")
//!     .build()?;
//!
//! let executor = Executor::new("demo");
//! let initial = ExecutionState::new().with_entry("input", "hello");
//! let final_state = executor
//!     .execute(Arc::new(graph), initial, CancellationToken::new())
//!     .await?;
//! assert_eq!(final_state.get_str("output"), Some("HELLO"));
//! ```
//!
//! Shared contracts (state values, the error taxonomy, adapter traits)
//! live in `skein-core`.

pub mod breaker;
pub mod budget;
pub mod checkpoint;
pub mod codec;
pub mod edge;
pub mod error;
pub mod executor;
pub mod governor;
pub mod graph;
pub mod merge;
pub mod metrics;
pub mod node;
pub mod nodes;
pub mod policy;
pub mod routing;
pub mod state;
pub mod stream;
pub mod validator;

// Re-exports
pub use breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
pub use budget::ResourceBudget;
pub use checkpoint::{Checkpoint, CheckpointManager, MemoryCheckpointStore};
pub use codec::{Migration, StateCodec, CURRENT_SCHEMA, MINIMUM_SUPPORTED};
pub use edge::{Edge, Predicates};
pub use error::{GraphError, Result, SuspendedExecution};
pub use executor::{ExecutionOptions, Executor};
pub use governor::{
    GovernorConfig, LoadSample, LoadSampler, Priority, ResourceGovernor, StaticLoadSampler,
    SystemLoadSampler,
};
pub use graph::{Graph, GraphBuilder, GraphMutation};
pub use merge::{merge, overlay_of, MergeOutcome, MergePolicies, MergePolicy};
pub use metrics::{MetricsCollector, NodeMetrics, RunMetrics, RunStatus};
pub use node::{
    DeadlinePolicy, ForkSpec, FunctionNode, Node, NodeContext, NodeRef, NodeResult,
    PassthroughNode, SuspendRequest, ValidationReport,
};
pub use nodes::{
    ConditionalNode, ErrorHandlerNode, ForeachNode, ForkNode, HumanApprovalNode, InvokerNode,
    RemoteSubgraphNode, RemoteSubgraphRunner, RestToolNode, RetryNode, SubgraphNode, SwitchNode,
    WhileNode,
};
pub use policy::{
    ErrorPolicyRegistry, JitterMode, PolicyRule, RecoveryAction, RetryPolicy, RetryStrategy,
    RuleMatch,
};
pub use routing::{
    FirstMatchRouting, HistoryRouting, ProbabilisticRouting, RouteDecision, RoutingStrategy,
    SimilarityRouting,
};
pub use state::{ExecutionState, ExecutionStep, StateVersion, StepStatus};
pub use stream::{EventPayload, EventReceiver, ExecutionEvent};
pub use validator::GraphValidation;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::checkpoint::{Checkpoint, CheckpointManager, MemoryCheckpointStore};
    pub use crate::edge::{Edge, Predicates};
    pub use crate::error::{GraphError, Result, SuspendedExecution};
    pub use crate::executor::{ExecutionOptions, Executor};
    pub use crate::governor::Priority;
    pub use crate::graph::{Graph, GraphBuilder};
    pub use crate::merge::{MergePolicies, MergePolicy};
    pub use crate::node::{
        FunctionNode, Node, NodeContext, NodeResult, PassthroughNode, ValidationReport,
    };
    pub use crate::nodes::{
        ConditionalNode, ErrorHandlerNode, ForeachNode, ForkNode, HumanApprovalNode,
        InvokerNode, RestToolNode, RetryNode, SubgraphNode, SwitchNode, WhileNode,
    };
    pub use crate::policy::{PolicyRule, RecoveryAction, RetryPolicy};
    pub use crate::state::ExecutionState;
    pub use crate::stream::{EventPayload, ExecutionEvent};
    pub use skein_core::{ErrorContext, ErrorKind, Severity, Value};
    pub use std::sync::Arc;
    pub use tokio_util::sync::CancellationToken;
}
