//! Error types for skein-graph

use chrono::{DateTime, Utc};
use skein_core::{CoreError, ErrorContext, ErrorKind, ValueKind};
use thiserror::Error;

/// Result type for graph operations
pub type Result<T> = std::result::Result<T, GraphError>;

/// Errors that can occur while building, validating, or executing a graph.
#[derive(Error, Debug)]
pub enum GraphError {
    /// Graph structure is invalid
    #[error("Invalid graph structure: {0}")]
    InvalidGraph(String),

    /// Node not found
    #[error("Node not found: {0}")]
    NodeNotFound(String),

    /// Edge endpoint not found
    #[error("Edge endpoint not found: {from} -> {to}")]
    EdgeEndpointNotFound { from: String, to: String },

    /// No start node declared
    #[error("No start node declared")]
    MissingStartNode,

    /// Graph mutated after execution began
    #[error("Graph is frozen: execution has already begun")]
    GraphFrozen,

    /// No edge matched and the node declared no default successor
    #[error("Routing dead end at node '{0}': no edge matched")]
    RoutingDeadEnd(String),

    /// Engine-wide step budget exhausted
    #[error("Execution step limit exceeded after {0} steps")]
    StepLimitExceeded(usize),

    /// A loop node exhausted its iteration bound
    #[error("Loop limit exceeded at node '{node}' after {iterations} iterations")]
    LoopLimitExceeded { node: String, iterations: usize },

    /// A node failed and policy resolution chose to halt
    #[error("Node '{node}' failed: {context:?}")]
    NodeFailed { node: String, context: ErrorContext },

    /// Execution suspended awaiting an external response
    #[error("Execution suspended awaiting response for request '{}'", .0.request_id)]
    Suspended(Box<SuspendedExecution>),

    /// Execution was canceled
    #[error("Execution canceled{}", .node.as_ref().map(|n| format!(" at node '{n}'")).unwrap_or_default())]
    Canceled { node: Option<String> },

    /// A wall-clock deadline elapsed
    #[error("Timeout in {scope}")]
    Timeout { scope: String },

    /// A circuit breaker is open for the node
    #[error("Circuit breaker open for node '{0}'")]
    CircuitOpen(String),

    /// A resource budget would be exceeded
    #[error("Budget exhausted at node '{node}': requested {requested}, remaining {remaining}")]
    BudgetExhausted { node: String, requested: f64, remaining: f64 },

    /// Governor rejected or timed out an acquire
    #[error("Resource governor: {0}")]
    Governor(String),

    /// Empty state key
    #[error("State keys must be non-empty")]
    EmptyKey,

    /// Missing state key
    #[error("State key not found: {0}")]
    KeyNotFound(String),

    /// Scalar type changed without an explicit replace
    #[error("Type mismatch for key '{key}': expected {expected}, got {actual}")]
    TypeMismatch { key: String, expected: ValueKind, actual: ValueKind },

    /// Transaction handle is unknown or not innermost
    #[error("Transaction error: {0}")]
    Transaction(String),

    /// Merge failed under FailOnConflict
    #[error("Merge conflict on key '{0}'")]
    MergeConflict(String),

    /// Serialized state is older than the minimum supported version
    #[error("State version {found} is below minimum supported {minimum}")]
    VersionIncompatible { found: String, minimum: String },

    /// No migration path between two schema versions
    #[error("No migration registered from {from} to {to}")]
    MigrationMissing { from: String, to: String },

    /// Stored checksum does not match the canonical bytes
    #[error("State checksum mismatch")]
    ChecksumMismatch,

    /// Checkpoint not found
    #[error("Checkpoint not found: {0}")]
    CheckpointNotFound(String),

    /// Event stream could not drain a lifecycle event in time
    #[error("Event stream overflow: lifecycle events could not be drained")]
    EventOverflow,

    /// Node validation reported errors
    #[error("Validation failed for node '{node}': {errors:?}")]
    ValidationFailed { node: String, errors: Vec<String> },

    /// Collaborator adapter error
    #[error("Adapter error: {0}")]
    Core(#[from] CoreError),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl GraphError {
    /// Map this error into the closed taxonomy.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidGraph(_)
            | Self::NodeNotFound(_)
            | Self::EdgeEndpointNotFound { .. }
            | Self::MissingStartNode
            | Self::GraphFrozen
            | Self::RoutingDeadEnd(_)
            | Self::StepLimitExceeded(_)
            | Self::LoopLimitExceeded { .. } => ErrorKind::GraphStructure,
            Self::NodeFailed { context, .. } => context.kind,
            Self::Suspended(_) => ErrorKind::NodeExecution,
            Self::Canceled { .. } => ErrorKind::Cancellation,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::CircuitOpen(_) => ErrorKind::CircuitBreakerOpen,
            Self::BudgetExhausted { .. } => ErrorKind::BudgetExhausted,
            Self::Governor(_) | Self::EventOverflow => ErrorKind::ResourceExhaustion,
            Self::EmptyKey
            | Self::KeyNotFound(_)
            | Self::TypeMismatch { .. }
            | Self::ValidationFailed { .. } => ErrorKind::Validation,
            Self::Transaction(_) | Self::MergeConflict(_) => ErrorKind::NodeExecution,
            Self::VersionIncompatible { .. }
            | Self::MigrationMissing { .. }
            | Self::ChecksumMismatch
            | Self::CheckpointNotFound(_) => ErrorKind::Validation,
            Self::Core(e) => e.kind_hint().unwrap_or(ErrorKind::NodeExecution),
            Self::Json(_) => ErrorKind::Validation,
            Self::Io(_) => ErrorKind::Network,
        }
    }
}

/// Resume handle surfaced when a branch suspends for human input.
#[derive(Debug, Clone)]
pub struct SuspendedExecution {
    /// Execution this suspension belongs to
    pub execution_id: String,
    /// Key the caller must answer with
    pub request_id: String,
    /// Node that suspended
    pub node_id: String,
    /// Prompt shown to the human
    pub prompt: String,
    /// Deadline after which the node's deadline policy applies
    pub deadline: DateTime<Utc>,
    /// Checkpoint written just before suspension, when checkpointing is on
    pub checkpoint_id: Option<String>,
    /// When the suspension occurred
    pub suspended_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_mapping() {
        assert_eq!(GraphError::MissingStartNode.kind(), ErrorKind::GraphStructure);
        assert_eq!(
            GraphError::Timeout { scope: "node 'x'".into() }.kind(),
            ErrorKind::Timeout
        );
        assert_eq!(GraphError::CircuitOpen("api".into()).kind(), ErrorKind::CircuitBreakerOpen);
        assert_eq!(GraphError::Canceled { node: None }.kind(), ErrorKind::Cancellation);
        assert_eq!(
            GraphError::LoopLimitExceeded { node: "w".into(), iterations: 3 }.kind(),
            ErrorKind::GraphStructure
        );
    }

    #[test]
    fn test_node_failed_carries_classification() {
        let context = ErrorContext::new(ErrorKind::RateLimit, "429");
        let err = GraphError::NodeFailed { node: "llm".into(), context };
        assert_eq!(err.kind(), ErrorKind::RateLimit);
    }
}
