//! Abstract contracts for external collaborators
//!
//! The engine consumes these traits and never a concrete provider:
//! LLM/function invocation, REST tools, secrets, identity, checkpoint
//! storage, telemetry, human interaction, and embeddings all cross this
//! boundary.

use crate::error::Result;
use crate::value::Value;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::time::Duration;

/// Named inputs/outputs exchanged with adapters.
pub type ValueMap = BTreeMap<String, Value>;

/// Invokes a named function (typically an LLM prompt function).
///
/// Streaming is not part of this contract; incremental output reaches
/// observers through the engine's event stream.
#[async_trait]
pub trait FunctionInvoker: Send + Sync {
    async fn invoke(&self, function: &str, inputs: &ValueMap) -> Result<ValueMap>;
}

/// Description of a REST tool the engine can call through an adapter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolSchema {
    /// Tool name, unique within the adapter
    pub name: String,
    /// Human-readable description
    pub description: String,
    /// Declared input keys (advisory)
    pub input_keys: Vec<String>,
}

impl ToolSchema {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self { name: name.into(), description: description.into(), input_keys: vec![] }
    }

    pub fn with_input_keys(mut self, keys: &[&str]) -> Self {
        self.input_keys = keys.iter().map(|k| (*k).to_string()).collect();
        self
    }
}

/// One tool invocation, with per-call timeout and idempotency key
/// passed through to the transport.
#[derive(Debug, Clone)]
pub struct ToolRequest {
    pub schema: ToolSchema,
    pub inputs: ValueMap,
    pub timeout: Option<Duration>,
    pub idempotency_key: Option<String>,
}

impl ToolRequest {
    pub fn new(schema: ToolSchema, inputs: ValueMap) -> Self {
        Self { schema, inputs, timeout: None, idempotency_key: None }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }
}

/// Transport binding for REST tools.
#[async_trait]
pub trait ToolAdapter: Send + Sync {
    async fn call(&self, request: ToolRequest) -> Result<ValueMap>;
}

/// Resolves named secrets; `Ok(None)` means not found.
#[async_trait]
pub trait SecretResolver: Send + Sync {
    async fn resolve(&self, name: &str) -> Result<Option<String>>;
}

/// Authenticated principal returned by an identity validator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    pub subject: String,
    pub claims: BTreeMap<String, String>,
}

/// Validates bearer tokens for the hosting layer.
#[async_trait]
pub trait IdentityValidator: Send + Sync {
    /// Returns the principal or an `Identity` error for rejected tokens.
    async fn validate_bearer(&self, token: &str) -> Result<Principal>;
}

/// Durable, ordered storage for checkpoint payloads.
///
/// Implementations must preserve insertion order per execution via
/// monotonic keys; `list` returns keys in that order.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    async fn put(&self, key: &str, bytes: Vec<u8>, metadata: BTreeMap<String, String>)
        -> Result<()>;
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;
    async fn list(&self, execution_id: &str) -> Result<Vec<String>>;
    async fn delete(&self, key: &str) -> Result<()>;
}

/// Best-effort telemetry fan-out. Implementations must not panic and
/// should drop rather than block.
pub trait TelemetrySink: Send + Sync {
    fn emit(&self, event: &serde_json::Value);
}

/// Outcome of a human interaction request.
#[derive(Debug, Clone, PartialEq)]
pub enum HumanResponse {
    /// The human answered before the deadline
    Response(Value),
    /// The deadline elapsed
    TimedOut,
    /// The request was withdrawn
    Canceled,
}

/// Channel through which suspended executions reach a human.
#[async_trait]
pub trait HumanChannel: Send + Sync {
    async fn request(&self, prompt: &str, deadline: DateTime<Utc>) -> Result<HumanResponse>;
}

/// Produces embeddings for similarity-based routing.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CoreError;

    struct FixedSecrets;

    #[async_trait]
    impl SecretResolver for FixedSecrets {
        async fn resolve(&self, name: &str) -> Result<Option<String>> {
            match name {
                "api-key" => Ok(Some("shhh".to_string())),
                _ => Ok(None),
            }
        }
    }

    struct RejectAll;

    #[async_trait]
    impl IdentityValidator for RejectAll {
        async fn validate_bearer(&self, _token: &str) -> Result<Principal> {
            Err(CoreError::Identity("unauthorized".to_string()))
        }
    }

    #[tokio::test]
    async fn test_secret_resolution() {
        let secrets = FixedSecrets;
        assert_eq!(secrets.resolve("api-key").await.unwrap(), Some("shhh".to_string()));
        assert_eq!(secrets.resolve("missing").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_identity_rejection() {
        let validator = RejectAll;
        assert!(validator.validate_bearer("bad").await.is_err());
    }

    #[test]
    fn test_tool_request_builder() {
        let schema = ToolSchema::new("search", "web search").with_input_keys(&["query"]);
        let request = ToolRequest::new(schema, ValueMap::new())
            .with_timeout(Duration::from_secs(5))
            .with_idempotency_key("call-1");

        assert_eq!(request.schema.input_keys, vec!["query".to_string()]);
        assert_eq!(request.timeout, Some(Duration::from_secs(5)));
        assert_eq!(request.idempotency_key.as_deref(), Some("call-1"));
    }
}
