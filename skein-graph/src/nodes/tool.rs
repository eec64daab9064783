//! REST tool node
//!
//! The engine's I/O boundary for HTTP tools. The transport lives behind
//! the `ToolAdapter` trait; this node assembles inputs from state,
//! passes the per-call timeout and an idempotency key through, and maps
//! outputs back into state.

use crate::error::{GraphError, Result};
use crate::governor::Priority;
use crate::node::{Node, NodeContext, NodeResult};
use crate::state::ExecutionState;
use async_trait::async_trait;
use skein_core::{ToolAdapter, ToolRequest, ToolSchema, Value, ValueMap};
use std::sync::Arc;
use std::time::Duration;

/// Calls one REST tool through an adapter.
pub struct RestToolNode {
    id: String,
    adapter: Arc<dyn ToolAdapter>,
    schema: ToolSchema,
    input_keys: Vec<String>,
    timeout: Option<Duration>,
    /// When set, the whole output map lands under this key; otherwise
    /// each output entry is written individually
    output_key: Option<String>,
    budget_cost: f64,
    priority: Priority,
}

impl RestToolNode {
    pub fn new(id: &str, schema: ToolSchema, adapter: Arc<dyn ToolAdapter>) -> Self {
        let input_keys = schema.input_keys.clone();
        Self {
            id: id.to_string(),
            adapter,
            schema,
            input_keys,
            timeout: None,
            output_key: None,
            budget_cost: 0.0,
            priority: Priority::Normal,
        }
    }

    /// Per-call timeout forwarded to the adapter and enforced locally.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_output_key(mut self, key: &str) -> Self {
        self.output_key = Some(key.to_string());
        self
    }

    /// Budget units charged before each call.
    pub fn with_budget_cost(mut self, units: f64) -> Self {
        self.budget_cost = units;
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }
}

#[async_trait]
impl Node for RestToolNode {
    fn id(&self) -> &str {
        &self.id
    }

    fn description(&self) -> &str {
        &self.schema.description
    }

    fn input_keys(&self) -> &[String] {
        &self.input_keys
    }

    fn budget_cost(&self) -> f64 {
        self.budget_cost
    }

    fn priority(&self) -> Priority {
        self.priority
    }

    async fn execute(&self, state: &mut ExecutionState, ctx: &NodeContext) -> Result<NodeResult> {
        let mut inputs = ValueMap::new();
        for key in &self.input_keys {
            if let Some(value) = state.get(key) {
                inputs.insert(key.clone(), value.clone());
            }
        }

        // Stable per attempt so the transport can dedupe retried calls.
        let idempotency_key = format!("{}:{}:{}", ctx.execution_id, self.id, ctx.attempt);
        let mut request = ToolRequest::new(self.schema.clone(), inputs)
            .with_idempotency_key(idempotency_key);
        if let Some(timeout) = self.timeout {
            request = request.with_timeout(timeout);
        }

        let call = self.adapter.call(request);
        let outputs = match self.timeout {
            Some(timeout) => tokio::select! {
                _ = ctx.cancellation.cancelled() => {
                    return Err(GraphError::Canceled { node: Some(self.id.clone()) });
                }
                result = tokio::time::timeout(timeout, call) => match result {
                    Ok(outputs) => outputs?,
                    Err(_) => {
                        return Err(GraphError::Timeout { scope: format!("tool '{}'", self.id) });
                    }
                },
            },
            None => tokio::select! {
                _ = ctx.cancellation.cancelled() => {
                    return Err(GraphError::Canceled { node: Some(self.id.clone()) });
                }
                outputs = call => outputs?,
            },
        };

        match &self.output_key {
            Some(key) => {
                let map: std::collections::BTreeMap<String, Value> = outputs.into_iter().collect();
                state.replace(key.clone(), Value::Map(map))?;
            }
            None => {
                for (key, value) in outputs {
                    state.replace(key, value)?;
                }
            }
        }
        Ok(NodeResult::empty())
    }
}
