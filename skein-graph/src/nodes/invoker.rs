//! Function-invoker node
//!
//! Wraps a named function behind the `FunctionInvoker` adapter,
//! typically an LLM prompt function. Inputs are gathered from declared
//! state keys (or a custom mapper); outputs are written back entry by
//! entry (or through a custom mapper).

use crate::error::{GraphError, Result};
use crate::governor::Priority;
use crate::node::{Node, NodeContext, NodeResult};
use crate::state::ExecutionState;
use async_trait::async_trait;
use skein_core::{FunctionInvoker, ValueMap};
use std::sync::Arc;

/// Maps state into adapter inputs.
pub type InputMapper = Arc<dyn Fn(&ExecutionState) -> ValueMap + Send + Sync>;
/// Applies adapter outputs back onto state.
pub type OutputMapper = Arc<dyn Fn(ValueMap, &mut ExecutionState) -> Result<()> + Send + Sync>;

/// Executes one named function through a [`FunctionInvoker`].
pub struct InvokerNode {
    id: String,
    function: String,
    invoker: Arc<dyn FunctionInvoker>,
    input_keys: Vec<String>,
    input_mapper: Option<InputMapper>,
    output_mapper: Option<OutputMapper>,
    budget_cost: f64,
    priority: Priority,
}

impl InvokerNode {
    pub fn new(id: &str, function: &str, invoker: Arc<dyn FunctionInvoker>) -> Self {
        Self {
            id: id.to_string(),
            function: function.to_string(),
            invoker,
            input_keys: vec![],
            input_mapper: None,
            output_mapper: None,
            budget_cost: 1.0,
            priority: Priority::Normal,
        }
    }

    /// State keys copied into the adapter's inputs.
    pub fn with_input_keys(mut self, keys: &[&str]) -> Self {
        self.input_keys = keys.iter().map(|k| (*k).to_string()).collect();
        self
    }

    /// Replace the default key-copy input mapping.
    pub fn with_input_mapper<F>(mut self, mapper: F) -> Self
    where
        F: Fn(&ExecutionState) -> ValueMap + Send + Sync + 'static,
    {
        self.input_mapper = Some(Arc::new(mapper));
        self
    }

    /// Replace the default per-entry output write.
    pub fn with_output_mapper<F>(mut self, mapper: F) -> Self
    where
        F: Fn(ValueMap, &mut ExecutionState) -> Result<()> + Send + Sync + 'static,
    {
        self.output_mapper = Some(Arc::new(mapper));
        self
    }

    /// Budget units charged before each invocation (defaults to 1.0;
    /// LLM calls are resource-tagged).
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
impl Node for InvokerNode {
    fn id(&self) -> &str {
        &self.id
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
        let inputs = match &self.input_mapper {
            Some(mapper) => mapper(state),
            None => {
                let mut inputs = ValueMap::new();
                for key in &self.input_keys {
                    if let Some(value) = state.get(key) {
                        inputs.insert(key.clone(), value.clone());
                    }
                }
                inputs
            }
        };

        let call = self.invoker.invoke(&self.function, &inputs);
        let outputs = tokio::select! {
            _ = ctx.cancellation.cancelled() => {
                return Err(GraphError::Canceled { node: Some(self.id.clone()) });
            }
            outputs = call => outputs?,
        };

        match &self.output_mapper {
            Some(mapper) => mapper(outputs, state)?,
            None => {
                for (key, value) in outputs {
                    state.replace(key, value)?;
                }
            }
        }
        Ok(NodeResult::empty())
    }
}
