//! Human-in-the-loop approval node
//!
//! Suspends its branch with a `Suspend` result. The executor parks the
//! branch (checkpointing first when enabled) and re-enters this node
//! once a response arrives; the response travels through engine
//! metadata so the handshake also works after a process restart.

use crate::error::Result;
use crate::node::{DeadlinePolicy, Node, NodeContext, NodeResult, SuspendRequest};
use crate::state::ExecutionState;
use async_trait::async_trait;
use chrono::Utc;
use skein_core::Value;
use std::time::Duration;

fn response_metadata_key(id: &str) -> String {
    format!("skein.approval.{id}.response")
}

/// Pauses the branch until an external response is delivered via
/// `Executor::resume`.
pub struct HumanApprovalNode {
    id: String,
    prompt: String,
    /// When set, the prompt is read from this state key instead
    prompt_key: Option<String>,
    response_key: String,
    deadline: Duration,
    on_deadline: DeadlinePolicy,
}

impl HumanApprovalNode {
    pub fn new(id: &str, prompt: &str, response_key: &str) -> Self {
        Self {
            id: id.to_string(),
            prompt: prompt.to_string(),
            prompt_key: None,
            response_key: response_key.to_string(),
            deadline: Duration::from_secs(24 * 60 * 60),
            on_deadline: DeadlinePolicy::Fail,
        }
    }

    /// Read the prompt from a state key at suspension time.
    pub fn with_prompt_key(mut self, key: &str) -> Self {
        self.prompt_key = Some(key.to_string());
        self
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = deadline;
        self
    }

    pub fn with_deadline_policy(mut self, policy: DeadlinePolicy) -> Self {
        self.on_deadline = policy;
        self
    }

    /// Metadata key the executor writes the response under.
    pub(crate) fn response_slot(id: &str) -> String {
        response_metadata_key(id)
    }
}

#[async_trait]
impl Node for HumanApprovalNode {
    fn id(&self) -> &str {
        &self.id
    }

    fn output_keys(&self) -> &[String] {
        std::slice::from_ref(&self.response_key)
    }

    async fn execute(&self, state: &mut ExecutionState, _ctx: &NodeContext) -> Result<NodeResult> {
        // A delivered response means this entry is the resume pass. The
        // slot is consumed so a later visit suspends afresh.
        if let Some(raw) = state.remove_metadata(&response_metadata_key(&self.id)) {
            let value: Value = serde_json::from_str(&raw)?;
            state.replace(self.response_key.clone(), value.clone())?;
            return Ok(NodeResult::Value(Some(value)));
        }

        let prompt = match &self.prompt_key {
            Some(key) => state.get_str(key).unwrap_or(&self.prompt).to_string(),
            None => self.prompt.clone(),
        };

        Ok(NodeResult::Suspend(SuspendRequest {
            request_id: uuid::Uuid::new_v4().to_string(),
            prompt,
            deadline: Utc::now()
                + chrono::Duration::from_std(self.deadline)
                    .unwrap_or_else(|_| chrono::Duration::hours(24)),
            response_key: Some(self.response_key.clone()),
            on_deadline: self.on_deadline,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_fresh_entry_suspends() {
        let node = HumanApprovalNode::new("approve", "Deploy to production?", "approval");
        let mut state = ExecutionState::new();

        let result = node.execute(&mut state, &NodeContext::new("x")).await.unwrap();
        match result {
            NodeResult::Suspend(request) => {
                assert_eq!(request.prompt, "Deploy to production?");
                assert_eq!(request.response_key.as_deref(), Some("approval"));
                assert!(request.deadline > Utc::now());
            }
            other => panic!("expected suspend, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_resume_pass_applies_response() {
        let node = HumanApprovalNode::new("approve", "ok?", "approval");
        let mut state = ExecutionState::new();
        state
            .set_metadata(
                response_metadata_key("approve"),
                serde_json::to_string(&Value::from("granted")).unwrap(),
            )
            .unwrap();

        let result = node.execute(&mut state, &NodeContext::new("x")).await.unwrap();
        assert!(matches!(result, NodeResult::Value(Some(_))));
        assert_eq!(state.get_str("approval"), Some("granted"));
    }

    #[tokio::test]
    async fn test_prompt_from_state_key() {
        let node = HumanApprovalNode::new("approve", "fallback", "approval")
            .with_prompt_key("question");
        let mut state = ExecutionState::new().with_entry("question", "Ship it?");

        let result = node.execute(&mut state, &NodeContext::new("x")).await.unwrap();
        match result {
            NodeResult::Suspend(request) => assert_eq!(request.prompt, "Ship it?"),
            other => panic!("expected suspend, got {other:?}"),
        }
    }
}
