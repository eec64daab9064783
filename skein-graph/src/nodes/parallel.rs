//! Fork node for explicit parallel branches

use crate::error::Result;
use crate::merge::MergePolicies;
use crate::node::{ForkSpec, Node, NodeContext, NodeResult};
use crate::state::ExecutionState;
use async_trait::async_trait;

/// Fans out into sibling branches, each starting at one of the declared
/// entry nodes and running until it reaches the join node. The executor
/// gives every branch an isolated copy-on-write state scope and merges
/// the overlays back at the join under the declared policies.
pub struct ForkNode {
    id: String,
    spec: ForkSpec,
}

impl ForkNode {
    pub fn new(id: &str, branches: &[&str], join: &str) -> Self {
        Self {
            id: id.to_string(),
            spec: ForkSpec {
                branches: branches.iter().map(|b| (*b).to_string()).collect(),
                join: join.to_string(),
                merge: None,
            },
        }
    }

    /// Merge policies applied to branch overlays at the join.
    pub fn with_merge(mut self, merge: MergePolicies) -> Self {
        self.spec.merge = Some(merge);
        self
    }
}

#[async_trait]
impl Node for ForkNode {
    fn id(&self) -> &str {
        &self.id
    }

    fn fork_spec(&self) -> Option<&ForkSpec> {
        Some(&self.spec)
    }

    fn declared_successors(&self) -> Option<Vec<String>> {
        let mut targets = self.spec.branches.clone();
        targets.push(self.spec.join.clone());
        Some(targets)
    }

    async fn execute(&self, _state: &mut ExecutionState, _ctx: &NodeContext) -> Result<NodeResult> {
        // The scheduler recognizes the fork spec and handles the fan-out;
        // the node body itself has nothing to do.
        Ok(NodeResult::empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::merge::MergePolicy;

    #[test]
    fn test_fork_spec_declares_branches_in_order() {
        let node = ForkNode::new("fork", &["left", "right"], "join")
            .with_merge(MergePolicies::new(MergePolicy::Reduce));

        let spec = node.fork_spec().unwrap();
        assert_eq!(spec.branches, vec!["left".to_string(), "right".to_string()]);
        assert_eq!(spec.join, "join");
        assert!(spec.merge.is_some());
    }
}
