//! Built-in node variants
//!
//! Routing (conditional, switch), bounded loops, recovery (error
//! handler, retry wrapper), human approval, adapter boundaries (REST
//! tool, function invoker, remote subgraph), composition (subgraph),
//! and explicit parallelism (fork).

pub mod approval;
pub mod conditional;
pub mod invoker;
pub mod loops;
pub mod parallel;
pub mod recovery;
pub mod remote;
pub mod subgraph;
pub mod tool;

pub use approval::HumanApprovalNode;
pub use conditional::{ConditionalNode, StatePredicate, StateSelector, SwitchNode};
pub use invoker::InvokerNode;
pub use loops::{ForeachNode, WhileNode};
pub use parallel::ForkNode;
pub use recovery::{ErrorHandlerNode, RetryNode, ERROR_KIND_KEY, ERROR_NODE_KEY};
pub use remote::{RemoteSubgraphNode, RemoteSubgraphRunner};
pub use subgraph::SubgraphNode;
pub use tool::RestToolNode;
