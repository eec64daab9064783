//! Pre-flight graph validation
//!
//! Structural errors fail a build or an execution before any node runs;
//! warnings point at suspicious but legal shapes. The successor relation
//! used here is the union of declared edges and each node's statically
//! declared routing targets.

use crate::edge::Edge;
use crate::graph::{Graph, GraphBuilder};
use crate::node::NodeRef;
use crate::state::ExecutionState;
use std::collections::{HashMap, HashSet, VecDeque};

/// Outcome of a validation pass.
#[derive(Debug, Default, Clone)]
pub struct GraphValidation {
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl GraphValidation {
    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Borrowed view over a graph's structure, shared by the builder and the
/// built form.
pub(crate) struct GraphView<'a> {
    pub nodes: &'a HashMap<String, NodeRef>,
    pub edges: &'a [Edge],
    pub start: Option<&'a str>,
    pub terminals: &'a HashSet<String>,
}

/// Validate a graph under construction.
pub fn check(builder: &GraphBuilder, initial: Option<&ExecutionState>) -> GraphValidation {
    check_view(&builder.view(), initial)
}

/// Validate a built graph, optionally against the initial state of an
/// imminent execution.
pub fn check_graph(graph: &Graph, initial: Option<&ExecutionState>) -> GraphValidation {
    check_view(&graph.view(), initial)
}

pub(crate) fn check_view(view: &GraphView<'_>, initial: Option<&ExecutionState>) -> GraphValidation {
    let mut report = GraphValidation::default();

    if view.nodes.is_empty() {
        report.errors.push("graph has no nodes".to_string());
        return report;
    }

    // Edge endpoints must exist
    for edge in view.edges {
        if !view.nodes.contains_key(&edge.from) {
            report.errors.push(format!("edge source '{}' does not exist", edge.from));
        }
        if !view.nodes.contains_key(&edge.to) {
            report.errors.push(format!("edge target '{}' does not exist", edge.to));
        }
    }

    // Declared routing targets must exist
    for (id, node) in view.nodes {
        if let Some(targets) = node.declared_successors() {
            for target in targets {
                if !view.nodes.contains_key(&target) {
                    report
                        .errors
                        .push(format!("node '{id}' routes to unknown node '{target}'"));
                }
            }
        }
    }

    // Start node must exist
    match view.start {
        Some(start) if !view.nodes.contains_key(start) => {
            report.errors.push(format!("start node '{start}' does not exist"));
        }
        None => report.errors.push("no start node declared".to_string()),
        _ => {}
    }

    if !report.errors.is_empty() {
        // Successor analysis below assumes endpoints resolve.
        return report;
    }

    let successors = successor_map(view);

    // Every cycle needs at least one bounded loop node on it
    for component in strongly_connected(&successors, view) {
        let cyclic = component.len() > 1
            || successors
                .get(&component[0])
                .is_some_and(|next| next.contains(&component[0]));
        if !cyclic {
            continue;
        }
        let bounded = component
            .iter()
            .any(|id| view.nodes.get(id).is_some_and(|n| n.max_iterations().is_some()));
        if !bounded {
            report.errors.push(format!(
                "cycle through {component:?} has no node with a declared iteration bound"
            ));
        }
    }

    // Input satisfaction: every required input must come from an ancestor
    // or the initial state
    if let Some(initial) = initial {
        let ancestors = ancestor_map(&successors, view);
        for (id, node) in view.nodes {
            for key in node.input_keys() {
                if initial.contains(key) {
                    continue;
                }
                let produced = ancestors.get(id).is_some_and(|ancestors| {
                    ancestors.iter().any(|a| {
                        view.nodes
                            .get(a)
                            .is_some_and(|n| n.output_keys().iter().any(|k| k == key))
                    })
                });
                if !produced {
                    report.errors.push(format!(
                        "node '{id}' requires input '{key}' which no predecessor produces \
                         and the initial state does not contain"
                    ));
                }
            }
        }
    }

    // Warnings: unreachable nodes
    if let Some(start) = view.start {
        let mut reachable = reachable_from(start, &successors);
        reachable.insert(start.to_string());
        for id in view.nodes.keys() {
            if !reachable.contains(id) {
                report.warnings.push(format!("node '{id}' is unreachable from the start node"));
            }
        }
    }

    // Warnings: silent dead ends and predicate gaps
    for (id, node) in view.nodes {
        let outgoing: Vec<_> = view.edges.iter().filter(|e| &e.from == id).collect();
        let routes_itself = node.declared_successors().is_some();

        if outgoing.is_empty() && !routes_itself && !view.terminals.contains(id) {
            report.warnings.push(format!(
                "node '{id}' has no outgoing edges and is not marked terminal"
            ));
        }

        if !outgoing.is_empty() && outgoing.iter().all(|e| !e.is_unconditional()) {
            report.warnings.push(format!(
                "node '{id}' has only conditional edges; unmatched states will dead-end"
            ));
        }
    }

    report
}

fn successor_map(view: &GraphView<'_>) -> HashMap<String, Vec<String>> {
    let mut map: HashMap<String, Vec<String>> = HashMap::new();
    for id in view.nodes.keys() {
        map.entry(id.clone()).or_default();
    }
    for edge in view.edges {
        map.entry(edge.from.clone()).or_default().push(edge.to.clone());
    }
    for (id, node) in view.nodes {
        if let Some(targets) = node.declared_successors() {
            map.entry(id.clone()).or_default().extend(targets);
        }
    }
    map
}

fn ancestor_map(
    successors: &HashMap<String, Vec<String>>,
    view: &GraphView<'_>,
) -> HashMap<String, HashSet<String>> {
    let mut reversed: HashMap<String, Vec<String>> = HashMap::new();
    for (from, targets) in successors {
        for to in targets {
            reversed.entry(to.clone()).or_default().push(from.clone());
        }
    }

    view.nodes
        .keys()
        .map(|id| (id.clone(), reachable_from(id, &reversed)))
        .collect()
}

fn reachable_from(start: &str, successors: &HashMap<String, Vec<String>>) -> HashSet<String> {
    let mut seen = HashSet::new();
    let mut queue = VecDeque::from([start.to_string()]);
    while let Some(id) = queue.pop_front() {
        if let Some(targets) = successors.get(&id) {
            for target in targets {
                if seen.insert(target.clone()) {
                    queue.push_back(target.clone());
                }
            }
        }
    }
    seen
}

/// Tarjan's strongly connected components, iterative to keep deep graphs
/// off the call stack.
fn strongly_connected(
    successors: &HashMap<String, Vec<String>>,
    view: &GraphView<'_>,
) -> Vec<Vec<String>> {
    #[derive(Default)]
    struct Tarjan {
        index: usize,
        indices: HashMap<String, usize>,
        lowlinks: HashMap<String, usize>,
        on_stack: HashSet<String>,
        stack: Vec<String>,
        components: Vec<Vec<String>>,
    }

    let mut t = Tarjan::default();

    for root in view.nodes.keys() {
        if t.indices.contains_key(root) {
            continue;
        }

        // Explicit DFS frames: (node, next child index)
        let mut frames: Vec<(String, usize)> = vec![(root.clone(), 0)];
        while let Some((node, child_idx)) = frames.last().cloned() {
            if child_idx == 0 && !t.indices.contains_key(&node) {
                t.indices.insert(node.clone(), t.index);
                t.lowlinks.insert(node.clone(), t.index);
                t.index += 1;
                t.stack.push(node.clone());
                t.on_stack.insert(node.clone());
            }

            let children = successors.get(&node).cloned().unwrap_or_default();
            if child_idx < children.len() {
                if let Some(frame) = frames.last_mut() {
                    frame.1 += 1;
                }
                let child = &children[child_idx];
                if !t.indices.contains_key(child) {
                    frames.push((child.clone(), 0));
                } else if t.on_stack.contains(child) {
                    let low = t.lowlinks[&node].min(t.indices[child]);
                    t.lowlinks.insert(node.clone(), low);
                }
            } else {
                frames.pop();
                if let Some((parent, _)) = frames.last() {
                    let low = t.lowlinks[parent].min(t.lowlinks[&node]);
                    t.lowlinks.insert(parent.clone(), low);
                }
                if t.lowlinks[&node] == t.indices[&node] {
                    let mut component = vec![];
                    while let Some(top) = t.stack.pop() {
                        t.on_stack.remove(&top);
                        let done = top == node;
                        component.push(top);
                        if done {
                            break;
                        }
                    }
                    component.sort();
                    t.components.push(component);
                }
            }
        }
    }

    t.components
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::FunctionNode;
    use crate::nodes::loops::WhileNode;

    fn noop(id: &str) -> FunctionNode {
        FunctionNode::new(id, |_s| Ok(None))
    }

    #[test]
    fn test_unbounded_cycle_rejected() {
        let result = Graph::builder()
            .add_node(noop("a"))
            .add_node(noop("b"))
            .add_edge("a", "b")
            .add_edge("b", "a")
            .build();
        assert!(result.is_err());
    }

    #[test]
    fn test_bounded_cycle_accepted() {
        let graph = Graph::builder()
            .add_node(WhileNode::new("loop", |_| true, "body", 5).with_exit("done"))
            .add_node(noop("body"))
            .add_node(noop("done"))
            .add_edge("body", "loop")
            .mark_terminal("done")
            .build();
        assert!(graph.is_ok());
    }

    #[test]
    fn test_unreachable_node_warns() {
        let builder = Graph::builder()
            .add_node(noop("a"))
            .add_node(noop("island"))
            .mark_terminal("a")
            .mark_terminal("island");
        let report = check(&builder, None);
        assert!(report.is_ok());
        assert!(report.warnings.iter().any(|w| w.contains("island")));
    }

    #[test]
    fn test_dead_end_warns_unless_terminal() {
        let builder = Graph::builder().add_node(noop("a")).add_node(noop("b")).add_edge("a", "b");
        let report = check(&builder, None);
        assert!(report.warnings.iter().any(|w| w.contains("'b'")));

        let builder = Graph::builder()
            .add_node(noop("a"))
            .add_node(noop("b"))
            .add_edge("a", "b")
            .mark_terminal("b");
        let report = check(&builder, None);
        assert!(!report.warnings.iter().any(|w| w.contains("not marked terminal")));
    }

    #[test]
    fn test_conditional_only_edges_warn() {
        let builder = Graph::builder()
            .add_node(noop("a"))
            .add_node(noop("b"))
            .add_edge_if("a", "b", |s| s.get_bool("go").unwrap_or(false))
            .mark_terminal("b");
        let report = check(&builder, None);
        assert!(report.warnings.iter().any(|w| w.contains("only conditional edges")));
    }

    #[test]
    fn test_unsatisfied_inputs_rejected_with_initial_state() {
        let graph = Graph::builder()
            .add_node(noop("a"))
            .add_node(FunctionNode::new("b", |_s| Ok(None)).with_input_keys(&["payload"]))
            .add_edge("a", "b")
            .mark_terminal("b")
            .build()
            .unwrap();

        let empty = ExecutionState::new();
        let report = check_graph(&graph, Some(&empty));
        assert!(!report.is_ok());

        let seeded = ExecutionState::new().with_entry("payload", 1i64);
        let report = check_graph(&graph, Some(&seeded));
        assert!(report.is_ok());
    }

    #[test]
    fn test_input_produced_by_predecessor_is_satisfied() {
        let graph = Graph::builder()
            .add_node(FunctionNode::new("producer", |_s| Ok(None)).with_output_key("payload"))
            .add_node(FunctionNode::new("consumer", |_s| Ok(None)).with_input_keys(&["payload"]))
            .add_edge("producer", "consumer")
            .mark_terminal("consumer")
            .build()
            .unwrap();

        let report = check_graph(&graph, Some(&ExecutionState::new()));
        assert!(report.is_ok(), "errors: {:?}", report.errors);
    }
}
