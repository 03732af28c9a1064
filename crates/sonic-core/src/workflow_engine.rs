//! Workflow Engine (C5): holds one graph, tracks the current node, and
//! reports whether an observed transition matches an edge in it (§4.5).
//!
//! Enforcement here is advisory: the voice model is authoritative about
//! what node it believes it is in, so an invalid transition is logged by
//! the caller and applied anyway rather than rejected.

use std::collections::{HashSet, VecDeque};

use serde_json::{Map, Value};
use sonic_schema::workflow::{WorkflowGraph, WorkflowNode};
use tracing::warn;

#[derive(Debug, Clone)]
pub struct TransitionOutcome {
    pub previous: String,
    pub current: String,
    pub valid_transition: bool,
}

pub struct WorkflowEngine {
    graph: WorkflowGraph,
    current_node_id: String,
    context: Map<String, Value>,
}

impl WorkflowEngine {
    /// Binds to `graph` and resets to its start node. Panics if `graph` has
    /// no start node — callers must validate the graph at load time (C4).
    pub fn new(graph: WorkflowGraph) -> Self {
        let start = graph
            .start_node()
            .expect("workflow graph must be validated before binding to an engine")
            .id
            .clone();
        Self {
            graph,
            current_node_id: start,
            context: Map::new(),
        }
    }

    pub fn reset(&mut self) {
        self.current_node_id = self
            .graph
            .start_node()
            .expect("workflow graph must have a start node")
            .id
            .clone();
    }

    /// Moves to `node_id`, merging `context_patch` into the engine's
    /// context map. `valid_transition` reports whether an edge from the
    /// previous node to `node_id` exists (or the previous node was the
    /// start node), but the move happens regardless.
    pub fn update(&mut self, node_id: &str, context_patch: Option<Map<String, Value>>) -> TransitionOutcome {
        let previous = self.current_node_id.clone();
        let is_start = self.graph.start_node().map(|n| n.id.as_str()) == Some(previous.as_str());
        let valid_transition = self.graph.outgoing_edges(&previous).iter().any(|e| e.to == node_id)
            || (is_start && self.is_reachable_from_start(node_id));

        if !valid_transition {
            warn!(
                workflow_id = %self.graph.id,
                from = %previous,
                to = %node_id,
                "workflow transition has no matching edge; applying anyway"
            );
        }

        if let Some(patch) = context_patch {
            self.context.extend(patch);
        }
        self.current_node_id = node_id.to_string();

        TransitionOutcome {
            previous,
            current: self.current_node_id.clone(),
            valid_transition,
        }
    }

    /// BFS over the graph's edges from its start node; `true` if `node_id`
    /// is reachable at all, not just directly adjacent to `start`.
    fn is_reachable_from_start(&self, node_id: &str) -> bool {
        let Some(start) = self.graph.start_node() else {
            return false;
        };
        if start.id == node_id {
            return true;
        }
        let mut visited = HashSet::new();
        let mut queue = VecDeque::new();
        visited.insert(start.id.clone());
        queue.push_back(start.id.clone());

        while let Some(current) = queue.pop_front() {
            for edge in self.graph.outgoing_edges(&current) {
                if edge.to == node_id {
                    return true;
                }
                if visited.insert(edge.to.clone()) {
                    queue.push_back(edge.to.clone());
                }
            }
        }
        false
    }

    pub fn current(&self) -> Option<&WorkflowNode> {
        self.graph.node(&self.current_node_id)
    }

    pub fn current_node_id(&self) -> &str {
        &self.current_node_id
    }

    pub fn next_nodes(&self) -> Vec<&WorkflowNode> {
        self.graph
            .outgoing_edges(&self.current_node_id)
            .into_iter()
            .filter_map(|edge| self.graph.node(&edge.to))
            .collect()
    }

    pub fn context(&self) -> &Map<String, Value> {
        &self.context
    }

    pub fn graph(&self) -> &WorkflowGraph {
        &self.graph
    }
}
