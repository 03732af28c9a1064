use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum NodeType {
    Start,
    End,
    Decision,
    Tool,
    Workflow,
    Process,
    Message,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowNode {
    pub id: String,
    #[serde(rename = "type")]
    pub node_type: NodeType,
    pub label: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workflow_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowEdge {
    pub from: String,
    pub to: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

/// Immutable after load (§3). `id` is the workflow's own id, taken from its
/// `workflow_{id}.json` filename by the loader.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowGraph {
    pub id: String,
    pub nodes: Vec<WorkflowNode>,
    pub edges: Vec<WorkflowEdge>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum WorkflowValidationError {
    #[error("workflow {0:?} has no start node")]
    NoStartNode(String),
    #[error("workflow {0:?} has {1} start nodes, expected exactly one")]
    MultipleStartNodes(String, usize),
    #[error("workflow {0:?} decision node {1:?} has fewer than 2 outgoing edges")]
    DecisionNodeUnderspecified(String, String),
    #[error("workflow {0:?} decision node {1:?} has an edge with an empty label")]
    DecisionEdgeUnlabeled(String, String),
    #[error("workflow {0:?} edge references unknown node {1:?}")]
    DanglingEdge(String, String),
}

impl WorkflowGraph {
    /// Structural validation per §3: exactly one start node, decision nodes
    /// have ≥2 outgoing edges each with a non-empty label, edges reference
    /// existing nodes.
    pub fn validate(&self) -> Result<(), WorkflowValidationError> {
        let start_count = self
            .nodes
            .iter()
            .filter(|n| n.node_type == NodeType::Start)
            .count();
        if start_count == 0 {
            return Err(WorkflowValidationError::NoStartNode(self.id.clone()));
        }
        if start_count > 1 {
            return Err(WorkflowValidationError::MultipleStartNodes(
                self.id.clone(),
                start_count,
            ));
        }

        let node_ids: std::collections::HashSet<&str> =
            self.nodes.iter().map(|n| n.id.as_str()).collect();
        for edge in &self.edges {
            if !node_ids.contains(edge.from.as_str()) {
                return Err(WorkflowValidationError::DanglingEdge(
                    self.id.clone(),
                    edge.from.clone(),
                ));
            }
            if !node_ids.contains(edge.to.as_str()) {
                return Err(WorkflowValidationError::DanglingEdge(
                    self.id.clone(),
                    edge.to.clone(),
                ));
            }
        }

        for node in &self.nodes {
            if node.node_type != NodeType::Decision {
                continue;
            }
            let outgoing: Vec<&WorkflowEdge> =
                self.edges.iter().filter(|e| e.from == node.id).collect();
            if outgoing.len() < 2 {
                return Err(WorkflowValidationError::DecisionNodeUnderspecified(
                    self.id.clone(),
                    node.id.clone(),
                ));
            }
            for edge in &outgoing {
                if edge.label.as_deref().unwrap_or("").is_empty() {
                    return Err(WorkflowValidationError::DecisionEdgeUnlabeled(
                        self.id.clone(),
                        node.id.clone(),
                    ));
                }
            }
        }

        Ok(())
    }

    pub fn start_node(&self) -> Option<&WorkflowNode> {
        self.nodes.iter().find(|n| n.node_type == NodeType::Start)
    }

    pub fn node(&self, id: &str) -> Option<&WorkflowNode> {
        self.nodes.iter().find(|n| n.id == id)
    }

    pub fn outgoing_edges(&self, node_id: &str) -> Vec<&WorkflowEdge> {
        self.edges.iter().filter(|e| e.from == node_id).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(id: &str, ty: NodeType) -> WorkflowNode {
        WorkflowNode {
            id: id.into(),
            node_type: ty,
            label: id.into(),
            tool_name: None,
            workflow_id: None,
            message: None,
        }
    }

    fn edge(from: &str, to: &str, label: Option<&str>) -> WorkflowEdge {
        WorkflowEdge {
            from: from.into(),
            to: to.into(),
            label: label.map(str::to_string),
        }
    }

    #[test]
    fn single_start_node_no_edges_validates() {
        let graph = WorkflowGraph {
            id: "b1".into(),
            nodes: vec![node("start", NodeType::Start)],
            edges: vec![],
        };
        assert!(graph.validate().is_ok());
        assert!(graph.outgoing_edges("start").is_empty());
    }

    #[test]
    fn decision_node_needs_two_labeled_edges() {
        let graph = WorkflowGraph {
            id: "wf".into(),
            nodes: vec![
                node("start", NodeType::Start),
                node("dec", NodeType::Decision),
                node("end", NodeType::End),
            ],
            edges: vec![
                edge("start", "dec", None),
                edge("dec", "end", Some("only")),
            ],
        };
        assert_eq!(
            graph.validate(),
            Err(WorkflowValidationError::DecisionNodeUnderspecified(
                "wf".into(),
                "dec".into()
            ))
        );
    }

    #[test]
    fn decision_edges_need_non_empty_labels() {
        let graph = WorkflowGraph {
            id: "wf".into(),
            nodes: vec![node("start", NodeType::Start), node("dec", NodeType::Decision)],
            edges: vec![
                edge("dec", "start", Some("")),
                edge("dec", "start", Some("yes")),
            ],
        };
        assert!(matches!(
            graph.validate(),
            Err(WorkflowValidationError::DecisionEdgeUnlabeled(..))
        ));
    }

    #[test]
    fn round_trip_preserves_structure() {
        let graph = WorkflowGraph {
            id: "wf".into(),
            nodes: vec![node("start", NodeType::Start), node("end", NodeType::End)],
            edges: vec![edge("start", "end", Some("done"))],
        };
        let json = serde_json::to_value(&graph).unwrap();
        let back: WorkflowGraph = serde_json::from_value(json).unwrap();
        assert_eq!(back.nodes.len(), graph.nodes.len());
        assert_eq!(back.edges.len(), graph.edges.len());
    }

    #[test]
    fn dangling_edge_is_rejected() {
        let graph = WorkflowGraph {
            id: "wf".into(),
            nodes: vec![node("start", NodeType::Start)],
            edges: vec![edge("start", "nowhere", Some("x"))],
        };
        assert!(matches!(
            graph.validate(),
            Err(WorkflowValidationError::DanglingEdge(..))
        ));
    }
}
