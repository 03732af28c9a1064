//! Decision Evaluator (C6): picks one outgoing edge of a decision node by
//! asking the text reasoning LLM (§4.6). Parsing falls back exact → substring
//! → first edge; an LLM error is itself just another reason to fall back to
//! the first edge rather than stall the workflow (enforcement is advisory,
//! mirroring the Workflow Engine's own transition policy in §4.5).

use serde_json::{Map, Value};
use sonic_provider::{LlmRequest, ProviderRegistry};
use sonic_schema::conversation::ConversationMessage;
use sonic_schema::workflow::{WorkflowEdge, WorkflowNode};

const DEFAULT_HISTORY_WINDOW: usize = 5;
const DECISION_MAX_TOKENS: u32 = 64;
const DECISION_TEMPERATURE: f32 = 0.1;

pub struct DecisionOutcome {
    pub success: bool,
    pub chosen_path_label: String,
    pub target_node_id: String,
    pub confidence: f32,
    pub reasoning: String,
}

pub struct DecisionEvaluator<'a> {
    registry: &'a ProviderRegistry,
    provider_id: String,
    model_id: String,
}

impl<'a> DecisionEvaluator<'a> {
    pub fn new(registry: &'a ProviderRegistry, provider_id: impl Into<String>, model_id: impl Into<String>) -> Self {
        Self {
            registry,
            provider_id: provider_id.into(),
            model_id: model_id.into(),
        }
    }

    pub async fn evaluate(
        &self,
        node: &WorkflowNode,
        outgoing_edges: &[&WorkflowEdge],
        context: &Map<String, Value>,
        history: &[ConversationMessage],
    ) -> DecisionOutcome {
        let Some(first_edge) = outgoing_edges.first() else {
            return DecisionOutcome {
                success: false,
                chosen_path_label: String::new(),
                target_node_id: node.id.clone(),
                confidence: 0.0,
                reasoning: "decision node has no outgoing edges".to_string(),
            };
        };

        let fallback = |reasoning: String| DecisionOutcome {
            success: false,
            chosen_path_label: first_edge.label.clone().unwrap_or_default(),
            target_node_id: first_edge.to.clone(),
            confidence: 0.0,
            reasoning,
        };

        if outgoing_edges.len() == 1 {
            return DecisionOutcome {
                success: true,
                chosen_path_label: first_edge.label.clone().unwrap_or_default(),
                target_node_id: first_edge.to.clone(),
                confidence: 1.0,
                reasoning: "single outgoing edge, no llm call needed".to_string(),
            };
        }

        let provider = match self.registry.get(&self.provider_id) {
            Ok(p) => p,
            Err(e) => return fallback(format!("provider unavailable: {e}")),
        };

        let prompt = build_decision_prompt(node, outgoing_edges, context, history, DEFAULT_HISTORY_WINDOW);
        let request = LlmRequest {
            model: self.model_id.clone(),
            system: Some(
                "You are choosing exactly one labeled path for a conversation workflow. \
                 Reply with only the label text, nothing else."
                    .to_string(),
            ),
            messages: vec![sonic_provider::LlmMessage::user(prompt)],
            max_tokens: DECISION_MAX_TOKENS,
            tools: vec![],
            temperature: Some(DECISION_TEMPERATURE),
        };

        let response = match provider.chat(request).await {
            Ok(r) => r,
            Err(e) => return fallback(format!("decision llm call failed: {e}")),
        };

        match match_edge(&response.text, outgoing_edges) {
            Some(edge) => DecisionOutcome {
                success: true,
                chosen_path_label: edge.label.clone().unwrap_or_default(),
                target_node_id: edge.to.clone(),
                confidence: 1.0,
                reasoning: response.text,
            },
            None => fallback(format!("no edge label matched response: {:?}", response.text)),
        }
    }
}

fn build_decision_prompt(
    node: &WorkflowNode,
    outgoing_edges: &[&WorkflowEdge],
    context: &Map<String, Value>,
    history: &[ConversationMessage],
    window: usize,
) -> String {
    let mut prompt = String::new();
    prompt.push_str("Decision: ");
    prompt.push_str(&node.label);
    prompt.push_str("\n\nPermitted answers:\n");
    for (idx, edge) in outgoing_edges.iter().enumerate() {
        prompt.push_str(&format!("{}. {}\n", idx + 1, edge.label.as_deref().unwrap_or("")));
    }

    prompt.push_str("\nContext:\n");
    prompt.push_str(&serde_json::to_string(context).unwrap_or_default());

    prompt.push_str("\n\nRecent conversation:\n");
    let start = history.len().saturating_sub(window);
    for msg in &history[start..] {
        prompt.push_str(&format!("{:?}: {}\n", msg.role, msg.content));
    }

    prompt
}

/// (i) exact case-insensitive match, (ii) substring match, (iii) no match.
fn match_edge<'e>(response_text: &str, outgoing_edges: &'e [&WorkflowEdge]) -> Option<&'e WorkflowEdge> {
    let trimmed = response_text.trim();
    let lower = trimmed.to_lowercase();

    if let Some(edge) = outgoing_edges
        .iter()
        .find(|e| e.label.as_deref().map(|l| l.eq_ignore_ascii_case(trimmed)).unwrap_or(false))
    {
        return Some(edge);
    }

    outgoing_edges
        .iter()
        .find(|e| {
            e.label
                .as_deref()
                .map(|l| lower.contains(&l.to_lowercase()))
                .unwrap_or(false)
        })
        .copied()
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use sonic_provider::{LlmProvider, LlmResponse};
    use sonic_schema::workflow::NodeType;

    fn node(label: &str) -> WorkflowNode {
        WorkflowNode {
            id: "dec".into(),
            node_type: NodeType::Decision,
            label: label.into(),
            tool_name: None,
            workflow_id: None,
            message: None,
        }
    }

    fn edge(to: &str, label: &str) -> WorkflowEdge {
        WorkflowEdge {
            from: "dec".into(),
            to: to.into(),
            label: Some(label.into()),
        }
    }

    struct FixedReply(String);

    #[async_trait]
    impl LlmProvider for FixedReply {
        async fn chat(&self, _request: LlmRequest) -> anyhow::Result<LlmResponse> {
            Ok(LlmResponse {
                text: self.0.clone(),
                content: vec![],
                input_tokens: None,
                output_tokens: None,
                stop_reason: Some("end_turn".into()),
            })
        }
    }

    struct AlwaysFails;

    #[async_trait]
    impl LlmProvider for AlwaysFails {
        async fn chat(&self, _request: LlmRequest) -> anyhow::Result<LlmResponse> {
            anyhow::bail!("provider exploded")
        }
    }

    #[tokio::test]
    async fn single_outgoing_edge_short_circuits_without_llm_call() {
        let registry = ProviderRegistry::new();
        let evaluator = DecisionEvaluator::new(&registry, "text", "model-x");

        let n = node("Next step");
        let edges = vec![edge("bank", "Banking")];
        let refs: Vec<&WorkflowEdge> = edges.iter().collect();

        let outcome = evaluator.evaluate(&n, &refs, &Map::new(), &[]).await;
        assert!(outcome.success);
        assert_eq!(outcome.target_node_id, "bank");
        assert_eq!(outcome.confidence, 1.0);
    }

    #[tokio::test]
    async fn exact_match_selects_edge() {
        let mut registry = ProviderRegistry::new();
        registry.register("text", std::sync::Arc::new(FixedReply("Banking".into())));
        let evaluator = DecisionEvaluator::new(&registry, "text", "model-x");

        let n = node("What does the user want?");
        let edges = vec![edge("bank", "Banking"), edge("mortgage", "Mortgage")];
        let refs: Vec<&WorkflowEdge> = edges.iter().collect();

        let outcome = evaluator.evaluate(&n, &refs, &Map::new(), &[]).await;
        assert!(outcome.success);
        assert_eq!(outcome.target_node_id, "bank");
    }

    #[tokio::test]
    async fn substring_match_selects_edge() {
        let mut registry = ProviderRegistry::new();
        registry.register(
            "text",
            std::sync::Arc::new(FixedReply("I think the user wants banking help".into())),
        );
        let evaluator = DecisionEvaluator::new(&registry, "text", "model-x");

        let n = node("What does the user want?");
        let edges = vec![edge("bank", "Banking"), edge("mortgage", "Mortgage")];
        let refs: Vec<&WorkflowEdge> = edges.iter().collect();

        let outcome = evaluator.evaluate(&n, &refs, &Map::new(), &[]).await;
        assert!(outcome.success);
        assert_eq!(outcome.target_node_id, "bank");
    }

    #[tokio::test]
    async fn llm_error_falls_back_to_first_edge() {
        let mut registry = ProviderRegistry::new();
        registry.register("text", std::sync::Arc::new(AlwaysFails));
        let evaluator = DecisionEvaluator::new(&registry, "text", "model-x");

        let n = node("What does the user want?");
        let edges = vec![edge("bank", "Banking"), edge("mortgage", "Mortgage")];
        let refs: Vec<&WorkflowEdge> = edges.iter().collect();

        let outcome = evaluator.evaluate(&n, &refs, &Map::new(), &[]).await;
        assert!(!outcome.success);
        assert_eq!(outcome.target_node_id, "bank");
    }

    #[tokio::test]
    async fn unmatched_reply_falls_back_to_first_edge() {
        let mut registry = ProviderRegistry::new();
        registry.register("text", std::sync::Arc::new(FixedReply("gibberish".into())));
        let evaluator = DecisionEvaluator::new(&registry, "text", "model-x");

        let n = node("What does the user want?");
        let edges = vec![edge("bank", "Banking"), edge("mortgage", "Mortgage")];
        let refs: Vec<&WorkflowEdge> = edges.iter().collect();

        let outcome = evaluator.evaluate(&n, &refs, &Map::new(), &[]).await;
        assert!(!outcome.success);
        assert_eq!(outcome.target_node_id, "bank");
    }
}
