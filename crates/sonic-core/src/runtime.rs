//! Agent Runtime (C8): builds one `AgentSession` per connected agent
//! process, composes its system prompt, and drives the tool-use/decision/
//! handoff loop between the voice model and the gateway (§4.8).

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use sonic_schema::conversation::{ConversationMessage, MessageMetadata, Role, ToolResult};
use sonic_schema::persona::PersonaConfig;
use sonic_schema::protocol::AgentToGateway;
use sonic_schema::session::GraphState;
use sonic_schema::workflow::{NodeType, WorkflowEdge};
use tracing::warn;

use crate::decision::DecisionEvaluator;
use crate::tool::ToolClient;
use crate::workflow_engine::WorkflowEngine;

const RETURN_TO_TRIAGE_TOOL: &str = "return_to_triage";
const HANDOFF_TOOL_PREFIX: &str = "transfer_to_";

/// Cap applied to tool results before they land in conversation history or
/// go back to the voice model (B3).
const TOOL_RESULT_CAP_BYTES: usize = 2048;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeMode {
    TextOnly,
    VoiceOnly,
    Hybrid,
}

impl RuntimeMode {
    pub fn sends_audio(&self) -> bool {
        !matches!(self, RuntimeMode::TextOnly)
    }
}

/// One entry of the tool catalog handed to `ConfigureSession` (§4.7).
#[derive(Debug, Clone)]
pub struct ToolCatalogEntry {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
}

/// The outbound event surface this runtime needs from the Voice Model
/// Client (C7), named directly after §4.7's outbound event list. C7 is not
/// built yet; this trait is the seam it will implement.
#[async_trait]
pub trait VoiceClient: Send + Sync {
    async fn configure_session(&self, system_prompt: &str, voice_id: &str, tools: &[ToolCatalogEntry]);
    async fn start_session(&self, session_id: &str);
    async fn send_user_text(&self, text: &str);
    /// Injected system texts (decision-node notices, auto-nudge) use the
    /// same wire primitive as `send_user_text` (§4.7 has no separate
    /// outbound event for them) but bypass the debounce guard, since they
    /// are not accidental double-sends of the same user utterance.
    async fn send_system_text(&self, text: &str) {
        self.send_user_text(text).await;
    }
    async fn send_tool_result(&self, tool_use_id: &str, result: &Value, success: bool);
    async fn update_system_prompt(&self, text: &str);
    async fn stop_session(&self);
}

#[derive(Debug, Clone)]
pub struct VerifiedUser {
    pub customer_name: String,
    pub account: String,
    pub sort_code: String,
}

/// Reply owed to the voice model for one `ToolUse` id, per §4.8.3/§4.7.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolReply {
    pub tool_use_id: String,
    pub success: bool,
    pub result: Value,
}

/// What handling one `ToolUse` event produced: replies owed to the voice
/// model (one for the dispatching id, plus any duplicate ids it unblocks)
/// and, for handoff tools, the event to forward to the gateway.
#[derive(Debug, Clone, Default)]
pub struct ToolUseOutcome {
    pub replies: Vec<ToolReply>,
    pub gateway_event: Option<AgentToGateway>,
}

/// What handling a `[STEP: <node_id>]` tag produced when the new node is a
/// decision node with ≥2 outgoing edges (§4.8.4).
#[derive(Debug, Clone)]
pub struct DecisionHandlingResult {
    pub system_injection: String,
    pub gateway_event: AgentToGateway,
}

/// Per-connection agent state (§3's `AgentSession`). Mutated serially by the
/// per-session actor described in §5; nothing here is `Sync`-shared.
pub struct AgentSession {
    pub session_id: String,
    persona: PersonaConfig,
    persona_prompt_text: String,
    mode: RuntimeMode,
    is_idv_agent: bool,
    handoff_targets: Vec<String>,
    workflow: WorkflowEngine,
    pub verified_user: Option<VerifiedUser>,
    pub user_intent: Option<String>,
    pub messages: Vec<ConversationMessage>,
    dispatched_tool_names: HashSet<String>,
    pending_duplicate_tool_ids: HashMap<String, Vec<String>>,
    handoff_dispatched_this_turn: bool,
    handoff_context: Map<String, Value>,
}

impl AgentSession {
    pub fn new(
        session_id: impl Into<String>,
        persona: PersonaConfig,
        persona_prompt_text: String,
        workflow: WorkflowEngine,
        mode: RuntimeMode,
    ) -> Self {
        let is_idv_agent = persona.id == "identity-verification" || persona.id == "idv";
        let handoff_targets = persona
            .metadata
            .get("handoffTargets")
            .and_then(|v| v.as_array())
            .map(|arr| arr.iter().filter_map(|v| v.as_str().map(str::to_string)).collect())
            .unwrap_or_default();

        Self {
            session_id: session_id.into(),
            persona,
            persona_prompt_text,
            mode,
            is_idv_agent,
            handoff_targets,
            workflow,
            verified_user: None,
            user_intent: None,
            messages: Vec::new(),
            dispatched_tool_names: HashSet::new(),
            pending_duplicate_tool_ids: HashMap::new(),
            handoff_dispatched_this_turn: false,
            handoff_context: Map::new(),
        }
    }

    /// Step 2 of §4.8: restore prior state from the memory the gateway sent
    /// on `session_init`.
    pub fn restore_from_memory(&mut self, memory: &sonic_schema::session::SessionMemory) {
        if memory.verified {
            if let (Some(name), Some(account), Some(sort_code)) =
                (&memory.user_name, &memory.account, &memory.sort_code)
            {
                self.verified_user = Some(VerifiedUser {
                    customer_name: name.clone(),
                    account: account.clone(),
                    sort_code: sort_code.clone(),
                });
            }
        }
        self.user_intent = memory.user_intent.clone();
        if let Some(handoff) = &memory.pending_handoff {
            self.handoff_context = handoff.context.clone();
        }
    }

    /// Step 3 of §4.8: the allowed tool set. An IDV agent is restricted to
    /// exactly its identity check plus `return_to_triage` (§4.8.2) and must
    /// never see a `transfer_to_*` tool.
    pub fn allowed_tools(&self) -> Vec<String> {
        if self.is_idv_agent {
            return self
                .persona
                .allowed_tools
                .iter()
                .filter(|t| !t.starts_with(HANDOFF_TOOL_PREFIX))
                .cloned()
                .chain(std::iter::once(RETURN_TO_TRIAGE_TOOL.to_string()))
                .collect();
        }

        let mut tools = self.persona.allowed_tools.clone();
        for target in &self.handoff_targets {
            tools.push(format!("{HANDOFF_TOOL_PREFIX}{target}"));
        }
        tools.push(RETURN_TO_TRIAGE_TOOL.to_string());
        tools.sort();
        tools.dedup();
        tools
    }

    /// Step 1 of §4.8: compose the system prompt in load-bearing order —
    /// context block, persona prompt, handoff-tool description block,
    /// workflow instructions (§4.8.1).
    pub fn compose_system_prompt(&self, handoff_tools: &[ToolCatalogEntry]) -> String {
        let mut sections = Vec::new();
        sections.push(self.render_context_block());
        sections.push(self.persona_prompt_text.clone());
        sections.push(render_handoff_tool_block(handoff_tools));
        sections.push(render_workflow_instructions(&self.workflow));
        sections.join("\n\n")
    }

    fn render_context_block(&self) -> String {
        let mut block = String::from("## Context\n");
        match &self.verified_user {
            Some(user) => {
                block.push_str(&format!(
                    "Verified customer: {} (account {}, sort code {}).\n",
                    user.customer_name, user.account, user.sort_code
                ));
            }
            None => block.push_str("Customer is not yet verified.\n"),
        }
        if let Some(intent) = &self.user_intent {
            block.push_str(&format!("User intent: {intent}.\n"));
        }
        if !self.handoff_context.is_empty() {
            block.push_str("Handed off with context:\n");
            block.push_str(&serde_json::to_string(&self.handoff_context).unwrap_or_default());
            block.push('\n');
        }
        block
    }

    /// §4.8.2: after the identity-check tool returns `auth_status=VERIFIED`.
    /// `resolved_target` is the gateway-visible handoff target resolved from
    /// `userIntent` — the IDV agent stages it but never picks it itself.
    pub fn apply_identity_verified(
        &mut self,
        customer_name: String,
        account: String,
        sort_code: String,
        resolved_target: String,
    ) -> (AgentToGateway, AgentToGateway) {
        self.verified_user = Some(VerifiedUser {
            customer_name: customer_name.clone(),
            account: account.clone(),
            sort_code: sort_code.clone(),
        });

        let mut memory_patch = Map::new();
        memory_patch.insert("verified".into(), json!(true));
        memory_patch.insert("userName".into(), json!(customer_name.clone()));
        memory_patch.insert("account".into(), json!(account.clone()));
        memory_patch.insert("sortCode".into(), json!(sort_code.clone()));

        let mut handoff_context = Map::new();
        handoff_context.insert("verified".into(), json!(true));
        handoff_context.insert("userName".into(), json!(customer_name));
        handoff_context.insert("account".into(), json!(account));
        handoff_context.insert("sortCode".into(), json!(sort_code));

        let memory_update = AgentToGateway::UpdateMemory { memory: memory_patch };
        let handoff_request = AgentToGateway::HandoffRequest {
            target_agent_id: None,
            target_capability: Some(resolved_target),
            context: handoff_context,
            graph_state: Some(self.current_graph_state()),
        };
        self.handoff_dispatched_this_turn = true;

        (memory_update, handoff_request)
    }

    fn current_graph_state(&self) -> GraphState {
        GraphState {
            workflow_id: self.workflow.graph().id.clone(),
            current_node_id: self.workflow.current_node_id().to_string(),
            context: self.workflow.context().clone(),
        }
    }

    /// §4.8.3: handle one `ToolUse` event from the voice client.
    pub async fn handle_tool_use(
        &mut self,
        tool_client: &ToolClient,
        tool_use_id: String,
        tool_name: String,
        input: Value,
    ) -> ToolUseOutcome {
        if is_handoff_tool(&tool_name) {
            return self.handle_handoff_tool_use(tool_use_id, tool_name, input);
        }

        if self.dispatched_tool_names.contains(&tool_name) {
            self.pending_duplicate_tool_ids
                .entry(tool_name)
                .or_default()
                .push(tool_use_id);
            return ToolUseOutcome::default();
        }
        self.dispatched_tool_names.insert(tool_name.clone());

        let (success, result_value) = match tool_client.execute(&tool_name, input.clone()).await {
            Ok(outcome) => (outcome.success, outcome.result.unwrap_or(Value::Null)),
            Err(e) => (
                false,
                json!({"errorKind": format!("{:?}", e.kind), "message": e.message}),
            ),
        };

        self.messages.push(ConversationMessage {
            role: Role::Assistant,
            content: String::new(),
            metadata: MessageMetadata::tool_use(tool_use_id.clone(), tool_name.clone(), input),
        });
        let capped = ToolResult::capped(tool_use_id.clone(), result_value.clone(), TOOL_RESULT_CAP_BYTES);
        self.messages.push(ConversationMessage {
            role: Role::User,
            content: String::new(),
            metadata: MessageMetadata::tool_result(
                tool_use_id.clone(),
                capped.result.clone().unwrap_or(Value::Null),
                if success { "ok" } else { "error" },
            ),
        });

        let mut replies = vec![ToolReply {
            tool_use_id,
            success,
            result: capped.result.unwrap_or(Value::Null),
        }];
        if let Some(duplicate_ids) = self.pending_duplicate_tool_ids.remove(&tool_name) {
            for dup_id in duplicate_ids {
                replies.push(ToolReply {
                    tool_use_id: dup_id,
                    success,
                    result: result_value.clone(),
                });
            }
        }

        ToolUseOutcome {
            replies,
            gateway_event: None,
        }
    }

    fn handle_handoff_tool_use(&mut self, tool_use_id: String, tool_name: String, input: Value) -> ToolUseOutcome {
        if self.handoff_dispatched_this_turn {
            return ToolUseOutcome {
                replies: vec![ToolReply {
                    tool_use_id,
                    success: false,
                    result: json!({"errorKind": "MultipleHandoffBlocked"}),
                }],
                gateway_event: None,
            };
        }
        self.handoff_dispatched_this_turn = true;

        let mut context = self.handoff_context.clone();
        if let Some(obj) = input.as_object() {
            for (k, v) in obj {
                context.insert(k.clone(), v.clone());
            }
        }

        let target_capability = if tool_name == RETURN_TO_TRIAGE_TOOL {
            "triage".to_string()
        } else {
            tool_name
                .strip_prefix(HANDOFF_TOOL_PREFIX)
                .unwrap_or(&tool_name)
                .to_string()
        };

        let gateway_event = AgentToGateway::HandoffRequest {
            target_agent_id: None,
            target_capability: Some(target_capability),
            context,
            graph_state: Some(self.current_graph_state()),
        };

        ToolUseOutcome {
            replies: vec![ToolReply {
                tool_use_id,
                success: true,
                result: json!({"status": "handoff_requested"}),
            }],
            gateway_event: Some(gateway_event),
        }
    }

    /// §4.8.4: call after observing a `[STEP: <node_id>]` tag in the
    /// assistant's output.
    pub async fn handle_step_tag<'a>(
        &mut self,
        node_id: &str,
        decision_evaluator: &DecisionEvaluator<'a>,
    ) -> Option<DecisionHandlingResult> {
        self.workflow.update(node_id, None);
        let node = self.workflow.current()?.clone();
        if node.node_type != NodeType::Decision {
            return None;
        }

        let edges: Vec<WorkflowEdge> = self.workflow.graph().outgoing_edges(&node.id).into_iter().cloned().collect();
        if edges.is_empty() {
            return None;
        }
        let edge_refs: Vec<&WorkflowEdge> = edges.iter().collect();

        // A single outgoing edge short-circuits inside `evaluate` itself
        // (no LLM call, always succeeds), so it still produces a real
        // decision/injection here rather than being dropped.
        let outcome = decision_evaluator
            .evaluate(&node, &edge_refs, self.workflow.context(), &self.messages)
            .await;
        if !outcome.success {
            warn!(
                session_id = %self.session_id,
                node_id = %node.id,
                "decision evaluator fell back to first edge"
            );
        }

        self.workflow.update(&outcome.target_node_id, None);

        let system_injection = format!(
            "[SYSTEM] Decision for node {}: {} → GOTO {}",
            node.id, outcome.chosen_path_label, outcome.target_node_id
        );
        let gateway_event = AgentToGateway::DecisionMade {
            decision_node: node.id.clone(),
            chosen_path: outcome.chosen_path_label,
            target_node: outcome.target_node_id,
            confidence: outcome.confidence as f64,
            reasoning: outcome.reasoning,
            success: outcome.success,
        };

        Some(DecisionHandlingResult {
            system_injection,
            gateway_event,
        })
    }

    /// A real new user turn resets the per-turn dedup state (§4.7's
    /// "dispatched-id/name sets reset on a real new user turn, never on
    /// internal system injections").
    pub fn begin_user_turn(&mut self, text: impl Into<String>) {
        self.dispatched_tool_names.clear();
        self.pending_duplicate_tool_ids.clear();
        self.handoff_dispatched_this_turn = false;
        self.messages.push(ConversationMessage::user(text));
    }

    pub fn push_assistant_transcript(&mut self, text: impl Into<String>) {
        self.messages.push(ConversationMessage::assistant(text));
    }

    pub fn mode(&self) -> RuntimeMode {
        self.mode
    }

    /// §4.8.5: in text-only mode a user turn must be echoed back to the
    /// client as a `role=user` transcript before it is sent to the voice
    /// model, so the client has a single source of truth for the turn.
    pub fn should_echo_user_text(&self) -> bool {
        self.mode == RuntimeMode::TextOnly
    }
}

/// §4.8.6: pull the `[STEP: <node_id>]` tag off the front of an assistant
/// turn, if present, returning the node id and the remaining text.
pub fn extract_step_tag(text: &str) -> Option<(String, String)> {
    let trimmed = text.trim_start();
    let rest = trimmed.strip_prefix("[STEP:")?;
    let close = rest.find(']')?;
    let node_id = rest[..close].trim().to_string();
    let remainder = rest[close + 1..].trim_start().to_string();
    Some((node_id, remainder))
}

/// §4.8.6: strip leading control tags (`[STEP:…]`, `[DIALECT:…]`,
/// `SENTIMENT:…`, a stray `{"interrupted":true}` marker) before a transcript
/// reaches the client. Tags may be chained; strip until none remain.
pub fn strip_control_tags(text: &str) -> String {
    let mut remaining = text.trim_start();
    loop {
        if let Some(rest) = remaining.strip_prefix('[') {
            if let Some(close) = rest.find(']') {
                remaining = rest[close + 1..].trim_start();
                continue;
            }
        }
        if let Some(rest) = remaining.strip_prefix("SENTIMENT:") {
            let rest = rest.trim_start();
            let after = rest
                .find(char::is_whitespace)
                .map(|i| &rest[i..])
                .unwrap_or("");
            remaining = after.trim_start();
            continue;
        }
        if let Some(rest) = remaining.strip_prefix(r#"{"interrupted":true}"#) {
            remaining = rest.trim_start();
            continue;
        }
        break;
    }
    remaining.to_string()
}

fn is_handoff_tool(tool_name: &str) -> bool {
    tool_name.starts_with(HANDOFF_TOOL_PREFIX) || tool_name == RETURN_TO_TRIAGE_TOOL
}

fn render_handoff_tool_block(handoff_tools: &[ToolCatalogEntry]) -> String {
    if handoff_tools.is_empty() {
        return "## Handoff tools\nNone available from this agent.".to_string();
    }
    let mut block = String::from("## Handoff tools\n");
    for tool in handoff_tools {
        block.push_str(&format!("- {}: {}\n", tool.name, tool.description));
    }
    block
}

/// §4.8.1: render the graph as textual instructions. Every node's
/// user-facing instruction is separated from its internal transitions, which
/// are labeled so the model does not narrate them.
fn render_workflow_instructions(engine: &WorkflowEngine) -> String {
    let graph = engine.graph();
    let mut out = String::from("## Workflow instructions\n");
    out.push_str("Prefix every response with the tag [STEP: <node_id>] for the node you are acting from.\n\n");

    for node in &graph.nodes {
        out.push_str(&format!("### Node {} ({:?})\n", node.id, node.node_type));
        if let Some(message) = &node.message {
            out.push_str(&format!("User-facing instruction: {message}\n"));
        } else {
            out.push_str(&format!("User-facing instruction: {}\n", node.label));
        }

        let outgoing = graph.outgoing_edges(&node.id);
        if !outgoing.is_empty() {
            out.push_str("INTERNAL TRANSITIONS (DO NOT SPEAK THESE):\n");
            for edge in outgoing {
                match &edge.label {
                    Some(label) => out.push_str(&format!("- if \"{label}\" → GOTO {}\n", edge.to)),
                    None => out.push_str(&format!("- → GOTO {}\n", edge.to)),
                }
            }
        }
        out.push('\n');
    }

    out.push_str(
        "Workflow logic above (step tags, transitions, decisions) is internal bookkeeping and must never be narrated to the user.\n",
    );
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use sonic_provider::ProviderRegistry;
    use sonic_schema::persona::PersonaConfig;
    use sonic_schema::workflow::{WorkflowGraph, WorkflowNode};

    fn node(id: &str, ty: NodeType, message: Option<&str>) -> WorkflowNode {
        WorkflowNode {
            id: id.into(),
            node_type: ty,
            label: id.into(),
            tool_name: None,
            workflow_id: None,
            message: message.map(str::to_string),
        }
    }

    fn edge(from: &str, to: &str, label: Option<&str>) -> WorkflowEdge {
        WorkflowEdge {
            from: from.into(),
            to: to.into(),
            label: label.map(str::to_string),
        }
    }

    fn sample_graph() -> WorkflowGraph {
        WorkflowGraph {
            id: "banking-flow".into(),
            nodes: vec![
                node("start", NodeType::Start, None),
                node("dec", NodeType::Decision, Some("Ask what the customer needs.")),
                node("balance", NodeType::End, Some("Read back the balance.")),
                node("transactions", NodeType::End, Some("List recent transactions.")),
            ],
            edges: vec![
                edge("start", "dec", None),
                edge("dec", "balance", Some("balance")),
                edge("dec", "transactions", Some("transactions")),
            ],
        }
    }

    fn persona(id: &str, allowed_tools: Vec<&str>) -> PersonaConfig {
        PersonaConfig {
            id: id.into(),
            display_name: id.into(),
            prompt_file: format!("{id}.md"),
            workflows: vec!["banking-flow".into()],
            allowed_tools: allowed_tools.into_iter().map(str::to_string).collect(),
            voice_id: "amy".into(),
            metadata: Map::new(),
        }
    }

    fn session(persona_id: &str, allowed_tools: Vec<&str>) -> AgentSession {
        AgentSession::new(
            "sess-1",
            persona(persona_id, allowed_tools),
            "You are the banking agent.".into(),
            WorkflowEngine::new(sample_graph()),
            RuntimeMode::Hybrid,
        )
    }

    #[test]
    fn idv_agent_allowed_tools_excludes_transfer_tools() {
        let mut p = persona("identity-verification", vec!["identity_check", "transfer_to_banking"]);
        p.metadata.insert("handoffTargets".into(), json!(["banking"]));
        let session = AgentSession::new(
            "s1",
            p,
            "prompt".into(),
            WorkflowEngine::new(sample_graph()),
            RuntimeMode::VoiceOnly,
        );
        let tools = session.allowed_tools();
        assert!(tools.iter().any(|t| t == "identity_check"));
        assert!(tools.iter().any(|t| t == RETURN_TO_TRIAGE_TOOL));
        assert!(!tools.iter().any(|t| t.starts_with(HANDOFF_TOOL_PREFIX)));
    }

    #[test]
    fn non_idv_agent_gets_handoff_tools_from_metadata() {
        let mut p = persona("banking", vec!["check_balance"]);
        p.metadata.insert("handoffTargets".into(), json!(["triage", "mortgage"]));
        let session = AgentSession::new("s1", p, "prompt".into(), WorkflowEngine::new(sample_graph()), RuntimeMode::Hybrid);
        let tools = session.allowed_tools();
        assert!(tools.contains(&"transfer_to_triage".to_string()));
        assert!(tools.contains(&"transfer_to_mortgage".to_string()));
        assert!(tools.contains(&"check_balance".to_string()));
    }

    #[test]
    fn system_prompt_composition_order_is_context_persona_tools_workflow() {
        let session = session("banking", vec!["check_balance"]);
        let prompt = session.compose_system_prompt(&[ToolCatalogEntry {
            name: "transfer_to_mortgage".into(),
            description: "Hand off to the mortgage agent".into(),
            input_schema: json!({}),
        }]);

        let context_idx = prompt.find("## Context").unwrap();
        let persona_idx = prompt.find("You are the banking agent.").unwrap();
        let handoff_idx = prompt.find("## Handoff tools").unwrap();
        let workflow_idx = prompt.find("## Workflow instructions").unwrap();
        assert!(context_idx < persona_idx);
        assert!(persona_idx < handoff_idx);
        assert!(handoff_idx < workflow_idx);
    }

    #[test]
    fn workflow_instructions_mark_internal_transitions() {
        let session = session("banking", vec![]);
        let rendered = render_workflow_instructions(&session.workflow);
        assert!(rendered.contains("INTERNAL TRANSITIONS (DO NOT SPEAK THESE)"));
        assert!(rendered.contains("[STEP: <node_id>]"));
    }

    #[tokio::test]
    async fn handle_tool_use_appends_tool_use_and_tool_result_messages() {
        let server = wiremock::MockServer::start().await;
        wiremock::Mock::given(wiremock::matchers::method("POST"))
            .and(wiremock::matchers::path("/check_balance"))
            .respond_with(wiremock::ResponseTemplate::new(200).set_body_json(json!({"balance": 1200})))
            .mount(&server)
            .await;
        let tool_client = ToolClient::new(server.uri());

        let mut session = session("banking", vec!["check_balance"]);
        let outcome = session
            .handle_tool_use(&tool_client, "t1".into(), "check_balance".into(), json!({}))
            .await;

        assert_eq!(outcome.replies.len(), 1);
        assert!(outcome.replies[0].success);
        assert!(outcome.gateway_event.is_none());
        assert_eq!(session.messages.len(), 2);
    }

    #[tokio::test]
    async fn handle_tool_use_dedups_second_call_same_turn() {
        let server = wiremock::MockServer::start().await;
        wiremock::Mock::given(wiremock::matchers::method("POST"))
            .and(wiremock::matchers::path("/check_balance"))
            .respond_with(wiremock::ResponseTemplate::new(200).set_body_json(json!({"balance": 1200})))
            .expect(1)
            .mount(&server)
            .await;
        let tool_client = ToolClient::new(server.uri());

        let mut session = session("banking", vec!["check_balance"]);
        let first = session
            .handle_tool_use(&tool_client, "t1".into(), "check_balance".into(), json!({}))
            .await;
        assert_eq!(first.replies.len(), 1);

        let second = session
            .handle_tool_use(&tool_client, "t2".into(), "check_balance".into(), json!({}))
            .await;
        assert!(second.replies.is_empty());
    }

    #[tokio::test]
    async fn handoff_tool_use_does_not_hit_tool_client_and_emits_handoff_request() {
        let tool_client = ToolClient::new("http://127.0.0.1:1");
        let mut session = session("banking", vec!["check_balance"]);
        let outcome = session
            .handle_tool_use(&tool_client, "t1".into(), "transfer_to_mortgage".into(), json!({}))
            .await;

        assert_eq!(outcome.replies.len(), 1);
        assert!(outcome.replies[0].success);
        match outcome.gateway_event {
            Some(AgentToGateway::HandoffRequest { target_capability, .. }) => {
                assert_eq!(target_capability.as_deref(), Some("mortgage"));
            }
            other => panic!("expected handoff request, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn second_handoff_same_turn_is_blocked() {
        let tool_client = ToolClient::new("http://127.0.0.1:1");
        let mut session = session("banking", vec!["check_balance"]);
        let _ = session
            .handle_tool_use(&tool_client, "t1".into(), "transfer_to_mortgage".into(), json!({}))
            .await;
        let second = session
            .handle_tool_use(&tool_client, "t2".into(), "return_to_triage".into(), json!({}))
            .await;

        assert_eq!(second.replies.len(), 1);
        assert!(!second.replies[0].success);
        assert_eq!(second.replies[0].result["errorKind"], "MultipleHandoffBlocked");
        assert!(second.gateway_event.is_none());
    }

    #[tokio::test]
    async fn decision_node_with_two_edges_triggers_evaluation() {
        let mut registry = ProviderRegistry::new();
        registry.register(
            "text",
            std::sync::Arc::new(FixedReply("balance".to_string())),
        );
        let evaluator = DecisionEvaluator::new(&registry, "text", "model-x");

        let mut session = session("banking", vec!["check_balance"]);
        let result = session.handle_step_tag("dec", &evaluator).await;

        let result = result.expect("decision node should trigger evaluation");
        assert!(result.system_injection.contains("GOTO balance"));
        match result.gateway_event {
            AgentToGateway::DecisionMade { target_node, .. } => assert_eq!(target_node, "balance"),
            other => panic!("expected decision_made, got {other:?}"),
        }
        assert_eq!(session.workflow.current_node_id(), "balance");
    }

    #[tokio::test]
    async fn decision_node_with_single_edge_still_triggers_injection() {
        let registry = ProviderRegistry::new();
        let evaluator = DecisionEvaluator::new(&registry, "text", "model-x");

        let mut graph = sample_graph();
        graph.edges.retain(|e| e.to != "transactions");
        let mut session = AgentSession::new(
            "sess-1",
            persona("banking", vec!["check_balance"]),
            "You are the banking agent.".into(),
            WorkflowEngine::new(graph),
            RuntimeMode::Hybrid,
        );

        let result = session.handle_step_tag("dec", &evaluator).await;
        let result = result.expect("single-edge decision node should still produce a decision");
        assert!(result.system_injection.contains("GOTO balance"));
        assert_eq!(session.workflow.current_node_id(), "balance");
    }

    #[test]
    fn extract_step_tag_splits_node_id_and_remainder() {
        let (node_id, remainder) = extract_step_tag("[STEP: balance] Your balance is 500.").unwrap();
        assert_eq!(node_id, "balance");
        assert_eq!(remainder, "Your balance is 500.");
    }

    #[test]
    fn extract_step_tag_returns_none_without_tag() {
        assert!(extract_step_tag("Your balance is 500.").is_none());
    }

    #[test]
    fn strip_control_tags_removes_chained_leading_tags() {
        let raw = r#"[STEP: balance][DIALECT: en-GB]SENTIMENT: neutral {"interrupted":true} Your balance is 500."#;
        assert_eq!(strip_control_tags(raw), "Your balance is 500.");
    }

    #[test]
    fn strip_control_tags_is_noop_on_plain_text() {
        assert_eq!(strip_control_tags("Your balance is 500."), "Your balance is 500.");
    }

    #[test]
    fn text_only_mode_echoes_user_text() {
        let mut session = session("banking", vec!["check_balance"]);
        assert!(!session.should_echo_user_text());
        session = AgentSession::new(
            "s1",
            persona("banking", vec!["check_balance"]),
            "prompt".into(),
            WorkflowEngine::new(sample_graph()),
            RuntimeMode::TextOnly,
        );
        assert!(session.should_echo_user_text());
    }

    #[tokio::test]
    async fn non_decision_step_tag_does_not_trigger_evaluation() {
        let mut registry = ProviderRegistry::new();
        registry.register("text", std::sync::Arc::new(FixedReply("balance".to_string())));
        let evaluator = DecisionEvaluator::new(&registry, "text", "model-x");

        let mut session = session("banking", vec!["check_balance"]);
        let result = session.handle_step_tag("start", &evaluator).await;
        assert!(result.is_none());
    }

    struct FixedReply(String);

    #[async_trait::async_trait]
    impl sonic_provider::LlmProvider for FixedReply {
        async fn chat(&self, _request: sonic_provider::LlmRequest) -> anyhow::Result<sonic_provider::LlmResponse> {
            Ok(sonic_provider::LlmResponse {
                text: self.0.clone(),
                content: vec![],
                input_tokens: None,
                output_tokens: None,
                stop_reason: Some("end_turn".into()),
            })
        }
    }
}
