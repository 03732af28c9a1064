//! Wire message unions for the two WebSocket legs (§6.1, §6.2). Tags and
//! field casing follow the spec literally — it is not internally
//! consistent (some tags and fields are camelCase, some snake_case) because
//! it describes a protocol this gateway must interoperate with, not one
//! designed from scratch.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::session::{GraphState, SessionMemory};

// ============================================================
// Client ⇄ Gateway (§6.1)
// ============================================================

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type")]
pub enum ClientToGateway {
    #[serde(rename = "select_workflow")]
    SelectWorkflow {
        #[serde(rename = "workflowId")]
        workflow_id: String,
    },
    #[serde(rename = "sessionConfig")]
    SessionConfig { config: SessionConfigPayload },
    #[serde(rename = "text_input")]
    TextInput { text: String },
    #[serde(rename = "updateCredentials")]
    UpdateCredentials {
        #[serde(rename = "accessKeyId")]
        access_key_id: String,
        #[serde(rename = "secretAccessKey")]
        secret_access_key: String,
        region: String,
        #[serde(flatten)]
        extra: serde_json::Map<String, Value>,
    },
    #[serde(rename = "clearChat")]
    ClearChat {},
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct SessionConfigPayload {
    #[serde(rename = "systemPrompt", default)]
    pub system_prompt: Option<String>,
    #[serde(rename = "voiceId", default)]
    pub voice_id: Option<String>,
    #[serde(rename = "brainMode", default)]
    pub brain_mode: Option<String>,
    #[serde(rename = "selectedTools", default)]
    pub selected_tools: Option<Vec<String>>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TranscriptStage {
    Speculative,
    Final,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum GatewayToClient {
    #[serde(rename = "connected")]
    Connected { #[serde(rename = "sessionId")] session_id: String },
    #[serde(rename = "session_start")]
    SessionStart { #[serde(rename = "sessionId")] session_id: String },
    #[serde(rename = "transcript")]
    Transcript {
        id: String,
        role: String,
        text: String,
        #[serde(rename = "isFinal")]
        is_final: bool,
        #[serde(rename = "isStreaming", skip_serializing_if = "Option::is_none")]
        is_streaming: Option<bool>,
        #[serde(skip_serializing_if = "Option::is_none")]
        stage: Option<TranscriptStage>,
        timestamp: DateTime<Utc>,
    },
    #[serde(rename = "tool_use")]
    ToolUse {
        #[serde(rename = "toolName")]
        tool_name: String,
        #[serde(rename = "toolUseId")]
        tool_use_id: String,
        input: Value,
    },
    #[serde(rename = "tool_result")]
    ToolResult {
        #[serde(rename = "toolName")]
        tool_name: String,
        #[serde(rename = "toolUseId")]
        tool_use_id: String,
        success: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        result: Option<Value>,
        #[serde(rename = "errorKind", skip_serializing_if = "Option::is_none")]
        error_kind: Option<String>,
    },
    #[serde(rename = "handoff_event")]
    HandoffEvent { target: String },
    #[serde(rename = "decision_made")]
    DecisionMade {
        #[serde(rename = "decisionNode")]
        decision_node: String,
        #[serde(rename = "chosenPath")]
        chosen_path: String,
        #[serde(rename = "targetNode")]
        target_node: String,
        confidence: f64,
        reasoning: String,
        #[serde(default)]
        success: bool,
    },
    #[serde(rename = "workflow_update")]
    WorkflowUpdate {
        #[serde(rename = "currentStep")]
        current_step: String,
        #[serde(rename = "previousStep")]
        previous_step: String,
        #[serde(rename = "nodeType")]
        node_type: String,
        #[serde(rename = "nodeLabel")]
        node_label: String,
        #[serde(rename = "nextSteps")]
        next_steps: Vec<String>,
    },
    #[serde(rename = "usage")]
    Usage {
        #[serde(rename = "inputTokens")]
        input_tokens: u32,
        #[serde(rename = "outputTokens")]
        output_tokens: u32,
    },
    #[serde(rename = "metadata")]
    Metadata {
        #[serde(skip_serializing_if = "Option::is_none")]
        language: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        confidence: Option<f64>,
        #[serde(rename = "traceId", skip_serializing_if = "Option::is_none")]
        trace_id: Option<String>,
    },
    #[serde(rename = "error")]
    Error { kind: String, message: String },
}

// ============================================================
// Gateway ⇄ Agent (§6.2)
// ============================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum GatewayToAgent {
    #[serde(rename = "session_init")]
    SessionInit {
        #[serde(rename = "sessionId")]
        session_id: String,
        #[serde(rename = "traceId")]
        trace_id: String,
        memory: SessionMemory,
        timestamp: DateTime<Utc>,
    },
    #[serde(rename = "text_input")]
    TextInput { text: String },
    #[serde(rename = "user_input")]
    UserInput { text: String },
    #[serde(rename = "memory_update")]
    MemoryUpdate {
        #[serde(rename = "sessionId")]
        session_id: String,
        memory: SessionMemory,
        #[serde(rename = "graphState", skip_serializing_if = "Option::is_none")]
        graph_state: Option<GraphState>,
        timestamp: DateTime<Utc>,
    },
    #[serde(rename = "stop")]
    Stop {},
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum AgentToGateway {
    #[serde(rename = "connected")]
    Connected {
        #[serde(rename = "sessionId")]
        session_id: String,
        #[serde(rename = "agentId")]
        agent_id: String,
    },
    #[serde(rename = "session_ack")]
    SessionAck {
        #[serde(rename = "sessionId")]
        session_id: String,
        #[serde(rename = "agentId")]
        agent_id: String,
        s2s: String,
        workflow: String,
    },
    #[serde(rename = "transcript")]
    Transcript {
        id: String,
        role: String,
        text: String,
        #[serde(rename = "isFinal")]
        is_final: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        stage: Option<TranscriptStage>,
        timestamp: DateTime<Utc>,
    },
    #[serde(rename = "tool_use")]
    ToolUse {
        #[serde(rename = "toolName")]
        tool_name: String,
        #[serde(rename = "toolUseId")]
        tool_use_id: String,
        input: Value,
    },
    #[serde(rename = "tool_result")]
    ToolResult {
        #[serde(rename = "toolName")]
        tool_name: String,
        #[serde(rename = "toolUseId")]
        tool_use_id: String,
        success: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        result: Option<Value>,
        #[serde(rename = "errorKind", skip_serializing_if = "Option::is_none")]
        error_kind: Option<String>,
    },
    #[serde(rename = "handoff_request")]
    HandoffRequest {
        #[serde(rename = "targetAgentId", skip_serializing_if = "Option::is_none")]
        target_agent_id: Option<String>,
        #[serde(rename = "targetCapability", skip_serializing_if = "Option::is_none")]
        target_capability: Option<String>,
        context: serde_json::Map<String, Value>,
        #[serde(rename = "graphState", skip_serializing_if = "Option::is_none")]
        graph_state: Option<GraphState>,
    },
    #[serde(rename = "update_memory")]
    UpdateMemory { memory: serde_json::Map<String, Value> },
    #[serde(rename = "decision_made")]
    DecisionMade {
        #[serde(rename = "decisionNode")]
        decision_node: String,
        #[serde(rename = "chosenPath")]
        chosen_path: String,
        #[serde(rename = "targetNode")]
        target_node: String,
        confidence: f64,
        reasoning: String,
        #[serde(default)]
        success: bool,
    },
    #[serde(rename = "workflow_update")]
    WorkflowUpdate {
        #[serde(rename = "currentStep")]
        current_step: String,
        #[serde(rename = "previousStep")]
        previous_step: String,
        #[serde(rename = "nodeType")]
        node_type: String,
        #[serde(rename = "nodeLabel")]
        node_label: String,
        #[serde(rename = "nextSteps")]
        next_steps: Vec<String>,
    },
    #[serde(rename = "usage")]
    Usage {
        #[serde(rename = "inputTokens")]
        input_tokens: u32,
        #[serde(rename = "outputTokens")]
        output_tokens: u32,
    },
    #[serde(rename = "error")]
    Error { kind: String, message: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn select_workflow_decodes_camel_case_field() {
        let json = serde_json::json!({"type": "select_workflow", "workflowId": "banking"});
        let msg: ClientToGateway = serde_json::from_value(json).unwrap();
        match msg {
            ClientToGateway::SelectWorkflow { workflow_id } => assert_eq!(workflow_id, "banking"),
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn session_config_tag_is_camel_case() {
        let json = serde_json::json!({
            "type": "sessionConfig",
            "config": {"voiceId": "amy"}
        });
        let msg: ClientToGateway = serde_json::from_value(json).unwrap();
        match msg {
            ClientToGateway::SessionConfig { config } => {
                assert_eq!(config.voice_id.as_deref(), Some("amy"));
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn handoff_request_round_trips_target_capability() {
        let req = AgentToGateway::HandoffRequest {
            target_agent_id: None,
            target_capability: Some("idv".into()),
            context: serde_json::Map::new(),
            graph_state: None,
        };
        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(json["type"], "handoff_request");
        assert_eq!(json["targetCapability"], "idv");
        assert!(json.get("targetAgentId").is_none());
    }

    #[test]
    fn gateway_to_client_error_tag_and_fields() {
        let err = GatewayToClient::Error {
            kind: "ToolUpstream".into(),
            message: "boom".into(),
        };
        let json = serde_json::to_value(&err).unwrap();
        assert_eq!(json["type"], "error");
        assert_eq!(json["kind"], "ToolUpstream");
    }
}
