use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
    System,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum MessageType {
    Text,
    ToolUse,
    ToolResult,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct MessageMetadata {
    #[serde(rename = "type", default)]
    pub kind: Option<MessageType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_use_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
}

impl MessageMetadata {
    pub fn text() -> Self {
        Self {
            kind: Some(MessageType::Text),
            ..Self::default()
        }
    }

    pub fn tool_use(tool_use_id: impl Into<String>, tool_name: impl Into<String>, input: Value) -> Self {
        Self {
            kind: Some(MessageType::ToolUse),
            tool_use_id: Some(tool_use_id.into()),
            tool_name: Some(tool_name.into()),
            input: Some(input),
            ..Self::default()
        }
    }

    pub fn tool_result(
        tool_use_id: impl Into<String>,
        result: Value,
        status: impl Into<String>,
    ) -> Self {
        Self {
            kind: Some(MessageType::ToolResult),
            tool_use_id: Some(tool_use_id.into()),
            result: Some(result),
            status: Some(status.into()),
            ..Self::default()
        }
    }
}

/// One turn in `AgentSession.messages` (§3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationMessage {
    pub role: Role,
    pub content: String,
    #[serde(default)]
    pub metadata: MessageMetadata,
}

impl ConversationMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
            metadata: MessageMetadata::text(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
            metadata: MessageMetadata::text(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    pub tool_use_id: String,
    pub tool_name: String,
    pub input: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolResult {
    pub tool_use_id: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl ToolResult {
    pub fn ok(tool_use_id: impl Into<String>, result: Value) -> Self {
        Self {
            tool_use_id: tool_use_id.into(),
            success: true,
            result: Some(result),
            error_kind: None,
            error_message: None,
        }
    }

    pub fn err(tool_use_id: impl Into<String>, kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            tool_use_id: tool_use_id.into(),
            success: false,
            result: None,
            error_kind: Some(kind.into()),
            error_message: Some(message.into()),
        }
    }

    /// Truncate an oversized result payload (B3, default cap 2048 bytes
    /// serialized) before it is sent to the voice model.
    pub fn capped(tool_use_id: impl Into<String>, result: Value, cap_bytes: usize) -> Self {
        let serialized = serde_json::to_string(&result).unwrap_or_default();
        if serialized.len() <= cap_bytes {
            return Self::ok(tool_use_id, result);
        }
        let truncated = serde_json::json!({
            "truncated": true,
            "originalSize": serialized.len(),
            "result": serialized.chars().take(cap_bytes).collect::<String>(),
        });
        Self::ok(tool_use_id, truncated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_metadata_round_trips_tool_use() {
        let msg = ConversationMessage {
            role: Role::Assistant,
            content: String::new(),
            metadata: MessageMetadata::tool_use("t1", "agentcore_balance", serde_json::json!({"x":1})),
        };
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["metadata"]["type"], "toolUse");
        let back: ConversationMessage = serde_json::from_value(json).unwrap();
        assert_eq!(back.metadata.tool_name.as_deref(), Some("agentcore_balance"));
    }

    #[test]
    fn tool_result_under_cap_is_untouched() {
        let r = ToolResult::capped("t1", serde_json::json!({"balance": 1200}), 2048);
        assert!(r.success);
        assert_eq!(r.result.unwrap()["balance"], 1200);
    }

    #[test]
    fn tool_result_over_cap_is_truncated() {
        let big = serde_json::json!({"blob": "x".repeat(4000)});
        let r = ToolResult::capped("t1", big, 2048);
        let result = r.result.unwrap();
        assert_eq!(result["truncated"], true);
        assert!(result["originalSize"].as_u64().unwrap() > 2048);
    }
}
