use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// TTL applied to every session record; refreshed on every write (§3, §4.1).
pub const SESSION_TTL_SECONDS: i64 = 3600;

/// Per-session state owned by the Session Store (C1).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub session_id: String,
    pub current_agent_id: String,
    pub start_time: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    #[serde(default)]
    pub memory: SessionMemory,
}

impl Session {
    pub fn new(session_id: impl Into<String>, initial_agent_id: impl Into<String>) -> Self {
        let now = Utc::now();
        let agent_id = initial_agent_id.into();
        Self {
            session_id: session_id.into(),
            current_agent_id: agent_id.clone(),
            start_time: now,
            last_activity: now,
            memory: SessionMemory {
                last_agent: agent_id,
                ..SessionMemory::default()
            },
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        (now - self.last_activity).num_seconds() >= SESSION_TTL_SECONDS
    }

    pub fn touch(&mut self, now: DateTime<Utc>) {
        self.last_activity = now;
    }
}

/// The transfer/handoff payload an IDV agent stages before requesting a
/// handoff; named to match the spec's `session.memory.pendingHandoff` (§4.8.2).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingHandoff {
    pub target: String,
    pub reason: Option<String>,
    pub context: Map<String, Value>,
}

/// Graph position carried across a handoff, when the target workflow cares.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct GraphState {
    pub workflow_id: String,
    pub current_node_id: String,
    #[serde(default)]
    pub context: Map<String, Value>,
}

/// Open mapping with reserved slots (§3). Unknown keys round-trip via `extra`.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SessionMemory {
    #[serde(default)]
    pub verified: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub account: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sort_code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_intent: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_user_message: Option<String>,
    #[serde(default)]
    pub last_agent: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub graph_state: Option<GraphState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pending_handoff: Option<PendingHandoff>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl SessionMemory {
    /// Read-modify-write patch application (UpdateMemory, §4.1). `patch` is a
    /// JSON object; present keys overwrite, reserved keys are merged onto the
    /// typed fields, everything else lands in `extra`.
    pub fn apply_patch(&mut self, patch: &Map<String, Value>) {
        for (key, value) in patch {
            match key.as_str() {
                "verified" => {
                    if let Some(b) = value.as_bool() {
                        self.verified = b;
                    }
                }
                "userName" | "user_name" => self.user_name = value.as_str().map(str::to_string),
                "account" => self.account = value.as_str().map(str::to_string),
                "sortCode" | "sort_code" => self.sort_code = value.as_str().map(str::to_string),
                "userIntent" | "user_intent" => {
                    self.user_intent = value.as_str().map(str::to_string)
                }
                "lastUserMessage" | "last_user_message" => {
                    self.last_user_message = value.as_str().map(str::to_string)
                }
                "lastAgent" | "last_agent" => {
                    if let Some(s) = value.as_str() {
                        self.last_agent = s.to_string();
                    }
                }
                "graphState" | "graph_state" => {
                    if let Ok(gs) = serde_json::from_value::<GraphState>(value.clone()) {
                        self.graph_state = Some(gs);
                    }
                }
                "pendingHandoff" | "pending_handoff" => {
                    if value.is_null() {
                        self.pending_handoff = None;
                    } else if let Ok(ph) = serde_json::from_value::<PendingHandoff>(value.clone())
                    {
                        self.pending_handoff = Some(ph);
                    }
                }
                _ => {
                    self.extra.insert(key.clone(), value.clone());
                }
            }
        }
    }
}
