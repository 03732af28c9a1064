//! Gateway (C9): admits browser sessions, routes their turns to the
//! current agent, extracts intent/credentials from each finalized user
//! turn, and intercepts handoff requests so the session's memory and
//! current agent swap atomically from the client's point of view (§4.9).
//!
//! Live WebSocket framing (the client `/sonic` socket and the agent
//! `/session` socket, §6.1/§6.2) is owned by `sonic-server`; this crate
//! holds the routing/state-machine logic those handlers call into, kept
//! free of any transport so it can be exercised directly in tests.

pub mod auto_trigger;
pub mod filter;
pub mod handoff;
pub mod intent;
pub mod rate_limit;

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use serde_json::{Map, Value};
use sonic_core::peer_registry::AgentRegistry;
use sonic_core::session::{SessionStore, SessionStoreError};
use sonic_schema::session::Session;
use thiserror::Error;
use tokio::sync::Mutex;

use handoff::{HandoffCheck, HandoffGuard};
use rate_limit::{RateLimitConfig, RateLimiter};

/// Capability requested for a brand-new session with no routing hint yet.
pub const DEFAULT_ENTRY_CAPABILITY: &str = "triage";

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error(transparent)]
    SessionStore(#[from] SessionStoreError),
    #[error("no healthy agent serves capability {0}")]
    AgentUnreachable(String),
}

#[derive(Debug, Error)]
pub enum HandoffRequestError {
    #[error(transparent)]
    SessionStore(#[from] SessionStoreError),
    #[error("a handoff is already in progress or within its cooldown window for session {0}")]
    MultipleHandoffBlocked(String),
    #[error("no healthy agent serves capability {0}")]
    AgentUnreachable(String),
}

type Result<T> = std::result::Result<T, GatewayError>;
type HandoffResult<T> = std::result::Result<T, HandoffRequestError>;

/// Ties the Session Store (C1) and Agent Registry (C2) together with the
/// per-session handoff guard the rest of the gateway's routing logic
/// needs (§4.9, §5).
pub struct Gateway {
    pub sessions: Arc<SessionStore>,
    pub registry: Arc<Mutex<AgentRegistry>>,
    handoff_guards: Mutex<HashMap<String, HandoffGuard>>,
    rate_limiter: RateLimiter,
}

impl Gateway {
    pub fn new(sessions: Arc<SessionStore>, registry: Arc<Mutex<AgentRegistry>>) -> Self {
        Self {
            sessions,
            registry,
            handoff_guards: Mutex::new(HashMap::new()),
            rate_limiter: RateLimiter::new(RateLimitConfig::default()),
        }
    }

    /// Inbound rate limit ahead of agent dispatch (§4.9 ambient); `false`
    /// means the caller should drop the message rather than forward it.
    pub async fn check_rate_limit(&self, session_id: &str) -> bool {
        self.rate_limiter.check(session_id).await
    }

    /// Session admission: creates a session pinned to the first healthy
    /// agent serving `capability` (the default entry point if none is
    /// requested yet).
    pub async fn admit_session(&self, session_id: impl Into<String>, capability: Option<&str>) -> Result<Session> {
        let capability = capability.unwrap_or(DEFAULT_ENTRY_CAPABILITY);
        let agent_id = {
            let registry = self.registry.lock().await;
            registry
                .find_by_capability(capability)
                .map(|a| a.agent_id.clone())
                .ok_or_else(|| GatewayError::AgentUnreachable(capability.to_string()))?
        };
        Ok(self.sessions.create(session_id, agent_id).await)
    }

    /// Intent/credential extraction for one finalized user turn: merges
    /// the extracted fields into session memory and returns the patch
    /// that was applied, so the caller can forward it to the agent.
    pub async fn apply_user_turn(&self, session_id: &str, user_text: &str) -> Result<Map<String, Value>> {
        let existing = self.sessions.get_memory(session_id).await?;
        let extracted = intent::extract(user_text);
        let patch = intent::build_memory_patch(&extracted, existing.user_intent.as_deref(), user_text);
        self.sessions.update_memory(session_id, patch.clone()).await?;
        Ok(patch)
    }

    /// Steps 1-3 of the handoff interception sequence (§4.9): check the
    /// guard, resolve the target agent, and mark the handoff in flight.
    /// Returns the resolved target agent id; steps 4-9 (pausing the
    /// current agent's socket, draining in-flight audio, opening the new
    /// agent's socket, replaying memory, resuming the client) are owned by
    /// the live connection handler since they touch actual sockets.
    pub async fn begin_handoff(&self, session_id: &str, target_capability: &str) -> HandoffResult<String> {
        let now = Utc::now();
        {
            let mut guards = self.handoff_guards.lock().await;
            let guard = guards.entry(session_id.to_string()).or_default();
            if guard.check(now) == HandoffCheck::Blocked {
                return Err(HandoffRequestError::MultipleHandoffBlocked(session_id.to_string()));
            }
            guard.begin();
        }

        let target_agent_id = {
            let registry = self.registry.lock().await;
            registry.find_by_capability(target_capability).map(|a| a.agent_id.clone())
        };

        let Some(target_agent_id) = target_agent_id else {
            self.cancel_handoff(session_id).await;
            return Err(HandoffRequestError::AgentUnreachable(target_capability.to_string()));
        };

        Ok(target_agent_id)
    }

    /// Step 9: the new agent's socket is live and memory has been
    /// replayed. Swaps `currentAgentId`, applies any final context patch,
    /// and starts the handoff's cooldown window.
    pub async fn complete_handoff(
        &self,
        session_id: &str,
        target_agent_id: impl Into<String>,
        context_patch: Option<Map<String, Value>>,
    ) -> HandoffResult<Session> {
        let session = self.sessions.transfer(session_id, target_agent_id, context_patch).await?;
        let now = Utc::now();
        let mut guards = self.handoff_guards.lock().await;
        guards.entry(session_id.to_string()).or_default().complete(now);
        Ok(session)
    }

    /// Raw admin-style transfer (§6.3 `POST /sessions/:id/transfer`), not
    /// gated by the handoff guard `begin_handoff`/`complete_handoff` use.
    /// Still MUST verify the target agent is healthy via C2 before
    /// changing `currentAgentId` (§4.1); on failure state is left
    /// unchanged and an error is returned.
    pub async fn transfer_session(
        &self,
        session_id: &str,
        to_agent_id: impl Into<String>,
        context_patch: Option<Map<String, Value>>,
    ) -> HandoffResult<Session> {
        let to_agent_id = to_agent_id.into();
        let healthy = {
            let registry = self.registry.lock().await;
            registry
                .get(&to_agent_id)
                .map(|agent| agent.is_healthy_and_reachable(Utc::now()))
                .unwrap_or(false)
        };
        if !healthy {
            return Err(HandoffRequestError::AgentUnreachable(to_agent_id));
        }
        Ok(self.sessions.transfer(session_id, to_agent_id, context_patch).await?)
    }

    /// Aborts an in-flight handoff (e.g. the target agent never came up)
    /// without starting the cooldown window, so a retry can proceed.
    pub async fn cancel_handoff(&self, session_id: &str) {
        let mut guards = self.handoff_guards.lock().await;
        guards.entry(session_id.to_string()).or_default().cancel();
    }

    /// Whether the session's memory is ready for the `"I want to …"`
    /// synthetic turn, and the text to send if so.
    pub async fn resolve_auto_trigger(&self, session_id: &str) -> Result<Option<String>> {
        let memory = self.sessions.get_memory(session_id).await?;
        Ok(auto_trigger::auto_trigger_message(&memory))
    }
}
