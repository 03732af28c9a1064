//! Session Store (C1): ephemeral per-session state and memory with TTL,
//! keyed by session id. In-memory only — the spec's non-goals exclude
//! persistence beyond ephemeral state with a fixed TTL.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use serde_json::{Map, Value};
use sonic_schema::session::{GraphState, Session, SessionMemory};
use thiserror::Error;
use tokio::sync::Mutex;

#[derive(Debug, Error)]
pub enum SessionStoreError {
    #[error("session not found: {0}")]
    SessionNotFound(String),
}

type Result<T> = std::result::Result<T, SessionStoreError>;

/// Per-session lock plus the session record it guards. A `Mutex` per
/// session (rather than one lock over the whole map) keeps unrelated
/// sessions from serializing on each other's reads/writes.
struct Slot {
    session: Mutex<Session>,
}

#[derive(Default)]
pub struct SessionStore {
    slots: Mutex<HashMap<String, Arc<Slot>>>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn create(&self, session_id: impl Into<String>, initial_agent_id: impl Into<String>) -> Session {
        let session_id = session_id.into();
        let session = Session::new(session_id.clone(), initial_agent_id.into());
        let slot = Arc::new(Slot {
            session: Mutex::new(session.clone()),
        });
        self.slots.lock().await.insert(session_id, slot);
        session
    }

    pub async fn get(&self, session_id: &str) -> Result<Session> {
        let slot = self.slot(session_id).await?;
        let session = slot.session.lock().await;
        if session.is_expired(Utc::now()) {
            return Err(SessionStoreError::SessionNotFound(session_id.to_string()));
        }
        Ok(session.clone())
    }

    /// Overwrite the whole record (last-writer-wins) and refresh its TTL.
    pub async fn save(&self, mut session: Session) -> Result<()> {
        session.touch(Utc::now());
        let slot = self.slot_or_insert(session.session_id.clone()).await;
        *slot.session.lock().await = session;
        Ok(())
    }

    /// Changes `currentAgentId`. Callers must have already confirmed the
    /// target agent is healthy via the Agent Registry (C2); this method
    /// does not reach into C2 itself so it stays testable in isolation.
    pub async fn transfer(
        &self,
        session_id: &str,
        to_agent_id: impl Into<String>,
        context_patch: Option<Map<String, Value>>,
    ) -> Result<Session> {
        let slot = self.slot(session_id).await?;
        let mut session = slot.session.lock().await;
        let now = Utc::now();
        if session.is_expired(now) {
            return Err(SessionStoreError::SessionNotFound(session_id.to_string()));
        }
        session.current_agent_id = to_agent_id.into();
        if let Some(patch) = context_patch {
            session.memory.apply_patch(&patch);
        }
        session.touch(now);
        Ok(session.clone())
    }

    pub async fn update_memory(&self, session_id: &str, patch: Map<String, Value>) -> Result<SessionMemory> {
        let slot = self.slot(session_id).await?;
        let mut session = slot.session.lock().await;
        let now = Utc::now();
        if session.is_expired(now) {
            return Err(SessionStoreError::SessionNotFound(session_id.to_string()));
        }
        session.memory.apply_patch(&patch);
        session.touch(now);
        Ok(session.memory.clone())
    }

    pub async fn update_graph_state(&self, session_id: &str, graph_state: GraphState) -> Result<()> {
        let slot = self.slot(session_id).await?;
        let mut session = slot.session.lock().await;
        let now = Utc::now();
        if session.is_expired(now) {
            return Err(SessionStoreError::SessionNotFound(session_id.to_string()));
        }
        session.memory.graph_state = Some(graph_state);
        session.touch(now);
        Ok(())
    }

    pub async fn get_memory(&self, session_id: &str) -> Result<SessionMemory> {
        Ok(self.get(session_id).await?.memory)
    }

    pub async fn delete(&self, session_id: &str) -> bool {
        self.slots.lock().await.remove(session_id).is_some()
    }

    /// Drops every session whose TTL has lapsed. Intended to run on an
    /// interval from the gateway's background task set.
    pub async fn reap_expired(&self) -> usize {
        let mut slots = self.slots.lock().await;
        let now = Utc::now();
        let mut expired = Vec::new();
        for (id, slot) in slots.iter() {
            if slot.session.lock().await.is_expired(now) {
                expired.push(id.clone());
            }
        }
        for id in &expired {
            slots.remove(id);
        }
        expired.len()
    }

    pub async fn len(&self) -> usize {
        self.slots.lock().await.len()
    }

    async fn slot(&self, session_id: &str) -> Result<Arc<Slot>> {
        self.slots
            .lock()
            .await
            .get(session_id)
            .cloned()
            .ok_or_else(|| SessionStoreError::SessionNotFound(session_id.to_string()))
    }

    async fn slot_or_insert(&self, session_id: String) -> Arc<Slot> {
        let mut slots = self.slots.lock().await;
        slots
            .entry(session_id.clone())
            .or_insert_with(|| {
                Arc::new(Slot {
                    session: Mutex::new(Session::new(session_id, String::new())),
                })
            })
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn create_then_get_round_trips() {
        let store = SessionStore::new();
        let session = store.create("s1", "triage").await;
        assert_eq!(session.current_agent_id, "triage");

        let loaded = store.get("s1").await.unwrap();
        assert_eq!(loaded.session_id, "s1");
    }

    #[tokio::test]
    async fn get_missing_session_errors() {
        let store = SessionStore::new();
        let err = store.get("nope").await.unwrap_err();
        assert!(matches!(err, SessionStoreError::SessionNotFound(_)));
    }

    #[tokio::test]
    async fn transfer_changes_current_agent_and_patches_memory() {
        let store = SessionStore::new();
        store.create("s1", "triage").await;

        let mut patch = Map::new();
        patch.insert("verified".into(), json!(true));
        let session = store.transfer("s1", "banking", Some(patch)).await.unwrap();

        assert_eq!(session.current_agent_id, "banking");
        assert_eq!(session.memory.verified, true);
    }

    #[tokio::test]
    async fn update_memory_merges_without_clobbering_other_fields() {
        let store = SessionStore::new();
        store.create("s1", "triage").await;

        let mut first = Map::new();
        first.insert("userName".into(), json!("Alex"));
        store.update_memory("s1", first).await.unwrap();

        let mut second = Map::new();
        second.insert("account".into(), json!("12345678"));
        let memory = store.update_memory("s1", second).await.unwrap();

        assert_eq!(memory.user_name.as_deref(), Some("Alex"));
        assert_eq!(memory.account.as_deref(), Some("12345678"));
    }

    #[tokio::test]
    async fn delete_removes_session() {
        let store = SessionStore::new();
        store.create("s1", "triage").await;
        assert!(store.delete("s1").await);
        assert!(store.get("s1").await.is_err());
    }

    #[tokio::test]
    async fn reap_expired_drops_only_expired_sessions() {
        use sonic_schema::session::SESSION_TTL_SECONDS;

        let store = SessionStore::new();
        store.create("fresh", "triage").await;

        let mut stale = Session::new("stale", "triage");
        stale.last_activity = Utc::now() - chrono::Duration::seconds(SESSION_TTL_SECONDS + 10);
        store.save(stale).await.unwrap();

        let reaped = store.reap_expired().await;
        assert_eq!(reaped, 1);
        assert!(store.get("fresh").await.is_ok());
        assert!(store.get("stale").await.is_err());
    }
}
