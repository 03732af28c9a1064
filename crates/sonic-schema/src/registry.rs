use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// An agent is unhealthy once its heartbeat is at least this old (§3, B4:
/// strict `<`, so exactly 30000ms old already counts as unhealthy).
pub const HEARTBEAT_FRESHNESS_SECONDS: i64 = 30;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Starting,
    Healthy,
    Unhealthy,
}

/// Directory entry owned by the Agent Registry (C2).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentInfo {
    pub agent_id: String,
    pub url: String,
    pub status: AgentStatus,
    #[serde(default)]
    pub capabilities: Vec<String>,
    pub last_heartbeat: DateTime<Utc>,
    pub port: u16,
}

impl AgentInfo {
    pub fn new(agent_id: impl Into<String>, url: impl Into<String>, port: u16) -> Self {
        let agent_id = agent_id.into();
        Self {
            capabilities: vec![agent_id.clone()],
            agent_id,
            url: url.into(),
            status: AgentStatus::Starting,
            last_heartbeat: Utc::now(),
            port,
        }
    }

    /// "healthy and reachable" per §3: `status=healthy` and heartbeat fresher
    /// than the staleness window (strict `<`, B4).
    pub fn is_healthy_and_reachable(&self, now: DateTime<Utc>) -> bool {
        self.status == AgentStatus::Healthy
            && (now - self.last_heartbeat).num_milliseconds()
                < HEARTBEAT_FRESHNESS_SECONDS * 1000
    }

    pub fn serves(&self, capability: &str) -> bool {
        self.agent_id == capability || self.capabilities.iter().any(|c| c == capability)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exactly_30s_old_heartbeat_is_unhealthy() {
        let now = Utc::now();
        let mut info = AgentInfo::new("triage", "ws://127.0.0.1:9001", 9001);
        info.status = AgentStatus::Healthy;
        info.last_heartbeat = now - chrono::Duration::milliseconds(HEARTBEAT_FRESHNESS_SECONDS * 1000);
        assert!(!info.is_healthy_and_reachable(now));
    }

    #[test]
    fn just_under_30s_old_heartbeat_is_healthy() {
        let now = Utc::now();
        let mut info = AgentInfo::new("triage", "ws://127.0.0.1:9001", 9001);
        info.status = AgentStatus::Healthy;
        info.last_heartbeat = now - chrono::Duration::milliseconds(29_999);
        assert!(info.is_healthy_and_reachable(now));
    }

    #[test]
    fn serves_own_id_and_capabilities() {
        let mut info = AgentInfo::new("idv", "ws://127.0.0.1:9002", 9002);
        info.capabilities.push("identity-verification".into());
        assert!(info.serves("idv"));
        assert!(info.serves("identity-verification"));
        assert!(!info.serves("banking"));
    }
}
