//! Agent Registry (C2): liveness and capability directory of running
//! agents (§4.2). Registration order is preserved so `FindByCapability`
//! can return the first healthy match deterministically.

use std::collections::HashMap;

use chrono::Utc;
use sonic_schema::registry::AgentInfo;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AgentRegistryError {
    #[error("agent not found: {0}")]
    AgentNotFound(String),
}

type Result<T> = std::result::Result<T, AgentRegistryError>;

#[derive(Debug, Default)]
pub struct AgentRegistry {
    agents: HashMap<String, AgentInfo>,
    /// Insertion order, oldest first; `FindByCapability` walks this to get
    /// deterministic "first registered" semantics.
    order: Vec<String>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, info: AgentInfo) {
        if !self.agents.contains_key(&info.agent_id) {
            self.order.push(info.agent_id.clone());
        }
        self.agents.insert(info.agent_id.clone(), info);
    }

    pub fn heartbeat(&mut self, agent_id: &str) -> Result<()> {
        let agent = self
            .agents
            .get_mut(agent_id)
            .ok_or_else(|| AgentRegistryError::AgentNotFound(agent_id.to_string()))?;
        agent.status = sonic_schema::registry::AgentStatus::Healthy;
        agent.last_heartbeat = Utc::now();
        Ok(())
    }

    /// Explicit status update (§6.3 `POST /api/agents/:agentId/status`), as
    /// opposed to `heartbeat`, which always sets `Healthy`.
    pub fn set_status(&mut self, agent_id: &str, status: sonic_schema::registry::AgentStatus) -> Result<()> {
        let agent = self
            .agents
            .get_mut(agent_id)
            .ok_or_else(|| AgentRegistryError::AgentNotFound(agent_id.to_string()))?;
        agent.status = status;
        Ok(())
    }

    pub fn get(&self, agent_id: &str) -> Option<&AgentInfo> {
        self.agents.get(agent_id)
    }

    pub fn list(&self) -> Vec<&AgentInfo> {
        self.order.iter().filter_map(|id| self.agents.get(id)).collect()
    }

    pub fn list_healthy(&self) -> Vec<&AgentInfo> {
        let now = Utc::now();
        self.list()
            .into_iter()
            .filter(|a| a.is_healthy_and_reachable(now))
            .collect()
    }

    /// First healthy agent serving `capability`, in registration order.
    pub fn find_by_capability(&self, capability: &str) -> Option<&AgentInfo> {
        let now = Utc::now();
        self.order.iter().find_map(|id| {
            let agent = self.agents.get(id)?;
            if agent.is_healthy_and_reachable(now) && agent.serves(capability) {
                Some(agent)
            } else {
                None
            }
        })
    }

    pub fn unregister(&mut self, agent_id: &str) -> Option<AgentInfo> {
        self.order.retain(|id| id != agent_id);
        self.agents.remove(agent_id)
    }
}
