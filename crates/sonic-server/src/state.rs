use std::path::PathBuf;
use std::sync::Arc;

use sonic_core::peer_registry::AgentRegistry;
use sonic_core::session::SessionStore;
use sonic_gateway::Gateway;
use tokio::sync::Mutex;

/// Shared application state accessible from all route handlers (§6.6: the
/// only on-disk state is the persona/prompt/workflow directories).
#[derive(Clone)]
pub struct AppState {
    pub personas_dir: PathBuf,
    pub prompts_dir: PathBuf,
    pub workflows_dir: PathBuf,
    pub sessions: Arc<SessionStore>,
    pub registry: Arc<Mutex<AgentRegistry>>,
    pub gateway: Arc<Gateway>,
}

impl AppState {
    pub fn new(root: PathBuf) -> Self {
        let sessions = Arc::new(SessionStore::new());
        let registry = Arc::new(Mutex::new(AgentRegistry::new()));
        let gateway = Arc::new(Gateway::new(sessions.clone(), registry.clone()));
        Self {
            personas_dir: root.join("personas"),
            prompts_dir: root.join("prompts"),
            workflows_dir: root.join("workflows"),
            sessions,
            registry,
            gateway,
        }
    }
}
