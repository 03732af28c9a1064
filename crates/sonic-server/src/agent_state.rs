use std::sync::Arc;

use sonic_core::persona::PersonaBundle;
use sonic_provider::ProviderRegistry;

/// Shared state for one agent process (§4.8, §6.2): a single persona bound
/// to a single default workflow, hosting the `/session` endpoint the
/// gateway dials out to.
#[derive(Clone)]
pub struct AgentState {
    pub bundle: Arc<PersonaBundle>,
    pub default_workflow_id: String,
    pub mode: sonic_core::runtime::RuntimeMode,
    pub voice_url: Option<String>,
    pub tool_base_url: String,
    pub providers: Arc<ProviderRegistry>,
    pub decision_provider_id: String,
    pub decision_model_id: String,
}

impl AgentState {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        bundle: PersonaBundle,
        mode: sonic_core::runtime::RuntimeMode,
        voice_url: Option<String>,
        tool_base_url: String,
        providers: ProviderRegistry,
        decision_provider_id: String,
        decision_model_id: String,
    ) -> anyhow::Result<Self> {
        let default_workflow_id = bundle
            .config
            .workflows
            .first()
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("persona {} has no workflows", bundle.config.id))?;
        Ok(Self {
            bundle: Arc::new(bundle),
            default_workflow_id,
            mode,
            voice_url,
            tool_base_url,
            providers: Arc::new(providers),
            decision_provider_id,
            decision_model_id,
        })
    }
}
