//! On-disk CLI config (`{root}/config.yaml`, overridable with `--config`):
//! the gateway's HTTP port, the LLM providers available to the Decision
//! Evaluator, and which of them backs workflow decisions by default.
//! Secret-shaped fields accept a `${VAR}` placeholder resolved against the
//! process environment, same scheme as `config::resolve_env_var`.

use std::path::Path;

use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use sonic_provider::ProviderConfig;

fn default_port() -> u16 {
    3000
}

#[derive(Debug, Clone, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self { port: default_port() }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DecisionConfig {
    pub provider_id: String,
    pub model_id: String,
}

impl Default for DecisionConfig {
    fn default() -> Self {
        Self {
            provider_id: "anthropic".into(),
            model_id: "claude-3-5-haiku-latest".into(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SonicConfig {
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub decision: DecisionConfig,
    #[serde(default)]
    pub providers: Vec<ProviderConfig>,
}

impl Default for SonicConfig {
    fn default() -> Self {
        Self {
            gateway: GatewayConfig::default(),
            decision: DecisionConfig::default(),
            providers: Vec::new(),
        }
    }
}

/// Substitutes `${VAR}` with the named environment variable, empty if unset.
/// Unterminated placeholders are left verbatim.
pub fn resolve_env_var(raw: &str) -> String {
    let mut output = String::new();
    let mut rest = raw;

    while let Some(start) = rest.find("${") {
        output.push_str(&rest[..start]);
        let candidate = &rest[start + 2..];
        let Some(end) = candidate.find('}') else {
            output.push_str(&rest[start..]);
            return output;
        };
        let key = &candidate[..end];
        output.push_str(&std::env::var(key).unwrap_or_default());
        rest = &candidate[end + 1..];
    }

    output.push_str(rest);
    output
}

fn resolve_providers_env(providers: &mut [ProviderConfig]) {
    for provider in providers {
        if let Some(key) = &provider.api_key {
            provider.api_key = Some(resolve_env_var(key));
        }
        if let Some(base_url) = &provider.base_url {
            provider.base_url = Some(resolve_env_var(base_url));
        }
    }
}

/// Missing config file is not an error: every field defaults, so the
/// gateway still runs with the stub provider until a real config lands.
pub fn load_config(path: &Path) -> Result<SonicConfig> {
    if !path.exists() {
        return Ok(SonicConfig::default());
    }
    let raw = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let mut config: SonicConfig =
        serde_yaml::from_str(&raw).with_context(|| format!("parsing {}", path.display()))?;
    resolve_providers_env(&mut config.providers);
    validate_config(&config)?;
    Ok(config)
}

pub fn validate_config(config: &SonicConfig) -> Result<()> {
    if config.decision.provider_id != "anthropic"
        && !config.providers.iter().any(|p| p.id == config.decision.provider_id)
    {
        return Err(anyhow!(
            "decision.provider_id {:?} is not registered under providers",
            config.decision.provider_id
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use sonic_provider::ProviderType;
    use tempfile::TempDir;

    #[test]
    fn load_config_missing_file_returns_defaults() {
        let tmp = TempDir::new().unwrap();
        let config = load_config(&tmp.path().join("config.yaml")).unwrap();
        assert_eq!(config.gateway.port, 3000);
        assert_eq!(config.decision.provider_id, "anthropic");
    }

    #[test]
    fn load_config_resolves_env_placeholder_in_api_key() {
        std::env::set_var("SONIC_TEST_PROVIDER_KEY", "shh-secret");
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("config.yaml");
        std::fs::write(
            &path,
            "decision:\n  provider_id: custom\n  model_id: m\nproviders:\n  - id: custom\n    type: custom\n    api_key: \"${SONIC_TEST_PROVIDER_KEY}\"\n    base_url: \"http://localhost\"\n",
        )
        .unwrap();

        let config = load_config(&path).unwrap();
        assert_eq!(config.providers[0].api_key.as_deref(), Some("shh-secret"));
        assert_eq!(config.providers[0].provider_type, ProviderType::Custom);
    }

    #[test]
    fn validate_config_rejects_unknown_decision_provider() {
        let config = SonicConfig {
            gateway: GatewayConfig::default(),
            decision: DecisionConfig {
                provider_id: "ghost".into(),
                model_id: "m".into(),
            },
            providers: vec![],
        };
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn resolve_env_var_missing_key_is_empty() {
        assert_eq!(resolve_env_var("${SONIC_TEST_DOES_NOT_EXIST}"), "");
    }
}
