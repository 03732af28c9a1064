use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersonaConfig {
    pub id: String,
    pub display_name: String,
    pub prompt_file: String,
    #[serde(default)]
    pub workflows: Vec<String>,
    #[serde(default)]
    pub allowed_tools: Vec<String>,
    pub voice_id: String,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

/// Persona ids are used directly as HTTP path segments and filenames
/// (§6.3): `/^[a-z0-9-]+$/`.
pub fn is_valid_persona_id(id: &str) -> bool {
    !id.is_empty()
        && id
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-')
}
