//! Persona/Workflow Loader (C4): reads a persona config, its prompt
//! fragment and every workflow it references from the filesystem (§4.4).
//! Everything returned here is immutable for the lifetime of the session
//! that loaded it.

use std::collections::HashMap;
use std::path::Path;

use sonic_schema::persona::{is_valid_persona_id, PersonaConfig};
use sonic_schema::workflow::{WorkflowGraph, WorkflowValidationError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PersonaLoadError {
    #[error("persona config missing or unreadable: {0}")]
    PersonaMissing(String),
    #[error("persona {0} has an invalid id")]
    InvalidPersonaId(String),
    #[error("prompt file missing for persona {persona_id}: {path}")]
    PromptMissing { persona_id: String, path: String },
    #[error("workflow {workflow_id} is invalid: {source}")]
    WorkflowInvalid {
        workflow_id: String,
        #[source]
        source: WorkflowValidationError,
    },
    #[error("workflow file missing or unreadable: {0}")]
    WorkflowMissing(String),
}

/// Everything the Agent Runtime needs to bring a persona's agent online:
/// its config, resolved prompt text, and every workflow it can run.
pub struct PersonaBundle {
    pub config: PersonaConfig,
    pub prompt_text: String,
    pub workflows: HashMap<String, WorkflowGraph>,
}

/// Loads `{personas_dir}/{persona_id}.json`, then its prompt file (resolved
/// relative to `prompts_dir`), then every workflow it references from
/// `workflows_dir`.
pub fn load_persona_bundle(
    personas_dir: &Path,
    prompts_dir: &Path,
    workflows_dir: &Path,
    persona_id: &str,
) -> Result<PersonaBundle, PersonaLoadError> {
    if !is_valid_persona_id(persona_id) {
        return Err(PersonaLoadError::InvalidPersonaId(persona_id.to_string()));
    }

    let config = load_persona_config(personas_dir, persona_id)?;

    let prompt_path = prompts_dir.join(&config.prompt_file);
    let prompt_text = std::fs::read_to_string(&prompt_path).map_err(|_| PersonaLoadError::PromptMissing {
        persona_id: persona_id.to_string(),
        path: prompt_path.display().to_string(),
    })?;

    let mut workflows = HashMap::new();
    for workflow_id in &config.workflows {
        let graph = load_workflow(workflows_dir, workflow_id)?;
        workflows.insert(workflow_id.clone(), graph);
    }

    Ok(PersonaBundle {
        config,
        prompt_text,
        workflows,
    })
}

pub fn load_persona_config(personas_dir: &Path, persona_id: &str) -> Result<PersonaConfig, PersonaLoadError> {
    let path = personas_dir.join(format!("{persona_id}.json"));
    let raw = std::fs::read_to_string(&path)
        .map_err(|_| PersonaLoadError::PersonaMissing(path.display().to_string()))?;
    serde_json::from_str(&raw).map_err(|_| PersonaLoadError::PersonaMissing(path.display().to_string()))
}

/// The workflow's `id` is stamped from its filename rather than trusted
/// from the file body, so `workflow_{id}.json` is always the source of truth.
pub fn load_workflow(workflows_dir: &Path, workflow_id: &str) -> Result<WorkflowGraph, PersonaLoadError> {
    let path = workflows_dir.join(format!("workflow_{workflow_id}.json"));
    let raw = std::fs::read_to_string(&path)
        .map_err(|_| PersonaLoadError::WorkflowMissing(path.display().to_string()))?;
    let mut value: serde_json::Value = serde_json::from_str(&raw)
        .map_err(|_| PersonaLoadError::WorkflowMissing(path.display().to_string()))?;
    if let Some(obj) = value.as_object_mut() {
        obj.insert("id".to_string(), serde_json::Value::String(workflow_id.to_string()));
    }
    let graph: WorkflowGraph = serde_json::from_value(value)
        .map_err(|_| PersonaLoadError::WorkflowMissing(path.display().to_string()))?;
    graph
        .validate()
        .map_err(|source| PersonaLoadError::WorkflowInvalid {
            workflow_id: workflow_id.to_string(),
            source,
        })?;
    Ok(graph)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn write_workflow(dir: &Path, id: &str) {
        let graph = json!({
            "nodes": [
                {"id": "start", "type": "start", "label": "Start"},
                {"id": "end", "type": "end", "label": "End"},
            ],
            "edges": [{"from": "start", "to": "end"}],
        });
        std::fs::write(dir.join(format!("workflow_{id}.json")), graph.to_string()).unwrap();
    }

    #[test]
    fn load_persona_bundle_reads_config_prompt_and_workflows() {
        let tmp = TempDir::new().unwrap();
        let personas_dir = tmp.path().join("personas");
        let prompts_dir = tmp.path().join("prompts");
        let workflows_dir = tmp.path().join("workflows");
        std::fs::create_dir_all(&personas_dir).unwrap();
        std::fs::create_dir_all(&prompts_dir).unwrap();
        std::fs::create_dir_all(&workflows_dir).unwrap();

        std::fs::write(
            personas_dir.join("triage.json"),
            json!({
                "id": "triage",
                "displayName": "Triage",
                "promptFile": "triage.md",
                "workflows": ["triage-flow"],
                "allowedTools": [],
                "voiceId": "amy",
                "metadata": {},
            })
            .to_string(),
        )
        .unwrap();
        std::fs::write(prompts_dir.join("triage.md"), "You are the triage agent.").unwrap();
        write_workflow(&workflows_dir, "triage-flow");

        let bundle = load_persona_bundle(&personas_dir, &prompts_dir, &workflows_dir, "triage").unwrap();
        assert_eq!(bundle.config.voice_id, "amy");
        assert!(bundle.prompt_text.contains("triage agent"));
        assert!(bundle.workflows.contains_key("triage-flow"));
    }

    #[test]
    fn load_persona_bundle_rejects_invalid_id() {
        let tmp = TempDir::new().unwrap();
        let err = load_persona_bundle(tmp.path(), tmp.path(), tmp.path(), "Bad_Id").unwrap_err();
        assert!(matches!(err, PersonaLoadError::InvalidPersonaId(_)));
    }

    #[test]
    fn load_persona_bundle_missing_config_fails_fast() {
        let tmp = TempDir::new().unwrap();
        let err = load_persona_bundle(tmp.path(), tmp.path(), tmp.path(), "ghost").unwrap_err();
        assert!(matches!(err, PersonaLoadError::PersonaMissing(_)));
    }

    #[test]
    fn load_persona_bundle_missing_prompt_fails() {
        let tmp = TempDir::new().unwrap();
        let personas_dir = tmp.path().join("personas");
        std::fs::create_dir_all(&personas_dir).unwrap();
        std::fs::write(
            personas_dir.join("triage.json"),
            json!({
                "id": "triage",
                "displayName": "Triage",
                "promptFile": "missing.md",
                "workflows": [],
                "allowedTools": [],
                "voiceId": "amy",
                "metadata": {},
            })
            .to_string(),
        )
        .unwrap();

        let err = load_persona_bundle(&personas_dir, tmp.path(), tmp.path(), "triage").unwrap_err();
        assert!(matches!(err, PersonaLoadError::PromptMissing { .. }));
    }

    #[test]
    fn load_workflow_rejects_invalid_graph() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(
            tmp.path().join("workflow_broken.json"),
            json!({"nodes": [], "edges": []}).to_string(),
        )
        .unwrap();

        let err = load_workflow(tmp.path(), "broken").unwrap_err();
        assert!(matches!(err, PersonaLoadError::WorkflowInvalid { .. }));
    }
}
