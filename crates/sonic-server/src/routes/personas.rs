//! Persona config CRUD (§6.3). Deleting a persona removes its config file
//! but preserves the prompt file, since the prompt may be shared or kept
//! around for reference.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use sonic_schema::persona::{is_valid_persona_id, PersonaConfig};

use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(list_personas).post(create_persona))
        .route(
            "/{id}",
            get(get_persona).put(update_persona).delete(delete_persona),
        )
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PersonaRequest {
    #[serde(default)]
    id: Option<String>,
    name: String,
    voice_id: String,
    #[serde(default)]
    allowed_tools: Vec<String>,
    #[serde(default)]
    workflows: Vec<String>,
    prompt_content: String,
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
    message: String,
}

fn error_response(status: StatusCode, kind: &str, message: impl Into<String>) -> (StatusCode, Json<ErrorBody>) {
    (
        status,
        Json(ErrorBody {
            error: kind.to_string(),
            message: message.into(),
        }),
    )
}

fn config_path(state: &AppState, id: &str) -> std::path::PathBuf {
    state.personas_dir.join(format!("{id}.json"))
}

async fn list_personas(State(state): State<AppState>) -> Json<Vec<PersonaConfig>> {
    let mut personas = Vec::new();
    if let Ok(entries) = std::fs::read_dir(&state.personas_dir) {
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            if let Ok(raw) = std::fs::read_to_string(&path) {
                if let Ok(config) = serde_json::from_str::<PersonaConfig>(&raw) {
                    personas.push(config);
                }
            }
        }
    }
    Json(personas)
}

async fn get_persona(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<PersonaConfig>, (StatusCode, Json<ErrorBody>)> {
    let raw = std::fs::read_to_string(config_path(&state, &id))
        .map_err(|_| error_response(StatusCode::NOT_FOUND, "NotFound", format!("persona {id} not found")))?;
    let config: PersonaConfig = serde_json::from_str(&raw)
        .map_err(|e| error_response(StatusCode::INTERNAL_SERVER_ERROR, "ValidationError", e.to_string()))?;
    Ok(Json(config))
}

async fn create_persona(
    State(state): State<AppState>,
    Json(body): Json<PersonaRequest>,
) -> Result<(StatusCode, Json<PersonaConfig>), (StatusCode, Json<ErrorBody>)> {
    let id = body
        .id
        .clone()
        .ok_or_else(|| error_response(StatusCode::BAD_REQUEST, "ValidationError", "id is required"))?;
    if !is_valid_persona_id(&id) {
        return Err(error_response(
            StatusCode::BAD_REQUEST,
            "ValidationError",
            "id must match /^[a-z0-9-]+$/",
        ));
    }
    if config_path(&state, &id).exists() {
        return Err(error_response(
            StatusCode::CONFLICT,
            "Conflict",
            format!("persona {id} already exists"),
        ));
    }

    let config = write_persona(&state, &id, body)
        .map_err(|e| error_response(StatusCode::INTERNAL_SERVER_ERROR, "ValidationError", e.to_string()))?;
    Ok((StatusCode::CREATED, Json(config)))
}

async fn update_persona(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<PersonaRequest>,
) -> Result<Json<PersonaConfig>, (StatusCode, Json<ErrorBody>)> {
    if !is_valid_persona_id(&id) {
        return Err(error_response(
            StatusCode::BAD_REQUEST,
            "ValidationError",
            "id must match /^[a-z0-9-]+$/",
        ));
    }
    if !config_path(&state, &id).exists() {
        return Err(error_response(StatusCode::NOT_FOUND, "NotFound", format!("persona {id} not found")));
    }

    let config = write_persona(&state, &id, body)
        .map_err(|e| error_response(StatusCode::INTERNAL_SERVER_ERROR, "ValidationError", e.to_string()))?;
    Ok(Json(config))
}

async fn delete_persona(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, (StatusCode, Json<ErrorBody>)> {
    let path = config_path(&state, &id);
    if !path.exists() {
        return Err(error_response(StatusCode::NOT_FOUND, "NotFound", format!("persona {id} not found")));
    }
    std::fs::remove_file(&path)
        .map_err(|e| error_response(StatusCode::INTERNAL_SERVER_ERROR, "ValidationError", e.to_string()))?;
    Ok(StatusCode::NO_CONTENT)
}

fn write_persona(state: &AppState, id: &str, body: PersonaRequest) -> anyhow::Result<PersonaConfig> {
    std::fs::create_dir_all(&state.personas_dir)?;
    std::fs::create_dir_all(&state.prompts_dir)?;
    let prompt_file = format!("{id}.txt");
    std::fs::write(state.prompts_dir.join(&prompt_file), &body.prompt_content)?;

    let config = PersonaConfig {
        id: id.to_string(),
        display_name: body.name,
        prompt_file,
        workflows: body.workflows,
        allowed_tools: body.allowed_tools,
        voice_id: body.voice_id,
        metadata: serde_json::Map::new(),
    };
    std::fs::write(config_path(state, id), serde_json::to_string_pretty(&config)?)?;
    Ok(config)
}
