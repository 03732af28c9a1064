//! Session memory/transfer HTTP surface (§6.3). `X-Agent-Id` is required
//! on the memory patch endpoint so only the session's current agent (or a
//! gateway acting on its behalf) can write memory.

use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sonic_schema::session::SessionMemory;

use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/{session_id}/memory", get(get_memory).post(patch_memory))
        .route("/{session_id}/transfer", post(transfer_session))
}

async fn get_memory(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Result<Json<SessionMemory>, StatusCode> {
    state
        .sessions
        .get_memory(&session_id)
        .await
        .map(Json)
        .map_err(|_| StatusCode::NOT_FOUND)
}

#[derive(Deserialize)]
struct MemoryPatchRequest {
    memory: Map<String, Value>,
}

async fn patch_memory(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    headers: HeaderMap,
    Json(body): Json<MemoryPatchRequest>,
) -> Result<Json<SessionMemory>, StatusCode> {
    if !headers.contains_key("x-agent-id") {
        return Err(StatusCode::BAD_REQUEST);
    }
    state
        .sessions
        .update_memory(&session_id, body.memory)
        .await
        .map(Json)
        .map_err(|_| StatusCode::NOT_FOUND)
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct TransferRequest {
    to_agent_id: String,
    #[serde(default)]
    context: Option<Map<String, Value>>,
}

#[derive(Serialize)]
struct TransferResponse {
    session_id: String,
    current_agent_id: String,
}

async fn transfer_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    Json(body): Json<TransferRequest>,
) -> Result<Json<TransferResponse>, StatusCode> {
    let session = state
        .gateway
        .transfer_session(&session_id, body.to_agent_id, body.context)
        .await
        .map_err(|e| match e {
            sonic_gateway::HandoffRequestError::SessionStore(_) => StatusCode::NOT_FOUND,
            sonic_gateway::HandoffRequestError::AgentUnreachable(_) => StatusCode::SERVICE_UNAVAILABLE,
            sonic_gateway::HandoffRequestError::MultipleHandoffBlocked(_) => StatusCode::CONFLICT,
        })?;
    Ok(Json(TransferResponse {
        session_id: session.session_id,
        current_agent_id: session.current_agent_id,
    }))
}
