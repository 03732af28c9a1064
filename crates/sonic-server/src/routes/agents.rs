//! Agent Registry HTTP surface (§6.3): `GET /api/agents`, `GET
//! /api/agents/:agentId`, `POST /api/agents/:agentId/status`.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use sonic_schema::registry::{AgentInfo, AgentStatus};

use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(list_agents))
        .route("/{agent_id}", get(get_agent))
        .route("/{agent_id}/status", post(set_agent_status))
}

async fn list_agents(State(state): State<AppState>) -> Json<Vec<AgentInfo>> {
    let registry = state.registry.lock().await;
    Json(registry.list().into_iter().cloned().collect())
}

async fn get_agent(State(state): State<AppState>, Path(agent_id): Path<String>) -> Result<Json<AgentInfo>, StatusCode> {
    let registry = state.registry.lock().await;
    registry.get(&agent_id).cloned().map(Json).ok_or(StatusCode::NOT_FOUND)
}

#[derive(Deserialize)]
struct SetStatusRequest {
    status: AgentStatus,
}

async fn set_agent_status(
    State(state): State<AppState>,
    Path(agent_id): Path<String>,
    Json(body): Json<SetStatusRequest>,
) -> Result<StatusCode, StatusCode> {
    let mut registry = state.registry.lock().await;
    registry.set_status(&agent_id, body.status).map_err(|_| StatusCode::NOT_FOUND)?;
    Ok(StatusCode::OK)
}
