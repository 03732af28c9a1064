use axum::{routing::get, Json, Router};
use serde_json::{json, Value};

use crate::agent_state::AgentState;
use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new().route("/health", get(health))
}

pub fn agent_router() -> Router<AgentState> {
    Router::new().route("/health", get(health))
}

async fn health() -> Json<Value> {
    Json(json!({ "ok": true }))
}
