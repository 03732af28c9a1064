pub mod agents;
pub mod health;
pub mod personas;
pub mod sessions;

use axum::Router;

use crate::state::AppState;

pub fn api_router() -> Router<AppState> {
    Router::new()
        .nest("/agents", agents::router())
        .nest("/personas", personas::router())
        .nest("/sessions", sessions::router())
}
