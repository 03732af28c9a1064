pub mod agent_conn;
pub mod agent_socket;
pub mod agent_state;
pub mod routes;
pub mod state;
pub mod voice_transport;
pub mod ws;

use anyhow::Result;
use axum::routing::get;
use axum::Router;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::agent_state::AgentState;
use crate::state::AppState;

pub fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .merge(routes::health::router())
        .route("/sonic", get(ws::sonic_socket))
        .nest("/api", routes::api_router())
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub async fn serve(state: AppState, addr: &str) -> Result<()> {
    let app = create_router(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("sonic-server listening on {}", addr);
    axum::serve(listener, app).await?;
    Ok(())
}

/// The agent-process router (§6.2): a single `/session` socket, plus the
/// same health route the gateway process exposes.
pub fn create_agent_router(state: AgentState) -> Router {
    Router::new()
        .merge(routes::health::agent_router())
        .route("/session", get(agent_socket::session_socket))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub async fn serve_agent(state: AgentState, addr: &str) -> Result<()> {
    let app = create_agent_router(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("sonic agent process listening on {}", addr);
    axum::serve(listener, app).await?;
    Ok(())
}
