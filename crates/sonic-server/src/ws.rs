//! Client ⇄ Gateway WebSocket (§6.1, endpoint `/sonic`). Session admission,
//! intent extraction and handoff interception run here, dialing out to the
//! session's current agent over its `/session` socket (§6.2) via
//! `agent_conn::AgentConnection` and relaying turns in both directions.

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::IntoResponse;
use chrono::Utc;
use sonic_schema::protocol::{AgentToGateway, ClientToGateway, GatewayToAgent, GatewayToClient};

use crate::agent_conn::AgentConnection;
use crate::state::AppState;

/// Client disconnect grace (§3): the session outlives the socket by this
/// long so in-flight agent work can still land before it's torn down.
const DISCONNECT_GRACE_SECONDS: u64 = 60;

pub async fn sonic_socket(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_client_socket(socket, state))
}

async fn handle_client_socket(mut socket: WebSocket, state: AppState) {
    let session_id = uuid::Uuid::new_v4().to_string();

    let session = match state.gateway.admit_session(session_id.clone(), None).await {
        Ok(session) => session,
        Err(err) => {
            let _ = send(&mut socket, &GatewayToClient::Error {
                kind: "AgentUnreachable".into(),
                message: err.to_string(),
            })
            .await;
            return;
        }
    };

    let mut agent_conn = match dial_agent(&state, &session_id, &session.current_agent_id).await {
        Ok(conn) => conn,
        Err(message) => {
            let _ = send(&mut socket, &GatewayToClient::Error {
                kind: "AgentUnreachable".into(),
                message,
            })
            .await;
            return;
        }
    };

    if send(&mut socket, &GatewayToClient::Connected { session_id: session.session_id.clone() })
        .await
        .is_err()
    {
        return;
    }
    if send(&mut socket, &GatewayToClient::SessionStart { session_id: session.session_id.clone() })
        .await
        .is_err()
    {
        return;
    }

    loop {
        tokio::select! {
            from_client = socket.recv() => {
                match from_client {
                    Some(Ok(Message::Text(text))) => {
                        if !state.gateway.check_rate_limit(&session_id).await {
                            continue;
                        }
                        let Ok(incoming) = serde_json::from_str::<ClientToGateway>(&text) else {
                            continue;
                        };
                        if handle_client_message(&mut socket, &agent_conn, &state, &session_id, incoming).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) | Some(Err(_)) => continue,
                }
            }
            from_agent = agent_conn.recv() => {
                match from_agent {
                    Ok(Some(AgentToGateway::HandoffRequest { target_agent_id, target_capability, context, .. })) => {
                        match handle_handoff(&mut socket, &state, &session_id, &agent_conn, target_agent_id, target_capability, context).await {
                            Ok(Some(new_conn)) => agent_conn = new_conn,
                            Ok(None) => {}
                            Err(()) => break,
                        }
                    }
                    Ok(Some(event)) => {
                        if handle_agent_event(&mut socket, &state, &session_id, event).await.is_err() {
                            break;
                        }
                    }
                    Ok(None) => break,
                    Err(err) => {
                        let _ = send(&mut socket, &GatewayToClient::Error {
                            kind: "AgentUnreachable".into(),
                            message: err.to_string(),
                        })
                        .await;
                        break;
                    }
                }
            }
        }
    }

    let sessions = state.sessions.clone();
    tokio::spawn(async move {
        tokio::time::sleep(std::time::Duration::from_secs(DISCONNECT_GRACE_SECONDS)).await;
        sessions.delete(&session_id).await;
    });
}

/// Looks up `agent_id`'s url in the Agent Registry, dials its `/session`
/// socket and sends the initial `session_init` frame (§6.2 step 1-3 of the
/// handoff sequence, also the plain admission path).
async fn dial_agent(state: &AppState, session_id: &str, agent_id: &str) -> Result<AgentConnection, String> {
    let url = {
        let registry = state.registry.lock().await;
        registry.get(agent_id).map(|a| a.url.clone())
    }
    .ok_or_else(|| format!("agent {agent_id} not registered"))?;

    let conn = AgentConnection::connect(&url).await.map_err(|e| e.to_string())?;
    let memory = state.sessions.get_memory(session_id).await.map_err(|e| e.to_string())?;
    conn.send(&GatewayToAgent::SessionInit {
        session_id: session_id.to_string(),
        trace_id: uuid::Uuid::new_v4().to_string(),
        memory,
        timestamp: Utc::now(),
    })
    .await
    .map_err(|e| e.to_string())?;
    Ok(conn)
}

async fn handle_client_message(
    socket: &mut WebSocket,
    agent_conn: &AgentConnection,
    state: &AppState,
    session_id: &str,
    message: ClientToGateway,
) -> Result<(), axum::Error> {
    match message {
        ClientToGateway::TextInput { text } => {
            if state.gateway.apply_user_turn(session_id, &text).await.is_err() {
                return Ok(());
            }
            send(
                socket,
                &GatewayToClient::Transcript {
                    id: uuid::Uuid::new_v4().to_string(),
                    role: "user".to_string(),
                    text: text.clone(),
                    is_final: true,
                    is_streaming: None,
                    stage: None,
                    timestamp: Utc::now(),
                },
            )
            .await?;
            let _ = agent_conn.send(&GatewayToAgent::TextInput { text }).await;
            Ok(())
        }
        ClientToGateway::SelectWorkflow { .. }
        | ClientToGateway::SessionConfig { .. }
        | ClientToGateway::UpdateCredentials { .. }
        | ClientToGateway::ClearChat {} => Ok(()),
    }
}

/// Translates a non-handoff `AgentToGateway` frame into its `GatewayToClient`
/// counterpart and forwards it; `UpdateMemory` has no client-visible frame,
/// it just folds into the Session Store.
async fn handle_agent_event(
    socket: &mut WebSocket,
    state: &AppState,
    session_id: &str,
    event: AgentToGateway,
) -> Result<(), axum::Error> {
    match event {
        AgentToGateway::Connected { .. } | AgentToGateway::SessionAck { .. } => Ok(()),
        AgentToGateway::Transcript { id, role, text, is_final, stage, timestamp } => {
            send(socket, &GatewayToClient::Transcript {
                id,
                role,
                text,
                is_final,
                is_streaming: None,
                stage,
                timestamp,
            })
            .await
        }
        AgentToGateway::ToolUse { tool_name, tool_use_id, input } => {
            send(socket, &GatewayToClient::ToolUse { tool_name, tool_use_id, input }).await
        }
        AgentToGateway::ToolResult { tool_name, tool_use_id, success, result, error_kind } => {
            send(socket, &GatewayToClient::ToolResult {
                tool_name,
                tool_use_id,
                success,
                result,
                error_kind,
            })
            .await
        }
        AgentToGateway::UpdateMemory { memory } => {
            let _ = state.sessions.update_memory(session_id, memory).await;
            Ok(())
        }
        AgentToGateway::DecisionMade { decision_node, chosen_path, target_node, confidence, reasoning, success } => {
            send(socket, &GatewayToClient::DecisionMade {
                decision_node,
                chosen_path,
                target_node,
                confidence,
                reasoning,
                success,
            })
            .await
        }
        AgentToGateway::WorkflowUpdate { current_step, previous_step, node_type, node_label, next_steps } => {
            send(socket, &GatewayToClient::WorkflowUpdate {
                current_step,
                previous_step,
                node_type,
                node_label,
                next_steps,
            })
            .await
        }
        AgentToGateway::Usage { input_tokens, output_tokens } => {
            send(socket, &GatewayToClient::Usage { input_tokens, output_tokens }).await
        }
        AgentToGateway::Error { kind, message } => send(socket, &GatewayToClient::Error { kind, message }).await,
        AgentToGateway::HandoffRequest { .. } => unreachable!("handled by the caller before dispatch"),
    }
}

/// Steps 4-9 of the handoff sequence (§4.9) that `Gateway::begin_handoff`/
/// `complete_handoff` leave to the live connection: dial the target
/// agent's socket, replay memory, swap, tell the old agent to stop.
/// `Ok(None)` means the handoff failed and the caller should keep using
/// the current connection; `Err(())` means the client socket itself died.
async fn handle_handoff(
    socket: &mut WebSocket,
    state: &AppState,
    session_id: &str,
    old_conn: &AgentConnection,
    target_agent_id: Option<String>,
    target_capability: Option<String>,
    context: serde_json::Map<String, serde_json::Value>,
) -> Result<Option<AgentConnection>, ()> {
    let capability = target_capability.or_else(|| target_agent_id.clone()).unwrap_or_default();

    let resolved = match state.gateway.begin_handoff(session_id, &capability).await {
        Ok(agent_id) => agent_id,
        Err(err) => {
            send(socket, &GatewayToClient::Error { kind: "HandoffFailed".into(), message: err.to_string() })
                .await
                .map_err(|_| ())?;
            return Ok(None);
        }
    };

    let url = {
        let registry = state.registry.lock().await;
        registry.get(&resolved).map(|a| a.url.clone())
    };
    let Some(url) = url else {
        state.gateway.cancel_handoff(session_id).await;
        send(socket, &GatewayToClient::Error {
            kind: "HandoffFailed".into(),
            message: format!("agent {resolved} not registered"),
        })
        .await
        .map_err(|_| ())?;
        return Ok(None);
    };

    let new_conn = match AgentConnection::connect(&url).await {
        Ok(conn) => conn,
        Err(err) => {
            state.gateway.cancel_handoff(session_id).await;
            send(socket, &GatewayToClient::Error { kind: "HandoffFailed".into(), message: err.to_string() })
                .await
                .map_err(|_| ())?;
            return Ok(None);
        }
    };

    let context_patch = if context.is_empty() { None } else { Some(context) };
    let session = match state.gateway.complete_handoff(session_id, resolved.clone(), context_patch).await {
        Ok(session) => session,
        Err(err) => {
            send(socket, &GatewayToClient::Error { kind: "HandoffFailed".into(), message: err.to_string() })
                .await
                .map_err(|_| ())?;
            return Ok(None);
        }
    };

    let _ = new_conn
        .send(&GatewayToAgent::SessionInit {
            session_id: session_id.to_string(),
            trace_id: uuid::Uuid::new_v4().to_string(),
            memory: session.memory,
            timestamp: Utc::now(),
        })
        .await;
    let _ = old_conn.send(&GatewayToAgent::Stop {}).await;

    send(socket, &GatewayToClient::HandoffEvent { target: resolved }).await.map_err(|_| ())?;
    Ok(Some(new_conn))
}

async fn send(socket: &mut WebSocket, message: &GatewayToClient) -> Result<(), axum::Error> {
    let text = serde_json::to_string(message).unwrap_or_default();
    socket.send(Message::text(text)).await
}
