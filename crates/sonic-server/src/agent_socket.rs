//! Agent ⇄ Gateway WebSocket (§6.2, endpoint `/session`). One connection
//! per session: builds a real `AgentSession` (C8) bound to this process's
//! persona, drives its voice model over a `VoiceModelClient` (C7), and
//! relays tool/decision/handoff events back to the gateway as typed
//! `AgentToGateway` frames.

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::IntoResponse;
use chrono::Utc;
use sonic_core::decision::DecisionEvaluator;
use sonic_core::runtime::{AgentSession, ToolCatalogEntry, VoiceClient};
use sonic_core::tool::ToolClient;
use sonic_core::voice::{self, GenerationStage, InboundVoiceEvent, VoiceModelClient};
use sonic_core::workflow_engine::WorkflowEngine;
use sonic_schema::protocol::{AgentToGateway, GatewayToAgent, TranscriptStage};

use crate::agent_state::AgentState;
use crate::voice_transport::WsVoiceTransport;

/// Mirrors `sonic_core::runtime::HANDOFF_TOOL_PREFIX`, which is private to
/// that module; kept in sync by hand since both sides are part of this tree.
const HANDOFF_TOOL_PREFIX: &str = "transfer_to_";

pub async fn session_socket(ws: WebSocketUpgrade, State(state): State<AgentState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_agent_socket(socket, state))
}

async fn handle_agent_socket(mut socket: WebSocket, state: AgentState) {
    let (session_id, memory) = match recv_session_init(&mut socket).await {
        Some(init) => init,
        None => return,
    };

    let Some(graph) = state.bundle.workflows.get(&state.default_workflow_id).cloned() else {
        send_agent(&mut socket, &AgentToGateway::Error {
            kind: "WorkflowMissing".into(),
            message: format!("workflow {} not loaded", state.default_workflow_id),
        })
        .await;
        return;
    };

    let mut session = AgentSession::new(
        session_id.clone(),
        state.bundle.config.clone(),
        state.bundle.prompt_text.clone(),
        WorkflowEngine::new(graph),
        state.mode,
    );
    session.restore_from_memory(&memory);

    let Some(voice_url) = state.voice_url.as_deref() else {
        send_agent(&mut socket, &AgentToGateway::Error {
            kind: "VoiceModelUnconfigured".into(),
            message: "no voice model url configured for this agent".into(),
        })
        .await;
        return;
    };
    let transport = match WsVoiceTransport::connect(voice_url).await {
        Ok(t) => t,
        Err(e) => {
            send_agent(&mut socket, &AgentToGateway::Error {
                kind: "VoiceModelUnreachable".into(),
                message: e.to_string(),
            })
            .await;
            return;
        }
    };
    let voice_client = VoiceModelClient::new(transport.clone());

    let allowed_tools = session.allowed_tools();
    let tool_catalog = tool_catalog_entries(&allowed_tools);
    let handoff_tools: Vec<ToolCatalogEntry> = tool_catalog
        .iter()
        .filter(|t| t.name.starts_with(HANDOFF_TOOL_PREFIX))
        .cloned()
        .collect();

    voice_client
        .configure_session(&session.compose_system_prompt(&handoff_tools), &state.bundle.config.voice_id, &tool_catalog)
        .await;
    voice_client.start_session(&session_id).await;

    send_agent(&mut socket, &AgentToGateway::SessionAck {
        session_id: session_id.clone(),
        agent_id: state.bundle.config.id.clone(),
        s2s: "connected".into(),
        workflow: state.default_workflow_id.clone(),
    })
    .await;

    let tool_client = ToolClient::new(state.tool_base_url.clone());
    let evaluator = DecisionEvaluator::new(&state.providers, state.decision_provider_id.clone(), state.decision_model_id.clone());
    let mut nudges = voice::AutoNudgeTracker::new();

    loop {
        tokio::select! {
            inbound = transport.recv_frame() => {
                match inbound {
                    Ok(Some(event)) => {
                        if handle_inbound_voice_event(
                            event,
                            &mut socket,
                            &mut session,
                            &tool_client,
                            &evaluator,
                            &voice_client,
                            &mut nudges,
                        ).await.is_err() {
                            break;
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        send_agent(&mut socket, &AgentToGateway::Error {
                            kind: "VoiceModelUnreachable".into(),
                            message: e.to_string(),
                        })
                        .await;
                        break;
                    }
                }
            }
            inbound = socket.recv() => {
                match inbound {
                    Some(Ok(Message::Text(text))) => {
                        let Ok(msg) = serde_json::from_str::<GatewayToAgent>(&text) else { continue };
                        if handle_gateway_message(msg, &mut session, &voice_client, &mut socket).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) | Some(Err(_)) => continue,
                }
            }
        }
    }

    voice_client.stop_session().await;
}

async fn recv_session_init(socket: &mut WebSocket) -> Option<(String, sonic_schema::session::SessionMemory)> {
    let Some(Ok(Message::Text(text))) = socket.recv().await else {
        return None;
    };
    match serde_json::from_str::<GatewayToAgent>(&text) {
        Ok(GatewayToAgent::SessionInit { session_id, memory, .. }) => Some((session_id, memory)),
        _ => {
            send_agent(socket, &AgentToGateway::Error {
                kind: "ProtocolError".into(),
                message: "first frame must be session_init".into(),
            })
            .await;
            None
        }
    }
}

async fn handle_gateway_message(
    message: GatewayToAgent,
    session: &mut AgentSession,
    voice_client: &VoiceModelClient,
    socket: &mut WebSocket,
) -> Result<(), axum::Error> {
    match message {
        GatewayToAgent::SessionInit { .. } => Ok(()),
        GatewayToAgent::TextInput { text } | GatewayToAgent::UserInput { text } => {
            session.begin_user_turn(text.clone());
            if session.should_echo_user_text() {
                send_agent(socket, &AgentToGateway::Transcript {
                    id: uuid::Uuid::new_v4().to_string(),
                    role: "user".into(),
                    text: text.clone(),
                    is_final: true,
                    stage: None,
                    timestamp: Utc::now(),
                })
                .await;
            }
            voice_client.send_user_text(&text).await;
            Ok(())
        }
        GatewayToAgent::MemoryUpdate { memory, .. } => {
            session.restore_from_memory(&memory);
            Ok(())
        }
        GatewayToAgent::Stop {} => {
            voice_client.stop_session().await;
            Err(axum::Error::new(std::io::Error::new(std::io::ErrorKind::Other, "stop requested")))
        }
    }
}

async fn handle_inbound_voice_event(
    event: InboundVoiceEvent,
    socket: &mut WebSocket,
    session: &mut AgentSession,
    tool_client: &ToolClient,
    evaluator: &DecisionEvaluator<'_>,
    voice_client: &VoiceModelClient,
    nudges: &mut voice::AutoNudgeTracker,
) -> Result<(), axum::Error> {
    match event {
        InboundVoiceEvent::Audio { .. } => Ok(()),
        InboundVoiceEvent::Transcript { role, text, is_final, turn_id, stage } => {
            if role == "assistant" && is_final {
                nudges.on_assistant_text(&text);
                if let Some((node_id, remainder)) = sonic_core::runtime::extract_step_tag(&text) {
                    if let Some(result) = session.handle_step_tag(&node_id, evaluator).await {
                        voice_client.send_system_text(&result.system_injection).await;
                        send_agent(socket, &result.gateway_event).await;
                    }
                    session.push_assistant_transcript(&remainder);
                } else {
                    session.push_assistant_transcript(&text);
                }
            }
            let cleaned = sonic_core::runtime::strip_control_tags(&text);
            if cleaned.is_empty() {
                return Ok(());
            }
            send_agent(socket, &AgentToGateway::Transcript {
                id: turn_id,
                role,
                text: cleaned,
                is_final,
                stage: Some(map_stage(stage)),
                timestamp: Utc::now(),
            })
            .await;
            Ok(())
        }
        InboundVoiceEvent::ToolUse { tool_use_id, tool_name, input } => {
            nudges.on_tool_called();
            send_agent(socket, &AgentToGateway::ToolUse {
                tool_name: tool_name.clone(),
                tool_use_id: tool_use_id.clone(),
                input: input.clone(),
            })
            .await;
            let outcome = session.handle_tool_use(tool_client, tool_use_id, tool_name, input).await;
            for reply in outcome.replies {
                voice_client.send_tool_result(&reply.tool_use_id, &reply.result, reply.success).await;
            }
            if let Some(event) = outcome.gateway_event {
                send_agent(socket, &event).await;
            }
            Ok(())
        }
        InboundVoiceEvent::ContentStart { .. } => Ok(()),
        InboundVoiceEvent::ContentEnd { role, .. } => {
            if role == "assistant" {
                if let Some(nudge) = nudges.on_turn_end() {
                    voice_client.send_system_text(nudge).await;
                }
            }
            Ok(())
        }
        InboundVoiceEvent::InteractionTurnEnd | InboundVoiceEvent::Interruption => Ok(()),
        InboundVoiceEvent::Usage { input_tokens, output_tokens } => {
            send_agent(socket, &AgentToGateway::Usage { input_tokens, output_tokens }).await;
            Ok(())
        }
        InboundVoiceEvent::Error { kind, message } => {
            send_agent(socket, &AgentToGateway::Error { kind, message }).await;
            Ok(())
        }
    }
}

fn map_stage(stage: GenerationStage) -> TranscriptStage {
    match stage {
        GenerationStage::Speculative => TranscriptStage::Speculative,
        GenerationStage::Final => TranscriptStage::Final,
    }
}

fn tool_catalog_entries(names: &[String]) -> Vec<ToolCatalogEntry> {
    names
        .iter()
        .map(|name| ToolCatalogEntry {
            name: name.clone(),
            description: format!("Invoke the {name} tool."),
            input_schema: serde_json::json!({"type": "object"}),
        })
        .collect()
}

async fn send_agent(socket: &mut WebSocket, message: &AgentToGateway) {
    let text = serde_json::to_string(message).unwrap_or_default();
    let _ = socket.send(Message::text(text)).await;
}
