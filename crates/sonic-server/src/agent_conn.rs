//! Gateway ⇄ Agent WebSocket client (§6.2): the gateway's side of the dial
//! out to a running agent process's `/session` endpoint. Mirrors
//! `voice_transport::WsVoiceTransport`'s split-socket shape one level up
//! the protocol stack, one connection per session per current agent.

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use sonic_gateway::filter::is_raw_voice_event;
use sonic_schema::protocol::{AgentToGateway, GatewayToAgent};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

#[derive(Debug, Error)]
pub enum AgentConnectionError {
    #[error("agent connect failed: {0}")]
    Connect(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("agent socket closed by peer (code {0})")]
    Closed(u16),
    #[error("agent frame was not valid json: {0}")]
    Malformed(#[from] serde_json::Error),
}

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type Result<T> = std::result::Result<T, AgentConnectionError>;

/// One live connection to an agent process's `/session` socket.
pub struct AgentConnection {
    writer: Mutex<SplitSink<WsStream, Message>>,
    reader: Mutex<SplitStream<WsStream>>,
}

impl AgentConnection {
    pub async fn connect(agent_url: &str) -> Result<Self> {
        let url = format!("{}/session", agent_url.trim_end_matches('/'));
        let (stream, _) = tokio_tungstenite::connect_async(url).await?;
        let (writer, reader) = stream.split();
        Ok(Self {
            writer: Mutex::new(writer),
            reader: Mutex::new(reader),
        })
    }

    pub async fn send(&self, message: &GatewayToAgent) -> Result<()> {
        let text = serde_json::to_string(message)?;
        self.writer.lock().await.send(Message::text(text)).await?;
        Ok(())
    }

    /// Skips past raw voice-model events an agent forwarded by mistake
    /// instead of handling; those never belong on this wire (§6.2 only
    /// carries `AgentToGateway` frames), so they're dropped here rather
    /// than left for the client socket to reject.
    pub async fn recv(&self) -> Result<Option<AgentToGateway>> {
        let mut reader = self.reader.lock().await;
        loop {
            match reader.next().await {
                Some(Ok(Message::Text(text))) => {
                    let raw: serde_json::Value = serde_json::from_str(&text)?;
                    let type_field = raw.get("type").and_then(|v| v.as_str()).unwrap_or("");
                    if is_raw_voice_event(type_field) {
                        continue;
                    }
                    return Ok(Some(serde_json::from_value(raw)?));
                }
                Some(Ok(Message::Close(frame))) => {
                    let code = frame.map(|f| u16::from(f.code)).unwrap_or(1000);
                    return Err(AgentConnectionError::Closed(code));
                }
                Some(Ok(_)) => continue,
                Some(Err(e)) => return Err(AgentConnectionError::Connect(e)),
                None => return Ok(None),
            }
        }
    }
}
