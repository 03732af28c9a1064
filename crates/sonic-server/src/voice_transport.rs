//! JSON-over-WebSocket `VoiceTransport` (C7 seam): dials out to a speech
//! model endpoint and frames `OutboundVoiceEvent`/`InboundVoiceEvent` as
//! tagged JSON text messages rather than any vendor-specific event-stream
//! encoding.

use std::sync::Arc;

use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use sonic_core::voice::{InboundVoiceEvent, OutboundVoiceEvent, VoiceTransport};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

#[derive(Debug, Error)]
pub enum VoiceTransportError {
    #[error("voice transport connect failed: {0}")]
    Connect(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("voice transport closed by peer (code {0})")]
    Closed(u16),
    #[error("voice frame was not valid json: {0}")]
    Malformed(#[from] serde_json::Error),
}

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// One live connection to a voice model endpoint. `send_frame`/`recv_frame`
/// implement the `VoiceTransport` seam `VoiceModelClient` (C7) depends on.
pub struct WsVoiceTransport {
    writer: Mutex<SplitSink<WsStream, Message>>,
    reader: Mutex<SplitStream<WsStream>>,
}

impl WsVoiceTransport {
    pub async fn connect(url: &str) -> Result<Arc<Self>, VoiceTransportError> {
        let (stream, _) = tokio_tungstenite::connect_async(url).await?;
        let (writer, reader) = stream.split();
        Ok(Arc::new(Self {
            writer: Mutex::new(writer),
            reader: Mutex::new(reader),
        }))
    }
}

#[async_trait]
impl VoiceTransport for WsVoiceTransport {
    async fn send_frame(&self, event: &OutboundVoiceEvent) -> anyhow::Result<()> {
        let text = serde_json::to_string(event)?;
        self.writer.lock().await.send(Message::text(text)).await?;
        Ok(())
    }

    async fn recv_frame(&self) -> anyhow::Result<Option<InboundVoiceEvent>> {
        let mut reader = self.reader.lock().await;
        loop {
            match reader.next().await {
                Some(Ok(Message::Text(text))) => {
                    return Ok(Some(serde_json::from_str(&text).map_err(VoiceTransportError::from)?));
                }
                Some(Ok(Message::Close(frame))) => {
                    let code = frame.map(|f| u16::from(f.code)).unwrap_or(1000);
                    return Err(VoiceTransportError::Closed(code).into());
                }
                Some(Ok(_)) => continue,
                Some(Err(e)) => return Err(VoiceTransportError::Connect(e).into()),
                None => return Ok(None),
            }
        }
    }
}
