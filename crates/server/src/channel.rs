//! Ordered, reliable message channel between a session and its client.

use std::future::Future;

use anyhow::{Context, Result, bail};
use axum::extract::ws::{self, WebSocket};
use periscope_protocol::{Decoded, Message, decode};
use tracing::{debug, warn};

pub trait MessageChannel: Send + 'static {
    fn send(&mut self, message: &Message) -> impl Future<Output = Result<()>> + Send;

    /// Next decodable message. `Ok(None)` once the peer has closed.
    fn recv(&mut self) -> impl Future<Output = Result<Option<Decoded>>> + Send;

    fn close(&mut self) -> impl Future<Output = Result<()>> + Send;
}

/// Decode one text frame. Malformed frames are logged and skipped.
fn decode_frame(text: &str) -> Option<Decoded> {
    match decode(text) {
        Ok(decoded) => Some(decoded),
        Err(e) => {
            warn!("Dropping malformed message: {e}");
            None
        }
    }
}

/// [`MessageChannel`] over an upgraded axum WebSocket.
pub struct WebSocketChannel {
    socket: WebSocket,
    closed: bool,
}

impl WebSocketChannel {
    pub fn new(socket: WebSocket) -> Self {
        Self {
            socket,
            closed: false,
        }
    }
}

impl MessageChannel for WebSocketChannel {
    async fn send(&mut self, message: &Message) -> Result<()> {
        if self.closed {
            bail!("channel closed");
        }
        let json = serde_json::to_string(message).context("Failed to serialize message")?;
        self.socket
            .send(ws::Message::Text(json.into()))
            .await
            .context("WebSocket send failed")?;
        Ok(())
    }

    async fn recv(&mut self) -> Result<Option<Decoded>> {
        while !self.closed {
            let Some(frame) = self.socket.recv().await else {
                self.closed = true;
                break;
            };
            match frame.context("WebSocket receive failed")? {
                ws::Message::Text(text) => {
                    if let Some(decoded) = decode_frame(text.as_str()) {
                        return Ok(Some(decoded));
                    }
                }
                ws::Message::Close(frame) => {
                    debug!(?frame, "WebSocket closed by peer");
                    self.closed = true;
                }
                ws::Message::Binary(data) => {
                    debug!(len = data.len(), "Ignoring binary WebSocket frame");
                }
                ws::Message::Ping(_) | ws::Message::Pong(_) => {}
            }
        }
        Ok(None)
    }

    async fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.socket
            .send(ws::Message::Close(None))
            .await
            .context("Failed to send WebSocket close")?;
        Ok(())
    }
}
