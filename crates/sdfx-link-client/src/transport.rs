//! Transport seam between the connection lifecycle and the wire.
//!
//! [`Connector`] opens one duplex frame stream; [`Transport`] is that stream.
//! The WebSocket implementation sits on tokio-tungstenite. Tests swap in a
//! scripted connector.

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use sdfx_link_core::protocol::Frame;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, trace};

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Failed to connect to {url}: {reason}")]
    Connect { url: String, reason: String },

    #[error("WebSocket error: {0}")]
    Protocol(String),

    #[error("Transport closed")]
    Closed,
}

/// Opens transports. Shared by every reconnection attempt of a session.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn open(&self, url: &str) -> Result<Box<dyn Transport>, TransportError>;
}

/// One open duplex frame stream.
///
/// `recv` must be cancel-safe: the lifecycle polls it inside `select!`.
#[async_trait]
pub trait Transport: Send {
    async fn send(&mut self, frame: Frame) -> Result<(), TransportError>;

    /// Next inbound frame. `None` once the peer has closed the stream.
    async fn recv(&mut self) -> Option<Result<Frame, TransportError>>;

    /// Close the stream. Errors are ignored; the handle is discarded afterwards.
    async fn close(&mut self);
}

/// Opens WebSocket connections (`ws://` and `wss://`).
#[derive(Debug, Clone, Copy, Default)]
pub struct WsConnector;

#[async_trait]
impl Connector for WsConnector {
    async fn open(&self, url: &str) -> Result<Box<dyn Transport>, TransportError> {
        let (ws, response) = connect_async(url)
            .await
            .map_err(|e| TransportError::Connect {
                url: url.to_string(),
                reason: e.to_string(),
            })?;
        debug!(url, status = %response.status(), "WebSocket handshake complete");
        Ok(Box::new(WsTransport { ws }))
    }
}

pub struct WsTransport {
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl Transport for WsTransport {
    async fn send(&mut self, frame: Frame) -> Result<(), TransportError> {
        let msg = match frame {
            Frame::Text(text) => Message::Text(text.into()),
            Frame::Binary(bytes) => Message::Binary(bytes),
        };
        self.ws
            .send(msg)
            .await
            .map_err(|e| TransportError::Protocol(e.to_string()))
    }

    async fn recv(&mut self) -> Option<Result<Frame, TransportError>> {
        loop {
            let msg = match self.ws.next().await? {
                Ok(msg) => msg,
                Err(e) => return Some(Err(TransportError::Protocol(e.to_string()))),
            };
            match msg {
                Message::Text(text) => return Some(Ok(Frame::Text(text.to_string()))),
                Message::Binary(bytes) => return Some(Ok(Frame::Binary(bytes))),
                Message::Close(frame) => {
                    debug!(?frame, "WebSocket closed by peer");
                    return None;
                }
                // Control frames are answered by tungstenite itself.
                Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => {
                    trace!("Skipping WebSocket control frame");
                }
            }
        }
    }

    async fn close(&mut self) {
        self.ws.close(None).await.ok();
    }
}
