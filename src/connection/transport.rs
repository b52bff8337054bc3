//! Socket seam of the connection manager
//!
//! A [`Transport`] opens a socket and hands back its two halves: a
//! [`FrameSink`] owned by the writer task and a [`FrameStream`] owned by the
//! reader task.

use crate::{AgentVoxError, Result};
use async_trait::async_trait;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

/// Opens sockets to a URL
#[async_trait]
pub trait Transport: Send + Sync {
    async fn open(&self, url: &str) -> Result<(Box<dyn FrameSink>, Box<dyn FrameStream>)>;
}

/// Outbound half of an open socket
#[async_trait]
pub trait FrameSink: Send {
    async fn send_frame(&mut self, frame: String) -> Result<()>;

    /// Close the socket; the paired stream ends afterwards
    async fn close(&mut self) -> Result<()>;
}

/// Inbound half of an open socket
#[async_trait]
pub trait FrameStream: Send {
    /// Next text frame, or `None` once the socket is closed
    async fn next_frame(&mut self) -> Option<Result<String>>;
}

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// WebSocket transport over tokio-tungstenite
#[derive(Debug, Clone, Copy, Default)]
pub struct WsTransport;

impl WsTransport {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Transport for WsTransport {
    async fn open(&self, url: &str) -> Result<(Box<dyn FrameSink>, Box<dyn FrameStream>)> {
        let (ws_stream, _) = tokio_tungstenite::connect_async(url)
            .await
            .map_err(|e| AgentVoxError::TransportError(format!("Failed to connect to {}: {}", url, e)))?;

        info!("WebSocket opened: {}", url);
        let (write, read) = ws_stream.split();

        Ok((Box::new(WsFrameSink { write }), Box::new(WsFrameStream { read })))
    }
}

struct WsFrameSink {
    write: SplitSink<WsStream, WsMessage>,
}

#[async_trait]
impl FrameSink for WsFrameSink {
    async fn send_frame(&mut self, frame: String) -> Result<()> {
        self.write
            .send(WsMessage::Text(frame))
            .await
            .map_err(|e| AgentVoxError::TransportError(format!("Failed to send frame: {}", e)))
    }

    async fn close(&mut self) -> Result<()> {
        self.write
            .close()
            .await
            .map_err(|e| AgentVoxError::TransportError(format!("Failed to close socket: {}", e)))
    }
}

struct WsFrameStream {
    read: SplitStream<WsStream>,
}

#[async_trait]
impl FrameStream for WsFrameStream {
    async fn next_frame(&mut self) -> Option<Result<String>> {
        loop {
            match self.read.next().await? {
                Ok(WsMessage::Text(text)) => return Some(Ok(text)),
                Ok(WsMessage::Binary(bytes)) => match String::from_utf8(bytes) {
                    Ok(text) => return Some(Ok(text)),
                    Err(_) => warn!("Ignoring non-UTF-8 binary frame"),
                },
                Ok(WsMessage::Close(frame)) => {
                    debug!("Server closed the socket: {:?}", frame);
                    return None;
                }
                // Ping/pong are answered by tungstenite itself
                Ok(_) => {}
                Err(e) => {
                    return Some(Err(AgentVoxError::TransportError(format!(
                        "Socket read failed: {}",
                        e
                    ))))
                }
            }
        }
    }
}
