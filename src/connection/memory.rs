//! In-memory transport
//!
//! Plays the server side of every socket it opens, so a full session can run
//! without a network. Every open, sent frame and client close is appended to a
//! shared log that records the exact order of socket operations.

use super::transport::{FrameSink, FrameStream, Transport};
use crate::protocol::{self, WireMessage};
use crate::{AgentVoxError, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;

/// One socket operation, as observed by the server side
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportRecord {
    Opened { socket: usize, url: String },
    Sent { socket: usize, frame: String },
    Closed { socket: usize },
}

#[derive(Default)]
struct SocketEntry {
    inbound: Option<mpsc::UnboundedSender<Result<String>>>,
    open: bool,
}

#[derive(Default)]
struct MemoryShared {
    sockets: Vec<SocketEntry>,
    log: Vec<TransportRecord>,
    refuse_opens: usize,
    attempts: usize,
}

#[derive(Clone, Default)]
pub struct MemoryTransport {
    shared: Arc<Mutex<MemoryShared>>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` open attempts fail
    pub fn refuse_next_opens(&self, count: usize) {
        self.shared.lock().refuse_opens = count;
    }

    /// Open attempts so far, refused ones included
    pub fn open_attempts(&self) -> usize {
        self.shared.lock().attempts
    }

    /// Sockets successfully opened so far
    pub fn opened_count(&self) -> usize {
        self.shared.lock().sockets.len()
    }

    /// Indices of sockets that are still open
    pub fn open_sockets(&self) -> Vec<usize> {
        self.shared
            .lock()
            .sockets
            .iter()
            .enumerate()
            .filter(|(_, entry)| entry.open)
            .map(|(index, _)| index)
            .collect()
    }

    /// Index of the most recently opened socket
    pub fn latest_socket(&self) -> Option<usize> {
        self.shared.lock().sockets.len().checked_sub(1)
    }

    pub fn log(&self) -> Vec<TransportRecord> {
        self.shared.lock().log.clone()
    }

    /// Frames the client sent on `socket`, decoded
    pub fn sent_messages(&self, socket: usize) -> Vec<WireMessage> {
        self.shared
            .lock()
            .log
            .iter()
            .filter_map(|record| match record {
                TransportRecord::Sent { socket: s, frame } if *s == socket => {
                    protocol::decode(frame).ok()
                }
                _ => None,
            })
            .collect()
    }

    /// Deliver a raw text frame to the client on `socket`
    pub fn push_frame(&self, socket: usize, frame: impl Into<String>) -> bool {
        let shared = self.shared.lock();
        match shared.sockets.get(socket).and_then(|entry| entry.inbound.as_ref()) {
            Some(inbound) => inbound.send(Ok(frame.into())).is_ok(),
            None => false,
        }
    }

    /// Deliver an encoded message to the client on `socket`
    pub fn push_message(&self, socket: usize, message: &WireMessage) -> bool {
        match protocol::encode(message) {
            Ok(frame) => self.push_frame(socket, frame),
            Err(_) => false,
        }
    }

    /// Break `socket` with a read error, then close it
    pub fn fail_socket(&self, socket: usize, reason: &str) {
        let mut shared = self.shared.lock();
        if let Some(entry) = shared.sockets.get_mut(socket) {
            if let Some(inbound) = entry.inbound.take() {
                let _ = inbound.send(Err(AgentVoxError::TransportError(reason.to_string())));
            }
            entry.open = false;
        }
    }

    /// Close `socket` from the server side
    pub fn drop_socket(&self, socket: usize) {
        let mut shared = self.shared.lock();
        if let Some(entry) = shared.sockets.get_mut(socket) {
            entry.inbound = None;
            entry.open = false;
        }
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn open(&self, url: &str) -> Result<(Box<dyn FrameSink>, Box<dyn FrameStream>)> {
        let mut shared = self.shared.lock();
        shared.attempts += 1;

        if shared.refuse_opens > 0 {
            shared.refuse_opens -= 1;
            return Err(AgentVoxError::TransportError(format!(
                "Connection refused: {}",
                url
            )));
        }

        let socket = shared.sockets.len();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        shared.sockets.push(SocketEntry {
            inbound: Some(inbound_tx),
            open: true,
        });
        shared.log.push(TransportRecord::Opened {
            socket,
            url: url.to_string(),
        });
        debug!("Memory socket {} opened", socket);

        let sink = MemoryFrameSink {
            socket,
            shared: Arc::clone(&self.shared),
        };
        let stream = MemoryFrameStream { inbound: inbound_rx };

        Ok((Box::new(sink), Box::new(stream)))
    }
}

struct MemoryFrameSink {
    socket: usize,
    shared: Arc<Mutex<MemoryShared>>,
}

#[async_trait]
impl FrameSink for MemoryFrameSink {
    async fn send_frame(&mut self, frame: String) -> Result<()> {
        let mut shared = self.shared.lock();
        let open = shared
            .sockets
            .get(self.socket)
            .map(|entry| entry.open)
            .unwrap_or(false);

        if !open {
            return Err(AgentVoxError::TransportError("Socket is closed".into()));
        }

        shared.log.push(TransportRecord::Sent {
            socket: self.socket,
            frame,
        });
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        let mut shared = self.shared.lock();
        if let Some(entry) = shared.sockets.get_mut(self.socket) {
            entry.inbound = None;
            entry.open = false;
        }
        shared.log.push(TransportRecord::Closed {
            socket: self.socket,
        });
        Ok(())
    }
}

struct MemoryFrameStream {
    inbound: mpsc::UnboundedReceiver<Result<String>>,
}

#[async_trait]
impl FrameStream for MemoryFrameStream {
    async fn next_frame(&mut self) -> Option<Result<String>> {
        self.inbound.recv().await
    }
}
