//! Duplex connection to the voice agent server
//!
//! One [`ConnectionManager`] owns at most one live socket. Inbound frames are
//! decoded and handed out as [`ConnectionEvent`]s; outbound frames are only
//! accepted while connected.

pub mod manager;
pub mod memory;
pub mod reconnect;
pub mod transport;

pub use manager::ConnectionManager;
pub use memory::{MemoryTransport, TransportRecord};
pub use reconnect::{Backoff, ReconnectPolicy};
pub use transport::{FrameSink, FrameStream, Transport, WsTransport};

use crate::protocol::WireMessage;
use crate::AgentVoxError;

/// Lifecycle of the managed socket
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Error,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Error => "error",
        }
    }
}

/// Events emitted by the connection manager, in socket order
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionEvent {
    /// The socket is open and accepts frames
    Opened,

    /// A decoded inbound frame
    Message(WireMessage),

    /// The socket failed to open or broke while open
    Error(AgentVoxError),

    /// The socket is gone; `reconnecting` tells whether a retry is scheduled
    Closed { reconnecting: bool },
}
