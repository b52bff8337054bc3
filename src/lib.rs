pub mod audio;
pub mod config;
pub mod connection;
pub mod protocol;
pub mod session;

pub use config::SessionConfig;
pub use session::{ConversationStatus, VoiceSession, VoiceSessionBuilder};

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum AgentVoxError {
    #[error("Microphone permission denied: {0}")]
    PermissionError(String),

    #[error("Audio capture unsupported: {0}")]
    UnsupportedError(String),

    #[error("Audio device error: {0}")]
    AudioDeviceError(String),

    #[error("Transport error: {0}")]
    TransportError(String),

    #[error("Decode error: {0}")]
    DecodeError(String),

    #[error("Playback error: {0}")]
    PlaybackError(String),

    #[error("{0}")]
    ProtocolError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Channel error: {0}")]
    ChannelError(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("IO error: {0}")]
    IOError(String),
}

impl From<std::io::Error> for AgentVoxError {
    fn from(e: std::io::Error) -> Self {
        AgentVoxError::IOError(e.to_string())
    }
}

impl AgentVoxError {
    /// Check if this error is recoverable
    pub fn is_recoverable(&self) -> bool {
        match self {
            // Only the user can grant microphone access
            AgentVoxError::PermissionError(_) => false,
            AgentVoxError::UnsupportedError(_) => false,
            AgentVoxError::AudioDeviceError(_) => false,
            // Reconnect policy handles these
            AgentVoxError::TransportError(_) => true,
            // Bad frames are dropped, the session keeps going
            AgentVoxError::DecodeError(_) => true,
            AgentVoxError::PlaybackError(_) => true,
            AgentVoxError::ProtocolError(_) => true,
            AgentVoxError::ConfigError(_) => false,
            AgentVoxError::ChannelError(_) => false,
            AgentVoxError::InvalidState(_) => true,
            AgentVoxError::IOError(_) => false,
        }
    }

    /// Get a user-friendly description
    pub fn user_message(&self) -> String {
        match self {
            AgentVoxError::PermissionError(_) => {
                "Microphone access was denied. Please allow microphone access and try again."
                    .to_string()
            }
            AgentVoxError::UnsupportedError(_) => {
                "Audio capture is not supported on this system.".to_string()
            }
            AgentVoxError::AudioDeviceError(_) => {
                "Audio device error. Please check your microphone/speakers.".to_string()
            }
            AgentVoxError::TransportError(_) => {
                "Connection to the voice server was lost. Reconnecting...".to_string()
            }
            AgentVoxError::DecodeError(_) => {
                "Received a message that could not be understood.".to_string()
            }
            AgentVoxError::PlaybackError(_) => {
                "Audio playback failed. The response is still shown as text.".to_string()
            }
            // Server-reported errors are shown as-is
            AgentVoxError::ProtocolError(message) => message.clone(),
            AgentVoxError::ConfigError(_) => {
                "Configuration error. Please check settings.".to_string()
            }
            AgentVoxError::ChannelError(_) => {
                "Internal communication error. Please restart the application.".to_string()
            }
            AgentVoxError::InvalidState(_) => {
                "That action is not available right now.".to_string()
            }
            AgentVoxError::IOError(_) => "File system error occurred.".to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, AgentVoxError>;
