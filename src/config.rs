//! Session configuration
//!
//! Everything a voice session needs besides its backends.

use crate::audio::capture::CaptureConfig;
use crate::connection::ReconnectPolicy;
use crate::{AgentVoxError, Result};
use std::time::Duration;

/// Environment variable holding the socket base URL
pub const SERVER_URL_ENV: &str = "AGENTVOX_WS_URL";

pub const DEFAULT_SERVER_URL: &str = "ws://localhost:8000";

#[derive(Clone, Debug, PartialEq)]
pub struct SessionConfig {
    /// Socket base URL, without the agent path
    pub server_url: String,

    /// Reconnect behaviour after the socket closes
    pub reconnect: ReconnectPolicy,

    /// Microphone chunking and metering
    pub capture: CaptureConfig,

    /// How often playback progress is refreshed while playing
    pub progress_interval: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            server_url: DEFAULT_SERVER_URL.to_string(),
            reconnect: ReconnectPolicy::default(),
            capture: CaptureConfig::default(),
            progress_interval: Duration::from_millis(100),
        }
    }
}

impl SessionConfig {
    /// Defaults, with the server URL taken from the environment when set
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(url) = std::env::var(SERVER_URL_ENV) {
            if !url.trim().is_empty() {
                config.server_url = url.trim().to_string();
            }
        }
        config
    }

    pub fn with_server_url(mut self, url: impl Into<String>) -> Self {
        self.server_url = url.into();
        self
    }

    pub fn with_reconnect(mut self, policy: ReconnectPolicy) -> Self {
        self.reconnect = policy;
        self
    }

    pub fn with_chunk_interval(mut self, interval: Duration) -> Self {
        self.capture.chunk_interval = interval;
        self
    }

    pub fn with_level_interval(mut self, interval: Duration) -> Self {
        self.capture.level_interval = interval;
        self
    }

    pub fn with_progress_interval(mut self, interval: Duration) -> Self {
        self.progress_interval = interval;
        self
    }

    pub fn without_reconnect(mut self) -> Self {
        self.reconnect = ReconnectPolicy::disabled();
        self
    }

    /// Full socket URL for an agent
    pub fn endpoint(&self, agent_id: &str) -> String {
        format!(
            "{}{}",
            self.server_url.trim_end_matches('/'),
            crate::protocol::voice_agent_path(agent_id)
        )
    }

    pub fn validate(&self) -> Result<()> {
        if !(self.server_url.starts_with("ws://") || self.server_url.starts_with("wss://")) {
            return Err(AgentVoxError::ConfigError(format!(
                "Server URL must start with ws:// or wss://: {}",
                self.server_url
            )));
        }

        if self.capture.chunk_interval.is_zero() {
            return Err(AgentVoxError::ConfigError(
                "Chunk interval must be greater than 0".into(),
            ));
        }

        if self.capture.level_interval.is_zero() || self.progress_interval.is_zero() {
            return Err(AgentVoxError::ConfigError(
                "Polling intervals must be greater than 0".into(),
            ));
        }

        Ok(())
    }
}

/// Check that an agent id is usable as a path segment
pub fn validate_agent_id(agent_id: &str) -> Result<()> {
    let valid = !agent_id.is_empty()
        && agent_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');

    if valid {
        Ok(())
    } else {
        Err(AgentVoxError::ConfigError(format!(
            "Invalid agent id: {:?}",
            agent_id
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = SessionConfig::default();
        assert_eq!(config.server_url, "ws://localhost:8000");
        assert_eq!(config.capture.chunk_interval, Duration::from_millis(250));
        assert_eq!(config.capture.level_interval, Duration::from_millis(50));
        assert_eq!(config.progress_interval, Duration::from_millis(100));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_endpoint() {
        let config = SessionConfig::default().with_server_url("wss://voice.example.com/");
        assert_eq!(
            config.endpoint("sales"),
            "wss://voice.example.com/ws/voice-agent/sales"
        );
    }

    #[test]
    fn test_config_builder() {
        let config = SessionConfig::default()
            .with_chunk_interval(Duration::from_millis(100))
            .without_reconnect();

        assert_eq!(config.capture.chunk_interval, Duration::from_millis(100));
        assert!(!config.reconnect.enabled);
    }

    #[test]
    fn test_validation() {
        assert!(SessionConfig::default()
            .with_server_url("http://localhost:8000")
            .validate()
            .is_err());
        assert!(SessionConfig::default()
            .with_chunk_interval(Duration::ZERO)
            .validate()
            .is_err());

        assert!(validate_agent_id("sales").is_ok());
        assert!(validate_agent_id("customer_support-2").is_ok());
        assert!(validate_agent_id("").is_err());
        assert!(validate_agent_id("../admin").is_err());
    }
}
