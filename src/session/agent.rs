use crate::config::{validate_agent_id, SessionConfig};
use crate::Result;

/// The agent a session talks to and where its socket lives
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentSession {
    pub agent_id: String,
    pub endpoint: String,
}

impl AgentSession {
    pub fn new(config: &SessionConfig, agent_id: impl Into<String>) -> Result<Self> {
        let agent_id = agent_id.into();
        validate_agent_id(&agent_id)?;
        config.validate()?;

        Ok(Self {
            endpoint: config.endpoint(&agent_id),
            agent_id,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_from_config() {
        let session = AgentSession::new(&SessionConfig::default(), "sales").unwrap();
        assert_eq!(session.agent_id, "sales");
        assert_eq!(session.endpoint, "ws://localhost:8000/ws/voice-agent/sales");
    }

    #[test]
    fn test_rejects_bad_agent_id() {
        assert!(AgentSession::new(&SessionConfig::default(), "sales/../x").is_err());
    }
}
