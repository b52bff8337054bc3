use crate::AgentVoxError;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::watch;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Agent,
}

/// One line of the conversation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationMessage {
    pub id: Uuid,
    pub role: Role,
    pub text: String,
    pub timestamp: DateTime<Utc>,
}

impl ConversationMessage {
    pub fn new(role: Role, text: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            role,
            text: text.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self::new(Role::User, text)
    }

    pub fn agent(text: impl Into<String>) -> Self {
        Self::new(Role::Agent, text)
    }
}

/// Where the conversation is, as shown to the user
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConversationStatus {
    #[default]
    Idle,
    Connecting,
    Connected,
    Recording,
    Processing,
    Responding,
    Error,
    Disconnected,
}

impl ConversationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConversationStatus::Idle => "idle",
            ConversationStatus::Connecting => "connecting",
            ConversationStatus::Connected => "connected",
            ConversationStatus::Recording => "recording",
            ConversationStatus::Processing => "processing",
            ConversationStatus::Responding => "responding",
            ConversationStatus::Error => "error",
            ConversationStatus::Disconnected => "disconnected",
        }
    }
}

impl fmt::Display for ConversationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConversationStatus {
    type Err = AgentVoxError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "idle" => Ok(ConversationStatus::Idle),
            "connecting" => Ok(ConversationStatus::Connecting),
            "connected" => Ok(ConversationStatus::Connected),
            "recording" => Ok(ConversationStatus::Recording),
            "processing" => Ok(ConversationStatus::Processing),
            "responding" => Ok(ConversationStatus::Responding),
            "error" => Ok(ConversationStatus::Error),
            "disconnected" => Ok(ConversationStatus::Disconnected),
            other => Err(AgentVoxError::DecodeError(format!(
                "Unknown conversation status: {}",
                other
            ))),
        }
    }
}

#[derive(Default)]
struct StoreState {
    messages: Vec<ConversationMessage>,
    error: Option<AgentVoxError>,
    is_connected: bool,
    session_id: Option<String>,
    agent_name: Option<String>,
}

/// Observable conversation state
///
/// Readers may hold any number of clones; only the session orchestrator
/// mutates it.
#[derive(Clone)]
pub struct ConversationStore {
    state: Arc<RwLock<StoreState>>,
    status: Arc<watch::Sender<ConversationStatus>>,
}

impl ConversationStore {
    pub fn new() -> Self {
        let (status, _) = watch::channel(ConversationStatus::Idle);
        Self {
            state: Arc::new(RwLock::new(StoreState::default())),
            status: Arc::new(status),
        }
    }

    pub fn messages(&self) -> Vec<ConversationMessage> {
        self.state.read().messages.clone()
    }

    pub fn len(&self) -> usize {
        self.state.read().messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.read().messages.is_empty()
    }

    pub fn status(&self) -> ConversationStatus {
        *self.status.borrow()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<ConversationStatus> {
        self.status.subscribe()
    }

    pub fn error(&self) -> Option<AgentVoxError> {
        self.state.read().error.clone()
    }

    pub fn is_connected(&self) -> bool {
        self.state.read().is_connected
    }

    pub fn session_id(&self) -> Option<String> {
        self.state.read().session_id.clone()
    }

    pub fn agent_name(&self) -> Option<String> {
        self.state.read().agent_name.clone()
    }

    pub(crate) fn add_message(&self, message: ConversationMessage) {
        self.state.write().messages.push(message);
    }

    pub(crate) fn set_status(&self, status: ConversationStatus) {
        self.status.send_replace(status);
    }

    pub(crate) fn set_error(&self, error: AgentVoxError) {
        self.state.write().error = Some(error);
    }

    pub(crate) fn set_connected(&self, connected: bool) {
        self.state.write().is_connected = connected;
    }

    pub(crate) fn set_session_info(&self, session_id: Option<String>, agent_name: Option<String>) {
        let mut state = self.state.write();
        state.session_id = session_id;
        state.agent_name = agent_name;
    }

    /// Forget the previous session's history, error and server info
    pub(crate) fn begin_session(&self) {
        let mut state = self.state.write();
        state.messages.clear();
        state.error = None;
        state.session_id = None;
        state.agent_name = None;
    }
}

impl Default for ConversationStore {
    fn default() -> Self {
        Self::new()
    }
}
