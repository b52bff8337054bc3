//! Conversation state and the orchestrator that drives it

pub mod agent;
pub mod orchestrator;
pub mod store;

pub use agent::AgentSession;
pub use orchestrator::{VoiceSession, VoiceSessionBuilder};
pub use store::{ConversationMessage, ConversationStatus, ConversationStore, Role};
