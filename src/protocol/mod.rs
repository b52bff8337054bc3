//! Wire protocol spoken with the voice agent server
//!
//! Every frame is one JSON object tagged by its `type` field.

pub mod codec;
pub mod message;

pub use codec::{decode, decode_audio, encode, encode_audio};
pub use message::WireMessage;

/// Path of the voice agent socket for an agent, relative to the server base URL
pub fn voice_agent_path(agent_id: &str) -> String {
    format!("/ws/voice-agent/{}", agent_id)
}
