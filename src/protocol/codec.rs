//! Frame encoding and decoding
//!
//! Frames are self-contained: there is no reassembly across frames.

use super::message::WireMessage;
use crate::{AgentVoxError, Result};
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine;
use serde_json::Value;

/// Encode a message into one text frame
pub fn encode(message: &WireMessage) -> Result<String> {
    if let WireMessage::Unknown { kind } = message {
        return Ok(serde_json::json!({ "type": kind }).to_string());
    }

    serde_json::to_string(message)
        .map_err(|e| AgentVoxError::DecodeError(format!("Failed to encode {}: {}", message.kind(), e)))
}

/// Decode one text frame
///
/// A frame with an unrecognized `type` decodes to [`WireMessage::Unknown`];
/// only broken framing is an error.
pub fn decode(frame: &str) -> Result<WireMessage> {
    let value: Value = serde_json::from_str(frame)
        .map_err(|e| AgentVoxError::DecodeError(format!("Frame is not valid JSON: {}", e)))?;

    let kind = match value.get("type") {
        Some(Value::String(kind)) => kind.clone(),
        Some(_) => {
            return Err(AgentVoxError::DecodeError(
                "Frame `type` is not a string".into(),
            ))
        }
        None if value.is_object() => {
            return Err(AgentVoxError::DecodeError("Frame has no `type`".into()))
        }
        None => {
            return Err(AgentVoxError::DecodeError(
                "Frame is not a JSON object".into(),
            ))
        }
    };

    if !WireMessage::is_known_type(&kind) {
        return Ok(WireMessage::Unknown { kind });
    }

    serde_json::from_value(value)
        .map_err(|e| AgentVoxError::DecodeError(format!("Malformed {} frame: {}", kind, e)))
}

/// Base64 encode raw audio for an `audio_chunk` frame
pub fn encode_audio(bytes: &[u8]) -> String {
    BASE64_STANDARD.encode(bytes)
}

/// Decode the base64 audio payload of an `audio_response` frame
pub fn decode_audio(data: &str) -> Result<Vec<u8>> {
    BASE64_STANDARD
        .decode(data.trim())
        .map_err(|e| AgentVoxError::DecodeError(format!("Invalid base64 audio: {}", e)))
}
