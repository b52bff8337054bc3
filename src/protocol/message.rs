use serde::{Deserialize, Serialize};

/// One protocol frame, keyed by `type`
///
/// Fields that a variant does not carry are simply absent on the wire;
/// `None` means "not applicable", never a zero value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WireMessage {
    /// Server accepted the socket and opened a session
    ConnectionEstablished {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        agent: Option<String>,
    },

    /// Client microphone audio, base64 encoded
    AudioChunk { data: String, is_final: bool },

    /// Client is leaving the session
    EndSession,

    /// What the server heard the user say
    Transcription {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        text: Option<String>,
    },

    /// Text reply generated by the agent
    LlmResponse {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        text: Option<String>,
    },

    /// Synthesized speech, base64 encoded audio/mpeg
    AudioResponse {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        data: Option<String>,
    },

    /// Server-driven conversation status change
    StatusUpdate {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        status: Option<String>,
    },

    /// Server-reported failure
    Error {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },

    /// A well-formed frame whose `type` this client does not know
    #[serde(skip)]
    Unknown { kind: String },
}

impl WireMessage {
    /// Every `type` tag with a dedicated variant
    pub const KNOWN_TYPES: [&'static str; 8] = [
        "connection_established",
        "audio_chunk",
        "end_session",
        "transcription",
        "llm_response",
        "audio_response",
        "status_update",
        "error",
    ];

    /// The `type` tag this message is framed with
    pub fn kind(&self) -> &str {
        match self {
            WireMessage::ConnectionEstablished { .. } => "connection_established",
            WireMessage::AudioChunk { .. } => "audio_chunk",
            WireMessage::EndSession => "end_session",
            WireMessage::Transcription { .. } => "transcription",
            WireMessage::LlmResponse { .. } => "llm_response",
            WireMessage::AudioResponse { .. } => "audio_response",
            WireMessage::StatusUpdate { .. } => "status_update",
            WireMessage::Error { .. } => "error",
            WireMessage::Unknown { kind } => kind,
        }
    }

    pub fn is_known_type(kind: &str) -> bool {
        Self::KNOWN_TYPES.contains(&kind)
    }

    pub fn audio_chunk(data: impl Into<String>, is_final: bool) -> Self {
        WireMessage::AudioChunk {
            data: data.into(),
            is_final,
        }
    }

    pub fn transcription(text: impl Into<String>) -> Self {
        WireMessage::Transcription {
            text: Some(text.into()),
        }
    }

    pub fn llm_response(text: impl Into<String>) -> Self {
        WireMessage::LlmResponse {
            text: Some(text.into()),
        }
    }

    pub fn audio_response(data: impl Into<String>) -> Self {
        WireMessage::AudioResponse {
            data: Some(data.into()),
        }
    }

    pub fn status_update(status: impl Into<String>) -> Self {
        WireMessage::StatusUpdate {
            status: Some(status.into()),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        WireMessage::Error {
            message: Some(message.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_matches_serialized_tag() {
        let messages = [
            WireMessage::ConnectionEstablished {
                session_id: None,
                agent: None,
            },
            WireMessage::audio_chunk("", true),
            WireMessage::EndSession,
            WireMessage::transcription("hi"),
            WireMessage::llm_response("hello"),
            WireMessage::audio_response("AAAA"),
            WireMessage::status_update("processing"),
            WireMessage::error("boom"),
        ];

        for message in messages {
            let value = serde_json::to_value(&message).unwrap();
            assert_eq!(value["type"], message.kind());
            assert!(WireMessage::is_known_type(message.kind()));
        }
    }

    #[test]
    fn test_absent_fields_are_not_serialized() {
        let value = serde_json::to_value(WireMessage::Error { message: None }).unwrap();
        assert_eq!(value, serde_json::json!({ "type": "error" }));
    }

    #[test]
    fn test_unknown_kind_is_not_known() {
        assert!(!WireMessage::is_known_type("ping"));
        let unknown = WireMessage::Unknown {
            kind: "ping".into(),
        };
        assert_eq!(unknown.kind(), "ping");
    }
}
