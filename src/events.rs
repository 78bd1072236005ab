//! Typed events exchanged with the streaming inference service.
//!
//! The inference service itself is an external collaborator; the core only
//! ever sees it as a bidirectional stream of these events. Inbound events
//! arrive on the adapter's receive half, outbound frames go through
//! [`crate::adapter::SessionAdapter`].

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Speaker attribution on transcript events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SpeakerRole {
    User,
    Assistant,
}

/// Events produced by the inference service on one session stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    /// An in-progress transcript fragment; replaces the previous partial.
    PartialTranscript { text: String },
    /// A completed utterance.
    FinalTranscript { text: String, role: SpeakerRole },
    /// The service wants a tool executed. Exactly one `ToolResult` frame
    /// must answer each of these before the stream continues for the turn.
    ToolUseRequested {
        id: String,
        name: String,
        params: Value,
    },
    /// The service closed the stream normally.
    StreamEnded,
    /// The service closed the stream with an error.
    StreamError { message: String },
}

/// Frames the core sends into a session stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamInput {
    Audio {
        #[serde(with = "serde_bytes_base64")]
        bytes: Vec<u8>,
    },
    Text {
        text: String,
    },
    /// Answer to a `ToolUseRequested` event, real or synthetic.
    ToolResult {
        id: String,
        payload: Value,
    },
}

/// Initial configuration sent when a session stream opens.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamConfig {
    pub system_instructions: String,
    pub voice_profile: String,
}

/// Synthetic tool-result payload for a suppressed duplicate call.
///
/// Fed back into the stream in place of re-execution; a control signal,
/// not a user-visible error.
pub fn blocked_duplicate_payload() -> Value {
    serde_json::json!({
        "blocked": true,
        "reason": "duplicate_call",
        "awaiting_new_input": true,
    })
}

/// Tool-result payload for a failed execution.
pub fn failed_tool_payload(message: &str) -> Value {
    serde_json::json!({
        "success": false,
        "error": message,
    })
}

pub(crate) mod serde_bytes_base64 {
    //! Audio payloads serialize as base64 strings on the wire.

    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        STANDARD.decode(s).map_err(serde::de::Error::custom)
    }
}
