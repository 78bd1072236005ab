//! Client-facing protocol and the connection handle the router bridges.
//!
//! The UI owning the transport is out of scope; the router only ever sees a
//! [`ClientConnection`]: a receiver of [`ClientMessage`]s and a sender of
//! [`ServerMessage`]s. Whoever terminates the websocket (or any other
//! transport) holds the matching halves.

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::events::SpeakerRole;
use crate::session::SessionId;

/// Messages a client sends to the router.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// First message on a connection. `select_agent` may name a role to
    /// start with instead of the configured entry role.
    Connect {
        #[serde(skip_serializing_if = "Option::is_none")]
        select_agent: Option<String>,
    },
    AudioChunk {
        #[serde(with = "crate::events::serde_bytes_base64")]
        bytes: Vec<u8>,
    },
    TextInput {
        text: String,
    },
}

/// Messages the router sends back to a client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Connected {
        session_id: SessionId,
        agent_id: String,
    },
    /// `is_final` is always present: partial transcripts (false) update in
    /// place on the client, final ones (true) append. Omitting it silently
    /// breaks client rendering, so it is a plain bool, never an Option.
    Transcript {
        role: SpeakerRole,
        text: String,
        is_final: bool,
    },
    AudioChunk {
        #[serde(with = "crate::events::serde_bytes_base64")]
        bytes: Vec<u8>,
    },
    HandoffNotice {
        from_agent: String,
        to_agent: String,
    },
    Error {
        code: String,
        message: String,
    },
}

impl ServerMessage {
    /// Conversational degraded-mode message for a recoverable failure.
    pub fn degraded(code: &str, message: impl Into<String>) -> Self {
        ServerMessage::Error {
            code: code.to_string(),
            message: message.into(),
        }
    }
}

/// The two channel halves the router bridges for one client.
#[derive(Debug)]
pub struct ClientConnection {
    pub inbound: mpsc::Receiver<ClientMessage>,
    pub outbound: mpsc::Sender<ServerMessage>,
}

/// Handle kept by the transport layer after [`ClientConnection::channel`].
#[derive(Debug)]
pub struct ClientHandle {
    pub to_router: mpsc::Sender<ClientMessage>,
    pub from_router: mpsc::Receiver<ServerMessage>,
}

impl ClientConnection {
    /// Creates a connected pair: the router-side connection and the
    /// transport-side handle.
    pub fn channel(buffer: usize) -> (Self, ClientHandle) {
        let (in_tx, in_rx) = mpsc::channel(buffer);
        let (out_tx, out_rx) = mpsc::channel(buffer);
        (
            Self {
                inbound: in_rx,
                outbound: out_tx,
            },
            ClientHandle {
                to_router: in_tx,
                from_router: out_rx,
            },
        )
    }
}
