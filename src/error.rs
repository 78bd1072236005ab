//! Error types for the switchboard.

use thiserror::Error;

use crate::session::SessionId;

/// Result type alias used throughout the crate.
pub type Result<T> = std::result::Result<T, SwitchboardError>;

/// Main error type for the switchboard.
#[derive(Debug, Error)]
pub enum SwitchboardError {
    /// No healthy entry agent is available; a connection attempt cannot be
    /// served at all.
    #[error("no healthy entry agent available")]
    NoEntryAgent,

    /// The target role of a handoff has no healthy agent. Recoverable: the
    /// session stays on its current agent.
    #[error("no healthy agent for role '{role}'")]
    NoHealthyAgent { role: String },

    /// The per-session handoff ceiling was reached. Terminal for the
    /// conversation thread; the current agent must conclude gracefully.
    #[error("handoff ceiling reached for session {session_id} (count: {count})")]
    CircuitOpen { session_id: SessionId, count: u32 },

    /// A handoff request failed validation (unknown session, or the
    /// requester no longer owns the session).
    #[error("handoff rejected: {reason}")]
    HandoffRejected { reason: String },

    /// The session is not known to the router.
    #[error("session not found: {session_id}")]
    SessionNotFound { session_id: SessionId },

    /// An operation was attempted on an adapter stream after `stop()`.
    #[error("stream already closed")]
    StreamClosed,

    /// Tool execution error, surfaced to the stream as a failed tool result.
    #[error("tool execution error: {message}")]
    ToolExecution { message: String },

    /// Serialization/deserialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Database error from the session store.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Other errors.
    #[error("{0}")]
    Other(String),
}

impl SwitchboardError {
    /// Whether the error leaves the session usable on its current agent.
    ///
    /// Recoverable errors are surfaced to the user as a conversational
    /// message; terminal ones tear the conversation thread down.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            SwitchboardError::NoHealthyAgent { .. } | SwitchboardError::ToolExecution { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = SwitchboardError::NoHealthyAgent {
            role: "banking".to_string(),
        };
        assert_eq!(err.to_string(), "no healthy agent for role 'banking'");

        let err = SwitchboardError::CircuitOpen {
            session_id: SessionId::from("s-1"),
            count: 3,
        };
        assert_eq!(
            err.to_string(),
            "handoff ceiling reached for session s-1 (count: 3)"
        );
    }

    #[test]
    fn test_recoverability() {
        assert!(SwitchboardError::NoHealthyAgent {
            role: "x".to_string()
        }
        .is_recoverable());
        assert!(!SwitchboardError::NoEntryAgent.is_recoverable());
        assert!(!SwitchboardError::CircuitOpen {
            session_id: SessionId::from("s"),
            count: 4
        }
        .is_recoverable());
    }

    #[test]
    fn test_error_from_serde() {
        let serde_err = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        let err: SwitchboardError = serde_err.into();
        assert!(matches!(err, SwitchboardError::Serialization(_)));
    }
}
