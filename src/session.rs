//! Session identity and the router-owned routing record.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Session identifier newtype.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(pub String);

impl SessionId {
    /// Generates a fresh id using UUIDv4.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for SessionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for SessionId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Router-owned routing record for one live client connection.
///
/// Ownership of "which agent serves this session" transfers atomically on
/// handoff; everything else here is bookkeeping for the circuit breaker and
/// the idle sweep.
#[derive(Debug, Clone)]
pub struct Session {
    pub session_id: SessionId,
    /// Id of the agent currently holding the session's stream.
    pub current_agent_id: String,
    /// Number of completed handoffs. Monotonically non-decreasing.
    pub handoff_count: u32,
    pub created_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
}

impl Session {
    pub fn new(session_id: SessionId, current_agent_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            session_id,
            current_agent_id: current_agent_id.into(),
            handoff_count: 0,
            created_at: now,
            last_activity_at: now,
        }
    }

    /// Stamps activity for the idle sweep.
    pub fn touch(&mut self) {
        self.last_activity_at = Utc::now();
    }

    /// Whether the session has been idle longer than `idle_timeout`.
    pub fn is_idle(&self, idle_timeout: std::time::Duration) -> bool {
        let elapsed = Utc::now().signed_duration_since(self.last_activity_at);
        elapsed.to_std().map(|e| e > idle_timeout).unwrap_or(false)
    }
}
