//! Handoff protocol types.
//!
//! A handoff transfers a session's active-agent assignment from one role to
//! another, carrying context over. The execution core produces a
//! [`HandoffRequest`] when the inference service calls a tool in the
//! `transfer_to_<role>` namespace (or when the verification ceiling forces
//! one); the router consumes it exactly once and discards it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::memory::MemoryPatch;
use crate::session::SessionId;

/// Request to move a session to an agent of another role.
#[derive(Debug, Clone)]
pub struct HandoffRequest {
    pub session_id: SessionId,
    /// Agent id of the executor emitting the request. The router rejects
    /// requests from an agent that no longer owns the session.
    pub requested_by: String,
    pub target_role: String,
    pub reason: Option<String>,
    /// Field-level memory delta merged into the session store before the
    /// target agent is started.
    pub context_snapshot: MemoryPatch,
    /// Set when the handoff was synthesized after the verification-attempt
    /// ceiling, so the target agent knows verification did not succeed.
    pub failed: bool,
}

impl HandoffRequest {
    pub fn new(
        session_id: SessionId,
        requested_by: impl Into<String>,
        target_role: impl Into<String>,
    ) -> Self {
        Self {
            session_id,
            requested_by: requested_by.into(),
            target_role: target_role.into(),
            reason: None,
            context_snapshot: MemoryPatch::default(),
            failed: false,
        }
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    pub fn with_snapshot(mut self, snapshot: MemoryPatch) -> Self {
        self.context_snapshot = snapshot;
        self
    }

    pub fn failed(mut self) -> Self {
        self.failed = true;
        self
    }
}

/// Completed-handoff breadcrumb appended to the session memory's history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HandoffRecord {
    pub from_agent: String,
    pub to_agent: String,
    pub reason: Option<String>,
    pub failed: bool,
    pub at: DateTime<Utc>,
}

impl HandoffRecord {
    pub fn new(from_agent: impl Into<String>, to_agent: impl Into<String>) -> Self {
        Self {
            from_agent: from_agent.into(),
            to_agent: to_agent.into(),
            reason: None,
            failed: false,
            at: Utc::now(),
        }
    }

    pub fn with_reason(mut self, reason: Option<String>) -> Self {
        self.reason = reason;
        self
    }

    pub fn failed(mut self, failed: bool) -> Self {
        self.failed = failed;
        self
    }
}
