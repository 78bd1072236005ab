//! Tool dispatch: handoff classification, duplicate suppression, and the
//! verification-attempt ceiling.
//!
//! The inference service occasionally emits two tool calls with identical
//! parameters within under a second. The dedup window here is a mitigation
//! with a tunable constant, not a semantic guarantee; callers must not
//! assume the upstream service stops doing this.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::Value;
use tokio::time::Instant;
use tracing::debug;

use crate::registry::{AgentRegistry, HANDOFF_TOOL_PREFIX};
use crate::session::SessionId;

/// Outcome of classifying a tool-use event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToolClass {
    /// A call in the `transfer_to_<role>` namespace targeting a known role.
    Handoff { target_role: String },
    /// Anything else; executed through the tool-execution service.
    Domain,
}

/// Classifies a tool name against the fixed handoff namespace.
///
/// The role segment must resolve in the registry; an unknown
/// `transfer_to_*` name falls through as a domain tool and fails on the
/// normal unknown-tool path.
pub fn classify(tool_name: &str, registry: &AgentRegistry) -> ToolClass {
    if let Some(role) = tool_name.strip_prefix(HANDOFF_TOOL_PREFIX) {
        if registry.has_role(role) {
            return ToolClass::Handoff {
                target_role: role.to_string(),
            };
        }
    }
    ToolClass::Domain
}

/// Renders params as canonical key-sorted JSON so that call identity is
/// insensitive to object key order.
pub fn normalize_params(params: &Value) -> String {
    fn canonical(value: &Value) -> Value {
        match value {
            Value::Object(map) => {
                let mut keys: Vec<&String> = map.keys().collect();
                keys.sort();
                let mut out = serde_json::Map::new();
                for key in keys {
                    out.insert(key.clone(), canonical(&map[key]));
                }
                Value::Object(out)
            }
            Value::Array(items) => Value::Array(items.iter().map(canonical).collect()),
            other => other.clone(),
        }
    }
    canonical(params).to_string()
}

struct CallSlot {
    normalized_params: String,
    at: Instant,
}

#[derive(Default)]
struct SessionDispatchState {
    // One slot per tool name; overwritten on every recorded call.
    last_calls: HashMap<String, CallSlot>,
    failed_attempts: HashMap<String, usize>,
}

/// Per-session dedup and retry bookkeeping, shared across executors.
///
/// The executor owning a session is its only writer, but state survives
/// handoffs: the agent taking over must not re-run a call its predecessor
/// just made.
#[derive(Clone)]
pub struct ToolDispatcher {
    dedup_window: Duration,
    max_verification_attempts: usize,
    sessions: Arc<Mutex<HashMap<SessionId, SessionDispatchState>>>,
}

impl ToolDispatcher {
    pub fn new(dedup_window: Duration, max_verification_attempts: usize) -> Self {
        Self {
            dedup_window,
            max_verification_attempts: max_verification_attempts.max(1),
            sessions: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Returns true if the same tool was called with the same normalized
    /// params within the dedup window; the caller must then answer the
    /// stream with a blocked result instead of re-executing. Otherwise
    /// records the call and returns false.
    pub fn check_duplicate(&self, session_id: &SessionId, tool_name: &str, params: &Value) -> bool {
        let normalized = normalize_params(params);
        let now = Instant::now();
        let mut sessions = self.sessions.lock().unwrap();
        let state = sessions.entry(session_id.clone()).or_default();

        if let Some(slot) = state.last_calls.get(tool_name) {
            if slot.normalized_params == normalized && now.duration_since(slot.at) < self.dedup_window
            {
                debug!(session = %session_id, tool = tool_name, "duplicate tool call suppressed");
                return true;
            }
        }

        state.last_calls.insert(
            tool_name.to_string(),
            CallSlot {
                normalized_params: normalized,
                at: now,
            },
        );
        false
    }

    /// Records one failed attempt of a verification-style tool and returns
    /// the running count.
    pub fn record_failed_attempt(&self, session_id: &SessionId, tool_name: &str) -> usize {
        let mut sessions = self.sessions.lock().unwrap();
        let state = sessions.entry(session_id.clone()).or_default();
        let count = state.failed_attempts.entry(tool_name.to_string()).or_insert(0);
        *count += 1;
        debug!(session = %session_id, tool = tool_name, attempts = *count, "verification attempt failed");
        *count
    }

    /// Whether the session has exhausted its attempts on this tool. Once
    /// true, the execution core must synthesize a failed handoff to the
    /// entry agent instead of executing again.
    pub fn attempts_exhausted(&self, session_id: &SessionId, tool_name: &str) -> bool {
        let sessions = self.sessions.lock().unwrap();
        sessions
            .get(session_id)
            .and_then(|s| s.failed_attempts.get(tool_name))
            .map(|count| *count >= self.max_verification_attempts)
            .unwrap_or(false)
    }

    /// Drops all state for a released session.
    pub fn forget_session(&self, session_id: &SessionId) {
        self.sessions.lock().unwrap().remove(session_id);
    }
}

impl std::fmt::Debug for ToolDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolDispatcher")
            .field("dedup_window", &self.dedup_window)
            .field("max_verification_attempts", &self.max_verification_attempts)
            .finish()
    }
}
