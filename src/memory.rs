//! Cross-agent session memory and the shared store contract.
//!
//! Whichever agent currently owns a session reads and writes its memory;
//! the router replays it into the next agent on handoff. Writes always go
//! through [`MemoryPatch`] and merge at the field level: concurrent
//! writers (a tool result landing while a handoff is in flight) must not
//! clobber each other's fields with a whole-record replace.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::time::Instant;

use crate::error::Result;
use crate::handoff::HandoffRecord;
use crate::session::SessionId;

/// Record of the most recent call of one tool within a session.
///
/// One slot per tool name; only needed long enough to support the dedup
/// window, but carried in memory so a rehydrated agent sees recent calls.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallRecord {
    pub tool_name: String,
    /// Canonical key-sorted JSON rendering of the call parameters.
    pub normalized_params: String,
    pub timestamp: DateTime<Utc>,
    /// Result payload, when the call has completed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
}

/// Shared facts about a session, carried across handoffs.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionMemory {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub verified_identity: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub original_intent: Option<String>,
    #[serde(default)]
    pub last_tool_calls: HashMap<String, ToolCallRecord>,
    #[serde(default)]
    pub handoff_history: Vec<HandoffRecord>,
}

impl SessionMemory {
    /// Applies a field-level patch, last writer wins per field.
    pub fn apply(&mut self, patch: MemoryPatch) {
        if let Some(identity) = patch.verified_identity {
            self.verified_identity = Some(identity);
        }
        if let Some(intent) = patch.original_intent {
            self.original_intent = Some(intent);
        }
        for (name, record) in patch.tool_calls {
            self.last_tool_calls.insert(name, record);
        }
        self.handoff_history.extend(patch.handoff_records);
    }
}

/// A field-level delta against [`SessionMemory`].
///
/// Unset fields leave the stored value untouched; tool-call slots and
/// handoff records are merged per entry.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MemoryPatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub verified_identity: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub original_intent: Option<String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub tool_calls: HashMap<String, ToolCallRecord>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub handoff_records: Vec<HandoffRecord>,
}

impl MemoryPatch {
    pub fn is_empty(&self) -> bool {
        self.verified_identity.is_none()
            && self.original_intent.is_none()
            && self.tool_calls.is_empty()
            && self.handoff_records.is_empty()
    }

    pub fn verified_identity(mut self, identity: impl Into<String>) -> Self {
        self.verified_identity = Some(identity.into());
        self
    }

    pub fn original_intent(mut self, intent: impl Into<String>) -> Self {
        self.original_intent = Some(intent.into());
        self
    }

    pub fn tool_call(mut self, record: ToolCallRecord) -> Self {
        self.tool_calls.insert(record.tool_name.clone(), record);
        self
    }

    pub fn handoff_record(mut self, record: HandoffRecord) -> Self {
        self.handoff_records.push(record);
        self
    }
}

/// Contract of the shared session store.
///
/// Keys are session ids; values expire after the TTL given at write time.
/// `merge` applies a field-level patch and refreshes the TTL, so a live
/// conversation keeps its memory alive while an abandoned one expires.
#[async_trait]
pub trait SessionStore: Send + Sync + std::fmt::Debug {
    async fn get(&self, key: &SessionId) -> Result<Option<SessionMemory>>;

    async fn set(&self, key: &SessionId, value: SessionMemory, ttl: Duration) -> Result<()>;

    async fn merge(&self, key: &SessionId, patch: MemoryPatch, ttl: Duration) -> Result<()>;
}

struct Entry {
    memory: SessionMemory,
    expires_at: Instant,
}

/// In-memory [`SessionStore`] with per-entry TTL.
#[derive(Default, Clone)]
pub struct InMemorySessionStore {
    inner: Arc<Mutex<HashMap<SessionId, Entry>>>,
}

impl InMemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl std::fmt::Debug for InMemorySessionStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let map = self.inner.lock().unwrap();
        f.debug_struct("InMemorySessionStore")
            .field("entries", &map.len())
            .finish()
    }
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    async fn get(&self, key: &SessionId) -> Result<Option<SessionMemory>> {
        let mut map = self.inner.lock().unwrap();
        match map.get(key) {
            Some(entry) if entry.expires_at > Instant::now() => Ok(Some(entry.memory.clone())),
            Some(_) => {
                map.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn set(&self, key: &SessionId, value: SessionMemory, ttl: Duration) -> Result<()> {
        let mut map = self.inner.lock().unwrap();
        map.insert(
            key.clone(),
            Entry {
                memory: value,
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(())
    }

    async fn merge(&self, key: &SessionId, patch: MemoryPatch, ttl: Duration) -> Result<()> {
        let mut map = self.inner.lock().unwrap();
        let now = Instant::now();
        let entry = map.entry(key.clone()).or_insert_with(|| Entry {
            memory: SessionMemory::default(),
            expires_at: now + ttl,
        });
        if entry.expires_at <= now {
            entry.memory = SessionMemory::default();
        }
        entry.memory.apply(patch);
        entry.expires_at = now + ttl;
        Ok(())
    }
}
