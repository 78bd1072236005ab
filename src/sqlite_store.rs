//! SQLite-backed session store.
//!
//! A [`SessionStore`] implementation for deployments without an external
//! key-value service: memory survives process restarts, and expiry is
//! enforced on read so the table never serves stale entries. Uses `sqlx`
//! for asynchronous database access; the schema is created on first use.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use sqlx::{Pool, Row, Sqlite, SqlitePool};

use crate::error::Result;
use crate::memory::{MemoryPatch, SessionMemory, SessionStore};
use crate::session::SessionId;

/// A [`SessionStore`] that persists session memory in SQLite.
pub struct SqliteSessionStore {
    pool: Pool<Sqlite>,
}

impl SqliteSessionStore {
    /// Opens (or creates) the database at `db_path` and runs migrations.
    pub async fn new(db_path: impl AsRef<Path>) -> Result<Self> {
        let db_url = format!("sqlite:{}?mode=rwc", db_path.as_ref().display());
        let pool = SqlitePool::connect(&db_url).await?;
        Self::run_migrations(&pool).await?;
        Ok(Self { pool })
    }

    /// Creates an in-memory store, useful for testing.
    pub async fn new_in_memory() -> Result<Self> {
        let pool = SqlitePool::connect("sqlite::memory:").await?;
        Self::run_migrations(&pool).await?;
        Ok(Self { pool })
    }

    async fn run_migrations(pool: &Pool<Sqlite>) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS session_memory (
                session_id TEXT PRIMARY KEY,
                memory TEXT NOT NULL,
                expires_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(pool)
        .await?;

        Ok(())
    }

    fn expiry_timestamp(ttl: Duration) -> i64 {
        Utc::now().timestamp() + ttl.as_secs() as i64
    }

    /// Drops every expired row. Deployments can call this from a periodic
    /// task; reads are already expiry-checked either way.
    pub async fn purge_expired(&self) -> Result<u64> {
        let result = sqlx::query("DELETE FROM session_memory WHERE expires_at <= ?")
            .bind(Utc::now().timestamp())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

impl std::fmt::Debug for SqliteSessionStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteSessionStore").finish()
    }
}

#[async_trait]
impl SessionStore for SqliteSessionStore {
    async fn get(&self, key: &SessionId) -> Result<Option<SessionMemory>> {
        let row = sqlx::query(
            "SELECT memory, expires_at FROM session_memory WHERE session_id = ?",
        )
        .bind(key.as_str())
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else { return Ok(None) };
        let expires_at: i64 = row.get("expires_at");
        if expires_at <= Utc::now().timestamp() {
            sqlx::query("DELETE FROM session_memory WHERE session_id = ?")
                .bind(key.as_str())
                .execute(&self.pool)
                .await?;
            return Ok(None);
        }

        let memory: String = row.get("memory");
        Ok(Some(serde_json::from_str(&memory)?))
    }

    async fn set(&self, key: &SessionId, value: SessionMemory, ttl: Duration) -> Result<()> {
        let memory = serde_json::to_string(&value)?;
        sqlx::query(
            r#"
            INSERT INTO session_memory (session_id, memory, expires_at)
            VALUES (?, ?, ?)
            ON CONFLICT(session_id) DO UPDATE SET memory = ?, expires_at = ?
            "#,
        )
        .bind(key.as_str())
        .bind(&memory)
        .bind(Self::expiry_timestamp(ttl))
        .bind(&memory)
        .bind(Self::expiry_timestamp(ttl))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn merge(&self, key: &SessionId, patch: MemoryPatch, ttl: Duration) -> Result<()> {
        // Read-modify-write under a transaction: concurrent field writers
        // serialize here instead of clobbering whole records.
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query(
            "SELECT memory, expires_at FROM session_memory WHERE session_id = ?",
        )
        .bind(key.as_str())
        .fetch_optional(&mut *tx)
        .await?;

        let mut memory = match row {
            Some(row) => {
                let expires_at: i64 = row.get("expires_at");
                if expires_at <= Utc::now().timestamp() {
                    SessionMemory::default()
                } else {
                    let data: String = row.get("memory");
                    serde_json::from_str(&data)?
                }
            }
            None => SessionMemory::default(),
        };
        memory.apply(patch);

        let serialized = serde_json::to_string(&memory)?;
        sqlx::query(
            r#"
            INSERT INTO session_memory (session_id, memory, expires_at)
            VALUES (?, ?, ?)
            ON CONFLICT(session_id) DO UPDATE SET memory = ?, expires_at = ?
            "#,
        )
        .bind(key.as_str())
        .bind(&serialized)
        .bind(Self::expiry_timestamp(ttl))
        .bind(&serialized)
        .bind(Self::expiry_timestamp(ttl))
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn test_set_get_round_trip() {
        let store = SqliteSessionStore::new_in_memory().await.unwrap();
        let key = SessionId::from("s-1");

        let mut memory = SessionMemory::default();
        memory.apply(MemoryPatch::default().verified_identity("cust-42"));
        store
            .set(&key, memory.clone(), Duration::from_secs(60))
            .await
            .unwrap();

        let loaded = store.get(&key).await.unwrap().unwrap();
        assert_eq!(loaded, memory);
    }

    #[tokio::test]
    async fn test_merge_is_field_level() {
        let store = SqliteSessionStore::new_in_memory().await.unwrap();
        let key = SessionId::from("s-1");
        let ttl = Duration::from_secs(60);

        store
            .merge(&key, MemoryPatch::default().verified_identity("cust-42"), ttl)
            .await
            .unwrap();
        store
            .merge(&key, MemoryPatch::default().original_intent("balance"), ttl)
            .await
            .unwrap();

        let memory = store.get(&key).await.unwrap().unwrap();
        assert_eq!(memory.verified_identity.as_deref(), Some("cust-42"));
        assert_eq!(memory.original_intent.as_deref(), Some("balance"));
    }

    #[tokio::test]
    async fn test_expired_entries_are_gone() {
        let store = SqliteSessionStore::new_in_memory().await.unwrap();
        let key = SessionId::from("s-1");

        store
            .set(&key, SessionMemory::default(), Duration::from_secs(0))
            .await
            .unwrap();
        assert!(store.get(&key).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_purge_expired_counts_rows() {
        let store = SqliteSessionStore::new_in_memory().await.unwrap();
        store
            .set(&SessionId::from("dead"), SessionMemory::default(), Duration::from_secs(0))
            .await
            .unwrap();
        store
            .set(&SessionId::from("live"), SessionMemory::default(), Duration::from_secs(60))
            .await
            .unwrap();

        assert_eq!(store.purge_expired().await.unwrap(), 1);
        assert!(store.get(&SessionId::from("live")).await.unwrap().is_some());
    }
}
