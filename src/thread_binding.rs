//! Thread bindings — the explicit `thread_id -> project` mapping an adapter
//! establishes once per conversation (spec §3 "ThreadBinding", §6
//! `bind_thread`/`get_binding`).
//!
//! A thread's project is fixed at bind time; `bind_thread` is an upsert so
//! re-binding (e.g. a user re-running a setup command) just overwrites the
//! previous mapping rather than erroring. Unknown-project rejection is the
//! caller's job ([[engine]] checks the [[project]] registry before calling
//! `bind`) since this store has no registry to validate against.

use crate::storage::now_ms;
use anyhow::Result;
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;

#[derive(Debug, Clone, sqlx::FromRow, Serialize, Deserialize)]
pub struct ThreadBindingRow {
    pub thread_id: String,
    pub project: String,
    pub adapter: String,
    pub creator_id: String,
    pub created_at: i64,
}

#[derive(Clone)]
pub struct ThreadBindingStore {
    pool: SqlitePool,
}

impl ThreadBindingStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn bind(
        &self,
        thread_id: &str,
        project: &str,
        adapter: &str,
        creator_id: &str,
    ) -> Result<ThreadBindingRow> {
        let now = now_ms();
        sqlx::query(
            "INSERT INTO thread_bindings (thread_id, project, adapter, creator_id, created_at)
             VALUES (?, ?, ?, ?, ?)
             ON CONFLICT(thread_id) DO UPDATE SET
                project = excluded.project,
                adapter = excluded.adapter,
                creator_id = excluded.creator_id,
                created_at = excluded.created_at",
        )
        .bind(thread_id)
        .bind(project)
        .bind(adapter)
        .bind(creator_id)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(ThreadBindingRow {
            thread_id: thread_id.to_string(),
            project: project.to_string(),
            adapter: adapter.to_string(),
            creator_id: creator_id.to_string(),
            created_at: now,
        })
    }

    pub async fn get(&self, thread_id: &str) -> Result<Option<ThreadBindingRow>> {
        Ok(
            sqlx::query_as("SELECT * FROM thread_bindings WHERE thread_id = ?")
                .bind(thread_id)
                .fetch_optional(&self.pool)
                .await?,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::Storage;

    async fn store() -> ThreadBindingStore {
        let storage = Storage::open_in_memory().await.unwrap();
        ThreadBindingStore::new(storage.pool())
    }

    #[tokio::test]
    async fn bind_then_get() {
        let s = store().await;
        s.bind("t1", "alpha", "web", "user-1").await.unwrap();
        let row = s.get("t1").await.unwrap().unwrap();
        assert_eq!(row.project, "alpha");
        assert_eq!(row.adapter, "web");
    }

    #[tokio::test]
    async fn rebind_overwrites_prior_mapping() {
        let s = store().await;
        s.bind("t1", "alpha", "web", "user-1").await.unwrap();
        s.bind("t1", "beta", "slack", "user-2").await.unwrap();
        let row = s.get("t1").await.unwrap().unwrap();
        assert_eq!(row.project, "beta");
        assert_eq!(row.adapter, "slack");
    }

    #[tokio::test]
    async fn unbound_thread_returns_none() {
        let s = store().await;
        assert!(s.get("nope").await.unwrap().is_none());
    }
}
