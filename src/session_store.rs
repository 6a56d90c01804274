//! Session Store (component E) — thread → last Agent session reference,
//! pruned on a 24h TTL (spec §3 "Session", §4.4).
//!
//! A session reference is advisory only: its absence or staleness must
//! never block continuation, it just means the next run starts fresh
//! (spec §3 invariant). Grounded in the upsert-by-primary-key shape of
//! examples/clawde-io-apps/daemon/src/storage/mod.rs's `SessionRow` table,
//! adapted to the millisecond timestamp convention used throughout this
//! crate.

use crate::storage::now_ms;
use anyhow::Result;
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;

pub const SESSION_TTL_MS: i64 = 24 * 60 * 60 * 1000;

#[derive(Debug, Clone, sqlx::FromRow, Serialize, Deserialize)]
pub struct SessionRow {
    pub thread_id: String,
    pub project: String,
    pub session_ref: String,
    pub last_used_ts: i64,
}

#[derive(Clone)]
pub struct SessionStore {
    pool: SqlitePool,
}

impl SessionStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Upsert the session reference for a thread on a successful run that
    /// surfaced one (spec §4.4 "the Session Store upserts").
    pub async fn upsert(&self, thread_id: &str, project: &str, session_ref: &str) -> Result<()> {
        sqlx::query(
            "INSERT INTO sessions (thread_id, project, session_ref, last_used_ts)
             VALUES (?, ?, ?, ?)
             ON CONFLICT(thread_id) DO UPDATE SET
                project = excluded.project,
                session_ref = excluded.session_ref,
                last_used_ts = excluded.last_used_ts",
        )
        .bind(thread_id)
        .bind(project)
        .bind(session_ref)
        .bind(now_ms())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Look up a non-stale session reference for a thread. Returns `None`
    /// both when there is no row and when the row is past its TTL — the
    /// two cases are indistinguishable to callers by design (spec §3:
    /// "absence or staleness must not deadlock continuation").
    pub async fn lookup(&self, thread_id: &str) -> Result<Option<SessionRow>> {
        let row: Option<SessionRow> =
            sqlx::query_as("SELECT * FROM sessions WHERE thread_id = ?")
                .bind(thread_id)
                .fetch_optional(&self.pool)
                .await?;

        Ok(row.filter(|r| now_ms() - r.last_used_ts <= SESSION_TTL_MS))
    }

    /// Delete every row past the TTL. Run opportunistically; a skipped
    /// prune only delays cleanup, it never violates the advisory-only
    /// guarantee because `lookup` already filters stale rows.
    pub async fn prune_expired(&self) -> Result<u64> {
        let cutoff = now_ms() - SESSION_TTL_MS;
        let affected = sqlx::query("DELETE FROM sessions WHERE last_used_ts < ?")
            .bind(cutoff)
            .execute(&self.pool)
            .await?
            .rows_affected();
        Ok(affected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::Storage;

    async fn store() -> SessionStore {
        let storage = Storage::open_in_memory().await.unwrap();
        SessionStore::new(storage.pool())
    }

    #[tokio::test]
    async fn upsert_then_lookup() {
        let s = store().await;
        s.upsert("t1", "alpha", "sess-abc").await.unwrap();
        let row = s.lookup("t1").await.unwrap().unwrap();
        assert_eq!(row.session_ref, "sess-abc");
        assert_eq!(row.project, "alpha");
    }

    #[tokio::test]
    async fn upsert_overwrites_prior_reference() {
        let s = store().await;
        s.upsert("t1", "alpha", "sess-abc").await.unwrap();
        s.upsert("t1", "alpha", "sess-xyz").await.unwrap();
        let row = s.lookup("t1").await.unwrap().unwrap();
        assert_eq!(row.session_ref, "sess-xyz");
    }

    #[tokio::test]
    async fn missing_thread_returns_none() {
        let s = store().await;
        assert!(s.lookup("nope").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn stale_session_is_not_returned() {
        let s = store().await;
        sqlx::query(
            "INSERT INTO sessions (thread_id, project, session_ref, last_used_ts) VALUES (?, ?, ?, ?)",
        )
        .bind("t1")
        .bind("alpha")
        .bind("sess-old")
        .bind(now_ms() - SESSION_TTL_MS - 1)
        .execute(&s.pool)
        .await
        .unwrap();

        assert!(s.lookup("t1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn prune_removes_only_expired_rows() {
        let s = store().await;
        s.upsert("fresh", "alpha", "sess-1").await.unwrap();
        sqlx::query(
            "INSERT INTO sessions (thread_id, project, session_ref, last_used_ts) VALUES (?, ?, ?, ?)",
        )
        .bind("stale")
        .bind("alpha")
        .bind("sess-2")
        .bind(now_ms() - SESSION_TTL_MS - 1)
        .execute(&s.pool)
        .await
        .unwrap();

        let pruned = s.prune_expired().await.unwrap();
        assert_eq!(pruned, 1);
        assert!(s.lookup("fresh").await.unwrap().is_some());
    }
}
