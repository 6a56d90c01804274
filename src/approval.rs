//! Approval Store (component F) — pending/approved/denied records with
//! auto-expiry (spec §3 "Approval", §4.5).
//!
//! Resolution is a single conditional UPDATE guarded by `status = 'pending'`
//! so a racing resolve and expiry can never both "win" (spec §4.5 rule 2:
//! "returns false if the row was no longer pending"). Grounded in the same
//! atomic-claim idiom as [[queue]]'s dequeue.

use crate::storage::now_ms;
use anyhow::Result;
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionClass {
    FileDelete,
    GitPush,
    GitForce,
    DestructiveCmd,
    ExternalRequest,
    InstallPackage,
    Unknown,
}

impl ActionClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::FileDelete => "file_delete",
            Self::GitPush => "git_push",
            Self::GitForce => "git_force",
            Self::DestructiveCmd => "destructive_cmd",
            Self::ExternalRequest => "external_request",
            Self::InstallPackage => "install_package",
            Self::Unknown => "unknown",
        }
    }

    /// Keyword classification of a permission-denial description (spec
    /// §4.2 step 6). Conservative and keyword-based by design (spec §9
    /// open question: prefer a structured event over these keywords when
    /// the Agent CLI surfaces one).
    pub fn classify(text: &str) -> Self {
        let lower = text.to_lowercase();
        if lower.contains("rm -rf") || lower.contains("drop table") {
            Self::DestructiveCmd
        } else if lower.contains("git push") {
            Self::GitPush
        } else if lower.contains("force") || lower.contains("reset") {
            Self::GitForce
        } else if lower.contains("delete") || lower.contains(" rm ") || lower.starts_with("rm ") {
            Self::FileDelete
        } else if lower.contains("pip install") || lower.contains("npm install") {
            Self::InstallPackage
        } else if lower.contains("http") || lower.contains("api") {
            Self::ExternalRequest
        } else {
            Self::Unknown
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    Approve,
    Deny,
}

#[derive(Debug, Clone, sqlx::FromRow, Serialize, Deserialize)]
pub struct ApprovalRow {
    pub id: String,
    pub task_id: String,
    pub action_class: String,
    pub description: String,
    pub status: String,
    pub requested_ts: i64,
    pub resolved_ts: Option<i64>,
    pub resolver: Option<String>,
}

#[derive(Clone)]
pub struct ApprovalStore {
    pool: SqlitePool,
}

impl ApprovalStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Insert a pending approval for a task moving to `needs_approval`
    /// (spec §4.5 rule 1). `description` must already be redacted by the
    /// caller.
    pub async fn create(
        &self,
        task_id: &str,
        action_class: ActionClass,
        description: &str,
    ) -> Result<ApprovalRow> {
        let id = Uuid::new_v4().to_string();
        let now = now_ms();
        sqlx::query(
            "INSERT INTO approvals (id, task_id, action_class, description, status, requested_ts)
             VALUES (?, ?, ?, ?, 'pending', ?)",
        )
        .bind(&id)
        .bind(task_id)
        .bind(action_class.as_str())
        .bind(description)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(ApprovalRow {
            id,
            task_id: task_id.to_string(),
            action_class: action_class.as_str().to_string(),
            description: description.to_string(),
            status: "pending".to_string(),
            requested_ts: now,
            resolved_ts: None,
            resolver: None,
        })
    }

    pub async fn get(&self, id: &str) -> Result<Option<ApprovalRow>> {
        Ok(sqlx::query_as("SELECT * FROM approvals WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?)
    }

    pub async fn pending_for_task(&self, task_id: &str) -> Result<Option<ApprovalRow>> {
        Ok(sqlx::query_as(
            "SELECT * FROM approvals WHERE task_id = ? AND status = 'pending' LIMIT 1",
        )
        .bind(task_id)
        .fetch_optional(&self.pool)
        .await?)
    }

    /// Atomically flip a pending approval to its terminal status. Returns
    /// `false` if it was already resolved (race with another resolve or
    /// with expiry) — spec §4.5 rule 2.
    pub async fn resolve(&self, id: &str, actor: &str, resolution: Resolution) -> Result<bool> {
        let status = match resolution {
            Resolution::Approve => "approved",
            Resolution::Deny => "denied",
        };
        let affected = sqlx::query(
            "UPDATE approvals SET status = ?, resolved_ts = ?, resolver = ?
             WHERE id = ? AND status = 'pending'",
        )
        .bind(status)
        .bind(now_ms())
        .bind(actor)
        .bind(id)
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(affected > 0)
    }

    /// Flip every pending approval older than `expiry_ms` to denied with
    /// resolver `system_timeout`, returning the affected task ids so the
    /// caller can mark those tasks failed with `approval_timeout` (spec
    /// §4.5 rule 5). The select-then-update runs in one transaction so a
    /// concurrent human resolve cannot race past this sweep.
    pub async fn expire_pending(&self, expiry_ms: i64) -> Result<Vec<String>> {
        let cutoff = now_ms() - expiry_ms;
        let mut tx = self.pool.begin().await?;

        let expired: Vec<(String, String)> = sqlx::query_as(
            "SELECT id, task_id FROM approvals WHERE status = 'pending' AND requested_ts < ?",
        )
        .bind(cutoff)
        .fetch_all(&mut *tx)
        .await?;

        let now = now_ms();
        let mut task_ids = Vec::with_capacity(expired.len());
        for (id, task_id) in expired {
            let affected = sqlx::query(
                "UPDATE approvals SET status = 'denied', resolved_ts = ?, resolver = 'system_timeout'
                 WHERE id = ? AND status = 'pending'",
            )
            .bind(now)
            .bind(&id)
            .execute(&mut *tx)
            .await?
            .rows_affected();
            if affected > 0 {
                task_ids.push(task_id);
            }
        }

        tx.commit().await?;
        Ok(task_ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::Storage;

    async fn store() -> ApprovalStore {
        let storage = Storage::open_in_memory().await.unwrap();
        ApprovalStore::new(storage.pool())
    }

    #[tokio::test]
    async fn create_and_resolve_approve() {
        let s = store().await;
        let row = s.create("t1", ActionClass::FileDelete, "delete foo.txt").await.unwrap();
        assert!(s.resolve(&row.id, "operator", Resolution::Approve).await.unwrap());
        let row = s.get(&row.id).await.unwrap().unwrap();
        assert_eq!(row.status, "approved");
        assert_eq!(row.resolver.as_deref(), Some("operator"));
    }

    #[tokio::test]
    async fn resolve_is_race_safe() {
        let s = store().await;
        let row = s.create("t1", ActionClass::FileDelete, "delete foo.txt").await.unwrap();
        assert!(s.resolve(&row.id, "operator", Resolution::Deny).await.unwrap());
        assert!(!s.resolve(&row.id, "operator2", Resolution::Approve).await.unwrap());
    }

    #[tokio::test]
    async fn expire_pending_denies_and_returns_task_ids() {
        let s = store().await;
        let row = s.create("t1", ActionClass::FileDelete, "delete foo.txt").await.unwrap();
        sqlx::query("UPDATE approvals SET requested_ts = ? WHERE id = ?")
            .bind(now_ms() - 1_800_001)
            .bind(&row.id)
            .execute(&s.pool)
            .await
            .unwrap();

        let expired = s.expire_pending(1_800_000).await.unwrap();
        assert_eq!(expired, vec!["t1".to_string()]);

        let row = s.get(&row.id).await.unwrap().unwrap();
        assert_eq!(row.status, "denied");
        assert_eq!(row.resolver.as_deref(), Some("system_timeout"));
    }

    #[tokio::test]
    async fn expire_pending_skips_fresh_rows() {
        let s = store().await;
        s.create("t1", ActionClass::FileDelete, "delete foo.txt").await.unwrap();
        let expired = s.expire_pending(1_800_000).await.unwrap();
        assert!(expired.is_empty());
    }

    #[test]
    fn classify_matches_keywords() {
        assert_eq!(ActionClass::classify("about to delete file.txt"), ActionClass::FileDelete);
        assert_eq!(ActionClass::classify("wants to git push origin main"), ActionClass::GitPush);
        assert_eq!(ActionClass::classify("force reset --hard"), ActionClass::GitForce);
        assert_eq!(ActionClass::classify("rm -rf /tmp/x"), ActionClass::DestructiveCmd);
        assert_eq!(ActionClass::classify("drop table users"), ActionClass::DestructiveCmd);
        assert_eq!(ActionClass::classify("npm install left-pad"), ActionClass::InstallPackage);
        assert_eq!(ActionClass::classify("calling external api endpoint"), ActionClass::ExternalRequest);
        assert_eq!(ActionClass::classify("something else entirely"), ActionClass::Unknown);
    }
}
