//! Task Queue (component D) — durable FIFO with per-project mutex and
//! per-project depth cap (spec §3 "Task", §4.1).
//!
//! Grounded in the atomic-claim pattern of
//! examples/clawde-io-apps/daemon/src/tasks/storage.rs::claim_task: every
//! state-changing operation is a single conditional UPDATE (or a
//! select-then-conditional-UPDATE pair inside one transaction) so the
//! invariant holds even across a restart — the durable query form is the
//! source of truth, not an in-memory lock map (spec §9).

use crate::storage::now_ms;
use anyhow::Result;
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskStatus {
    Queued,
    Running,
    NeedsApproval,
    Done,
    Failed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::NeedsApproval => "needs_approval",
            Self::Done => "done",
            Self::Failed => "failed",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        Some(match s {
            "queued" => Self::Queued,
            "running" => Self::Running,
            "needs_approval" => Self::NeedsApproval,
            "done" => Self::Done,
            "failed" => Self::Failed,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, sqlx::FromRow, Serialize, Deserialize)]
pub struct TaskRow {
    pub id: String,
    pub project: String,
    pub project_path: String,
    pub prompt: String,
    pub thread_id: String,
    pub adapter: String,
    pub continue_session: bool,
    pub status: String,
    pub result: Option<String>,
    pub error: Option<String>,
    pub tokens_used: i64,
    pub token_budget: Option<i64>,
    pub worker_pid: Option<i64>,
    pub worker_pid_start_ts: Option<i64>,
    pub checkpoint: Option<String>,
    pub created_at: i64,
    pub started_at: Option<i64>,
    pub completed_at: Option<i64>,
}

impl TaskRow {
    pub fn status(&self) -> TaskStatus {
        TaskStatus::from_str(&self.status).expect("status column always holds a known value")
    }
}

#[derive(Debug, Clone)]
pub struct TaskInput {
    pub project: String,
    pub project_path: String,
    pub prompt: String,
    pub thread_id: String,
    pub adapter: String,
    pub continue_session: bool,
    pub token_budget: Option<i64>,
}

#[derive(Clone)]
pub struct TaskQueue {
    pool: SqlitePool,
    max_queued_per_project: i64,
}

impl TaskQueue {
    pub fn new(pool: SqlitePool, max_queued_per_project: i64) -> Self {
        Self {
            pool,
            max_queued_per_project,
        }
    }

    /// Atomic: count queued rows for the project, reject if at cap,
    /// otherwise insert. Both steps run inside one transaction so the
    /// count-then-insert can never race with a concurrent enqueue for the
    /// same project (spec §4.1, §8 "queued-count per project < cap").
    pub async fn enqueue(&self, input: TaskInput) -> Result<TaskRow, QueueFull> {
        let mut tx = self.pool.begin().await.map_err(QueueFull::storage)?;

        let count: (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM tasks WHERE project = ? AND status = 'queued'",
        )
        .bind(&input.project)
        .fetch_one(&mut *tx)
        .await
        .map_err(QueueFull::storage)?;

        if count.0 >= self.max_queued_per_project {
            tx.rollback().await.ok();
            return Err(QueueFull::AtCapacity);
        }

        let id = Uuid::new_v4().to_string();
        let now = now_ms();
        sqlx::query(
            "INSERT INTO tasks
             (id, project, project_path, prompt, thread_id, adapter, continue_session,
              status, tokens_used, token_budget, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, 'queued', 0, ?, ?)",
        )
        .bind(&id)
        .bind(&input.project)
        .bind(&input.project_path)
        .bind(&input.prompt)
        .bind(&input.thread_id)
        .bind(&input.adapter)
        .bind(input.continue_session)
        .bind(input.token_budget)
        .bind(now)
        .execute(&mut *tx)
        .await
        .map_err(QueueFull::storage)?;

        let row: TaskRow = sqlx::query_as("SELECT * FROM tasks WHERE id = ?")
            .bind(&id)
            .fetch_one(&mut *tx)
            .await
            .map_err(QueueFull::storage)?;

        tx.commit().await.map_err(QueueFull::storage)?;
        Ok(row)
    }

    /// Atomic: pick the oldest queued task whose project has no row in
    /// {running, needs_approval}, flip it to running, stamp started_at.
    /// Returns `None` if every queued row is blocked by its project's lock
    /// (spec §4.1 "Dequeue").
    pub async fn dequeue_next(&self) -> Result<Option<TaskRow>> {
        let mut tx = self.pool.begin().await?;

        let candidate: Option<(String,)> = sqlx::query_as(
            "SELECT id FROM tasks
             WHERE status = 'queued'
               AND project NOT IN (
                   SELECT project FROM tasks WHERE status IN ('running', 'needs_approval')
               )
             ORDER BY created_at ASC
             LIMIT 1",
        )
        .fetch_optional(&mut *tx)
        .await?;

        let Some((id,)) = candidate else {
            tx.commit().await?;
            return Ok(None);
        };

        let now = now_ms();
        let affected = sqlx::query(
            "UPDATE tasks SET status = 'running', started_at = ? WHERE id = ? AND status = 'queued'",
        )
        .bind(now)
        .bind(&id)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if affected == 0 {
            tx.commit().await?;
            return Ok(None);
        }

        let row: TaskRow = sqlx::query_as("SELECT * FROM tasks WHERE id = ?")
            .bind(&id)
            .fetch_one(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(Some(row))
    }

    pub async fn get(&self, id: &str) -> Result<Option<TaskRow>> {
        Ok(sqlx::query_as("SELECT * FROM tasks WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?)
    }

    pub async fn list_by_thread(&self, thread_id: &str, limit: i64) -> Result<Vec<TaskRow>> {
        Ok(sqlx::query_as(
            "SELECT * FROM tasks WHERE thread_id = ? ORDER BY created_at DESC LIMIT ?",
        )
        .bind(thread_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?)
    }

    pub async fn list_by_project(&self, project: &str, limit: i64) -> Result<Vec<TaskRow>> {
        Ok(sqlx::query_as(
            "SELECT * FROM tasks WHERE project = ? ORDER BY created_at DESC LIMIT ?",
        )
        .bind(project)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?)
    }

    pub async fn update_tokens(&self, id: &str, tokens_used: i64) -> Result<()> {
        sqlx::query("UPDATE tasks SET tokens_used = ? WHERE id = ?")
            .bind(tokens_used)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Only applies from `running` — a task already flipped to `failed` by
    /// a concurrent cancel must not be resurrected into `done` once its
    /// subprocess happens to exit (spec §4.8: "the supervisor... refrains
    /// from emitting a 'done' update" once cancelled).
    pub async fn mark_done(&self, id: &str, result: &str) -> Result<()> {
        sqlx::query(
            "UPDATE tasks SET status = 'done', result = ?, completed_at = ?,
             worker_pid = NULL, worker_pid_start_ts = NULL
             WHERE id = ? AND status = 'running'",
        )
        .bind(result)
        .bind(now_ms())
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Unconditional — used both for run-time failures (from `running`) and
    /// for terminal transitions the caller has already confirmed are valid
    /// (orphan recovery, approval timeout on a `needs_approval` row).
    pub async fn mark_failed(&self, id: &str, error: &str) -> Result<()> {
        sqlx::query(
            "UPDATE tasks SET status = 'failed', error = ?, completed_at = ?,
             worker_pid = NULL, worker_pid_start_ts = NULL
             WHERE id = ? AND status != 'done' AND status != 'failed'",
        )
        .bind(error)
        .bind(now_ms())
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn mark_needs_approval(&self, id: &str) -> Result<()> {
        sqlx::query(
            "UPDATE tasks SET status = 'needs_approval', worker_pid = NULL, worker_pid_start_ts = NULL
             WHERE id = ? AND status = 'running'",
        )
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Mark a task back to running for a replay run (spec §4.5 rule 4).
    /// Only applies from `needs_approval` — a task cancelled while its
    /// approval was still pending must not be resurrected into a replay.
    pub async fn mark_replaying(&self, id: &str) -> Result<bool> {
        let affected = sqlx::query(
            "UPDATE tasks SET status = 'running' WHERE id = ? AND status = 'needs_approval'",
        )
        .bind(id)
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(affected > 0)
    }

    pub async fn set_checkpoint(&self, id: &str, checkpoint: &str) -> Result<()> {
        sqlx::query("UPDATE tasks SET checkpoint = ? WHERE id = ?")
            .bind(checkpoint)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Record `(pid, start_ts)` atomically before any long operation (spec
    /// §4.3 PID identity discipline).
    pub async fn set_worker_pid(&self, id: &str, pid: u32, start_ts: i64) -> Result<()> {
        sqlx::query("UPDATE tasks SET worker_pid = ?, worker_pid_start_ts = ? WHERE id = ?")
            .bind(pid as i64)
            .bind(start_ts)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn clear_worker_pid(&self, id: &str) -> Result<()> {
        sqlx::query("UPDATE tasks SET worker_pid = NULL, worker_pid_start_ts = NULL WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Atomic conditional transition from any non-terminal status to
    /// failed(cancelled_by_user). Returns true iff the row actually changed
    /// (spec §4.1 "Cancel").
    pub async fn cancel(&self, id: &str) -> Result<bool> {
        let affected = sqlx::query(
            "UPDATE tasks SET status = 'failed', error = 'cancelled_by_user', completed_at = ?
             WHERE id = ? AND status IN ('queued', 'running', 'needs_approval')",
        )
        .bind(now_ms())
        .bind(id)
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(affected > 0)
    }

    /// Every row with status=running at engine start is an orphan candidate
    /// (spec §4.1 "Orphan discovery").
    pub async fn running_orphans(&self) -> Result<Vec<TaskRow>> {
        Ok(sqlx::query_as("SELECT * FROM tasks WHERE status = 'running'")
            .fetch_all(&self.pool)
            .await?)
    }

    /// Sum of `tokens_used` across tasks created at or after `since_ts`,
    /// optionally scoped to one project (spec §6 `get_budget_today`).
    pub async fn tokens_used_since(&self, project: Option<&str>, since_ts: i64) -> Result<i64> {
        let total: (Option<i64>,) = match project {
            Some(p) => {
                sqlx::query_as(
                    "SELECT SUM(tokens_used) FROM tasks WHERE project = ? AND created_at >= ?",
                )
                .bind(p)
                .bind(since_ts)
                .fetch_one(&self.pool)
                .await?
            }
            None => {
                sqlx::query_as("SELECT SUM(tokens_used) FROM tasks WHERE created_at >= ?")
                    .bind(since_ts)
                    .fetch_one(&self.pool)
                    .await?
            }
        };
        Ok(total.0.unwrap_or(0))
    }

    /// Every pending approval row past its expiry, paired with its task.
    pub async fn pending_count_for_project(&self, project: &str) -> Result<i64> {
        let row: (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM tasks WHERE project = ? AND status = 'queued'",
        )
        .bind(project)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.0)
    }
}

/// Distinguishes a genuine cap rejection from a storage failure while
/// enqueueing, so callers can surface `queue_full` (spec §7) specifically.
#[derive(Debug)]
pub enum QueueFull {
    AtCapacity,
    Storage(anyhow::Error),
}

impl QueueFull {
    fn storage(e: impl Into<anyhow::Error>) -> Self {
        Self::Storage(e.into())
    }
}

impl std::fmt::Display for QueueFull {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::AtCapacity => write!(f, "queue_full"),
            Self::Storage(e) => write!(f, "storage error during enqueue: {e}"),
        }
    }
}

impl std::error::Error for QueueFull {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::Storage;

    async fn queue(cap: i64) -> TaskQueue {
        let storage = Storage::open_in_memory().await.unwrap();
        TaskQueue::new(storage.pool(), cap)
    }

    fn input(project: &str) -> TaskInput {
        TaskInput {
            project: project.to_string(),
            project_path: "/tmp".into(),
            prompt: "hello".into(),
            thread_id: "t1".into(),
            adapter: "web".into(),
            continue_session: false,
            token_budget: None,
        }
    }

    #[tokio::test]
    async fn enqueue_then_dequeue_runs_it() {
        let q = queue(5).await;
        let task = q.enqueue(input("alpha")).await.unwrap();
        assert_eq!(task.status(), TaskStatus::Queued);

        let dequeued = q.dequeue_next().await.unwrap().unwrap();
        assert_eq!(dequeued.id, task.id);
        assert_eq!(dequeued.status(), TaskStatus::Running);
        assert!(dequeued.started_at.is_some());
    }

    #[tokio::test]
    async fn per_project_mutual_exclusion() {
        let q = queue(5).await;
        q.enqueue(input("alpha")).await.unwrap();
        q.enqueue(input("alpha")).await.unwrap();

        let first = q.dequeue_next().await.unwrap();
        assert!(first.is_some());

        // Second queued row for the same project must not be dequeued while
        // the first is still running.
        let second = q.dequeue_next().await.unwrap();
        assert!(second.is_none());

        q.mark_done(&first.unwrap().id, "done").await.unwrap();
        let second = q.dequeue_next().await.unwrap();
        assert!(second.is_some());
    }

    #[tokio::test]
    async fn cross_project_parallelism() {
        let q = queue(5).await;
        q.enqueue(input("alpha")).await.unwrap();
        q.enqueue(input("beta")).await.unwrap();

        let a = q.dequeue_next().await.unwrap().unwrap();
        let b = q.dequeue_next().await.unwrap().unwrap();
        assert_ne!(a.project, b.project);
    }

    #[tokio::test]
    async fn queue_cap_rejects_third_enqueue() {
        let q = queue(2).await;
        q.enqueue(input("alpha")).await.unwrap();
        q.enqueue(input("alpha")).await.unwrap();
        let err = q.enqueue(input("alpha")).await.unwrap_err();
        assert!(matches!(err, QueueFull::AtCapacity));

        let count = q.pending_count_for_project("alpha").await.unwrap();
        assert_eq!(count, 2, "rejected enqueue must not mutate state");
    }

    #[tokio::test]
    async fn cancel_queued_task() {
        let q = queue(5).await;
        let task = q.enqueue(input("alpha")).await.unwrap();
        assert!(q.cancel(&task.id).await.unwrap());
        let row = q.get(&task.id).await.unwrap().unwrap();
        assert_eq!(row.status(), TaskStatus::Failed);
        assert_eq!(row.error.as_deref(), Some("cancelled_by_user"));
    }

    #[tokio::test]
    async fn cancel_is_idempotent_on_terminal_task() {
        let q = queue(5).await;
        let task = q.enqueue(input("alpha")).await.unwrap();
        assert!(q.cancel(&task.id).await.unwrap());
        assert!(!q.cancel(&task.id).await.unwrap());
    }

    #[tokio::test]
    async fn running_orphans_lists_running_rows() {
        let q = queue(5).await;
        let task = q.enqueue(input("alpha")).await.unwrap();
        q.dequeue_next().await.unwrap();
        let orphans = q.running_orphans().await.unwrap();
        assert_eq!(orphans.len(), 1);
        assert_eq!(orphans[0].id, task.id);
    }

    #[tokio::test]
    async fn tokens_used_since_sums_scoped_and_unscoped() {
        let q = queue(5).await;
        let a = q.enqueue(input("alpha")).await.unwrap();
        let b = q.enqueue(input("beta")).await.unwrap();
        q.update_tokens(&a.id, 100).await.unwrap();
        q.update_tokens(&b.id, 50).await.unwrap();

        assert_eq!(q.tokens_used_since(None, 0).await.unwrap(), 150);
        assert_eq!(q.tokens_used_since(Some("alpha"), 0).await.unwrap(), 100);
        assert_eq!(q.tokens_used_since(Some("alpha"), now_ms() + 10_000).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn fifo_within_project() {
        let q = queue(5).await;
        let first = q.enqueue(input("alpha")).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(2)).await;
        let _second = q.enqueue(input("alpha")).await.unwrap();

        let dequeued = q.dequeue_next().await.unwrap().unwrap();
        assert_eq!(dequeued.id, first.id);
    }
}
