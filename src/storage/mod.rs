//! Storage (component A) — embedded relational store.
//!
//! Grounded in examples/clawde-io-apps/daemon/src/storage/mod.rs: a single
//! `SqlitePool` opened in WAL mode, with schema applied as embedded
//! migration SQL executed statement-by-statement. Every other component
//! (queue, session store, approvals, audit log, uploads) borrows this pool
//! rather than opening its own connection.

use anyhow::Result;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqliteSynchronous};
use sqlx::SqlitePool;
use std::path::Path;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

/// Default timeout for individual SQLite queries — prevents a hung query
/// from blocking the engine loop indefinitely.
pub const QUERY_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(30);

pub(crate) async fn with_timeout<T>(
    fut: impl std::future::Future<Output = Result<T>>,
) -> Result<T> {
    match tokio::time::timeout(QUERY_TIMEOUT, fut).await {
        Ok(result) => result,
        Err(_) => Err(anyhow::anyhow!(
            "database query timed out after {}s",
            QUERY_TIMEOUT.as_secs()
        )),
    }
}

/// Current time in milliseconds since the Unix epoch.
pub fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

#[derive(Clone)]
pub struct Storage {
    pool: SqlitePool,
}

impl Storage {
    /// Open (creating if missing) `<dir>/<name>.db` with WAL journaling, and
    /// apply the embedded schema (spec §6 "Persisted state layout").
    pub async fn open(dir: &Path, name: &str) -> Result<Self> {
        tokio::fs::create_dir_all(dir).await?;
        let db_path = dir.join(format!("{name}.db"));
        let opts = SqliteConnectOptions::from_str(&format!("sqlite://{}?mode=rwc", db_path.display()))?
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .create_if_missing(true);

        let pool = SqlitePool::connect_with(opts).await?;
        Self::migrate(&pool).await?;
        Ok(Self { pool })
    }

    /// In-memory store for tests — isolated pool, no filesystem writes.
    #[cfg(any(test, feature = "test-util"))]
    pub async fn open_in_memory() -> Result<Self> {
        let opts = SqliteConnectOptions::from_str("sqlite::memory:")?;
        let pool = SqlitePool::connect_with(opts).await?;
        Self::migrate(&pool).await?;
        Ok(Self { pool })
    }

    /// Cheap clone of the pool for components that need direct query access
    /// (queue, session store, approvals, audit log, uploads).
    pub fn pool(&self) -> SqlitePool {
        self.pool.clone()
    }

    async fn migrate(pool: &SqlitePool) -> Result<()> {
        for sql in [include_str!("migrations/001_init.sql")] {
            for stmt in split_statements(sql) {
                sqlx::query(&stmt).execute(pool).await?;
            }
        }
        Ok(())
    }
}

/// Split a schema file into individual statements on `;`, except inside a
/// `BEGIN ... END` trigger body, whose own internal semicolons must not be
/// treated as statement boundaries. Plain `sql.split(';')` (the teacher's
/// migration runner) is only safe because none of the teacher's migrations
/// define triggers; this one does (the audit-log immutability guard), so the
/// splitter has to track `BEGIN`/`END` nesting itself.
fn split_statements(sql: &str) -> Vec<String> {
    let mut statements = Vec::new();
    let mut current = String::new();
    let mut begin_depth: usize = 0;

    for line in sql.lines() {
        current.push_str(line);
        current.push('\n');

        for word in line.split(|c: char| !c.is_alphanumeric() && c != '_') {
            match word.to_uppercase().as_str() {
                "BEGIN" => begin_depth += 1,
                "END" if begin_depth > 0 => begin_depth -= 1,
                _ => {}
            }
        }

        if begin_depth == 0 && current.trim_end().ends_with(';') {
            statements.push(current.trim().to_string());
            current.clear();
        }
    }

    let remainder = current.trim();
    if !remainder.is_empty() {
        statements.push(remainder.to_string());
    }
    statements
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_statements_keeps_trigger_body_intact() {
        let sql = "CREATE TABLE t (id INTEGER);\n\
                    CREATE TRIGGER IF NOT EXISTS t_no_update\n\
                    BEFORE UPDATE ON t\n\
                    BEGIN\n\
                    \tSELECT RAISE(ABORT, 'nope; still one statement');\n\
                    END;\n\
                    CREATE INDEX idx_t ON t(id);";
        let stmts = split_statements(sql);
        assert_eq!(stmts.len(), 3);
        assert!(stmts[1].contains("BEGIN"));
        assert!(stmts[1].trim_end().ends_with("END;"));
    }

    #[tokio::test]
    async fn opens_and_migrates_in_memory() {
        let storage = Storage::open_in_memory().await.unwrap();
        let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM tasks")
            .fetch_one(&storage.pool())
            .await
            .unwrap();
        assert_eq!(row.0, 0);
    }

    #[tokio::test]
    async fn audit_log_rejects_update_and_delete() {
        let storage = Storage::open_in_memory().await.unwrap();
        let pool = storage.pool();
        sqlx::query(
            "INSERT INTO audit_log (ts, actor, action, detail) VALUES (?, 'system', 'test', '{}')",
        )
        .bind(now_ms())
        .execute(&pool)
        .await
        .unwrap();

        let update = sqlx::query("UPDATE audit_log SET action = 'tampered' WHERE id = 1")
            .execute(&pool)
            .await;
        assert!(update.is_err(), "UPDATE on audit_log must be rejected");

        let delete = sqlx::query("DELETE FROM audit_log WHERE id = 1")
            .execute(&pool)
            .await;
        assert!(delete.is_err(), "DELETE on audit_log must be rejected");
    }

    #[tokio::test]
    async fn persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let storage = Storage::open(dir.path(), "engine").await.unwrap();
            sqlx::query("INSERT INTO tasks (id, project, project_path, prompt, thread_id, adapter, created_at) VALUES ('t1','alpha','/tmp','hi','th1','web', 0)")
                .execute(&storage.pool())
                .await
                .unwrap();
        }
        let storage = Storage::open(dir.path(), "engine").await.unwrap();
        let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM tasks")
            .fetch_one(&storage.pool())
            .await
            .unwrap();
        assert_eq!(row.0, 1);
    }
}
