//! Upload References (component K) — opaque handles to validated,
//! sandboxed uploaded files (spec §3 "UploadRef", §6 "Upload rules").
//!
//! The write-then-canonicalize-then-verify sequence is the sandboxing
//! mechanism: nothing is trusted about the destination path until after
//! the bytes are on disk and `canonicalize` has resolved every symlink in
//! it (spec §5 "Uploads root is confined").

use crate::storage::now_ms;
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use std::path::{Path, PathBuf};
use uuid::Uuid;

pub const MAX_UPLOAD_BYTES: usize = 10 * 1024 * 1024;

const ALLOWED_MIME: &[&str] = &[
    "image/png",
    "image/jpeg",
    "image/gif",
    "image/webp",
    "text/plain",
    "text/markdown",
    "application/json",
    "text/csv",
];

#[derive(Debug, thiserror::Error)]
pub enum UploadError {
    #[error("upload exceeds the {MAX_UPLOAD_BYTES}-byte limit")]
    TooLarge,
    #[error("mime type '{0}' is not in the upload whitelist")]
    UnsupportedMime(String),
    #[error("file content signature does not match the declared mime type")]
    MimeMismatch,
    #[error("text content failed validation (embedded NUL or excessive control characters)")]
    InvalidTextContent,
    #[error("resolved upload path escapes the uploads root")]
    PathEscape,
    #[error("io error while writing upload: {0}")]
    Io(#[from] std::io::Error),
    #[error("storage error while recording upload: {0}")]
    Storage(#[from] sqlx::Error),
}

#[derive(Debug, Clone, sqlx::FromRow, Serialize, Deserialize)]
pub struct UploadRefRow {
    pub id: String,
    pub project: String,
    pub original_name: String,
    pub server_path: String,
    pub created_at: i64,
    pub expires_at: Option<i64>,
    pub consumed_at: Option<i64>,
}

/// What the client is allowed to see (spec §6: "client sees only `{id,
/// original_name}`").
#[derive(Debug, Clone, Serialize)]
pub struct UploadHandle {
    pub id: String,
    pub original_name: String,
}

impl From<&UploadRefRow> for UploadHandle {
    fn from(row: &UploadRefRow) -> Self {
        Self {
            id: row.id.clone(),
            original_name: row.original_name.clone(),
        }
    }
}

#[derive(Clone)]
pub struct UploadStore {
    pool: SqlitePool,
    uploads_root: PathBuf,
}

impl UploadStore {
    pub fn new(pool: SqlitePool, uploads_root: impl Into<PathBuf>) -> Self {
        Self {
            pool,
            uploads_root: uploads_root.into(),
        }
    }

    /// Validate, sandbox-write, and record an uploaded file. `scope_id` is
    /// typically the task or thread the upload is attached to.
    pub async fn save(
        &self,
        project: &str,
        scope_id: &str,
        original_name: &str,
        declared_mime: &str,
        bytes: &[u8],
    ) -> Result<UploadRefRow, UploadError> {
        if bytes.len() > MAX_UPLOAD_BYTES {
            return Err(UploadError::TooLarge);
        }
        if !ALLOWED_MIME.contains(&declared_mime) {
            return Err(UploadError::UnsupportedMime(declared_mime.to_string()));
        }
        if declared_mime.starts_with("image/") {
            if sniff_image_mime(bytes) != Some(declared_mime) {
                return Err(UploadError::MimeMismatch);
            }
        } else if !looks_like_text(bytes) {
            return Err(UploadError::InvalidTextContent);
        }

        tokio::fs::create_dir_all(&self.uploads_root).await?;
        let canonical_root = tokio::fs::canonicalize(&self.uploads_root).await?;

        let id = Uuid::new_v4().to_string();
        let ext = extension_for(declared_mime);
        let dest_dir = self.uploads_root.join(project).join(scope_id);
        tokio::fs::create_dir_all(&dest_dir).await?;
        let dest_path = dest_dir.join(format!("{id}.{ext}"));

        tokio::fs::write(&dest_path, bytes).await?;

        let canonical_dest = match tokio::fs::canonicalize(&dest_path).await {
            Ok(p) => p,
            Err(e) => {
                let _ = tokio::fs::remove_file(&dest_path).await;
                return Err(UploadError::Io(e));
            }
        };
        if !canonical_dest.starts_with(&canonical_root) {
            let _ = tokio::fs::remove_file(&dest_path).await;
            return Err(UploadError::PathEscape);
        }

        let now = now_ms();
        sqlx::query(
            "INSERT INTO upload_refs (id, project, original_name, server_path, created_at)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&id)
        .bind(project)
        .bind(original_name)
        .bind(canonical_dest.to_string_lossy().as_ref())
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(UploadRefRow {
            id,
            project: project.to_string(),
            original_name: original_name.to_string(),
            server_path: canonical_dest.to_string_lossy().into_owned(),
            created_at: now,
            expires_at: None,
            consumed_at: None,
        })
    }

    pub async fn resolve(&self, id: &str) -> Result<Option<UploadRefRow>, UploadError> {
        Ok(sqlx::query_as("SELECT * FROM upload_refs WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?)
    }

    pub async fn mark_consumed(&self, id: &str) -> Result<(), UploadError> {
        sqlx::query("UPDATE upload_refs SET consumed_at = ? WHERE id = ?")
            .bind(now_ms())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Remove every file and database row under `<root>/<project>/<scope_id>`.
    pub async fn cleanup_task_upload_dir(&self, project: &str, scope_id: &str) -> Result<(), UploadError> {
        let dir = self.uploads_root.join(project).join(scope_id);
        if dir.exists() {
            tokio::fs::remove_dir_all(&dir).await?;
        }
        sqlx::query("DELETE FROM upload_refs WHERE project = ? AND server_path LIKE ?")
            .bind(project)
            .bind(format!("%/{project}/{scope_id}/%"))
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

fn extension_for(mime: &str) -> &'static str {
    match mime {
        "image/png" => "png",
        "image/jpeg" => "jpg",
        "image/gif" => "gif",
        "image/webp" => "webp",
        "text/markdown" => "md",
        "application/json" => "json",
        "text/csv" => "csv",
        _ => "txt",
    }
}

fn sniff_image_mime(bytes: &[u8]) -> Option<&'static str> {
    if bytes.starts_with(&[0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A]) {
        Some("image/png")
    } else if bytes.starts_with(&[0xFF, 0xD8, 0xFF]) {
        Some("image/jpeg")
    } else if bytes.starts_with(b"GIF87a") || bytes.starts_with(b"GIF89a") {
        Some("image/gif")
    } else if bytes.len() >= 12 && &bytes[0..4] == b"RIFF" && &bytes[8..12] == b"WEBP" {
        Some("image/webp")
    } else {
        None
    }
}

/// Heuristic validation for the text-ish whitelist entries: no embedded
/// NUL, and at most 8 non-whitespace control-character outliers in the
/// first 4 KiB (spec §6: "no NUL, <8 control-char outliers in first 4
/// KiB").
fn looks_like_text(bytes: &[u8]) -> bool {
    let window = &bytes[..bytes.len().min(4096)];
    if window.contains(&0) {
        return false;
    }
    let outliers = window
        .iter()
        .filter(|&&b| b < 0x20 && b != b'\t' && b != b'\n' && b != b'\r')
        .count();
    outliers < 8
}

/// Used at load time to resolve the configured uploads root once (spec §6;
/// see [[uploads]] `UploadStore::new`).
pub fn canonical_uploads_root(path: &Path) -> std::io::Result<PathBuf> {
    std::fs::create_dir_all(path)?;
    std::fs::canonicalize(path)
}
