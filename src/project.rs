//! Static project configuration (spec §3 "Project").
//!
//! Projects are loaded once at startup from external configuration (out of
//! scope here, per spec §1) and held in memory for the lifetime of the
//! engine. This module only owns the type and the load-time validation
//! invariant: `skip_permissions` requires a non-empty reason.

use anyhow::{bail, Result};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone)]
pub struct Project {
    pub alias: String,
    /// Canonical real path, resolved once at load time (spec §3: "symlink
    /// equality is enforced at load").
    pub path: PathBuf,
    pub token_budget: i64,
    pub timeout_ms: u64,
    pub skip_permissions: bool,
    pub skip_permissions_reason: Option<String>,
}

impl Project {
    /// Construct and validate a project entry. `path` must already exist as
    /// a real directory; it is canonicalized here and that canonical form
    /// is what the supervisor re-checks before every spawn (spec §4.3).
    pub fn new(
        alias: impl Into<String>,
        path: impl AsRef<Path>,
        token_budget: i64,
        timeout_ms: u64,
        skip_permissions: bool,
        skip_permissions_reason: Option<String>,
    ) -> Result<Self> {
        if token_budget <= 0 {
            bail!("project token_budget must be a positive integer");
        }
        if timeout_ms == 0 {
            bail!("project timeout must be a positive number of milliseconds");
        }
        if skip_permissions {
            match &skip_permissions_reason {
                Some(r) if !r.trim().is_empty() => {}
                _ => bail!(
                    "project has skip_permissions=true but no non-empty skip_permissions_reason"
                ),
            }
        }

        let canonical = std::fs::canonicalize(path.as_ref()).map_err(|e| {
            anyhow::anyhow!(
                "project path {} does not exist or is not accessible: {e}",
                path.as_ref().display()
            )
        })?;
        if !canonical.is_dir() {
            bail!("project path {} is not a directory", canonical.display());
        }

        Ok(Self {
            alias: alias.into(),
            path: canonical,
            token_budget,
            timeout_ms,
            skip_permissions,
            skip_permissions_reason,
        })
    }
}

/// In-memory registry of configured projects, keyed by alias.
#[derive(Debug, Default, Clone)]
pub struct ProjectRegistry {
    projects: std::collections::HashMap<String, Project>,
}

impl ProjectRegistry {
    pub fn new(projects: Vec<Project>) -> Self {
        Self {
            projects: projects.into_iter().map(|p| (p.alias.clone(), p)).collect(),
        }
    }

    pub fn get(&self, alias: &str) -> Option<&Project> {
        self.projects.get(alias)
    }

    pub fn all(&self) -> impl Iterator<Item = &Project> {
        self.projects.values()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_skip_permissions_without_reason() {
        let dir = tempfile::tempdir().unwrap();
        let err = Project::new("p", dir.path(), 1000, 1000, true, None).unwrap_err();
        assert!(err.to_string().contains("skip_permissions_reason"));
    }

    #[test]
    fn rejects_skip_permissions_with_blank_reason() {
        let dir = tempfile::tempdir().unwrap();
        let err =
            Project::new("p", dir.path(), 1000, 1000, true, Some("   ".into())).unwrap_err();
        assert!(err.to_string().contains("skip_permissions_reason"));
    }

    #[test]
    fn accepts_skip_permissions_with_reason() {
        let dir = tempfile::tempdir().unwrap();
        let p = Project::new(
            "p",
            dir.path(),
            1000,
            1000,
            true,
            Some("operator-approved sandbox".into()),
        )
        .unwrap();
        assert!(p.skip_permissions);
    }

    #[test]
    fn rejects_nonexistent_path() {
        let err = Project::new("p", "/nonexistent/path/xyz", 1000, 1000, false, None).unwrap_err();
        assert!(err.to_string().contains("does not exist"));
    }

    #[test]
    fn rejects_nonpositive_budget() {
        let dir = tempfile::tempdir().unwrap();
        assert!(Project::new("p", dir.path(), 0, 1000, false, None).is_err());
    }
}
