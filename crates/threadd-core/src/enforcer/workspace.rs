//! Workspace probing for change detection

use std::path::Path;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::trace;

use crate::error::{CoreError, Result};
use crate::types::WorkspaceSnapshot;

/// Live state of a working copy
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkspaceState {
    pub snapshot: WorkspaceSnapshot,
    pub branch: Option<String>,
    pub has_upstream: bool,
}

impl WorkspaceState {
    /// Pushed feature branch: not main/master and tracking a remote
    pub fn is_pushed_feature_branch(&self) -> bool {
        match self.branch.as_deref() {
            Some("main") | Some("master") | Some("HEAD") | None => false,
            Some(_) => self.has_upstream,
        }
    }
}

#[async_trait]
pub trait WorkspaceProbe: Send + Sync {
    async fn inspect(&self, path: &Path) -> Result<WorkspaceState>;
}

/// Probe backed by the `git` CLI
#[derive(Debug, Clone, Default)]
pub struct GitProbe;

impl GitProbe {
    async fn git(&self, path: &Path, args: &[&str]) -> Result<Option<String>> {
        let output = Command::new("git")
            .arg("-C")
            .arg(path)
            .args(args)
            .output()
            .await
            .map_err(|e| CoreError::Upstream(format!("failed to run git: {}", e)))?;
        trace!(path = %path.display(), ?args, status = ?output.status, "git");
        if !output.status.success() {
            return Ok(None);
        }
        Ok(Some(String::from_utf8_lossy(&output.stdout).trim().to_string()))
    }
}

#[async_trait]
impl WorkspaceProbe for GitProbe {
    async fn inspect(&self, path: &Path) -> Result<WorkspaceState> {
        if !path.exists() {
            return Err(CoreError::Upstream(format!(
                "workspace {} does not exist",
                path.display()
            )));
        }

        let head_commit = self.git(path, &["rev-parse", "HEAD"]).await?;
        let status = self
            .git(path, &["status", "--porcelain"])
            .await?
            .ok_or_else(|| {
                CoreError::Upstream(format!("{} is not a git work tree", path.display()))
            })?;
        let dirty_files = status.lines().filter(|l| !l.trim().is_empty()).count() as i64;
        let branch = self.git(path, &["rev-parse", "--abbrev-ref", "HEAD"]).await?;
        let has_upstream = self
            .git(
                path,
                &["rev-parse", "--abbrev-ref", "--symbolic-full-name", "@{u}"],
            )
            .await?
            .is_some();

        Ok(WorkspaceState {
            snapshot: WorkspaceSnapshot {
                head_commit,
                dirty_files,
            },
            branch,
            has_upstream,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pushed_feature_branch() {
        let mut state = WorkspaceState {
            branch: Some("fix/login".to_string()),
            has_upstream: true,
            ..Default::default()
        };
        assert!(state.is_pushed_feature_branch());

        state.has_upstream = false;
        assert!(!state.is_pushed_feature_branch());

        state.has_upstream = true;
        state.branch = Some("main".to_string());
        assert!(!state.is_pushed_feature_branch());
        state.branch = Some("master".to_string());
        assert!(!state.is_pushed_feature_branch());
    }

    #[tokio::test]
    async fn test_missing_workspace_is_upstream_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = GitProbe
            .inspect(&dir.path().join("absent"))
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::Upstream(_)));
    }
}
