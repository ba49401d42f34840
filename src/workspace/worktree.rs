// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Git worktree backend.
//!
//! Each workspace is a `git worktree` on its own branch, in a sibling
//! directory of the main checkout by default.
//!
//! # Directory Structure
//!
//! ```text
//! /project/                   # Main repo
//! ├── .git/
//! └── src/
//!
//! /foreman-proj-12/           # Worktree for unit PROJ-12
//! ├── .git                    # Worktree link file
//! ├── .foreman-workspace      # Marker
//! └── src/
//! ```

use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info, warn};

use super::naming::MARKER_FILE;
use super::vcs::{IsolatedWorkspace, VersionControl};
use crate::error::WorkspaceError;

/// [`VersionControl`] over the `git` command line.
#[derive(Debug, Clone)]
pub struct GitWorktreeBackend {
    git: PathBuf,
}

impl Default for GitWorktreeBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl GitWorktreeBackend {
    pub fn new() -> Self {
        Self {
            git: PathBuf::from("git"),
        }
    }

    /// Use a specific git executable.
    pub fn with_git(mut self, git: impl Into<PathBuf>) -> Self {
        self.git = git.into();
        self
    }

    /// Run a git command in `cwd` and return trimmed stdout.
    async fn run(&self, cwd: &Path, args: &[&str]) -> Result<String, WorkspaceError> {
        let output = Command::new(&self.git)
            .args(args)
            .current_dir(cwd)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await?;

        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            Err(WorkspaceError::Vcs(format!(
                "git {} failed: {}",
                args.join(" "),
                stderr.trim()
            )))
        }
    }

    async fn branch_exists(&self, repo_root: &Path, branch: &str) -> bool {
        let reference = format!("refs/heads/{}", branch);
        self.run(repo_root, &["rev-parse", "--verify", "--quiet", &reference])
            .await
            .is_ok()
    }
}

/// Parse `git worktree list --porcelain`. The first entry is the main
/// checkout and is skipped.
pub fn parse_worktree_list(output: &str) -> Vec<IsolatedWorkspace> {
    let mut worktrees = Vec::new();
    let mut current: Option<IsolatedWorkspace> = None;

    for line in output.lines() {
        if let Some(path) = line.strip_prefix("worktree ") {
            worktrees.extend(current.take());
            current = Some(IsolatedWorkspace {
                path: PathBuf::from(path),
                branch: None,
            });
        } else if let Some(branch) = line.strip_prefix("branch refs/heads/") {
            if let Some(wt) = current.as_mut() {
                wt.branch = Some(branch.to_string());
            }
        }
    }
    worktrees.extend(current);

    worktrees.into_iter().skip(1).collect()
}

/// Whether `git status --porcelain` output shows local modifications,
/// ignoring the workspace marker.
pub fn porcelain_is_dirty(output: &str) -> bool {
    output
        .lines()
        .filter(|line| !line.trim().is_empty())
        .any(|line| line.get(3..).map(str::trim) != Some(MARKER_FILE))
}

#[async_trait]
impl VersionControl for GitWorktreeBackend {
    async fn is_repository(&self, repo_root: &Path) -> bool {
        if !repo_root.is_dir() {
            return false;
        }
        matches!(
            self.run(repo_root, &["rev-parse", "--is-inside-work-tree"]).await.as_deref(),
            Ok("true")
        )
    }

    async fn create_isolated_workspace(
        &self,
        repo_root: &Path,
        base_branch: &str,
        branch: &str,
        target: &Path,
    ) -> Result<(), WorkspaceError> {
        if target.exists() {
            return Err(WorkspaceError::Vcs(format!(
                "target directory already exists: {}",
                target.display()
            )));
        }

        let target_str = target.to_string_lossy().to_string();
        info!(branch, path = %target.display(), "Creating worktree");

        if self.branch_exists(repo_root, branch).await {
            self.run(repo_root, &["worktree", "add", &target_str, branch]).await?;
        } else {
            self.run(
                repo_root,
                &["worktree", "add", "-b", branch, &target_str, base_branch],
            )
            .await?;
        }

        debug!(branch, path = %target.display(), "Created worktree");
        Ok(())
    }

    async fn remove_isolated_workspace(
        &self,
        repo_root: &Path,
        path: &Path,
        force: bool,
    ) -> Result<(), WorkspaceError> {
        let path_str = path.to_string_lossy().to_string();
        let mut args = vec!["worktree", "remove"];
        if force {
            args.push("--force");
        }
        args.push(&path_str);

        match self.run(repo_root, &args).await {
            Ok(_) => Ok(()),
            Err(e) if force => {
                warn!(path = %path.display(), error = %e, "git worktree remove failed, removing directory");
                if path.exists() {
                    tokio::fs::remove_dir_all(path).await?;
                }
                let _ = self.run(repo_root, &["worktree", "prune"]).await;
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn has_uncommitted_changes(&self, path: &Path) -> Result<bool, WorkspaceError> {
        let output = self.run(path, &["status", "--porcelain"]).await?;
        Ok(porcelain_is_dirty(&output))
    }

    async fn list_isolated_workspaces(&self, repo_root: &Path) -> Result<Vec<IsolatedWorkspace>, WorkspaceError> {
        let output = self.run(repo_root, &["worktree", "list", "--porcelain"]).await?;
        Ok(parse_worktree_list(&output))
    }

    async fn delete_branch(&self, repo_root: &Path, branch: &str) -> Result<(), WorkspaceError> {
        self.run(repo_root, &["branch", "-D", branch]).await.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const PORCELAIN: &str = "worktree /src/project
HEAD 1111111111111111111111111111111111111111
branch refs/heads/main

worktree /src/foreman-api-1
HEAD 2222222222222222222222222222222222222222
branch refs/heads/work/api-1

worktree /src/detached
HEAD 3333333333333333333333333333333333333333
detached
";

    #[test]
    fn test_parse_worktree_list_skips_main() {
        let worktrees = parse_worktree_list(PORCELAIN);
        assert_eq!(
            worktrees,
            vec![
                IsolatedWorkspace {
                    path: PathBuf::from("/src/foreman-api-1"),
                    branch: Some("work/api-1".to_string()),
                },
                IsolatedWorkspace {
                    path: PathBuf::from("/src/detached"),
                    branch: None,
                },
            ]
        );
        assert!(parse_worktree_list("").is_empty());
    }

    #[test]
    fn test_porcelain_ignores_marker() {
        assert!(!porcelain_is_dirty(""));
        assert!(!porcelain_is_dirty("?? .foreman-workspace\n"));
        assert!(porcelain_is_dirty("?? .foreman-workspace\n M src/lib.rs\n"));
        assert!(porcelain_is_dirty("?? notes.txt"));
    }

    #[tokio::test]
    async fn test_plain_directory_is_not_a_repository() {
        let dir = tempdir().unwrap();
        let backend = GitWorktreeBackend::new();
        assert!(!backend.is_repository(dir.path()).await);
        assert!(!backend.is_repository(&dir.path().join("missing")).await);
    }
}
