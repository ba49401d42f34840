// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Version-control capability interface.
//!
//! The workspace manager only needs a handful of operations from the
//! repository tool. Implementations: [`super::GitWorktreeBackend`] for real
//! repositories and [`super::InMemoryVcs`] for tests and dry runs.

use std::path::{Path, PathBuf};

use async_trait::async_trait;

use crate::error::WorkspaceError;

/// An isolated working copy as reported by the repository tool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IsolatedWorkspace {
    pub path: PathBuf,
    /// Checked-out branch; `None` when detached.
    pub branch: Option<String>,
}

/// Operations on the shared repository.
///
/// Every operation names the repository root it acts on; implementations
/// keep no per-repository state.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait VersionControl: Send + Sync {
    /// Whether `repo_root` is a usable repository.
    async fn is_repository(&self, repo_root: &Path) -> bool;

    /// Create `target` checked out on `branch`, branching from `base_branch`
    /// when `branch` does not exist yet.
    async fn create_isolated_workspace(
        &self,
        repo_root: &Path,
        base_branch: &str,
        branch: &str,
        target: &Path,
    ) -> Result<(), WorkspaceError>;

    /// Remove the working copy at `path`. Without `force`, the tool may refuse
    /// to discard local modifications.
    async fn remove_isolated_workspace(
        &self,
        repo_root: &Path,
        path: &Path,
        force: bool,
    ) -> Result<(), WorkspaceError>;

    /// Whether `path` has uncommitted local modifications.
    async fn has_uncommitted_changes(&self, path: &Path) -> Result<bool, WorkspaceError>;

    /// Isolated working copies of `repo_root`, excluding the main checkout.
    async fn list_isolated_workspaces(&self, repo_root: &Path) -> Result<Vec<IsolatedWorkspace>, WorkspaceError>;

    /// Delete a local branch.
    async fn delete_branch(&self, repo_root: &Path, branch: &str) -> Result<(), WorkspaceError>;
}
