// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! In-memory version-control backend.
//!
//! Repository state (branches, worktrees, dirty flags) lives in memory.
//! Workspace directories are still created on disk so markers can be written
//! and reconciled; point the manager at a temporary directory.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use super::vcs::{IsolatedWorkspace, VersionControl};
use crate::error::WorkspaceError;

#[derive(Debug, Default)]
struct State {
    repositories: HashSet<PathBuf>,
    branches: BTreeSet<String>,
    worktrees: BTreeMap<PathBuf, String>,
    dirty: HashSet<PathBuf>,
    fail_create: HashSet<String>,
    create_calls: usize,
    remove_calls: usize,
}

/// Fake repository tool with failure and latency injection.
#[derive(Debug, Default)]
pub struct InMemoryVcs {
    state: Mutex<State>,
    create_delay: Mutex<Option<Duration>>,
    remove_delay: Mutex<Option<Duration>>,
}

impl InMemoryVcs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a backend that treats `repo_root` as a repository with `base_branch`.
    pub fn with_repository(repo_root: impl Into<PathBuf>, base_branch: &str) -> Self {
        let vcs = Self::new();
        {
            let mut state = vcs.state.lock();
            state.repositories.insert(repo_root.into());
            state.branches.insert(base_branch.to_string());
        }
        vcs
    }

    /// Mark a workspace as having (or not having) local modifications.
    pub fn set_dirty(&self, path: impl Into<PathBuf>, dirty: bool) {
        let path = path.into();
        let mut state = self.state.lock();
        if dirty {
            state.dirty.insert(path);
        } else {
            state.dirty.remove(&path);
        }
    }

    /// Make creation of `branch` fail.
    pub fn fail_create_for(&self, branch: impl Into<String>) {
        self.state.lock().fail_create.insert(branch.into());
    }

    pub fn clear_failures(&self) {
        self.state.lock().fail_create.clear();
    }

    pub fn set_create_delay(&self, delay: Option<Duration>) {
        *self.create_delay.lock() = delay;
    }

    pub fn set_remove_delay(&self, delay: Option<Duration>) {
        *self.remove_delay.lock() = delay;
    }

    pub fn branch_exists(&self, branch: &str) -> bool {
        self.state.lock().branches.contains(branch)
    }

    pub fn worktree_count(&self) -> usize {
        self.state.lock().worktrees.len()
    }

    pub fn create_calls(&self) -> usize {
        self.state.lock().create_calls
    }

    pub fn remove_calls(&self) -> usize {
        self.state.lock().remove_calls
    }
}

#[async_trait]
impl VersionControl for InMemoryVcs {
    async fn is_repository(&self, repo_root: &Path) -> bool {
        self.state.lock().repositories.contains(repo_root)
    }

    async fn create_isolated_workspace(
        &self,
        repo_root: &Path,
        base_branch: &str,
        branch: &str,
        target: &Path,
    ) -> Result<(), WorkspaceError> {
        let delay = *self.create_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        {
            let mut state = self.state.lock();
            state.create_calls += 1;
            if !state.repositories.contains(repo_root) {
                return Err(WorkspaceError::NotAVersionedRepository(repo_root.to_path_buf()));
            }
            if state.fail_create.contains(branch) {
                return Err(WorkspaceError::Vcs(format!("injected failure for {}", branch)));
            }
            if state.worktrees.contains_key(target) {
                return Err(WorkspaceError::Vcs(format!("{} already exists", target.display())));
            }
            if state.worktrees.values().any(|b| b == branch) {
                return Err(WorkspaceError::Vcs(format!("branch {} is already checked out", branch)));
            }
            if !state.branches.contains(branch) && !state.branches.contains(base_branch) {
                return Err(WorkspaceError::Vcs(format!("unknown base branch {}", base_branch)));
            }
            state.branches.insert(branch.to_string());
            state.worktrees.insert(target.to_path_buf(), branch.to_string());
        }

        tokio::fs::create_dir_all(target).await?;
        Ok(())
    }

    async fn remove_isolated_workspace(
        &self,
        _repo_root: &Path,
        path: &Path,
        force: bool,
    ) -> Result<(), WorkspaceError> {
        let delay = *self.remove_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        {
            let mut state = self.state.lock();
            state.remove_calls += 1;
            if !force && state.dirty.contains(path) {
                return Err(WorkspaceError::DirtyWorkspace(path.to_path_buf()));
            }
            state.worktrees.remove(path);
            state.dirty.remove(path);
        }

        if path.exists() {
            tokio::fs::remove_dir_all(path).await?;
        }
        Ok(())
    }

    async fn has_uncommitted_changes(&self, path: &Path) -> Result<bool, WorkspaceError> {
        Ok(self.state.lock().dirty.contains(path))
    }

    async fn list_isolated_workspaces(&self, _repo_root: &Path) -> Result<Vec<IsolatedWorkspace>, WorkspaceError> {
        Ok(self
            .state
            .lock()
            .worktrees
            .iter()
            .map(|(path, branch)| IsolatedWorkspace {
                path: path.clone(),
                branch: Some(branch.clone()),
            })
            .collect())
    }

    async fn delete_branch(&self, _repo_root: &Path, branch: &str) -> Result<(), WorkspaceError> {
        let mut state = self.state.lock();
        if state.worktrees.values().any(|b| b == branch) {
            return Err(WorkspaceError::Vcs(format!("branch {} is checked out", branch)));
        }
        state.branches.remove(branch);
        Ok(())
    }
}
