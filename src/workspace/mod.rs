// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Workspace manager.
//!
//! Owns every isolated workspace of the repository: provisions one per unit,
//! tears it down when the unit leaves the held states, and answers
//! introspection queries for the monitor and tooling. It is the only
//! component that creates or removes workspace directories and branches.
//!
//! No lock is held while the version-control backend runs. Operations on the
//! same unit are serialized through an in-flight set; different units proceed
//! in parallel.

mod memory;
pub mod naming;
mod vcs;
mod worktree;

pub use memory::InMemoryVcs;
pub use naming::{sanitize_key, WorkspaceNaming, MARKER_FILE, MAX_NAME_LEN};
#[cfg(test)]
pub use vcs::MockVersionControl;
pub use vcs::{IsolatedWorkspace, VersionControl};
pub use worktree::{parse_worktree_list, porcelain_is_dirty, GitWorktreeBackend};

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, info, instrument, warn};

use crate::config::OrchestratorConfig;
use crate::error::WorkspaceError;
use crate::telemetry::metrics;
use crate::types::{UnitId, UnitOfWork, WorkspaceRef};

// ============================================================================
// Workspace entity
// ============================================================================

/// Lifecycle status of a workspace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkspaceStatus {
    Active,
    /// A teardown did not finish in time; the directory may still exist.
    Stale,
    Removed,
}

/// A workspace recorded by the manager.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Workspace {
    pub unit_id: UnitId,
    pub key: String,
    pub path: PathBuf,
    pub branch: String,
    pub created_at: DateTime<Utc>,
    pub status: WorkspaceStatus,
}

impl Workspace {
    pub fn to_ref(&self) -> WorkspaceRef {
        WorkspaceRef {
            path: self.path.clone(),
            branch: self.branch.clone(),
        }
    }

    /// Active or stale: the directory may exist on disk.
    pub fn is_live(&self) -> bool {
        self.status != WorkspaceStatus::Removed
    }
}

/// Contents of the marker file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkspaceMarker {
    pub unit_id: UnitId,
    pub key: String,
    pub branch: String,
    pub created_at: DateTime<Utc>,
}

/// Options for [`WorkspaceManager::teardown_with`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TeardownOptions {
    /// Remove even with uncommitted changes.
    pub force: bool,
    /// Also delete the workspace branch.
    pub delete_branch: bool,
}

/// What a teardown did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TeardownOutcome {
    Removed,
    /// Forced removal of a workspace with uncommitted changes.
    RemovedDiscardingChanges,
    /// Nothing recorded, or already removed.
    AlreadyRemoved,
}

impl TeardownOutcome {
    pub fn discarded_changes(&self) -> bool {
        matches!(self, Self::RemovedDiscardingChanges)
    }
}

// ============================================================================
// Manager
// ============================================================================

/// Removes a unit from the in-flight set when dropped.
struct InFlight<'a> {
    set: &'a Mutex<HashSet<UnitId>>,
    unit_id: UnitId,
}

impl<'a> InFlight<'a> {
    fn acquire(set: &'a Mutex<HashSet<UnitId>>, unit_id: &UnitId) -> Option<Self> {
        if !set.lock().insert(unit_id.clone()) {
            return None;
        }
        Some(Self {
            set,
            unit_id: unit_id.clone(),
        })
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.set.lock().remove(&self.unit_id);
    }
}

/// Provisions and tears down isolated workspaces for units of work.
pub struct WorkspaceManager {
    vcs: Arc<dyn VersionControl>,
    repo_root: PathBuf,
    base_branch: String,
    naming: WorkspaceNaming,
    teardown_timeout: Duration,
    workspaces: RwLock<HashMap<UnitId, Workspace>>,
    in_flight: Mutex<HashSet<UnitId>>,
}

impl WorkspaceManager {
    pub fn new(
        vcs: Arc<dyn VersionControl>,
        repo_root: impl Into<PathBuf>,
        base_branch: impl Into<String>,
        naming: WorkspaceNaming,
    ) -> Self {
        Self {
            vcs,
            repo_root: repo_root.into(),
            base_branch: base_branch.into(),
            naming,
            teardown_timeout: Duration::from_secs(120),
            workspaces: RwLock::new(HashMap::new()),
            in_flight: Mutex::new(HashSet::new()),
        }
    }

    pub fn from_config(vcs: Arc<dyn VersionControl>, config: &OrchestratorConfig) -> Self {
        Self::new(
            vcs,
            &config.repository.root,
            &config.repository.base_branch,
            WorkspaceNaming::from_config(&config.repository),
        )
        .with_teardown_timeout(config.workspace.teardown_timeout())
    }

    pub fn with_teardown_timeout(mut self, timeout: Duration) -> Self {
        self.teardown_timeout = timeout;
        self
    }

    pub fn repo_root(&self) -> &Path {
        &self.repo_root
    }

    pub fn base_branch(&self) -> &str {
        &self.base_branch
    }

    pub fn naming(&self) -> &WorkspaceNaming {
        &self.naming
    }

    /// Path and branch a unit's workspace will use.
    pub fn derive(&self, unit: &UnitOfWork) -> WorkspaceRef {
        self.naming.derive(&unit.key)
    }

    /// Create the workspace for `unit`.
    ///
    /// Fails with `AlreadyExists` when a live workspace is recorded for the
    /// unit or another operation on it is in flight, and with
    /// `NotAVersionedRepository` when the repository root is unusable.
    #[instrument(skip(self, unit), fields(unit_id = %unit.id, key = %unit.key))]
    pub async fn provision(&self, unit: &UnitOfWork) -> Result<Workspace, WorkspaceError> {
        let _guard = InFlight::acquire(&self.in_flight, &unit.id)
            .ok_or_else(|| WorkspaceError::AlreadyExists(unit.id.clone()))?;

        if self
            .workspaces
            .read()
            .await
            .get(&unit.id)
            .is_some_and(Workspace::is_live)
        {
            return Err(WorkspaceError::AlreadyExists(unit.id.clone()));
        }

        if !self.vcs.is_repository(&self.repo_root).await {
            return Err(WorkspaceError::NotAVersionedRepository(self.repo_root.clone()));
        }

        let derived = self.derive(unit);
        let started = Instant::now();
        self.vcs
            .create_isolated_workspace(&self.repo_root, &self.base_branch, &derived.branch, &derived.path)
            .await?;
        metrics::record_operation("provision", started.elapsed());

        let workspace = Workspace {
            unit_id: unit.id.clone(),
            key: unit.key.clone(),
            path: derived.path,
            branch: derived.branch,
            created_at: Utc::now(),
            status: WorkspaceStatus::Active,
        };
        if let Err(e) = write_marker(&workspace).await {
            warn!(path = %workspace.path.display(), error = %e, "Could not write workspace marker");
        }

        self.workspaces
            .write()
            .await
            .insert(unit.id.clone(), workspace.clone());
        info!(path = %workspace.path.display(), branch = %workspace.branch, "Provisioned workspace");
        Ok(workspace)
    }

    /// Tear down the workspace of `unit_id`, keeping its branch.
    pub async fn teardown(&self, unit_id: &UnitId, force: bool) -> Result<TeardownOutcome, WorkspaceError> {
        self.teardown_with(
            unit_id,
            TeardownOptions {
                force,
                delete_branch: false,
            },
        )
        .await
    }

    /// Tear down the workspace of `unit_id`.
    ///
    /// Without `force`, a workspace with uncommitted changes is left active
    /// and `DirtyWorkspace` is returned. Removing an unknown or already
    /// removed workspace succeeds without touching the repository. A removal
    /// that exceeds the teardown timeout marks the workspace stale and
    /// returns `TeardownTimedOut`.
    #[instrument(skip(self), fields(unit_id = %unit_id))]
    pub async fn teardown_with(
        &self,
        unit_id: &UnitId,
        options: TeardownOptions,
    ) -> Result<TeardownOutcome, WorkspaceError> {
        let _guard = InFlight::acquire(&self.in_flight, unit_id)
            .ok_or_else(|| WorkspaceError::Busy(unit_id.clone()))?;

        let workspace = match self.workspaces.read().await.get(unit_id) {
            Some(ws) if ws.is_live() => ws.clone(),
            _ => {
                debug!("No live workspace, teardown is a no-op");
                return Ok(TeardownOutcome::AlreadyRemoved);
            }
        };

        let dirty = match self.vcs.has_uncommitted_changes(&workspace.path).await {
            Ok(dirty) => dirty,
            Err(e) if options.force => {
                warn!(path = %workspace.path.display(), error = %e, "Could not inspect workspace before forced removal");
                false
            }
            Err(e) => return Err(e),
        };
        if dirty && !options.force {
            return Err(WorkspaceError::DirtyWorkspace(workspace.path.clone()));
        }
        if dirty {
            warn!(
                path = %workspace.path.display(),
                branch = %workspace.branch,
                "Forcing removal of workspace with uncommitted changes; local work may be discarded"
            );
        }

        let started = Instant::now();
        let removal = self
            .vcs
            .remove_isolated_workspace(&self.repo_root, &workspace.path, options.force);
        match tokio::time::timeout(self.teardown_timeout, removal).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(e),
            Err(_) => {
                self.set_status(unit_id, WorkspaceStatus::Stale).await;
                warn!(path = %workspace.path.display(), "Workspace teardown timed out");
                return Err(WorkspaceError::TeardownTimedOut {
                    path: workspace.path.clone(),
                    seconds: self.teardown_timeout.as_secs(),
                });
            }
        }
        metrics::record_operation("teardown", started.elapsed());
        self.set_status(unit_id, WorkspaceStatus::Removed).await;

        if options.delete_branch {
            if let Err(e) = self.vcs.delete_branch(&self.repo_root, &workspace.branch).await {
                warn!(branch = %workspace.branch, error = %e, "Could not delete workspace branch");
            }
        }

        info!(path = %workspace.path.display(), "Removed workspace");
        Ok(if dirty {
            TeardownOutcome::RemovedDiscardingChanges
        } else {
            TeardownOutcome::Removed
        })
    }

    async fn set_status(&self, unit_id: &UnitId, status: WorkspaceStatus) {
        if let Some(ws) = self.workspaces.write().await.get_mut(unit_id) {
            ws.status = status;
        }
    }

    /// Whether the live workspace of `unit_id` has uncommitted changes.
    pub async fn is_dirty(&self, unit_id: &UnitId) -> Result<bool, WorkspaceError> {
        let path = self
            .get(unit_id)
            .await
            .filter(Workspace::is_live)
            .map(|ws| ws.path)
            .ok_or_else(|| WorkspaceError::NotFound(unit_id.clone()))?;
        self.vcs.has_uncommitted_changes(&path).await
    }

    pub async fn get(&self, unit_id: &UnitId) -> Option<Workspace> {
        self.workspaces.read().await.get(unit_id).cloned()
    }

    pub async fn status(&self, unit_id: &UnitId) -> Option<WorkspaceStatus> {
        self.workspaces.read().await.get(unit_id).map(|ws| ws.status)
    }

    /// Active workspaces, sorted by unit.
    pub async fn list_active(&self) -> Vec<Workspace> {
        self.list_where(|ws| ws.status == WorkspaceStatus::Active).await
    }

    /// Active and stale workspaces, sorted by unit.
    pub async fn list_live(&self) -> Vec<Workspace> {
        self.list_where(Workspace::is_live).await
    }

    async fn list_where(&self, keep: impl Fn(&Workspace) -> bool) -> Vec<Workspace> {
        let mut list: Vec<Workspace> = self
            .workspaces
            .read()
            .await
            .values()
            .filter(|ws| keep(ws))
            .cloned()
            .collect();
        list.sort_by(|a, b| a.unit_id.cmp(&b.unit_id));
        list
    }

    pub async fn active_count(&self) -> usize {
        self.workspaces
            .read()
            .await
            .values()
            .filter(|ws| ws.status == WorkspaceStatus::Active)
            .count()
    }

    /// Isolated workspaces the repository tool reports, tracked or not.
    pub async fn list_repository(&self) -> Result<Vec<IsolatedWorkspace>, WorkspaceError> {
        self.vcs.list_isolated_workspaces(&self.repo_root).await
    }

    /// Rebuild the registry from workspaces that carry a marker.
    ///
    /// Returns the number of workspaces adopted. Working copies without a
    /// readable marker were not created by this manager and are left alone.
    #[instrument(skip(self))]
    pub async fn adopt_existing(&self) -> Result<usize, WorkspaceError> {
        let found = self.vcs.list_isolated_workspaces(&self.repo_root).await?;
        let mut adopted = 0;
        for isolated in found {
            let marker = match read_marker(&isolated.path).await {
                Some(marker) => marker,
                None => continue,
            };
            let mut workspaces = self.workspaces.write().await;
            if workspaces.get(&marker.unit_id).is_some_and(Workspace::is_live) {
                continue;
            }
            debug!(unit_id = %marker.unit_id, path = %isolated.path.display(), "Adopting workspace");
            workspaces.insert(
                marker.unit_id.clone(),
                Workspace {
                    unit_id: marker.unit_id,
                    key: marker.key,
                    path: isolated.path,
                    branch: marker.branch,
                    created_at: marker.created_at,
                    status: WorkspaceStatus::Active,
                },
            );
            adopted += 1;
        }
        if adopted > 0 {
            info!(adopted, "Adopted existing workspaces");
        }
        Ok(adopted)
    }
}

async fn write_marker(workspace: &Workspace) -> Result<(), WorkspaceError> {
    let marker = WorkspaceMarker {
        unit_id: workspace.unit_id.clone(),
        key: workspace.key.clone(),
        branch: workspace.branch.clone(),
        created_at: workspace.created_at,
    };
    let content = serde_json::to_string_pretty(&marker)
        .map_err(|e| WorkspaceError::Vcs(format!("marker serialization failed: {}", e)))?;
    tokio::fs::write(workspace.path.join(MARKER_FILE), content).await?;
    Ok(())
}

async fn read_marker(dir: &Path) -> Option<WorkspaceMarker> {
    let content = tokio::fs::read_to_string(dir.join(MARKER_FILE)).await.ok()?;
    serde_json::from_str(&content).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockall::predicate::{always, eq};
    use tempfile::{tempdir, TempDir};

    struct Fixture {
        _dir: TempDir,
        root: PathBuf,
        vcs: Arc<InMemoryVcs>,
        manager: WorkspaceManager,
    }

    fn fixture() -> Fixture {
        let dir = tempdir().unwrap();
        let root = dir.path().join("repo");
        std::fs::create_dir_all(&root).unwrap();
        let vcs = Arc::new(InMemoryVcs::with_repository(&root, "main"));
        let naming = WorkspaceNaming::new(dir.path(), "foreman-", "work");
        let manager = WorkspaceManager::new(vcs.clone(), &root, "main", naming);
        Fixture {
            _dir: dir,
            root,
            vcs,
            manager,
        }
    }

    fn unit(id: &str, key: &str) -> UnitOfWork {
        UnitOfWork::new(id, key)
    }

    #[tokio::test]
    async fn test_provision_records_active_workspace() {
        let fx = fixture();
        let ws = fx.manager.provision(&unit("u1", "api-1")).await.unwrap();

        assert_eq!(ws.branch, "work/api-1");
        assert!(ws.path.ends_with("foreman-api-1"));
        assert!(ws.path.join(MARKER_FILE).is_file());
        assert_eq!(fx.manager.status(&UnitId::from("u1")).await, Some(WorkspaceStatus::Active));
        assert_eq!(fx.manager.active_count().await, 1);
    }

    #[tokio::test]
    async fn test_provision_twice_is_already_exists() {
        let fx = fixture();
        fx.manager.provision(&unit("u1", "api-1")).await.unwrap();
        let err = fx.manager.provision(&unit("u1", "api-1")).await.unwrap_err();
        assert!(matches!(err, WorkspaceError::AlreadyExists(_)));
        assert_eq!(fx.vcs.create_calls(), 1);
    }

    #[tokio::test]
    async fn test_provision_rejects_non_repository() {
        let dir = tempdir().unwrap();
        let vcs = Arc::new(InMemoryVcs::new());
        let manager = WorkspaceManager::new(vcs, dir.path(), "main", WorkspaceNaming::new(dir.path(), "", "work"));
        let err = manager.provision(&unit("u1", "a")).await.unwrap_err();
        assert!(matches!(err, WorkspaceError::NotAVersionedRepository(_)));
    }

    #[tokio::test]
    async fn test_dirty_teardown_requires_force() {
        let fx = fixture();
        let ws = fx.manager.provision(&unit("u1", "api-1")).await.unwrap();
        fx.vcs.set_dirty(&ws.path, true);
        let id = UnitId::from("u1");

        let err = fx.manager.teardown(&id, false).await.unwrap_err();
        assert!(err.is_dirty());
        assert_eq!(fx.manager.status(&id).await, Some(WorkspaceStatus::Active));
        assert!(ws.path.exists());

        let outcome = fx.manager.teardown(&id, true).await.unwrap();
        assert!(outcome.discarded_changes());
        assert_eq!(fx.manager.status(&id).await, Some(WorkspaceStatus::Removed));
        assert!(!ws.path.exists());
    }

    #[tokio::test]
    async fn test_teardown_is_idempotent() {
        let fx = fixture();
        fx.manager.provision(&unit("u1", "api-1")).await.unwrap();
        let id = UnitId::from("u1");

        assert_eq!(fx.manager.teardown(&id, false).await.unwrap(), TeardownOutcome::Removed);
        assert_eq!(fx.manager.teardown(&id, false).await.unwrap(), TeardownOutcome::AlreadyRemoved);
        assert_eq!(fx.manager.teardown(&id, true).await.unwrap(), TeardownOutcome::AlreadyRemoved);
        assert_eq!(fx.vcs.remove_calls(), 1);
        assert_eq!(
            fx.manager.teardown(&UnitId::from("never"), false).await.unwrap(),
            TeardownOutcome::AlreadyRemoved
        );
    }

    #[tokio::test]
    async fn test_reprovision_after_teardown() {
        let fx = fixture();
        let u = unit("u1", "api-1");
        fx.manager.provision(&u).await.unwrap();
        fx.manager.teardown(&u.id, false).await.unwrap();
        fx.manager.provision(&u).await.unwrap();
        assert_eq!(fx.manager.status(&u.id).await, Some(WorkspaceStatus::Active));
    }

    #[tokio::test]
    async fn test_teardown_deletes_branch_on_request() {
        let fx = fixture();
        let u = unit("u1", "api-1");
        fx.manager.provision(&u).await.unwrap();
        fx.manager
            .teardown_with(
                &u.id,
                TeardownOptions {
                    force: false,
                    delete_branch: true,
                },
            )
            .await
            .unwrap();
        assert!(!fx.vcs.branch_exists("work/api-1"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_teardown_timeout_marks_stale() {
        let fx = fixture();
        let manager = WorkspaceManager::new(
            fx.vcs.clone(),
            &fx.root,
            "main",
            fx.manager.naming().clone(),
        )
        .with_teardown_timeout(Duration::from_secs(5));
        let u = unit("u1", "api-1");
        manager.provision(&u).await.unwrap();
        fx.vcs.set_remove_delay(Some(Duration::from_secs(60)));

        let err = manager.teardown(&u.id, true).await.unwrap_err();
        assert!(matches!(err, WorkspaceError::TeardownTimedOut { seconds: 5, .. }));
        assert_eq!(manager.status(&u.id).await, Some(WorkspaceStatus::Stale));
        assert_eq!(manager.list_live().await.len(), 1);
        assert!(manager.list_active().await.is_empty());
    }

    #[tokio::test]
    async fn test_adopt_existing_from_markers() {
        let fx = fixture();
        fx.manager.provision(&unit("u1", "api-1")).await.unwrap();
        fx.manager.provision(&unit("u2", "api-2")).await.unwrap();

        let fresh = WorkspaceManager::new(
            fx.vcs.clone(),
            &fx.root,
            "main",
            fx.manager.naming().clone(),
        );
        assert_eq!(fresh.adopt_existing().await.unwrap(), 2);
        assert_eq!(fresh.list_active().await.len(), 2);
        assert_eq!(fresh.adopt_existing().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_provision_failure_leaves_no_record() {
        let fx = fixture();
        fx.vcs.fail_create_for("work/api-1");
        let err = fx.manager.provision(&unit("u1", "api-1")).await.unwrap_err();
        assert!(matches!(err, WorkspaceError::Vcs(_)));
        assert!(fx.manager.get(&UnitId::from("u1")).await.is_none());
    }

    #[tokio::test]
    async fn test_vcs_call_sequence_with_mock() {
        let dir = tempdir().unwrap();
        let root = dir.path().join("repo");
        let target = dir.path().join("ws-mock-1");

        let mut mock = MockVersionControl::new();
        mock.expect_is_repository().times(1).returning(|_| true);
        let created = target.clone();
        mock.expect_create_isolated_workspace()
            .with(always(), eq("main"), eq("work/mock-1"), eq(target.clone()))
            .times(1)
            .returning(move |_, _, _, _| {
                std::fs::create_dir_all(&created).unwrap();
                Ok(())
            });
        mock.expect_has_uncommitted_changes().times(1).returning(|_| Ok(false));
        mock.expect_remove_isolated_workspace()
            .with(always(), eq(target.clone()), eq(false))
            .times(1)
            .returning(|_, _, _| Ok(()));
        mock.expect_delete_branch().never();

        let naming = WorkspaceNaming::new(dir.path(), "ws-", "work");
        let manager = WorkspaceManager::new(Arc::new(mock), &root, "main", naming);
        let u = unit("u1", "mock-1");
        manager.provision(&u).await.unwrap();
        manager.teardown(&u.id, false).await.unwrap();
    }
}
