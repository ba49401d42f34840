// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Progress monitor.
//!
//! Runs on a fixed interval, independent of agent traffic. Each pass:
//!
//! 1. flags held assignments with no activity past the inactivity threshold
//!    and, under `auto_reclaim`, releases them
//! 2. escalates assignments older than the maximum lifetime
//! 3. tears down live workspaces no held unit owns
//! 4. audits the binding invariants
//! 5. deregisters agents that went silent
//!
//! The scan itself only reads coordinator snapshots; locks are taken by the
//! coordinator operations it calls for reclamation.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, error, info, instrument, warn};

use crate::config::{MonitorConfig, ReclaimPolicy};
use crate::coordinator::{AssignmentCoordinator, OrchestratorEvent, Severity};
use crate::error::{OrchestrationError, WorkspaceError};
use crate::guardrails::LifetimeGuard;
use crate::telemetry::metrics::{self, Counter};
use crate::types::{AgentId, ReleaseReason, UnitId};
use crate::workspace::TeardownOutcome;

/// A stale assignment found by a scan.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StaleFinding {
    pub unit_id: UnitId,
    pub agent_id: AgentId,
    /// Seconds since the last observed activity.
    pub idle_secs: i64,
    pub dirty: bool,
    pub reclaimed: bool,
}

/// What one monitor pass found and did.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ScanReport {
    pub scanned: usize,
    pub stale: Vec<StaleFinding>,
    pub lifetime_exceeded: Vec<UnitId>,
    pub orphans_removed: Vec<PathBuf>,
    pub invariant_violations: Vec<String>,
    pub agents_deregistered: Vec<AgentId>,
}

impl ScanReport {
    /// Whether the pass found nothing to act on.
    pub fn is_clean(&self) -> bool {
        self.stale.is_empty()
            && self.lifetime_exceeded.is_empty()
            && self.orphans_removed.is_empty()
            && self.invariant_violations.is_empty()
            && self.agents_deregistered.is_empty()
    }

    pub fn reclaimed(&self) -> usize {
        self.stale.iter().filter(|s| s.reclaimed).count()
    }
}

/// Periodic staleness, orphan and invariant scanner.
pub struct ProgressMonitor {
    coordinator: Arc<AssignmentCoordinator>,
    config: MonitorConfig,
    lifetime: LifetimeGuard,
}

impl ProgressMonitor {
    pub fn new(coordinator: Arc<AssignmentCoordinator>) -> Self {
        let config = coordinator.config().monitor.clone();
        Self::with_config(coordinator, config)
    }

    pub fn with_config(coordinator: Arc<AssignmentCoordinator>, config: MonitorConfig) -> Self {
        Self {
            lifetime: LifetimeGuard {
                max: config.max_assignment_lifetime(),
            },
            coordinator,
            config,
        }
    }

    pub fn config(&self) -> &MonitorConfig {
        &self.config
    }

    /// Scan until `shutdown` turns true or its sender goes away.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.config.scan_interval());
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!(interval_secs = self.config.scan_interval_secs, "Progress monitor started");

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let report = self.scan_at(Utc::now()).await;
                    if !report.is_clean() {
                        info!(
                            stale = report.stale.len(),
                            reclaimed = report.reclaimed(),
                            orphans = report.orphans_removed.len(),
                            violations = report.invariant_violations.len(),
                            "Monitor pass acted"
                        );
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("Progress monitor stopped");
    }

    /// One deterministic pass as of `now`.
    #[instrument(skip(self))]
    pub async fn scan_at(&self, now: DateTime<Utc>) -> ScanReport {
        let started = Instant::now();
        let mut report = ScanReport::default();

        self.scan_assignments(now, &mut report).await;
        self.reclaim_orphans(&mut report).await;
        self.audit(&mut report).await;
        self.deregister_silent(now, &mut report).await;

        metrics::record_operation("scan", started.elapsed());
        debug!(scanned = report.scanned, "Monitor pass finished");
        report
    }

    async fn scan_assignments(&self, now: DateTime<Utc>, report: &mut ScanReport) {
        let threshold = self.config.inactivity_threshold();
        let records = self.coordinator.assignments();
        report.scanned = records.len();

        for record in records {
            if self.lifetime.exceeded(&record, now) {
                let age = record.age(now).num_seconds();
                self.coordinator.escalate(
                    Some(record.unit_id.clone()),
                    Severity::Critical,
                    format!(
                        "assignment held by {} for {}s, past the {}s lifetime",
                        record.agent_id, age, self.config.max_assignment_lifetime_secs
                    ),
                );
                report.lifetime_exceeded.push(record.unit_id.clone());
            }

            let idle = record.idle_for(now);
            if idle <= threshold {
                continue;
            }

            let stale = OrchestrationError::StaleAssignment {
                unit_id: record.unit_id.clone(),
                idle_secs: idle.num_seconds(),
            };
            metrics::incr(Counter::StaleDetections);
            warn!(agent_id = %record.agent_id, "{}", stale);
            self.coordinator.emit(OrchestratorEvent::StaleWorkDetected {
                unit_id: record.unit_id.clone(),
                agent_id: record.agent_id.clone(),
                elapsed: idle.num_seconds(),
            });

            let dirty = match self.coordinator.workspaces().is_dirty(&record.unit_id).await {
                Ok(dirty) => dirty,
                Err(e) => {
                    debug!(unit_id = %record.unit_id, error = %e, "Could not inspect workspace");
                    false
                }
            };

            let mut finding = StaleFinding {
                unit_id: record.unit_id.clone(),
                agent_id: record.agent_id.clone(),
                idle_secs: idle.num_seconds(),
                dirty,
                reclaimed: false,
            };

            match self.config.policy {
                ReclaimPolicy::AutoReclaim => {
                    match self.coordinator.reclaim(&record.unit_id, ReleaseReason::Stale).await {
                        Ok(released) => {
                            finding.reclaimed = true;
                            if dirty || released.discarded_changes {
                                finding.dirty = true;
                                self.coordinator.escalate(
                                    Some(record.unit_id.clone()),
                                    Severity::Critical,
                                    format!(
                                        "reclaimed stale work from {}, uncommitted changes discarded",
                                        record.agent_id
                                    ),
                                );
                            }
                        }
                        // Completed or released since the snapshot.
                        Err(OrchestrationError::InvalidTransition { .. }) => {}
                        Err(e) => {
                            warn!(unit_id = %record.unit_id, error = %e, "Could not reclaim stale work");
                        }
                    }
                }
                ReclaimPolicy::AlertOnly => {
                    if dirty {
                        self.coordinator.escalate(
                            Some(record.unit_id.clone()),
                            Severity::Critical,
                            format!("stale work held by {} has uncommitted changes", record.agent_id),
                        );
                    }
                }
            }
            report.stale.push(finding);
        }
    }

    /// Tear down live workspaces whose unit is not held.
    ///
    /// Workspaces are listed before units are read: a workspace is recorded
    /// only after its unit was reserved, so a workspace provisioned during
    /// the pass is either missing from the list or owned in the snapshot.
    async fn reclaim_orphans(&self, report: &mut ScanReport) {
        let workspaces = self.coordinator.workspaces();
        let live = workspaces.list_live().await;
        let held: HashMap<UnitId, PathBuf> = self
            .coordinator
            .units()
            .into_iter()
            .filter(|u| u.status.is_held())
            .filter_map(|u| u.workspace.map(|ws| (u.id, ws.path)))
            .collect();

        for workspace in live {
            if let Some(expected) = held.get(&workspace.unit_id) {
                if !same_location(expected, &workspace.path).await {
                    warn!(
                        unit_id = %workspace.unit_id,
                        expected = %expected.display(),
                        path = %workspace.path.display(),
                        "Held unit's workspace is recorded at another path"
                    );
                }
                continue;
            }
            warn!(
                unit_id = %workspace.unit_id,
                path = %workspace.path.display(),
                status = ?workspace.status,
                "Reclaiming orphaned workspace"
            );
            match workspaces.teardown(&workspace.unit_id, true).await {
                // Released and torn down since the listing.
                Ok(TeardownOutcome::AlreadyRemoved) => {}
                Ok(outcome) => {
                    metrics::incr(Counter::OrphansReclaimed);
                    if outcome.discarded_changes() {
                        self.coordinator.escalate(
                            Some(workspace.unit_id.clone()),
                            Severity::Critical,
                            format!("orphaned workspace {} had uncommitted changes", workspace.path.display()),
                        );
                    }
                    report.orphans_removed.push(workspace.path);
                }
                Err(WorkspaceError::Busy(_)) => {
                    debug!(unit_id = %workspace.unit_id, "Workspace busy, leaving for the next pass");
                }
                Err(e) => {
                    self.coordinator.escalate(
                        Some(workspace.unit_id.clone()),
                        Severity::Critical,
                        format!("could not remove orphaned workspace: {}", e),
                    );
                }
            }
        }
    }

    /// Report violations seen on two consecutive reads, so a transition
    /// landing between snapshots is not mistaken for a broken invariant.
    async fn audit(&self, report: &mut ScanReport) {
        let first = self.collect_violations().await;
        if first.is_empty() {
            return;
        }
        tokio::task::yield_now().await;
        let confirmed: HashSet<String> = self.collect_violations().await.into_iter().collect();

        for violation in first.into_iter().filter(|v| confirmed.contains(v)) {
            error!("Invariant violation: {}", violation);
            self.coordinator.escalate(None, Severity::Critical, violation.clone());
            report.invariant_violations.push(violation);
        }
    }

    async fn collect_violations(&self) -> Vec<String> {
        let mut violations = Vec::new();
        let units = self.coordinator.units();
        let records: HashMap<UnitId, AgentId> = self
            .coordinator
            .assignments()
            .into_iter()
            .map(|r| (r.unit_id, r.agent_id))
            .collect();

        let mut paths: HashMap<PathBuf, UnitId> = HashMap::new();
        for unit in &units {
            if !unit.binding_is_consistent() {
                violations.push(format!(
                    "unit {} is {} but agent/workspace binding is {:?}/{:?}",
                    unit.id,
                    unit.status,
                    unit.assigned_agent,
                    unit.workspace.as_ref().map(|w| w.path.display().to_string())
                ));
            }
            if unit.status.is_held() && records.get(&unit.id) != unit.assigned_agent.as_ref() {
                violations.push(format!("unit {} is held without a matching assignment record", unit.id));
            }
            if let Some(ws) = unit.workspace.as_ref().filter(|_| unit.status.is_held()) {
                if let Some(other) = paths.insert(ws.path.clone(), unit.id.clone()) {
                    violations.push(format!(
                        "units {} and {} share workspace {}",
                        other,
                        unit.id,
                        ws.path.display()
                    ));
                }
            }
        }

        let mut active: HashMap<PathBuf, UnitId> = HashMap::new();
        for workspace in self.coordinator.workspaces().list_active().await {
            if let Some(other) = active.insert(workspace.path.clone(), workspace.unit_id.clone()) {
                violations.push(format!(
                    "active workspace {} is bound to both {} and {}",
                    workspace.path.display(),
                    other,
                    workspace.unit_id
                ));
            }
        }

        let held_by: HashMap<&UnitId, Option<&AgentId>> = units
            .iter()
            .filter(|u| u.status.is_held())
            .map(|u| (&u.id, u.assigned_agent.as_ref()))
            .collect();
        for agent in self.coordinator.agents() {
            if agent.assignments.len() > agent.max_concurrent {
                violations.push(format!(
                    "agent {} holds {} units, over its limit of {}",
                    agent.id,
                    agent.assignments.len(),
                    agent.max_concurrent
                ));
            }
            for unit_id in &agent.assignments {
                if held_by.get(unit_id).copied().flatten() != Some(&agent.id) {
                    violations.push(format!("agent {} lists unit {} it does not hold", agent.id, unit_id));
                }
            }
        }

        let budget = self.coordinator.budget();
        if budget.in_use() > budget.limit() {
            violations.push(format!(
                "{} workspace slots reserved, over the limit of {}",
                budget.in_use(),
                budget.limit()
            ));
        }
        violations
    }

    async fn deregister_silent(&self, now: DateTime<Utc>, report: &mut ScanReport) {
        let threshold = self.config.agent_silence_threshold();
        for agent in self.coordinator.agents() {
            let silent_for = now - agent.last_seen();
            if silent_for <= threshold {
                continue;
            }
            warn!(
                agent_id = %agent.id,
                silent_secs = silent_for.num_seconds(),
                "Agent went silent, deregistering"
            );
            match self.coordinator.deregister_agent(&agent.id).await {
                Ok(_) => report.agents_deregistered.push(agent.id),
                Err(OrchestrationError::AgentNotFound(_)) => {}
                Err(e) => warn!(agent_id = %agent.id, error = %e, "Could not deregister silent agent"),
            }
        }
    }
}

/// Whether two paths name the same directory, resolving symlinks when the
/// spelling differs.
async fn same_location(a: &Path, b: &Path) -> bool {
    if a == b {
        return true;
    }
    match (tokio::fs::canonicalize(a).await, tokio::fs::canonicalize(b).await) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    }
}
