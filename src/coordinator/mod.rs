// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Assignment coordinator.
//!
//! The only component that mutates assignment state. It combines the
//! scheduler, dependency graph, guardrails and workspace manager into the
//! hand-off of a unit to an agent, and the reverse paths: completion,
//! release, and review acceptance.
//!
//! # Locking
//!
//! ```text
//! agents map (parking_lot RwLock)     -> per-agent Mutex   (never across .await)
//! unit arena (parking_lot RwLock)     -> per-unit Mutex    (never across .await)
//! dependency graph (tokio RwLock)     read for ranking, write for mutation
//! workspace manager                   no coordinator lock held during I/O
//! ```
//!
//! Lock order is agent, then unit. A unit is reserved (`assigned`, agent and
//! workspace reference bound) before provisioning starts; a failed
//! provisioning rolls the reservation back to `ready`.
//!
//! Store writes are serialized per unit and always write the slot as it is
//! when the write starts, skipping revisions already written. A slow writer
//! can therefore never overwrite a newer state with an older one.

pub mod events;

pub use events::{EventSink, OrchestratorEvent, Severity};

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use tracing::{debug, error, info, instrument, warn};

use crate::config::{ConflictPolicy, OrchestratorConfig};
use crate::error::{CapacityLimit, OrchestrationError, WorkspaceError};
use crate::graph::{conflict, DependencyGraph};
use crate::guardrails::{AssignmentContext, GuardrailSet, WorkspaceBudget};
use crate::scheduler::{PriorityScheduler, ScoredUnit};
use crate::store::{IssueStore, SlotError, UnitArena, UnitSlot};
use crate::telemetry::metrics::{self, Counter};
use crate::types::{
    Agent, AgentId, AssignmentRecord, CompletionSignal, Heartbeat, Outcome, ReleaseReason, UnitId,
    UnitOfWork, UnitStatus,
};
use crate::workspace::{TeardownOptions, WorkspaceManager};

type Result<T> = std::result::Result<T, OrchestrationError>;

/// Options for [`AssignmentCoordinator::complete_assignment`].
#[derive(Debug, Clone, Default)]
pub struct CompleteOptions {
    /// Delete the branch of a failed unit. `None` uses
    /// `workspace.cleanupOnComplete`. Branches of units going to review are
    /// always kept.
    pub cleanup: Option<bool>,
    /// Remove the workspace even with uncommitted changes.
    pub force: bool,
    pub commit_reference: Option<String>,
}

/// Result of a completion.
#[derive(Debug, Clone, PartialEq)]
pub struct CompletionReport {
    pub unit_id: UnitId,
    pub agent_id: AgentId,
    pub status: UnitStatus,
    pub discarded_changes: bool,
}

/// Result of a release.
#[derive(Debug, Clone, PartialEq)]
pub struct ReleaseReport {
    pub unit_id: UnitId,
    pub agent_id: AgentId,
    pub reason: ReleaseReason,
    pub discarded_changes: bool,
}

/// Transactional hand-off of units of work to agents.
pub struct AssignmentCoordinator {
    config: OrchestratorConfig,
    arena: UnitArena,
    graph: tokio::sync::RwLock<DependencyGraph>,
    agents: RwLock<HashMap<AgentId, Arc<Mutex<Agent>>>>,
    scheduler: PriorityScheduler,
    guardrails: GuardrailSet,
    budget: WorkspaceBudget,
    workspaces: Arc<WorkspaceManager>,
    store: Option<Arc<dyn IssueStore>>,
    persist_gates: Mutex<HashMap<UnitId, PersistGate>>,
    events: EventSink,
}

/// Last slot revision written to the store for one unit.
type PersistGate = Arc<tokio::sync::Mutex<Option<u64>>>;

impl AssignmentCoordinator {
    pub fn new(config: OrchestratorConfig, workspaces: Arc<WorkspaceManager>, events: EventSink) -> Self {
        Self {
            scheduler: PriorityScheduler::new(config.scheduler.weights.clone()),
            guardrails: GuardrailSet::from_config(&config),
            budget: WorkspaceBudget::new(config.limits.max_active_workspaces),
            arena: UnitArena::new(),
            graph: tokio::sync::RwLock::new(DependencyGraph::new()),
            agents: RwLock::new(HashMap::new()),
            workspaces,
            store: None,
            persist_gates: Mutex::new(HashMap::new()),
            events,
            config,
        }
    }

    /// Write unit changes through to an external store.
    pub fn with_store(mut self, store: Arc<dyn IssueStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Replace the guardrail set.
    pub fn with_guardrails(mut self, guardrails: GuardrailSet) -> Self {
        self.guardrails = guardrails;
        self
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn workspaces(&self) -> &Arc<WorkspaceManager> {
        &self.workspaces
    }

    pub fn budget(&self) -> &WorkspaceBudget {
        &self.budget
    }

    pub fn scheduler(&self) -> &PriorityScheduler {
        &self.scheduler
    }

    // ========================================================================
    // Loading
    // ========================================================================

    /// Load a batch of units from the planner.
    ///
    /// The batch's dependency edges are validated as a whole: a cycle rejects
    /// the entire batch. Readiness is evaluated afterwards.
    #[instrument(skip(self, units), fields(count = units.len()))]
    pub async fn load_units(&self, units: Vec<UnitOfWork>) -> Result<Vec<UnitId>> {
        let mut graph = self.graph.write().await;

        let mut combined = self.arena.snapshot();
        let known: HashSet<UnitId> = combined.iter().map(|u| u.id.clone()).collect();
        let fresh: Vec<UnitOfWork> = units.into_iter().filter(|u| !known.contains(&u.id)).collect();
        combined.extend(fresh.iter().cloned());

        let rebuilt = DependencyGraph::from_units(&combined)?;
        for mut unit in fresh {
            unit.blocks = rebuilt.dependents(&unit.id);
            if unit.status.is_held() {
                if unit.binding_is_consistent() {
                    self.restore_hold(unit);
                    continue;
                }
                warn!(unit_id = %unit.id, status = %unit.status, "Loaded unit is held without a binding; resetting to open");
                unit.status = UnitStatus::Open;
                unit.assigned_agent = None;
                unit.workspace = None;
            }
            self.arena.insert(unit);
        }
        for id in known {
            let blocks = rebuilt.dependents(&id);
            self.arena.update(&id, |slot| slot.unit.blocks = blocks);
        }
        *graph = rebuilt;
        drop(graph);

        info!(total = self.arena.len(), "Loaded units");
        Ok(self.refresh_readiness().await)
    }

    /// Re-create the assignment record of a unit that was held when it was
    /// persisted, keeping the hold's original start and last heartbeat so
    /// stale and overlong work stays detectable across restarts. Units
    /// written without those times restart their clock now.
    ///
    /// An unknown agent is registered with the default concurrency and is
    /// considered last seen at the hold's latest activity.
    fn restore_hold(&self, unit: UnitOfWork) {
        let (Some(agent_id), Some(workspace)) = (unit.assigned_agent.clone(), unit.workspace.clone()) else {
            return;
        };
        let unit_id = unit.id.clone();
        let started_at = unit.assigned_at.unwrap_or_else(Utc::now);
        let mut record = AssignmentRecord::new(unit_id.clone(), agent_id.clone(), workspace, started_at);
        record.last_heartbeat = unit.last_heartbeat;
        let last_active = record.last_activity();
        self.arena.insert(unit);
        self.arena.update(&unit_id, |slot| {
            slot.unit.assigned_at = Some(started_at);
            slot.assignment = Some(record);
        });

        let handle = {
            let mut agents = self.agents.write();
            agents
                .entry(agent_id.clone())
                .or_insert_with(|| {
                    info!(agent_id = %agent_id, "Registering agent of restored assignment");
                    Arc::new(Mutex::new(
                        Agent::new(agent_id.clone(), self.config.limits.default_agent_concurrency)
                            .with_registered_at(last_active),
                    ))
                })
                .clone()
        };
        let mut agent = handle.lock();
        if last_active > agent.last_seen() {
            agent.last_heartbeat = Some(last_active);
        }
        agent.assignments.insert(unit_id.clone());
        if agent.assignments.len() > agent.max_concurrent {
            agent.max_concurrent = agent.assignments.len();
        }
        debug!(unit_id = %unit_id, agent_id = %agent_id, "Restored assignment");
    }

    /// Move `open`/`blocked`/`ready` units to `ready` or `blocked` according
    /// to the graph. Returns the units that became ready.
    pub async fn refresh_readiness(&self) -> Vec<UnitId> {
        let graph = self.graph.read().await;
        let mut newly_ready = Vec::new();
        let mut changed = Vec::new();

        for unit in self.arena.snapshot() {
            if !unit.status.awaits_readiness() {
                continue;
            }
            let target = if graph.is_ready(&unit.id) {
                UnitStatus::Ready
            } else {
                UnitStatus::Blocked
            };
            if target == unit.status {
                continue;
            }
            let applied = self.arena.transition(
                &unit.id,
                &[UnitStatus::Open, UnitStatus::Blocked, UnitStatus::Ready],
                |slot| slot.unit.status = target,
            );
            if applied.is_ok() {
                if target == UnitStatus::Ready {
                    newly_ready.push(unit.id.clone());
                }
                changed.push(unit.id);
            }
        }
        drop(graph);

        for id in &changed {
            self.persist(id).await;
        }
        for id in &newly_ready {
            self.events.emit(OrchestratorEvent::UnitReady { unit_id: id.clone() });
        }
        newly_ready
    }

    /// Add `blocked -> blocker`, rejecting cycles.
    ///
    /// A `ready` unit that gains an open blocker drops back to `blocked`.
    #[instrument(skip(self), fields(blocked = %blocked, blocker = %blocker))]
    pub async fn add_dependency(&self, blocked: &UnitId, blocker: &UnitId) -> Result<()> {
        let mut graph = self.graph.write().await;
        graph.add_edge(blocked, blocker)?;
        let still_ready = graph.is_ready(blocked);
        drop(graph);

        self.arena.update(blocker, |slot| {
            if !slot.unit.blocks.contains(blocked) {
                slot.unit.blocks.push(blocked.clone());
            }
        });
        self.arena.update(blocked, |slot| {
            if !slot.unit.blocked_by.contains(blocker) {
                slot.unit.blocked_by.push(blocker.clone());
            }
            if !still_ready {
                match slot.unit.status {
                    UnitStatus::Ready | UnitStatus::Open => slot.unit.status = UnitStatus::Blocked,
                    status if status.is_held() => {
                        warn!(unit_id = %blocked, status = %status, "Held unit gained an open blocker")
                    }
                    _ => {}
                }
            }
        });
        self.persist(blocker).await;
        self.persist(blocked).await;
        Ok(())
    }

    // ========================================================================
    // Agents
    // ========================================================================

    pub fn register_agent(&self, agent: Agent) -> Result<()> {
        let mut agents = self.agents.write();
        if agents.contains_key(&agent.id) {
            return Err(OrchestrationError::AgentAlreadyRegistered(agent.id));
        }
        info!(agent_id = %agent.id, max_concurrent = agent.max_concurrent, "Registered agent");
        agents.insert(agent.id.clone(), Arc::new(Mutex::new(agent)));
        Ok(())
    }

    /// Remove an agent, releasing everything it holds.
    #[instrument(skip(self), fields(agent_id = %agent_id))]
    pub async fn deregister_agent(&self, agent_id: &AgentId) -> Result<Vec<ReleaseReport>> {
        let held: Vec<UnitId> = {
            let handle = self.agent_handle(agent_id)?;
            let agent = handle.lock();
            agent.assignments.iter().cloned().collect()
        };

        let mut reports = Vec::new();
        for unit_id in held {
            match self.release_assignment(&unit_id, ReleaseReason::AgentDeregistered).await {
                Ok(report) => reports.push(report),
                Err(OrchestrationError::InvalidTransition { .. }) => {}
                Err(e) => return Err(e),
            }
        }

        self.agents.write().remove(agent_id);
        info!(released = reports.len(), "Deregistered agent");
        self.events.emit(OrchestratorEvent::AgentDeregistered {
            agent_id: agent_id.clone(),
        });
        Ok(reports)
    }

    /// Snapshot of every agent, sorted by id.
    pub fn agents(&self) -> Vec<Agent> {
        let mut agents: Vec<Agent> = self
            .agents
            .read()
            .values()
            .map(|a| a.lock().clone())
            .collect();
        agents.sort_by(|a, b| a.id.cmp(&b.id));
        agents
    }

    pub fn agent(&self, agent_id: &AgentId) -> Option<Agent> {
        self.agents.read().get(agent_id).map(|a| a.lock().clone())
    }

    /// Liveness signal from an agent, independent of any unit.
    pub fn agent_heartbeat(&self, agent_id: &AgentId, at: DateTime<Utc>) -> Result<()> {
        let handle = self.agent_handle(agent_id)?;
        let mut agent = handle.lock();
        agent.last_heartbeat = Some(agent.last_heartbeat.map_or(at, |prev| prev.max(at)));
        Ok(())
    }

    fn agent_handle(&self, agent_id: &AgentId) -> Result<Arc<Mutex<Agent>>> {
        self.agents
            .read()
            .get(agent_id)
            .cloned()
            .ok_or_else(|| OrchestrationError::AgentNotFound(agent_id.clone()))
    }

    fn effective_limit(&self, agent: &Agent) -> usize {
        agent.max_concurrent.min(self.config.limits.max_assignments_per_agent)
    }

    // ========================================================================
    // Assignment
    // ========================================================================

    /// Ranked ready queue at `now`.
    pub async fn ready_queue(&self, now: DateTime<Utc>) -> Vec<ScoredUnit> {
        let graph = self.graph.read().await;
        self.scheduler.rank(&self.arena.snapshot(), &graph, now)
    }

    /// Hand the best ready unit to `agent_id`.
    ///
    /// Losing the race for a unit moves on to the next candidate. A failed
    /// provisioning rolls the unit back to `ready` and returns
    /// `ResourceUnavailable`.
    #[instrument(skip(self), fields(agent_id = %agent_id))]
    pub async fn request_assignment(&self, agent_id: &AgentId) -> Result<AssignmentRecord> {
        let handle = self.agent_handle(agent_id)?;
        let agent = handle.lock().clone();
        let limit = self.effective_limit(&agent);
        if agent.assignments.len() >= limit {
            metrics::incr(Counter::CapacityDenials);
            return Err(OrchestrationError::CapacityExceeded(CapacityLimit::Agent {
                agent_id: agent_id.clone(),
                limit,
            }));
        }

        let now = Utc::now();
        let units = self.arena.snapshot();
        let in_flight: Vec<UnitOfWork> = units.iter().filter(|u| u.status.is_held()).cloned().collect();
        let policy = self.config.conflicts.policy;

        let mut exclude = HashSet::new();
        if policy == ConflictPolicy::Defer {
            for unit in units.iter().filter(|u| u.status == UnitStatus::Ready) {
                if !conflict::risks_for(unit, &in_flight).is_empty() {
                    debug!(unit_id = %unit.id, "Deferring unit that overlaps in-flight work");
                    exclude.insert(unit.id.clone());
                }
            }
        }

        let candidates = {
            let graph = self.graph.read().await;
            self.scheduler.candidates_for(&agent, &units, &graph, now, &exclude)
        };
        if candidates.is_empty() {
            return Err(OrchestrationError::NoReadyWork(agent_id.clone()));
        }

        let mut denied = None;
        for candidate in candidates {
            let Some(unit) = self.arena.get(&candidate.unit_id) else {
                continue;
            };
            let workspace = self.workspaces.derive(&unit);

            let ctx = AssignmentContext {
                agent: &agent,
                unit: &unit,
                workspace: &workspace,
                active_workspaces: self.budget.in_use(),
            };
            if let Err(denial) = self.guardrails.check_assignment(&ctx) {
                if denial.capacity.is_some() {
                    metrics::incr(Counter::CapacityDenials);
                    return Err(denial.into());
                }
                warn!(unit_id = %unit.id, policy = %denial.policy, reason = %denial.reason, "Candidate denied by policy");
                denied = Some(denial);
                continue;
            }

            if let Err(limit) = self.budget.try_acquire() {
                metrics::incr(Counter::CapacityDenials);
                return Err(OrchestrationError::CapacityExceeded(limit));
            }

            let record = {
                let mut agent_state = handle.lock();
                if agent_state.assignments.len() >= self.effective_limit(&agent_state) {
                    self.budget.release();
                    metrics::incr(Counter::CapacityDenials);
                    return Err(OrchestrationError::CapacityExceeded(CapacityLimit::Agent {
                        agent_id: agent_id.clone(),
                        limit: self.effective_limit(&agent_state),
                    }));
                }
                let claimed = self.arena.transition(&unit.id, &[UnitStatus::Ready], |slot| {
                    let record = AssignmentRecord::new(unit.id.clone(), agent_id.clone(), workspace.clone(), now);
                    slot.unit.status = UnitStatus::Assigned;
                    slot.unit.assigned_agent = Some(agent_id.clone());
                    slot.unit.workspace = Some(workspace.clone());
                    slot.unit.assigned_at = Some(now);
                    slot.unit.last_heartbeat = None;
                    slot.assignment = Some(record.clone());
                    record
                });
                match claimed {
                    Ok(record) => {
                        agent_state.assignments.insert(unit.id.clone());
                        record
                    }
                    Err(_) => {
                        drop(agent_state);
                        self.budget.release();
                        metrics::incr(Counter::ContentionRetries);
                        debug!(unit_id = %unit.id, "Lost the race for unit, trying next candidate");
                        continue;
                    }
                }
            };

            if policy == ConflictPolicy::Warn {
                for risk in conflict::risks_for(&unit, &in_flight) {
                    warn!(unit_id = %risk.unit_id, other = %risk.other, "Assigned unit overlaps in-flight work");
                    self.events.emit(risk.into());
                }
            }

            return self.provision_reserved(&unit, record).await;
        }

        Err(match denied {
            Some(denial) => denial.into(),
            None => OrchestrationError::NoReadyWork(agent_id.clone()),
        })
    }

    /// Provision the workspace of a reserved unit; roll back on failure.
    async fn provision_reserved(&self, unit: &UnitOfWork, record: AssignmentRecord) -> Result<AssignmentRecord> {
        let agent_id = record.agent_id.clone();

        let provisioned = self.workspaces.provision(unit).await;
        let workspace = match provisioned {
            Ok(ws) => ws,
            Err(e) => {
                metrics::incr(Counter::ProvisioningFailures);
                warn!(unit_id = %unit.id, agent_id = %agent_id, error = %e, "Provisioning failed, rolling back reservation");
                self.rollback_reservation(&unit.id, &agent_id).await;
                self.events.emit(OrchestratorEvent::ProvisioningFailed {
                    unit_id: unit.id.clone(),
                    error: e.to_string(),
                });
                return Err(OrchestrationError::ResourceUnavailable {
                    unit_id: unit.id.clone(),
                    source: e,
                });
            }
        };

        // The unit may have been released while the workspace was being built.
        let still_ours = self
            .arena
            .transition(&unit.id, &[UnitStatus::Assigned], |slot| {
                slot.unit.assigned_agent.as_ref() == Some(&agent_id)
            })
            .unwrap_or(false);
        if !still_ours {
            warn!(unit_id = %unit.id, agent_id = %agent_id, "Reservation vanished during provisioning, removing workspace");
            if let Err(e) = self.workspaces.teardown(&unit.id, true).await {
                warn!(unit_id = %unit.id, error = %e, "Could not remove orphaned workspace");
            }
            return Err(OrchestrationError::Contention(unit.id.clone()));
        }

        self.persist(&unit.id).await;
        metrics::incr(Counter::AssignmentsGranted);
        info!(
            unit_id = %unit.id,
            agent_id = %agent_id,
            path = %workspace.path.display(),
            branch = %workspace.branch,
            "Assigned unit"
        );
        self.events.emit(OrchestratorEvent::WorkAssigned {
            unit_id: unit.id.clone(),
            agent_id,
            workspace_path: workspace.path,
            branch_name: workspace.branch,
        });
        Ok(record)
    }

    async fn rollback_reservation(&self, unit_id: &UnitId, agent_id: &AgentId) {
        let rolled_back = self.arena.transition(unit_id, &[UnitStatus::Assigned], |slot| {
            if slot.unit.assigned_agent.as_ref() != Some(agent_id) {
                return None;
            }
            clear_binding(slot, UnitStatus::Ready);
            Some(())
        });
        match rolled_back {
            Ok(Some(())) => {
                self.forget_assignment(agent_id, unit_id);
                self.persist(unit_id).await;
            }
            _ => warn!(unit_id = %unit_id, "Reservation already gone during rollback"),
        }
    }

    /// Drop a unit from its agent and free its workspace slot.
    fn forget_assignment(&self, agent_id: &AgentId, unit_id: &UnitId) {
        if let Ok(handle) = self.agent_handle(agent_id) {
            handle.lock().assignments.remove(unit_id);
        }
        self.budget.release();
    }

    // ========================================================================
    // Progress
    // ========================================================================

    /// `assigned -> in_progress` for the holding agent.
    pub async fn start_work(&self, unit_id: &UnitId, agent_id: &AgentId) -> Result<()> {
        self.arena
            .transition(unit_id, &[UnitStatus::Assigned], |slot| {
                if slot.unit.assigned_agent.as_ref() != Some(agent_id) {
                    return Err(OrchestrationError::NotHolder {
                        unit_id: unit_id.clone(),
                        agent_id: agent_id.clone(),
                    });
                }
                slot.unit.status = UnitStatus::InProgress;
                Ok(())
            })
            .map_err(|e| slot_error(unit_id, UnitStatus::Assigned, e))??;

        info!(unit_id = %unit_id, agent_id = %agent_id, "Work started");
        self.persist(unit_id).await;
        self.events.emit(OrchestratorEvent::WorkStarted {
            unit_id: unit_id.clone(),
            agent_id: agent_id.clone(),
        });
        Ok(())
    }

    /// Record a heartbeat. The first heartbeat on an `assigned` unit starts
    /// the work. Every heartbeat is written through so a restarted
    /// coordinator sees the unit's real activity.
    pub async fn heartbeat(&self, beat: Heartbeat) -> Result<()> {
        let promoted = self
            .arena
            .transition(
                &beat.unit_id,
                &[UnitStatus::Assigned, UnitStatus::InProgress],
                |slot| {
                    if slot.unit.assigned_agent.as_ref() != Some(&beat.agent_id) {
                        return Err(OrchestrationError::NotHolder {
                            unit_id: beat.unit_id.clone(),
                            agent_id: beat.agent_id.clone(),
                        });
                    }
                    let latest = slot
                        .unit
                        .last_heartbeat
                        .map_or(beat.timestamp, |prev| prev.max(beat.timestamp));
                    slot.unit.last_heartbeat = Some(latest);
                    if let Some(record) = slot.assignment.as_mut() {
                        record.last_heartbeat = Some(latest);
                    }
                    let promote = slot.unit.status == UnitStatus::Assigned;
                    if promote {
                        slot.unit.status = UnitStatus::InProgress;
                    }
                    Ok(promote)
                },
            )
            .map_err(|e| slot_error(&beat.unit_id, UnitStatus::InProgress, e))??;

        self.agent_heartbeat(&beat.agent_id, beat.timestamp)?;
        self.persist(&beat.unit_id).await;

        if promoted {
            debug!(unit_id = %beat.unit_id, "First heartbeat started work");
            self.events.emit(OrchestratorEvent::WorkStarted {
                unit_id: beat.unit_id,
                agent_id: beat.agent_id,
            });
        }
        Ok(())
    }

    // ========================================================================
    // Completion & release
    // ========================================================================

    /// Completion signal from an agent, with default options.
    pub async fn complete(&self, signal: CompletionSignal) -> Result<CompletionReport> {
        self.complete_assignment(
            &signal.unit_id,
            signal.outcome,
            CompleteOptions {
                commit_reference: signal.commit_reference,
                ..Default::default()
            },
        )
        .await
    }

    /// Finish an `in_progress` unit: tear down its workspace, then move it to
    /// `review` (success) or `failed`.
    ///
    /// Uncommitted changes without `force` return `DirtyState` and leave the
    /// unit `in_progress` with its workspace intact.
    #[instrument(skip(self, options), fields(unit_id = %unit_id, outcome = %outcome))]
    pub async fn complete_assignment(
        &self,
        unit_id: &UnitId,
        outcome: Outcome,
        options: CompleteOptions,
    ) -> Result<CompletionReport> {
        let slot = self
            .arena
            .get_slot(unit_id)
            .ok_or_else(|| OrchestrationError::UnitNotFound(unit_id.clone()))?;
        if slot.unit.status != UnitStatus::InProgress {
            return Err(OrchestrationError::InvalidTransition {
                unit_id: unit_id.clone(),
                expected: UnitStatus::InProgress,
                actual: slot.unit.status,
            });
        }

        let cleanup = options.cleanup.unwrap_or(self.config.workspace.cleanup_on_complete);
        let teardown = TeardownOptions {
            force: options.force,
            delete_branch: cleanup && outcome == Outcome::Failure,
        };
        let discarded_changes = match self.workspaces.teardown_with(unit_id, teardown).await {
            Ok(outcome) => outcome.discarded_changes(),
            Err(WorkspaceError::DirtyWorkspace(path)) => {
                warn!(unit_id = %unit_id, path = %path.display(), "Completion blocked by uncommitted changes");
                return Err(OrchestrationError::DirtyState(unit_id.clone()));
            }
            Err(e @ WorkspaceError::TeardownTimedOut { .. }) => {
                self.escalate(Some(unit_id.clone()), Severity::Critical, e.to_string());
                return Err(e.into());
            }
            Err(e) => return Err(e.into()),
        };
        if discarded_changes {
            self.escalate(
                Some(unit_id.clone()),
                Severity::Critical,
                "forced completion discarded uncommitted changes".to_string(),
            );
        }

        let target = outcome.target_status();
        let agent_id = self
            .arena
            .transition(unit_id, &[UnitStatus::InProgress], |slot| {
                let agent_id = slot.unit.assigned_agent.clone();
                clear_binding(slot, target);
                agent_id
            })
            .map_err(|e| slot_error(unit_id, UnitStatus::InProgress, e))?;
        let agent_id = agent_id.ok_or_else(|| {
            OrchestrationError::InvariantViolation(format!("in-progress unit {} had no agent", unit_id))
        })?;
        self.forget_assignment(&agent_id, unit_id);

        // Dependents wait for `done`, which only review acceptance grants.
        debug!(unit_id = %unit_id, status = %target, "Dependency graph unchanged until review is accepted");

        metrics::incr(Counter::Completions);
        info!(unit_id = %unit_id, agent_id = %agent_id, status = %target, "Completed assignment");
        self.persist(unit_id).await;
        self.events.emit(OrchestratorEvent::WorkCompleted {
            unit_id: unit_id.clone(),
            outcome,
            commit_reference: options.commit_reference,
        });

        Ok(CompletionReport {
            unit_id: unit_id.clone(),
            agent_id,
            status: target,
            discarded_changes,
        })
    }

    /// Reclaim a held unit: force its workspace down and return it to `ready`.
    ///
    /// Discarded uncommitted changes raise a critical escalation. A teardown
    /// that times out is escalated too, but the unit is still released and
    /// its workspace is left `stale` for the monitor to remove.
    #[instrument(skip(self), fields(unit_id = %unit_id, reason = %reason))]
    pub async fn release_assignment(&self, unit_id: &UnitId, reason: ReleaseReason) -> Result<ReleaseReport> {
        let report = self.reclaim(unit_id, reason).await?;
        if report.discarded_changes {
            self.escalate(
                Some(unit_id.clone()),
                Severity::Critical,
                format!("release ({}) discarded uncommitted changes", report.reason),
            );
        }
        Ok(report)
    }

    /// Release without escalating discarded changes; the caller decides.
    pub(crate) async fn reclaim(&self, unit_id: &UnitId, reason: ReleaseReason) -> Result<ReleaseReport> {
        let slot = self
            .arena
            .get_slot(unit_id)
            .ok_or_else(|| OrchestrationError::UnitNotFound(unit_id.clone()))?;
        if !slot.unit.status.is_held() {
            return Err(OrchestrationError::InvalidTransition {
                unit_id: unit_id.clone(),
                expected: UnitStatus::InProgress,
                actual: slot.unit.status,
            });
        }

        let discarded_changes = match self.workspaces.teardown(unit_id, true).await {
            Ok(outcome) => outcome.discarded_changes(),
            Err(e @ WorkspaceError::TeardownTimedOut { .. }) => {
                self.escalate(Some(unit_id.clone()), Severity::Critical, e.to_string());
                false
            }
            // Provisioning still running; it sees the reservation gone and
            // removes its own workspace.
            Err(WorkspaceError::Busy(_)) => {
                debug!(unit_id = %unit_id, "Workspace still provisioning, releasing reservation only");
                false
            }
            Err(e) => return Err(e.into()),
        };

        let agent_id = self
            .arena
            .transition(unit_id, &[UnitStatus::Assigned, UnitStatus::InProgress], |slot| {
                let agent_id = slot.unit.assigned_agent.clone();
                clear_binding(slot, UnitStatus::Ready);
                agent_id
            })
            .map_err(|e| slot_error(unit_id, UnitStatus::InProgress, e))?;
        let agent_id = agent_id.ok_or_else(|| {
            OrchestrationError::InvariantViolation(format!("held unit {} had no agent", unit_id))
        })?;
        self.forget_assignment(&agent_id, unit_id);

        metrics::incr(Counter::Releases);
        warn!(unit_id = %unit_id, agent_id = %agent_id, reason = %reason, "Released assignment");
        self.persist(unit_id).await;
        self.events.emit(OrchestratorEvent::WorkReleased {
            unit_id: unit_id.clone(),
            reason: reason.clone(),
        });

        Ok(ReleaseReport {
            unit_id: unit_id.clone(),
            agent_id,
            reason,
            discarded_changes,
        })
    }

    /// Voluntary abandonment by the holding agent.
    pub async fn abandon(&self, unit_id: &UnitId, agent_id: &AgentId) -> Result<ReleaseReport> {
        let holder = self
            .arena
            .get(unit_id)
            .ok_or_else(|| OrchestrationError::UnitNotFound(unit_id.clone()))?
            .assigned_agent;
        if holder.as_ref() != Some(agent_id) {
            return Err(OrchestrationError::NotHolder {
                unit_id: unit_id.clone(),
                agent_id: agent_id.clone(),
            });
        }
        self.release_assignment(unit_id, ReleaseReason::Voluntary).await
    }

    /// Signal from the external review process: `review -> done`.
    ///
    /// Returns the units that became ready.
    #[instrument(skip(self), fields(unit_id = %unit_id))]
    pub async fn accept_review(&self, unit_id: &UnitId) -> Result<Vec<UnitId>> {
        self.arena
            .transition(unit_id, &[UnitStatus::Review], |slot| slot.unit.status = UnitStatus::Done)
            .map_err(|e| slot_error(unit_id, UnitStatus::Review, e))?;
        self.persist(unit_id).await;
        info!(unit_id = %unit_id, "Review accepted");

        let candidates = self.graph.write().await.on_unit_completed(unit_id);

        let mut newly_ready = Vec::new();
        for id in candidates {
            let promoted = self.arena.transition(&id, &[UnitStatus::Open, UnitStatus::Blocked], |slot| {
                slot.unit.status = UnitStatus::Ready;
            });
            if promoted.is_ok() {
                self.persist(&id).await;
                self.events.emit(OrchestratorEvent::UnitReady { unit_id: id.clone() });
                newly_ready.push(id);
            }
        }
        Ok(newly_ready)
    }

    /// Ask whether `unit_id`'s branch may be merged or pushed into `target`.
    ///
    /// The coordinator never integrates branches itself; this only answers
    /// the guardrails' verdict for the external review tooling.
    pub fn authorize_integration(&self, unit_id: &UnitId, target: &str) -> Result<()> {
        let unit = self
            .arena
            .get(unit_id)
            .ok_or_else(|| OrchestrationError::UnitNotFound(unit_id.clone()))?;
        let branch = self.workspaces.derive(&unit).branch;
        self.guardrails
            .check_integration(&branch, target)
            .map_err(Into::into)
    }

    // ========================================================================
    // Introspection & escalation
    // ========================================================================

    pub fn unit(&self, unit_id: &UnitId) -> Option<UnitOfWork> {
        self.arena.get(unit_id)
    }

    /// Snapshot of every unit, sorted by id.
    pub fn units(&self) -> Vec<UnitOfWork> {
        self.arena.snapshot()
    }

    /// Live assignment records, sorted by unit.
    pub fn assignments(&self) -> Vec<AssignmentRecord> {
        self.arena.assignments()
    }

    pub async fn graph_snapshot(&self) -> DependencyGraph {
        self.graph.read().await.clone()
    }

    /// Adopt workspaces left by a previous run and resync the slot budget.
    pub async fn adopt_workspaces(&self) -> Result<usize> {
        let adopted = self.workspaces.adopt_existing().await?;
        self.budget.set_in_use(self.workspaces.active_count().await);
        Ok(adopted)
    }

    /// Notify humans.
    pub fn escalate(&self, unit_id: Option<UnitId>, severity: Severity, message: String) {
        metrics::incr(Counter::Escalations);
        match severity {
            Severity::Critical => error!(unit_id = ?unit_id, "Escalation: {}", message),
            Severity::Warning => warn!(unit_id = ?unit_id, "Escalation: {}", message),
        }
        self.events.emit(OrchestratorEvent::Escalation {
            unit_id,
            severity,
            message,
        });
    }

    pub(crate) fn emit(&self, event: OrchestratorEvent) {
        self.events.emit(event);
    }

    /// Write the unit's current state through to the store.
    async fn persist(&self, unit_id: &UnitId) {
        let Some(store) = &self.store else {
            return;
        };
        let gate = self.persist_gates.lock().entry(unit_id.clone()).or_default().clone();
        let mut written = gate.lock().await;
        let Some(slot) = self.arena.get_slot(unit_id) else {
            return;
        };
        if *written >= Some(slot.revision) {
            debug!(unit_id = %unit_id, revision = slot.revision, "Unit revision already written");
            return;
        }
        match store.save(&slot.unit).await {
            Ok(()) => *written = Some(slot.revision),
            Err(e) => warn!(unit_id = %unit_id, error = %e, "Could not write unit to store"),
        }
    }
}

fn clear_binding(slot: &mut UnitSlot, status: UnitStatus) {
    slot.unit.status = status;
    slot.unit.assigned_agent = None;
    slot.unit.workspace = None;
    slot.unit.assigned_at = None;
    slot.unit.last_heartbeat = None;
    slot.assignment = None;
}

fn slot_error(unit_id: &UnitId, expected: UnitStatus, err: SlotError) -> OrchestrationError {
    match err {
        SlotError::Missing => OrchestrationError::UnitNotFound(unit_id.clone()),
        SlotError::Mismatch { actual } => OrchestrationError::InvalidTransition {
            unit_id: unit_id.clone(),
            expected,
            actual,
        },
    }
}
