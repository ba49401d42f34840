// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Core types for the Foreman orchestration core.
//!
//! This module defines the data model shared by every component: units of
//! work, agents, dependency edges, assignment records, and the signals agents
//! send back while they work.

use std::collections::BTreeSet;
use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ============================================================================
// Identifiers
// ============================================================================

/// Identifier of a unit of work (an issue).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UnitId(String);

impl UnitId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UnitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for UnitId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for UnitId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Identifier of a worker agent.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AgentId(String);

impl AgentId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AgentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for AgentId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for AgentId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

// ============================================================================
// Unit Status & Priority
// ============================================================================

/// Lifecycle status of a unit of work.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitStatus {
    /// Created by the planner, readiness not yet evaluated.
    #[default]
    Open,
    /// No open blockers; eligible for assignment.
    Ready,
    /// Reserved for an agent; workspace bound or being provisioned.
    Assigned,
    /// The agent has started working.
    InProgress,
    /// Waiting on at least one blocker.
    Blocked,
    /// Work submitted, awaiting the external review gate.
    Review,
    /// Accepted by review.
    Done,
    /// Work failed.
    Failed,
}

impl UnitStatus {
    /// All statuses, in lifecycle order.
    pub const ALL: [UnitStatus; 8] = [
        Self::Open,
        Self::Ready,
        Self::Assigned,
        Self::InProgress,
        Self::Blocked,
        Self::Review,
        Self::Done,
        Self::Failed,
    ];

    /// Whether the unit is held by an agent (`assigned` or `in_progress`).
    pub fn is_held(&self) -> bool {
        matches!(self, Self::Assigned | Self::InProgress)
    }

    /// Whether the unit has left the active lifecycle.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Failed)
    }

    /// Whether readiness may still be (re)evaluated for this unit.
    pub fn awaits_readiness(&self) -> bool {
        matches!(self, Self::Open | Self::Blocked | Self::Ready)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Ready => "ready",
            Self::Assigned => "assigned",
            Self::InProgress => "in_progress",
            Self::Blocked => "blocked",
            Self::Review => "review",
            Self::Done => "done",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for UnitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Priority tier of a unit of work.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PriorityTier {
    Low,
    #[default]
    Medium,
    High,
    Critical,
}

impl fmt::Display for PriorityTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Low => write!(f, "low"),
            Self::Medium => write!(f, "medium"),
            Self::High => write!(f, "high"),
            Self::Critical => write!(f, "critical"),
        }
    }
}

// ============================================================================
// Capabilities
// ============================================================================

/// A specialization an agent offers, or a unit requires.
///
/// Serialized as a plain string; unknown names become [`Capability::Custom`].
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Capability {
    Backend,
    Frontend,
    Database,
    Infrastructure,
    Testing,
    Documentation,
    Security,
    Custom(String),
}

impl From<String> for Capability {
    fn from(s: String) -> Self {
        match s.to_lowercase().as_str() {
            "backend" => Self::Backend,
            "frontend" => Self::Frontend,
            "database" => Self::Database,
            "infrastructure" => Self::Infrastructure,
            "testing" => Self::Testing,
            "documentation" => Self::Documentation,
            "security" => Self::Security,
            _ => Self::Custom(s),
        }
    }
}

impl From<&str> for Capability {
    fn from(s: &str) -> Self {
        Self::from(s.to_string())
    }
}

impl From<Capability> for String {
    fn from(c: Capability) -> Self {
        c.to_string()
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Backend => write!(f, "backend"),
            Self::Frontend => write!(f, "frontend"),
            Self::Database => write!(f, "database"),
            Self::Infrastructure => write!(f, "infrastructure"),
            Self::Testing => write!(f, "testing"),
            Self::Documentation => write!(f, "documentation"),
            Self::Security => write!(f, "security"),
            Self::Custom(name) => write!(f, "{}", name),
        }
    }
}

// ============================================================================
// Unit of Work
// ============================================================================

/// Reference from a unit to its workspace.
///
/// Path and branch are derived from the unit key before provisioning starts,
/// so a reserved unit always carries a reference.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkspaceRef {
    pub path: PathBuf,
    pub branch: String,
}

/// A single issue that can be claimed, worked on, and completed independently.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnitOfWork {
    /// Unique identifier.
    pub id: UnitId,
    /// Human-readable key (e.g. `PROJ-123`); workspace names derive from it.
    pub key: String,
    /// Short title.
    #[serde(default)]
    pub title: String,
    /// Current status.
    #[serde(default)]
    pub status: UnitStatus,
    /// Priority tier.
    #[serde(default)]
    pub priority: PriorityTier,
    /// When the planner created the unit.
    pub created_at: DateTime<Utc>,
    /// Agent currently holding the unit.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assigned_agent: Option<AgentId>,
    /// Workspace bound to the unit while held.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workspace: Option<WorkspaceRef>,
    /// When the current hold began.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assigned_at: Option<DateTime<Utc>>,
    /// Latest heartbeat received during the current hold.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_heartbeat: Option<DateTime<Utc>>,
    /// Units that must be done before this one is ready.
    #[serde(default)]
    pub blocked_by: Vec<UnitId>,
    /// Units waiting on this one.
    #[serde(default)]
    pub blocks: Vec<UnitId>,
    /// Capabilities an agent needs to take this unit.
    #[serde(default)]
    pub required_capabilities: BTreeSet<Capability>,
    /// Paths or glob patterns the unit is expected to modify.
    #[serde(default)]
    pub touches: Vec<String>,
}

impl UnitOfWork {
    /// Create an open unit with default priority.
    pub fn new(id: impl Into<UnitId>, key: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            key: key.into(),
            title: String::new(),
            status: UnitStatus::Open,
            priority: PriorityTier::Medium,
            created_at: Utc::now(),
            assigned_agent: None,
            workspace: None,
            assigned_at: None,
            last_heartbeat: None,
            blocked_by: Vec::new(),
            blocks: Vec::new(),
            required_capabilities: BTreeSet::new(),
            touches: Vec::new(),
        }
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = title.into();
        self
    }

    pub fn with_status(mut self, status: UnitStatus) -> Self {
        self.status = status;
        self
    }

    pub fn with_priority(mut self, priority: PriorityTier) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_created_at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = created_at;
        self
    }

    pub fn with_blocker(mut self, blocker: impl Into<UnitId>) -> Self {
        self.blocked_by.push(blocker.into());
        self
    }

    pub fn with_capability(mut self, capability: impl Into<Capability>) -> Self {
        self.required_capabilities.insert(capability.into());
        self
    }

    pub fn with_touches(mut self, paths: Vec<String>) -> Self {
        self.touches = paths;
        self
    }

    /// Check the binding invariant: held status iff agent and workspace are set.
    pub fn binding_is_consistent(&self) -> bool {
        let bound = self.assigned_agent.is_some() && self.workspace.is_some();
        let unbound = self.assigned_agent.is_none() && self.workspace.is_none();
        if self.status.is_held() {
            bound
        } else {
            unbound
        }
    }
}

// ============================================================================
// Agent
// ============================================================================

/// A worker capable of claiming units of work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Agent {
    pub id: AgentId,
    /// Specializations offered by this agent.
    #[serde(default)]
    pub capabilities: BTreeSet<Capability>,
    /// Maximum number of units held at once.
    pub max_concurrent: usize,
    /// Units currently held.
    #[serde(default)]
    pub assignments: BTreeSet<UnitId>,
    /// Last liveness signal.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_heartbeat: Option<DateTime<Utc>>,
    /// Registration time, used as the liveness baseline before any heartbeat.
    pub registered_at: DateTime<Utc>,
}

impl Agent {
    pub fn new(id: impl Into<AgentId>, max_concurrent: usize) -> Self {
        Self {
            id: id.into(),
            capabilities: BTreeSet::new(),
            max_concurrent,
            assignments: BTreeSet::new(),
            last_heartbeat: None,
            registered_at: Utc::now(),
        }
    }

    pub fn with_capability(mut self, capability: impl Into<Capability>) -> Self {
        self.capabilities.insert(capability.into());
        self
    }

    pub fn with_registered_at(mut self, at: DateTime<Utc>) -> Self {
        self.registered_at = at;
        self
    }

    /// Whether the agent may take one more unit.
    pub fn has_capacity(&self) -> bool {
        self.assignments.len() < self.max_concurrent
    }

    /// Whether this agent covers every capability the unit requires.
    pub fn can_handle(&self, required: &BTreeSet<Capability>) -> bool {
        required.is_subset(&self.capabilities)
    }

    /// Most recent sign of life.
    pub fn last_seen(&self) -> DateTime<Utc> {
        self.last_heartbeat.unwrap_or(self.registered_at)
    }
}

// ============================================================================
// Dependencies & Assignments
// ============================================================================

/// Directed edge `blocked -> blocker`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DependencyEdge {
    pub blocked: UnitId,
    pub blocker: UnitId,
}

impl DependencyEdge {
    pub fn new(blocked: impl Into<UnitId>, blocker: impl Into<UnitId>) -> Self {
        Self {
            blocked: blocked.into(),
            blocker: blocker.into(),
        }
    }
}

/// Binding of unit, agent, and workspace while a unit is held.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssignmentRecord {
    pub id: Uuid,
    pub unit_id: UnitId,
    pub agent_id: AgentId,
    pub workspace: WorkspaceRef,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_heartbeat: Option<DateTime<Utc>>,
}

impl AssignmentRecord {
    pub fn new(unit_id: UnitId, agent_id: AgentId, workspace: WorkspaceRef, started_at: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            unit_id,
            agent_id,
            workspace,
            started_at,
            last_heartbeat: None,
        }
    }

    /// Last heartbeat, or the start time when none arrived yet.
    pub fn last_activity(&self) -> DateTime<Utc> {
        self.last_heartbeat.unwrap_or(self.started_at)
    }

    /// Time since the last observed activity.
    pub fn idle_for(&self, now: DateTime<Utc>) -> Duration {
        now - self.last_activity()
    }

    /// Total lifetime of the assignment.
    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        now - self.started_at
    }
}

// ============================================================================
// Signals
// ============================================================================

/// Result reported by an agent on completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Success,
    Failure,
}

impl Outcome {
    /// Status the unit moves to after completion.
    pub fn target_status(&self) -> UnitStatus {
        match self {
            Self::Success => UnitStatus::Review,
            Self::Failure => UnitStatus::Failed,
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Success => write!(f, "success"),
            Self::Failure => write!(f, "failure"),
        }
    }
}

/// Why a held unit went back to the ready pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReleaseReason {
    /// The agent abandoned the unit.
    Voluntary,
    /// No activity within the inactivity threshold.
    Stale,
    /// The holding agent was deregistered.
    AgentDeregistered,
    /// Operator action.
    Manual(String),
}

impl fmt::Display for ReleaseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Voluntary => write!(f, "voluntary"),
            Self::Stale => write!(f, "stale"),
            Self::AgentDeregistered => write!(f, "agent_deregistered"),
            Self::Manual(note) => write!(f, "manual: {}", note),
        }
    }
}

/// Liveness signal from an agent working on a unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Heartbeat {
    pub unit_id: UnitId,
    pub agent_id: AgentId,
    pub timestamp: DateTime<Utc>,
}

/// Completion signal from an agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionSignal {
    pub unit_id: UnitId,
    pub outcome: Outcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit_reference: Option<String>,
}
