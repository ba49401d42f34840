// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Configuration type definitions.
//!
//! Defines the structure of the orchestrator configuration, supporting
//! JSON and YAML formats. Every section has defaults so partial files work.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Resolved orchestrator configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct OrchestratorConfig {
    /// Shared repository and workspace naming.
    pub repository: RepositoryConfig,
    /// Global resource limits enforced by the guardrail layer.
    pub limits: LimitsConfig,
    /// Priority scheduler weights.
    pub scheduler: SchedulerConfig,
    /// Progress monitor thresholds and policy.
    pub monitor: MonitorConfig,
    /// Workspace lifecycle settings.
    pub workspace: WorkspaceSettings,
    /// Conflict risk handling.
    pub conflicts: ConflictConfig,
    /// Event channel settings.
    pub events: EventsConfig,
}

impl OrchestratorConfig {
    /// Reject configurations the coordinator cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.limits.max_active_workspaces == 0 {
            return Err(ConfigError::invalid("limits.maxActiveWorkspaces", "must be at least 1"));
        }
        if self.limits.max_assignments_per_agent == 0 {
            return Err(ConfigError::invalid("limits.maxAssignmentsPerAgent", "must be at least 1"));
        }
        if self.limits.default_agent_concurrency == 0 {
            return Err(ConfigError::invalid("limits.defaultAgentConcurrency", "must be at least 1"));
        }
        if self.monitor.scan_interval_secs == 0 {
            return Err(ConfigError::invalid("monitor.scanIntervalSecs", "must be at least 1"));
        }
        if self.monitor.inactivity_threshold_secs == 0 {
            return Err(ConfigError::invalid("monitor.inactivityThresholdSecs", "must be at least 1"));
        }
        if self.monitor.max_assignment_lifetime_secs < self.monitor.inactivity_threshold_secs {
            return Err(ConfigError::invalid(
                "monitor.maxAssignmentLifetimeSecs",
                "must not be shorter than the inactivity threshold",
            ));
        }
        if self.workspace.teardown_timeout_secs == 0 {
            return Err(ConfigError::invalid("workspace.teardownTimeoutSecs", "must be at least 1"));
        }
        if self.events.channel_capacity == 0 {
            return Err(ConfigError::invalid("events.channelCapacity", "must be at least 1"));
        }
        if self.repository.base_branch.trim().is_empty() {
            return Err(ConfigError::invalid("repository.baseBranch", "must not be empty"));
        }
        self.scheduler.weights.validate()
    }
}

/// Repository and workspace naming settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RepositoryConfig {
    /// Root of the shared repository.
    pub root: PathBuf,
    /// Branch workspaces are created from.
    pub base_branch: String,
    /// Branches no workspace may ever target.
    pub protected_branches: Vec<String>,
    /// Directory holding workspaces (defaults to the repository's parent).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workspace_dir: Option<PathBuf>,
    /// Prefix for workspace directory names.
    pub workspace_prefix: String,
    /// Prefix for workspace branch names.
    pub branch_prefix: String,
}

impl Default for RepositoryConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("."),
            base_branch: "main".to_string(),
            protected_branches: vec!["main".to_string(), "master".to_string()],
            workspace_dir: None,
            workspace_prefix: "foreman-".to_string(),
            branch_prefix: "work".to_string(),
        }
    }
}

/// Global resource limits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct LimitsConfig {
    /// Active workspaces allowed per repository.
    pub max_active_workspaces: usize,
    /// Hard cap on assignments per agent, regardless of what it asks for.
    pub max_assignments_per_agent: usize,
    /// Concurrency given to agents registered without an explicit value.
    pub default_agent_concurrency: usize,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_active_workspaces: 8,
            max_assignments_per_agent: 4,
            default_agent_concurrency: 1,
        }
    }
}

/// Scheduler configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SchedulerConfig {
    pub weights: ScoringWeights,
}

/// Weights of the priority score terms.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ScoringWeights {
    pub critical: f64,
    pub high: f64,
    pub medium: f64,
    pub low: f64,
    /// Added when a unit has no open blockers.
    pub readiness_bonus: f64,
    /// Points per hour of age.
    pub age_per_hour: f64,
    /// Upper bound of the age term.
    pub age_cap: f64,
    /// Points per downstream unit waiting on this one.
    pub fan_out_per_unit: f64,
    /// Upper bound of the fan-out term.
    pub fan_out_cap: f64,
}

impl Default for ScoringWeights {
    fn default() -> Self {
        Self {
            critical: 1000.0,
            high: 600.0,
            medium: 300.0,
            low: 100.0,
            readiness_bonus: 50.0,
            age_per_hour: 5.0,
            age_cap: 200.0,
            fan_out_per_unit: 25.0,
            fan_out_cap: 250.0,
        }
    }
}

impl ScoringWeights {
    fn validate(&self) -> Result<(), ConfigError> {
        let terms = [
            ("critical", self.critical),
            ("high", self.high),
            ("medium", self.medium),
            ("low", self.low),
            ("readinessBonus", self.readiness_bonus),
            ("agePerHour", self.age_per_hour),
            ("ageCap", self.age_cap),
            ("fanOutPerUnit", self.fan_out_per_unit),
            ("fanOutCap", self.fan_out_cap),
        ];
        for (name, value) in terms {
            if !value.is_finite() || value < 0.0 {
                return Err(ConfigError::invalid(
                    format!("scheduler.weights.{}", name),
                    "must be a non-negative number",
                ));
            }
        }
        if !(self.critical > self.high && self.high > self.medium && self.medium > self.low) {
            return Err(ConfigError::invalid(
                "scheduler.weights",
                "tier weights must satisfy critical > high > medium > low",
            ));
        }
        Ok(())
    }
}

/// What the monitor does with stale assignments.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReclaimPolicy {
    /// Alert and release the unit back to the ready pool.
    #[default]
    AutoReclaim,
    /// Alert only.
    AlertOnly,
}

/// Progress monitor settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct MonitorConfig {
    pub scan_interval_secs: u64,
    pub inactivity_threshold_secs: u64,
    pub max_assignment_lifetime_secs: u64,
    pub agent_silence_threshold_secs: u64,
    pub policy: ReclaimPolicy,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            scan_interval_secs: 30,
            inactivity_threshold_secs: 900,
            max_assignment_lifetime_secs: 14_400,
            agent_silence_threshold_secs: 3_600,
            policy: ReclaimPolicy::AutoReclaim,
        }
    }
}

impl MonitorConfig {
    pub fn scan_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.scan_interval_secs)
    }

    pub fn inactivity_threshold(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.inactivity_threshold_secs as i64)
    }

    pub fn max_assignment_lifetime(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.max_assignment_lifetime_secs as i64)
    }

    pub fn agent_silence_threshold(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.agent_silence_threshold_secs as i64)
    }
}

/// Workspace lifecycle settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct WorkspaceSettings {
    /// Upper bound on a single teardown.
    pub teardown_timeout_secs: u64,
    /// Delete the branch of failed units on completion.
    pub cleanup_on_complete: bool,
}

impl Default for WorkspaceSettings {
    fn default() -> Self {
        Self {
            teardown_timeout_secs: 120,
            cleanup_on_complete: true,
        }
    }
}

impl WorkspaceSettings {
    pub fn teardown_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.teardown_timeout_secs)
    }
}

/// How overlapping `touches` declarations are treated at assignment time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictPolicy {
    /// No conflict check.
    Ignore,
    /// Emit a conflict risk event and assign anyway.
    #[default]
    Warn,
    /// Skip candidates that overlap in-flight work.
    Defer,
}

/// Conflict risk settings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ConflictConfig {
    pub policy: ConflictPolicy,
}

/// Event channel settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct EventsConfig {
    pub channel_capacity: usize,
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self { channel_capacity: 256 }
    }
}
