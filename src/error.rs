// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Error types for the Foreman orchestration core.
//!
//! This module provides strongly-typed errors for each component, using
//! `thiserror` for ergonomic error definitions and `anyhow` for propagation
//! in the binary. Every error except [`OrchestrationError::InvariantViolation`]
//! is recoverable at the coordinator/monitor layer.

use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

use crate::types::{AgentId, UnitId, UnitStatus};

/// Errors raised by the dependency graph.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GraphError {
    #[error("Dependency cycle detected: {}", format_cycle(.path))]
    CycleDetected { path: Vec<UnitId> },

    #[error("Unit cannot block itself: {0}")]
    SelfDependency(UnitId),

    #[error("Unknown unit in dependency graph: {0}")]
    UnknownUnit(UnitId),
}

fn format_cycle(path: &[UnitId]) -> String {
    path.iter()
        .map(|id| id.as_str())
        .collect::<Vec<_>>()
        .join(" -> ")
}

/// Errors raised by the workspace manager and version-control backends.
#[derive(Error, Debug)]
pub enum WorkspaceError {
    #[error("Workspace already active for unit {0}")]
    AlreadyExists(UnitId),

    #[error("Not a versioned repository: {0}")]
    NotAVersionedRepository(PathBuf),

    #[error("Workspace has uncommitted changes: {0}")]
    DirtyWorkspace(PathBuf),

    #[error("Teardown of {path:?} timed out after {seconds}s")]
    TeardownTimedOut { path: PathBuf, seconds: u64 },

    #[error("No workspace recorded for unit {0}")]
    NotFound(UnitId),

    #[error("Another workspace operation is in flight for unit {0}")]
    Busy(UnitId),

    #[error("Version control error: {0}")]
    Vcs(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl WorkspaceError {
    /// Whether the workspace may still hold work that a forced removal would lose.
    pub fn is_dirty(&self) -> bool {
        matches!(self, Self::DirtyWorkspace(_))
    }
}

/// Errors raised by an issue store.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Unit not found: {0}")]
    NotFound(UnitId),

    #[error("Store IO error: {0}")]
    Io(String),

    #[error("Store parse error: {0}")]
    Parse(String),
}

impl From<std::io::Error> for StoreError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        Self::Parse(err.to_string())
    }
}

/// Which limit denied a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CapacityLimit {
    /// Agent holds as many units as it may.
    Agent { agent_id: AgentId, limit: usize },
    /// Repository has as many active workspaces as it may.
    Repository { limit: usize },
}

impl fmt::Display for CapacityLimit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Agent { agent_id, limit } => {
                write!(f, "agent {} at its limit of {} assignments", agent_id, limit)
            }
            Self::Repository { limit } => {
                write!(f, "repository at its limit of {} active workspaces", limit)
            }
        }
    }
}

/// Errors surfaced by the assignment coordinator and progress monitor.
#[derive(Error, Debug)]
pub enum OrchestrationError {
    #[error("Lost the race for unit {0}")]
    Contention(UnitId),

    #[error("Workspace unavailable for unit {unit_id}: {source}")]
    ResourceUnavailable {
        unit_id: UnitId,
        #[source]
        source: WorkspaceError,
    },

    #[error("Workspace for unit {0} has uncommitted changes")]
    DirtyState(UnitId),

    #[error(transparent)]
    Graph(#[from] GraphError),

    #[error("Capacity exceeded: {0}")]
    CapacityExceeded(CapacityLimit),

    #[error("No ready work for agent {0}")]
    NoReadyWork(AgentId),

    #[error("Assignment for unit {unit_id} is stale ({idle_secs}s idle)")]
    StaleAssignment { unit_id: UnitId, idle_secs: i64 },

    #[error("Denied by policy {policy}: {reason}")]
    PolicyDenied { policy: String, reason: String },

    #[error("Unit not found: {0}")]
    UnitNotFound(UnitId),

    #[error("Agent not found: {0}")]
    AgentNotFound(AgentId),

    #[error("Agent already registered: {0}")]
    AgentAlreadyRegistered(AgentId),

    #[error("Unit {unit_id} is {actual}, expected {expected}")]
    InvalidTransition {
        unit_id: UnitId,
        expected: UnitStatus,
        actual: UnitStatus,
    },

    #[error("Unit {unit_id} is not held by agent {agent_id}")]
    NotHolder { unit_id: UnitId, agent_id: AgentId },

    #[error("Workspace error: {0}")]
    Workspace(#[from] WorkspaceError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Invariant violated: {0}")]
    InvariantViolation(String),
}

impl OrchestrationError {
    /// Whether the caller should retry the request later.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Contention(_)
                | Self::ResourceUnavailable { .. }
                | Self::CapacityExceeded(_)
                | Self::NoReadyWork(_)
                | Self::DirtyState(_)
        )
    }

    /// Whether the error means the atomicity guarantee was broken.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::InvariantViolation(_))
    }

    /// Whether a human should be notified.
    pub fn requires_escalation(&self) -> bool {
        self.is_fatal() || matches!(self, Self::Workspace(WorkspaceError::TeardownTimedOut { .. }))
    }
}

/// Errors that can occur during configuration loading.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Config file not found: {0}")]
    NotFound(String),

    #[error("Invalid value for {field}: {message}")]
    InvalidValue { field: String, message: String },

    #[error("IO error reading config: {0}")]
    IoError(String),

    #[error("YAML parsing error: {0}")]
    YamlError(String),

    #[error("JSON parsing error: {0}")]
    JsonError(String),
}

impl ConfigError {
    pub fn invalid(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidValue {
            field: field.into(),
            message: message.into(),
        }
    }
}

impl From<std::io::Error> for ConfigError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound => Self::NotFound(err.to_string()),
            _ => Self::IoError(err.to_string()),
        }
    }
}

impl From<serde_json::Error> for ConfigError {
    fn from(err: serde_json::Error) -> Self {
        Self::JsonError(err.to_string())
    }
}

impl From<serde_yaml::Error> for ConfigError {
    fn from(err: serde_yaml::Error) -> Self {
        Self::YamlError(err.to_string())
    }
}

/// Result type alias using anyhow for flexible error handling.
pub type Result<T> = anyhow::Result<T>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(OrchestrationError::Contention(UnitId::from("u1")).is_retryable());
        assert!(OrchestrationError::CapacityExceeded(CapacityLimit::Repository { limit: 2 }).is_retryable());
        assert!(OrchestrationError::NoReadyWork(AgentId::from("a1")).is_retryable());
        assert!(!OrchestrationError::InvariantViolation("two workspaces".to_string()).is_retryable());
    }

    #[test]
    fn test_only_invariant_violation_is_fatal() {
        assert!(OrchestrationError::InvariantViolation("x".to_string()).is_fatal());
        assert!(!OrchestrationError::DirtyState(UnitId::from("u1")).is_fatal());
        let cycle: OrchestrationError = GraphError::CycleDetected {
            path: vec![UnitId::from("a"), UnitId::from("b"), UnitId::from("a")],
        }
        .into();
        assert!(!cycle.is_fatal());
        assert!(!cycle.is_retryable());
    }

    #[test]
    fn test_cycle_display() {
        let err = GraphError::CycleDetected {
            path: vec![UnitId::from("a"), UnitId::from("b"), UnitId::from("a")],
        };
        assert_eq!(err.to_string(), "Dependency cycle detected: a -> b -> a");
    }

    #[test]
    fn test_capacity_display() {
        let err = OrchestrationError::CapacityExceeded(CapacityLimit::Agent {
            agent_id: AgentId::from("a1"),
            limit: 2,
        });
        let display = err.to_string();
        assert!(display.contains("a1"));
        assert!(display.contains('2'));
    }

    #[test]
    fn test_teardown_timeout_escalates() {
        let err = OrchestrationError::Workspace(WorkspaceError::TeardownTimedOut {
            path: PathBuf::from("/tmp/ws"),
            seconds: 120,
        });
        assert!(err.requires_escalation());
        assert!(!err.is_fatal());
    }

    #[test]
    fn test_config_error_from_json() {
        let result: std::result::Result<serde_json::Value, _> = serde_json::from_str("invalid json");
        let config_err: ConfigError = result.unwrap_err().into();
        assert!(matches!(config_err, ConfigError::JsonError(_)));
    }
}
