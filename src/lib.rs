// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Foreman - multi-agent work orchestration.
//!
//! Hands discrete units of work to autonomous agents, gives every assignment
//! an isolated, branch-scoped workspace of a shared repository, sequences work
//! by dependency and priority, and reclaims stalled or abandoned work.
//!
//! # Architecture
//!
//! The crate is organized into the following modules, leaf-first:
//!
//! - [`types`] - Core type definitions (UnitOfWork, Agent, AssignmentRecord, signals)
//! - [`error`] - Error taxonomy and result aliases
//! - [`config`] - Configuration loading and merging
//! - [`telemetry`] - Tracing initialisation and orchestration metrics
//! - [`store`] - Issue store capability and the per-unit guarded arena
//! - [`workspace`] - Isolated workspaces over a version-control capability
//! - [`graph`] - Dependency graph and conflict risk detection
//! - [`scheduler`] - Priority ranking of ready work
//! - [`guardrails`] - Pluggable assignment and integration policies
//! - [`coordinator`] - Transactional assignment and the event channel
//! - [`monitor`] - Stale work, orphan and invariant scanning
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use foreman::config::{load_config, CliOptions};
//! use foreman::coordinator::{AssignmentCoordinator, EventSink};
//! use foreman::workspace::{GitWorktreeBackend, WorkspaceManager};
//!
//! let config = load_config(".".as_ref(), CliOptions::default())?;
//! let workspaces = Arc::new(WorkspaceManager::from_config(
//!     Arc::new(GitWorktreeBackend::new()),
//!     &config,
//! ));
//! let (events, mut rx) = EventSink::channel(config.events.channel_capacity);
//! let coordinator = AssignmentCoordinator::new(config, workspaces, events);
//! let record = coordinator.request_assignment(&"agent-1".into()).await?;
//! ```

pub mod config;
pub mod coordinator;
pub mod error;
pub mod graph;
pub mod guardrails;
pub mod monitor;
pub mod scheduler;
pub mod store;
pub mod telemetry;
pub mod types;
pub mod workspace;

// Re-export commonly used types at crate root
pub use coordinator::{AssignmentCoordinator, CompleteOptions, EventSink, OrchestratorEvent, Severity};
pub use error::{ConfigError, GraphError, OrchestrationError, Result, StoreError, WorkspaceError};
pub use graph::DependencyGraph;
pub use monitor::{ProgressMonitor, ScanReport};
pub use scheduler::PriorityScheduler;
pub use types::{
    Agent, AgentId, AssignmentRecord, Capability, CompletionSignal, DependencyEdge, Heartbeat,
    Outcome, PriorityTier, ReleaseReason, UnitId, UnitOfWork, UnitStatus, WorkspaceRef,
};
pub use workspace::WorkspaceManager;

/// Foreman version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }

    #[test]
    fn test_public_exports() {
        let unit = UnitOfWork::new("u1", "key");
        assert_eq!(unit.status, UnitStatus::Open);
        let _agent = Agent::new("a1", 1);
        let _graph = DependencyGraph::new();
    }
}
