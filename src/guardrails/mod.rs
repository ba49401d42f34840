// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Safety guardrails.
//!
//! Hard constraints checked by the coordinator before it mutates any state.
//! Each constraint is an [`AssignmentPolicy`]: a named allow/deny predicate.
//! New constraints are added to a [`GuardrailSet`] without touching the
//! coordinator.
//!
//! Built-in policies:
//! - [`MaxWorkspacesPerRepository`]
//! - [`MaxAssignmentsPerAgent`]
//! - [`ProtectedBranchPolicy`]: no workspace branch may be, or integrate
//!   directly into, a protected branch
//!
//! [`WorkspaceBudget`] backs the repository cap with an atomic reservation,
//! and [`LifetimeGuard`] flags assignments that outlive their maximum age.

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};

use chrono::{DateTime, Utc};
use globset::{Glob, GlobSet, GlobSetBuilder};
use tracing::{debug, warn};

use crate::config::OrchestratorConfig;
use crate::error::{CapacityLimit, OrchestrationError};
use crate::types::{Agent, AssignmentRecord, UnitOfWork, WorkspaceRef};

// ============================================================================
// Policy interface
// ============================================================================

/// Facts a policy sees when an assignment is about to be made.
#[derive(Debug, Clone, Copy)]
pub struct AssignmentContext<'a> {
    pub agent: &'a Agent,
    pub unit: &'a UnitOfWork,
    /// Where the unit's workspace would be created.
    pub workspace: &'a WorkspaceRef,
    /// Workspaces currently reserved in the repository.
    pub active_workspaces: usize,
}

/// Why a policy said no.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Denial {
    pub policy: String,
    pub reason: String,
    /// Set when the denial is a resource limit rather than a rule.
    pub capacity: Option<CapacityLimit>,
}

impl Denial {
    pub fn rule(policy: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            policy: policy.into(),
            reason: reason.into(),
            capacity: None,
        }
    }

    pub fn capacity(policy: impl Into<String>, limit: CapacityLimit) -> Self {
        Self {
            policy: policy.into(),
            reason: limit.to_string(),
            capacity: Some(limit),
        }
    }
}

impl From<Denial> for OrchestrationError {
    fn from(denial: Denial) -> Self {
        match denial.capacity {
            Some(limit) => OrchestrationError::CapacityExceeded(limit),
            None => OrchestrationError::PolicyDenied {
                policy: denial.policy,
                reason: denial.reason,
            },
        }
    }
}

/// Outcome of a policy check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PolicyDecision {
    Allow,
    Deny(Denial),
}

/// A pluggable hard constraint.
pub trait AssignmentPolicy: Send + Sync + fmt::Debug {
    /// Stable name used in denials and logs.
    fn name(&self) -> &str;

    /// Check a pending assignment.
    fn check_assignment(&self, ctx: &AssignmentContext<'_>) -> PolicyDecision;

    /// Check an integration of `source` into `target`. Allowed by default.
    fn check_integration(&self, _source: &str, _target: &str) -> PolicyDecision {
        PolicyDecision::Allow
    }
}

// ============================================================================
// Built-in policies
// ============================================================================

/// Cap on concurrently active workspaces in the repository.
#[derive(Debug, Clone)]
pub struct MaxWorkspacesPerRepository {
    pub limit: usize,
}

impl AssignmentPolicy for MaxWorkspacesPerRepository {
    fn name(&self) -> &str {
        "max_workspaces_per_repository"
    }

    fn check_assignment(&self, ctx: &AssignmentContext<'_>) -> PolicyDecision {
        if ctx.active_workspaces >= self.limit {
            PolicyDecision::Deny(Denial::capacity(
                self.name(),
                CapacityLimit::Repository { limit: self.limit },
            ))
        } else {
            PolicyDecision::Allow
        }
    }
}

/// Global cap on units held by one agent, on top of the agent's own limit.
#[derive(Debug, Clone)]
pub struct MaxAssignmentsPerAgent {
    pub limit: usize,
}

impl AssignmentPolicy for MaxAssignmentsPerAgent {
    fn name(&self) -> &str {
        "max_assignments_per_agent"
    }

    fn check_assignment(&self, ctx: &AssignmentContext<'_>) -> PolicyDecision {
        let limit = self.limit.min(ctx.agent.max_concurrent);
        if ctx.agent.assignments.len() >= limit {
            PolicyDecision::Deny(Denial::capacity(
                self.name(),
                CapacityLimit::Agent {
                    agent_id: ctx.agent.id.clone(),
                    limit,
                },
            ))
        } else {
            PolicyDecision::Allow
        }
    }
}

/// Keeps work off the protected main line.
///
/// Patterns are globs, so `release/*` protects every release branch.
#[derive(Debug, Clone)]
pub struct ProtectedBranchPolicy {
    patterns: Vec<String>,
    matcher: GlobSet,
}

impl ProtectedBranchPolicy {
    pub fn new(patterns: &[String]) -> Self {
        let mut builder = GlobSetBuilder::new();
        let mut kept = Vec::new();
        for pattern in patterns {
            match Glob::new(pattern) {
                Ok(glob) => {
                    builder.add(glob);
                    kept.push(pattern.clone());
                }
                Err(e) => warn!(pattern = %pattern, error = %e, "Ignoring invalid protected branch pattern"),
            }
        }
        let matcher = builder.build().unwrap_or_else(|e| {
            warn!(error = %e, "Protected branch patterns failed to compile");
            GlobSet::empty()
        });
        Self {
            patterns: kept,
            matcher,
        }
    }

    pub fn is_protected(&self, branch: &str) -> bool {
        let branch = branch.strip_prefix("refs/heads/").unwrap_or(branch);
        self.matcher.is_match(branch)
    }

    pub fn patterns(&self) -> &[String] {
        &self.patterns
    }
}

impl AssignmentPolicy for ProtectedBranchPolicy {
    fn name(&self) -> &str {
        "protected_branch"
    }

    fn check_assignment(&self, ctx: &AssignmentContext<'_>) -> PolicyDecision {
        if self.is_protected(&ctx.workspace.branch) {
            PolicyDecision::Deny(Denial::rule(
                self.name(),
                format!("workspace branch {} is protected", ctx.workspace.branch),
            ))
        } else {
            PolicyDecision::Allow
        }
    }

    fn check_integration(&self, source: &str, target: &str) -> PolicyDecision {
        if self.is_protected(target) {
            PolicyDecision::Deny(Denial::rule(
                self.name(),
                format!(
                    "{} may only reach protected branch {} through review",
                    source, target
                ),
            ))
        } else {
            PolicyDecision::Allow
        }
    }
}

// ============================================================================
// Guardrail set
// ============================================================================

/// Ordered collection of policies; the first denial wins.
#[derive(Debug, Default)]
pub struct GuardrailSet {
    policies: Vec<Box<dyn AssignmentPolicy>>,
}

impl GuardrailSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// The built-in policies configured from `config`.
    pub fn from_config(config: &OrchestratorConfig) -> Self {
        Self::new()
            .with(MaxAssignmentsPerAgent {
                limit: config.limits.max_assignments_per_agent,
            })
            .with(MaxWorkspacesPerRepository {
                limit: config.limits.max_active_workspaces,
            })
            .with(ProtectedBranchPolicy::new(&config.repository.protected_branches))
    }

    pub fn with(mut self, policy: impl AssignmentPolicy + 'static) -> Self {
        self.push(policy);
        self
    }

    pub fn push(&mut self, policy: impl AssignmentPolicy + 'static) {
        self.policies.push(Box::new(policy));
    }

    pub fn len(&self) -> usize {
        self.policies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.policies.is_empty()
    }

    pub fn names(&self) -> Vec<&str> {
        self.policies.iter().map(|p| p.name()).collect()
    }

    /// Check a pending assignment against every policy.
    pub fn check_assignment(&self, ctx: &AssignmentContext<'_>) -> Result<(), Denial> {
        for policy in &self.policies {
            if let PolicyDecision::Deny(denial) = policy.check_assignment(ctx) {
                debug!(
                    policy = policy.name(),
                    unit_id = %ctx.unit.id,
                    agent_id = %ctx.agent.id,
                    reason = %denial.reason,
                    "Assignment denied"
                );
                return Err(denial);
            }
        }
        Ok(())
    }

    /// Check an integration of `source` into `target` against every policy.
    pub fn check_integration(&self, source: &str, target: &str) -> Result<(), Denial> {
        for policy in &self.policies {
            if let PolicyDecision::Deny(denial) = policy.check_integration(source, target) {
                return Err(denial);
            }
        }
        Ok(())
    }
}

// ============================================================================
// Workspace budget & lifetime
// ============================================================================

/// Atomic counter of workspace slots in the repository.
///
/// Policies see a snapshot; the budget is what makes the cap hold when
/// requests race.
#[derive(Debug)]
pub struct WorkspaceBudget {
    limit: usize,
    in_use: AtomicUsize,
}

impl WorkspaceBudget {
    pub fn new(limit: usize) -> Self {
        Self {
            limit,
            in_use: AtomicUsize::new(0),
        }
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn in_use(&self) -> usize {
        self.in_use.load(Ordering::Acquire)
    }

    /// Reserve one slot.
    pub fn try_acquire(&self) -> Result<(), CapacityLimit> {
        self.in_use
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < self.limit).then_some(n + 1)
            })
            .map(|_| ())
            .map_err(|_| CapacityLimit::Repository { limit: self.limit })
    }

    /// Return one slot. Releasing more than was acquired saturates at zero.
    pub fn release(&self) {
        let _ = self
            .in_use
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
    }

    /// Overwrite the count, e.g. after adopting existing workspaces.
    pub fn set_in_use(&self, n: usize) {
        self.in_use.store(n, Ordering::Release);
    }
}

/// Maximum lifetime of an assignment, regardless of heartbeats.
#[derive(Debug, Clone, Copy)]
pub struct LifetimeGuard {
    pub max: chrono::Duration,
}

impl LifetimeGuard {
    pub fn exceeded(&self, record: &AssignmentRecord, now: DateTime<Utc>) -> bool {
        record.age(now) > self.max
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{AgentId, UnitId};
    use std::path::PathBuf;
    use std::sync::Arc;

    fn ws(branch: &str) -> WorkspaceRef {
        WorkspaceRef {
            path: PathBuf::from("/tmp/ws"),
            branch: branch.to_string(),
        }
    }

    #[test]
    fn test_agent_cap_uses_smaller_limit() {
        let mut agent = Agent::new("a1", 1);
        let unit = UnitOfWork::new("u1", "U1");
        let workspace = ws("work/u1");
        let policy = MaxAssignmentsPerAgent { limit: 4 };

        let ctx = AssignmentContext {
            agent: &agent,
            unit: &unit,
            workspace: &workspace,
            active_workspaces: 0,
        };
        assert_eq!(policy.check_assignment(&ctx), PolicyDecision::Allow);

        agent.assignments.insert(UnitId::from("u0"));
        let ctx = AssignmentContext {
            agent: &agent,
            unit: &unit,
            workspace: &workspace,
            active_workspaces: 0,
        };
        match policy.check_assignment(&ctx) {
            PolicyDecision::Deny(denial) => assert_eq!(
                denial.capacity,
                Some(CapacityLimit::Agent {
                    agent_id: AgentId::from("a1"),
                    limit: 1
                })
            ),
            PolicyDecision::Allow => panic!("expected denial"),
        }
    }

    #[test]
    fn test_protected_branch_patterns() {
        let policy = ProtectedBranchPolicy::new(&["main".to_string(), "release/*".to_string()]);
        assert!(policy.is_protected("main"));
        assert!(policy.is_protected("refs/heads/main"));
        assert!(policy.is_protected("release/1.2"));
        assert!(!policy.is_protected("work/main-menu"));

        assert!(matches!(
            policy.check_integration("work/api-1", "main"),
            PolicyDecision::Deny(_)
        ));
        assert_eq!(policy.check_integration("work/api-1", "work/base"), PolicyDecision::Allow);
    }

    #[test]
    fn test_set_first_denial_wins_and_converts() {
        let config = OrchestratorConfig::default();
        let set = GuardrailSet::from_config(&config);
        assert_eq!(set.len(), 3);

        let agent = Agent::new("a1", 2);
        let unit = UnitOfWork::new("u1", "main");
        let workspace = ws("main");
        let ctx = AssignmentContext {
            agent: &agent,
            unit: &unit,
            workspace: &workspace,
            active_workspaces: config.limits.max_active_workspaces,
        };
        let denial = set.check_assignment(&ctx).unwrap_err();
        assert_eq!(denial.policy, "max_workspaces_per_repository");
        let err: OrchestrationError = denial.into();
        assert!(matches!(err, OrchestrationError::CapacityExceeded(_)));

        let ctx = AssignmentContext {
            active_workspaces: 0,
            ..ctx
        };
        let err: OrchestrationError = set.check_assignment(&ctx).unwrap_err().into();
        assert!(matches!(err, OrchestrationError::PolicyDenied { .. }));
    }

    #[test]
    fn test_custom_policy_plugs_in() {
        #[derive(Debug)]
        struct NoDocs;
        impl AssignmentPolicy for NoDocs {
            fn name(&self) -> &str {
                "no_docs"
            }
            fn check_assignment(&self, ctx: &AssignmentContext<'_>) -> PolicyDecision {
                if ctx.unit.key.starts_with("DOC") {
                    PolicyDecision::Deny(Denial::rule(self.name(), "documentation frozen"))
                } else {
                    PolicyDecision::Allow
                }
            }
        }

        let set = GuardrailSet::new().with(NoDocs);
        let agent = Agent::new("a1", 1);
        let workspace = ws("work/doc-1");
        let unit = UnitOfWork::new("u1", "DOC-1");
        let ctx = AssignmentContext {
            agent: &agent,
            unit: &unit,
            workspace: &workspace,
            active_workspaces: 0,
        };
        assert_eq!(set.check_assignment(&ctx).unwrap_err().policy, "no_docs");
        assert_eq!(set.names(), vec!["no_docs"]);
    }

    #[test]
    fn test_budget_never_exceeds_limit() {
        let budget = Arc::new(WorkspaceBudget::new(3));
        let handles: Vec<_> = (0..10)
            .map(|_| {
                let budget = Arc::clone(&budget);
                std::thread::spawn(move || budget.try_acquire().is_ok())
            })
            .collect();
        let granted = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|ok| *ok)
            .count();
        assert_eq!(granted, 3);
        assert_eq!(budget.in_use(), 3);

        budget.release();
        assert!(budget.try_acquire().is_ok());
        budget.set_in_use(0);
        budget.release();
        assert_eq!(budget.in_use(), 0);
    }

    #[test]
    fn test_lifetime_guard() {
        let start = Utc::now();
        let record = AssignmentRecord::new(UnitId::from("u1"), AgentId::from("a1"), ws("work/u1"), start);
        let guard = LifetimeGuard {
            max: chrono::Duration::hours(4),
        };
        assert!(!guard.exceeded(&record, start + chrono::Duration::hours(3)));
        assert!(guard.exceeded(&record, start + chrono::Duration::hours(5)));
    }
}
