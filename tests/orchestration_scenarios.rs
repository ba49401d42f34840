// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! End-to-end orchestration scenarios over the in-memory repository backend.

use std::sync::Arc;

use chrono::{Duration, Utc};
use tempfile::{tempdir, TempDir};
use tokio::sync::mpsc;

use foreman::config::OrchestratorConfig;
use foreman::coordinator::{AssignmentCoordinator, CompleteOptions, EventSink, OrchestratorEvent};
use foreman::monitor::ProgressMonitor;
use foreman::store::{IssueStore, JsonlIssueStore};
use foreman::types::{Agent, AgentId, Heartbeat, Outcome, PriorityTier, UnitId, UnitOfWork, UnitStatus};
use foreman::workspace::{InMemoryVcs, TeardownOutcome, WorkspaceManager, WorkspaceStatus};
use foreman::{DependencyGraph, GraphError, OrchestrationError, PriorityScheduler};

struct Harness {
    dir: TempDir,
    vcs: Arc<InMemoryVcs>,
    coordinator: Arc<AssignmentCoordinator>,
    events: mpsc::Receiver<OrchestratorEvent>,
}

fn harness() -> Harness {
    let dir = tempdir().unwrap();
    let mut config = OrchestratorConfig::default();
    config.repository.root = dir.path().join("repo");
    config.repository.workspace_dir = Some(dir.path().join("workspaces"));
    std::fs::create_dir_all(&config.repository.root).unwrap();

    let vcs = Arc::new(InMemoryVcs::with_repository(&config.repository.root, "main"));
    let workspaces = Arc::new(WorkspaceManager::from_config(vcs.clone(), &config));
    let (sink, events) = EventSink::channel(config.events.channel_capacity);
    Harness {
        dir,
        vcs,
        coordinator: Arc::new(AssignmentCoordinator::new(config, workspaces, sink)),
        events,
    }
}

fn id(s: &str) -> UnitId {
    UnitId::from(s)
}

fn event_names(events: &mut mpsc::Receiver<OrchestratorEvent>) -> Vec<&'static str> {
    let mut names = Vec::new();
    while let Ok(event) = events.try_recv() {
        names.push(event.name());
    }
    names
}

// ============================================================================
// Dependency scenarios
// ============================================================================

#[tokio::test]
async fn test_blocker_completion_makes_dependent_assignable() {
    let mut h = harness();
    h.coordinator
        .load_units(vec![
            UnitOfWork::new("A", "schema"),
            UnitOfWork::new("B", "api").with_blocker("A"),
        ])
        .await
        .unwrap();
    h.coordinator.register_agent(Agent::new("agent-1", 1)).unwrap();
    let agent = AgentId::from("agent-1");

    assert_eq!(h.coordinator.unit(&id("B")).unwrap().status, UnitStatus::Blocked);
    let first = h.coordinator.request_assignment(&agent).await.unwrap();
    assert_eq!(first.unit_id, id("A"));

    h.coordinator.start_work(&id("A"), &agent).await.unwrap();
    h.coordinator
        .complete_assignment(&id("A"), Outcome::Success, CompleteOptions::default())
        .await
        .unwrap();
    // Not done until review accepts it.
    assert!(matches!(
        h.coordinator.request_assignment(&agent).await,
        Err(OrchestrationError::NoReadyWork(_))
    ));

    event_names(&mut h.events);
    assert_eq!(h.coordinator.accept_review(&id("A")).await.unwrap(), vec![id("B")]);
    assert_eq!(event_names(&mut h.events), vec!["unit_ready"]);

    let second = h.coordinator.request_assignment(&agent).await.unwrap();
    assert_eq!(second.unit_id, id("B"));
}

#[test]
fn test_rejected_cycle_leaves_graph_identical() {
    let units = vec![
        UnitOfWork::new("a", "a"),
        UnitOfWork::new("b", "b").with_blocker("a"),
        UnitOfWork::new("c", "c").with_blocker("b"),
    ];
    let mut graph = DependencyGraph::from_units(&units).unwrap();
    let before = graph.clone();

    let err = graph.add_edge(&id("a"), &id("c")).unwrap_err();
    match err {
        GraphError::CycleDetected { path } => {
            assert_eq!(path.first(), Some(&id("a")));
            assert_eq!(path.last(), Some(&id("a")));
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(graph, before);
}

#[test]
fn test_ranking_is_reproducible() {
    let now = Utc::now();
    let units: Vec<UnitOfWork> = (0..20)
        .map(|i| {
            let tier = match i % 4 {
                0 => PriorityTier::Low,
                1 => PriorityTier::Medium,
                2 => PriorityTier::High,
                _ => PriorityTier::Critical,
            };
            UnitOfWork::new(format!("u{:02}", i), format!("k{}", i))
                .with_status(UnitStatus::Ready)
                .with_priority(tier)
                .with_created_at(now - Duration::minutes(i))
        })
        .collect();
    let graph = DependencyGraph::from_units(&units).unwrap();
    let scheduler = PriorityScheduler::default();

    let first = scheduler.rank(&units, &graph, now);
    for _ in 0..5 {
        assert_eq!(scheduler.rank(&units, &graph, now), first);
    }
    assert_eq!(first[0].priority, PriorityTier::Critical);
}

// ============================================================================
// Assignment scenarios
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn test_many_agents_one_unit() {
    let h = harness();
    h.coordinator
        .load_units(vec![UnitOfWork::new("contested", "contested")])
        .await
        .unwrap();
    for i in 0..16 {
        h.coordinator
            .register_agent(Agent::new(format!("agent-{}", i), 1))
            .unwrap();
    }

    let tasks: Vec<_> = (0..16)
        .map(|i| {
            let coordinator = h.coordinator.clone();
            tokio::spawn(async move {
                coordinator
                    .request_assignment(&AgentId::new(format!("agent-{}", i)))
                    .await
            })
        })
        .collect();

    let mut winners = Vec::new();
    for task in tasks {
        if let Ok(record) = task.await.unwrap() {
            winners.push(record.agent_id);
        }
    }
    assert_eq!(winners.len(), 1);

    let unit = h.coordinator.unit(&id("contested")).unwrap();
    assert_eq!(unit.assigned_agent.as_ref(), winners.first());
    assert_eq!(h.vcs.worktree_count(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_unrelated_units_assign_in_parallel() {
    let h = harness();
    let units = (0..6).map(|i| UnitOfWork::new(format!("u{}", i), format!("k{}", i))).collect();
    h.coordinator.load_units(units).await.unwrap();
    for i in 0..6 {
        h.coordinator
            .register_agent(Agent::new(format!("agent-{}", i), 1))
            .unwrap();
    }

    let tasks: Vec<_> = (0..6)
        .map(|i| {
            let coordinator = h.coordinator.clone();
            tokio::spawn(async move {
                let agent = AgentId::new(format!("agent-{}", i));
                // Retry on losing a race; all six units exist for six agents.
                loop {
                    match coordinator.request_assignment(&agent).await {
                        Ok(record) => return record.unit_id,
                        Err(e) if e.is_retryable() => tokio::task::yield_now().await,
                        Err(e) => panic!("{e}"),
                    }
                }
            })
        })
        .collect();

    let mut assigned = Vec::new();
    for task in tasks {
        assigned.push(task.await.unwrap());
    }
    assigned.sort();
    assigned.dedup();
    assert_eq!(assigned.len(), 6);
    assert_eq!(h.coordinator.assignments().len(), 6);
}

#[tokio::test]
async fn test_capacity_denial_mutates_nothing() {
    let h = harness();
    h.coordinator
        .load_units(vec![UnitOfWork::new("a", "a"), UnitOfWork::new("b", "b")])
        .await
        .unwrap();
    h.coordinator.register_agent(Agent::new("solo", 1)).unwrap();
    let agent = AgentId::from("solo");
    h.coordinator.request_assignment(&agent).await.unwrap();

    let units_before = h.coordinator.units();
    let agent_before = h.coordinator.agent(&agent).unwrap();
    let err = h.coordinator.request_assignment(&agent).await.unwrap_err();

    assert!(matches!(err, OrchestrationError::CapacityExceeded(_)));
    assert_eq!(h.coordinator.units(), units_before);
    assert_eq!(h.coordinator.agent(&agent).unwrap(), agent_before);
    assert_eq!(h.vcs.create_calls(), 1);
}

// ============================================================================
// Workspace scenarios
// ============================================================================

#[tokio::test]
async fn test_dirty_teardown_then_forced() {
    let h = harness();
    let unit = UnitOfWork::new("w1", "Fix: login/redirect!");
    let workspaces = h.coordinator.workspaces();
    let ws = workspaces.provision(&unit).await.unwrap();
    h.vcs.set_dirty(&ws.path, true);

    let err = workspaces.teardown(&unit.id, false).await.unwrap_err();
    assert!(err.is_dirty());
    assert_eq!(workspaces.status(&unit.id).await, Some(WorkspaceStatus::Active));

    let outcome = workspaces.teardown(&unit.id, true).await.unwrap();
    assert_eq!(outcome, TeardownOutcome::RemovedDiscardingChanges);
    assert_eq!(workspaces.status(&unit.id).await, Some(WorkspaceStatus::Removed));

    assert_eq!(
        workspaces.teardown(&unit.id, true).await.unwrap(),
        TeardownOutcome::AlreadyRemoved
    );
    assert_eq!(h.vcs.remove_calls(), 1);
}

#[tokio::test]
async fn test_workspace_names_are_distinct_and_safe() {
    let h = harness();
    let workspaces = h.coordinator.workspaces();
    let a = workspaces.derive(&UnitOfWork::new("1", "Feature/Login"));
    let b = workspaces.derive(&UnitOfWork::new("2", "feature-login"));

    assert_ne!(a.branch, b.branch);
    assert_ne!(a.path, b.path);
    for ws in [&a, &b] {
        let name = ws.path.file_name().unwrap().to_string_lossy().to_string();
        assert!(name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || "._-".contains(c)));
        assert!(ws.path.starts_with(h.dir.path().join("workspaces")));
    }
}

// ============================================================================
// Monitor scenarios
// ============================================================================

#[tokio::test]
async fn test_stale_in_progress_unit_is_reclaimed() {
    let mut h = harness();
    h.coordinator
        .load_units(vec![UnitOfWork::new("slow", "slow")])
        .await
        .unwrap();
    h.coordinator.register_agent(Agent::new("sleepy", 1)).unwrap();
    let agent = AgentId::from("sleepy");
    let record = h.coordinator.request_assignment(&agent).await.unwrap();
    h.coordinator.start_work(&record.unit_id, &agent).await.unwrap();
    event_names(&mut h.events);

    let monitor = ProgressMonitor::new(h.coordinator.clone());
    let report = monitor.scan_at(record.started_at + Duration::minutes(30)).await;

    assert_eq!(report.reclaimed(), 1);
    assert_eq!(h.coordinator.unit(&id("slow")).unwrap().status, UnitStatus::Ready);
    assert!(!record.workspace.path.exists());
    let names = event_names(&mut h.events);
    assert!(names.contains(&"stale_work_detected"));
    assert!(names.contains(&"work_released"));

    // The reclaimed unit is assignable again.
    h.coordinator.register_agent(Agent::new("fresh", 1)).unwrap();
    let again = h
        .coordinator
        .request_assignment(&AgentId::from("fresh"))
        .await
        .unwrap();
    assert_eq!(again.unit_id, id("slow"));
}

// ============================================================================
// Store
// ============================================================================

#[tokio::test]
async fn test_restart_detects_stale_and_overlong_holds() {
    let h = harness();
    let path = h.dir.path().join("units.jsonl");
    std::fs::write(&path, r#"{"id":"u1","key":"feature-one","created_at":"2026-01-05T09:00:00Z"}"#).unwrap();
    let config = h.coordinator.config().clone();
    let agent = AgentId::from("agent-1");

    // First run: assign, start and beat once, then stop.
    let record = {
        let store = Arc::new(JsonlIssueStore::open(&path).await.unwrap());
        let workspaces = Arc::new(WorkspaceManager::from_config(h.vcs.clone(), &config));
        let coordinator = AssignmentCoordinator::new(config.clone(), workspaces, EventSink::disabled())
            .with_store(store.clone());
        coordinator.load_units(store.list_all().await.unwrap()).await.unwrap();
        coordinator.register_agent(Agent::new("agent-1", 1)).unwrap();
        let record = coordinator.request_assignment(&agent).await.unwrap();
        coordinator.start_work(&record.unit_id, &agent).await.unwrap();
        coordinator
            .heartbeat(Heartbeat {
                unit_id: record.unit_id.clone(),
                agent_id: agent.clone(),
                timestamp: record.started_at + Duration::minutes(1),
            })
            .await
            .unwrap();
        record
    };

    // Second run over the same store and repository.
    let store = Arc::new(JsonlIssueStore::open(&path).await.unwrap());
    let saved = store.get(&id("u1")).await.unwrap();
    assert_eq!(saved.assigned_at, Some(record.started_at));
    let workspaces = Arc::new(WorkspaceManager::from_config(h.vcs.clone(), &config));
    let coordinator = Arc::new(
        AssignmentCoordinator::new(config, workspaces, EventSink::disabled()).with_store(store.clone()),
    );
    coordinator.load_units(store.list_all().await.unwrap()).await.unwrap();
    assert_eq!(coordinator.adopt_workspaces().await.unwrap(), 1);
    assert_eq!(coordinator.assignments()[0].started_at, record.started_at);

    let monitor = ProgressMonitor::new(coordinator.clone());
    let report = monitor.scan_at(record.started_at + Duration::hours(5)).await;

    assert_eq!(report.stale.len(), 1);
    assert!(report.stale[0].reclaimed);
    assert_eq!(report.lifetime_exceeded, vec![id("u1")]);
    assert_eq!(report.agents_deregistered, vec![agent]);
    assert_eq!(coordinator.unit(&id("u1")).unwrap().status, UnitStatus::Ready);
    assert!(!record.workspace.path.exists());
    assert_eq!(store.get(&id("u1")).await.unwrap().status, UnitStatus::Ready);
}

#[tokio::test]
async fn test_jsonl_store_tracks_lifecycle() {
    let h = harness();
    let path = h.dir.path().join("units.jsonl");
    let lines = [
        r#"{"id":"a","key":"a","priority":"high","created_at":"2026-01-05T09:00:00Z"}"#,
        r#"{"id":"b","key":"b","created_at":"2026-01-05T09:30:00Z","blocked_by":["a"]}"#,
    ];
    std::fs::write(&path, lines.join("\n")).unwrap();
    let store = Arc::new(JsonlIssueStore::open(&path).await.unwrap());

    let config = h.coordinator.config().clone();
    let workspaces = Arc::new(WorkspaceManager::from_config(h.vcs.clone(), &config));
    let coordinator = AssignmentCoordinator::new(config, workspaces, EventSink::disabled())
        .with_store(store.clone());
    coordinator.load_units(store.list_all().await.unwrap()).await.unwrap();
    coordinator.register_agent(Agent::new("agent-1", 1)).unwrap();
    coordinator
        .request_assignment(&AgentId::from("agent-1"))
        .await
        .unwrap();

    let reopened = JsonlIssueStore::open(&path).await.unwrap();
    let a = reopened.get(&id("a")).await.unwrap();
    assert_eq!(a.status, UnitStatus::Assigned);
    assert_eq!(a.assigned_agent, Some(AgentId::from("agent-1")));
    assert!(a.workspace.is_some());
    assert_eq!(reopened.get(&id("b")).await.unwrap().status, UnitStatus::Blocked);
}
