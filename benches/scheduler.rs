// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Benchmarks for scheduling and dependency graph operations.
//!
//! These cover the pure, lock-free paths:
//! - Ranking ready units
//! - Graph import and cycle checks
//! - Conflict risk detection
//! - Workspace name derivation
//!
//! Run with: `cargo bench --bench scheduler`

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use std::hint::black_box;

use chrono::{Duration, Utc};

use foreman::graph::conflict;
use foreman::scheduler::PriorityScheduler;
use foreman::types::{DependencyEdge, PriorityTier, UnitId, UnitOfWork, UnitStatus};
use foreman::workspace::sanitize_key;
use foreman::DependencyGraph;

/// Units in a layered DAG: every unit after the first layer waits on two
/// units of the previous layer.
fn layered_units(count: usize) -> Vec<UnitOfWork> {
    let width = 10;
    let now = Utc::now();
    (0..count)
        .map(|i| {
            let tier = match i % 4 {
                0 => PriorityTier::Low,
                1 => PriorityTier::Medium,
                2 => PriorityTier::High,
                _ => PriorityTier::Critical,
            };
            let mut unit = UnitOfWork::new(format!("u{}", i), format!("KEY-{}", i))
                .with_priority(tier)
                .with_created_at(now - Duration::minutes(i as i64))
                .with_touches(vec![format!("src/mod{}/**", i % 17)]);
            if i >= width {
                unit = unit
                    .with_blocker(format!("u{}", i - width))
                    .with_blocker(format!("u{}", i - width + (i + 1) % width));
            } else {
                unit = unit.with_status(UnitStatus::Ready);
            }
            unit
        })
        .collect()
}

fn bench_rank(c: &mut Criterion) {
    let mut group = c.benchmark_group("scheduler_rank");
    let scheduler = PriorityScheduler::default();

    for size in [100usize, 1_000, 5_000] {
        let units: Vec<UnitOfWork> = layered_units(size)
            .into_iter()
            .map(|u| u.with_status(UnitStatus::Ready))
            .collect();
        let graph = DependencyGraph::from_units(&units).unwrap();
        let now = Utc::now();

        group.throughput(Throughput::Elements(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &units, |b, units| {
            b.iter(|| black_box(scheduler.rank(units, &graph, now)));
        });
    }

    group.finish();
}

fn bench_graph(c: &mut Criterion) {
    let mut group = c.benchmark_group("dependency_graph");

    for size in [100usize, 1_000] {
        let units = layered_units(size);
        group.bench_with_input(BenchmarkId::new("from_units", size), &units, |b, units| {
            b.iter(|| black_box(DependencyGraph::from_units(units).unwrap()));
        });

        let graph = DependencyGraph::from_units(&units).unwrap();
        let first = UnitId::from("u0");
        let last = UnitId::new(format!("u{}", size - 1));
        group.bench_with_input(BenchmarkId::new("reject_cycle", size), &graph, |b, graph| {
            b.iter(|| {
                let mut graph = graph.clone();
                black_box(graph.add_edge(&first, &last).is_err())
            });
        });

        let edges: Vec<DependencyEdge> = graph.edges();
        let ids: Vec<UnitId> = units.iter().map(|u| u.id.clone()).collect();
        group.bench_with_input(BenchmarkId::new("from_edges", size), &edges, |b, edges| {
            b.iter(|| black_box(DependencyGraph::from_edges(ids.iter().cloned(), edges).unwrap()));
        });

        group.bench_with_input(BenchmarkId::new("downstream_count", size), &graph, |b, graph| {
            b.iter(|| black_box(graph.downstream_count(&first)));
        });
    }

    group.finish();
}

fn bench_conflicts(c: &mut Criterion) {
    let mut group = c.benchmark_group("conflict_detect");

    for size in [50usize, 200] {
        let units = layered_units(size);
        group.bench_with_input(BenchmarkId::from_parameter(size), &units, |b, units| {
            b.iter(|| black_box(conflict::detect(units)));
        });
    }

    group.finish();
}

fn bench_naming(c: &mut Criterion) {
    let mut group = c.benchmark_group("workspace_naming");

    group.bench_function("clean_key", |b| {
        b.iter(|| black_box(sanitize_key("proj-1234")));
    });

    group.bench_function("lossy_key", |b| {
        b.iter(|| black_box(sanitize_key("Fix: Login redirect loop when SSO session expires (PROJ-1234)")));
    });

    group.finish();
}

criterion_group!(benches, bench_rank, bench_graph, bench_conflicts, bench_naming);
criterion_main!(benches);
