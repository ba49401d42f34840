// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Dependency graph over units of work.
//!
//! A pure relational structure: unit identifiers, `blocked -> blocker` edges,
//! and the set of units that reached `done`. It knows nothing about agents or
//! workspaces. Cycles are rejected when an edge is added; a rejected edge
//! leaves the graph untouched.

pub mod conflict;

use std::collections::{BTreeMap, BTreeSet, HashSet, VecDeque};

use crate::error::GraphError;
use crate::types::{DependencyEdge, UnitId, UnitOfWork, UnitStatus};

/// Blocking relationships between units.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DependencyGraph {
    /// blocked -> blockers
    blockers: BTreeMap<UnitId, BTreeSet<UnitId>>,
    /// blocker -> blocked
    dependents: BTreeMap<UnitId, BTreeSet<UnitId>>,
    done: BTreeSet<UnitId>,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a graph from units and their `blocked_by` / `blocks` lists.
    ///
    /// Either side of an edge may declare it. The whole edge set is validated
    /// at once; a cycle anywhere rejects the import and reports the full
    /// cycle path.
    pub fn from_units(units: &[UnitOfWork]) -> Result<Self, GraphError> {
        let mut graph = Self::new();
        for unit in units {
            graph.add_unit(unit.id.clone());
            if unit.status == UnitStatus::Done {
                graph.done.insert(unit.id.clone());
            }
        }
        let edges: Vec<DependencyEdge> = units
            .iter()
            .flat_map(|u| {
                let blocked_by = u
                    .blocked_by
                    .iter()
                    .map(move |blocker| DependencyEdge::new(u.id.clone(), blocker.clone()));
                let blocks = u
                    .blocks
                    .iter()
                    .map(move |blocked| DependencyEdge::new(blocked.clone(), u.id.clone()));
                blocked_by.chain(blocks)
            })
            .collect();
        graph.import(&edges)?;
        Ok(graph)
    }

    /// Build a graph over `units` from an explicit edge list.
    pub fn from_edges(
        units: impl IntoIterator<Item = UnitId>,
        edges: &[DependencyEdge],
    ) -> Result<Self, GraphError> {
        let mut graph = Self::new();
        for id in units {
            graph.add_unit(id);
        }
        graph.import(edges)?;
        Ok(graph)
    }

    /// Register a unit with no edges. Idempotent.
    pub fn add_unit(&mut self, id: UnitId) {
        self.blockers.entry(id.clone()).or_default();
        self.dependents.entry(id).or_default();
    }

    pub fn contains(&self, id: &UnitId) -> bool {
        self.blockers.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.blockers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blockers.is_empty()
    }

    pub fn is_done(&self, id: &UnitId) -> bool {
        self.done.contains(id)
    }

    /// True iff every blocker of `id` is done.
    pub fn is_ready(&self, id: &UnitId) -> bool {
        self.blockers
            .get(id)
            .map(|blockers| blockers.iter().all(|b| self.done.contains(b)))
            .unwrap_or(true)
    }

    /// Blockers of `id` that are not done yet.
    pub fn open_blockers(&self, id: &UnitId) -> Vec<UnitId> {
        self.blockers
            .get(id)
            .map(|blockers| {
                blockers
                    .iter()
                    .filter(|b| !self.done.contains(*b))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// All blockers of `id`, done or not.
    pub fn blocked_by(&self, id: &UnitId) -> Vec<UnitId> {
        self.blockers
            .get(id)
            .map(|b| b.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Units directly blocked by `id`.
    pub fn dependents(&self, id: &UnitId) -> Vec<UnitId> {
        self.dependents
            .get(id)
            .map(|d| d.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Number of not-done units transitively waiting on `id`.
    pub fn downstream_count(&self, id: &UnitId) -> usize {
        let mut seen: HashSet<&UnitId> = HashSet::new();
        let mut queue: VecDeque<&UnitId> = VecDeque::new();
        queue.push_back(id);
        while let Some(current) = queue.pop_front() {
            if let Some(next) = self.dependents.get(current) {
                for dependent in next {
                    if !self.done.contains(dependent) && seen.insert(dependent) {
                        queue.push_back(dependent);
                    }
                }
            }
        }
        seen.len()
    }

    /// Every edge, ordered by blocked then blocker.
    pub fn edges(&self) -> Vec<DependencyEdge> {
        self.blockers
            .iter()
            .flat_map(|(blocked, blockers)| {
                blockers
                    .iter()
                    .map(move |blocker| DependencyEdge::new(blocked.clone(), blocker.clone()))
            })
            .collect()
    }

    /// Add `blocked -> blocker`.
    ///
    /// Rejected with `CycleDetected` when `blocked` is already reachable from
    /// `blocker`. Adding an existing edge is a no-op.
    pub fn add_edge(&mut self, blocked: &UnitId, blocker: &UnitId) -> Result<(), GraphError> {
        if blocked == blocker {
            return Err(GraphError::SelfDependency(blocked.clone()));
        }
        for id in [blocked, blocker] {
            if !self.contains(id) {
                return Err(GraphError::UnknownUnit(id.clone()));
            }
        }
        if self.blockers.get(blocked).is_some_and(|b| b.contains(blocker)) {
            return Ok(());
        }
        if let Some(path) = self.path_between(blocker, blocked) {
            let mut cycle = Vec::with_capacity(path.len() + 1);
            cycle.push(blocked.clone());
            cycle.extend(path);
            return Err(GraphError::CycleDetected { path: cycle });
        }
        self.insert_edge(blocked.clone(), blocker.clone());
        Ok(())
    }

    /// Add a batch of edges, all or nothing.
    ///
    /// Units named by edges must already be registered. The result is checked
    /// with a topological pass; on a cycle the graph is left as it was.
    pub fn import(&mut self, edges: &[DependencyEdge]) -> Result<(), GraphError> {
        let mut candidate = self.clone();
        for edge in edges {
            if edge.blocked == edge.blocker {
                return Err(GraphError::SelfDependency(edge.blocked.clone()));
            }
            for id in [&edge.blocked, &edge.blocker] {
                if !candidate.contains(id) {
                    return Err(GraphError::UnknownUnit(id.clone()));
                }
            }
            candidate.insert_edge(edge.blocked.clone(), edge.blocker.clone());
        }
        if let Some(cycle) = candidate.find_cycle() {
            return Err(GraphError::CycleDetected { path: cycle });
        }
        *self = candidate;
        Ok(())
    }

    /// Record `id` as done and return the dependents that became ready.
    pub fn on_unit_completed(&mut self, id: &UnitId) -> Vec<UnitId> {
        if !self.done.insert(id.clone()) {
            return Vec::new();
        }
        self.dependents(id)
            .into_iter()
            .filter(|d| !self.done.contains(d) && self.is_ready(d))
            .collect()
    }

    fn insert_edge(&mut self, blocked: UnitId, blocker: UnitId) {
        self.dependents
            .entry(blocker.clone())
            .or_default()
            .insert(blocked.clone());
        self.blockers.entry(blocked).or_default().insert(blocker);
    }

    /// Path `from -> ... -> to` following blocker edges, if any.
    fn path_between(&self, from: &UnitId, to: &UnitId) -> Option<Vec<UnitId>> {
        let mut parent: BTreeMap<&UnitId, &UnitId> = BTreeMap::new();
        let mut seen: HashSet<&UnitId> = HashSet::new();
        let mut queue: VecDeque<&UnitId> = VecDeque::new();
        seen.insert(from);
        queue.push_back(from);

        while let Some(current) = queue.pop_front() {
            if current == to {
                let mut path = vec![current.clone()];
                let mut cursor = current;
                while let Some(&prev) = parent.get(cursor) {
                    path.push(prev.clone());
                    cursor = prev;
                }
                path.reverse();
                return Some(path);
            }
            if let Some(next) = self.blockers.get(current) {
                for blocker in next {
                    if seen.insert(blocker) {
                        parent.insert(blocker, current);
                        queue.push_back(blocker);
                    }
                }
            }
        }
        None
    }

    /// Kahn's algorithm; if some units never drain, walk blocker edges among
    /// them until a unit repeats and return that loop.
    fn find_cycle(&self) -> Option<Vec<UnitId>> {
        let mut remaining: BTreeMap<&UnitId, usize> = self
            .blockers
            .iter()
            .map(|(id, blockers)| (id, blockers.len()))
            .collect();
        let mut queue: VecDeque<&UnitId> = remaining
            .iter()
            .filter(|(_, count)| **count == 0)
            .map(|(id, _)| *id)
            .collect();

        while let Some(id) = queue.pop_front() {
            remaining.remove(id);
            if let Some(dependents) = self.dependents.get(id) {
                for dependent in dependents {
                    if let Some(count) = remaining.get_mut(dependent) {
                        *count -= 1;
                        if *count == 0 {
                            queue.push_back(dependent);
                        }
                    }
                }
            }
        }

        let start = *remaining.keys().next()?;
        let mut order: Vec<&UnitId> = Vec::new();
        let mut position: BTreeMap<&UnitId, usize> = BTreeMap::new();
        let mut current = start;
        loop {
            if let Some(&at) = position.get(current) {
                let mut cycle: Vec<UnitId> = order[at..].iter().map(|id| (*id).clone()).collect();
                cycle.push(current.clone());
                return Some(cycle);
            }
            position.insert(current, order.len());
            order.push(current);
            current = self
                .blockers
                .get(current)?
                .iter()
                .find(|b| remaining.contains_key(*b))?;
        }
    }
}
