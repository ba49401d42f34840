// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Priority scheduler.
//!
//! Ranks `ready` units for assignment. The scheduler is stateless: it reads a
//! snapshot of units plus the dependency graph and returns a total order. The
//! same snapshot always produces the same order.
//!
//! Score = tier weight
//!       + readiness bonus (no open blockers)
//!       + min(age_hours * age_per_hour, age_cap)
//!       + min(downstream * fan_out_per_unit, fan_out_cap)
//!
//! Ties go to the earlier creation time, then to the smaller identifier.

use std::cmp::Ordering;
use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::config::ScoringWeights;
use crate::graph::DependencyGraph;
use crate::types::{Agent, PriorityTier, UnitId, UnitOfWork, UnitStatus};

/// Individual score terms, kept for explainability.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ScoreBreakdown {
    pub tier: f64,
    pub readiness: f64,
    pub age: f64,
    pub fan_out: f64,
}

impl ScoreBreakdown {
    pub fn total(&self) -> f64 {
        self.tier + self.readiness + self.age + self.fan_out
    }
}

/// A ranked unit.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScoredUnit {
    pub unit_id: UnitId,
    pub priority: PriorityTier,
    pub created_at: DateTime<Utc>,
    pub score: f64,
    pub breakdown: ScoreBreakdown,
}

impl ScoredUnit {
    fn order(&self, other: &Self) -> Ordering {
        other
            .score
            .total_cmp(&self.score)
            .then_with(|| self.created_at.cmp(&other.created_at))
            .then_with(|| self.unit_id.cmp(&other.unit_id))
    }
}

/// Dependency-aware priority ranking.
#[derive(Debug, Clone, Default)]
pub struct PriorityScheduler {
    weights: ScoringWeights,
}

impl PriorityScheduler {
    pub fn new(weights: ScoringWeights) -> Self {
        Self { weights }
    }

    pub fn weights(&self) -> &ScoringWeights {
        &self.weights
    }

    fn tier_weight(&self, tier: PriorityTier) -> f64 {
        match tier {
            PriorityTier::Critical => self.weights.critical,
            PriorityTier::High => self.weights.high,
            PriorityTier::Medium => self.weights.medium,
            PriorityTier::Low => self.weights.low,
        }
    }

    /// Score one unit against the graph at time `now`.
    pub fn score(&self, unit: &UnitOfWork, graph: &DependencyGraph, now: DateTime<Utc>) -> ScoreBreakdown {
        let w = &self.weights;

        let readiness = if graph.open_blockers(&unit.id).is_empty() {
            w.readiness_bonus
        } else {
            0.0
        };

        // Clock skew can put created_at in the future; treat that as zero age.
        let age_hours = (now - unit.created_at).num_seconds().max(0) as f64 / 3600.0;
        let age = (age_hours * w.age_per_hour).min(w.age_cap);

        let downstream = graph.downstream_count(&unit.id) as f64;
        let fan_out = (downstream * w.fan_out_per_unit).min(w.fan_out_cap);

        ScoreBreakdown {
            tier: self.tier_weight(unit.priority),
            readiness,
            age,
            fan_out,
        }
    }

    /// Rank every `ready` unit in `units`, best first.
    pub fn rank(&self, units: &[UnitOfWork], graph: &DependencyGraph, now: DateTime<Utc>) -> Vec<ScoredUnit> {
        let mut ranked: Vec<ScoredUnit> = units
            .iter()
            .filter(|u| u.status == UnitStatus::Ready)
            .map(|u| {
                let breakdown = self.score(u, graph, now);
                ScoredUnit {
                    unit_id: u.id.clone(),
                    priority: u.priority,
                    created_at: u.created_at,
                    score: breakdown.total(),
                    breakdown,
                }
            })
            .collect();
        ranked.sort_by(|a, b| a.order(b));
        ranked
    }

    /// Ranked candidates `agent` is able to take, skipping `exclude`.
    ///
    /// Capability matching happens before ranking is consumed: a unit is a
    /// candidate only if the agent covers all of its required capabilities.
    pub fn candidates_for(
        &self,
        agent: &Agent,
        units: &[UnitOfWork],
        graph: &DependencyGraph,
        now: DateTime<Utc>,
        exclude: &HashSet<UnitId>,
    ) -> Vec<ScoredUnit> {
        let eligible: Vec<UnitOfWork> = units
            .iter()
            .filter(|u| !exclude.contains(&u.id) && agent.can_handle(&u.required_capabilities))
            .cloned()
            .collect();
        self.rank(&eligible, graph, now)
    }

    /// Best candidate for `agent`, if any.
    pub fn select(
        &self,
        agent: &Agent,
        units: &[UnitOfWork],
        graph: &DependencyGraph,
        now: DateTime<Utc>,
    ) -> Option<ScoredUnit> {
        self.candidates_for(agent, units, graph, now, &HashSet::new())
            .into_iter()
            .next()
    }
}
