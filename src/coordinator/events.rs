// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Orchestration events.
//!
//! The coordinator and monitor publish typed events onto a bounded channel.
//! Delivering them to agents or webhooks is the job of whoever holds the
//! receiver; a slow or missing consumer never blocks orchestration.

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{trace, warn};

use crate::graph::conflict::ConflictRisk;
use crate::telemetry::metrics::{self, Counter};
use crate::types::{AgentId, Outcome, ReleaseReason, UnitId};

/// How urgently a human should look at an escalation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    /// Stale work reclaimed from a clean workspace.
    Warning,
    /// Possible data loss or a broken invariant.
    Critical,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Warning => write!(f, "warning"),
            Self::Critical => write!(f, "critical"),
        }
    }
}

/// Notification produced by the orchestration core.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum OrchestratorEvent {
    WorkAssigned {
        unit_id: UnitId,
        agent_id: AgentId,
        workspace_path: PathBuf,
        branch_name: String,
    },
    WorkStarted {
        unit_id: UnitId,
        agent_id: AgentId,
    },
    WorkReleased {
        unit_id: UnitId,
        reason: ReleaseReason,
    },
    WorkCompleted {
        unit_id: UnitId,
        outcome: Outcome,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        commit_reference: Option<String>,
    },
    StaleWorkDetected {
        unit_id: UnitId,
        agent_id: AgentId,
        /// Seconds since the last observed activity.
        elapsed: i64,
    },
    UnitReady {
        unit_id: UnitId,
    },
    ProvisioningFailed {
        unit_id: UnitId,
        error: String,
    },
    ConflictRisk {
        unit_id: UnitId,
        other: UnitId,
        paths: Vec<String>,
    },
    Escalation {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        unit_id: Option<UnitId>,
        severity: Severity,
        message: String,
    },
    AgentDeregistered {
        agent_id: AgentId,
    },
}

impl OrchestratorEvent {
    /// Wire name of the event.
    pub fn name(&self) -> &'static str {
        match self {
            Self::WorkAssigned { .. } => "work_assigned",
            Self::WorkStarted { .. } => "work_started",
            Self::WorkReleased { .. } => "work_released",
            Self::WorkCompleted { .. } => "work_completed",
            Self::StaleWorkDetected { .. } => "stale_work_detected",
            Self::UnitReady { .. } => "unit_ready",
            Self::ProvisioningFailed { .. } => "provisioning_failed",
            Self::ConflictRisk { .. } => "conflict_risk",
            Self::Escalation { .. } => "escalation",
            Self::AgentDeregistered { .. } => "agent_deregistered",
        }
    }
}

impl From<ConflictRisk> for OrchestratorEvent {
    fn from(risk: ConflictRisk) -> Self {
        Self::ConflictRisk {
            unit_id: risk.unit_id,
            other: risk.other,
            paths: risk.paths,
        }
    }
}

/// Sending half of the event channel.
#[derive(Debug, Clone, Default)]
pub struct EventSink {
    tx: Option<mpsc::Sender<OrchestratorEvent>>,
}

impl EventSink {
    /// Bounded channel of `capacity` events.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<OrchestratorEvent>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx: Some(tx) }, rx)
    }

    /// A sink that discards everything.
    pub fn disabled() -> Self {
        Self { tx: None }
    }

    /// Publish without waiting. A full or closed channel drops the event.
    pub fn emit(&self, event: OrchestratorEvent) {
        let Some(tx) = &self.tx else {
            return;
        };
        trace!(event = event.name(), "Emitting event");
        match tx.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(event)) => {
                metrics::incr(Counter::EventsDropped);
                warn!(event = event.name(), "Event channel full, dropping event");
            }
            Err(TrySendError::Closed(event)) => {
                metrics::incr(Counter::EventsDropped);
                warn!(event = event.name(), "Event channel closed, dropping event");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_wire_format() {
        let event = OrchestratorEvent::WorkAssigned {
            unit_id: UnitId::from("u1"),
            agent_id: AgentId::from("a1"),
            workspace_path: PathBuf::from("/work/foreman-u1"),
            branch_name: "work/u1".to_string(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "work_assigned");
        assert_eq!(json["branch_name"], "work/u1");

        let stale = OrchestratorEvent::StaleWorkDetected {
            unit_id: UnitId::from("u1"),
            agent_id: AgentId::from("a1"),
            elapsed: 1200,
        };
        assert_eq!(serde_json::to_value(&stale).unwrap()["event"], stale.name());
    }

    #[test]
    fn test_release_reason_in_event() {
        let event = OrchestratorEvent::WorkReleased {
            unit_id: UnitId::from("u1"),
            reason: ReleaseReason::Stale,
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"reason\":\"stale\""));
        let back: OrchestratorEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(back, event);
    }

    #[tokio::test]
    async fn test_full_channel_drops_without_blocking() {
        let (sink, mut rx) = EventSink::channel(1);
        sink.emit(OrchestratorEvent::UnitReady {
            unit_id: UnitId::from("a"),
        });
        sink.emit(OrchestratorEvent::UnitReady {
            unit_id: UnitId::from("b"),
        });

        assert_eq!(
            rx.recv().await,
            Some(OrchestratorEvent::UnitReady {
                unit_id: UnitId::from("a")
            })
        );
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_disabled_and_closed_sinks() {
        EventSink::disabled().emit(OrchestratorEvent::UnitReady {
            unit_id: UnitId::from("a"),
        });

        let (sink, rx) = EventSink::channel(4);
        drop(rx);
        sink.emit(OrchestratorEvent::UnitReady {
            unit_id: UnitId::from("a"),
        });
    }
}
