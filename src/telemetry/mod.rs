// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Tracing and metrics infrastructure.
//!
//! - **Tracing**: structured logging; every state transition logs the unit
//!   and agent as fields.
//! - **Metrics**: counters for assignments, contention, reclamation and
//!   escalation, plus latency histograms for workspace operations.
//!
//! # Usage
//!
//! ```rust,ignore
//! use foreman::telemetry::{init_telemetry, TelemetryConfig};
//!
//! let _guard = init_telemetry(&TelemetryConfig::default())?;
//! ```

mod init;
pub mod metrics;

pub use init::{init_telemetry, LogFormat, TelemetryConfig, TelemetryGuard};
pub use metrics::{Counter, Histogram, Metrics, MetricsSnapshot, OperationMetrics, GLOBAL_METRICS};
