// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Metrics collection for the orchestration core.
//!
//! Lightweight in-process counters and latency histograms; no exporter.
//! Counters are lock-free; per-operation histograms sit behind a short
//! write lock.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use once_cell::sync::Lazy;
use parking_lot::RwLock;

/// Global metrics instance.
pub static GLOBAL_METRICS: Lazy<Metrics> = Lazy::new(Metrics::new);

/// Orchestration events worth counting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Counter {
    AssignmentsGranted,
    ContentionRetries,
    ProvisioningFailures,
    CapacityDenials,
    Completions,
    Releases,
    StaleDetections,
    Escalations,
    OrphansReclaimed,
    EventsDropped,
}

impl Counter {
    pub const ALL: [Counter; 10] = [
        Self::AssignmentsGranted,
        Self::ContentionRetries,
        Self::ProvisioningFailures,
        Self::CapacityDenials,
        Self::Completions,
        Self::Releases,
        Self::StaleDetections,
        Self::Escalations,
        Self::OrphansReclaimed,
        Self::EventsDropped,
    ];

    fn index(self) -> usize {
        self as usize
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::AssignmentsGranted => "assignments_granted",
            Self::ContentionRetries => "contention_retries",
            Self::ProvisioningFailures => "provisioning_failures",
            Self::CapacityDenials => "capacity_denials",
            Self::Completions => "completions",
            Self::Releases => "releases",
            Self::StaleDetections => "stale_detections",
            Self::Escalations => "escalations",
            Self::OrphansReclaimed => "orphans_reclaimed",
            Self::EventsDropped => "events_dropped",
        }
    }
}

impl fmt::Display for Counter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Central metrics collection.
#[derive(Debug)]
pub struct Metrics {
    counters: [AtomicU64; Counter::ALL.len()],
    operations: RwLock<HashMap<String, OperationMetrics>>,
    start_time: Instant,
}

impl Metrics {
    /// Create a new metrics collector.
    pub fn new() -> Self {
        Self {
            counters: Default::default(),
            operations: RwLock::new(HashMap::new()),
            start_time: Instant::now(),
        }
    }

    /// Increment a counter by one.
    pub fn incr(&self, counter: Counter) {
        self.counters[counter.index()].fetch_add(1, Ordering::Relaxed);
    }

    /// Current value of a counter.
    pub fn count(&self, counter: Counter) -> u64 {
        self.counters[counter.index()].load(Ordering::Relaxed)
    }

    /// Record the duration of a named operation.
    pub fn record_operation(&self, name: &str, duration: Duration) {
        let mut ops = self.operations.write();
        ops.entry(name.to_string())
            .or_insert_with(OperationMetrics::new)
            .record(duration);
    }

    /// Get metrics for a specific operation.
    pub fn operation_metrics(&self, name: &str) -> Option<OperationMetrics> {
        self.operations.read().get(name).cloned()
    }

    /// Get uptime since metrics were initialized.
    pub fn uptime(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// Take a snapshot of all metrics.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            counters: Counter::ALL.iter().map(|c| (*c, self.count(*c))).collect(),
            operations: self.operations.read().clone(),
            uptime: self.uptime(),
        }
    }

    /// Reset all metrics.
    pub fn reset(&self) {
        for counter in &self.counters {
            counter.store(0, Ordering::Relaxed);
        }
        self.operations.write().clear();
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Operation metrics with histogram.
#[derive(Debug, Clone)]
pub struct OperationMetrics {
    pub count: u64,
    pub total_duration: Duration,
    pub min_duration: Duration,
    pub max_duration: Duration,
    pub histogram: Histogram,
}

impl OperationMetrics {
    pub fn new() -> Self {
        Self {
            count: 0,
            total_duration: Duration::ZERO,
            min_duration: Duration::MAX,
            max_duration: Duration::ZERO,
            histogram: Histogram::default(),
        }
    }

    pub fn record(&mut self, duration: Duration) {
        self.count += 1;
        self.total_duration += duration;
        self.min_duration = self.min_duration.min(duration);
        self.max_duration = self.max_duration.max(duration);
        self.histogram.record(duration);
    }

    pub fn avg_duration(&self) -> Duration {
        if self.count == 0 {
            Duration::ZERO
        } else {
            self.total_duration / self.count as u32
        }
    }
}

impl Default for OperationMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Fixed-bucket latency histogram.
///
/// Workspace operations shell out to version control, so the default buckets
/// span 1ms to 60s.
#[derive(Debug, Clone)]
pub struct Histogram {
    /// Bucket upper bounds in milliseconds.
    buckets: Vec<u64>,
    /// Count per bucket, plus one overflow bucket.
    counts: Vec<u64>,
}

impl Histogram {
    pub fn with_buckets(buckets: Vec<u64>) -> Self {
        let counts = vec![0; buckets.len() + 1];
        Self { buckets, counts }
    }

    pub fn record(&mut self, duration: Duration) {
        let millis = duration.as_millis() as u64;
        let idx = self
            .buckets
            .iter()
            .position(|&b| millis <= b)
            .unwrap_or(self.buckets.len());
        self.counts[idx] += 1;
    }

    pub fn counts(&self) -> &[u64] {
        &self.counts
    }

    /// Approximate percentile, reported as the bucket's upper bound.
    pub fn percentile(&self, p: f64) -> Duration {
        let total: u64 = self.counts.iter().sum();
        if total == 0 {
            return Duration::ZERO;
        }

        let target = (total as f64 * p / 100.0).ceil() as u64;
        let mut cumulative = 0u64;
        for (i, &count) in self.counts.iter().enumerate() {
            cumulative += count;
            if cumulative >= target {
                let millis = match self.buckets.get(i) {
                    Some(bound) => *bound,
                    None => self.buckets.last().copied().unwrap_or(0) * 2,
                };
                return Duration::from_millis(millis);
            }
        }
        Duration::ZERO
    }

    pub fn p50(&self) -> Duration {
        self.percentile(50.0)
    }

    pub fn p99(&self) -> Duration {
        self.percentile(99.0)
    }
}

impl Default for Histogram {
    fn default() -> Self {
        Self::with_buckets(vec![1, 10, 100, 1_000, 10_000, 60_000])
    }
}

/// A snapshot of all metrics at a point in time.
#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    pub counters: Vec<(Counter, u64)>,
    pub operations: HashMap<String, OperationMetrics>,
    pub uptime: Duration,
}

impl MetricsSnapshot {
    pub fn get(&self, counter: Counter) -> u64 {
        self.counters
            .iter()
            .find(|(c, _)| *c == counter)
            .map(|(_, v)| *v)
            .unwrap_or(0)
    }

    /// Format as a human-readable report.
    pub fn format_report(&self) -> String {
        let mut report = String::new();
        report.push_str(&format!("Uptime: {:.2?}\n", self.uptime));
        for (counter, value) in &self.counters {
            report.push_str(&format!("  {}: {}\n", counter, value));
        }
        let mut names: Vec<_> = self.operations.keys().collect();
        names.sort();
        for name in names {
            let m = &self.operations[name];
            report.push_str(&format!(
                "  {}: {} ops, avg {:.2?}, p99 {:.2?}\n",
                name,
                m.count,
                m.avg_duration(),
                m.histogram.p99()
            ));
        }
        report
    }
}

/// Increment a counter on the global metrics.
pub fn incr(counter: Counter) {
    GLOBAL_METRICS.incr(counter);
}

/// Record an operation duration on the global metrics.
pub fn record_operation(name: &str, duration: Duration) {
    GLOBAL_METRICS.record_operation(name, duration);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters() {
        let metrics = Metrics::new();
        metrics.incr(Counter::AssignmentsGranted);
        metrics.incr(Counter::AssignmentsGranted);
        metrics.incr(Counter::Releases);

        assert_eq!(metrics.count(Counter::AssignmentsGranted), 2);
        assert_eq!(metrics.count(Counter::Releases), 1);
        assert_eq!(metrics.count(Counter::Escalations), 0);
    }

    #[test]
    fn test_operation_metrics() {
        let mut metrics = OperationMetrics::new();
        metrics.record(Duration::from_millis(10));
        metrics.record(Duration::from_millis(20));
        metrics.record(Duration::from_millis(30));

        assert_eq!(metrics.count, 3);
        assert_eq!(metrics.avg_duration(), Duration::from_millis(20));
        assert_eq!(metrics.min_duration, Duration::from_millis(10));
    }

    #[test]
    fn test_histogram_buckets() {
        let mut hist = Histogram::default();
        hist.record(Duration::from_micros(500));
        hist.record(Duration::from_millis(5));
        hist.record(Duration::from_secs(2));
        hist.record(Duration::from_secs(120));

        assert_eq!(hist.counts()[0], 1);
        assert_eq!(hist.counts()[1], 1);
        assert_eq!(hist.counts()[4], 1);
        assert_eq!(hist.counts()[6], 1);
    }

    #[test]
    fn test_histogram_percentiles() {
        let mut hist = Histogram::default();
        for _ in 0..100 {
            hist.record(Duration::from_millis(50));
        }
        assert_eq!(hist.p50(), Duration::from_millis(100));
        assert_eq!(hist.p99(), Duration::from_millis(100));
    }

    #[test]
    fn test_snapshot_and_reset() {
        let metrics = Metrics::new();
        metrics.incr(Counter::StaleDetections);
        metrics.record_operation("provision", Duration::from_millis(40));

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.get(Counter::StaleDetections), 1);
        assert!(snapshot.operations.contains_key("provision"));
        assert!(snapshot.format_report().contains("stale_detections: 1"));

        metrics.reset();
        assert_eq!(metrics.count(Counter::StaleDetections), 0);
        assert!(metrics.operation_metrics("provision").is_none());
    }
}
