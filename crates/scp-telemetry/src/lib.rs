#![deny(unsafe_code)]
#![warn(missing_docs)]
//! scp-telemetry
//!
//! Structured logging setup and workflow-run metrics, ambient concerns
//! shared by every binary in the workspace rather than tied to any one
//! component.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tracing_subscriber::EnvFilter;

/// Output format for the process-wide `tracing` subscriber, selected by
/// `SCP_LOG_FORMAT` (`"json"` or anything else for pretty).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// Human-readable, single-line-per-event.
    Pretty,
    /// One JSON object per event, for log aggregators.
    Json,
}

impl LogFormat {
    /// Read `SCP_LOG_FORMAT` from the environment, defaulting to
    /// [`LogFormat::Pretty`] when unset or unrecognized.
    #[must_use]
    pub fn from_env() -> Self {
        match std::env::var("SCP_LOG_FORMAT").as_deref() {
            Ok("json") => Self::Json,
            _ => Self::Pretty,
        }
    }
}

/// Install the process-wide `tracing` subscriber: an `EnvFilter` seeded
/// with `default_filter` (overridable via `RUST_LOG`) and a formatting
/// layer chosen by `format`.
///
/// # Panics
///
/// Panics if a global subscriber is already installed, since that
/// indicates a caller bug (this should be called exactly once, at
/// process start).
pub fn init_tracing(format: LogFormat, default_filter: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    let subscriber = tracing_subscriber::fmt().with_env_filter(filter);
    match format {
        LogFormat::Pretty => subscriber.init(),
        LogFormat::Json => subscriber.json().init(),
    }
}

/// Metrics captured for a single workflow run, from trigger activation
/// through the last audit event.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RunMetrics {
    /// The workflow that ran.
    pub workflow_id: String,
    /// The distribution plan it ran under.
    pub plan_id: String,
    /// Wall-clock duration in milliseconds.
    pub duration_ms: u64,
    /// Number of slices executed (central plus remote).
    pub slices_executed: u64,
    /// Number of audit events appended.
    pub audit_events_appended: u64,
    /// Number of sync points resolved by `FAIL`.
    pub sync_points_failed: u64,
    /// Number of sync points resolved by `SKIP`.
    pub sync_points_skipped: u64,
    /// Number of sync points resolved by `USE_DEFAULT`.
    pub sync_points_defaulted: u64,
    /// Number of executor or VM errors encountered.
    pub errors_count: u64,
}

/// Aggregated statistics across multiple workflow runs.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MetricsSummary {
    /// Number of runs recorded.
    pub count: usize,
    /// Mean duration in milliseconds.
    pub mean_duration_ms: f64,
    /// Median (p50) duration in milliseconds.
    pub p50_duration_ms: f64,
    /// 99th-percentile duration in milliseconds.
    pub p99_duration_ms: f64,
    /// Total audit events appended across all runs.
    pub total_audit_events: u64,
    /// Fraction of runs with at least one error.
    pub error_rate: f64,
    /// Per-plan run counts (deterministic ordering).
    pub plan_counts: BTreeMap<String, usize>,
}

impl Default for MetricsSummary {
    fn default() -> Self {
        Self {
            count: 0,
            mean_duration_ms: 0.0,
            p50_duration_ms: 0.0,
            p99_duration_ms: 0.0,
            total_audit_events: 0,
            error_rate: 0.0,
            plan_counts: BTreeMap::new(),
        }
    }
}

/// Compute a percentile value from a **sorted** slice.
fn percentile(sorted: &[u64], pct: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    if sorted.len() == 1 {
        return sorted[0] as f64;
    }
    let rank = pct / 100.0 * (sorted.len() - 1) as f64;
    let lower = rank.floor() as usize;
    let upper = rank.ceil() as usize;
    let frac = rank - lower as f64;
    sorted[lower] as f64 * (1.0 - frac) + sorted[upper] as f64 * frac
}

/// Thread-safe collector for workflow-run metrics. Wrap in an `Arc` to
/// share across the dispatcher/SVM tasks; the inner storage is already
/// behind a `Mutex`.
#[derive(Debug, Clone, Default)]
pub struct MetricsCollector {
    inner: Arc<Mutex<Vec<RunMetrics>>>,
}

impl MetricsCollector {
    /// A collector with no runs recorded yet.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a completed workflow run's metrics.
    pub fn record(&self, metrics: RunMetrics) {
        self.inner.lock().expect("metrics lock poisoned").push(metrics);
    }

    /// All recorded runs, in the order they were recorded.
    #[must_use]
    pub fn runs(&self) -> Vec<RunMetrics> {
        self.inner.lock().expect("metrics lock poisoned").clone()
    }

    /// Number of runs recorded so far.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().expect("metrics lock poisoned").len()
    }

    /// `true` if no runs have been recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Compute an aggregated summary of every recorded run.
    #[must_use]
    pub fn summary(&self) -> MetricsSummary {
        let data = self.inner.lock().expect("metrics lock poisoned");
        if data.is_empty() {
            return MetricsSummary::default();
        }

        let count = data.len();
        let mut durations: Vec<u64> = data.iter().map(|r| r.duration_ms).collect();
        durations.sort_unstable();

        let mean_duration_ms = durations.iter().sum::<u64>() as f64 / count as f64;
        let p50_duration_ms = percentile(&durations, 50.0);
        let p99_duration_ms = percentile(&durations, 99.0);
        let total_audit_events: u64 = data.iter().map(|r| r.audit_events_appended).sum();
        let with_errors = data.iter().filter(|r| r.errors_count > 0).count();
        let error_rate = with_errors as f64 / count as f64;

        let mut plan_counts = BTreeMap::new();
        for run in data.iter() {
            *plan_counts.entry(run.plan_id.clone()).or_insert(0) += 1;
        }

        MetricsSummary { count, mean_duration_ms, p50_duration_ms, p99_duration_ms, total_audit_events, error_rate, plan_counts }
    }

    /// Discard every recorded run.
    pub fn clear(&self) {
        self.inner.lock().expect("metrics lock poisoned").clear();
    }
}
