//! Execution and per-node metrics
//!
//! Cardinality stays bounded: node metrics key on node id, error counts
//! key on the closed [`ErrorKind`] set, and latencies go into fixed
//! buckets. Snapshots are queryable while a run is in flight.

use chrono::{DateTime, Utc};
use skein_core::ErrorKind;
use std::collections::HashMap;
use std::sync::Mutex;

/// Fixed latency bucket upper bounds, in milliseconds.
const BUCKET_BOUNDS_MS: [u64; 12] =
    [1, 2, 5, 10, 25, 50, 100, 250, 500, 1_000, 5_000, 30_000];

/// Fixed-bucket latency histogram.
#[derive(Debug, Clone, Default)]
pub struct LatencyHistogram {
    counts: [u64; BUCKET_BOUNDS_MS.len() + 1],
    total: u64,
    sum_ms: u64,
}

impl LatencyHistogram {
    pub fn record(&mut self, duration_ms: u64) {
        let bucket = BUCKET_BOUNDS_MS
            .iter()
            .position(|bound| duration_ms <= *bound)
            .unwrap_or(BUCKET_BOUNDS_MS.len());
        self.counts[bucket] += 1;
        self.total += 1;
        self.sum_ms += duration_ms;
    }

    pub fn count(&self) -> u64 {
        self.total
    }

    pub fn mean_ms(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.sum_ms as f64 / self.total as f64
        }
    }

    /// Approximate percentile: the upper bound of the bucket containing
    /// the requested rank.
    pub fn percentile_ms(&self, percentile: f64) -> u64 {
        if self.total == 0 {
            return 0;
        }
        let rank = (percentile / 100.0 * self.total as f64).ceil() as u64;
        let mut seen = 0;
        for (bucket, count) in self.counts.iter().enumerate() {
            seen += count;
            if seen >= rank.max(1) {
                return BUCKET_BOUNDS_MS.get(bucket).copied().unwrap_or(u64::MAX);
            }
        }
        u64::MAX
    }

    pub fn p50_ms(&self) -> u64 {
        self.percentile_ms(50.0)
    }

    pub fn p95_ms(&self) -> u64 {
        self.percentile_ms(95.0)
    }

    pub fn p99_ms(&self) -> u64 {
        self.percentile_ms(99.0)
    }
}

/// Counters for one node.
#[derive(Debug, Clone, Default)]
pub struct NodeMetrics {
    pub executions: u64,
    pub successes: u64,
    pub errors_by_kind: HashMap<ErrorKind, u64>,
    pub retries: u64,
    pub skips: u64,
    pub circuit_transitions: u64,
    pub latency: LatencyHistogram,
}

impl NodeMetrics {
    pub fn failures(&self) -> u64 {
        self.errors_by_kind.values().sum()
    }

    /// Successes over executions, 1.0 when never executed.
    pub fn success_ratio(&self) -> f64 {
        if self.executions == 0 {
            1.0
        } else {
            self.successes as f64 / self.executions as f64
        }
    }
}

/// Final status of a tracked execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Completed,
    Failed(ErrorKind),
    Canceled,
    Suspended,
}

/// Counters for one execution.
#[derive(Debug, Clone)]
pub struct RunMetrics {
    pub execution_id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub steps: u64,
    /// Node ids in visit order
    pub path: Vec<String>,
    pub status: Option<RunStatus>,
}

impl RunMetrics {
    fn new(execution_id: &str) -> Self {
        Self {
            execution_id: execution_id.to_string(),
            started_at: Utc::now(),
            finished_at: None,
            steps: 0,
            path: vec![],
            status: None,
        }
    }

    pub fn wall_clock_ms(&self) -> Option<u64> {
        self.finished_at
            .map(|end| (end - self.started_at).num_milliseconds().max(0) as u64)
    }
}

/// Executor-scoped collector. Cheap no-ops when disabled.
pub struct MetricsCollector {
    enabled: bool,
    nodes: Mutex<HashMap<String, NodeMetrics>>,
    runs: Mutex<HashMap<String, RunMetrics>>,
}

impl MetricsCollector {
    pub fn new(enabled: bool) -> Self {
        Self { enabled, nodes: Mutex::new(HashMap::new()), runs: Mutex::new(HashMap::new()) }
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub fn run_started(&self, execution_id: &str) {
        if !self.enabled {
            return;
        }
        let mut runs = self.lock_runs();
        runs.insert(execution_id.to_string(), RunMetrics::new(execution_id));
    }

    pub fn run_finished(&self, execution_id: &str, status: RunStatus) {
        if !self.enabled {
            return;
        }
        let mut runs = self.lock_runs();
        if let Some(run) = runs.get_mut(execution_id) {
            run.finished_at = Some(Utc::now());
            run.status = Some(status);
        }
    }

    pub fn step(&self, execution_id: &str, node_id: &str) {
        if !self.enabled {
            return;
        }
        let mut runs = self.lock_runs();
        if let Some(run) = runs.get_mut(execution_id) {
            run.steps += 1;
            run.path.push(node_id.to_string());
        }
    }

    pub fn node_success(&self, node_id: &str, duration_ms: u64) {
        if !self.enabled {
            return;
        }
        let mut nodes = self.lock_nodes();
        let metrics = nodes.entry(node_id.to_string()).or_default();
        metrics.executions += 1;
        metrics.successes += 1;
        metrics.latency.record(duration_ms);
    }

    pub fn node_failure(&self, node_id: &str, kind: ErrorKind, duration_ms: u64) {
        if !self.enabled {
            return;
        }
        let mut nodes = self.lock_nodes();
        let metrics = nodes.entry(node_id.to_string()).or_default();
        metrics.executions += 1;
        *metrics.errors_by_kind.entry(kind).or_default() += 1;
        metrics.latency.record(duration_ms);
    }

    pub fn node_retry(&self, node_id: &str) {
        if !self.enabled {
            return;
        }
        self.lock_nodes().entry(node_id.to_string()).or_default().retries += 1;
    }

    pub fn node_skip(&self, node_id: &str) {
        if !self.enabled {
            return;
        }
        self.lock_nodes().entry(node_id.to_string()).or_default().skips += 1;
    }

    pub fn circuit_transition(&self, node_id: &str) {
        if !self.enabled {
            return;
        }
        self.lock_nodes().entry(node_id.to_string()).or_default().circuit_transitions += 1;
    }

    /// Snapshot of one node's counters.
    pub fn node_snapshot(&self, node_id: &str) -> Option<NodeMetrics> {
        self.lock_nodes().get(node_id).cloned()
    }

    /// Snapshot of one run's counters, available during and after the run.
    pub fn run_snapshot(&self, execution_id: &str) -> Option<RunMetrics> {
        self.lock_runs().get(execution_id).cloned()
    }

    /// Drop a finished run's counters.
    pub fn forget_run(&self, execution_id: &str) {
        self.lock_runs().remove(execution_id);
    }

    fn lock_nodes(&self) -> std::sync::MutexGuard<'_, HashMap<String, NodeMetrics>> {
        self.nodes.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_runs(&self) -> std::sync::MutexGuard<'_, HashMap<String, RunMetrics>> {
        self.runs.lock().unwrap_or_else(|e| e.into_inner())
    }
}
