//! Pool metrics (spec.md §4.6).
//!
//! Grounded on `kernel::profiler::{CpuProfile, SyscallProfile}` and
//! `kernel::trace::PerfCounters`: the same ring-buffer-of-timestamped-
//! samples and per-key aggregate-counter shapes, retargeted from
//! syscalls/processes onto task durations/worker busy-time/queue depth.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use crate::error::FailureKind;

pub const DEFAULT_HISTOGRAM_BUCKETS_MS: [u64; 12] =
    [1, 5, 10, 25, 50, 100, 250, 500, 1000, 2500, 5000, 10000];

/// Latency histogram over a fixed set of upper bounds, plus an overflow
/// bucket for samples past the last bound.
#[derive(Debug, Clone)]
pub struct Histogram {
    bounds_ms: Vec<u64>,
    counts: Vec<u64>,
    overflow: u64,
    total_count: u64,
    sum_ms: f64,
}

impl Histogram {
    pub fn new(bounds_ms: &[u64]) -> Self {
        let mut bounds: Vec<u64> = bounds_ms.to_vec();
        bounds.sort_unstable();
        let len = bounds.len();
        Histogram { bounds_ms: bounds, counts: vec![0; len], overflow: 0, total_count: 0, sum_ms: 0.0 }
    }

    pub fn record(&mut self, duration_ms: f64) {
        self.total_count += 1;
        self.sum_ms += duration_ms;
        match self.bounds_ms.iter().position(|&b| duration_ms <= b as f64) {
            Some(idx) => self.counts[idx] += 1,
            None => self.overflow += 1,
        }
    }

    pub fn total_count(&self) -> u64 {
        self.total_count
    }

    pub fn mean_ms(&self) -> f64 {
        if self.total_count == 0 { 0.0 } else { self.sum_ms / self.total_count as f64 }
    }

    /// Approximate percentile by walking cumulative bucket counts; returns
    /// the bucket's upper bound (or `f64::INFINITY` for the overflow
    /// bucket) as the estimate.
    pub fn percentile(&self, p: f64) -> f64 {
        if self.total_count == 0 {
            return 0.0;
        }
        let target = (p.clamp(0.0, 1.0) * self.total_count as f64).ceil() as u64;
        let mut cumulative = 0u64;
        for (idx, &count) in self.counts.iter().enumerate() {
            cumulative += count;
            if cumulative >= target {
                return self.bounds_ms[idx] as f64;
            }
        }
        f64::INFINITY
    }
}

impl Default for Histogram {
    fn default() -> Self {
        Histogram::new(&DEFAULT_HISTOGRAM_BUCKETS_MS)
    }
}

struct TimestampedSample {
    at: Instant,
    value_ms: f64,
}

/// Bounded-duration ring buffer of timestamped samples, used to compute
/// rolling-window percentiles independent of the all-time histogram.
pub struct TimeWindowBuffer {
    window: Duration,
    samples: VecDeque<TimestampedSample>,
}

impl TimeWindowBuffer {
    pub fn new(window: Duration) -> Self {
        TimeWindowBuffer { window, samples: VecDeque::new() }
    }

    pub fn record(&mut self, at: Instant, value_ms: f64) {
        self.samples.push_back(TimestampedSample { at, value_ms });
        self.evict_before(at);
    }

    fn evict_before(&mut self, now: Instant) {
        while let Some(front) = self.samples.front() {
            if now.duration_since(front.at) > self.window {
                self.samples.pop_front();
            } else {
                break;
            }
        }
    }

    /// Sort the current in-window snapshot and return the `p`-th
    /// percentile (spec.md §4.6: "percentiles are computed by sorting the
    /// in-window snapshot on demand").
    pub fn percentile(&self, now: Instant, p: f64) -> Option<f64> {
        let mut values: Vec<f64> = self
            .samples
            .iter()
            .filter(|s| now.duration_since(s.at) <= self.window)
            .map(|s| s.value_ms)
            .collect();
        if values.is_empty() {
            return None;
        }
        values.sort_by(|a, b| a.total_cmp(b));
        let idx = ((p.clamp(0.0, 1.0) * (values.len() - 1) as f64).round()) as usize;
        Some(values[idx])
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

/// Per-worker aggregate stats.
#[derive(Debug, Clone, Default)]
pub struct WorkerMetrics {
    pub busy_time_ms: f64,
    pub tasks_completed: u64,
    pub tasks_failed: u64,
    duration_ewma_ms: f64,
}

const EWMA_ALPHA: f64 = 0.2;

impl WorkerMetrics {
    pub fn record_task(&mut self, duration_ms: f64, success: bool) {
        self.busy_time_ms += duration_ms;
        if success {
            self.tasks_completed += 1;
        } else {
            self.tasks_failed += 1;
        }
        self.duration_ewma_ms = if self.tasks_completed + self.tasks_failed == 1 {
            duration_ms
        } else {
            EWMA_ALPHA * duration_ms + (1.0 - EWMA_ALPHA) * self.duration_ewma_ms
        };
    }

    pub fn duration_ewma_ms(&self) -> f64 {
        self.duration_ewma_ms
    }
}

/// Queue depth and throughput stats.
#[derive(Debug, Clone, Default)]
pub struct QueueMetrics {
    pub depth: usize,
    pub peak_depth: usize,
    pub total_enqueued: u64,
    pub total_dequeued: u64,
    total_wait_ms: f64,
}

impl QueueMetrics {
    pub fn on_enqueue(&mut self) {
        self.depth += 1;
        self.peak_depth = self.peak_depth.max(self.depth);
        self.total_enqueued += 1;
    }

    pub fn on_dequeue(&mut self, wait_ms: f64) {
        self.depth = self.depth.saturating_sub(1);
        self.total_dequeued += 1;
        self.total_wait_ms += wait_ms;
    }

    pub fn avg_wait_ms(&self) -> f64 {
        if self.total_dequeued == 0 { 0.0 } else { self.total_wait_ms / self.total_dequeued as f64 }
    }
}

const RECENT_ERROR_CAPACITY: usize = 50;

/// Error totals, per-`FailureKind` counters, and a bounded recent-error
/// ring for inspection/export.
#[derive(Debug, Default)]
pub struct ErrorMetrics {
    pub total: u64,
    per_kind: HashMap<FailureKind, u64>,
    recent: VecDeque<(Instant, FailureKind, String)>,
}

impl ErrorMetrics {
    pub fn record(&mut self, at: Instant, kind: FailureKind, message: String) {
        self.total += 1;
        *self.per_kind.entry(kind).or_insert(0) += 1;
        if self.recent.len() >= RECENT_ERROR_CAPACITY {
            self.recent.pop_front();
        }
        self.recent.push_back((at, kind, message));
    }

    pub fn count_for(&self, kind: FailureKind) -> u64 {
        self.per_kind.get(&kind).copied().unwrap_or(0)
    }

    pub fn recent(&self) -> impl Iterator<Item = &(Instant, FailureKind, String)> {
        self.recent.iter()
    }
}

/// Top-level metrics aggregator, exported at `metrics_interval_ms` or on
/// demand via `Pool::get_metrics` (spec.md §4.6).
pub struct Metrics {
    pub latency: Histogram,
    pub window: TimeWindowBuffer,
    pub queue: QueueMetrics,
    pub errors: ErrorMetrics,
    workers: HashMap<usize, WorkerMetrics>,
}

impl Metrics {
    pub fn new(window: Duration) -> Self {
        Metrics {
            latency: Histogram::default(),
            window: TimeWindowBuffer::new(window),
            queue: QueueMetrics::default(),
            errors: ErrorMetrics::default(),
            workers: HashMap::new(),
        }
    }

    pub fn record_task_duration(&mut self, at: Instant, worker_index: usize, duration_ms: f64, success: bool) {
        self.latency.record(duration_ms);
        self.window.record(at, duration_ms);
        self.workers.entry(worker_index).or_default().record_task(duration_ms, success);
    }

    pub fn record_error(&mut self, at: Instant, kind: FailureKind, message: String) {
        self.errors.record(at, kind, message);
    }

    pub fn worker(&self, worker_index: usize) -> Option<&WorkerMetrics> {
        self.workers.get(&worker_index)
    }

    pub fn remove_worker(&mut self, worker_index: usize) {
        self.workers.remove(&worker_index);
    }

    /// Build the exported snapshot (spec.md §4.1 `get_metrics`, §4.6
    /// "export is triggered at a configurable interval or on demand").
    pub fn snapshot(&self, now: Instant) -> MetricsSnapshot {
        let mut per_worker: Vec<(usize, WorkerMetrics)> =
            self.workers.iter().map(|(idx, m)| (*idx, m.clone())).collect();
        per_worker.sort_by_key(|(idx, _)| *idx);

        MetricsSnapshot {
            latency_mean_ms: self.latency.mean_ms(),
            latency_p50_ms: self.latency.percentile(0.5),
            latency_p95_ms: self.latency.percentile(0.95),
            latency_p99_ms: self.latency.percentile(0.99),
            window_p50_ms: self.window.percentile(now, 0.5),
            window_p95_ms: self.window.percentile(now, 0.95),
            sample_count: self.latency.total_count(),
            queue_depth: self.queue.depth,
            queue_peak_depth: self.queue.peak_depth,
            queue_total_enqueued: self.queue.total_enqueued,
            queue_total_dequeued: self.queue.total_dequeued,
            queue_avg_wait_ms: self.queue.avg_wait_ms(),
            errors_total: self.errors.total,
            per_worker,
        }
    }
}

/// Point-in-time export of [`Metrics`], returned by `Pool::get_metrics`.
/// Stable, owned data — safe to hold or serialize after the pool mutex is
/// released.
#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    pub latency_mean_ms: f64,
    pub latency_p50_ms: f64,
    pub latency_p95_ms: f64,
    pub latency_p99_ms: f64,
    pub window_p50_ms: Option<f64>,
    pub window_p95_ms: Option<f64>,
    pub sample_count: u64,
    pub queue_depth: usize,
    pub queue_peak_depth: usize,
    pub queue_total_enqueued: u64,
    pub queue_total_dequeued: u64,
    pub queue_avg_wait_ms: f64,
    pub errors_total: u64,
    pub per_worker: Vec<(usize, WorkerMetrics)>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn histogram_buckets_samples_and_overflows() {
        let mut h = Histogram::new(&[10, 100]);
        h.record(5.0);
        h.record(50.0);
        h.record(500.0);
        assert_eq!(h.total_count(), 3);
        assert_eq!(h.counts[0], 1);
        assert_eq!(h.counts[1], 1);
        assert_eq!(h.overflow, 1);
    }

    #[test]
    fn histogram_mean_and_percentile() {
        let mut h = Histogram::new(&DEFAULT_HISTOGRAM_BUCKETS_MS);
        for v in [1.0, 5.0, 10.0, 50.0] {
            h.record(v);
        }
        assert!((h.mean_ms() - 16.5).abs() < 0.01);
        assert!(h.percentile(1.0) >= 50.0);
    }

    #[test]
    fn time_window_buffer_evicts_old_samples() {
        let mut w = TimeWindowBuffer::new(Duration::from_millis(50));
        let t0 = Instant::now();
        w.record(t0, 10.0);
        w.record(t0 + Duration::from_millis(20), 20.0);
        assert_eq!(w.len(), 2);

        let t1 = t0 + Duration::from_millis(100);
        w.record(t1, 30.0);
        assert_eq!(w.len(), 1);
    }

    #[test]
    fn time_window_percentile_sorts_on_demand() {
        let mut w = TimeWindowBuffer::new(Duration::from_secs(60));
        let t0 = Instant::now();
        for v in [30.0, 10.0, 20.0] {
            w.record(t0, v);
        }
        assert_eq!(w.percentile(t0, 0.0), Some(10.0));
        assert_eq!(w.percentile(t0, 1.0), Some(30.0));
    }

    #[test]
    fn worker_metrics_tracks_ewma_and_counts() {
        let mut m = WorkerMetrics::default();
        m.record_task(10.0, true);
        m.record_task(20.0, true);
        m.record_task(5.0, false);
        assert_eq!(m.tasks_completed, 2);
        assert_eq!(m.tasks_failed, 1);
        assert!(m.duration_ewma_ms() > 0.0);
    }

    #[test]
    fn queue_metrics_tracks_depth_and_avg_wait() {
        let mut q = QueueMetrics::default();
        q.on_enqueue();
        q.on_enqueue();
        assert_eq!(q.depth, 2);
        assert_eq!(q.peak_depth, 2);
        q.on_dequeue(10.0);
        q.on_dequeue(20.0);
        assert_eq!(q.depth, 0);
        assert_eq!(q.avg_wait_ms(), 15.0);
    }

    #[test]
    fn error_metrics_counts_per_kind_and_bounds_recent_ring() {
        let mut e = ErrorMetrics::default();
        let t0 = Instant::now();
        for _ in 0..(RECENT_ERROR_CAPACITY + 5) {
            e.record(t0, FailureKind::Timeout, "timeout".into());
        }
        assert_eq!(e.total, (RECENT_ERROR_CAPACITY + 5) as u64);
        assert_eq!(e.count_for(FailureKind::Timeout), (RECENT_ERROR_CAPACITY + 5) as u64);
        assert_eq!(e.recent().count(), RECENT_ERROR_CAPACITY);
    }

    #[test]
    fn metrics_aggregates_per_worker_duration() {
        let mut metrics = Metrics::new(Duration::from_secs(60));
        let t0 = Instant::now();
        metrics.record_task_duration(t0, 0, 12.0, true);
        metrics.record_task_duration(t0, 0, 8.0, true);
        assert_eq!(metrics.worker(0).unwrap().tasks_completed, 2);
        assert_eq!(metrics.latency.total_count(), 2);
    }
}
