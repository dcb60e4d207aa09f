//! Worker health monitor (spec.md §4.1.4 / §6 "Health checks").
//!
//! Grounded on `kernel::timer::TimerQueue`'s deadline bookkeeping, narrowed
//! from a generic min-heap of wake targets to one per-worker probe
//! deadline, since every worker is probed independently and on its own
//! cadence rather than competing for a single shared heap.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use crate::config::HealthCheckAction;

const LATENCY_HISTORY_CAPACITY: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerHealth {
    Responsive,
    Unresponsive,
}

struct WorkerProbe {
    last_request_time: Option<Instant>,
    last_response_time: Option<Instant>,
    request_id: u64,
    in_flight_request_id: Option<u64>,
    latency_history_ms: VecDeque<f64>,
    missed_count: u32,
    health: WorkerHealth,
}

impl WorkerProbe {
    fn new() -> Self {
        WorkerProbe {
            last_request_time: None,
            last_response_time: None,
            request_id: 0,
            in_flight_request_id: None,
            latency_history_ms: VecDeque::with_capacity(LATENCY_HISTORY_CAPACITY),
            missed_count: 0,
            health: WorkerHealth::Responsive,
        }
    }

    fn record_latency(&mut self, latency_ms: f64) {
        if self.latency_history_ms.len() >= LATENCY_HISTORY_CAPACITY {
            self.latency_history_ms.pop_front();
        }
        self.latency_history_ms.push_back(latency_ms);
    }

    fn avg_latency_ms(&self) -> Option<f64> {
        if self.latency_history_ms.is_empty() {
            None
        } else {
            Some(self.latency_history_ms.iter().sum::<f64>() / self.latency_history_ms.len() as f64)
        }
    }
}

/// Outcome of a missed heartbeat, telling the caller what corrective action
/// the configured `HealthCheckAction` requires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthOutcome {
    Ok,
    Warn { worker_index: usize },
    Remove { worker_index: usize },
    Restart { worker_index: usize },
    Recovered { worker_index: usize },
}

/// Sends periodic heartbeats to every registered worker and tracks
/// request/response timing, latency history, and consecutive misses.
pub struct HeartbeatMonitor {
    interval: Duration,
    timeout: Duration,
    max_missed: u32,
    action: HealthCheckAction,
    probes: HashMap<usize, WorkerProbe>,
}

impl HeartbeatMonitor {
    pub fn new(interval: Duration, timeout: Duration, max_missed: u32, action: HealthCheckAction) -> Self {
        HeartbeatMonitor { interval, timeout, max_missed, action, probes: HashMap::new() }
    }

    pub fn register(&mut self, worker_index: usize) {
        self.probes.entry(worker_index).or_insert_with(WorkerProbe::new);
    }

    pub fn unregister(&mut self, worker_index: usize) {
        self.probes.remove(&worker_index);
    }

    /// Whether `worker_index` is due for a new probe: no probe in flight
    /// and at least `interval` elapsed since the last request.
    pub fn due(&self, worker_index: usize, now: Instant) -> bool {
        let Some(probe) = self.probes.get(&worker_index) else { return false };
        if probe.in_flight_request_id.is_some() {
            return false;
        }
        match probe.last_request_time {
            None => true,
            Some(t) => now.duration_since(t) >= self.interval,
        }
    }

    /// Send a new probe, returning its request id to correlate with the
    /// eventual `on_response`/`on_timeout`.
    pub fn begin_probe(&mut self, worker_index: usize, now: Instant) -> Option<u64> {
        let probe = self.probes.get_mut(&worker_index)?;
        probe.request_id += 1;
        let id = probe.request_id;
        probe.in_flight_request_id = Some(id);
        probe.last_request_time = Some(now);
        Some(id)
    }

    /// A probe in flight for longer than `timeout` is considered missed.
    pub fn has_timed_out(&self, worker_index: usize, now: Instant) -> bool {
        let Some(probe) = self.probes.get(&worker_index) else { return false };
        match (probe.in_flight_request_id, probe.last_request_time) {
            (Some(_), Some(sent_at)) => now.duration_since(sent_at) >= self.timeout,
            _ => false,
        }
    }

    pub fn on_response(&mut self, worker_index: usize, request_id: u64, now: Instant) -> HealthOutcome {
        let Some(probe) = self.probes.get_mut(&worker_index) else { return HealthOutcome::Ok };
        if probe.in_flight_request_id != Some(request_id) {
            return HealthOutcome::Ok;
        }
        let latency_ms = probe.last_request_time.map(|t| now.duration_since(t).as_secs_f64() * 1000.0).unwrap_or(0.0);
        probe.record_latency(latency_ms);
        probe.last_response_time = Some(now);
        probe.in_flight_request_id = None;
        probe.missed_count = 0;

        if probe.health == WorkerHealth::Unresponsive {
            probe.health = WorkerHealth::Responsive;
            HealthOutcome::Recovered { worker_index }
        } else {
            HealthOutcome::Ok
        }
    }

    /// Called once `has_timed_out` is observed true; increments the miss
    /// counter and applies the configured action once `max_missed` is hit.
    pub fn on_timeout(&mut self, worker_index: usize) -> HealthOutcome {
        let Some(probe) = self.probes.get_mut(&worker_index) else { return HealthOutcome::Ok };
        probe.missed_count += 1;
        probe.in_flight_request_id = None;

        if probe.missed_count < self.max_missed {
            return HealthOutcome::Ok;
        }

        probe.health = WorkerHealth::Unresponsive;
        match self.action {
            HealthCheckAction::Warn => HealthOutcome::Warn { worker_index },
            HealthCheckAction::Remove => HealthOutcome::Remove { worker_index },
            HealthCheckAction::Restart => HealthOutcome::Restart { worker_index },
        }
    }

    pub fn health_of(&self, worker_index: usize) -> Option<WorkerHealth> {
        self.probes.get(&worker_index).map(|p| p.health)
    }

    pub fn avg_latency_ms(&self, worker_index: usize) -> Option<f64> {
        self.probes.get(&worker_index).and_then(|p| p.avg_latency_ms())
    }

    pub fn missed_count(&self, worker_index: usize) -> u32 {
        self.probes.get(&worker_index).map(|p| p.missed_count).unwrap_or(0)
    }

    /// The request id of the probe currently in flight for `worker_index`,
    /// used to correlate an inbound heartbeat frame back to `on_response`.
    pub fn in_flight_request_id(&self, worker_index: usize) -> Option<u64> {
        self.probes.get(&worker_index)?.in_flight_request_id
    }
}
