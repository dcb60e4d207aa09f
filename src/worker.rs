//! WorkerHandle: one isolated execution context reachable only through its
//! `Transport` connection (spec.md §3).

use std::time::Instant;

use crate::config::WorkerType;
use crate::task::TaskId;
use crate::transport::WorkerConn;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerStatus {
    Uninitialized,
    Idle,
    Busy,
    Terminating,
}

/// EWMA/min/max/success-rate profile for one task type on one worker
/// (spec.md §3 `worker_profile`).
#[derive(Debug, Clone)]
pub struct TaskTypeProfile {
    pub avg_duration_ms: f64,
    pub min_ms: f64,
    pub max_ms: f64,
    pub success_count: u64,
    pub failure_count: u64,
}

const EWMA_ALPHA: f64 = 0.2;

impl TaskTypeProfile {
    fn new(duration_ms: f64, success: bool) -> Self {
        TaskTypeProfile {
            avg_duration_ms: duration_ms,
            min_ms: duration_ms,
            max_ms: duration_ms,
            success_count: if success { 1 } else { 0 },
            failure_count: if success { 0 } else { 1 },
        }
    }

    fn record(&mut self, duration_ms: f64, success: bool) {
        self.avg_duration_ms = EWMA_ALPHA * duration_ms + (1.0 - EWMA_ALPHA) * self.avg_duration_ms;
        self.min_ms = self.min_ms.min(duration_ms);
        self.max_ms = self.max_ms.max(duration_ms);
        if success {
            self.success_count += 1;
        } else {
            self.failure_count += 1;
        }
    }

    pub fn sample_count(&self) -> u64 {
        self.success_count + self.failure_count
    }

    pub fn success_rate(&self) -> f64 {
        let total = self.sample_count();
        if total == 0 { 1.0 } else { self.success_count as f64 / total as f64 }
    }
}

/// One isolated execution context. Invariant: at most one task assigned at
/// any moment (`state == Busy` iff `current_task.is_some()`).
pub struct WorkerHandle {
    pub worker_index: usize,
    pub state: WorkerStatus,
    pub worker_type: WorkerType,
    pub conn: Box<dyn WorkerConn>,
    pub spawned_at: Instant,
    pub last_heartbeat: Instant,
    pub tasks_completed: u64,
    current_task: Option<TaskId>,
    profiles: std::collections::HashMap<String, TaskTypeProfile>,
}

impl WorkerHandle {
    pub fn new(worker_index: usize, worker_type: WorkerType, conn: Box<dyn WorkerConn>) -> Self {
        let now = Instant::now();
        WorkerHandle {
            worker_index,
            state: WorkerStatus::Idle,
            worker_type,
            conn,
            spawned_at: now,
            last_heartbeat: now,
            tasks_completed: 0,
            current_task: None,
            profiles: std::collections::HashMap::new(),
        }
    }

    pub fn is_idle(&self) -> bool {
        self.state == WorkerStatus::Idle
    }

    pub fn is_busy(&self) -> bool {
        self.state == WorkerStatus::Busy
    }

    pub fn current_task(&self) -> Option<TaskId> {
        self.current_task
    }

    /// Assign `task_id`, transitioning `Idle -> Busy`. Panics (a
    /// programmer-error invariant violation, not a runtime failure) if the
    /// worker wasn't idle.
    pub fn assign(&mut self, task_id: TaskId) {
        debug_assert!(self.is_idle(), "assigned a task to a non-idle worker");
        self.current_task = Some(task_id);
        self.state = WorkerStatus::Busy;
    }

    /// Clear the current assignment, transitioning back to `Idle` and
    /// bumping the completion counter.
    pub fn release(&mut self) {
        self.current_task = None;
        self.tasks_completed += 1;
        if self.state == WorkerStatus::Busy {
            self.state = WorkerStatus::Idle;
        }
    }

    pub fn begin_terminating(&mut self) {
        self.state = WorkerStatus::Terminating;
    }

    pub fn record_task_duration(&mut self, task_type: &str, duration_ms: f64, success: bool) {
        self.profiles
            .entry(task_type.to_string())
            .and_modify(|p| p.record(duration_ms, success))
            .or_insert_with(|| TaskTypeProfile::new(duration_ms, success));
    }

    pub fn profile_for(&self, task_type: &str) -> Option<&TaskTypeProfile> {
        self.profiles.get(task_type)
    }

    /// Aggregate success rate across every task type this worker has seen,
    /// used by the affinity router to rank candidates when no per-task-type
    /// history exists yet.
    pub fn overall_score(&self) -> f64 {
        if self.profiles.is_empty() {
            return 1.0;
        }
        let total: f64 = self.profiles.values().map(|p| p.success_rate()).sum();
        total / self.profiles.len() as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{Frame, ThreadTransport, Transport};
    use std::sync::Arc;

    fn handle(index: usize) -> WorkerHandle {
        let transport = ThreadTransport::new();
        let conn = transport
            .spawn(crate::transport::WorkerParams { handler: Arc::new(|f: Frame| f) })
            .unwrap();
        WorkerHandle::new(index, WorkerType::Thread, conn)
    }

    #[test]
    fn starts_idle_and_transitions_on_assign_release() {
        let mut w = handle(0);
        assert!(w.is_idle());
        w.assign(TaskId(1));
        assert!(w.is_busy());
        assert_eq!(w.current_task(), Some(TaskId(1)));
        w.release();
        assert!(w.is_idle());
        assert_eq!(w.tasks_completed, 1);
        assert_eq!(w.current_task(), None);
    }

    #[test]
    fn records_ewma_duration_per_task_type() {
        let mut w = handle(0);
        w.record_task_duration("add", 10.0, true);
        w.record_task_duration("add", 20.0, true);
        let profile = w.profile_for("add").unwrap();
        assert!(profile.avg_duration_ms > 10.0 && profile.avg_duration_ms < 20.0);
        assert_eq!(profile.sample_count(), 2);
        assert_eq!(profile.success_rate(), 1.0);
    }

    #[test]
    fn overall_score_defaults_to_one_with_no_history() {
        let w = handle(0);
        assert_eq!(w.overall_score(), 1.0);
    }
}
