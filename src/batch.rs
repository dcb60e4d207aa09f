//! Batch executor (spec.md §4.7).
//!
//! Grounded on `kernel::executor::Executor`'s tick loop — a managed
//! collection of slots, a bounded-concurrency admission gate, and
//! wake-driven progress — narrowed from polling futures to the simpler
//! shape this crate needs: each slot is a task already dispatched through
//! `crate::pool::Pool::exec`, so there is nothing here to poll. The
//! executor only tracks *which* slots may launch next and aggregates their
//! settlement, consistent with the rest of this crate's single-
//! orchestrator-thread model (`crate::work_stealing`'s module doc).

use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

struct Slot {
    state: SlotState,
    duration_ms: Option<f64>,
}

#[derive(Debug, Clone)]
pub struct BatchOptions {
    pub concurrency: usize,
    pub fail_fast: bool,
    pub progress_throttle_ms: u64,
    pub task_timeout: Option<Duration>,
    pub batch_timeout: Option<Duration>,
}

impl Default for BatchOptions {
    fn default() -> Self {
        BatchOptions { concurrency: usize::MAX, fail_fast: false, progress_throttle_ms: 100, task_timeout: None, batch_timeout: None }
    }
}

/// Progress snapshot (spec.md §4.7 step 6).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BatchProgress {
    pub completed: usize,
    pub total: usize,
    pub successes: usize,
    pub failures: usize,
    pub percentage: f64,
    pub estimated_remaining_ms: Option<f64>,
    pub throughput_tasks_per_s: f64,
}

/// Per-slot result once the batch finishes (spec.md §4.7 step 7).
#[derive(Debug, Clone)]
pub struct SlotResult {
    pub index: usize,
    pub success: bool,
    pub duration_ms: f64,
}

#[derive(Debug, Clone)]
pub struct BatchResult {
    pub slots: Vec<SlotResult>,
    pub successes: usize,
    pub failures: usize,
    pub duration_ms: f64,
    pub all_succeeded: bool,
    pub cancelled: bool,
}

/// Drives `total` task launches at bounded concurrency. The caller
/// (`crate::pool::Pool::exec_batch`) supplies the actual task submission
/// and is responsible for calling [`BatchExecutor::next_to_launch`] /
/// [`BatchExecutor::on_settle`] from its own dispatch loop.
pub struct BatchExecutor {
    slots: Vec<Slot>,
    options: BatchOptions,
    running: usize,
    completed: usize,
    successes: usize,
    failures: usize,
    next_index: usize,
    paused: bool,
    cancelled: bool,
    started_at: Instant,
    last_progress_emit: Option<Instant>,
}

impl BatchExecutor {
    pub fn new(total: usize, options: BatchOptions, now: Instant) -> Self {
        let mut slots = Vec::with_capacity(total);
        for _ in 0..total {
            slots.push(Slot { state: SlotState::Pending, duration_ms: None });
        }
        BatchExecutor {
            slots,
            options,
            running: 0,
            completed: 0,
            successes: 0,
            failures: 0,
            next_index: 0,
            paused: false,
            cancelled: false,
            started_at: now,
            last_progress_emit: None,
        }
    }

    pub fn total(&self) -> usize {
        self.slots.len()
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    pub fn pause(&mut self) {
        self.paused = true;
    }

    pub fn resume(&mut self) {
        self.paused = false;
    }

    pub fn is_finished(&self) -> bool {
        self.completed >= self.slots.len()
    }

    /// Find the next pending slot and mark it `Running`, or `None` if the
    /// concurrency cap is saturated, the batch is paused, or input is
    /// exhausted (spec.md §4.7 step 2).
    pub fn next_to_launch(&mut self) -> Option<usize> {
        if self.paused || self.cancelled || self.running >= self.options.concurrency {
            return None;
        }
        while self.next_index < self.slots.len() {
            let idx = self.next_index;
            self.next_index += 1;
            if self.slots[idx].state == SlotState::Pending {
                self.slots[idx].state = SlotState::Running;
                self.running += 1;
                return Some(idx);
            }
        }
        None
    }

    /// Record a slot's settlement. Returns `true` if `fail_fast` just
    /// triggered an implicit cancel as a result of this failure.
    pub fn on_settle(&mut self, index: usize, success: bool, duration_ms: f64) -> bool {
        let slot = &mut self.slots[index];
        if slot.state != SlotState::Running {
            return false;
        }
        slot.state = if success { SlotState::Completed } else { SlotState::Failed };
        slot.duration_ms = Some(duration_ms);
        self.running = self.running.saturating_sub(1);
        self.completed += 1;
        if success {
            self.successes += 1;
        } else {
            self.failures += 1;
        }

        if !success && self.options.fail_fast && !self.cancelled {
            self.cancel();
            return true;
        }
        false
    }

    /// Mark every pending slot cancelled (spec.md §4.7 step 4). Running
    /// slots are left for the caller to cooperatively cancel via the
    /// transport and settle normally through `on_settle`.
    pub fn cancel(&mut self) -> Vec<usize> {
        self.cancelled = true;
        let mut newly_cancelled = Vec::new();
        for (idx, slot) in self.slots.iter_mut().enumerate() {
            if slot.state == SlotState::Pending {
                slot.state = SlotState::Cancelled;
                newly_cancelled.push(idx);
            }
        }
        self.completed += newly_cancelled.len();
        newly_cancelled
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled
    }

    /// Whether a progress snapshot should be emitted now, respecting
    /// `progress_throttle_ms`.
    pub fn should_emit_progress(&mut self, now: Instant) -> bool {
        match self.last_progress_emit {
            Some(last) if now.duration_since(last).as_millis() < self.options.progress_throttle_ms as u128 => false,
            _ => {
                self.last_progress_emit = Some(now);
                true
            }
        }
    }

    pub fn progress(&self, now: Instant) -> BatchProgress {
        let total = self.slots.len();
        let percentage = if total == 0 { 100.0 } else { (self.completed as f64 / total as f64) * 100.0 };
        let elapsed_s = now.duration_since(self.started_at).as_secs_f64();
        let throughput = if elapsed_s > 0.0 { self.completed as f64 / elapsed_s } else { 0.0 };
        let estimated_remaining_ms = if throughput > 0.0 && self.completed < total {
            Some(((total - self.completed) as f64 / throughput) * 1000.0)
        } else {
            None
        };
        BatchProgress {
            completed: self.completed,
            total,
            successes: self.successes,
            failures: self.failures,
            percentage,
            estimated_remaining_ms,
            throughput_tasks_per_s: throughput,
        }
    }

    pub fn finish(&self, now: Instant) -> BatchResult {
        let slots = self
            .slots
            .iter()
            .enumerate()
            .map(|(index, slot)| SlotResult {
                index,
                success: slot.state == SlotState::Completed,
                duration_ms: slot.duration_ms.unwrap_or(0.0),
            })
            .collect();
        BatchResult {
            slots,
            successes: self.successes,
            failures: self.failures,
            duration_ms: now.duration_since(self.started_at).as_secs_f64() * 1000.0,
            all_succeeded: self.failures == 0 && !self.cancelled,
            cancelled: self.cancelled,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn launches_up_to_concurrency_cap() {
        let mut batch = BatchExecutor::new(5, BatchOptions { concurrency: 2, ..Default::default() }, Instant::now());
        assert_eq!(batch.next_to_launch(), Some(0));
        assert_eq!(batch.next_to_launch(), Some(1));
        assert_eq!(batch.next_to_launch(), None, "concurrency cap reached");
    }

    #[test]
    fn settling_a_slot_admits_the_next() {
        let mut batch = BatchExecutor::new(3, BatchOptions { concurrency: 1, ..Default::default() }, Instant::now());
        assert_eq!(batch.next_to_launch(), Some(0));
        batch.on_settle(0, true, 5.0);
        assert_eq!(batch.next_to_launch(), Some(1));
    }

    #[test]
    fn pause_blocks_new_launches_but_not_running_ones() {
        let mut batch = BatchExecutor::new(3, BatchOptions { concurrency: 2, ..Default::default() }, Instant::now());
        batch.next_to_launch();
        batch.pause();
        assert_eq!(batch.next_to_launch(), None);
        assert!(!batch.on_settle(0, true, 1.0) /* fail_fast off */);
        batch.resume();
        assert_eq!(batch.next_to_launch(), Some(1));
    }

    #[test]
    fn fail_fast_cancels_remaining_pending_slots_on_first_failure() {
        let mut batch = BatchExecutor::new(4, BatchOptions { concurrency: 4, fail_fast: true, ..Default::default() }, Instant::now());
        for _ in 0..4 {
            batch.next_to_launch();
        }
        let triggered = batch.on_settle(0, false, 2.0);
        assert!(triggered);
        assert!(batch.is_cancelled());
    }

    #[test]
    fn explicit_cancel_marks_pending_slots_cancelled_and_counts_them_completed() {
        let mut batch = BatchExecutor::new(5, BatchOptions { concurrency: 1, ..Default::default() }, Instant::now());
        batch.next_to_launch();
        let cancelled = batch.cancel();
        assert_eq!(cancelled, vec![1, 2, 3, 4]);
        assert!(!batch.is_finished(), "the running slot 0 still needs to settle");
    }

    #[test]
    fn finish_reports_aggregate_counts() {
        let mut batch = BatchExecutor::new(2, BatchOptions { concurrency: 2, ..Default::default() }, Instant::now());
        batch.next_to_launch();
        batch.next_to_launch();
        batch.on_settle(0, true, 3.0);
        batch.on_settle(1, false, 4.0);
        let result = batch.finish(Instant::now());
        assert_eq!(result.successes, 1);
        assert_eq!(result.failures, 1);
        assert!(!result.all_succeeded);
    }
}
