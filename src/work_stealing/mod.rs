//! Work-stealing task scheduler (spec.md §4.2 / SPEC_FULL.md §6).
//!
//! Grounded on `kernel::work_stealing`'s architecture — per-worker local
//! deque, shared injector, steal-on-empty — generalised in one important
//! way: the teacher's version spawns its own OS threads and polls futures
//! with a waker vtable, because each "worker" there *is* an async task.
//! Here a worker is a separate process/thread on the far side of a
//! [`crate::transport::Transport`] (spec.md's "single orchestrator thread"
//! redesign, §16), so there is exactly one caller — the dispatch loop in
//! `crate::pool` — pushing and popping every local deque. That collapses
//! the teacher's parking/waker machinery entirely: no thread is ever
//! blocked waiting on this structure, it's plain synchronous bookkeeping.

mod deque;
mod injector;

pub use deque::{StealResult, Stealer, Worker};
pub use injector::{InjectResult, Injector};

use std::sync::atomic::{AtomicUsize, Ordering};

use crate::config::StealPolicy;
use crate::task::Task;

/// Per-worker local deques, a shared injector for un-affined tasks, and the
/// stealing logic that rebalances load across them. Every method takes
/// `&self`: callers share one `Scheduler` (typically via `Arc`), but by
/// construction only the dispatch loop ever calls `submit`/`find_work`.
pub struct Scheduler {
    locals: Vec<Worker<Task>>,
    stealers: Vec<Stealer<Task>>,
    injector: Injector<Task>,
    policy: StealPolicy,
    /// Queue-length gap that triggers an extra rebalancing batch steal
    /// beyond the single task returned to the caller.
    imbalance_threshold: usize,
    rr_cursor: AtomicUsize,
}

impl Scheduler {
    pub fn new(num_workers: usize, local_queue_capacity: usize, policy: StealPolicy, imbalance_threshold: usize) -> Self {
        let mut locals = Vec::with_capacity(num_workers);
        let mut stealers = Vec::with_capacity(num_workers);
        for _ in 0..num_workers {
            let (worker, stealer) = Worker::new(local_queue_capacity);
            locals.push(worker);
            stealers.push(stealer);
        }
        Scheduler { locals, stealers, injector: Injector::new(), policy, imbalance_threshold, rr_cursor: AtomicUsize::new(0) }
    }

    pub fn num_workers(&self) -> usize {
        self.locals.len()
    }

    /// Route a task: to a specific worker's local queue when `worker_hint`
    /// names one (affinity or an explicit `preferred_worker`), falling back
    /// to the shared injector when there's no hint or the target queue is
    /// momentarily full.
    pub fn submit(&self, task: Task, worker_hint: Option<usize>) {
        if let Some(idx) = worker_hint {
            if idx < self.locals.len() {
                if let Err(task) = self.locals[idx].push(task) {
                    self.injector.push(task);
                }
                return;
            }
        }
        self.injector.push(task);
    }

    /// Next task for `worker_id`: its own queue (cache-hot), then the
    /// injector, then a steal from a sibling chosen by `policy`.
    pub fn find_work(&self, worker_id: usize) -> Option<Task> {
        if let StealResult::Success(task) = self.locals[worker_id].pop() {
            return Some(task);
        }
        if let InjectResult::Success(task) = self.injector.steal() {
            return Some(task);
        }
        self.steal_for(worker_id)
    }

    fn steal_for(&self, worker_id: usize) -> Option<Task> {
        let n = self.locals.len();
        if n <= 1 {
            return None;
        }
        for victim in self.victim_order(worker_id) {
            if victim == worker_id {
                continue;
            }
            loop {
                match self.stealers[victim].steal() {
                    StealResult::Success(task) => {
                        self.maybe_rebalance(worker_id, victim);
                        return Some(task);
                    }
                    StealResult::Empty => break,
                    StealResult::Retry => continue,
                }
            }
        }
        None
    }

    fn victim_order(&self, worker_id: usize) -> Vec<usize> {
        let n = self.locals.len();
        match self.policy {
            StealPolicy::RoundRobin => {
                let start = self.rr_cursor.fetch_add(1, Ordering::Relaxed) % n;
                (0..n).map(|i| (start + i) % n).collect()
            }
            StealPolicy::Neighbor => (1..n).map(|d| (worker_id + d) % n).collect(),
            StealPolicy::BusiestFirst => {
                let mut order: Vec<usize> = (0..n).collect();
                order.sort_by_key(|&i| std::cmp::Reverse(self.stealers[i].len()));
                order
            }
            StealPolicy::Random => {
                let mut order: Vec<usize> = (0..n).collect();
                for i in (1..order.len()).rev() {
                    let j = fastrand::usize(0..=i);
                    order.swap(i, j);
                }
                order
            }
        }
    }

    /// After a successful steal, if the victim is still far ahead of the
    /// thief by more than `imbalance_threshold`, move half the gap into
    /// the injector so the same imbalance doesn't trigger a steal on every
    /// single dispatch.
    fn maybe_rebalance(&self, worker_id: usize, victim: usize) {
        let victim_len = self.stealers[victim].len();
        let own_len = self.locals[worker_id].len();
        if victim_len <= own_len.saturating_add(self.imbalance_threshold) {
            return;
        }
        let batch = (victim_len - own_len) / 2;
        for _ in 0..batch {
            match self.stealers[victim].steal() {
                StealResult::Success(task) => self.injector.push(task),
                StealResult::Empty => break,
                StealResult::Retry => continue,
            }
        }
    }

    pub fn queue_len(&self, worker_id: usize) -> usize {
        self.locals[worker_id].len()
    }

    pub fn pending_injector(&self) -> usize {
        self.injector.len()
    }

    pub fn total_pending(&self) -> usize {
        self.injector.len() + (0..self.locals.len()).map(|i| self.locals[i].len()).sum::<usize>()
    }
}

/// Maps an affinity key to a stable worker index via FNV-1a, so repeated
/// calls with the same key land on the same worker as long as the pool's
/// worker count doesn't change (spec.md §4.1.2's `affinity_key` routing).
pub fn affinity_worker_index(affinity_key: &str, num_workers: usize) -> usize {
    if num_workers == 0 {
        return 0;
    }
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for byte in affinity_key.bytes() {
        hash ^= byte as u64;
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    (hash % num_workers as u64) as usize
}
