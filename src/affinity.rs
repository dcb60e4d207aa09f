//! AffinityRouter: sticky-worker routing plus performance-adaptive victim
//! ranking for the work-stealing scheduler (spec.md §3 "AffinityRouter
//! state").
//!
//! Grounded on `kernel::process`'s dense-index-keyed lookup table style
//! (arena + index rather than cyclic pointers, per spec.md §9's "cyclic
//! references in worker graphs" redesign flag), here keyed by affinity
//! string instead of `Pid`.

use std::collections::{HashMap, HashSet, VecDeque};
use std::time::{Duration, Instant};

use crate::worker::WorkerHandle;

struct AffinityEntry {
    worker_index: usize,
    hit_count: u64,
    last_access: Instant,
    ttl: Duration,
}

impl AffinityEntry {
    fn is_expired(&self, now: Instant) -> bool {
        now.duration_since(self.last_access) > self.ttl
    }
}

/// Bounded-size sticky routing table plus per-worker performance profiles
/// used to rank steal victims and idle-worker candidates.
pub struct AffinityRouter {
    table: HashMap<String, AffinityEntry>,
    /// Insertion/access order, least-recently-used at the front, for
    /// eviction once `table` reaches `capacity`.
    lru_order: VecDeque<String>,
    capacity: usize,
    default_ttl: Duration,
    task_type_workers: HashMap<String, HashSet<usize>>,
}

impl AffinityRouter {
    pub fn new(capacity: usize, default_ttl: Duration) -> Self {
        AffinityRouter {
            table: HashMap::new(),
            lru_order: VecDeque::new(),
            capacity: capacity.max(1),
            default_ttl,
            task_type_workers: HashMap::new(),
        }
    }

    fn touch(&mut self, key: &str) {
        self.lru_order.retain(|k| k != key);
        self.lru_order.push_back(key.to_string());
    }

    fn evict_if_needed(&mut self) {
        while self.table.len() > self.capacity {
            if let Some(oldest) = self.lru_order.pop_front() {
                self.table.remove(&oldest);
            } else {
                break;
            }
        }
    }

    /// Look up (or assign, via `assign_fn` — typically least-loaded worker
    /// selection) the worker pinned to `affinity_key`. Expired entries are
    /// treated as absent and reassigned.
    pub fn resolve<F>(&mut self, affinity_key: &str, now: Instant, assign_fn: F) -> usize
    where
        F: FnOnce() -> usize,
    {
        if let Some(entry) = self.table.get_mut(affinity_key) {
            if !entry.is_expired(now) {
                entry.hit_count += 1;
                entry.last_access = now;
                let worker_index = entry.worker_index;
                self.touch(affinity_key);
                return worker_index;
            }
        }

        let worker_index = assign_fn();
        self.table.insert(
            affinity_key.to_string(),
            AffinityEntry { worker_index, hit_count: 1, last_access: now, ttl: self.default_ttl },
        );
        self.touch(affinity_key);
        self.evict_if_needed();
        worker_index
    }

    pub fn entry_count(&self) -> usize {
        self.table.len()
    }

    pub fn register_task_type_worker(&mut self, task_type: &str, worker_index: usize) {
        self.task_type_workers.entry(task_type.to_string()).or_default().insert(worker_index);
    }

    pub fn workers_for_task_type(&self, task_type: &str) -> Option<&HashSet<usize>> {
        self.task_type_workers.get(task_type)
    }

    /// Rank candidate workers for `task_type` by overall score (highest
    /// first), used to pick a steal victim or idle-worker tiebreak when
    /// more than one candidate is available.
    pub fn best_candidate<'a>(&self, task_type: &str, workers: &'a [WorkerHandle]) -> Option<&'a WorkerHandle> {
        let candidates = self.workers_for_task_type(task_type);
        workers
            .iter()
            .filter(|w| candidates.is_none_or(|set| set.contains(&w.worker_index)))
            .max_by(|a, b| a.overall_score().total_cmp(&b.overall_score()))
    }

    pub fn evict_expired(&mut self, now: Instant) {
        let expired: Vec<String> = self.table.iter().filter(|(_, e)| e.is_expired(now)).map(|(k, _)| k.clone()).collect();
        for key in expired {
            self.table.remove(&key);
            self.lru_order.retain(|k| k != &key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_is_sticky_for_the_same_key() {
        let mut router = AffinityRouter::new(8, Duration::from_secs(60));
        let now = Instant::now();
        let mut calls = 0;
        let first = router.resolve("session-1", now, || {
            calls += 1;
            3
        });
        let second = router.resolve("session-1", now, || {
            calls += 1;
            7
        });
        assert_eq!(first, 3);
        assert_eq!(second, 3);
        assert_eq!(calls, 1);
    }

    #[test]
    fn evicts_least_recently_used_past_capacity() {
        let mut router = AffinityRouter::new(2, Duration::from_secs(60));
        let now = Instant::now();
        router.resolve("a", now, || 0);
        router.resolve("b", now, || 1);
        router.resolve("c", now, || 2);
        assert_eq!(router.entry_count(), 2);
    }

    #[test]
    fn expired_entry_is_reassigned() {
        let mut router = AffinityRouter::new(8, Duration::from_millis(1));
        let t0 = Instant::now();
        router.resolve("a", t0, || 0);
        let t1 = t0 + Duration::from_millis(50);
        let reassigned = router.resolve("a", t1, || 9);
        assert_eq!(reassigned, 9);
    }

    #[test]
    fn task_type_registration_narrows_best_candidate() {
        let mut router = AffinityRouter::new(8, Duration::from_secs(60));
        router.register_task_type_worker("render", 0);
        router.register_task_type_worker("render", 1);
        assert!(router.workers_for_task_type("render").unwrap().contains(&0));
        assert!(router.workers_for_task_type("compile").is_none());
    }
}
