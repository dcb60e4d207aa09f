//! Event emission (spec.md §7.1 "Events").
//!
//! Generalised from `kernel::events::EventQueue`'s queue-between-ticks model
//! into a synchronous pub/sub bus: the orchestrator thread is the only
//! producer and every listener runs inline on `emit`, since spec.md's event
//! ordering guarantee ("`taskStart` precedes any `retry`, which precedes
//! `taskComplete`/`taskError`... event order follows admission order on the
//! orchestrator thread", §6) requires listeners to observe events in the
//! exact order they're emitted, not batched and replayed later.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::PoolError;
use crate::task::TaskId;

#[derive(Debug, Clone)]
pub enum PoolEvent {
    TaskStart { task_id: TaskId, method: String, worker_index: usize, ts_ms: f64 },
    TaskComplete { task_id: TaskId, duration_ms: f64, ts_ms: f64 },
    TaskError { task_id: TaskId, error: PoolError, duration_ms: f64, ts_ms: f64 },
    Retry { task_id: TaskId, attempt: u32, max_retries: u32, error: PoolError, ts_ms: f64 },
    CircuitOpen { ts_ms: f64 },
    CircuitHalfOpen { ts_ms: f64 },
    CircuitClose { ts_ms: f64 },
    MemoryPressure { used_bytes: usize, max_bytes: usize, action: &'static str, ts_ms: f64 },
    WorkerSpawn { worker_index: usize, ts_ms: f64 },
    WorkerExit { worker_index: usize, ts_ms: f64 },
    WorkerError { worker_index: usize, error: PoolError, ts_ms: f64 },
    QueueFull { pending_tasks: usize, max_pending: usize, ts_ms: f64 },
}

impl PoolEvent {
    /// The string name callers pass to `on`/`off`/`once` (spec.md §7.1's
    /// event name column).
    pub fn name(&self) -> &'static str {
        match self {
            PoolEvent::TaskStart { .. } => "taskStart",
            PoolEvent::TaskComplete { .. } => "taskComplete",
            PoolEvent::TaskError { .. } => "taskError",
            PoolEvent::Retry { .. } => "retry",
            PoolEvent::CircuitOpen { .. } => "circuitOpen",
            PoolEvent::CircuitHalfOpen { .. } => "circuitHalfOpen",
            PoolEvent::CircuitClose { .. } => "circuitClose",
            PoolEvent::MemoryPressure { .. } => "memoryPressure",
            PoolEvent::WorkerSpawn { .. } => "workerSpawn",
            PoolEvent::WorkerExit { .. } => "workerExit",
            PoolEvent::WorkerError { .. } => "workerError",
            PoolEvent::QueueFull { .. } => "queueFull",
        }
    }
}

type Listener = Box<dyn FnMut(&PoolEvent) + Send>;

struct Registration {
    id: u64,
    once: bool,
    listener: Listener,
}

/// Synchronous listener registry. `emit` calls every listener subscribed to
/// the event's name, catching panics so one bad listener can't take down
/// the dispatch loop (spec.md §7: "Listener exceptions in the event system
/// are swallowed").
#[derive(Default)]
pub struct EventBus {
    listeners: HashMap<&'static str, Vec<Registration>>,
    next_id: AtomicU64,
}

/// Token returned by `on`/`once`, usable with `off` to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriptionId(u64);

impl EventBus {
    pub fn new() -> Self {
        EventBus { listeners: HashMap::new(), next_id: AtomicU64::new(1) }
    }

    fn subscribe(&mut self, name: &'static str, once: bool, listener: Listener) -> SubscriptionId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.listeners.entry(name).or_default().push(Registration { id, once, listener });
        SubscriptionId(id)
    }

    pub fn on<F>(&mut self, name: &'static str, listener: F) -> SubscriptionId
    where
        F: FnMut(&PoolEvent) + Send + 'static,
    {
        self.subscribe(name, false, Box::new(listener))
    }

    pub fn once<F>(&mut self, name: &'static str, listener: F) -> SubscriptionId
    where
        F: FnMut(&PoolEvent) + Send + 'static,
    {
        self.subscribe(name, true, Box::new(listener))
    }

    pub fn off(&mut self, name: &'static str, id: SubscriptionId) {
        if let Some(regs) = self.listeners.get_mut(name) {
            regs.retain(|r| r.id != id.0);
        }
    }

    /// Invoke every listener registered for this event's name, in
    /// registration order, dropping `once` listeners afterward. A listener
    /// that panics is caught and logged at `warn`; its panic never
    /// propagates.
    pub fn emit(&mut self, event: &PoolEvent) {
        let name = event.name();
        let Some(regs) = self.listeners.get_mut(name) else { return };

        for reg in regs.iter_mut() {
            let listener = &mut reg.listener;
            let outcome = catch_unwind(AssertUnwindSafe(|| listener(event)));
            if outcome.is_err() {
                tracing::warn!(event = name, "pool event listener panicked; ignoring");
            }
        }
        regs.retain(|r| !r.once);
    }

    pub fn listener_count(&self, name: &str) -> usize {
        self.listeners.get(name).map(Vec::len).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    #[test]
    fn on_receives_every_emission() {
        let mut bus = EventBus::new();
        let count = Arc::new(AtomicUsize::new(0));
        let counted = count.clone();
        bus.on("taskStart", move |_| {
            counted.fetch_add(1, Ordering::SeqCst);
        });

        for i in 0..3 {
            bus.emit(&PoolEvent::TaskStart { task_id: TaskId(i), method: "add".into(), worker_index: 0, ts_ms: 0.0 });
        }
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn once_fires_only_a_single_time() {
        let mut bus = EventBus::new();
        let count = Arc::new(AtomicUsize::new(0));
        let counted = count.clone();
        bus.once("circuitOpen", move |_| {
            counted.fetch_add(1, Ordering::SeqCst);
        });

        bus.emit(&PoolEvent::CircuitOpen { ts_ms: 0.0 });
        bus.emit(&PoolEvent::CircuitOpen { ts_ms: 1.0 });
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn off_unsubscribes_by_token() {
        let mut bus = EventBus::new();
        let count = Arc::new(AtomicUsize::new(0));
        let counted = count.clone();
        let id = bus.on("queueFull", move |_| {
            counted.fetch_add(1, Ordering::SeqCst);
        });
        bus.off("queueFull", id);
        bus.emit(&PoolEvent::QueueFull { pending_tasks: 1, max_pending: 1, ts_ms: 0.0 });
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn panicking_listener_is_swallowed_and_later_listeners_still_run() {
        let mut bus = EventBus::new();
        let ran = Arc::new(AtomicUsize::new(0));
        let ran2 = ran.clone();
        bus.on("taskError", |_| panic!("boom"));
        bus.on("taskError", move |_| {
            ran2.fetch_add(1, Ordering::SeqCst);
        });

        bus.emit(&PoolEvent::TaskError {
            task_id: TaskId(1),
            error: PoolError::Termination { task_id: 1, reason: "boom".into() },
            duration_ms: 1.0,
            ts_ms: 0.0,
        });
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn unrelated_event_names_dont_cross_fire() {
        let mut bus = EventBus::new();
        let count = Arc::new(AtomicUsize::new(0));
        let counted = count.clone();
        bus.on("taskComplete", move |_| {
            counted.fetch_add(1, Ordering::SeqCst);
        });
        bus.emit(&PoolEvent::TaskStart { task_id: TaskId(1), method: "x".into(), worker_index: 0, ts_ms: 0.0 });
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }
}
