//! The cancelable result primitive (spec.md §4.4).
//!
//! Grounded on `kernel::ipc`'s `Sender`/`Receiver`/`RecvFuture` split
//! (a future that polls a shared cell) generalised from a single-threaded
//! `Rc<RefCell<..>>` to a cross-thread `Arc<Mutex<..>>`, and on the
//! blocking `TaskResult` condvar pattern used by the pack's
//! `aria-lang::pool::PooledJoinHandle` for the synchronous `.wait()` path
//! the orchestrator and tests use alongside the async `Future` impl.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, Waker};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use crate::error::PoolError;
use crate::serializer::Value;

pub type TaskOutput = Result<Value, PoolError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Settled {
    No,
    Yes,
}

struct Shared {
    outcome: Option<TaskOutput>,
    waker: Option<Waker>,
    /// Set once dispatch has actually handed the task to a worker. Before
    /// that, an armed `timeout_ms` is only *recorded*, not ticking.
    dispatched: bool,
    /// Timeout recorded before dispatch; armed into a real deadline once
    /// `mark_dispatched` runs.
    queued_timer_ms: Option<u64>,
    /// Callback invoked exactly once, at settlement, used to implement
    /// `then`/`catch`/`finally` chaining and cancel propagation.
    subscribers: Vec<Box<dyn FnOnce(&TaskOutput) + Send>>,
    cancel_requested: bool,
    /// Set by a child created via `then_linked` so cancelling the child
    /// also cancels this handle's underlying task.
    on_cancel: Option<Box<dyn FnOnce() + Send>>,
}

impl Shared {
    fn new() -> Self {
        Shared {
            outcome: None,
            waker: None,
            dispatched: false,
            queued_timer_ms: None,
            subscribers: Vec::new(),
            cancel_requested: false,
            on_cancel: None,
        }
    }

    fn settled(&self) -> Settled {
        if self.outcome.is_some() { Settled::Yes } else { Settled::No }
    }
}

/// The caller-facing side of a task's result. Cheaply `Clone`-able; every
/// clone observes the same settlement.
pub struct PendingResult {
    shared: Arc<Mutex<Shared>>,
    condvar: Arc<Condvar>,
}

impl Clone for PendingResult {
    fn clone(&self) -> Self {
        PendingResult { shared: self.shared.clone(), condvar: self.condvar.clone() }
    }
}

/// The dispatcher-facing side used to settle a task.
pub struct Resolver {
    shared: Arc<Mutex<Shared>>,
    condvar: Arc<Condvar>,
}

impl Clone for Resolver {
    fn clone(&self) -> Self {
        Resolver { shared: self.shared.clone(), condvar: self.condvar.clone() }
    }
}

/// Create a linked resolver/pending-result pair, mirroring the original's
/// `Promise.defer()` helper for synthesising handles outside a
/// constructor.
pub fn defer() -> (Resolver, PendingResult) {
    let shared = Arc::new(Mutex::new(Shared::new()));
    let condvar = Arc::new(Condvar::new());
    (
        Resolver { shared: shared.clone(), condvar: condvar.clone() },
        PendingResult { shared, condvar },
    )
}

impl Resolver {
    fn settle(&self, outcome: TaskOutput) {
        let mut guard = self.shared.lock();
        if guard.settled() == Settled::Yes {
            return;
        }
        guard.outcome = Some(outcome);
        let waker = guard.waker.take();
        let subscribers = std::mem::take(&mut guard.subscribers);
        let outcome_ref = guard.outcome.as_ref().unwrap().clone_for_subscribers();
        drop(guard);

        self.condvar.notify_all();
        if let Some(w) = waker {
            w.wake();
        }
        for sub in subscribers {
            sub(&outcome_ref);
        }
    }

    pub fn resolve(&self, value: Value) {
        self.settle(Ok(value));
    }

    pub fn reject(&self, err: PoolError) {
        self.settle(Err(err));
    }

    pub fn is_pending(&self) -> bool {
        self.shared.lock().settled() == Settled::No
    }

    /// True once the caller has requested cancellation (checked
    /// cooperatively by the dispatcher before/while running the task).
    pub fn is_cancel_requested(&self) -> bool {
        self.shared.lock().cancel_requested
    }

    /// Mark dispatch as having begun; arms any timer that was recorded
    /// while the task was still queued (spec.md §4.4, §5).
    pub fn mark_dispatched(&self) -> Option<Duration> {
        let mut guard = self.shared.lock();
        guard.dispatched = true;
        guard.queued_timer_ms.map(Duration::from_millis)
    }
}

impl PendingResult {
    /// Record (but don't yet arm) a timeout. If the task is already
    /// dispatched, the timer is considered armed immediately by the
    /// caller (the orchestrator owns the actual timer wheel either way);
    /// this method only tracks the caller's intent and pre-dispatch
    /// value so `mark_dispatched` can report it.
    pub fn timeout(&self, ms: u64) {
        let mut guard = self.shared.lock();
        if !guard.dispatched {
            guard.queued_timer_ms = Some(ms);
        }
    }

    pub fn is_dispatched(&self) -> bool {
        self.shared.lock().dispatched
    }

    pub fn is_pending(&self) -> bool {
        self.shared.lock().settled() == Settled::No
    }

    /// Transition a pending handle to rejected with `CancellationError`.
    /// Fulfilled/rejected handles ignore this. Propagates to a linked
    /// parent only if one was wired via `then_linked`.
    pub fn cancel(&self, task_id: u64) {
        let mut guard = self.shared.lock();
        if guard.settled() == Settled::Yes {
            return;
        }
        guard.cancel_requested = true;
        let on_cancel = guard.on_cancel.take();
        drop(guard);

        if let Some(cb) = on_cancel {
            cb();
        }

        let resolver = Resolver { shared: self.shared.clone(), condvar: self.condvar.clone() };
        resolver.reject(PoolError::Cancellation { task_id });
    }

    /// Block the calling thread until settlement (used by tests and by
    /// any synchronous integration point; the orchestrator itself never
    /// calls this on its own thread).
    pub fn wait(&self) -> TaskOutput {
        let mut guard = self.shared.lock();
        while guard.settled() == Settled::No {
            self.condvar.wait(&mut guard);
        }
        guard.outcome.clone().unwrap()
    }

    pub fn wait_timeout(&self, timeout: Duration) -> Option<TaskOutput> {
        let mut guard = self.shared.lock();
        let deadline = std::time::Instant::now() + timeout;
        while guard.settled() == Settled::No {
            let now = std::time::Instant::now();
            if now >= deadline {
                return None;
            }
            let result = self.condvar.wait_for(&mut guard, deadline - now);
            if result.timed_out() && guard.settled() == Settled::No {
                return None;
            }
        }
        guard.outcome.clone()
    }

    /// Chain a continuation, returning a fresh handle whose fate depends
    /// on this one. Cancellation of the child does NOT propagate to the
    /// parent unless `then_linked` is used instead.
    pub fn then<F, E>(&self, on_ok: F, on_err: E) -> PendingResult
    where
        F: FnOnce(Value) -> TaskOutput + Send + 'static,
        E: FnOnce(PoolError) -> TaskOutput + Send + 'static,
    {
        let (resolver, pending) = defer();
        self.subscribe(move |outcome| {
            let next = match outcome.clone() {
                Ok(v) => on_ok(v),
                Err(e) => on_err(e),
            };
            match next {
                Ok(v) => resolver.resolve(v),
                Err(e) => resolver.reject(e),
            }
        });
        pending
    }

    /// Like `then`, but wires cancellation of the returned handle back to
    /// this parent handle.
    pub fn then_linked<F, E>(&self, on_ok: F, on_err: E) -> PendingResult
    where
        F: FnOnce(Value) -> TaskOutput + Send + 'static,
        E: FnOnce(PoolError) -> TaskOutput + Send + 'static,
    {
        let child = self.then(on_ok, on_err);
        let parent = self.clone();
        child.shared.lock().on_cancel = Some(Box::new(move || {
            parent.cancel(0);
        }));
        child
    }

    pub fn catch<E>(&self, on_err: E) -> PendingResult
    where
        E: FnOnce(PoolError) -> TaskOutput + Send + 'static,
    {
        self.then(Ok, on_err)
    }

    /// Runs regardless of outcome; does not change the settled value.
    pub fn finally<F>(&self, f: F) -> PendingResult
    where
        F: FnOnce() + Send + 'static,
    {
        self.then(
            move |v| {
                f();
                Ok(v)
            },
            move |e| Err(e),
        )
    }

    fn subscribe<F>(&self, f: F)
    where
        F: FnOnce(&TaskOutput) + Send + 'static,
    {
        let mut guard = self.shared.lock();
        if let Some(outcome) = guard.outcome.clone() {
            drop(guard);
            f(&outcome);
        } else {
            guard.subscribers.push(Box::new(f));
        }
    }
}

impl Future for PendingResult {
    type Output = TaskOutput;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut guard = self.shared.lock();
        if let Some(outcome) = guard.outcome.clone() {
            Poll::Ready(outcome)
        } else {
            guard.waker = Some(cx.waker().clone());
            Poll::Pending
        }
    }
}

impl TaskOutputExt for TaskOutput {
    fn clone_for_subscribers(&self) -> TaskOutput {
        self.clone()
    }
}

trait TaskOutputExt {
    fn clone_for_subscribers(&self) -> TaskOutput;
}
