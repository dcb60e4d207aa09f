//! Lock-free-ish multi-producer multi-consumer injector queue.
//!
//! External task submission (`Pool::exec`) lands here rather than in any
//! single worker's local deque; idle workers and the dispatch loop both
//! drain it. Reused from the teacher's `kernel::work_stealing::injector`
//! with one swap: `std::sync::Mutex` → `parking_lot::Mutex`, to match the
//! lock type used throughout the rest of this crate.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;

pub struct Injector<T> {
    inner: Arc<InjectorInner<T>>,
}

struct InjectorInner<T> {
    queue: Mutex<VecDeque<T>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InjectResult<T> {
    Success(T),
    Empty,
}

impl<T> Injector<T> {
    pub fn new() -> Self {
        Injector { inner: Arc::new(InjectorInner { queue: Mutex::new(VecDeque::new()) }) }
    }

    pub fn push(&self, task: T) {
        self.inner.queue.lock().push_back(task);
    }

    pub fn steal(&self) -> InjectResult<T> {
        match self.inner.queue.lock().pop_front() {
            Some(task) => InjectResult::Success(task),
            None => InjectResult::Empty,
        }
    }

    /// Steal up to `max` tasks in one lock acquisition, handing each to
    /// `push_fn` (typically a worker's local deque push). Returns the count
    /// actually moved.
    pub fn steal_batch<F>(&self, max: usize, mut push_fn: F) -> usize
    where
        F: FnMut(T),
    {
        let mut queue = self.inner.queue.lock();
        let count = queue.len().min(max);
        for _ in 0..count {
            if let Some(task) = queue.pop_front() {
                push_fn(task);
            }
        }
        count
    }

    pub fn is_empty(&self) -> bool {
        self.inner.queue.lock().is_empty()
    }

    pub fn len(&self) -> usize {
        self.inner.queue.lock().len()
    }
}

impl<T> Default for Injector<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Clone for Injector<T> {
    fn clone(&self) -> Self {
        Injector { inner: self.inner.clone() }
    }
}

unsafe impl<T: Send> Send for Injector<T> {}
unsafe impl<T: Send> Sync for Injector<T> {}
