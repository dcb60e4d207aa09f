//! Task queue layer (spec.md §4.2): pluggable admission ordering.
//!
//! Three built-in realisations plus a narrow trait a caller can implement
//! for a custom strategy, replacing the source's duck-typed queue per the
//! redesign note in spec.md §9.

mod fifo;
mod lifo;
mod priority;

pub use fifo::FifoQueue;
pub use lifo::LifoQueue;
pub use priority::PriorityQueue;

use crate::task::{Task, TaskId};

/// A polymorphic ordered container over tasks.
pub trait TaskQueueStrategy: Send {
    fn push(&mut self, task: Task);
    fn pop(&mut self) -> Option<Task>;
    fn contains(&self, id: TaskId) -> bool;
    fn size(&self) -> usize;
    fn clear(&mut self);

    fn is_empty(&self) -> bool {
        self.size() == 0
    }
}

/// Build the strategy named by [`crate::config::QueueStrategy`]. `Custom`
/// has no built-in realisation — callers supply their own
/// `Box<dyn TaskQueueStrategy>` directly to `Pool::with_queue`.
pub fn build(strategy: crate::config::QueueStrategy) -> Option<Box<dyn TaskQueueStrategy>> {
    use crate::config::QueueStrategy as S;
    match strategy {
        S::Fifo => Some(Box::new(FifoQueue::new())),
        S::Lifo => Some(Box::new(LifoQueue::new())),
        S::Priority => Some(Box::new(PriorityQueue::new())),
        S::Custom => None,
    }
}
