//! Priority task queue: binary max-heap keyed by `task.priority`, ties
//! broken by insertion order (arbitrary but stable enough for tests).

use std::collections::BinaryHeap;

use super::TaskQueueStrategy;
use crate::task::{Task, TaskId};

struct Entry {
    priority: i32,
    seq: u64,
    task: Task,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}
impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // Max-heap by priority; insertion order breaks ties so `pop`
        // behaves FIFO-ish among equal priorities.
        self.priority.cmp(&other.priority).then_with(|| other.seq.cmp(&self.seq))
    }
}

pub struct PriorityQueue {
    heap: BinaryHeap<Entry>,
    next_seq: u64,
}

impl PriorityQueue {
    pub fn new() -> Self {
        PriorityQueue { heap: BinaryHeap::new(), next_seq: 0 }
    }
}

impl Default for PriorityQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskQueueStrategy for PriorityQueue {
    fn push(&mut self, task: Task) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.heap.push(Entry { priority: task.priority, seq, task });
    }

    fn pop(&mut self) -> Option<Task> {
        self.heap.pop().map(|entry| entry.task)
    }

    fn contains(&self, id: TaskId) -> bool {
        self.heap.iter().any(|e| e.task.task_id == id)
    }

    fn size(&self) -> usize {
        self.heap.len()
    }

    fn clear(&mut self) {
        self.heap.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::promise::defer;
    use crate::task::{ExecOptions, Method};

    fn task_with_priority(id: u64, priority: i32) -> Task {
        let (resolver, _pending) = defer();
        let mut opts = ExecOptions::default();
        opts.priority = Some(priority);
        Task::new(TaskId(id), Method::Named("noop".into()), vec![], resolver, &opts)
    }

    #[test]
    fn pops_highest_priority_first() {
        let mut q = PriorityQueue::new();
        q.push(task_with_priority(1, 0));
        q.push(task_with_priority(2, 10));
        q.push(task_with_priority(3, 5));

        assert_eq!(q.pop().unwrap().task_id, TaskId(2));
        assert_eq!(q.pop().unwrap().task_id, TaskId(3));
        assert_eq!(q.pop().unwrap().task_id, TaskId(1));
    }

    #[test]
    fn ties_broken_by_insertion_order() {
        let mut q = PriorityQueue::new();
        q.push(task_with_priority(1, 5));
        q.push(task_with_priority(2, 5));

        assert_eq!(q.pop().unwrap().task_id, TaskId(1));
        assert_eq!(q.pop().unwrap().task_id, TaskId(2));
    }
}
