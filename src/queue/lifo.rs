//! LIFO task queue: tail-oriented push/pop over a dynamic array.

use super::TaskQueueStrategy;
use crate::task::{Task, TaskId};

pub struct LifoQueue {
    items: Vec<Task>,
}

impl LifoQueue {
    pub fn new() -> Self {
        LifoQueue { items: Vec::new() }
    }
}

impl Default for LifoQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskQueueStrategy for LifoQueue {
    fn push(&mut self, task: Task) {
        self.items.push(task);
    }

    fn pop(&mut self) -> Option<Task> {
        self.items.pop()
    }

    fn contains(&self, id: TaskId) -> bool {
        self.items.iter().any(|t| t.task_id == id)
    }

    fn size(&self) -> usize {
        self.items.len()
    }

    fn clear(&mut self) {
        self.items.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::promise::defer;
    use crate::task::{ExecOptions, Method};

    fn task(id: u64) -> Task {
        let (resolver, _pending) = defer();
        Task::new(TaskId(id), Method::Named("noop".into()), vec![], resolver, &ExecOptions::default())
    }

    #[test]
    fn lifo_order_is_last_in_first_out() {
        let mut q = LifoQueue::new();
        q.push(task(1));
        q.push(task(2));
        q.push(task(3));

        assert_eq!(q.pop().unwrap().task_id, TaskId(3));
        assert_eq!(q.pop().unwrap().task_id, TaskId(2));
        assert_eq!(q.pop().unwrap().task_id, TaskId(1));
    }
}
