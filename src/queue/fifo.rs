//! FIFO task queue: power-of-two circular buffer with amortised O(1)
//! push/pop, doubling capacity on overflow. Mirrors the buffer discipline
//! of `kernel::fifo::FifoBuffer` (capacity tracking, explicit slot clearing
//! on drain) generalised from bytes to `Task`.

use super::TaskQueueStrategy;
use crate::task::{Task, TaskId};

pub struct FifoQueue {
    slots: Vec<Option<Task>>,
    head: usize,
    tail: usize,
    len: usize,
    mask: usize,
}

const INITIAL_CAPACITY: usize = 16;

impl FifoQueue {
    pub fn new() -> Self {
        Self::with_capacity(INITIAL_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.next_power_of_two().max(1);
        let mut slots = Vec::with_capacity(capacity);
        slots.resize_with(capacity, || None);
        FifoQueue { slots, head: 0, tail: 0, len: 0, mask: capacity - 1 }
    }

    fn grow(&mut self) {
        let old_capacity = self.slots.len();
        let new_capacity = old_capacity * 2;
        let mut new_slots = Vec::with_capacity(new_capacity);
        new_slots.resize_with(new_capacity, || None);

        // Re-lay elements to base in logical order.
        for i in 0..self.len {
            let idx = (self.head + i) & self.mask;
            new_slots[i] = self.slots[idx].take();
        }

        self.slots = new_slots;
        self.head = 0;
        self.tail = self.len;
        self.mask = new_capacity - 1;
    }
}

impl Default for FifoQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskQueueStrategy for FifoQueue {
    fn push(&mut self, task: Task) {
        if self.len == self.slots.len() {
            self.grow();
        }
        self.slots[self.tail] = Some(task);
        self.tail = (self.tail + 1) & self.mask;
        self.len += 1;
    }

    fn pop(&mut self) -> Option<Task> {
        if self.len == 0 {
            return None;
        }
        let task = self.slots[self.head].take();
        self.head = (self.head + 1) & self.mask;
        self.len -= 1;
        task
    }

    fn contains(&self, id: TaskId) -> bool {
        (0..self.len).any(|i| {
            let idx = (self.head + i) & self.mask;
            self.slots[idx].as_ref().is_some_and(|t| t.task_id == id)
        })
    }

    fn size(&self) -> usize {
        self.len
    }

    fn clear(&mut self) {
        for slot in self.slots.iter_mut() {
            *slot = None;
        }
        self.head = 0;
        self.tail = 0;
        self.len = 0;
    }
}
