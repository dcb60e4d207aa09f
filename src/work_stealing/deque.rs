//! Lock-free Chase-Lev work-stealing deque.
//!
//! Based on "Dynamic Circular Work-Stealing Deque" by Chase and Lev (2005)
//! with simplifications from "Correct and Efficient Work-Stealing for Weak
//! Memory Models" by Le et al. (2013). Reused unchanged from the teacher's
//! `kernel::work_stealing::deque` (it was already generic over `T`) — only
//! the doc comments were retargeted from "tasks" in the abstract sense to
//! the concrete `StealableTask` this crate steals.
//!
//! Memory ordering rationale:
//! - bottom: only modified by owner, SeqCst for visibility to stealers
//! - top: modified by stealers via CAS, SeqCst for linearizability
//! - buffer: Relaxed loads/stores, correctness from index synchronization

use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Result of a pop or steal operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StealResult<T> {
    Success(T),
    Empty,
    /// Lost a race to another stealer or the owner; retry may succeed.
    Retry,
}

/// Fixed-size ring buffer backing the deque. Capacity is bounded rather
/// than growable, matching `local_queue_capacity` in the pool config.
struct Buffer<T> {
    data: Box<[UnsafeCell<MaybeUninit<T>>]>,
    capacity: usize,
    mask: usize,
}

impl<T> Buffer<T> {
    fn new(capacity: usize) -> Self {
        assert!(capacity.is_power_of_two(), "capacity must be power of 2");
        let data: Vec<_> = (0..capacity).map(|_| UnsafeCell::new(MaybeUninit::uninit())).collect();
        Self { data: data.into_boxed_slice(), capacity, mask: capacity - 1 }
    }

    #[inline]
    fn slot(&self, index: usize) -> &UnsafeCell<MaybeUninit<T>> {
        unsafe { self.data.get_unchecked(index & self.mask) }
    }

    /// # Safety
    /// Caller must ensure exclusive write access to this slot.
    #[inline]
    unsafe fn write(&self, index: usize, value: T) {
        let slot = self.slot(index);
        unsafe {
            (*slot.get()).write(value);
        }
    }

    /// # Safety
    /// Caller must ensure the slot holds a valid value and no concurrent
    /// write is in flight.
    #[inline]
    unsafe fn read(&self, index: usize) -> T {
        let slot = self.slot(index);
        unsafe { (*slot.get()).assume_init_read() }
    }
}

unsafe impl<T: Send> Send for Buffer<T> {}
unsafe impl<T: Send> Sync for Buffer<T> {}

/// Owner's handle: push and pop from the bottom (LIFO).
pub struct Worker<T> {
    inner: Arc<Inner<T>>,
}

/// Thief's handle: steal from the top (FIFO) only.
pub struct Stealer<T> {
    inner: Arc<Inner<T>>,
}

struct Inner<T> {
    /// Packed as `[32-bit unused][32-bit bottom]`. Only the owner writes.
    bottom: AtomicU64,
    /// Packed as `[32-bit generation][32-bit top]`. Generation guards
    /// against ABA across CAS retries.
    top: AtomicU64,
    buffer: Buffer<T>,
}

impl<T> Inner<T> {
    #[inline]
    fn unpack_bottom(packed: u64) -> usize {
        packed as u32 as usize
    }

    #[inline]
    fn pack_bottom(bottom: usize) -> u64 {
        bottom as u64
    }

    #[inline]
    fn unpack_top(packed: u64) -> (u32, usize) {
        let generation = (packed >> 32) as u32;
        let top = packed as u32 as usize;
        (generation, top)
    }

    #[inline]
    fn pack_top(generation: u32, top: usize) -> u64 {
        ((generation as u64) << 32) | (top as u64)
    }
}

impl<T: Send> Worker<T> {
    /// `capacity` must be a power of two.
    pub fn new(capacity: usize) -> (Worker<T>, Stealer<T>) {
        let inner = Arc::new(Inner { bottom: AtomicU64::new(0), top: AtomicU64::new(0), buffer: Buffer::new(capacity) });
        (Worker { inner: inner.clone() }, Stealer { inner })
    }

    /// Push onto the bottom. Returns `Err(task)` if the deque is full.
    pub fn push(&self, task: T) -> Result<(), T> {
        let bottom = Inner::<T>::unpack_bottom(self.inner.bottom.load(Ordering::Relaxed));
        let (_, top) = Inner::<T>::unpack_top(self.inner.top.load(Ordering::Acquire));

        let size = bottom.wrapping_sub(top);
        if size >= self.inner.buffer.capacity {
            return Err(task);
        }

        unsafe {
            self.inner.buffer.write(bottom, task);
        }
        self.inner.bottom.store(Inner::<T>::pack_bottom(bottom.wrapping_add(1)), Ordering::SeqCst);
        Ok(())
    }

    /// Pop from the bottom (LIFO).
    pub fn pop(&self) -> StealResult<T> {
        let old_bottom = Inner::<T>::unpack_bottom(self.inner.bottom.load(Ordering::Relaxed));
        let new_bottom = old_bottom.wrapping_sub(1);
        self.inner.bottom.store(Inner::<T>::pack_bottom(new_bottom), Ordering::SeqCst);

        let packed_top = self.inner.top.load(Ordering::SeqCst);
        let (generation, top) = Inner::<T>::unpack_top(packed_top);

        let size = old_bottom.wrapping_sub(top) as isize;

        if size <= 0 {
            self.inner.bottom.store(Inner::<T>::pack_bottom(top), Ordering::SeqCst);
            return StealResult::Empty;
        }

        let task = unsafe { self.inner.buffer.read(new_bottom) };

        if size == 1 {
            let new_packed_top = Inner::<T>::pack_top(generation.wrapping_add(1), top.wrapping_add(1));
            if self.inner.top.compare_exchange(packed_top, new_packed_top, Ordering::SeqCst, Ordering::Relaxed).is_ok() {
                self.inner.bottom.store(Inner::<T>::pack_bottom(top.wrapping_add(1)), Ordering::SeqCst);
                StealResult::Success(task)
            } else {
                self.inner.bottom.store(Inner::<T>::pack_bottom(top.wrapping_add(1)), Ordering::SeqCst);
                StealResult::Empty
            }
        } else {
            StealResult::Success(task)
        }
    }

    pub fn is_empty(&self) -> bool {
        let bottom = Inner::<T>::unpack_bottom(self.inner.bottom.load(Ordering::Relaxed));
        let (_, top) = Inner::<T>::unpack_top(self.inner.top.load(Ordering::Acquire));
        bottom.wrapping_sub(top) == 0
    }

    /// Approximate length; may be stale under concurrent stealing.
    pub fn len(&self) -> usize {
        let bottom = Inner::<T>::unpack_bottom(self.inner.bottom.load(Ordering::Relaxed));
        let (_, top) = Inner::<T>::unpack_top(self.inner.top.load(Ordering::Acquire));
        bottom.wrapping_sub(top)
    }

    pub fn stealer(&self) -> Stealer<T> {
        Stealer { inner: self.inner.clone() }
    }
}

impl<T: Send> Stealer<T> {
    /// Steal from the top (FIFO).
    pub fn steal(&self) -> StealResult<T> {
        let packed_top = self.inner.top.load(Ordering::Acquire);
        let (generation, top) = Inner::<T>::unpack_top(packed_top);

        std::sync::atomic::fence(Ordering::SeqCst);

        let bottom = Inner::<T>::unpack_bottom(self.inner.bottom.load(Ordering::Acquire));
        let size = bottom.wrapping_sub(top) as isize;

        if size <= 0 {
            return StealResult::Empty;
        }

        let task = unsafe { self.inner.buffer.read(top) };
        let new_packed_top = Inner::<T>::pack_top(generation.wrapping_add(1), top.wrapping_add(1));

        match self.inner.top.compare_exchange(packed_top, new_packed_top, Ordering::SeqCst, Ordering::Relaxed) {
            Ok(_) => StealResult::Success(task),
            Err(_) => {
                std::mem::forget(task);
                StealResult::Retry
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        let (_, top) = Inner::<T>::unpack_top(self.inner.top.load(Ordering::Acquire));
        let bottom = Inner::<T>::unpack_bottom(self.inner.bottom.load(Ordering::Acquire));
        bottom.wrapping_sub(top) == 0
    }

    /// Approximate length; may be stale under concurrent stealing.
    pub fn len(&self) -> usize {
        let (_, top) = Inner::<T>::unpack_top(self.inner.top.load(Ordering::Acquire));
        let bottom = Inner::<T>::unpack_bottom(self.inner.bottom.load(Ordering::Acquire));
        bottom.wrapping_sub(top).max(0)
    }
}

impl<T> Clone for Stealer<T> {
    fn clone(&self) -> Self {
        Stealer { inner: self.inner.clone() }
    }
}

unsafe impl<T: Send> Send for Worker<T> {}
unsafe impl<T: Send> Send for Stealer<T> {}
unsafe impl<T: Send> Sync for Stealer<T> {}
