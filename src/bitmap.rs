//! Worker bitmap — O(1) idle-worker discovery (spec.md §3, §4.3).
//!
//! Two parallel bit arrays, `initialized` and `idle`, over a fixed capacity
//! of 256 worker slots, packed into 32-bit words so the lowest idle slot is
//! found via `trailing_zeros` per word rather than a bit-by-bit scan, in
//! the spirit of the index-packing trick in
//! `kernel::work_stealing::deque::Inner::{pack_top, unpack_top}`.

use std::sync::atomic::{AtomicU32, Ordering};

pub const CAPACITY: usize = 256;
const WORDS: usize = CAPACITY / 32;

fn first_set_in_word(word: u32) -> Option<u32> {
    if word == 0 {
        None
    } else {
        Some(word.trailing_zeros())
    }
}

/// Single-threaded worker bitmap used by the central scheduling mode.
#[derive(Debug, Default)]
pub struct WorkerBitmap {
    initialized: [u32; WORDS],
    idle: [u32; WORDS],
}

impl WorkerBitmap {
    pub fn new() -> Self {
        Self::default()
    }

    fn word_bit(index: usize) -> (usize, u32) {
        (index / 32, 1u32 << (index % 32))
    }

    pub fn set_initialized(&mut self, index: usize, value: bool) {
        let (w, b) = Self::word_bit(index);
        if value {
            self.initialized[w] |= b;
        } else {
            self.initialized[w] &= !b;
            self.idle[w] &= !b;
        }
    }

    pub fn set_idle(&mut self, index: usize, value: bool) {
        debug_assert!(self.is_initialized(index), "idle bit set on uninitialized slot");
        let (w, b) = Self::word_bit(index);
        if value {
            self.idle[w] |= b;
        } else {
            self.idle[w] &= !b;
        }
    }

    pub fn is_initialized(&self, index: usize) -> bool {
        let (w, b) = Self::word_bit(index);
        self.initialized[w] & b != 0
    }

    pub fn is_idle(&self, index: usize) -> bool {
        let (w, b) = Self::word_bit(index);
        self.idle[w] & b != 0
    }

    /// O(1) (amortised over 8 words) lowest idle slot.
    pub fn find_first_idle(&self) -> Option<usize> {
        for (w, &word) in self.idle.iter().enumerate() {
            if let Some(bit) = first_set_in_word(word) {
                return Some(w * 32 + bit as usize);
            }
        }
        None
    }

    /// Atomically (within this single-threaded structure) claim and clear
    /// the idle bit for the returned slot.
    pub fn claim_idle(&mut self) -> Option<usize> {
        let idx = self.find_first_idle()?;
        self.set_idle(idx, false);
        Some(idx)
    }

    pub fn idle_count(&self) -> usize {
        self.idle.iter().map(|w| w.count_ones() as usize).sum()
    }

    pub fn initialized_count(&self) -> usize {
        self.initialized.iter().map(|w| w.count_ones() as usize).sum()
    }
}

/// Shared (cross-thread) variant using atomic compare-exchange on 32-bit
/// segments, for the distributed scheduling mode's fast path.
#[derive(Debug)]
pub struct SharedWorkerBitmap {
    initialized: [AtomicU32; WORDS],
    idle: [AtomicU32; WORDS],
}

impl Default for SharedWorkerBitmap {
    fn default() -> Self {
        SharedWorkerBitmap {
            initialized: std::array::from_fn(|_| AtomicU32::new(0)),
            idle: std::array::from_fn(|_| AtomicU32::new(0)),
        }
    }
}

impl SharedWorkerBitmap {
    pub fn new() -> Self {
        Self::default()
    }

    fn word_bit(index: usize) -> (usize, u32) {
        (index / 32, 1u32 << (index % 32))
    }

    pub fn set_initialized(&self, index: usize, value: bool) {
        let (w, b) = Self::word_bit(index);
        if value {
            self.initialized[w].fetch_or(b, Ordering::SeqCst);
        } else {
            self.initialized[w].fetch_and(!b, Ordering::SeqCst);
            self.idle[w].fetch_and(!b, Ordering::SeqCst);
        }
    }

    pub fn set_idle(&self, index: usize, value: bool) {
        let (w, b) = Self::word_bit(index);
        if value {
            self.idle[w].fetch_or(b, Ordering::SeqCst);
        } else {
            self.idle[w].fetch_and(!b, Ordering::SeqCst);
        }
    }

    pub fn is_idle(&self, index: usize) -> bool {
        let (w, b) = Self::word_bit(index);
        self.idle[w].load(Ordering::SeqCst) & b != 0
    }

    /// Try to claim any idle slot via CAS; retries on lost races against
    /// other claimants, same discipline as the deque's top-index CAS loop.
    pub fn claim_idle(&self) -> Option<usize> {
        for (w, word) in self.idle.iter().enumerate() {
            loop {
                let snapshot = word.load(Ordering::SeqCst);
                let Some(bit) = first_set_in_word(snapshot) else { break };
                let mask = 1u32 << bit;
                let new = snapshot & !mask;
                match word.compare_exchange(snapshot, new, Ordering::SeqCst, Ordering::SeqCst) {
                    Ok(_) => return Some(w * 32 + bit as usize),
                    Err(_) => continue,
                }
            }
        }
        None
    }

    pub fn idle_count(&self) -> usize {
        self.idle.iter().map(|w| w.load(Ordering::SeqCst).count_ones() as usize).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_set_word_lookup() {
        assert_eq!(first_set_in_word(0b0000_0100), Some(2));
        assert_eq!(first_set_in_word(0), None);
    }

    #[test]
    fn find_first_idle_is_lowest_index() {
        let mut bm = WorkerBitmap::new();
        for i in 0..4 {
            bm.set_initialized(i, true);
            bm.set_idle(i, true);
        }
        bm.set_idle(0, false);
        bm.set_idle(1, false);
        assert_eq!(bm.find_first_idle(), Some(2));
    }

    #[test]
    fn idle_subset_of_initialized() {
        let mut bm = WorkerBitmap::new();
        bm.set_initialized(5, true);
        bm.set_idle(5, true);
        bm.set_initialized(5, false);
        assert!(!bm.is_idle(5));
    }

    #[test]
    fn claim_idle_clears_bit() {
        let mut bm = WorkerBitmap::new();
        bm.set_initialized(0, true);
        bm.set_idle(0, true);
        assert_eq!(bm.claim_idle(), Some(0));
        assert!(!bm.is_idle(0));
        assert_eq!(bm.claim_idle(), None);
    }

    #[test]
    fn shared_claim_idle_is_exclusive() {
        let bm = SharedWorkerBitmap::new();
        bm.set_initialized(3, true);
        bm.set_idle(3, true);
        assert_eq!(bm.claim_idle(), Some(3));
        assert_eq!(bm.claim_idle(), None);
        assert!(!bm.is_idle(3));
    }

    #[test]
    fn capacity_spans_256_slots() {
        let mut bm = WorkerBitmap::new();
        bm.set_initialized(255, true);
        bm.set_idle(255, true);
        assert_eq!(bm.find_first_idle(), Some(255));
    }
}
