//! Parallel collection operations (spec.md §4.8).
//!
//! Each operation's *chunking and merge* policy lives here as pure,
//! synchronous functions; `crate::pool::Pool` drives the actual dispatch
//! of one task per chunk through [`crate::batch::BatchExecutor`] and calls
//! back into these helpers once every chunk has settled. Keeping merge
//! logic pure (no `Pool` dependency) makes the ordering/empty-input
//! contracts directly testable, the way `kernel::work_stealing`'s deque
//! logic is tested independent of any scheduler.

use std::cmp::Reverse;
use std::collections::BinaryHeap;

use crate::serializer::Value;

/// `(start_index, len)` windows over an input of length `n`.
pub fn make_chunks(n: usize, chunk_size: usize) -> Vec<(usize, usize)> {
    if n == 0 {
        return Vec::new();
    }
    let chunk_size = chunk_size.max(1);
    let mut chunks = Vec::with_capacity(n.div_ceil(chunk_size));
    let mut start = 0;
    while start < n {
        let len = chunk_size.min(n - start);
        chunks.push((start, len));
        start += len;
    }
    chunks
}

/// Default chunk size heuristics (spec.md §4.8): `max(1, ceil(n/8))` for
/// reduce-shaped ops, `1` for map-like ops, unless the caller configured
/// one explicitly.
pub fn default_chunk_size(n: usize, is_reduce_shaped: bool, configured: Option<usize>) -> usize {
    if let Some(c) = configured {
        return c.max(1);
    }
    if is_reduce_shaped { n.div_ceil(8).max(1) } else { 1 }
}

/// `map`: chunk results are already contiguous windows of the original
/// order, so merging is just sorting by `start_index` and concatenating.
pub fn merge_map(mut chunk_results: Vec<(usize, Vec<Value>)>) -> Vec<Value> {
    chunk_results.sort_by_key(|(start, _)| *start);
    chunk_results.into_iter().flat_map(|(_, values)| values).collect()
}

/// `flatMap`: per-chunk arrays keyed by chunk index, concatenated in chunk
/// order (spec.md §4.8: "merging is a simple concat in chunk order").
pub fn merge_flat_map(mut chunk_results: Vec<(usize, Vec<Value>)>) -> Vec<Value> {
    chunk_results.sort_by_key(|(chunk_index, _)| *chunk_index);
    chunk_results.into_iter().flat_map(|(_, values)| values).collect()
}

/// `reduce`: each chunk is pre-folded into an `Option<Value>` (`None` for
/// an empty chunk); the main thread folds the non-null partials into
/// `initial` with the supplied associative combiner, in chunk order.
/// Empty input naturally yields `initial` unchanged.
pub fn merge_reduce<F>(partials: Vec<Option<Value>>, initial: Value, mut combine: F) -> Value
where
    F: FnMut(Value, Value) -> Value,
{
    partials.into_iter().flatten().fold(initial, |acc, partial| combine(acc, partial))
}

/// `reduceRight`: mirror decomposition over the reversed input — the
/// caller chunks the reversed sequence and passes partials already in
/// right-to-left chunk order; folding proceeds the same way.
pub fn merge_reduce_right<F>(partials: Vec<Option<Value>>, initial: Value, combine: F) -> Value
where
    F: FnMut(Value, Value) -> Value,
{
    merge_reduce(partials, initial, combine)
}

/// `filter`/`partition`/`unique`/`groupBy` (`preserve_order=true`):
/// k-way merge of per-chunk `(original_index, value)` streams, each
/// already sorted ascending by `original_index` within its chunk, ordered
/// by a min-heap keyed on the index so the merged stream is globally
/// sorted without a full re-sort.
pub fn kway_merge_by_index(streams: Vec<Vec<(usize, Value)>>) -> Vec<Value> {
    let mut cursors: Vec<usize> = vec![0; streams.len()];
    let mut heap: BinaryHeap<Reverse<(usize, usize)>> = BinaryHeap::new();

    for (stream_idx, stream) in streams.iter().enumerate() {
        if let Some((original_index, _)) = stream.first() {
            heap.push(Reverse((*original_index, stream_idx)));
        }
    }

    let mut out = Vec::new();
    while let Some(Reverse((_, stream_idx))) = heap.pop() {
        let cursor = cursors[stream_idx];
        out.push(streams[stream_idx][cursor].1.clone());
        cursors[stream_idx] += 1;
        if let Some((next_index, _)) = streams[stream_idx].get(cursors[stream_idx]) {
            heap.push(Reverse((*next_index, stream_idx)));
        }
    }
    out
}

/// Outcome of one chunk's `some`/`find`/`every`/`findIndex` predicate scan.
#[derive(Debug, Clone, Copy)]
pub struct PredicateHit {
    pub found: bool,
    pub index: usize,
}

/// `some`: true if any chunk reports a hit. Empty input → `false`.
pub fn merge_some(hits: &[PredicateHit]) -> bool {
    hits.iter().any(|h| h.found)
}

/// `every`: true unless any chunk reports a miss. Empty input → `true`.
pub fn merge_every(misses: &[PredicateHit]) -> bool {
    !misses.iter().any(|h| h.found)
}

/// `find`/`findIndex`: lowest-index hit across chunks, or `None` (empty
/// input, or no chunk matched).
pub fn merge_find(hits: &[PredicateHit]) -> Option<usize> {
    hits.iter().filter(|h| h.found).map(|h| h.index).min()
}
