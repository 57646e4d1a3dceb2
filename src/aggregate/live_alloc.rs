//! Live-allocation tracking (spec §4.7 "live heap watcher"): keeps a
//! per-address table of outstanding allocations so a free can subtract
//! exactly what its matching allocation added, independent of sampling
//! order. Stacks are interned through the same [`super::Aggregator`] so a
//! hot allocation site's stack is stored once no matter how many
//! addresses currently point at it.

use std::collections::HashMap;

use super::StackId;

#[derive(Debug, Clone, Copy)]
struct LiveEntry {
    stack_id: StackId,
    size: i64,
}

#[derive(Debug, Default)]
pub struct LiveAllocationTracker {
    live: HashMap<u64, LiveEntry>,
    /// Outstanding bytes per stack, kept in sync with `live` so a
    /// snapshot doesn't need to re-walk every address.
    per_stack_bytes: HashMap<StackId, i64>,
    per_stack_count: HashMap<StackId, i64>,

    double_allocs: u64,
    unmatched_frees: u64,
}

impl LiveAllocationTracker {
    pub fn new() -> Self {
        LiveAllocationTracker::default()
    }

    /// Records an allocation of `size` bytes at `addr` attributed to
    /// `stack_id`. An allocation observed at an address already tracked
    /// (the allocator reused a pointer we never saw freed — a sampling
    /// gap, not a bug in the allocator) first retires the stale entry so
    /// per-stack totals stay accurate.
    pub fn on_alloc(&mut self, addr: u64, size: i64, stack_id: StackId) {
        if let Some(stale) = self.live.remove(&addr) {
            self.double_allocs += 1;
            self.retire(stale);
        }
        self.live.insert(addr, LiveEntry { stack_id, size });
        *self.per_stack_bytes.entry(stack_id).or_insert(0) += size;
        *self.per_stack_count.entry(stack_id).or_insert(0) += 1;
    }

    /// Records a free at `addr`. A free with no matching live allocation
    /// (freed before sampling started, or a sampling gap) is counted but
    /// otherwise a no-op — there's nothing to subtract.
    pub fn on_free(&mut self, addr: u64) {
        match self.live.remove(&addr) {
            Some(entry) => self.retire(entry),
            None => self.unmatched_frees += 1,
        }
    }

    fn retire(&mut self, entry: LiveEntry) {
        if let Some(bytes) = self.per_stack_bytes.get_mut(&entry.stack_id) {
            *bytes -= entry.size;
        }
        if let Some(count) = self.per_stack_count.get_mut(&entry.stack_id) {
            *count -= 1;
        }
    }

    /// Snapshots the current outstanding (bytes, count) totals per stack,
    /// suitable for writing straight into the aggregator's sample values
    /// for a "live" watcher at export time.
    pub fn snapshot(&self) -> Vec<(StackId, i64, i64)> {
        self.per_stack_bytes
            .iter()
            .filter(|(_, &bytes)| bytes != 0)
            .map(|(&stack_id, &bytes)| {
                let count = self.per_stack_count.get(&stack_id).copied().unwrap_or(0);
                (stack_id, bytes, count)
            })
            .collect()
    }

    pub fn live_address_count(&self) -> usize {
        self.live.len()
    }

    pub fn double_allocs(&self) -> u64 {
        self.double_allocs
    }

    pub fn unmatched_frees(&self) -> u64 {
        self.unmatched_frees
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_then_free_zeroes_out_the_stack() {
        let mut tracker = LiveAllocationTracker::new();
        tracker.on_alloc(0x1000, 64, 7);
        tracker.on_free(0x1000);
        assert!(tracker.snapshot().is_empty());
        assert_eq!(tracker.live_address_count(), 0);
    }

    #[test]
    fn multiple_allocations_on_one_stack_accumulate() {
        let mut tracker = LiveAllocationTracker::new();
        tracker.on_alloc(0x1000, 64, 7);
        tracker.on_alloc(0x2000, 128, 7);
        let snapshot = tracker.snapshot();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0], (7, 192, 2));
    }

    #[test]
    fn unmatched_free_is_counted_not_applied() {
        let mut tracker = LiveAllocationTracker::new();
        tracker.on_free(0xdead);
        assert_eq!(tracker.unmatched_frees(), 1);
        assert!(tracker.snapshot().is_empty());
    }

    #[test]
    fn reallocating_a_live_address_retires_the_stale_entry() {
        let mut tracker = LiveAllocationTracker::new();
        tracker.on_alloc(0x1000, 64, 1);
        tracker.on_alloc(0x1000, 32, 2);
        assert_eq!(tracker.double_allocs(), 1);
        let mut snapshot = tracker.snapshot();
        snapshot.sort_by_key(|(stack, _, _)| *stack);
        assert_eq!(snapshot, vec![(2, 32, 1)]);
    }
}
