//! C7: aggregation (spec §4.7). Builds an intermediate profile
//! representation shaped like pprof's own table-of-strings / table-of-
//! locations model, so `export::pprof_proto` only has to do a
//! mechanical translation rather than any deduplication of its own.

pub mod live_alloc;

use std::collections::HashMap;

use crate::symbols::ResolvedFrame;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct FunctionKey {
    name: String,
    file: Option<String>,
}

#[derive(Debug, Clone)]
pub struct FunctionEntry {
    pub name: String,
    pub file: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct LocationKey {
    dso_stable_id: u64,
    file_relative_pc: u64,
}

#[derive(Debug, Clone)]
pub struct LocationEntry {
    pub function_id: u64,
    pub line: Option<u32>,
    pub address: u64,
}

/// A sampled stack: leaf-first sequence of location ids, interned so
/// repeated occurrences across samples cost one `u64` each.
pub type StackId = u64;

#[derive(Debug, Clone, Default)]
pub struct SampleValue {
    /// One value slot per configured watcher's output sample type,
    /// indexed the same way as the `WatcherSet` that produced samples.
    pub values: Vec<i64>,
}

/// The aggregated profile: deduplicated functions/locations/stacks, with
/// one accumulated value vector per distinct stack.
#[derive(Debug, Default)]
pub struct Aggregator {
    functions: HashMap<FunctionKey, u64>,
    function_list: Vec<FunctionEntry>,

    locations: HashMap<LocationKey, u64>,
    location_list: Vec<LocationEntry>,

    stacks: HashMap<Vec<u64>, StackId>,
    stack_list: Vec<Vec<u64>>,

    samples: HashMap<StackId, SampleValue>,
    sample_type_count: usize,

    /// Outstanding-allocation state for a "live heap" watcher, kept
    /// per-pid so one process's exit doesn't clobber another's totals
    /// (spec §4.7 "live heap watcher").
    live_allocs: HashMap<i32, live_alloc::LiveAllocationTracker>,
}

impl Aggregator {
    pub fn new(sample_type_count: usize) -> Self {
        Aggregator {
            sample_type_count,
            ..Default::default()
        }
    }

    fn intern_function(&mut self, frame: &ResolvedFrame) -> u64 {
        let key = FunctionKey {
            name: frame.function.clone(),
            file: frame.file.clone(),
        };
        if let Some(&id) = self.functions.get(&key) {
            return id;
        }
        let id = self.function_list.len() as u64;
        self.function_list.push(FunctionEntry {
            name: frame.function.clone(),
            file: frame.file.clone(),
        });
        self.functions.insert(key, id);
        id
    }

    /// Interns one resolved frame as a location, deduped by
    /// (dso-stable-id, file-relative-pc) per spec §4.6/§4.7.
    pub fn intern_location(
        &mut self,
        dso_stable_id: u64,
        file_relative_pc: u64,
        absolute_addr: u64,
        frame: &ResolvedFrame,
    ) -> u64 {
        let key = LocationKey {
            dso_stable_id,
            file_relative_pc,
        };
        if let Some(&id) = self.locations.get(&key) {
            return id;
        }
        let function_id = self.intern_function(frame);
        let id = self.location_list.len() as u64;
        self.location_list.push(LocationEntry {
            function_id,
            line: frame.line,
            address: absolute_addr,
        });
        self.locations.insert(key, id);
        id
    }

    /// Interns a full stack (leaf-first location ids) and returns its
    /// stack id, reusing an existing entry when the exact same sequence
    /// has been seen before.
    pub fn intern_stack(&mut self, location_ids: Vec<u64>) -> StackId {
        if let Some(&id) = self.stacks.get(&location_ids) {
            return id;
        }
        let id = self.stack_list.len() as u64;
        self.stacks.insert(location_ids.clone(), id);
        self.stack_list.push(location_ids);
        id
    }

    /// Adds `value` to slot `watcher_index` of the sample accumulated for
    /// `stack_id`, creating a zeroed accumulator on first touch.
    pub fn record(&mut self, stack_id: StackId, watcher_index: usize, value: i64) {
        let entry = self.samples.entry(stack_id).or_insert_with(|| SampleValue {
            values: vec![0; self.sample_type_count],
        });
        if watcher_index >= entry.values.len() {
            entry.values.resize(watcher_index + 1, 0);
        }
        entry.values[watcher_index] += value;
    }

    pub fn functions(&self) -> &[FunctionEntry] {
        &self.function_list
    }

    pub fn locations(&self) -> &[LocationEntry] {
        &self.location_list
    }

    pub fn stacks(&self) -> &[Vec<u64>] {
        &self.stack_list
    }

    pub fn samples(&self) -> impl Iterator<Item = (StackId, &SampleValue)> {
        self.samples.iter().map(|(&k, v)| (k, v))
    }

    pub fn sample_count(&self) -> usize {
        self.samples.len()
    }

    /// Resets all sample values while keeping the function/location/stack
    /// tables, used between export cycles so stack interning doesn't have
    /// to start cold every upload period (spec §4.7 "incremental tables").
    pub fn clear_samples(&mut self) {
        self.samples.clear();
    }

    /// The live-allocation tracker for one pid, created on first touch.
    pub fn live_alloc_mut(&mut self, pid: i32) -> &mut live_alloc::LiveAllocationTracker {
        self.live_allocs.entry(pid).or_default()
    }

    /// Drops a pid's outstanding-allocation state entirely, called when
    /// that pid exits so a process that never frees its last allocations
    /// doesn't leave them live forever in the aggregate.
    pub fn forget_pid_live_alloc(&mut self, pid: i32) {
        self.live_allocs.remove(&pid);
    }

    /// Writes every pid's current outstanding-bytes snapshot into
    /// `watcher_index`'s sample value, called once per export cycle for
    /// any watcher in `LiveSum`/`Both` mode. Unlike `record`, which
    /// accumulates a delta, this always reflects the current live total
    /// since `clear_samples` zeroes the slot each cycle.
    pub fn apply_live_snapshot(&mut self, watcher_index: usize) {
        let snapshots: Vec<(StackId, i64)> = self
            .live_allocs
            .values()
            .flat_map(|tracker| tracker.snapshot().into_iter().map(|(stack, bytes, _count)| (stack, bytes)))
            .collect();
        for (stack_id, bytes) in snapshots {
            self.record(stack_id, watcher_index, bytes);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(name: &str) -> ResolvedFrame {
        ResolvedFrame {
            function: name.to_owned(),
            file: None,
            line: None,
        }
    }

    #[test]
    fn repeated_location_is_deduplicated() {
        let mut agg = Aggregator::new(1);
        let a = agg.intern_location(1, 0x100, 0x1100, &frame("foo"));
        let b = agg.intern_location(1, 0x100, 0x1100, &frame("foo"));
        assert_eq!(a, b);
        assert_eq!(agg.locations().len(), 1);
        assert_eq!(agg.functions().len(), 1);
    }

    #[test]
    fn same_pc_in_different_dsos_is_distinct() {
        let mut agg = Aggregator::new(1);
        let a = agg.intern_location(1, 0x100, 0x1100, &frame("foo"));
        let b = agg.intern_location(2, 0x100, 0x2100, &frame("foo"));
        assert_ne!(a, b);
    }

    #[test]
    fn identical_stacks_share_one_entry() {
        let mut agg = Aggregator::new(1);
        let loc = agg.intern_location(1, 0x100, 0x1100, &frame("foo"));
        let s1 = agg.intern_stack(vec![loc]);
        let s2 = agg.intern_stack(vec![loc]);
        assert_eq!(s1, s2);
        assert_eq!(agg.stacks().len(), 1);
    }

    #[test]
    fn record_accumulates_per_watcher_slot() {
        let mut agg = Aggregator::new(2);
        let loc = agg.intern_location(1, 0x100, 0x1100, &frame("foo"));
        let stack = agg.intern_stack(vec![loc]);
        agg.record(stack, 0, 10);
        agg.record(stack, 0, 5);
        agg.record(stack, 1, 3);
        let (_, value) = agg.samples().find(|(id, _)| *id == stack).unwrap();
        assert_eq!(value.values, vec![15, 3]);
    }

    #[test]
    fn clear_samples_keeps_interned_tables() {
        let mut agg = Aggregator::new(1);
        let loc = agg.intern_location(1, 0x100, 0x1100, &frame("foo"));
        let stack = agg.intern_stack(vec![loc]);
        agg.record(stack, 0, 1);
        agg.clear_samples();
        assert_eq!(agg.sample_count(), 0);
        assert_eq!(agg.locations().len(), 1);
    }
}
