//! C4: per-process DSO (dynamic shared object) tracking (spec §4.4).
//!
//! One ordered range map per pid keyed by virtual address, rebuilt
//! incrementally from `MMAP2`/`FORK`/`EXIT` records and back-populated
//! from `/proc/<pid>/maps` the first time a pid is seen without a prior
//! `MMAP2` for the address being resolved (the profiler can attach to a
//! process whose image was already fully mapped before tracing started).

use std::collections::HashMap;

use rangemap::RangeMap;

use super::region::{is_special_region, read_proc_maps, Region};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dso {
    pub path: String,
    pub start: u64,
    pub end: u64,
    pub file_offset: u64,
    pub executable: bool,
    /// Identifies a DSO across address-space changes (exec, later remap)
    /// so the symbol table cache doesn't have to re-key on raw addresses.
    /// Derived from path + mapped length; good enough to dedup repeated
    /// mappings of the same file without reading an ELF build-id.
    pub stable_id: u64,
}

impl Dso {
    fn from_region(region: &Region) -> Option<Self> {
        let path = region.path.clone()?;
        if is_special_region(&path) {
            return None;
        }
        let stable_id = stable_id_for(&path, region.len());
        Some(Dso {
            start: region.start,
            end: region.end,
            file_offset: region.file_offset,
            executable: region.executable,
            stable_id,
            path,
        })
    }
}

fn stable_id_for(path: &str, len: u64) -> u64 {
    use std::hash::{Hash, Hasher};
    let mut hasher = rustc_hash::FxHasher::default();
    path.hash(&mut hasher);
    len.hash(&mut hasher);
    hasher.finish()
}

#[derive(Default)]
pub struct DsoTable {
    per_pid: HashMap<i32, RangeMap<u64, Dso>>,
}

impl DsoTable {
    pub fn new() -> Self {
        DsoTable::default()
    }

    /// Inserts a DSO observed via a live `MMAP2` record, evicting any
    /// ranges it overlaps (the kernel reuses address ranges across
    /// `munmap`/`mmap` without ever telling us about the unmap).
    pub fn insert_erase_overlap(&mut self, pid: i32, region: &Region) {
        let table = self.per_pid.entry(pid).or_default();
        table.remove(region.start..region.end);
        if let Some(dso) = Dso::from_region(region) {
            table.insert(dso.start..dso.end, dso);
        }
    }

    /// Looks up the DSO covering `addr` in `pid`'s address space. If the
    /// pid hasn't been seen yet, lazily back-populates its whole map from
    /// `/proc/<pid>/maps` (best-effort: the process may have already
    /// exited, in which case this returns `None` and the caller attributes
    /// the frame to "unknown").
    pub fn find_or_backpopulate(&mut self, pid: i32, addr: u64) -> Option<&Dso> {
        if !self.per_pid.contains_key(&pid) {
            self.backpopulate(pid);
        }
        self.per_pid.get(&pid).and_then(|t| t.get(&addr))
    }

    fn backpopulate(&mut self, pid: i32) {
        let regions = read_proc_maps(pid).unwrap_or_default();
        let table = self.per_pid.entry(pid).or_default();
        for region in &regions {
            if let Some(dso) = Dso::from_region(region) {
                table.insert(dso.start..dso.end, dso);
            }
        }
    }

    /// Drops all tracked mappings for `pid` (on `PERF_RECORD_EXIT`).
    pub fn forget(&mut self, pid: i32) {
        self.per_pid.remove(&pid);
    }

    /// Copies the parent's map into a freshly forked child (on
    /// `PERF_RECORD_FORK` with `pid != ppid`, i.e. not a new thread in the
    /// same process). Threads share an address space and are the same
    /// `pid` in perf's reporting, so only true process forks need this.
    pub fn fork(&mut self, ppid: i32, child_pid: i32) {
        if let Some(parent) = self.per_pid.get(&ppid).cloned() {
            self.per_pid.insert(child_pid, parent);
        }
    }

    pub fn len(&self, pid: i32) -> usize {
        self.per_pid.get(&pid).map(|t| t.iter().count()).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn region(start: u64, end: u64, path: &str) -> Region {
        Region {
            start,
            end,
            file_offset: 0,
            executable: true,
            path: Some(path.to_owned()),
        }
    }

    #[test]
    fn insert_and_lookup() {
        let mut table = DsoTable::new();
        table.insert_erase_overlap(1, &region(0x1000, 0x2000, "/bin/a"));
        let dso = table.find_or_backpopulate(1, 0x1500).unwrap();
        assert_eq!(dso.path, "/bin/a");
    }

    #[test]
    fn overlapping_insert_evicts_stale_mapping() {
        let mut table = DsoTable::new();
        table.insert_erase_overlap(1, &region(0x1000, 0x3000, "/bin/old"));
        table.insert_erase_overlap(1, &region(0x1000, 0x2000, "/bin/new"));
        assert_eq!(
            table.find_or_backpopulate(1, 0x1500).unwrap().path,
            "/bin/new"
        );
        // The tail of the old mapping beyond the new one's end is gone too.
        assert!(table.find_or_backpopulate(1, 0x2500).is_none());
    }

    #[test]
    fn special_regions_are_not_tracked_as_dsos() {
        let mut table = DsoTable::new();
        table.insert_erase_overlap(1, &region(0x1000, 0x2000, "[vdso]"));
        assert!(table.find_or_backpopulate(1, 0x1500).is_none());
    }

    #[test]
    fn fork_copies_parent_map() {
        let mut table = DsoTable::new();
        table.insert_erase_overlap(1, &region(0x1000, 0x2000, "/bin/a"));
        table.fork(1, 2);
        assert_eq!(
            table.find_or_backpopulate(2, 0x1500).unwrap().path,
            "/bin/a"
        );
    }

    #[test]
    fn forget_drops_pid_entirely() {
        let mut table = DsoTable::new();
        table.insert_erase_overlap(1, &region(0x1000, 0x2000, "/bin/a"));
        table.forget(1);
        assert_eq!(table.len(1), 0);
    }

    #[test]
    fn stable_id_distinguishes_different_paths() {
        let a = Dso::from_region(&region(0, 0x1000, "/bin/a")).unwrap();
        let b = Dso::from_region(&region(0, 0x1000, "/bin/b")).unwrap();
        assert_ne!(a.stable_id, b.stable_id);
    }
}
