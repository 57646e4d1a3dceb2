//! Process and DSO bookkeeping driven by perf metadata records
//! (`MMAP2`/`COMM`/`FORK`/`EXIT`), spec §4.4.

pub mod dso;
pub mod region;

pub use dso::{Dso, DsoTable};
pub use region::Region;

use std::collections::HashMap;

/// Tracks the current thread name per (pid, tid), updated on
/// `PERF_RECORD_COMM`. Exec'd processes reset to the new comm; forked
/// threads inherit the parent's until their own `COMM` arrives.
#[derive(Default)]
pub struct CommTable {
    names: HashMap<(i32, i32), String>,
}

impl CommTable {
    pub fn new() -> Self {
        CommTable::default()
    }

    pub fn set(&mut self, pid: i32, tid: i32, name: String) {
        self.names.insert((pid, tid), name);
    }

    pub fn get(&self, pid: i32, tid: i32) -> Option<&str> {
        self.names.get(&(pid, tid)).map(|s| s.as_str())
    }

    pub fn fork(&mut self, ppid: i32, ptid: i32, pid: i32, tid: i32) {
        if let Some(name) = self.names.get(&(ppid, ptid)).cloned() {
            self.names.insert((pid, tid), name);
        }
    }

    pub fn forget_process(&mut self, pid: i32) {
        self.names.retain(|&(p, _), _| p != pid);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fork_inherits_parent_comm() {
        let mut table = CommTable::new();
        table.set(1, 1, "worker".to_owned());
        table.fork(1, 1, 2, 2);
        assert_eq!(table.get(2, 2), Some("worker"));
    }

    #[test]
    fn forget_process_clears_all_its_threads() {
        let mut table = CommTable::new();
        table.set(1, 1, "worker".to_owned());
        table.set(1, 2, "worker".to_owned());
        table.forget_process(1);
        assert_eq!(table.get(1, 1), None);
        assert_eq!(table.get(1, 2), None);
    }
}
