//! The `Watcher` descriptor (spec §3) — an immutable description of one
//! kind of event to sample, independent of which CPU or PID it ends up
//! being opened on. `EventSourceManager` (event_source.rs) turns a set of
//! these into actual `perf_event_open` file descriptors.

use std::fmt;

/// Which perf event class a watcher samples.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventClass {
    Hardware(u64),
    Software(u64),
    Tracepoint { group: &'static str, event: &'static str },
    /// Not backed by a kernel perf fd at all: driven by the custom
    /// memfd-backed ring buffer (e.g. allocation samples injected by an
    /// instrumented process).
    Custom,
}

/// Cadence is period xor frequency, never both (spec §3 invariant).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cadence {
    Period(u64),
    Frequency(u64),
}

/// Where a sample's numeric value comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueSource {
    /// Use the record's sample period field directly.
    SamplePeriod,
    /// Pull the value out of a saved user register.
    SavedRegister(u64),
    /// Pull the value out of the raw-event byte range at the given offset.
    RawBytes { offset: usize, len: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggregationMode {
    Sum,
    LiveSum,
    Both,
}

/// Whether this watcher's samples should include kernel-mode frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelInclude {
    Required,
    Preferred,
    Forbidden,
}

#[derive(Debug, Clone)]
pub struct Watcher {
    pub event_class: EventClass,
    pub cadence: Cadence,
    pub stack_sample_size: u32,
    pub value_source: ValueSource,
    pub aggregation_mode: AggregationMode,
    pub output_sample_type: String,
    pub kernel_include: KernelInclude,
    /// Multiplies the raw sampled value (e.g. bytes-per-sampled-allocation
    /// coefficients for probabilistic allocation sampling).
    pub coefficient: f64,
    pub label: Option<String>,
}

impl Watcher {
    pub fn is_custom(&self) -> bool {
        matches!(self.event_class, EventClass::Custom)
    }

    pub fn is_tracepoint(&self) -> bool {
        matches!(self.event_class, EventClass::Tracepoint { .. })
    }

    /// The default perf-mandated set of sample fields (spec §6):
    /// `TID|TIME|ID|PERIOD|REGS_USER|STACK_USER`, plus watcher-specific
    /// additions (`RAW` for tracepoints, `CALLCHAIN` for custom events).
    /// `ID` lets the worker recover which watcher produced a record when
    /// several share one CPU's ring buffer via `PERF_EVENT_IOC_SET_OUTPUT`.
    pub fn sample_type_mask(&self) -> u64 {
        use super::sys::*;
        let mut mask = PERF_SAMPLE_TID
            | PERF_SAMPLE_TIME
            | PERF_SAMPLE_ID
            | PERF_SAMPLE_PERIOD
            | PERF_SAMPLE_REGS_USER
            | PERF_SAMPLE_STACK_USER;
        if self.is_tracepoint() {
            mask |= PERF_SAMPLE_RAW;
        }
        if self.is_custom() {
            mask |= PERF_SAMPLE_CALLCHAIN;
        }
        mask
    }
}

impl fmt::Display for Watcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({:?})", self.output_sample_type, self.event_class)
    }
}

/// A fully validated, ordered set of watchers (spec §4.13): perf-active
/// watchers are stably partitioned ahead of custom ones, so metadata
/// records (mmap/comm/fork/exit) are always processed before the
/// samples that depend on them.
#[derive(Debug, Clone, Default)]
pub struct WatcherSet {
    watchers: Vec<Watcher>,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum WatcherSetError {
    #[error("duplicate watcher for non-tracepoint event class {0:?}")]
    DuplicateEventClass(String),
    #[error("too many watchers: {0} exceeds the maximum of {1}")]
    TooManyWatchers(usize, usize),
}

const MAX_WATCHERS: usize = 10;

impl WatcherSet {
    pub fn build(mut watchers: Vec<Watcher>) -> Result<Self, WatcherSetError> {
        if watchers.len() > MAX_WATCHERS {
            return Err(WatcherSetError::TooManyWatchers(watchers.len(), MAX_WATCHERS));
        }

        // Invariant: at most one watcher per non-tracepoint event class.
        let mut seen = std::collections::HashSet::new();
        for w in &watchers {
            if w.is_tracepoint() {
                continue;
            }
            if !seen.insert(format!("{:?}", w.event_class)) {
                return Err(WatcherSetError::DuplicateEventClass(format!(
                    "{:?}",
                    w.event_class
                )));
            }
        }

        // If no perf-active watcher is present, append a dummy perf
        // watcher so the worker loop can still be notified of process
        // lifecycle events (mmap/comm/fork/exit) even when the only
        // configured watchers are custom ones.
        let has_perf_active = watchers.iter().any(|w| !w.is_custom());
        if !has_perf_active {
            watchers.push(dummy_watcher());
        }

        // Stable partition: perf-active first, custom last.
        watchers.sort_by_key(|w| w.is_custom());

        Ok(WatcherSet { watchers })
    }

    pub fn iter(&self) -> impl Iterator<Item = &Watcher> {
        self.watchers.iter()
    }

    pub fn len(&self) -> usize {
        self.watchers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.watchers.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Watcher> {
        self.watchers.get(index)
    }
}

pub fn dummy_watcher() -> Watcher {
    Watcher {
        event_class: EventClass::Software(super::sys::PERF_COUNT_SW_DUMMY),
        cadence: Cadence::Frequency(1),
        stack_sample_size: 0,
        value_source: ValueSource::SamplePeriod,
        aggregation_mode: AggregationMode::Sum,
        output_sample_type: "dummy".to_owned(),
        kernel_include: KernelInclude::Forbidden,
        coefficient: 1.0,
        label: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cpu_watcher() -> Watcher {
        Watcher {
            event_class: EventClass::Software(super::super::sys::PERF_COUNT_SW_CPU_CLOCK),
            cadence: Cadence::Frequency(99),
            stack_sample_size: 32768,
            value_source: ValueSource::SamplePeriod,
            aggregation_mode: AggregationMode::Sum,
            output_sample_type: "cpu-time".to_owned(),
            kernel_include: KernelInclude::Preferred,
            coefficient: 1.0,
            label: None,
        }
    }

    #[test]
    fn zero_watchers_gets_a_dummy() {
        let set = WatcherSet::build(vec![]).unwrap();
        assert_eq!(set.len(), 1);
        assert!(!set.get(0).unwrap().is_custom());
    }

    #[test]
    fn duplicate_non_tracepoint_watcher_rejected() {
        let err = WatcherSet::build(vec![cpu_watcher(), cpu_watcher()]).unwrap_err();
        assert!(matches!(err, WatcherSetError::DuplicateEventClass(_)));
    }

    #[test]
    fn too_many_watchers_rejected() {
        let watchers: Vec<_> = (0..11)
            .map(|i| Watcher {
                event_class: EventClass::Tracepoint {
                    group: "sched",
                    event: "dummy",
                },
                label: Some(i.to_string()),
                ..cpu_watcher()
            })
            .collect();
        assert_eq!(
            WatcherSet::build(watchers).unwrap_err(),
            WatcherSetError::TooManyWatchers(11, MAX_WATCHERS)
        );
    }

    #[test]
    fn perf_active_precedes_custom() {
        let custom = Watcher {
            event_class: EventClass::Custom,
            output_sample_type: "alloc-samples".to_owned(),
            ..cpu_watcher()
        };
        let set = WatcherSet::build(vec![custom, cpu_watcher()]).unwrap();
        assert!(!set.get(0).unwrap().is_custom());
        assert!(set.get(1).unwrap().is_custom());
    }

    #[test]
    fn sample_type_mask_includes_mandated_fields() {
        let w = cpu_watcher();
        let mask = w.sample_type_mask();
        use super::super::sys::*;
        assert_ne!(mask & PERF_SAMPLE_TID, 0);
        assert_ne!(mask & PERF_SAMPLE_TIME, 0);
        assert_ne!(mask & PERF_SAMPLE_PERIOD, 0);
        assert_ne!(mask & PERF_SAMPLE_REGS_USER, 0);
        assert_ne!(mask & PERF_SAMPLE_STACK_USER, 0);
        assert_eq!(mask & PERF_SAMPLE_RAW, 0);
    }
}
