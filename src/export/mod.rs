//! C10: the exporter (spec §4.10) — turns an [`Aggregator`] snapshot into
//! a pprof `Profile` and ships it to the configured endpoint.

pub mod endpoint;
pub mod pprof_proto;

use std::collections::HashMap;
use std::time::Duration;

use crate::aggregate::Aggregator;
use crate::perf::watcher::WatcherSet;
use pprof_proto::{Function, Line, Location, Profile, Sample, ValueType};

/// Interns strings into pprof's shared string table, whose entry 0 is
/// mandated by the format to be the empty string.
struct StringTable {
    table: Vec<String>,
    index: HashMap<String, i64>,
}

impl StringTable {
    fn new() -> Self {
        let table = vec![String::new()];
        let mut index = HashMap::new();
        index.insert(String::new(), 0);
        StringTable { table, index }
    }

    fn intern(&mut self, s: &str) -> i64 {
        if let Some(&id) = self.index.get(s) {
            return id;
        }
        let id = self.table.len() as i64;
        self.table.push(s.to_owned());
        self.index.insert(s.to_owned(), id);
        id
    }
}

/// Converts the aggregator's interned tables plus a wall-clock window
/// into a ready-to-serialize pprof `Profile`. `duration` is the span this
/// profile covers; `watchers` supplies the sample-type labels in the
/// order the aggregator's value vectors are indexed.
pub fn build_profile(aggregator: &Aggregator, watchers: &WatcherSet, time_nanos: i64, duration: Duration) -> Profile {
    let mut strings = StringTable::new();

    let sample_type = watchers
        .iter()
        .map(|w| ValueType {
            r#type: strings.intern(&w.output_sample_type),
            unit: strings.intern(value_unit(w)),
        })
        .collect::<Vec<_>>();

    let function = aggregator
        .functions()
        .iter()
        .enumerate()
        .map(|(id, f)| Function {
            id: id as u64 + 1,
            name: strings.intern(&f.name),
            system_name: strings.intern(&f.name),
            filename: f.file.as_deref().map(|s| strings.intern(s)).unwrap_or(0),
            start_line: 0,
        })
        .collect::<Vec<_>>();

    let location = aggregator
        .locations()
        .iter()
        .enumerate()
        .map(|(id, l)| Location {
            id: id as u64 + 1,
            mapping_id: 0,
            address: l.address,
            line: vec![Line {
                function_id: l.function_id + 1,
                line: l.line.unwrap_or(0) as i64,
            }],
            is_folded: false,
        })
        .collect::<Vec<_>>();

    let stacks = aggregator.stacks();
    let sample = aggregator
        .samples()
        .map(|(stack_id, value)| Sample {
            location_id: stacks[stack_id as usize]
                .iter()
                .rev()
                .map(|&loc| loc + 1)
                .collect(),
            value: value.values.clone(),
            label: vec![],
        })
        .collect::<Vec<_>>();

    Profile {
        sample_type,
        sample,
        mapping: vec![],
        location,
        function,
        string_table: strings.table,
        drop_frames: 0,
        keep_frames: 0,
        time_nanos,
        duration_nanos: duration.as_nanos() as i64,
        period_type: None,
        period: 0,
        comment: vec![],
        default_sample_type: 0,
    }
}

fn value_unit(watcher: &crate::perf::watcher::Watcher) -> &'static str {
    use crate::perf::watcher::EventClass;
    match watcher.event_class {
        EventClass::Software(c) if c == crate::perf::sys::PERF_COUNT_SW_CPU_CLOCK => "nanoseconds",
        EventClass::Software(c) if c == crate::perf::sys::PERF_COUNT_SW_TASK_CLOCK => "nanoseconds",
        EventClass::Custom => "bytes",
        _ => "count",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::perf::watcher::{AggregationMode, Cadence, EventClass, KernelInclude, ValueSource, Watcher, WatcherSet};
    use crate::symbols::ResolvedFrame;

    fn one_watcher_set() -> WatcherSet {
        WatcherSet::build(vec![Watcher {
            event_class: EventClass::Software(crate::perf::sys::PERF_COUNT_SW_CPU_CLOCK),
            cadence: Cadence::Frequency(99),
            stack_sample_size: 32768,
            value_source: ValueSource::SamplePeriod,
            aggregation_mode: AggregationMode::Sum,
            output_sample_type: "cpu-time".to_owned(),
            kernel_include: KernelInclude::Preferred,
            coefficient: 1.0,
            label: None,
        }])
        .unwrap()
    }

    #[test]
    fn builds_a_profile_with_one_sample() {
        let watchers = one_watcher_set();
        let mut agg = Aggregator::new(1);
        let loc = agg.intern_location(
            1,
            0x100,
            0x1100,
            &ResolvedFrame {
                function: "main".to_owned(),
                file: Some("main.rs".to_owned()),
                line: Some(10),
            },
        );
        let stack = agg.intern_stack(vec![loc]);
        agg.record(stack, 0, 5);

        let profile = build_profile(&agg, &watchers, 1_000, Duration::from_secs(1));
        assert_eq!(profile.sample.len(), 1);
        assert_eq!(profile.sample[0].value, vec![5]);
        assert_eq!(profile.function.len(), 1);
        assert_eq!(profile.string_table[0], "");
    }

    #[test]
    fn string_table_entry_zero_is_always_empty() {
        let mut strings = StringTable::new();
        assert_eq!(strings.intern("foo"), 1);
        assert_eq!(strings.intern("foo"), 1);
        assert_eq!(strings.table[0], "");
    }
}
