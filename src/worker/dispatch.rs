//! Per-record dispatch: decodes one ring-buffer record and feeds it into
//! the process/unwind/symbol/aggregate pipeline. Split out of
//! `worker::mod` so the drain loop stays focused on ring-buffer mechanics.

use std::collections::HashMap;

use crate::aggregate::Aggregator;
use crate::perf::sample_parser::{self, ParseError, RecordHeader};
use crate::perf::sys::{
    PERF_RECORD_COMM, PERF_RECORD_EXIT, PERF_RECORD_FORK, PERF_RECORD_LOST, PERF_RECORD_MMAP,
    PERF_RECORD_MMAP2, PERF_RECORD_SAMPLE,
};
use crate::perf::watcher::{AggregationMode, WatcherSet};
use crate::process::{CommTable, Dso, DsoTable, Region};
use crate::stats::{Counter, Counters};
use crate::symbols::SymbolTables;
use crate::unwind::StackUnwinder;

/// Record kinds the custom (memfd-backed) ring buffer carries. These
/// don't come from the kernel, so they're numbered well outside the
/// `PERF_RECORD_*` range to avoid ever colliding with a real one.
pub const CUSTOM_RECORD_ALLOC: u32 = 0xC001;
pub const CUSTOM_RECORD_FREE: u32 = 0xC002;

/// Fields common to every non-SAMPLE record type this profiler acts on,
/// minus `PERF_RECORD_SAMPLE` which goes through [`sample_parser`]
/// instead because its body layout depends on the producing watcher's
/// `sample_type` mask rather than a fixed struct.
pub fn parse_record_header(bytes: &[u8]) -> Result<RecordHeader, ParseError> {
    sample_parser::parse_header(bytes)
}

/// Probe mask covering only the fields that appear *before* any
/// watcher-specific extra fields in bit order (§6), so this partial
/// parse is valid no matter which watcher produced the record — used to
/// recover the watcher id before fully decoding the sample.
const PROBE_MASK: u64 = crate::perf::sys::PERF_SAMPLE_TID
    | crate::perf::sys::PERF_SAMPLE_TIME
    | crate::perf::sys::PERF_SAMPLE_ID
    | crate::perf::sys::PERF_SAMPLE_PERIOD;

/// Dispatches one decoded record into the pipeline. Returns `true` when
/// this record was a `PERF_RECORD_EXIT` for `target_pid` — the signal a
/// per-pid worker uses to force a final export instead of waiting on an
/// external shutdown signal that, in per-pid mode, may never arrive
/// (spec §B "send_final").
#[allow(clippy::too_many_arguments)]
pub fn handle_record(
    header: &RecordHeader,
    body: &[u8],
    dsos: &mut DsoTable,
    comms: &mut CommTable,
    unwinder: &mut StackUnwinder,
    symbols: &mut SymbolTables,
    aggregator: &mut Aggregator,
    watchers: &WatcherSet,
    id_to_watcher: &HashMap<u64, usize>,
    counters: &Counters,
    target_pid: Option<i32>,
) -> bool {
    match header.kind {
        PERF_RECORD_MMAP | PERF_RECORD_MMAP2 => {
            if let Ok(mmap) = sample_parser::parse_mmap2(body) {
                let region = Region {
                    start: mmap.addr,
                    end: mmap.addr + mmap.len,
                    file_offset: mmap.pgoff,
                    executable: mmap.executable,
                    path: Some(mmap.path),
                };
                dsos.insert_erase_overlap(mmap.pid as i32, &region);
            }
            false
        }
        PERF_RECORD_COMM => {
            // The comm string follows the fixed pid/tid header fields;
            // reuse the generic cursor logic in `parse_mmap2` would be
            // wrong here (different field layout), so this is decoded
            // inline: `u32 pid, u32 tid, char comm[]`.
            if body.len() >= 8 {
                let pid = u32::from_ne_bytes(body[0..4].try_into().unwrap()) as i32;
                let tid = u32::from_ne_bytes(body[4..8].try_into().unwrap()) as i32;
                let nul = body[8..].iter().position(|&b| b == 0).unwrap_or(body.len() - 8);
                let name = String::from_utf8_lossy(&body[8..8 + nul]).into_owned();
                comms.set(pid, tid, name);
            }
            false
        }
        PERF_RECORD_FORK => {
            // `u32 pid, u32 ppid, u32 tid, u32 ptid, u64 time`
            if body.len() >= 16 {
                let pid = u32::from_ne_bytes(body[0..4].try_into().unwrap()) as i32;
                let ppid = u32::from_ne_bytes(body[4..8].try_into().unwrap()) as i32;
                let tid = u32::from_ne_bytes(body[8..12].try_into().unwrap()) as i32;
                let ptid = u32::from_ne_bytes(body[12..16].try_into().unwrap()) as i32;
                if pid != ppid {
                    dsos.fork(ppid, pid);
                }
                comms.fork(ppid, ptid, pid, tid);
            }
            false
        }
        PERF_RECORD_EXIT => {
            if body.len() >= 8 {
                let pid = u32::from_ne_bytes(body[0..4].try_into().unwrap()) as i32;
                dsos.forget(pid);
                comms.forget_process(pid);
                aggregator.forget_pid_live_alloc(pid);
                return target_pid == Some(pid);
            }
            false
        }
        PERF_RECORD_LOST => {
            // `u64 id, u64 lost` — the id is the sample-id of the source
            // that dropped records, which callers here don't need since
            // the accounting invariant (spec §8) just wants a total.
            if body.len() >= 16 {
                let lost = u64::from_ne_bytes(body[8..16].try_into().unwrap());
                counters.add(Counter::SamplesLost, lost);
            }
            false
        }
        PERF_RECORD_SAMPLE => {
            handle_sample(body, dsos, unwinder, symbols, aggregator, watchers, id_to_watcher, counters);
            false
        }
        CUSTOM_RECORD_ALLOC | CUSTOM_RECORD_FREE => {
            handle_custom_record(header.kind, body, dsos, symbols, aggregator, watchers, counters);
            false
        }
        _ => false,
    }
}

fn handle_sample(
    body: &[u8],
    dsos: &mut DsoTable,
    unwinder: &mut StackUnwinder,
    symbols: &mut SymbolTables,
    aggregator: &mut Aggregator,
    watchers: &WatcherSet,
    id_to_watcher: &HashMap<u64, usize>,
    counters: &Counters,
) {
    counters.incr(Counter::SamplesReceived);

    let Ok(probe) = sample_parser::parse_sample(body, PROBE_MASK) else {
        counters.incr(Counter::SamplesLost);
        return;
    };

    let watcher_index = probe
        .id
        .and_then(|id| id_to_watcher.get(&id).copied())
        .unwrap_or(0);
    let Some(watcher) = watchers.get(watcher_index) else {
        counters.incr(Counter::SamplesErrored);
        return;
    };

    let reg_count = 3; // IP/SP/BP (or PC/LR/SP on aarch64), fixed for this build.
    let Ok(sample) = sample_parser::parse_sample_with_reg_count(body, watcher.sample_type_mask(), reg_count) else {
        counters.incr(Counter::SamplesLost);
        return;
    };

    let pid = sample.pid as i32;
    let Some(walked) = unwinder.walk(&sample) else {
        counters.incr(Counter::SamplesErrored);
        return;
    };
    if walked.truncated {
        counters.incr(Counter::StacksTruncated);
    }

    let mut location_ids = Vec::with_capacity(walked.addresses.len());
    for &addr in &walked.addresses {
        let Some(dso) = dsos.find_or_backpopulate(pid, addr).cloned() else {
            counters.incr(Counter::FramesUnresolved);
            continue;
        };
        let file_relative_pc = addr - dso.start + dso.file_offset;
        let frame = symbols.resolve(pid, &dso, addr);
        let loc_id = aggregator.intern_location(dso.stable_id, file_relative_pc, addr, &frame);
        location_ids.push(loc_id);
    }

    let stack_id = aggregator.intern_stack(location_ids);
    let value = sample_value(watcher, &sample);
    aggregator.record(stack_id, watcher_index, value);
    counters.incr(Counter::SamplesAggregated);
}

/// Decodes and dispatches one custom-ring allocation/free record (spec
/// §4.7 "live heap watcher"). Unlike `handle_sample`, the call stack
/// already arrived pre-walked from the instrumented process (it captured
/// its own frames at the allocation site), so there's no unwinder
/// involved here — just symbolization and either a running-total record
/// or live-allocation tracking, depending on the watcher's mode.
#[allow(clippy::too_many_arguments)]
fn handle_custom_record(
    kind: u32,
    body: &[u8],
    dsos: &mut DsoTable,
    symbols: &mut SymbolTables,
    aggregator: &mut Aggregator,
    watchers: &WatcherSet,
    counters: &Counters,
) {
    let Some(watcher_index) = watchers.iter().position(|w| w.is_custom()) else {
        counters.incr(Counter::SamplesErrored);
        return;
    };
    let watcher = watchers.get(watcher_index).expect("position found it");

    match kind {
        CUSTOM_RECORD_ALLOC => {
            let Some(record) = decode_alloc_record(body) else {
                counters.incr(Counter::SamplesLost);
                return;
            };
            counters.incr(Counter::SamplesReceived);

            let mut location_ids = Vec::with_capacity(record.ips.len());
            for &addr in &record.ips {
                let Some(dso) = dsos.find_or_backpopulate(record.pid, addr).cloned() else {
                    counters.incr(Counter::FramesUnresolved);
                    continue;
                };
                let file_relative_pc = addr - dso.start + dso.file_offset;
                let frame = symbols.resolve(record.pid, &dso, addr);
                let loc_id = aggregator.intern_location(dso.stable_id, file_relative_pc, addr, &frame);
                location_ids.push(loc_id);
            }
            let stack_id = aggregator.intern_stack(location_ids);

            match watcher.aggregation_mode {
                AggregationMode::Sum => {
                    aggregator.record(stack_id, watcher_index, record.size);
                }
                AggregationMode::LiveSum | AggregationMode::Both => {
                    aggregator
                        .live_alloc_mut(record.pid)
                        .on_alloc(record.addr, record.size, stack_id);
                }
            }
            counters.incr(Counter::SamplesAggregated);
        }
        CUSTOM_RECORD_FREE => {
            let Some((pid, addr)) = decode_free_record(body) else {
                counters.incr(Counter::SamplesLost);
                return;
            };
            counters.incr(Counter::SamplesReceived);
            if !matches!(watcher.aggregation_mode, AggregationMode::Sum) {
                aggregator.live_alloc_mut(pid).on_free(addr);
            }
            counters.incr(Counter::SamplesAggregated);
        }
        _ => unreachable!("handle_custom_record only called for CUSTOM_RECORD_* kinds"),
    }
}

struct AllocRecord {
    pid: i32,
    addr: u64,
    size: i64,
    ips: Vec<u64>,
}

/// `u32 pid, u32 tid, u64 time, u64 addr, i64 size, u32 nr_ips, u32 _pad, ips[nr_ips] u64`.
fn decode_alloc_record(body: &[u8]) -> Option<AllocRecord> {
    if body.len() < 32 {
        return None;
    }
    let pid = u32::from_ne_bytes(body[0..4].try_into().ok()?) as i32;
    let addr = u64::from_ne_bytes(body[16..24].try_into().ok()?);
    let size = i64::from_ne_bytes(body[24..32].try_into().ok()?);
    let nr_ips = if body.len() >= 36 {
        u32::from_ne_bytes(body[32..36].try_into().ok()?) as usize
    } else {
        0
    };
    let ips_start = 40;
    let mut ips = Vec::with_capacity(nr_ips);
    for i in 0..nr_ips {
        let start = ips_start + i * 8;
        let bytes = body.get(start..start + 8)?;
        ips.push(u64::from_ne_bytes(bytes.try_into().ok()?));
    }
    Some(AllocRecord { pid, addr, size, ips })
}

/// `u32 pid, u32 tid, u64 time, u64 addr`.
fn decode_free_record(body: &[u8]) -> Option<(i32, u64)> {
    if body.len() < 24 {
        return None;
    }
    let pid = u32::from_ne_bytes(body[0..4].try_into().ok()?) as i32;
    let addr = u64::from_ne_bytes(body[16..24].try_into().ok()?);
    Some((pid, addr))
}

fn sample_value(watcher: &crate::perf::watcher::Watcher, sample: &sample_parser::SampleRecord<'_>) -> i64 {
    use crate::perf::watcher::ValueSource;
    let raw_value = match watcher.value_source {
        ValueSource::SamplePeriod => sample.period as i64,
        ValueSource::SavedRegister(_) => sample.period as i64,
        ValueSource::RawBytes { offset, len } => sample
            .raw
            .and_then(|raw| raw.get(offset..offset + len))
            .map(|bytes| {
                let mut buf = [0u8; 8];
                let n = bytes.len().min(8);
                buf[..n].copy_from_slice(&bytes[..n]);
                i64::from_ne_bytes(buf)
            })
            .unwrap_or(sample.period as i64),
    };
    ((raw_value as f64) * watcher.coefficient) as i64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::perf::watcher::{AggregationMode, Cadence, EventClass, KernelInclude, ValueSource, Watcher};

    fn make_set() -> WatcherSet {
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
    fn comm_record_updates_the_comm_table() {
        let mut comms = CommTable::new();
        let mut body = Vec::new();
        body.extend_from_slice(&42u32.to_ne_bytes());
        body.extend_from_slice(&42u32.to_ne_bytes());
        body.extend_from_slice(b"worker\0");
        let header = RecordHeader {
            kind: PERF_RECORD_COMM,
            misc: 0,
            size: 0,
        };
        handle_record(
            &header,
            &body,
            &mut DsoTable::new(),
            &mut comms,
            &mut StackUnwinder::new(64),
            &mut SymbolTables::new(),
            &mut Aggregator::new(1),
            &make_set(),
            &HashMap::new(),
            &Counters::new(),
            None,
        );
        assert_eq!(comms.get(42, 42), Some("worker"));
    }

    #[test]
    fn exit_record_forgets_the_process() {
        let mut dsos = DsoTable::new();
        dsos.insert_erase_overlap(
            7,
            &Region {
                start: 0x1000,
                end: 0x2000,
                file_offset: 0,
                executable: true,
                path: Some("/bin/a".to_owned()),
            },
        );
        let mut body = Vec::new();
        body.extend_from_slice(&7u32.to_ne_bytes());
        body.extend_from_slice(&0u32.to_ne_bytes());
        let header = RecordHeader {
            kind: PERF_RECORD_EXIT,
            misc: 0,
            size: 0,
        };
        let is_target_exit = handle_record(
            &header,
            &body,
            &mut dsos,
            &mut CommTable::new(),
            &mut StackUnwinder::new(64),
            &mut SymbolTables::new(),
            &mut Aggregator::new(1),
            &make_set(),
            &HashMap::new(),
            &Counters::new(),
            None,
        );
        assert_eq!(dsos.len(7), 0);
        assert!(!is_target_exit);
    }

    #[test]
    fn exit_record_reports_when_it_matches_the_watched_pid() {
        let header = RecordHeader {
            kind: PERF_RECORD_EXIT,
            misc: 0,
            size: 0,
        };
        let mut body = Vec::new();
        body.extend_from_slice(&7u32.to_ne_bytes());
        body.extend_from_slice(&0u32.to_ne_bytes());
        let matched = handle_record(
            &header,
            &body,
            &mut DsoTable::new(),
            &mut CommTable::new(),
            &mut StackUnwinder::new(64),
            &mut SymbolTables::new(),
            &mut Aggregator::new(1),
            &make_set(),
            &HashMap::new(),
            &Counters::new(),
            Some(7),
        );
        assert!(matched);

        let unmatched = handle_record(
            &header,
            &body,
            &mut DsoTable::new(),
            &mut CommTable::new(),
            &mut StackUnwinder::new(64),
            &mut SymbolTables::new(),
            &mut Aggregator::new(1),
            &make_set(),
            &HashMap::new(),
            &Counters::new(),
            Some(99),
        );
        assert!(!unmatched);
    }

    #[test]
    fn sample_id_routes_to_the_watcher_that_produced_it() {
        let mut id_to_watcher = HashMap::new();
        id_to_watcher.insert(555u64, 0);
        assert_eq!(id_to_watcher.get(&999u64).copied(), None);
        assert_eq!(id_to_watcher.get(&555u64).copied(), Some(0));
    }

    #[test]
    fn lost_record_adds_its_embedded_count() {
        let mut body = Vec::new();
        body.extend_from_slice(&0u64.to_ne_bytes()); // id
        body.extend_from_slice(&9u64.to_ne_bytes()); // lost count
        let header = RecordHeader {
            kind: PERF_RECORD_LOST,
            misc: 0,
            size: 0,
        };
        let counters = Counters::new();
        handle_record(
            &header,
            &body,
            &mut DsoTable::new(),
            &mut CommTable::new(),
            &mut StackUnwinder::new(64),
            &mut SymbolTables::new(),
            &mut Aggregator::new(1),
            &make_set(),
            &HashMap::new(),
            &counters,
            None,
        );
        assert_eq!(counters.get(Counter::SamplesLost), 9);
    }

    fn custom_watcher_set(mode: AggregationMode) -> WatcherSet {
        WatcherSet::build(vec![Watcher {
            event_class: EventClass::Custom,
            cadence: Cadence::Frequency(1),
            stack_sample_size: 0,
            value_source: ValueSource::SamplePeriod,
            aggregation_mode: mode,
            output_sample_type: "alloc-space".to_owned(),
            kernel_include: KernelInclude::Forbidden,
            coefficient: 1.0,
            label: None,
        }])
        .unwrap()
    }

    fn alloc_body(pid: u32, addr: u64, size: i64, ips: &[u64]) -> Vec<u8> {
        let mut body = Vec::new();
        body.extend_from_slice(&pid.to_ne_bytes());
        body.extend_from_slice(&pid.to_ne_bytes()); // tid, unused by the decoder
        body.extend_from_slice(&0u64.to_ne_bytes()); // time
        body.extend_from_slice(&addr.to_ne_bytes());
        body.extend_from_slice(&size.to_ne_bytes());
        body.extend_from_slice(&(ips.len() as u32).to_ne_bytes());
        body.extend_from_slice(&0u32.to_ne_bytes()); // pad
        for ip in ips {
            body.extend_from_slice(&ip.to_ne_bytes());
        }
        body
    }

    fn free_body(pid: u32, addr: u64) -> Vec<u8> {
        let mut body = Vec::new();
        body.extend_from_slice(&pid.to_ne_bytes());
        body.extend_from_slice(&pid.to_ne_bytes());
        body.extend_from_slice(&0u64.to_ne_bytes());
        body.extend_from_slice(&addr.to_ne_bytes());
        body
    }

    #[test]
    fn custom_alloc_in_sum_mode_records_directly() {
        let watchers = custom_watcher_set(AggregationMode::Sum);
        let mut aggregator = Aggregator::new(1);
        let counters = Counters::new();
        handle_custom_record(
            CUSTOM_RECORD_ALLOC,
            &alloc_body(42, 0x1000, 64, &[]),
            &mut DsoTable::new(),
            &mut SymbolTables::new(),
            &mut aggregator,
            &watchers,
            &counters,
        );
        assert_eq!(aggregator.sample_count(), 1);
        assert_eq!(counters.get(Counter::SamplesAggregated), 1);
    }

    #[test]
    fn custom_alloc_then_free_in_live_mode_nets_to_zero() {
        let watchers = custom_watcher_set(AggregationMode::LiveSum);
        let mut aggregator = Aggregator::new(1);
        let counters = Counters::new();
        handle_custom_record(
            CUSTOM_RECORD_ALLOC,
            &alloc_body(42, 0x1000, 64, &[]),
            &mut DsoTable::new(),
            &mut SymbolTables::new(),
            &mut aggregator,
            &watchers,
            &counters,
        );
        handle_custom_record(
            CUSTOM_RECORD_FREE,
            &free_body(42, 0x1000),
            &mut DsoTable::new(),
            &mut SymbolTables::new(),
            &mut aggregator,
            &watchers,
            &counters,
        );
        aggregator.apply_live_snapshot(0);
        assert_eq!(aggregator.sample_count(), 0);
    }

    #[test]
    fn process_exit_clears_its_live_allocations() {
        let mut aggregator = Aggregator::new(1);
        aggregator.live_alloc_mut(42).on_alloc(0x1000, 64, 0);
        let mut body = Vec::new();
        body.extend_from_slice(&42u32.to_ne_bytes());
        body.extend_from_slice(&0u32.to_ne_bytes());
        let header = RecordHeader {
            kind: PERF_RECORD_EXIT,
            misc: 0,
            size: 0,
        };
        handle_record(
            &header,
            &body,
            &mut DsoTable::new(),
            &mut CommTable::new(),
            &mut StackUnwinder::new(64),
            &mut SymbolTables::new(),
            &mut aggregator,
            &make_set(),
            &HashMap::new(),
            &Counters::new(),
            None,
        );
        aggregator.apply_live_snapshot(0);
        assert_eq!(aggregator.sample_count(), 0);
    }
}
