//! C8: the worker main loop (spec §4.8). Polls every CPU's ring buffer
//! (kernel and custom) through `mio`'s epoll backend with a bounded time
//! budget per tick, dispatches records into the process/unwind/symbol/
//! aggregate pipeline, and exports on a fixed cadence — plus one last
//! partial export when the worker itself is asked to exit (spec §B
//! "send_final").
//!
//! The epoll-driven multi-fd drain loop is grounded on `linux/perf_group.rs`'s
//! `poll_events`, generalized from "one fd per thread" to "one fd per CPU,
//! N watchers sharing it".

pub mod dispatch;

use std::time::{Duration, Instant};

use mio::{Events, Interest, Poll, Token};

use crate::aggregate::Aggregator;
use crate::context::{Context, Target};
use crate::error::RuntimeError;
use crate::export::endpoint::{Exporter, RejectionKind, UploadRequest};
use crate::export::build_profile;
use crate::perf::event_source::EventSourceManager;
use crate::process::{CommTable, DsoTable};
use crate::stats::{Counter, Counters, PersistentState, StatsdClient};
use crate::symbols::SymbolTables;
use crate::unwind::StackUnwinder;

/// Upper bound on how long one poll tick is allowed to spend draining
/// ring buffers before yielding back to check for the exit signal, so a
/// pathologically busy target can't starve the worker's own shutdown.
const DRAIN_BUDGET: Duration = Duration::from_millis(100);

/// Token id reserved for the custom ring's eventfd, kept out of the
/// range used for per-cpu kernel ring tokens (enumerated from 0).
const CUSTOM_RING_TOKEN: usize = usize::MAX;

/// Consecutive transient export failures (spec §4.10) before the worker
/// gives up and asks the supervisor not to respawn it — a sustained
/// string of non-2xx/transport failures usually means something
/// structural (bad DNS, a firewalled egress path), not a blip.
const MAX_CONSECUTIVE_EXPORT_FAILURES: u32 = 3;

pub struct WorkerLoop {
    context: Context,
    sources: EventSourceManager,
    dsos: DsoTable,
    comms: CommTable,
    unwinder: StackUnwinder,
    symbols: SymbolTables,
    aggregator: Aggregator,
    exporter: Exporter,
    counters: Counters,
    statsd: Option<StatsdClient>,
    persistent: PersistentState,
    persistent_path: std::path::PathBuf,
    consecutive_export_failures: u32,
    last_export: Instant,
    profile_start: Instant,
    target_pid: Option<i32>,
    target_exited: bool,
}

impl WorkerLoop {
    pub fn new(context: Context, sources: EventSourceManager, exporter: Exporter) -> Self {
        let sample_type_count = context.watchers.len();
        let persistent_path = context.runtime_dir.join("profile_seq");
        let persistent = PersistentState::load(&persistent_path);
        let statsd = context.dogstatsd_socket.as_deref().and_then(|path| match StatsdClient::connect(path) {
            Ok(client) => Some(client),
            Err(e) => {
                log::warn!("could not connect to dogstatsd socket {}: {e}", path.display());
                None
            }
        });
        let target_pid = match context.target {
            Target::Pid(pid) => Some(pid),
            Target::WholeSystem => None,
        };
        WorkerLoop {
            context,
            sources,
            dsos: DsoTable::new(),
            comms: CommTable::new(),
            unwinder: StackUnwinder::new(512),
            symbols: SymbolTables::new(),
            aggregator: Aggregator::new(sample_type_count),
            exporter,
            counters: Counters::new(),
            statsd,
            persistent,
            persistent_path,
            consecutive_export_failures: 0,
            last_export: Instant::now(),
            profile_start: Instant::now(),
            target_pid,
            target_exited: false,
        }
    }

    /// Runs until `should_exit` reports true, at which point it drains
    /// whatever's left in the ring buffers once more and exports a final
    /// partial profile before returning.
    pub fn run(&mut self, mut should_exit: impl FnMut() -> bool) -> Result<(), RuntimeError> {
        self.sources.enable_all().map_err(|e| RuntimeError::WorkerExited(e.to_string()))?;

        let mut poll = Poll::new().map_err(|e| RuntimeError::WorkerExited(e.to_string()))?;
        let mut token_to_cpu = std::collections::HashMap::new();
        for (token_id, (cpu, fd)) in self.sources.pollable_fds().enumerate() {
            let token = Token(token_id);
            let mut source_fd = mio::unix::SourceFd(&fd);
            poll.registry()
                .register(&mut source_fd, token, Interest::READABLE)
                .map_err(|e| RuntimeError::WorkerExited(e.to_string()))?;
            token_to_cpu.insert(token, cpu);
        }

        if let Some(fd) = self.sources.custom_pollable_fd() {
            let mut source_fd = mio::unix::SourceFd(&fd);
            poll.registry()
                .register(&mut source_fd, Token(CUSTOM_RING_TOKEN), Interest::READABLE)
                .map_err(|e| RuntimeError::WorkerExited(e.to_string()))?;
        }

        let mut events = Events::with_capacity(token_to_cpu.len().max(1) + 1);

        while !should_exit() && !self.target_exited {
            poll.poll(&mut events, Some(Duration::from_millis(250)))
                .map_err(|e| RuntimeError::WorkerExited(e.to_string()))?;

            self.drain_ready_cpus(&token_to_cpu);
            self.drain_custom();

            if self.last_export.elapsed() >= self.context.upload_period {
                self.export_cycle(false)?;
                self.last_export = Instant::now();
            }
        }

        self.drain_all();
        self.drain_custom();
        self.export_cycle(true)?;
        Ok(())
    }

    fn drain_ready_cpus(&mut self, token_to_cpu: &std::collections::HashMap<Token, i32>) {
        let deadline = Instant::now() + DRAIN_BUDGET;
        for &cpu in token_to_cpu.values() {
            if Instant::now() >= deadline {
                break;
            }
            self.drain_cpu(cpu);
        }
    }

    fn drain_all(&mut self) {
        let cpus: Vec<i32> = self.sources.cpus().collect();
        for cpu in cpus {
            self.drain_cpu(cpu);
        }
    }

    fn drain_cpu(&mut self, cpu: i32) {
        // Snapshot the id -> watcher table before taking a mutable borrow
        // of the ring below; both live on `self.sources`.
        let id_to_watcher = self.sources.id_to_watcher().clone();
        let Some(ring) = self.sources.ring_mut(cpu) else {
            return;
        };
        let Ok((head, mut tail)) = ring.available() else {
            return;
        };

        let mut scratch = Vec::new();
        while tail < head {
            let header_view = unsafe { ring.seek(tail, 8) };
            let header_bytes = header_view.linearize(&mut scratch).to_vec();
            let Ok(header) = dispatch::parse_record_header(&header_bytes) else {
                break;
            };
            if header.size < 8 {
                break;
            }

            let body_view = unsafe { ring.seek(tail, header.size as usize) };
            let record_bytes = body_view.linearize(&mut scratch).to_vec();

            let is_target_exit = dispatch::handle_record(
                &header,
                &record_bytes[8..],
                &mut self.dsos,
                &mut self.comms,
                &mut self.unwinder,
                &mut self.symbols,
                &mut self.aggregator,
                &self.context.watchers,
                &id_to_watcher,
                &self.counters,
                self.target_pid,
            );
            if is_target_exit {
                self.target_exited = true;
            }

            tail += header.size as u64;
        }
        ring.advance(tail);
    }

    /// Drains the custom (non-kernel) ring a `Custom` watcher's samples
    /// arrive on, if one is configured. Framed the same way as a kernel
    /// ring: an 8-byte header (`kind`/`misc`/`size`) followed by a body
    /// whose length the header gives.
    fn drain_custom(&mut self) {
        let id_to_watcher = self.sources.id_to_watcher().clone();
        let Some(custom) = self.sources.custom_mut() else {
            return;
        };
        // Clears the eventfd's counter; its value (how many pushes
        // coalesced into this wakeup) isn't otherwise needed.
        let _ = custom.eventfd.read();

        let (head, mut tail) = custom.consumer.available();
        let mut scratch = Vec::new();
        while tail < head {
            unsafe { custom.consumer.read_into(tail, 8, &mut scratch) };
            let Ok(header) = dispatch::parse_record_header(&scratch) else {
                break;
            };
            if header.size < 8 {
                break;
            }

            unsafe { custom.consumer.read_into(tail, header.size as usize, &mut scratch) };
            let is_target_exit = dispatch::handle_record(
                &header,
                &scratch[8..],
                &mut self.dsos,
                &mut self.comms,
                &mut self.unwinder,
                &mut self.symbols,
                &mut self.aggregator,
                &self.context.watchers,
                &id_to_watcher,
                &self.counters,
                self.target_pid,
            );
            if is_target_exit {
                self.target_exited = true;
            }

            tail += header.size as u64;
        }
        custom.consumer.advance(tail);
    }

    fn export_cycle(&mut self, is_final: bool) -> Result<(), RuntimeError> {
        let result = self.do_export(is_final);
        self.flush_stats();
        result
    }

    fn do_export(&mut self, is_final: bool) -> Result<(), RuntimeError> {
        if self.aggregator.sample_count() == 0 {
            return Ok(());
        }

        let profile = build_profile(
            &self.aggregator,
            &self.context.watchers,
            self.profile_start.elapsed().as_nanos() as i64,
            self.last_export.elapsed(),
        );

        let seq = self.persistent.next_seq();
        if let Err(e) = self.persistent.save(&self.persistent_path) {
            log::warn!("could not persist profile sequence to {}: {e}", self.persistent_path.display());
        }

        let request = UploadRequest {
            profile,
            start: self.profile_start.elapsed(),
            end: Instant::now().duration_since(self.profile_start),
            tags: self.context.tags.clone(),
            family: "native",
            profile_seq: seq,
        };

        match self.exporter.upload(&request, 3) {
            Ok(()) => {
                self.counters.incr(Counter::ProfilesExported);
                self.consecutive_export_failures = 0;
                self.aggregator.clear_samples();
                Ok(())
            }
            Err(e) => match e.rejection_kind() {
                RejectionKind::Drop => {
                    log::warn!("profile upload dropped ({e}), continuing");
                    self.consecutive_export_failures = 0;
                    self.aggregator.clear_samples();
                    Ok(())
                }
                RejectionKind::Fatal => {
                    self.counters.incr(Counter::ExportFailures);
                    Err(RuntimeError::ExportFatal(e.to_string()))
                }
                RejectionKind::Transient => {
                    self.counters.incr(Counter::ExportFailures);
                    self.consecutive_export_failures += 1;
                    if self.consecutive_export_failures >= MAX_CONSECUTIVE_EXPORT_FAILURES {
                        return Err(RuntimeError::ExportFatal(format!(
                            "{e} ({} consecutive failures)",
                            self.consecutive_export_failures
                        )));
                    }
                    if is_final {
                        // Best-effort: a final export failing on the way
                        // out shouldn't block process exit.
                        log::warn!("final profile export failed: {e}");
                        Ok(())
                    } else {
                        Err(RuntimeError::Export(e))
                    }
                }
            },
        }
    }

    /// Drains every counter and, if a statsd socket is configured, emits
    /// each as a gauge (spec §A.1). Runs once per export cycle regardless
    /// of whether the export itself succeeded, so counters never silently
    /// build up across cycles that had nothing to upload.
    fn flush_stats(&mut self) {
        let drained = self.counters.drain();
        let Some(statsd) = &self.statsd else {
            return;
        };
        for (counter, value) in drained {
            if let Err(e) = statsd.gauge(counter.name(), value, &[("service", &self.context.service)]) {
                log::warn!("failed to emit statsd gauge {}: {e}", counter.name());
            }
        }
    }
}
