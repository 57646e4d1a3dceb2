//! C11: stats and counters (spec §4.11, SPEC_FULL §A.1/§B). A small
//! process-shared atomic counter array (so a future signal handler or a
//! child could bump counters without a lock), a statsd gauge emitter over
//! a unix datagram socket, and the persistent profile-sequence counter
//! that survives worker restarts.

use std::fmt;
use std::io;
use std::net::Shutdown;
use std::os::unix::net::UnixDatagram;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(usize)]
pub enum Counter {
    SamplesReceived = 0,
    SamplesLost = 1,
    StacksTruncated = 2,
    FramesUnresolved = 3,
    ProfilesExported = 4,
    ExportFailures = 5,
    RestartCount = 6,
    /// A sample that made it all the way into the aggregator. Every
    /// received sample lands in exactly one of `SamplesAggregated`,
    /// `SamplesLost` or `SamplesErrored` (spec §8 accounting invariant).
    SamplesAggregated = 7,
    /// A sample that was parsed but couldn't be turned into a stack (no
    /// watcher match, unwind failure with no usable IP, etc.) — distinct
    /// from `SamplesLost`, which is a parse failure on the record itself.
    SamplesErrored = 8,
}

impl Counter {
    const COUNT: usize = 9;

    const ALL: [Counter; Counter::COUNT] = [
        Counter::SamplesReceived,
        Counter::SamplesLost,
        Counter::StacksTruncated,
        Counter::FramesUnresolved,
        Counter::ProfilesExported,
        Counter::ExportFailures,
        Counter::RestartCount,
        Counter::SamplesAggregated,
        Counter::SamplesErrored,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Counter::SamplesReceived => "samples.received",
            Counter::SamplesLost => "samples.lost",
            Counter::StacksTruncated => "unwind.truncated",
            Counter::FramesUnresolved => "symbols.unresolved",
            Counter::ProfilesExported => "export.success",
            Counter::ExportFailures => "export.failure",
            Counter::RestartCount => "worker.restarts",
            Counter::SamplesAggregated => "samples.aggregated",
            Counter::SamplesErrored => "samples.errored",
        }
    }
}

/// A fixed array of atomic counters, one per [`Counter`] variant. Safe to
/// share across the supervisor and worker if ever placed in a shared
/// mapping; currently used single-process but kept lock-free regardless.
pub struct Counters {
    values: [AtomicU64; Counter::COUNT],
}

impl Default for Counters {
    fn default() -> Self {
        Counters {
            values: std::array::from_fn(|_| AtomicU64::new(0)),
        }
    }
}

impl Counters {
    pub fn new() -> Self {
        Counters::default()
    }

    pub fn incr(&self, counter: Counter) {
        self.add(counter, 1);
    }

    pub fn add(&self, counter: Counter, n: u64) {
        self.values[counter as usize].fetch_add(n, Ordering::Relaxed);
    }

    pub fn get(&self, counter: Counter) -> u64 {
        self.values[counter as usize].load(Ordering::Relaxed)
    }

    /// Drains every counter to zero, returning the pre-drain values —
    /// used once per statsd flush interval so gauges report deltas.
    pub fn drain(&self) -> Vec<(Counter, u64)> {
        Counter::ALL
            .into_iter()
            .map(|c| (c, self.values[c as usize].swap(0, Ordering::Relaxed)))
            .collect()
    }
}

/// Rate-limited wrapper around `log`: suppresses repeats of the same
/// message within `window`, used for per-sample-rate noisy error paths
/// (spec §A.1) like "failed to resolve symbol" that would otherwise spam
/// the log at sampling frequency.
pub struct RateLimitedLog {
    window: Duration,
    last_logged: std::sync::Mutex<std::collections::HashMap<&'static str, Instant>>,
}

impl RateLimitedLog {
    pub fn new(window: Duration) -> Self {
        RateLimitedLog {
            window,
            last_logged: std::sync::Mutex::new(std::collections::HashMap::new()),
        }
    }

    pub fn warn_once_per_window(&self, key: &'static str, message: impl fmt::Display) {
        let mut guard = self.last_logged.lock().unwrap();
        let now = Instant::now();
        let should_log = match guard.get(key) {
            Some(last) => now.duration_since(*last) >= self.window,
            None => true,
        };
        if should_log {
            guard.insert(key, now);
            log::warn!("{message}");
        }
    }
}

/// Emits statsd-style gauges over a unix datagram socket (spec §A.1), the
/// same wire format the ambient Datadog agent listens for on its
/// dogstatsd socket.
pub struct StatsdClient {
    socket: UnixDatagram,
}

impl StatsdClient {
    pub fn connect(socket_path: &Path) -> io::Result<Self> {
        let socket = UnixDatagram::unbound()?;
        socket.connect(socket_path)?;
        Ok(StatsdClient { socket })
    }

    pub fn gauge(&self, name: &str, value: u64, tags: &[(&str, &str)]) -> io::Result<()> {
        let tag_str = tags
            .iter()
            .map(|(k, v)| format!("{k}:{v}"))
            .collect::<Vec<_>>()
            .join(",");
        let line = if tag_str.is_empty() {
            format!("{name}:{value}|g")
        } else {
            format!("{name}:{value}|g|#{tag_str}")
        };
        self.socket.send(line.as_bytes())?;
        Ok(())
    }

    pub fn close(self) {
        let _ = self.socket.shutdown(Shutdown::Both);
    }
}

/// State that must outlive a single worker process (spec §B "profile_seq
/// bookkeeping"): written to a small file in the runtime directory on
/// every export so a respawned worker keeps the sequence monotonic rather
/// than restarting it at zero and breaking downstream ordering.
#[derive(Debug, Clone, Copy, Default)]
pub struct PersistentState {
    pub profile_seq: u64,
}

impl PersistentState {
    pub fn load(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(text) => PersistentState {
                profile_seq: text.trim().parse().unwrap_or(0),
            },
            Err(_) => PersistentState::default(),
        }
    }

    pub fn save(&self, path: &Path) -> io::Result<()> {
        std::fs::write(path, self.profile_seq.to_string())
    }

    pub fn next_seq(&mut self) -> u64 {
        let seq = self.profile_seq;
        self.profile_seq += 1;
        seq
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate_and_drain_to_zero() {
        let counters = Counters::new();
        counters.incr(Counter::SamplesReceived);
        counters.add(Counter::SamplesReceived, 4);
        assert_eq!(counters.get(Counter::SamplesReceived), 5);

        let drained = counters.drain();
        assert!(drained.contains(&(Counter::SamplesReceived, 5)));
        assert_eq!(counters.get(Counter::SamplesReceived), 0);
    }

    #[test]
    fn persistent_state_round_trips_through_a_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("seq");
        let mut state = PersistentState::default();
        assert_eq!(state.next_seq(), 0);
        assert_eq!(state.next_seq(), 1);
        state.save(&path).unwrap();

        let reloaded = PersistentState::load(&path);
        assert_eq!(reloaded.profile_seq, 2);
    }

    #[test]
    fn persistent_state_missing_file_starts_at_zero() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("does-not-exist");
        let state = PersistentState::load(&path);
        assert_eq!(state.profile_seq, 0);
    }

    #[test]
    fn rate_limited_log_suppresses_within_window() {
        let log = RateLimitedLog::new(Duration::from_secs(3600));
        // Can't directly observe `log` output here; verifying it doesn't
        // panic across repeated calls with the same key is the useful
        // property this unit test can assert without capturing stderr.
        log.warn_once_per_window("test-key", "first");
        log.warn_once_per_window("test-key", "second");
    }
}
