//! Two-tier error taxonomy (spec §A.2): a `SetupError` that aborts
//! startup outright, and a `RuntimeError` the worker loop can log and
//! recover from (skip this sample/export cycle, keep running).

use thiserror::Error;

use crate::export::endpoint::ExportError;
use crate::perf::event_source::EventSourceError;
use crate::perf::watcher::WatcherSetError;

#[derive(Debug, Error)]
pub enum SetupError {
    #[error("invalid watcher configuration: {0}")]
    Watchers(#[from] WatcherSetError),
    #[error("failed to open perf event sources: {0}")]
    EventSource(#[from] EventSourceError),
    #[error("failed to read /proc/sys/kernel/perf_event_paranoid: {0}")]
    Paranoid(#[source] std::io::Error),
    #[error("perf_event_paranoid={observed} forbids the requested watcher set (needs <= {required})")]
    ParanoidTooStrict { observed: i32, required: i32 },
    #[error("could not daemonize: {0}")]
    Daemonize(#[source] std::io::Error),
    #[error("could not bind the library-mode handoff socket at {path}: {source}")]
    SocketBind {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid configuration: {0}")]
    Config(String),
}

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("failed to parse a perf record: {0}")]
    Parse(#[from] crate::perf::sample_parser::ParseError),
    #[error("failed to export a profile: {0}")]
    Export(#[from] ExportError),
    #[error("worker child exited unexpectedly: {0}")]
    WorkerExited(String),
    #[error("ring buffer error: {0}")]
    RingBuffer(#[from] crate::perf::ring_buffer::RingBufferError),
    /// An export failure the worker should not keep retrying across
    /// restarts: the endpoint rejected the upload as unauthorized/not
    /// found, or transient failures escalated past the retry budget
    /// (spec §4.10). The supervisor is told not to respawn for this one.
    #[error("export failed fatally: {0}")]
    ExportFatal(String),
}
