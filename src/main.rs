mod aggregate;
mod cli;
mod clock;
mod context;
mod daemonize;
mod error;
mod export;
mod perf;
mod process;
mod stats;
mod supervisor;
mod symbols;
mod unwind;
mod worker;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;

use cli::Args;
use context::{ContextBuilder, Target};
use daemonize::{HandoffServer, ProfilerInfo};
use error::{RuntimeError, SetupError};
use export::endpoint::{Endpoint, Exporter};
use perf::event_source::EventSourceManager;
use perf::watcher::{AggregationMode, Cadence, EventClass, KernelInclude, ValueSource, Watcher};
use stats::Counters;
use worker::WorkerLoop;

/// Size of the memfd-backed ring handed out to library-mode clients:
/// one metadata page plus a 1 MiB (power-of-two) data region.
const HANDOFF_RING_SIZE: usize = 4096 + (1 << 20);

fn default_watchers() -> Vec<Watcher> {
    vec![Watcher {
        event_class: EventClass::Software(perf::sys::PERF_COUNT_SW_CPU_CLOCK),
        cadence: Cadence::Frequency(99),
        stack_sample_size: 32 * 1024,
        value_source: ValueSource::SamplePeriod,
        aggregation_mode: AggregationMode::Sum,
        output_sample_type: "cpu-time".to_owned(),
        kernel_include: KernelInclude::Preferred,
        coefficient: 1.0,
        label: None,
    }]
}

fn build_context(args: &Args, env: &cli::EnvOverrides) -> Result<context::Context, SetupError> {
    let mut builder = ContextBuilder::new();

    if let Some(pid) = args.pid {
        builder = builder.target(Target::Pid(pid));
    }

    for watcher in default_watchers() {
        builder = builder.watcher(watcher);
    }

    if !args.cpu.is_empty() {
        builder = builder.cpus(args.cpu.clone());
    }

    let upload_period = env.upload_period.unwrap_or(args.upload_period);
    builder = builder.upload_period(upload_period);

    let endpoint = match (cli::resolve_agent_url(args, env), &env.api_key) {
        (Some(url), _) => Endpoint::Agent { base_url: url },
        (None, Some(api_key)) => Endpoint::Agentless {
            intake_url: "https://intake.profile.datadoghq.com/api/v2/profile".to_owned(),
            api_key: api_key.clone(),
        },
        (None, None) => {
            return Err(SetupError::Config(
                "no agent URL and no DD_API_KEY: nowhere to send profiles".to_owned(),
            ))
        }
    };
    builder = builder.endpoint(endpoint);

    if let Some(service) = &env.service {
        builder = builder.service(service.clone());
    }
    if let Some(e) = &env.env {
        builder = builder.env(e.clone());
    }
    if let Some(v) = &env.version {
        builder = builder.version(v.clone());
    }
    for (k, v) in &env.tags {
        builder = builder.tag(k.clone(), v.clone());
    }
    if let Some(socket) = &env.dogstatsd_socket {
        builder = builder.dogstatsd_socket(socket.clone());
    }

    builder.build()
}

fn install_signal_handlers() -> Arc<AtomicBool> {
    let shutdown = Arc::new(AtomicBool::new(false));
    let flag = shutdown.clone();
    unsafe {
        SHUTDOWN_FLAG = Some(flag);
        libc::signal(libc::SIGTERM, handle_shutdown_signal as libc::sighandler_t);
        libc::signal(libc::SIGINT, handle_shutdown_signal as libc::sighandler_t);
    }
    shutdown
}

static mut SHUTDOWN_FLAG: Option<Arc<AtomicBool>> = None;

extern "C" fn handle_shutdown_signal(_sig: libc::c_int) {
    // SAFETY: set once before any signal can arrive, never mutated after;
    // a signal handler may only touch data that's safe to touch
    // async-signal-free, and an AtomicBool store via a shared Arc clone
    // loaded before installing the handler qualifies.
    unsafe {
        if let Some(flag) = &SHUTDOWN_FLAG {
            flag.store(true, Ordering::SeqCst);
        }
    }
}

fn run() -> Result<(), SetupError> {
    let args = Args::parse();

    let level = match args.verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    if cli::already_active() {
        log::warn!("profiler already active in this process tree, refusing to start a second one");
        return Ok(());
    }
    std::env::set_var(cli::REENTRANCY_GUARD_VAR, "1");

    let env = cli::env_overrides();
    let context = build_context(&args, &env)?;

    let shutdown = install_signal_handlers();

    if let Some(socket_path) = &args.handoff_socket {
        return serve_handoff(socket_path, &shutdown);
    }

    if args.daemonize {
        daemonize::daemonize(|| {})?;
    }

    let counters = Counters::new();
    let shared_region = supervisor::SharedStateRegion::new()?;
    let shared = shared_region.get();

    let spawn = || -> Result<nix::unistd::Pid, SetupError> {
        match supervisor::fork_worker()? {
            supervisor::Supervised::Supervisor { child } => Ok(child),
            supervisor::Supervised::Worker => {
                let exit_code = run_worker(&context, &shutdown, shared).map(|()| 0).unwrap_or_else(|e| {
                    log::error!("worker exiting: {e}");
                    1
                });
                std::process::exit(exit_code);
            }
        }
    };

    let first_child = spawn()?;
    supervisor::supervise(first_child, shared, &counters, spawn, || shutdown.load(Ordering::SeqCst))
}

/// Serves the library-mode handoff socket: allocates the memfd-backed
/// ring a profiled process will write samples into, then replies with a
/// [`ProfilerInfo`] to every client that connects until asked to stop.
/// Consuming that ring is out of scope for this binary's own worker loop
/// (spec §4.14 covers only the handoff, not the in-process writer side).
fn serve_handoff(socket_path: &std::path::Path, shutdown: &Arc<AtomicBool>) -> Result<(), SetupError> {
    let ring_path = std::path::PathBuf::from(format!("/dev/shm/sprofd-ring-{}", std::process::id()));
    let file = std::fs::OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .open(&ring_path)
        .map_err(|e| SetupError::Config(format!("could not create handoff ring at {}: {e}", ring_path.display())))?;
    file.set_len(HANDOFF_RING_SIZE as u64)
        .map_err(|e| SetupError::Config(format!("could not size handoff ring: {e}")))?;

    let info = ProfilerInfo {
        ring_buffer_path: ring_path.clone(),
        ring_buffer_size: HANDOFF_RING_SIZE,
    };
    let server = HandoffServer::bind(socket_path)?;
    server
        .listener_set_nonblocking()
        .map_err(|e| SetupError::Config(format!("could not configure handoff socket: {e}")))?;

    log::info!("serving library-mode handoff on {} (ring at {})", socket_path.display(), ring_path.display());
    while !shutdown.load(Ordering::SeqCst) {
        match server.accept_and_reply(&info) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(Duration::from_millis(200));
            }
            Err(e) => log::warn!("handoff accept failed: {e}"),
        }
    }
    let _ = std::fs::remove_file(&ring_path);
    Ok(())
}

/// Runs one worker lifetime, setting `shared`'s flags before returning
/// so the supervisor that waits on this process knows whether to
/// respawn it: `errors` for a failure retrying won't fix (bad setup, or
/// a fatal export rejection), `restart` for one it might outlive.
fn run_worker(
    context: &context::Context,
    shutdown: &Arc<AtomicBool>,
    shared: &supervisor::SharedState,
) -> Result<(), SetupError> {
    let pid = match context.target {
        Target::Pid(pid) => Some(pid),
        Target::WholeSystem => None,
    };

    let mmap_data_pages = 64;
    let sources = match EventSourceManager::open(&context.watchers, &context.cpus, pid, mmap_data_pages) {
        Ok(sources) => sources,
        Err(e) => {
            shared.errors.store(1, Ordering::SeqCst);
            return Err(SetupError::EventSource(e));
        }
    };

    let exporter = match Exporter::new(context.endpoint.clone(), Duration::from_secs(10)) {
        Ok(exporter) => exporter,
        Err(e) => {
            shared.errors.store(1, Ordering::SeqCst);
            return Err(SetupError::Config(e.to_string()));
        }
    };

    let mut worker_loop = WorkerLoop::new(context.clone(), sources, exporter);
    match worker_loop.run(|| shutdown.load(Ordering::SeqCst)) {
        Ok(()) => Ok(()),
        Err(RuntimeError::ExportFatal(msg)) => {
            shared.errors.store(1, Ordering::SeqCst);
            Err(SetupError::Config(msg))
        }
        Err(e) => {
            shared.restart.store(1, Ordering::SeqCst);
            Err(SetupError::Config(e.to_string()))
        }
    }
}

fn main() {
    if let Err(e) = run() {
        log::error!("sprofd exiting: {e}");
        std::process::exit(1);
    }
}
