//! C9: the supervisor (spec §4.9). Forks the worker, waits on it, and
//! restarts it on an unexpected exit, forwarding termination signals
//! through rather than letting the worker be orphaned mid-signal.
//!
//! The worker and its supervisor share a `MAP_SHARED|MAP_ANONYMOUS`
//! region (`SharedState`) the worker writes into just before exiting, so
//! the supervisor can tell a recoverable crash (respawn) from a fatal
//! one (give up) without having to infer it from a raw exit code.

use std::num::NonZeroUsize;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use nix::sys::mman::{mmap_anonymous, munmap, MapFlags, ProtFlags};
use nix::sys::signal::{self, Signal};
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::{fork, ForkResult, Pid};

use crate::error::SetupError;
use crate::stats::{Counter, Counters};

/// Flags a worker sets just before exiting, read by its supervisor
/// across the fork boundary.
#[repr(C)]
pub struct SharedState {
    /// Nonzero: the worker hit a recoverable error and wants a respawn.
    pub restart: AtomicU32,
    /// Nonzero: the worker hit a fatal error; don't respawn, stop.
    pub errors: AtomicU32,
    /// Count of worker lifetimes this region has seen so far.
    pub seq: AtomicU64,
}

impl SharedState {
    /// Clears both signal flags, called right before a fresh worker is
    /// spawned so a stale flag from the worker that just exited can't be
    /// misread as having come from the new one.
    fn reset_signal(&self) {
        self.restart.store(0, Ordering::SeqCst);
        self.errors.store(0, Ordering::SeqCst);
    }
}

/// Owns the mmap'd `SharedState` region, unmapping it on drop.
pub struct SharedStateRegion {
    ptr: NonNull<SharedState>,
}

impl SharedStateRegion {
    pub fn new() -> Result<Self, SetupError> {
        let len = NonZeroUsize::new(std::mem::size_of::<SharedState>()).expect("SharedState is not zero-sized");
        let ptr = unsafe { mmap_anonymous(None, len, ProtFlags::PROT_READ | ProtFlags::PROT_WRITE, MapFlags::MAP_SHARED) }
            .map_err(|e| SetupError::Config(format!("could not mmap supervisor shared state: {e}")))?
            .cast::<SharedState>();
        unsafe {
            ptr.as_ptr().write(SharedState {
                restart: AtomicU32::new(0),
                errors: AtomicU32::new(0),
                seq: AtomicU64::new(0),
            });
        }
        Ok(SharedStateRegion { ptr })
    }

    pub fn get(&self) -> &SharedState {
        // SAFETY: the region lives as long as `self`, and both the
        // parent and the forked child map the same physical pages
        // MAP_SHARED, so concurrent atomic access across the fork is
        // well-defined.
        unsafe { self.ptr.as_ref() }
    }
}

impl Drop for SharedStateRegion {
    fn drop(&mut self) {
        unsafe {
            let _ = munmap(self.ptr.cast(), std::mem::size_of::<SharedState>());
        }
    }
}

// SAFETY: `SharedState`'s fields are all atomics; the region is meant to
// be shared across the fork boundary (and, in the supervisor's own
// address space, is read from the loop thread only).
unsafe impl Send for SharedStateRegion {}
unsafe impl Sync for SharedStateRegion {}

pub enum Supervised {
    /// This process is the supervisor; `child` is the worker pid it is
    /// watching.
    Supervisor { child: Pid },
    /// This process is the forked worker and should run the worker loop.
    Worker,
}

/// Forks once; the parent becomes the supervisor loop, the child returns
/// `Supervised::Worker` so the caller can hand off into
/// `worker::WorkerLoop::run`.
pub fn fork_worker() -> Result<Supervised, SetupError> {
    match unsafe { fork() }.map_err(|e| SetupError::Daemonize(std::io::Error::from_raw_os_error(e as i32)))? {
        ForkResult::Parent { child } => Ok(Supervised::Supervisor { child }),
        ForkResult::Child => Ok(Supervised::Worker),
    }
}

/// What the supervisor should do once a worker has exited, decided from
/// the flags that worker left in `SharedState`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorAction {
    Respawn,
    StopClean,
    StopFatal,
}

/// Pure decision function, kept separate from `supervise()`'s syscalls
/// so it can be exercised directly: `errors` wins over `restart` (a
/// worker that both failed fatally and asked for a respawn is still not
/// respawned), and a worker that left neither flag set exited clean.
fn decide(shared: &SharedState) -> SupervisorAction {
    if shared.errors.load(Ordering::SeqCst) != 0 {
        SupervisorAction::StopFatal
    } else if shared.restart.load(Ordering::SeqCst) != 0 {
        SupervisorAction::Respawn
    } else {
        SupervisorAction::StopClean
    }
}

/// Runs the supervision loop: waits on the worker, and on exit consults
/// `shared` to decide whether to respawn it (by calling `spawn_worker`
/// again), stop cleanly, or give up with an error — instead of
/// respawning unconditionally up to some crash-loop cap.
pub fn supervise(
    mut child: Pid,
    shared: &SharedState,
    counters: &Counters,
    mut spawn_worker: impl FnMut() -> Result<Pid, SetupError>,
    mut should_stop: impl FnMut() -> bool,
) -> Result<(), SetupError> {
    loop {
        if should_stop() {
            let _ = signal::kill(child, Signal::SIGTERM);
            let _ = waitpid(child, None);
            return Ok(());
        }

        match waitpid(child, Some(nix::sys::wait::WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) => {
                std::thread::sleep(Duration::from_millis(200));
                continue;
            }
            Ok(_exited) => match decide(shared) {
                SupervisorAction::Respawn => {
                    counters.incr(Counter::RestartCount);
                    shared.seq.fetch_add(1, Ordering::SeqCst);
                    shared.reset_signal();
                    log::warn!("worker exited, restarting");
                    child = spawn_worker()?;
                }
                SupervisorAction::StopClean => {
                    log::info!("worker exited cleanly, not restarting");
                    return Ok(());
                }
                SupervisorAction::StopFatal => {
                    log::error!("worker exited fatally, not restarting");
                    return Err(SetupError::Config("worker exited fatally".to_owned()));
                }
            },
            Err(e) => {
                return Err(SetupError::Config(format!("waitpid failed: {e}")));
            }
        }
    }
}

/// Forwards a caught termination signal to the worker before the
/// supervisor itself exits, so a single `kill` on the supervisor's pid
/// tears down the whole tree instead of orphaning the worker.
pub fn forward_signal(worker: Pid, signal: Signal) {
    let _ = signal::kill(worker, signal);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fresh_state() -> SharedState {
        SharedState {
            restart: AtomicU32::new(0),
            errors: AtomicU32::new(0),
            seq: AtomicU64::new(0),
        }
    }

    #[test]
    fn decide_respawns_when_only_restart_is_set() {
        let state = fresh_state();
        state.restart.store(1, Ordering::SeqCst);
        assert_eq!(decide(&state), SupervisorAction::Respawn);
    }

    #[test]
    fn decide_stops_fatally_when_errors_is_set() {
        let state = fresh_state();
        state.errors.store(1, Ordering::SeqCst);
        assert_eq!(decide(&state), SupervisorAction::StopFatal);
    }

    #[test]
    fn decide_errors_wins_over_restart() {
        let state = fresh_state();
        state.restart.store(1, Ordering::SeqCst);
        state.errors.store(1, Ordering::SeqCst);
        assert_eq!(decide(&state), SupervisorAction::StopFatal);
    }

    #[test]
    fn decide_stops_clean_when_neither_flag_is_set() {
        let state = fresh_state();
        assert_eq!(decide(&state), SupervisorAction::StopClean);
    }

    #[test]
    fn reset_signal_clears_both_flags() {
        let state = fresh_state();
        state.restart.store(1, Ordering::SeqCst);
        state.errors.store(1, Ordering::SeqCst);
        state.reset_signal();
        assert_eq!(state.restart.load(Ordering::SeqCst), 0);
        assert_eq!(state.errors.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn shared_state_region_round_trips_through_atomics() {
        let region = SharedStateRegion::new().expect("mmap should succeed");
        let shared = region.get();
        shared.restart.store(1, Ordering::SeqCst);
        assert_eq!(shared.restart.load(Ordering::SeqCst), 1);
    }
}
