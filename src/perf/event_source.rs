//! C2: the event source manager (spec §4.2) — turns a [`WatcherSet`] into
//! live `perf_event_open` file descriptors, one ring buffer per CPU shared
//! across every perf-active watcher on that CPU via `PERF_EVENT_IOC_SET_OUTPUT`,
//! and a sample-id -> watcher dispatch table built from `PERF_EVENT_IOC_ID`.
//!
//! Grounded on the per-CPU/per-thread fd bookkeeping in
//! `linux/perf_group.rs`'s `PerfGroup`/`Member`/`open_process`, adapted from
//! a single always-on watcher to an ordered set of them sharing output.

use std::collections::HashMap;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::ptr;

use libc::pid_t;
use nix::sys::eventfd::{EventFd, EfdFlags};
use nix::sys::mman::{mmap, munmap, MapFlags, ProtFlags};
use nix::unistd::SysconfVar;

use super::ring_buffer::{CustomRingConsumer, PerfRingBuffer, RingBufferError, PAGE_SIZE};
use super::sys::*;
use super::watcher::{Cadence, EventClass, KernelInclude, Watcher, WatcherSet};

#[derive(Debug, thiserror::Error)]
pub enum EventSourceError {
    #[error("perf_event_open failed for watcher {watcher} on cpu {cpu}: {errno}")]
    Open {
        watcher: String,
        cpu: i32,
        errno: std::io::Error,
    },
    #[error("mmap of perf ring buffer failed: {0}")]
    Mmap(#[source] nix::Error),
    #[error(transparent)]
    RingBuffer(#[from] RingBufferError),
    #[error("PERF_EVENT_IOC_SET_OUTPUT failed: {0}")]
    SetOutput(#[source] std::io::Error),
    #[error("PERF_EVENT_IOC_ID failed: {0}")]
    GetId(#[source] std::io::Error),
    #[error("could not create the custom ring buffer's backing file: {0}")]
    CustomRingFile(#[source] std::io::Error),
    #[error("could not create the custom ring's eventfd: {0}")]
    CustomRingEventFd(#[source] nix::Error),
}

/// The worker-side handle to the custom (non-perf) ring buffer that a
/// `Custom` watcher's samples arrive on. One memfd-like backing file (a
/// `tmpfs`-resident regular file, same approach as the library-mode
/// handoff ring in `daemonize.rs`), one eventfd the producer bumps after
/// every push so the worker can epoll on it instead of busy-polling.
pub struct CustomSource {
    pub watcher_index: usize,
    pub eventfd: EventFd,
    pub consumer: CustomRingConsumer,
    pub ring_path: std::path::PathBuf,
    mmap_addr: *mut libc::c_void,
    mmap_len: usize,
}

// SAFETY: the mmap is only ever touched from the single worker thread
// that owns the `EventSourceManager`.
unsafe impl Send for CustomSource {}

/// One open perf fd. Only the CPU's first (group leader) watcher owns a
/// mapped ring buffer; every later watcher on the same CPU redirects its
/// output into that buffer and is otherwise just a counter to enable/disable.
struct Source {
    fd: OwnedFd,
    watcher_index: usize,
    cpu: i32,
    owns_ring: bool,
}

pub struct EventSourceManager {
    sources: Vec<Source>,
    /// CPU -> (owning fd raw value, mapped ring buffer, mmap base/len for munmap).
    rings: HashMap<i32, (RawFd, PerfRingBuffer, *mut libc::c_void, usize)>,
    /// Sample id (from `PERF_EVENT_IOC_ID`) -> index into the watcher set,
    /// used to route a `PERF_RECORD_SAMPLE`'s trailing id back to the
    /// watcher that produced it when multiple watchers share one buffer.
    id_to_watcher: HashMap<u64, usize>,
    mmap_data_pages: usize,
    custom: Option<CustomSource>,
}

// SAFETY: raw mmap pointers are only ever dereferenced through
// `PerfRingBuffer`, which is itself `Send`; the manager is used from a
// single worker thread.
unsafe impl Send for EventSourceManager {}

impl EventSourceManager {
    /// Opens every watcher in `watchers` on every cpu in `cpus`, targeting
    /// either a specific `pid` (per-process mode) or `-1` (whole-system).
    pub fn open(
        watchers: &WatcherSet,
        cpus: &[i32],
        pid: Option<pid_t>,
        mmap_data_pages: usize,
    ) -> Result<Self, EventSourceError> {
        let mut manager = EventSourceManager {
            sources: Vec::new(),
            rings: HashMap::new(),
            id_to_watcher: HashMap::new(),
            mmap_data_pages,
            custom: None,
        };

        let target_pid = pid.unwrap_or(-1);

        for &cpu in cpus {
            let mut leader_fd: Option<RawFd> = None;
            for (index, watcher) in watchers.iter().enumerate() {
                if watcher.is_custom() {
                    continue;
                }
                let opened = manager.open_one(watcher, target_pid, cpu, leader_fd);
                let fd = match opened {
                    Ok(fd) => fd,
                    Err(e) => {
                        // A watcher that prefers kernel frames but cannot
                        // get them (e.g. perf_event_paranoid) retries
                        // without PERF_ATTR_FLAG_EXCLUDE_KERNEL relaxed;
                        // a Required watcher propagates the failure.
                        if watcher.kernel_include == KernelInclude::Preferred {
                            manager.open_one_forbid_kernel(watcher, target_pid, cpu, leader_fd)?
                        } else {
                            if let Some(diagnosis) = diagnose_open_failure(
                                watcher.kernel_include != KernelInclude::Forbidden,
                                target_pid == -1,
                            ) {
                                log::error!("{diagnosis}");
                            }
                            return Err(e);
                        }
                    }
                };

                let raw = fd.as_raw_fd();
                if leader_fd.is_none() {
                    leader_fd = Some(raw);
                    manager.map_ring(cpu, raw)?;
                } else {
                    let leader = leader_fd.unwrap();
                    set_output(raw, leader)?;
                }

                let id = get_id(raw)?;
                manager.id_to_watcher.insert(id, index);

                manager.sources.push(Source {
                    fd,
                    watcher_index: index,
                    cpu,
                    owns_ring: leader_fd == Some(raw),
                });
            }
        }

        if let Some(index) = watchers.iter().position(|w| w.is_custom()) {
            manager.open_custom(index)?;
        }

        Ok(manager)
    }

    /// Creates the custom ring's backing file and eventfd for the one
    /// `Custom` watcher in the set (spec §4.2/§6 "custom ring"). Not
    /// scoped to a CPU or a perf fd at all — it's written to directly by
    /// an instrumented process, not by the kernel.
    fn open_custom(&mut self, watcher_index: usize) -> Result<(), EventSourceError> {
        let page_size = nix::unistd::sysconf(SysconfVar::PAGE_SIZE)
            .ok()
            .flatten()
            .map(|v| v as usize)
            .unwrap_or(PAGE_SIZE);
        let total_size = page_size + self.mmap_data_pages * page_size;

        let ring_path = std::path::PathBuf::from(format!("/dev/shm/sprofd-custom-{}", std::process::id()));
        let file = std::fs::OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(&ring_path)
            .map_err(EventSourceError::CustomRingFile)?;
        file.set_len(total_size as u64).map_err(EventSourceError::CustomRingFile)?;

        let addr = unsafe {
            mmap(
                None,
                std::num::NonZeroUsize::new(total_size).unwrap(),
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_SHARED,
                file.as_raw_fd(),
                0,
            )
            .map_err(EventSourceError::Mmap)?
        };

        let consumer = unsafe { CustomRingConsumer::new(addr.as_ptr() as *mut u8, total_size)? };
        let eventfd = EventFd::from_value_and_flags(0, EfdFlags::EFD_NONBLOCK)
            .map_err(EventSourceError::CustomRingEventFd)?;

        self.custom = Some(CustomSource {
            watcher_index,
            eventfd,
            consumer,
            ring_path,
            mmap_addr: addr.as_ptr(),
            mmap_len: total_size,
        });
        Ok(())
    }

    pub fn custom_mut(&mut self) -> Option<&mut CustomSource> {
        self.custom.as_mut()
    }

    pub fn custom(&self) -> Option<&CustomSource> {
        self.custom.as_ref()
    }

    fn open_one(
        &self,
        watcher: &Watcher,
        pid: pid_t,
        cpu: i32,
        group_leader: Option<RawFd>,
    ) -> Result<OwnedFd, EventSourceError> {
        open_perf_fd(watcher, pid, cpu, group_leader, true)
    }

    fn open_one_forbid_kernel(
        &self,
        watcher: &Watcher,
        pid: pid_t,
        cpu: i32,
        group_leader: Option<RawFd>,
    ) -> Result<OwnedFd, EventSourceError> {
        open_perf_fd(watcher, pid, cpu, group_leader, false)
    }

    fn map_ring(&mut self, cpu: i32, fd: RawFd) -> Result<(), EventSourceError> {
        let page_size = nix::unistd::sysconf(SysconfVar::PAGE_SIZE)
            .ok()
            .flatten()
            .map(|v| v as usize)
            .unwrap_or(PAGE_SIZE);
        let total_size = page_size + self.mmap_data_pages * page_size;

        let addr = unsafe {
            mmap(
                None,
                std::num::NonZeroUsize::new(total_size).unwrap(),
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_SHARED,
                fd,
                0,
            )
            .map_err(EventSourceError::Mmap)?
        };

        let ring = unsafe { PerfRingBuffer::new(addr.as_ptr() as *mut u8, total_size, false)? };
        self.rings.insert(cpu, (fd, ring, addr.as_ptr(), total_size));
        Ok(())
    }

    pub fn enable_all(&self) -> std::io::Result<()> {
        for source in &self.sources {
            ioctl_no_arg(source.fd.as_raw_fd(), PERF_EVENT_IOC_ENABLE)?;
        }
        Ok(())
    }

    pub fn disable_all(&self) -> std::io::Result<()> {
        for source in &self.sources {
            ioctl_no_arg(source.fd.as_raw_fd(), PERF_EVENT_IOC_DISABLE)?;
        }
        Ok(())
    }

    /// Watcher index that produced a sample carrying trailing id `id`
    /// (present when `PERF_ATTR_FLAG_SAMPLE_ID_ALL` is set and multiple
    /// watchers share one ring buffer).
    pub fn watcher_for_id(&self, id: u64) -> Option<usize> {
        self.id_to_watcher.get(&id).copied()
    }

    /// Borrow of the full id -> watcher table, for callers that need to
    /// hold it across a mutable borrow of `rings` (e.g. the drain loop,
    /// which needs the map *and* a `&mut PerfRingBuffer` at once).
    pub fn id_to_watcher(&self) -> &HashMap<u64, usize> {
        &self.id_to_watcher
    }

    pub fn ring_mut(&mut self, cpu: i32) -> Option<&mut PerfRingBuffer> {
        self.rings.get_mut(&cpu).map(|(_, ring, _, _)| ring)
    }

    pub fn cpus(&self) -> impl Iterator<Item = i32> + '_ {
        self.rings.keys().copied()
    }

    pub fn pollable_fds(&self) -> impl Iterator<Item = (i32, RawFd)> + '_ {
        self.rings.iter().map(|(&cpu, (fd, _, _, _))| (cpu, *fd))
    }

    /// The custom ring's eventfd, if a `Custom` watcher is configured —
    /// the readiness signal to register with the poller alongside the
    /// per-cpu kernel ring fds.
    pub fn custom_pollable_fd(&self) -> Option<RawFd> {
        self.custom.as_ref().map(|c| c.eventfd.as_raw_fd())
    }

    pub fn close_all(&mut self) {
        for (_, _, addr, len) in self.rings.values() {
            unsafe {
                let _ = munmap(ptr::NonNull::new(*addr).unwrap(), *len);
            }
        }
        self.rings.clear();
        self.sources.clear();
        self.id_to_watcher.clear();

        if let Some(custom) = self.custom.take() {
            unsafe {
                let _ = munmap(ptr::NonNull::new(custom.mmap_addr).unwrap(), custom.mmap_len);
            }
            let _ = std::fs::remove_file(&custom.ring_path);
        }
    }
}

impl Drop for EventSourceManager {
    fn drop(&mut self) {
        self.close_all();
    }
}

fn open_perf_fd(
    watcher: &Watcher,
    pid: pid_t,
    cpu: i32,
    group_leader: Option<RawFd>,
    allow_kernel: bool,
) -> Result<OwnedFd, EventSourceError> {
    let mut attr = PerfEventAttr::default();
    attr.size = std::mem::size_of::<PerfEventAttr>() as u32;

    match watcher.event_class {
        EventClass::Hardware(config) => {
            attr.kind = PERF_TYPE_HARDWARE;
            attr.config = config;
        }
        EventClass::Software(config) => {
            attr.kind = PERF_TYPE_SOFTWARE;
            attr.config = config;
        }
        EventClass::Tracepoint { .. } => {
            attr.kind = PERF_TYPE_TRACEPOINT;
            // Resolving group/event name to a numeric config id is done by
            // the caller before constructing the watcher in this build
            // (no /sys/kernel/tracing id lookup lives in this module).
            attr.config = 0;
        }
        EventClass::Custom => unreachable!("custom watchers never open a perf fd"),
    }

    match watcher.cadence {
        Cadence::Period(p) => attr.sample_period_or_freq = p,
        Cadence::Frequency(f) => {
            attr.sample_period_or_freq = f;
            attr.flags |= PERF_ATTR_FLAG_FREQ;
        }
    }

    attr.sample_type = watcher.sample_type_mask();
    attr.sample_regs_user = (1u64 << PERF_REG_X86_BP) | (1u64 << PERF_REG_X86_SP) | (1u64 << PERF_REG_X86_IP);
    attr.sample_stack_user = watcher.stack_sample_size;
    attr.flags |= PERF_ATTR_FLAG_DISABLED
        | PERF_ATTR_FLAG_MMAP
        | PERF_ATTR_FLAG_MMAP2
        | PERF_ATTR_FLAG_MMAP_DATA
        | PERF_ATTR_FLAG_COMM
        | PERF_ATTR_FLAG_COMM_EXEC
        | PERF_ATTR_FLAG_TASK
        | PERF_ATTR_FLAG_SAMPLE_ID_ALL;

    if pid != -1 {
        attr.flags |= PERF_ATTR_FLAG_INHERIT;
    }

    if !allow_kernel || watcher.kernel_include == KernelInclude::Forbidden {
        attr.flags |= PERF_ATTR_FLAG_EXCLUDE_KERNEL;
    }

    let group_fd = group_leader.unwrap_or(-1);
    let raw = perf_event_open(&attr, pid, cpu, group_fd, PERF_FLAG_FD_CLOEXEC);
    if raw < 0 {
        return Err(EventSourceError::Open {
            watcher: watcher.to_string(),
            cpu,
            errno: std::io::Error::last_os_error(),
        });
    }
    Ok(unsafe { OwnedFd::from_raw_fd(raw) })
}

fn set_output(fd: RawFd, target: RawFd) -> Result<(), EventSourceError> {
    let ret = unsafe { libc::ioctl(fd, PERF_EVENT_IOC_SET_OUTPUT as _, target as libc::c_long) };
    if ret != 0 {
        return Err(EventSourceError::SetOutput(std::io::Error::last_os_error()));
    }
    Ok(())
}

fn get_id(fd: RawFd) -> Result<u64, EventSourceError> {
    let mut id: u64 = 0;
    let ret = unsafe { libc::ioctl(fd, PERF_EVENT_IOC_ID as _, &mut id as *mut u64) };
    if ret != 0 {
        return Err(EventSourceError::GetId(std::io::Error::last_os_error()));
    }
    Ok(id)
}

fn ioctl_no_arg(fd: RawFd, request: libc::c_ulong) -> std::io::Result<()> {
    let ret = unsafe { libc::ioctl(fd, request as _, 0) };
    if ret != 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

/// Reads `/proc/sys/kernel/perf_event_paranoid` and explains, in terms a
/// user can act on, why a watcher that wanted kernel frames or a
/// system-wide target just failed to open (spec §B "perf_event_paranoid
/// diagnostic"). Returns `None` if the file can't be read at all (e.g.
/// inside a container without `/proc/sys` mounted), in which case the
/// caller falls back to surfacing the bare `EventSourceError::Open`.
pub fn diagnose_open_failure(wants_kernel: bool, wants_system_wide: bool) -> Option<String> {
    let raw = std::fs::read_to_string("/proc/sys/kernel/perf_event_paranoid").ok()?;
    let level: i32 = raw.trim().parse().ok()?;

    let required = if wants_system_wide {
        -1
    } else if wants_kernel {
        1
    } else {
        2
    };

    if level > required {
        Some(format!(
            "perf_event_paranoid is {level}, but this watcher set needs <= {required} \
             (run as root, or `sysctl -w kernel.perf_event_paranoid={required}`, \
             or drop CAP_PERFMON/CAP_SYS_ADMIN requirements by disabling kernel frames \
             and system-wide targets)"
        ))
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::perf::watcher::{AggregationMode, ValueSource};

    fn make_watcher() -> Watcher {
        Watcher {
            event_class: EventClass::Software(PERF_COUNT_SW_CPU_CLOCK),
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
    fn attr_encodes_frequency_and_sample_mask() {
        let watcher = make_watcher();
        let mut attr = PerfEventAttr::default();
        attr.sample_type = watcher.sample_type_mask();
        match watcher.cadence {
            Cadence::Frequency(f) => {
                attr.sample_period_or_freq = f;
                attr.flags |= PERF_ATTR_FLAG_FREQ;
            }
            _ => unreachable!(),
        }
        assert_eq!(attr.sample_period_or_freq, 99);
        assert_ne!(attr.flags & PERF_ATTR_FLAG_FREQ, 0);
        assert_ne!(attr.sample_type & PERF_SAMPLE_STACK_USER, 0);
    }
}
