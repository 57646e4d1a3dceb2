//! C14: daemonization and library-mode handoff (spec §4.14). Standalone
//! mode double-forks to detach from the launching terminal; library mode
//! instead hands a live [`ProfilerInfo`] to an already-running process
//! over a unix socket, skipping the fork entirely since the caller is
//! already the process to be profiled.
//!
//! The double-fork protocol mirrors the fork/pipe bookkeeping in
//! `linux/process.rs`'s `SuspendedLaunchedProcess`, adapted from
//! launch-and-suspend to detach-and-persist.

use std::io::{Read, Write};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};

use nix::sys::stat::Mode;
use nix::unistd::{self, ForkResult, Pid};

use crate::error::SetupError;

/// Minimal handshake payload sent to a library-mode client once the
/// daemon is ready to accept its ring buffer fds: just enough for the
/// client to know where to find the shared memfd-backed ring (spec
/// §4.14 "library-mode handoff").
#[derive(Debug, Clone)]
pub struct ProfilerInfo {
    pub ring_buffer_path: PathBuf,
    pub ring_buffer_size: usize,
}

impl ProfilerInfo {
    fn encode(&self) -> String {
        format!("{}\n{}\n", self.ring_buffer_path.display(), self.ring_buffer_size)
    }

    fn decode(text: &str) -> Option<Self> {
        let mut lines = text.lines();
        let path = lines.next()?;
        let size = lines.next()?.parse().ok()?;
        Some(ProfilerInfo {
            ring_buffer_path: PathBuf::from(path),
            ring_buffer_size: size,
        })
    }
}

/// Detaches the current process from its controlling terminal via the
/// standard double-fork: the first fork's child calls `setsid` to become
/// a session leader (escaping the parent's process group), then forks
/// again so the final daemon can never reacquire a controlling terminal.
/// The original process exits immediately after the first fork so the
/// caller's shell doesn't block on it.
///
/// `on_child_ready` runs in the final daemon process after it has
/// detached, and is the hook for closing inherited fds / chdir("/") /
/// redirecting stdio to `/dev/null` before the real work starts.
pub fn daemonize(on_child_ready: impl FnOnce()) -> Result<(), SetupError> {
    match unsafe { unistd::fork() }.map_err(to_setup_error)? {
        ForkResult::Parent { .. } => {
            std::process::exit(0);
        }
        ForkResult::Child => {}
    }

    unistd::setsid().map_err(to_setup_error)?;

    match unsafe { unistd::fork() }.map_err(to_setup_error)? {
        ForkResult::Parent { .. } => {
            std::process::exit(0);
        }
        ForkResult::Child => {}
    }

    unistd::chdir("/").map_err(to_setup_error)?;
    let _ = unistd::umask(Mode::from_bits_truncate(0o027));
    redirect_stdio_to_dev_null().map_err(SetupError::Daemonize)?;

    on_child_ready();
    Ok(())
}

fn redirect_stdio_to_dev_null() -> std::io::Result<()> {
    use std::os::fd::AsRawFd;
    let dev_null = std::fs::OpenOptions::new().read(true).write(true).open("/dev/null")?;
    let fd = dev_null.as_raw_fd();
    for target in [libc::STDIN_FILENO, libc::STDOUT_FILENO, libc::STDERR_FILENO] {
        unsafe {
            if libc::dup2(fd, target) < 0 {
                return Err(std::io::Error::last_os_error());
            }
        }
    }
    Ok(())
}

fn to_setup_error(e: nix::Error) -> SetupError {
    SetupError::Daemonize(std::io::Error::from_raw_os_error(e as i32))
}

/// Serves the library-mode handoff socket: accepts one connection at a
/// time from an instrumented process asking to be profiled, and replies
/// with the [`ProfilerInfo`] it should mmap. Intended to be driven from
/// the supervisor's epoll loop alongside the signalfd it already polls.
pub struct HandoffServer {
    listener: UnixListener,
}

impl HandoffServer {
    pub fn bind(socket_path: &Path) -> Result<Self, SetupError> {
        if socket_path.exists() {
            let _ = std::fs::remove_file(socket_path);
        }
        let listener = UnixListener::bind(socket_path).map_err(|source| SetupError::SocketBind {
            path: socket_path.display().to_string(),
            source,
        })?;
        Ok(HandoffServer { listener })
    }

    pub fn accept_and_reply(&self, info: &ProfilerInfo) -> std::io::Result<()> {
        let (mut stream, _) = self.listener.accept()?;
        stream.write_all(info.encode().as_bytes())?;
        Ok(())
    }

    /// Puts the listener in non-blocking mode so a caller can poll it
    /// inside a loop that also checks a shutdown flag.
    pub fn listener_set_nonblocking(&self) -> std::io::Result<()> {
        self.listener.set_nonblocking(true)
    }
}

/// Client-side half of the handoff: connects to a running daemon's
/// socket and reads back the [`ProfilerInfo`] to mmap.
pub fn request_profiler_info(socket_path: &Path) -> std::io::Result<ProfilerInfo> {
    let mut stream = UnixStream::connect(socket_path)?;
    let mut text = String::new();
    stream.read_to_string(&mut text)?;
    ProfilerInfo::decode(&text)
        .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::InvalidData, "malformed handoff payload"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn profiler_info_round_trips_through_encode_decode() {
        let info = ProfilerInfo {
            ring_buffer_path: PathBuf::from("/dev/shm/sprofd-ring-42"),
            ring_buffer_size: 1 << 20,
        };
        let decoded = ProfilerInfo::decode(&info.encode()).unwrap();
        assert_eq!(decoded.ring_buffer_path, info.ring_buffer_path);
        assert_eq!(decoded.ring_buffer_size, info.ring_buffer_size);
    }

    #[test]
    fn handoff_server_replies_over_a_real_socket() {
        let dir = tempfile::tempdir().unwrap();
        let socket_path = dir.path().join("handoff.sock");
        let server = HandoffServer::bind(&socket_path).unwrap();

        let info = ProfilerInfo {
            ring_buffer_path: PathBuf::from("/dev/shm/sprofd-ring-7"),
            ring_buffer_size: 4096,
        };

        let socket_path_clone = socket_path.clone();
        let handle = std::thread::spawn(move || request_profiler_info(&socket_path_clone).unwrap());

        server.accept_and_reply(&info).unwrap();
        let received = handle.join().unwrap();
        assert_eq!(received.ring_buffer_path, info.ring_buffer_path);
        assert_eq!(received.ring_buffer_size, info.ring_buffer_size);
    }

    #[test]
    fn decode_rejects_malformed_payload() {
        assert!(ProfilerInfo::decode("garbage").is_none());
    }
}
