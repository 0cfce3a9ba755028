//! Single-instance detection and `--stop`.
//!
//! Runs before the server is constructed. An existing server is found by
//! connecting to the socket path and asking the kernel for the peer's
//! credentials (`SO_PEERCRED`), which yields the server's pid without any
//! pid file.

use std::io::ErrorKind;
use std::os::unix::net::UnixStream;
use std::path::Path;
use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tracing::info;

use crate::{AppError, Result};

/// Interval between liveness checks while waiting for a stopped server.
const STOP_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Find the pid of a server already listening on `path`.
///
/// A socket file nobody listens on is left over from a crashed server and
/// is removed.
///
/// # Errors
///
/// - [`AppError::Ipc`] if connecting fails for another reason, or the peer
///   pid cannot be read.
/// - [`AppError::Io`] if a stale socket cannot be removed.
pub fn find_running_server(path: &Path) -> Result<Option<i32>> {
    match UnixStream::connect(path) {
        Ok(stream) => peer_pid(&stream).map(Some),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
        Err(err) if err.kind() == ErrorKind::ConnectionRefused => {
            std::fs::remove_file(path).map_err(|e| {
                AppError::Io(format!("failed to remove {}: {e}", path.display()))
            })?;
            info!(path = %path.display(), "removed stale socket");
            Ok(None)
        }
        Err(err) => Err(AppError::Ipc(format!(
            "failed to connect to {}: {err}",
            path.display()
        ))),
    }
}

/// Send SIGTERM to `pid` and wait up to `wait` for it to exit.
///
/// # Errors
///
/// Returns [`AppError::Ipc`] if the signal cannot be delivered or the
/// process is still alive after `wait`.
pub fn stop_server(pid: i32, wait: Duration) -> Result<()> {
    let target = Pid::from_raw(pid);
    kill(target, Signal::SIGTERM)
        .map_err(|err| AppError::Ipc(format!("failed to signal pid {pid}: {err}")))?;

    // Not our child, so it cannot be waited on; poll until it is gone.
    let deadline = Instant::now() + wait;
    loop {
        if kill(target, None) == Err(Errno::ESRCH) {
            return Ok(());
        }
        if Instant::now() >= deadline {
            return Err(AppError::Ipc(format!(
                "pid {pid} did not exit within {wait:?}"
            )));
        }
        std::thread::sleep(STOP_POLL_INTERVAL);
    }
}

#[cfg(target_os = "linux")]
fn peer_pid(stream: &UnixStream) -> Result<i32> {
    use nix::sys::socket::{getsockopt, sockopt::PeerCredentials};

    let cred = getsockopt(stream, PeerCredentials)
        .map_err(|err| AppError::Ipc(format!("failed to read peer credentials: {err}")))?;
    Ok(cred.pid())
}

#[cfg(not(target_os = "linux"))]
fn peer_pid(_stream: &UnixStream) -> Result<i32> {
    Err(AppError::Ipc(
        "peer credentials are only available on Linux".into(),
    ))
}
