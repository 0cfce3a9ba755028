//! Background daemonization.
//!
//! The launcher re-executes itself with [`DAEMON_CHILD_FLAG`] and a piped
//! stdout. The child starts a new session, binds the socket, writes the
//! shell line to stdout and then points stdout at `/dev/null`. That closes
//! the pipe, so the launcher's read returns exactly once: the pipe is a
//! one-shot rendezvous carrying "ready, here is your output".

use std::ffi::OsString;
use std::io::{Read, Write};
use std::os::fd::AsRawFd;
use std::path::Path;
use std::process::{Command, Stdio};

use tracing::info;

use crate::{AppError, Result};

/// Hidden flag marking the re-executed background process.
pub const DAEMON_CHILD_FLAG: &str = "--daemon-child";

/// Shell line exporting `SSH_AUTH_SOCK`.
#[must_use]
pub fn shell_output(socket_path: &Path) -> String {
    format!(
        "SSH_AUTH_SOCK={}; export SSH_AUTH_SOCK;",
        socket_path.display()
    )
}

/// Launcher side: start the background copy and wait for its output.
///
/// `args` are forwarded to the child ahead of [`DAEMON_CHILD_FLAG`].
///
/// # Errors
///
/// Returns [`AppError::Io`] if the child cannot be started, or exits
/// without reporting ready.
pub fn spawn_daemon(args: &[OsString]) -> Result<String> {
    let exe = std::env::current_exe()
        .map_err(|err| AppError::Io(format!("cannot locate own executable: {err}")))?;
    launch(&exe, args)
}

/// Start `program` with `args` and [`DAEMON_CHILD_FLAG`], and return what
/// it writes to stdout before closing it.
///
/// The child shares the launcher's stderr, so its startup errors reach the
/// terminal.
///
/// # Errors
///
/// Returns [`AppError::Io`] if the child cannot be started, or closes
/// stdout without writing anything.
pub fn launch(program: &Path, args: &[OsString]) -> Result<String> {
    let mut child = Command::new(program)
        .args(args)
        .arg(DAEMON_CHILD_FLAG)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit())
        .spawn()
        .map_err(|err| AppError::Io(format!("failed to start daemon: {err}")))?;

    let mut output = String::new();
    child
        .stdout
        .take()
        .ok_or_else(|| AppError::Io("failed to capture daemon stdout".into()))?
        .read_to_string(&mut output)
        .map_err(|err| AppError::Io(format!("failed to read daemon output: {err}")))?;

    if output.is_empty() {
        let status = child
            .wait()
            .map_err(|err| AppError::Io(format!("failed to wait for daemon: {err}")))?;
        return Err(AppError::Io(format!(
            "daemon exited before becoming ready ({status})"
        )));
    }

    info!(pid = child.id(), "daemonize: started");
    Ok(output.trim_end().to_owned())
}

/// Child side, before serving: leave the launcher's session and
/// controlling terminal.
///
/// # Errors
///
/// Returns [`AppError::Io`] if `setsid` fails.
pub fn detach() -> Result<()> {
    nix::unistd::setsid().map_err(|err| AppError::Io(format!("failed to setsid: {err}")))?;
    Ok(())
}

/// Child side, once the socket is bound: hand `output` to the launcher and
/// close the rendezvous pipe.
///
/// # Errors
///
/// Returns [`AppError::Io`] if writing the output or redirecting stdout
/// fails.
pub fn complete(output: &str) -> Result<()> {
    let mut stdout = std::io::stdout().lock();
    writeln!(stdout, "{output}")
        .and_then(|()| stdout.flush())
        .map_err(|err| AppError::Io(format!("failed to report to launcher: {err}")))?;

    let devnull = std::fs::OpenOptions::new()
        .write(true)
        .open("/dev/null")
        .map_err(|err| AppError::Io(format!("failed to open /dev/null: {err}")))?;
    nix::unistd::dup2(devnull.as_raw_fd(), stdout.as_raw_fd())
        .map_err(|err| AppError::Io(format!("failed to detach stdout: {err}")))?;

    info!("daemonize: completed");
    Ok(())
}
