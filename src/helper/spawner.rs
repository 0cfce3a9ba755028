//! Helper process spawner.
//!
//! [`HelperChannel::acquire`] produces one handshaken [`HelperProcess`]
//! per call, trying up to `wait_times.len()` times with an escalating
//! timeout per attempt. A slow interpreter on a loaded host gets more room
//! on each retry, while a healthy start never waits longer than it needs.
//!
//! Each attempt:
//! 1. Spawns the helper with piped stdio and `kill_on_drop(true)`.
//! 2. Sends the bootstrap script and waits for the ready sentinel, both
//!    bounded by the attempt's timeout.
//! 3. Sends the endpoint record when one is configured.
//!
//! A failed attempt kills and reaps the partial process before the next
//! one starts. Stderr of every generation is forwarded into the log.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::helper::handshake;
use crate::{AppError, Result};

/// Bootstrap script written to the helper's stdin after spawn.
pub const BOOTSTRAP_SCRIPT: &str = include_str!("repeater.ps1");

/// Arguments that put `powershell.exe` into "read commands from stdin" mode.
pub const DEFAULT_HELPER_ARGS: &[&str] = &["-Command", "-"];

/// Host named pipe served by the Windows OpenSSH agent.
pub const DEFAULT_ENDPOINT: &str = "openssh-ssh-agent";

/// Per-attempt handshake timeouts.
pub const DEFAULT_WAIT_TIMES: [Duration; 3] = [
    Duration::from_secs(3),
    Duration::from_secs(6),
    Duration::from_secs(10),
];

// ── Configuration ────────────────────────────────────────────────────────────

/// Configuration for launching the helper process.
#[derive(Debug, Clone)]
pub struct HelperConfig {
    /// Helper executable (normally `powershell.exe`).
    pub program: PathBuf,
    /// Arguments selecting the interactive stdin-reading mode.
    pub args: Vec<String>,
    /// Script text written to stdin right after spawn.
    pub bootstrap: String,
    /// Host endpoint announced after the handshake; `None` skips the record.
    pub endpoint: Option<String>,
    /// One handshake timeout per attempt. Its length is the attempt count.
    pub wait_times: Vec<Duration>,
}

impl HelperConfig {
    /// Configuration with the default arguments, script, endpoint and
    /// timeouts for `program`.
    #[must_use]
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: DEFAULT_HELPER_ARGS.iter().map(|&a| a.to_owned()).collect(),
            bootstrap: BOOTSTRAP_SCRIPT.to_owned(),
            endpoint: Some(DEFAULT_ENDPOINT.to_owned()),
            wait_times: DEFAULT_WAIT_TIMES.to_vec(),
        }
    }
}

// ── Process handle ───────────────────────────────────────────────────────────

/// One live, handshaken helper generation.
///
/// Only the dispatcher task touches the pipes. Dropping the handle kills
/// the process; [`HelperProcess::terminate`] does so gracefully.
#[derive(Debug)]
pub struct HelperProcess {
    generation: u64,
    child: Child,
    /// Helper's stdin; request frames are written here.
    pub stdin: ChildStdin,
    /// Helper's stdout; reply frames are read from here.
    pub stdout: ChildStdout,
}

impl HelperProcess {
    /// Sequence number of this generation, starting at 1.
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// OS process id, if the process has not been reaped yet.
    #[must_use]
    pub fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    /// Close stdin, then kill and reap the process.
    ///
    /// Never fails from the caller's point of view. A kill failure means the
    /// OS refused to signal our own child and is logged at `error` level.
    pub async fn terminate(self) {
        let Self {
            generation,
            mut child,
            stdin,
            stdout,
        } = self;

        // End-of-input first so a well-behaved helper can wind down.
        drop(stdin);
        drop(stdout);

        if let Err(err) = child.kill().await {
            error!(generation, %err, "failed to kill helper process");
            return;
        }
        info!(generation, "helper terminated");
    }
}

// ── Channel ──────────────────────────────────────────────────────────────────

/// Factory for helper generations.
#[derive(Debug)]
pub struct HelperChannel {
    config: HelperConfig,
    generation: u64,
}

impl HelperChannel {
    /// Create a channel that launches helpers according to `config`.
    #[must_use]
    pub fn new(config: HelperConfig) -> Self {
        Self {
            config,
            generation: 0,
        }
    }

    /// Start a new helper generation and complete its handshake.
    ///
    /// # Errors
    ///
    /// - [`AppError::HelperUnavailable`] once every attempt has failed.
    /// - [`AppError::Cancelled`] if `cancel` fires first. The half-started
    ///   process is killed when its handle drops.
    pub async fn acquire(&mut self, cancel: &CancellationToken) -> Result<HelperProcess> {
        let attempts = self.config.wait_times.len();

        for (i, &limit) in self.config.wait_times.iter().enumerate() {
            info!(
                program = %self.config.program.display(),
                "invoking helper{}",
                trial(i, attempts)
            );

            let generation = self.generation + 1;
            let outcome = tokio::select! {
                biased;
                () = cancel.cancelled() => return Err(AppError::Cancelled),
                outcome = start(&self.config, limit, generation) => outcome,
            };

            match outcome {
                Ok((child, stdin, stdout)) => {
                    self.generation = generation;
                    info!(generation, pid = ?child.id(), "helper invoked successfully");
                    return Ok(HelperProcess {
                        generation,
                        child,
                        stdin,
                        stdout,
                    });
                }
                Err(err) => warn!(%err, "helper attempt failed"),
            }
        }

        Err(AppError::HelperUnavailable(attempts))
    }
}

// ── Private helpers ───────────────────────────────────────────────────────────

/// One spawn + handshake attempt. Kills and reaps the child on failure.
async fn start(
    config: &HelperConfig,
    limit: Duration,
    generation: u64,
) -> Result<(Child, ChildStdin, ChildStdout)> {
    let mut child = Command::new(&config.program)
        .args(&config.args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| {
            AppError::Helper(format!(
                "failed to spawn {}: {e}",
                config.program.display()
            ))
        })?;

    if let Some(stderr) = child.stderr.take() {
        forward_stderr(stderr, generation);
    }

    match handshake_child(&mut child, config, limit).await {
        Ok((stdin, stdout)) => Ok((child, stdin, stdout)),
        Err(err) => {
            kill_and_reap(&mut child).await;
            Err(err)
        }
    }
}

async fn handshake_child(
    child: &mut Child,
    config: &HelperConfig,
    limit: Duration,
) -> Result<(ChildStdin, ChildStdout)> {
    let mut stdin = child
        .stdin
        .take()
        .ok_or_else(|| AppError::Helper("failed to capture helper stdin".into()))?;
    let mut stdout = child
        .stdout
        .take()
        .ok_or_else(|| AppError::Helper("failed to capture helper stdout".into()))?;

    // Bootstrap write and sentinel wait share one deadline.
    let deadline = tokio::time::Instant::now() + limit;
    tokio::time::timeout_at(deadline, handshake::send_bootstrap(&mut stdin, &config.bootstrap))
        .await
        .map_err(|_| AppError::Helper(format!("helper did not respond within {limit:?}")))??;

    let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
    handshake::wait_for_sentinel(&mut stdout, remaining).await?;

    if let Some(endpoint) = config.endpoint.as_deref() {
        handshake::send_endpoint(&mut stdin, endpoint).await?;
    }

    Ok((stdin, stdout))
}

/// Kill a partially started helper; errors from an already dead process
/// are irrelevant here.
async fn kill_and_reap(child: &mut Child) {
    if let Err(err) = child.kill().await {
        debug!(%err, "kill of partial helper failed");
    }
}

/// Copy each stderr line of the helper into the log until the pipe closes.
fn forward_stderr(stderr: ChildStderr, generation: u64) {
    tokio::spawn(async move {
        let mut reader = BufReader::new(stderr);
        let mut line = Vec::new();
        loop {
            line.clear();
            match reader.read_until(b'\n', &mut line).await {
                Ok(0) => break,
                Ok(_) => {
                    let text = String::from_utf8_lossy(&line);
                    info!(target: "helper", generation, "[W] {}", text.trim_end());
                }
                Err(err) => {
                    debug!(generation, %err, "helper stderr closed");
                    break;
                }
            }
        }
    });
}

fn trial(i: usize, attempts: usize) -> String {
    if i == 0 {
        String::new()
    } else {
        format!(" (trial {}/{attempts})", i + 1)
    }
}
