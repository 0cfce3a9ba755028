//! Dispatcher task.
//!
//! Drives queued requests one at a time through the current helper
//! generation:
//!
//! - The helper is started lazily, when the first request arrives, and
//!   again right after a generation fails.
//! - A request whose round-trip fails (write error, read error, truncated
//!   reply, read deadline) is kept as pending and retried first against
//!   the next generation, before any newer request.
//! - Each failed retry counts against `max_request_failures`; a successful
//!   round-trip resets the count. Running out of budget, or failing to start
//!   a helper at all, is a permanent give-up.
//! - Shutdown does not interrupt the drain: requests already queued are
//!   still served by the live generation until the queue closes. Once
//!   cancelled, a failed generation is not replaced and its request is
//!   not retried.
//! - On give-up, or on a failure after cancellation, every pending and
//!   queued request has its slot closed and the queue stops accepting.
//!   Give-up also fires the shared cancellation token so the acceptor
//!   winds down too.

use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::dispatch::{Request, RequestQueue};
use crate::helper::{HelperChannel, HelperProcess};
use crate::protocol::codec::read_frame;
use crate::{AppError, Result};

/// Default deadline for one helper round-trip.
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(10);

/// Default number of consecutive failed retries before giving up.
pub const DEFAULT_MAX_REQUEST_FAILURES: u32 = 3;

/// Tunables for the dispatch loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchConfig {
    /// Deadline for writing a request and reading its reply.
    pub read_timeout: Duration,
    /// Consecutive failed retries tolerated before giving up.
    pub max_request_failures: u32,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            read_timeout: DEFAULT_READ_TIMEOUT,
            max_request_failures: DEFAULT_MAX_REQUEST_FAILURES,
        }
    }
}

/// How the dispatch loop ended.
#[derive(Debug)]
pub enum DispatchOutcome {
    /// The queue was closed and fully served.
    Completed,
    /// Shutdown was requested and the next request needed a new generation.
    Cancelled,
    /// The helper could not be kept alive; carries the terminal error.
    GaveUp(AppError),
}

/// Owner of the request queue and of the helper generations.
#[derive(Debug)]
pub struct Dispatcher {
    channel: HelperChannel,
    config: DispatchConfig,
    queue: RequestQueue,
    cancel: CancellationToken,
}

impl Dispatcher {
    /// Create a dispatcher serving `queue` with helpers from `channel`.
    #[must_use]
    pub fn new(
        channel: HelperChannel,
        config: DispatchConfig,
        queue: RequestQueue,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            channel,
            config,
            queue,
            cancel,
        }
    }

    /// Run the dispatch loop on its own task.
    #[must_use]
    pub fn spawn(self) -> JoinHandle<DispatchOutcome> {
        tokio::spawn(self.run())
    }

    /// Run the dispatch loop until the queue closes, the helper is given up
    /// on, or a request would need a new generation after shutdown. The
    /// last helper generation is always terminated before returning.
    pub async fn run(mut self) -> DispatchOutcome {
        let mut helper = None;
        let mut pending = None;

        let outcome = self.serve(&mut helper, &mut pending).await;

        if let Some(process) = helper.take() {
            process.terminate().await;
        }

        match outcome {
            DispatchOutcome::Completed => info!("request queue closed; dispatcher done"),
            DispatchOutcome::Cancelled => {
                info!("dispatcher cancelled");
                self.abort(pending).await;
            }
            DispatchOutcome::GaveUp(ref err) => {
                error!(%err, "dispatcher gave up");
                self.cancel.cancel();
                self.abort(pending).await;
            }
        }

        outcome
    }

    async fn serve(
        &mut self,
        helper: &mut Option<HelperProcess>,
        pending: &mut Option<Request>,
    ) -> DispatchOutcome {
        let mut failures = 0u32;

        loop {
            let retrying = pending.is_some();
            let request = match pending.take() {
                Some(request) => request,
                None => match self.queue.recv().await {
                    Some(request) => request,
                    None => return DispatchOutcome::Completed,
                },
            };

            let mut process = match helper.take() {
                Some(process) => process,
                None => match self.channel.acquire(&self.cancel).await {
                    Ok(process) => process,
                    Err(AppError::Cancelled) => {
                        *pending = Some(request);
                        return DispatchOutcome::Cancelled;
                    }
                    Err(err) => {
                        *pending = Some(request);
                        return DispatchOutcome::GaveUp(err);
                    }
                },
            };

            let result = round_trip(
                &mut process.stdin,
                &mut process.stdout,
                request.frame(),
                self.config.read_timeout,
            )
            .await;

            match result {
                Ok(reply) => {
                    failures = 0;
                    request.respond(reply);
                    *helper = Some(process);
                }
                Err(err) => {
                    let generation = process.generation();
                    warn!(generation, %err, "helper round-trip failed");
                    process.terminate().await;
                    *pending = Some(request);

                    if retrying {
                        failures += 1;
                        warn!(
                            "failed to process request ({failures}/{})",
                            self.config.max_request_failures
                        );
                        if failures >= self.config.max_request_failures {
                            return DispatchOutcome::GaveUp(AppError::GaveUp(failures));
                        }
                    }

                    if self.cancel.is_cancelled() {
                        return DispatchOutcome::Cancelled;
                    }
                    info!(generation, "helper terminated; retry");
                }
            }
        }
    }

    /// Close the queue and release every outstanding result slot.
    async fn abort(&mut self, pending: Option<Request>) {
        let mut released = usize::from(pending.is_some());
        drop(pending);

        self.queue.close();
        while let Some(request) = self.queue.recv().await {
            drop(request);
            released += 1;
        }

        if released > 0 {
            info!(released, "aborted outstanding requests");
        }
    }
}

/// Write one request frame and read exactly one reply frame, both within
/// `deadline`.
///
/// # Errors
///
/// Returns [`AppError::Helper`] on write failure, read failure, truncated
/// reply, or when `deadline` elapses. The helper stream is unusable after
/// any of these.
pub async fn round_trip<W, R>(
    stdin: &mut W,
    stdout: &mut R,
    frame: &[u8],
    deadline: Duration,
) -> Result<Bytes>
where
    W: AsyncWrite + Unpin,
    R: AsyncRead + Unpin,
{
    let exchange = async {
        stdin
            .write_all(frame)
            .await
            .map_err(|e| AppError::Helper(format!("failed to write to helper: {e}")))?;
        stdin
            .flush()
            .await
            .map_err(|e| AppError::Helper(format!("failed to write to helper: {e}")))?;
        debug!(bytes = frame.len(), "[L] -> [W]");

        let reply = read_frame(stdout)
            .await
            .map_err(|e| AppError::Helper(format!("failed to read from helper: {e}")))?;
        debug!(bytes = reply.len(), "[L] <- [W]");
        Ok(reply)
    };

    tokio::time::timeout(deadline, exchange)
        .await
        .map_err(|_| AppError::Helper(format!("no reply from helper within {deadline:?}")))?
}
