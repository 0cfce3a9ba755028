//! ssh-agent socket server.
//!
//! Listens on a filesystem-path local socket (a Unix domain socket on
//! Linux) using the `interprocess` crate, spawns one
//! [`run_session`] task per connection, and owns the dispatcher task.
//!
//! ## Shutdown order
//!
//! 1. The cancellation token fires (signal, or dispatcher give-up).
//! 2. The accept loop stops and the listener is dropped.
//! 3. Sessions finish when their clients disconnect. Until then they are
//!    still served. If the dispatcher closes the queue (give-up), waiting
//!    sessions see a closed result slot and idle ones a closed queue.
//! 4. The last queue sender is dropped.
//! 5. The dispatcher drains what is left, terminates its helper and
//!    returns.

use std::path::{Path, PathBuf};

use interprocess::local_socket::{tokio::prelude::*, GenericFilePath, ListenerOptions};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::dispatch::{request_queue, DispatchConfig, DispatchOutcome, Dispatcher};
use crate::helper::{HelperChannel, HelperConfig};
use crate::ipc::session::run_session;
use crate::{AppError, Result};

/// Everything the core needs to serve.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Filesystem path of the listening socket.
    pub socket_path: PathBuf,
    /// Answer `SSH_AGENTC_EXTENSION` locally.
    pub shim: bool,
    /// Helper launch settings.
    pub helper: HelperConfig,
    /// Dispatch deadlines and retry budget.
    pub dispatch: DispatchConfig,
}

/// A bound, not yet serving, agent socket.
pub struct Server {
    config: ServerConfig,
    listener: interprocess::local_socket::tokio::Listener,
}

impl Server {
    /// Bind the listening socket.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Ipc`] if the path is not a valid socket name or
    /// the socket cannot be created (for example because the file exists).
    pub fn bind(config: ServerConfig) -> Result<Self> {
        let path = config.socket_path.as_path();
        let name = path.to_fs_name::<GenericFilePath>().map_err(|err| {
            AppError::Ipc(format!("invalid socket path '{}': {err}", path.display()))
        })?;

        let listener = ListenerOptions::new()
            .name(name)
            .create_tokio()
            .map_err(|err| {
                AppError::Ipc(format!("failed to listen on {}: {err}", path.display()))
            })?;

        info!(path = %path.display(), "start listening");
        Ok(Self { config, listener })
    }

    /// Serve until `cancel` fires or the dispatcher gives up, then wait for
    /// the remaining clients to disconnect.
    ///
    /// # Errors
    ///
    /// Returns the dispatcher's terminal error ([`AppError::HelperUnavailable`]
    /// or [`AppError::GaveUp`]) when the helper could not be kept alive, or
    /// [`AppError::Io`] if the dispatcher task panicked.
    pub async fn run(self, cancel: CancellationToken) -> Result<()> {
        let Self { config, listener } = self;

        let (queue_tx, queue_rx) = request_queue();
        let dispatcher = Dispatcher::new(
            HelperChannel::new(config.helper.clone()),
            config.dispatch,
            queue_rx,
            cancel.clone(),
        )
        .spawn();

        let sessions = TaskTracker::new();
        let mut next_conn = 0u64;

        loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => {
                    info!("shutdown");
                    break;
                }
                accepted = listener.accept() => match accepted {
                    Ok(stream) => {
                        next_conn += 1;
                        let span = info_span!("ssh_conn", conn = next_conn);
                        span.in_scope(|| info!("ssh: connected"));

                        let (reader, writer) = stream.split();
                        sessions.spawn(
                            run_session(reader, writer, queue_tx.clone(), config.shim)
                                .instrument(span),
                        );
                    }
                    Err(err) => {
                        warn!(%err, "failed to accept");
                        cancel.cancel();
                        break;
                    }
                },
            }
        }

        drop(listener);
        remove_socket_file(&config.socket_path);

        sessions.close();
        sessions.wait().await;
        debug!(connections = next_conn, "all ssh sessions finished");

        drop(queue_tx);
        let outcome = dispatcher
            .await
            .map_err(|err| AppError::Io(format!("dispatcher task failed: {err}")))?;

        match outcome {
            DispatchOutcome::Completed | DispatchOutcome::Cancelled => Ok(()),
            DispatchOutcome::GaveUp(err) => Err(err),
        }
    }
}

/// The listener normally unlinks its own socket file; this covers the
/// platforms and versions where it does not.
fn remove_socket_file(path: &Path) {
    match std::fs::remove_file(path) {
        Ok(()) => debug!(path = %path.display(), "socket file removed"),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => warn!(path = %path.display(), %err, "failed to remove socket file"),
    }
}
