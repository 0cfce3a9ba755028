//! Helper bootstrap handshake.
//!
//! A freshly spawned helper is an interactive interpreter with no idea what
//! to do yet. The handshake turns it into a byte pipe to the host agent:
//!
//! 1. **`send_bootstrap`** writes the bootstrap script to the helper's stdin.
//! 2. **`wait_for_sentinel`** reads stdout until the single `0xFF` byte the
//!    script prints once it is running. Anything before it (banners,
//!    warnings, profile noise) is discarded.
//! 3. **`send_endpoint`** optionally tells the script which host-side
//!    endpoint to connect to, as a length-prefixed name. No reply is
//!    expected.
//!
//! The functions are generic over the stream types so they can be driven
//! by in-memory pipes as well as child process handles.

use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

use crate::protocol::codec::encode_frame;
use crate::{AppError, Result};

/// Byte printed by the bootstrap script once it is ready to relay frames.
pub const SENTINEL: u8 = 0xFF;

/// Write the bootstrap script to the helper's stdin.
///
/// # Errors
///
/// Returns [`AppError::Helper`] if the write or flush fails, typically
/// because the process already exited.
pub async fn send_bootstrap<W>(stdin: &mut W, script: &str) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    stdin
        .write_all(script.as_bytes())
        .await
        .map_err(|e| AppError::Helper(format!("failed to send bootstrap script: {e}")))?;
    stdin
        .flush()
        .await
        .map_err(|e| AppError::Helper(format!("failed to send bootstrap script: {e}")))?;

    debug!(bytes = script.len(), "handshake: bootstrap script sent");
    Ok(())
}

/// Read from `stdout` until [`SENTINEL`] is seen or `limit` elapses.
///
/// Reads one byte at a time so that nothing after the sentinel is consumed.
/// Returns the number of discarded bytes.
///
/// # Errors
///
/// - [`AppError::Helper`]`("… did not respond within …")` on timeout.
/// - [`AppError::Helper`]`("helper exited before ready signal")` on EOF.
/// - [`AppError::Helper`] for any other read failure.
pub async fn wait_for_sentinel<R>(stdout: &mut R, limit: Duration) -> Result<usize>
where
    R: AsyncRead + Unpin,
{
    let read = async {
        let mut discarded = 0usize;
        loop {
            match stdout.read_u8().await {
                Ok(SENTINEL) => return Ok(discarded),
                Ok(_) => discarded += 1,
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                    return Err(AppError::Helper(
                        "helper exited before ready signal".into(),
                    ));
                }
                Err(e) => {
                    return Err(AppError::Helper(format!(
                        "failed to read ready signal: {e}"
                    )));
                }
            }
        }
    };

    let discarded = tokio::time::timeout(limit, read).await.map_err(|_| {
        AppError::Helper(format!("helper did not respond within {limit:?}"))
    })??;

    if discarded > 0 {
        debug!(discarded, "handshake: skipped helper output before ready signal");
    }
    Ok(discarded)
}

/// Send the host endpoint name as a length-prefixed record.
///
/// # Errors
///
/// Returns [`AppError::Helper`] if the name cannot be framed or the write
/// fails.
pub async fn send_endpoint<W>(stdin: &mut W, endpoint: &str) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let record = encode_frame(endpoint.as_bytes())
        .map_err(|e| AppError::Helper(format!("invalid endpoint name: {e}")))?;

    stdin
        .write_all(&record)
        .await
        .map_err(|e| AppError::Helper(format!("failed to send endpoint name: {e}")))?;
    stdin
        .flush()
        .await
        .map_err(|e| AppError::Helper(format!("failed to send endpoint name: {e}")))?;

    debug!(endpoint, "handshake: endpoint name sent");
    Ok(())
}
