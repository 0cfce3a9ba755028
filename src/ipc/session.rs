//! Per-connection client session.
//!
//! Reads framed requests from one ssh client, answers shimmed message types
//! locally, and forwards everything else through the shared request queue.
//! Replies are written back verbatim and only once they were fully read
//! from the helper, so a client never sees a partial frame.

use futures_util::StreamExt;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio_util::codec::FramedRead;
use tracing::{debug, info, warn};

use crate::dispatch::{Request, RequestSender};
use crate::protocol::codec::{
    encode_dummy_success, message_type, FrameCodec, SSH_AGENTC_EXTENSION,
};

/// Serve one client connection until it closes, or the dispatcher abandons
/// its request or closes the queue.
///
/// Shutdown alone does not end a session: requests keep being served while
/// the connection is open, as long as the dispatcher runs.
///
/// With `shim` enabled, `SSH_AGENTC_EXTENSION` requests (sent by OpenSSH
/// 8.9 and newer) are answered with a dummy `SSH_AGENT_SUCCESS` and never
/// reach the helper. Older host agents drop the connection on that message.
pub async fn run_session<R, W>(
    reader: R,
    mut writer: W,
    queue: RequestSender,
    shim: bool,
) where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut frames = FramedRead::new(reader, FrameCodec::new());

    loop {
        let next = tokio::select! {
            biased;
            () = queue.closed() => {
                debug!("session: request queue closed");
                break;
            }
            next = frames.next() => next,
        };

        let frame = match next {
            None => break,
            Some(Err(err)) => {
                debug!(%err, "session: client stream ended");
                break;
            }
            Some(Ok(frame)) => frame,
        };
        debug!(bytes = frame.len(), "ssh -> [L]");

        if shim && message_type(&frame) == Some(SSH_AGENTC_EXTENSION) {
            if let Err(err) = writer.write_all(&encode_dummy_success()).await {
                warn!(%err, "failed to write to ssh");
                break;
            }
            debug!("ssh <- [L] (5 B) <dummy for OpenSSH ext.>");
            continue;
        }

        let (request, result) = Request::new(frame);
        if queue.send(request).is_err() {
            info!("request queue closed");
            break;
        }

        let Ok(reply) = result.await else {
            info!("failed to get result");
            break;
        };

        if let Err(err) = writer.write_all(&reply).await {
            warn!(%err, "failed to write to ssh");
            break;
        }
        debug!(bytes = reply.len(), "ssh <- [L]");
    }

    let _ = writer.shutdown().await;
    info!("ssh: closed");
}
