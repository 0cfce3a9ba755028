//! Length-prefixed framing for the ssh-agent wire protocol.
//!
//! Every message on both the client socket and the helper pipe is:
//!
//! ```text
//! uint32                   message length (network order)
//! byte                     message type
//! byte[message length - 1] message contents
//! ```
//!
//! Frames are passed around whole (header included) so they can be written
//! back verbatim. The length field is trusted as given; the protocol itself
//! defines no upper bound.
//!
//! Two entry points share the same framing rules:
//!
//! - [`read_frame`] pulls exactly one frame from an [`AsyncRead`]. The
//!   dispatcher uses it against the helper's stdout so that nothing past
//!   the reply is consumed.
//! - [`FrameCodec`] is a [`Decoder`] for [`tokio_util::codec::FramedRead`]
//!   over client connections, where frames may arrive in pieces.

use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio_util::codec::Decoder;

use crate::{AppError, Result};

/// Size of the big-endian length prefix.
pub const HEADER_LEN: usize = 4;

/// `SSH_AGENT_SUCCESS` reply type.
pub const SSH_AGENT_SUCCESS: u8 = 6;

/// `SSH_AGENTC_EXTENSION` request type (OpenSSH 8.9+).
pub const SSH_AGENTC_EXTENSION: u8 = 0x1b;

const DUMMY_SUCCESS: [u8; 5] = [0, 0, 0, 1, SSH_AGENT_SUCCESS];

/// Upper bound on buffer space reserved ahead of body bytes actually
/// received. Larger frames grow the buffer as data arrives.
const MAX_RESERVE: usize = 64 * 1024;

/// The fixed 5-byte `SSH_AGENT_SUCCESS` frame used to answer shimmed
/// requests locally.
#[must_use]
pub fn encode_dummy_success() -> Bytes {
    Bytes::from_static(&DUMMY_SUCCESS)
}

/// Prefix `body` with its big-endian `u32` length.
///
/// # Errors
///
/// Returns [`AppError::Io`] if `body` is longer than `u32::MAX` bytes.
pub fn encode_frame(body: &[u8]) -> Result<Bytes> {
    let len = u32::try_from(body.len())
        .map_err(|_| AppError::Io(format!("frame body too large: {} bytes", body.len())))?;
    let mut buf = BytesMut::with_capacity(HEADER_LEN + body.len());
    buf.put_u32(len);
    buf.put_slice(body);
    Ok(buf.freeze())
}

/// Message type byte of a complete frame, or `None` for an empty body.
#[must_use]
pub fn message_type(frame: &[u8]) -> Option<u8> {
    frame.get(HEADER_LEN).copied()
}

/// Read exactly one frame (header + body) from `reader`.
///
/// # Errors
///
/// - [`AppError::Truncated`] if the stream closes before the header or the
///   full body is available. This is how a client disconnect or a helper
///   crash normally shows up.
/// - [`AppError::Io`] for any other read failure.
pub async fn read_frame<R>(reader: &mut R) -> Result<Bytes>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; HEADER_LEN];
    reader
        .read_exact(&mut header)
        .await
        .map_err(|e| map_read_error(&e, HEADER_LEN))?;

    let declared = u32::from_be_bytes(header);
    let body_len = declared as usize;
    let mut frame = Vec::with_capacity(HEADER_LEN + body_len.min(MAX_RESERVE));
    frame.extend_from_slice(&header);

    let read = reader
        .take(u64::from(declared))
        .read_to_end(&mut frame)
        .await
        .map_err(|e| map_read_error(&e, body_len))?;
    if read < body_len {
        return Err(AppError::Truncated(format!(
            "stream closed after {read} of {body_len} body bytes"
        )));
    }

    Ok(Bytes::from(frame))
}

/// Streaming decoder for ssh-agent frames.
///
/// Yields each complete frame including its length prefix. A stream that
/// ends between frames is a clean close; a stream that ends inside a frame
/// is reported as [`AppError::Truncated`].
#[derive(Debug, Default)]
pub struct FrameCodec;

impl FrameCodec {
    /// Create a new `FrameCodec`.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl Decoder for FrameCodec {
    type Item = Bytes;
    type Error = AppError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        if src.len() < HEADER_LEN {
            return Ok(None);
        }

        let mut header = [0u8; HEADER_LEN];
        header.copy_from_slice(&src[..HEADER_LEN]);
        let total = HEADER_LEN + u32::from_be_bytes(header) as usize;

        if src.len() < total {
            src.reserve((total - src.len()).min(MAX_RESERVE));
            return Ok(None);
        }

        Ok(Some(src.split_to(total).freeze()))
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        match self.decode(src)? {
            Some(frame) => Ok(Some(frame)),
            None if src.is_empty() => Ok(None),
            None => Err(AppError::Truncated(format!(
                "stream closed with {} bytes of an incomplete frame",
                src.len()
            ))),
        }
    }
}

// ── Private helper ────────────────────────────────────────────────────────────

fn map_read_error(err: &std::io::Error, wanted: usize) -> AppError {
    if err.kind() == std::io::ErrorKind::UnexpectedEof {
        AppError::Truncated(format!("stream closed before {wanted} bytes were read"))
    } else {
        AppError::Io(err.to_string())
    }
}
