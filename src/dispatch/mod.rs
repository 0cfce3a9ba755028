//! Serialized request dispatch to the helper.
//!
//! Client sessions submit [`Request`]s into one unbounded queue. A single
//! [`Dispatcher`](dispatcher::Dispatcher) task pulls them in order and runs
//! each round-trip against the current helper generation, because the host
//! agent cannot tell interleaved requests apart.
//!
//! Every request carries a one-shot result slot. The dispatcher either
//! sends the helper's reply into it or drops it; a dropped slot tells the
//! session to close its connection.

pub mod dispatcher;

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};

pub use dispatcher::{round_trip, DispatchConfig, DispatchOutcome, Dispatcher};

/// Producer side of the request queue, cloned into every client session.
pub type RequestSender = mpsc::UnboundedSender<Request>;

/// Consumer side of the request queue, owned by the dispatcher.
pub type RequestQueue = mpsc::UnboundedReceiver<Request>;

/// Create the request queue.
#[must_use]
pub fn request_queue() -> (RequestSender, RequestQueue) {
    mpsc::unbounded_channel()
}

/// One framed client request and the slot its reply goes to.
#[derive(Debug)]
pub struct Request {
    frame: Bytes,
    reply: oneshot::Sender<Bytes>,
}

impl Request {
    /// Pair `frame` with a fresh result slot. The receiver yields the reply,
    /// or an error if the request is abandoned.
    #[must_use]
    pub fn new(frame: Bytes) -> (Self, oneshot::Receiver<Bytes>) {
        let (reply, rx) = oneshot::channel();
        (Self { frame, reply }, rx)
    }

    /// The complete request frame, header included.
    #[must_use]
    pub fn frame(&self) -> &Bytes {
        &self.frame
    }

    /// Deliver the reply. A session that already went away is not an error.
    pub fn respond(self, reply: Bytes) {
        let _ = self.reply.send(reply);
    }
}
