//! Local ssh-agent socket.
//!
//! Provides the Unix domain socket that ssh clients in the guest connect to
//! through `SSH_AUTH_SOCK`, and the per-connection sessions behind it.

pub mod server;
pub mod session;

pub use server::{Server, ServerConfig};
