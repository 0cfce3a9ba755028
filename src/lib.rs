#![forbid(unsafe_code)]

//! Forward the host's ssh-agent into a WSL2 guest.
//!
//! The guest side listens on a Unix domain socket, multiplexes every client
//! request onto one host-side helper process, and restarts that helper when
//! it fails. See [`ipc::Server`] for the entry point.

pub mod config;
#[cfg(unix)]
pub mod daemon;
pub mod dispatch;
pub mod errors;
pub mod helper;
#[cfg(unix)]
pub mod instance;
pub mod ipc;
pub mod probe;
pub mod protocol;

pub use config::GlobalConfig;
pub use errors::{AppError, Result};
