//! Host-side helper process management.
//!
//! The helper is an interpreter on the host (Windows PowerShell under WSL2)
//! that is fed a small relay script. Once the script signals readiness, the
//! helper's stdin/stdout become a transparent byte pipe to the host's
//! ssh-agent.
//!
//! - `handshake`: bootstrap script, ready sentinel, endpoint record.
//! - `spawner`: [`HelperChannel`](spawner::HelperChannel) with its attempt
//!   schedule, and the [`HelperProcess`](spawner::HelperProcess) handle.

pub mod handshake;
pub mod spawner;

pub use spawner::{HelperChannel, HelperConfig, HelperProcess};
