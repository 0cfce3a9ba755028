//! Error types shared across the application.

use std::fmt::{Display, Formatter};

/// Shared application result type.
pub type Result<T> = std::result::Result<T, AppError>;

/// Application error enumeration covering all domain failure modes.
#[derive(Debug)]
pub enum AppError {
    /// Configuration parsing or validation failure. Fatal before serving.
    Config(String),
    /// Listening socket or client connection failure.
    Ipc(String),
    /// A frame ended before its declared length was read.
    Truncated(String),
    /// Write, read, or timeout failure against a live helper process.
    Helper(String),
    /// The helper could not be started after the given number of attempts.
    HelperUnavailable(usize),
    /// Consecutive request failures exhausted the retry budget.
    GaveUp(u32),
    /// The operation was abandoned because shutdown was requested.
    Cancelled,
    /// File-system or I/O operation failure.
    Io(String),
}

impl Display for AppError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Config(msg) => write!(f, "config: {msg}"),
            Self::Ipc(msg) => write!(f, "ipc: {msg}"),
            Self::Truncated(msg) => write!(f, "truncated stream: {msg}"),
            Self::Helper(msg) => write!(f, "helper: {msg}"),
            Self::HelperUnavailable(attempts) => {
                write!(f, "failed to invoke helper {attempts} times; give up")
            }
            Self::GaveUp(failures) => {
                write!(f, "request failed {failures} times in a row; give up")
            }
            Self::Cancelled => write!(f, "cancelled"),
            Self::Io(msg) => write!(f, "io: {msg}"),
        }
    }
}

impl std::error::Error for AppError {}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

impl From<toml::de::Error> for AppError {
    fn from(err: toml::de::Error) -> Self {
        Self::Config(format!("invalid config: {err}"))
    }
}
