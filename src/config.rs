//! Global configuration parsing, validation, and path resolution.
//!
//! Every field is optional in the TOML file; command-line flags are applied
//! on top by the binary before [`GlobalConfig::validate`] runs. Paths that
//! depend on the environment (home directory, `powershell.exe` location) are
//! resolved lazily so a config file never has to spell them out.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use tracing::{debug, warn};

use crate::dispatch::DispatchConfig;
use crate::helper::spawner::{BOOTSTRAP_SCRIPT, DEFAULT_ENDPOINT, DEFAULT_HELPER_ARGS};
use crate::helper::HelperConfig;
use crate::{AppError, Result};

/// Well-known location of Windows PowerShell as seen from a WSL2 guest.
pub const FALLBACK_POWERSHELL_PATH: &str =
    "/mnt/c/Windows/System32/WindowsPowerShell/v1.0/powershell.exe";

/// Whether `SSH_AGENTC_EXTENSION` requests are answered locally.
#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ShimMode {
    /// Decide from the host's `ssh.exe -V` output.
    #[default]
    Auto,
    /// Always answer extension requests locally.
    Enabled,
    /// Always forward extension requests to the host agent.
    Disabled,
}

/// Configurable timeout values (milliseconds).
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct TimeoutConfig {
    /// Deadline for one request/reply round-trip with the helper.
    #[serde(default = "default_read_ms")]
    pub read_ms: u64,
    /// Handshake timeout per helper start attempt, in attempt order.
    #[serde(default = "default_handshake_ms")]
    pub handshake_ms: Vec<u64>,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            read_ms: default_read_ms(),
            handshake_ms: default_handshake_ms(),
        }
    }
}

fn default_read_ms() -> u64 {
    10_000
}

fn default_handshake_ms() -> Vec<u64> {
    vec![3_000, 6_000, 10_000]
}

fn default_helper_args() -> Vec<String> {
    DEFAULT_HELPER_ARGS.iter().map(|&a| a.to_owned()).collect()
}

fn default_endpoint() -> String {
    DEFAULT_ENDPOINT.to_owned()
}

fn default_max_request_failures() -> u32 {
    3
}

/// Global configuration parsed from an optional `config.toml`.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct GlobalConfig {
    /// Listening socket path; defaults to `~/.ssh/wsl2-ssh-agent.sock`.
    #[serde(default)]
    pub socket_path: Option<PathBuf>,
    /// Helper executable; defaults to `powershell.exe` on `PATH`.
    #[serde(default)]
    pub helper_path: Option<PathBuf>,
    /// Arguments passed to the helper.
    #[serde(default = "default_helper_args")]
    pub helper_args: Vec<String>,
    /// Script replacing the embedded bootstrap script.
    #[serde(default)]
    pub bootstrap_script: Option<PathBuf>,
    /// Host endpoint announced after the handshake; empty disables the record.
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
    /// Extension message shim policy.
    #[serde(default)]
    pub shim: ShimMode,
    /// Round-trip and handshake timeouts.
    #[serde(default)]
    pub timeouts: TimeoutConfig,
    /// Consecutive failed retries before the helper is given up on.
    #[serde(default = "default_max_request_failures")]
    pub max_request_failures: u32,
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            socket_path: None,
            helper_path: None,
            helper_args: default_helper_args(),
            bootstrap_script: None,
            endpoint: default_endpoint(),
            shim: ShimMode::default(),
            timeouts: TimeoutConfig::default(),
            max_request_failures: default_max_request_failures(),
        }
    }
}

impl GlobalConfig {
    /// Load and validate configuration from a TOML file path.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the file cannot be read, contains
    /// invalid TOML, or fails validation.
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .map_err(|err| AppError::Config(format!("failed to read config: {err}")))?;
        Self::from_toml_str(&raw)
    }

    /// Parse and validate configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if parsing or validation fails.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Check value ranges. Paths are checked when they are resolved.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` describing the first invalid value.
    pub fn validate(&self) -> Result<()> {
        if self.timeouts.handshake_ms.is_empty() {
            return Err(AppError::Config(
                "timeouts.handshake_ms must list at least one attempt".into(),
            ));
        }

        if self.timeouts.read_ms == 0 {
            return Err(AppError::Config(
                "timeouts.read_ms must be greater than zero".into(),
            ));
        }

        if self.max_request_failures == 0 {
            return Err(AppError::Config(
                "max_request_failures must be greater than zero".into(),
            ));
        }

        Ok(())
    }

    /// Listening socket path, configured or default.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if no path is configured and the home
    /// directory is unknown.
    pub fn socket_path(&self) -> Result<PathBuf> {
        match self.socket_path {
            Some(ref path) => Ok(path.clone()),
            None => default_socket_path(),
        }
    }

    /// Resolved helper executable.
    ///
    /// A configured value may be a bare program name (looked up on `PATH`)
    /// or a path; either way it must point at an executable file.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the executable cannot be found.
    pub fn helper_path(&self) -> Result<PathBuf> {
        match self.helper_path {
            Some(ref path) => which::which(path).map_err(|err| {
                AppError::Config(format!("helper '{}' not found: {err}", path.display()))
            }),
            None => find_powershell(),
        }
    }

    /// Handshake timeouts as durations.
    #[must_use]
    pub fn wait_times(&self) -> Vec<Duration> {
        self.timeouts
            .handshake_ms
            .iter()
            .map(|&ms| Duration::from_millis(ms))
            .collect()
    }

    /// Build the helper launch configuration.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the helper cannot be resolved or the
    /// bootstrap script file cannot be read.
    pub fn helper_config(&self) -> Result<HelperConfig> {
        let bootstrap = match self.bootstrap_script {
            Some(ref path) => fs::read_to_string(path).map_err(|err| {
                AppError::Config(format!(
                    "failed to read bootstrap script {}: {err}",
                    path.display()
                ))
            })?,
            None => BOOTSTRAP_SCRIPT.to_owned(),
        };

        let endpoint = if self.endpoint.is_empty() {
            if self.bootstrap_script.is_none() {
                warn!("the embedded bootstrap script expects an endpoint name; requests will fail without one");
            }
            None
        } else {
            Some(self.endpoint.clone())
        };

        Ok(HelperConfig {
            program: self.helper_path()?,
            args: self.helper_args.clone(),
            bootstrap,
            endpoint,
            wait_times: self.wait_times(),
        })
    }

    /// Build the dispatcher tunables.
    #[must_use]
    pub fn dispatch_config(&self) -> DispatchConfig {
        DispatchConfig {
            read_timeout: Duration::from_millis(self.timeouts.read_ms),
            max_request_failures: self.max_request_failures,
        }
    }
}

/// `~/.ssh/wsl2-ssh-agent.sock`.
///
/// # Errors
///
/// Returns `AppError::Config` if the home directory cannot be determined.
pub fn default_socket_path() -> Result<PathBuf> {
    let home = dirs::home_dir()
        .ok_or_else(|| AppError::Config("cannot determine home directory".into()))?;
    Ok(home.join(".ssh").join("wsl2-ssh-agent.sock"))
}

/// Locate `powershell.exe` on `PATH`, falling back to its standard
/// location under the Windows drive mount.
///
/// # Errors
///
/// Returns `AppError::Config` if neither location has it.
pub fn find_powershell() -> Result<PathBuf> {
    match which::which("powershell.exe") {
        Ok(path) => Ok(path),
        Err(err) => {
            debug!(%err, "powershell.exe not on PATH, trying fallback location");
            let fallback = PathBuf::from(FALLBACK_POWERSHELL_PATH);
            if fallback.exists() {
                Ok(fallback)
            } else {
                Err(AppError::Config(
                    "powershell.exe not found, use --helper-path to customize the path".into(),
                ))
            }
        }
    }
}
