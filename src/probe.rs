//! Host OpenSSH version probe.
//!
//! OpenSSH 8.9 started sending `SSH_AGENTC_EXTENSION` right after
//! connecting. Older Windows builds of `ssh-agent.exe` drop the connection
//! when they receive it, so the extension shim is only needed when the
//! host runs an older OpenSSH.

use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;
use tracing::{info, warn};

/// Host ssh client as reachable through WSL interop.
pub const HOST_SSH: &str = "ssh.exe";

/// First OpenSSH release that sends the extension message.
pub const FIRST_EXTENSION_VERSION: (u32, u32) = (8, 9);

/// Run `<program> -V` and return its version banner.
///
/// Tries once per entry in `wait_times`, each bounded by that timeout.
/// Returns `None` when every attempt fails.
pub async fn host_ssh_version(program: &str, wait_times: &[Duration]) -> Option<String> {
    for (i, &limit) in wait_times.iter().enumerate() {
        info!(attempt = i + 1, "check the version of {program}");

        let run = Command::new(program)
            .arg("-V")
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output();

        match tokio::time::timeout(limit, run).await {
            Ok(Ok(output)) if output.status.success() => {
                // ssh prints its version banner on stderr.
                let banner = String::from_utf8_lossy(&output.stderr).trim_end().to_owned();
                info!(version = %banner, "host ssh version");
                return Some(banner);
            }
            Ok(Ok(output)) => warn!(status = %output.status, "{program} -V failed"),
            Ok(Err(err)) => warn!(%err, "failed to invoke {program}"),
            Err(_) => warn!("{program} did not respond within {limit:?}"),
        }
    }

    warn!("failed to check the version of {program}");
    None
}

/// Parse `(major, minor)` out of a banner such as
/// `OpenSSH_for_Windows_8.6p1, LibreSSL 3.4.3`.
#[must_use]
pub fn parse_openssh_version(banner: &str) -> Option<(u32, u32)> {
    let start = banner.find("OpenSSH")?;
    let product = banner[start..]
        .split(|c: char| c == ',' || c.is_whitespace())
        .next()?;

    let digits_at = product.find(|c: char| c.is_ascii_digit())?;
    let mut parts = product[digits_at..].split('.');

    let major = leading_number(parts.next()?)?;
    let minor = parts.next().and_then(leading_number).unwrap_or(0);
    Some((major, minor))
}

/// Whether extension requests must be answered locally for a host whose
/// ssh reported `banner`. Unknown versions get the shim, since a dummy
/// success is harmless while a dropped connection is not.
#[must_use]
pub fn needs_extension_shim(banner: Option<&str>) -> bool {
    match banner.and_then(parse_openssh_version) {
        Some(version) => version < FIRST_EXTENSION_VERSION,
        None => true,
    }
}

fn leading_number(s: &str) -> Option<u32> {
    let end = s.find(|c: char| !c.is_ascii_digit()).unwrap_or(s.len());
    s[..end].parse().ok()
}
