#![forbid(unsafe_code)]

//! `wsl2-ssh-agent` binary.
//!
//! Resolves configuration, handles `--stop` and an already running instance,
//! daemonizes, and then serves the agent socket until a shutdown signal.

#[cfg(not(unix))]
compile_error!("wsl2-ssh-agent runs inside a Unix guest only");

use std::ffi::OsString;
use std::fs::OpenOptions;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::fmt::writer::{BoxMakeWriter, MakeWriterExt};
use tracing_subscriber::{fmt, EnvFilter};

use wsl2_ssh_agent::config::{GlobalConfig, ShimMode};
use wsl2_ssh_agent::daemon;
use wsl2_ssh_agent::ipc::{Server, ServerConfig};
use wsl2_ssh_agent::{instance, probe, AppError, Result};

/// How long `--stop` waits for the running server to exit.
const STOP_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Copy, Clone, Eq, PartialEq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Parser)]
#[command(name = "wsl2-ssh-agent", about = "Bridge the host ssh-agent into WSL2", version, long_about = None)]
struct Cli {
    /// Path to an optional TOML configuration file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Path of the UNIX domain socket to listen on.
    #[arg(long)]
    socket: Option<PathBuf>,

    /// Path of Windows PowerShell (powershell.exe).
    #[arg(long)]
    helper_path: Option<PathBuf>,

    /// Run in the foreground instead of daemonizing.
    #[arg(long)]
    foreground: bool,

    /// Also write the log to stdout.
    #[arg(long)]
    verbose: bool,

    /// File to append the log to.
    #[arg(long)]
    log: Option<PathBuf>,

    /// Log output format (text or json).
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    /// Stop the running server and exit.
    #[arg(long)]
    stop: bool,

    /// Do not announce a host endpoint name after the handshake.
    #[arg(long)]
    no_endpoint: bool,

    #[arg(long = "daemon-child", hide = true)]
    daemon_child: bool,
}

fn main() -> ExitCode {
    let args = Cli::parse();
    match start(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(%err, "wsl2-ssh-agent failed");
            eprintln!("wsl2-ssh-agent: {err}");
            ExitCode::FAILURE
        }
    }
}

fn start(args: &Cli) -> Result<()> {
    init_tracing(args)?;

    let config = load_config(args)?;
    let socket_path = config.socket_path()?;
    if !args.stop {
        // Fail in the launcher, not in a detached child nobody watches.
        config.helper_path()?;
    }
    let output = daemon::shell_output(&socket_path);

    // ── Existing instance / --stop ──────────────────────
    let running = instance::find_running_server(&socket_path)?;

    if args.stop {
        let Some(pid) = running else {
            return Err(AppError::Ipc("failed to find wsl2-ssh-agent".into()));
        };
        info!(pid, "kill wsl2-ssh-agent");
        return instance::stop_server(pid, STOP_TIMEOUT);
    }

    if let Some(pid) = running {
        info!(pid, "wsl2-ssh-agent is already running; exit");
        println!("{output}");
        return Ok(());
    }

    // ── Daemonize ───────────────────────────────────────
    if !args.foreground && !args.daemon_child {
        info!("daemonize: start");
        let forwarded: Vec<OsString> = std::env::args_os().skip(1).collect();
        println!("{}", daemon::spawn_daemon(&forwarded)?);
        return Ok(());
    }

    if args.daemon_child {
        daemon::detach()?;
    }

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| AppError::Config(format!("failed to build tokio runtime: {err}")))?
        .block_on(serve(config, socket_path, args.daemon_child.then_some(output)))
}

async fn serve(
    config: GlobalConfig,
    socket_path: PathBuf,
    ready_output: Option<String>,
) -> Result<()> {
    let helper = config.helper_config()?;

    let shim = match config.shim {
        ShimMode::Enabled => true,
        ShimMode::Disabled => false,
        ShimMode::Auto => {
            let banner = probe::host_ssh_version(probe::HOST_SSH, &helper.wait_times).await;
            probe::needs_extension_shim(banner.as_deref())
        }
    };
    info!(shim, "extension message shim");

    let server = Server::bind(ServerConfig {
        socket_path,
        shim,
        helper,
        dispatch: config.dispatch_config(),
    })?;

    if let Some(output) = ready_output {
        daemon::complete(&output)?;
    }

    let ct = CancellationToken::new();
    watch_signals(ct.clone())?;

    server.run(ct).await?;
    info!("wsl2-ssh-agent shut down");
    Ok(())
}

/// Defaults, then the optional config file, then command-line flags.
fn load_config(args: &Cli) -> Result<GlobalConfig> {
    let mut config = match args.config {
        Some(ref path) => GlobalConfig::load_from_path(path)?,
        None => GlobalConfig::default(),
    };

    if let Some(ref socket) = args.socket {
        config.socket_path = Some(socket.clone());
    }
    if let Some(ref helper) = args.helper_path {
        config.helper_path = Some(helper.clone());
    }
    if args.no_endpoint {
        config.endpoint.clear();
    }

    config.validate()?;
    Ok(config)
}

/// Cancel `ct` on SIGINT, SIGTERM or SIGHUP.
///
/// Handlers are registered before returning so no signal between now and
/// the first poll falls back to the default action.
fn watch_signals(ct: CancellationToken) -> Result<()> {
    let register = |kind: SignalKind| {
        signal(kind)
            .map_err(|err| AppError::Config(format!("failed to register signal handler: {err}")))
    };
    let mut sigint = register(SignalKind::interrupt())?;
    let mut sigterm = register(SignalKind::terminate())?;
    let mut sighup = register(SignalKind::hangup())?;

    tokio::spawn(async move {
        tokio::select! {
            _ = sigint.recv() => {}
            _ = sigterm.recv() => {}
            _ = sighup.recv() => {}
        }
        info!("shutdown signal received");
        ct.cancel();
    });

    Ok(())
}

fn init_tracing(args: &Cli) -> Result<()> {
    // The daemon's stdout is the launcher's rendezvous pipe; keep logs off it.
    let to_stdout = args.verbose && !args.daemon_child;

    let file = match args.log {
        Some(ref path) => Some(Arc::new(
            OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map_err(|err| AppError::Config(format!("failed to open a log file: {err}")))?,
        )),
        None => None,
    };

    let default_level = if file.is_some() || to_stdout { "info" } else { "off" };
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let ansi = file.is_none();
    let writer = match (file, to_stdout) {
        (Some(file), true) => BoxMakeWriter::new(file.and(std::io::stdout)),
        (Some(file), false) => BoxMakeWriter::new(file),
        (None, true) => BoxMakeWriter::new(std::io::stdout),
        (None, false) => BoxMakeWriter::new(std::io::sink),
    };

    let subscriber = fmt()
        .with_env_filter(env_filter)
        .with_writer(writer)
        .with_ansi(ansi);

    match args.log_format {
        LogFormat::Text => subscriber
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
        LogFormat::Json => subscriber
            .json()
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
    }

    Ok(())
}
