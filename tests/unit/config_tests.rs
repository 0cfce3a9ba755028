//! Unit tests for configuration parsing, validation, and resolution.

use std::path::PathBuf;
use std::time::Duration;

use wsl2_ssh_agent::config::{GlobalConfig, ShimMode};
use wsl2_ssh_agent::helper::spawner::{BOOTSTRAP_SCRIPT, DEFAULT_ENDPOINT};
use wsl2_ssh_agent::AppError;

// ── Defaults ────────────────────────────────────────────────────────────────

#[test]
fn empty_file_yields_defaults() {
    let config = GlobalConfig::from_toml_str("").expect("empty config is valid");
    assert_eq!(config, GlobalConfig::default());

    assert_eq!(config.socket_path, None);
    assert_eq!(config.helper_args, vec!["-Command".to_owned(), "-".to_owned()]);
    assert_eq!(config.endpoint, DEFAULT_ENDPOINT);
    assert_eq!(config.shim, ShimMode::Auto);
    assert_eq!(config.timeouts.read_ms, 10_000);
    assert_eq!(config.timeouts.handshake_ms, vec![3_000, 6_000, 10_000]);
    assert_eq!(config.max_request_failures, 3);
}

#[test]
fn default_socket_lives_under_dot_ssh() {
    let config = GlobalConfig::default();
    let path = config.socket_path().expect("home directory is known in tests");
    assert!(
        path.ends_with(".ssh/wsl2-ssh-agent.sock"),
        "unexpected default socket path: {}",
        path.display()
    );
}

// ── Overrides ───────────────────────────────────────────────────────────────

#[test]
fn all_fields_can_be_overridden() {
    let toml = r#"
socket_path = "/tmp/agent.sock"
helper_path = "/bin/sh"
helper_args = ["-s"]
endpoint = "custom-pipe"
shim = "disabled"
max_request_failures = 5

[timeouts]
read_ms = 2500
handshake_ms = [100, 200]
"#;
    let config = GlobalConfig::from_toml_str(toml).expect("valid config");

    assert_eq!(
        config.socket_path().expect("configured"),
        PathBuf::from("/tmp/agent.sock")
    );
    assert_eq!(config.helper_args, vec!["-s".to_owned()]);
    assert_eq!(config.endpoint, "custom-pipe");
    assert_eq!(config.shim, ShimMode::Disabled);
    assert_eq!(
        config.wait_times(),
        vec![Duration::from_millis(100), Duration::from_millis(200)]
    );

    let dispatch = config.dispatch_config();
    assert_eq!(dispatch.read_timeout, Duration::from_millis(2500));
    assert_eq!(dispatch.max_request_failures, 5);
}

#[test]
fn shim_mode_accepts_snake_case_names() {
    for (raw, expected) in [
        ("auto", ShimMode::Auto),
        ("enabled", ShimMode::Enabled),
        ("disabled", ShimMode::Disabled),
    ] {
        let config =
            GlobalConfig::from_toml_str(&format!("shim = \"{raw}\"")).expect("valid shim mode");
        assert_eq!(config.shim, expected);
    }
}

// ── Validation ──────────────────────────────────────────────────────────────

#[test]
fn unknown_shim_mode_is_rejected() {
    let err = GlobalConfig::from_toml_str("shim = \"sometimes\"").expect_err("must fail");
    assert!(matches!(err, AppError::Config(_)), "got {err:?}");
}

#[test]
fn empty_handshake_list_is_rejected() {
    let err = GlobalConfig::from_toml_str("[timeouts]\nhandshake_ms = []")
        .expect_err("must fail");
    assert!(
        err.to_string().contains("handshake_ms"),
        "error must name the field: {err}"
    );
}

#[test]
fn zero_read_timeout_is_rejected() {
    let err = GlobalConfig::from_toml_str("[timeouts]\nread_ms = 0").expect_err("must fail");
    assert!(err.to_string().contains("read_ms"), "got {err}");
}

#[test]
fn zero_failure_budget_is_rejected() {
    let err = GlobalConfig::from_toml_str("max_request_failures = 0").expect_err("must fail");
    assert!(err.to_string().contains("max_request_failures"), "got {err}");
}

#[test]
fn malformed_toml_is_a_config_error() {
    let err = GlobalConfig::from_toml_str("socket_path = ").expect_err("must fail");
    assert!(err.to_string().starts_with("config: invalid config"), "got {err}");
}

#[test]
fn missing_config_file_is_a_config_error() {
    let err = GlobalConfig::load_from_path("/nonexistent/wsl2-ssh-agent.toml")
        .expect_err("must fail");
    assert!(matches!(err, AppError::Config(_)), "got {err:?}");
}

// ── Helper resolution ───────────────────────────────────────────────────────

#[test]
fn missing_helper_is_reported() {
    let config = GlobalConfig {
        helper_path: Some(PathBuf::from("/nonexistent/powershell.exe")),
        ..GlobalConfig::default()
    };
    let err = config.helper_path().expect_err("must fail");
    assert!(matches!(err, AppError::Config(_)), "got {err:?}");
}

#[test]
fn helper_config_carries_defaults() {
    let config = GlobalConfig {
        helper_path: Some(PathBuf::from("/bin/sh")),
        ..GlobalConfig::default()
    };
    let helper = config.helper_config().expect("helper resolves");

    assert_eq!(helper.program, PathBuf::from("/bin/sh"));
    assert_eq!(helper.bootstrap, BOOTSTRAP_SCRIPT);
    assert_eq!(helper.endpoint.as_deref(), Some(DEFAULT_ENDPOINT));
    assert_eq!(helper.wait_times.len(), 3);
}

#[test]
fn empty_endpoint_disables_the_record() {
    let config = GlobalConfig {
        helper_path: Some(PathBuf::from("/bin/sh")),
        endpoint: String::new(),
        ..GlobalConfig::default()
    };
    let helper = config.helper_config().expect("helper resolves");
    assert_eq!(helper.endpoint, None);
}

#[test]
fn bootstrap_script_is_read_from_file() {
    let dir = tempfile::tempdir().expect("tempdir");
    let script = dir.path().join("bootstrap.ps1");
    std::fs::write(&script, "Write-Output 'custom'\n").expect("write script");

    let config = GlobalConfig {
        helper_path: Some(PathBuf::from("/bin/sh")),
        bootstrap_script: Some(script),
        ..GlobalConfig::default()
    };
    let helper = config.helper_config().expect("helper resolves");
    assert_eq!(helper.bootstrap, "Write-Output 'custom'\n");
}

#[test]
fn unreadable_bootstrap_script_is_a_config_error() {
    let config = GlobalConfig {
        helper_path: Some(PathBuf::from("/bin/sh")),
        bootstrap_script: Some(PathBuf::from("/nonexistent/bootstrap.ps1")),
        ..GlobalConfig::default()
    };
    let err = config.helper_config().expect_err("must fail");
    assert!(err.to_string().contains("bootstrap script"), "got {err}");
}
