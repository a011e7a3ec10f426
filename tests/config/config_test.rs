//! Coverage for config parsing, env overrides, and clamping.

use std::path::PathBuf;

use warden::config::{DaemonConfig, LoggingConfig, WardenConfig, CONFIG_PATH_ENV};
use warden::wire::{Verdict, MAX_MESSAGE_LEN, MIN_MESSAGE_LEN};

fn env_from(pairs: Vec<(&'static str, String)>) -> impl Fn(&str) -> Option<String> {
    move |key| {
        pairs
            .iter()
            .find(|(k, _)| *k == key)
            .map(|(_, v)| v.clone())
    }
}

#[test]
fn default_daemon_values() {
    let daemon = DaemonConfig::default();
    assert_eq!(daemon.socket_path, PathBuf::from("/run/warden/warden.sock"));
    assert_eq!(daemon.outbound_queue_depth, 64);
    assert_eq!(daemon.inbound_queue_depth, 256);
    assert_eq!(daemon.settled_token_capacity, 1024);
    assert_eq!(daemon.default_verdict(), Verdict::NO_DECISION);
    assert_eq!(daemon.max_message_len, MAX_MESSAGE_LEN);
}

#[test]
fn default_logging_values() {
    let logging = LoggingConfig::default();
    assert_eq!(logging.level, "info");
    assert!(logging.logs_dir.is_none());
    assert!(!logging.json_console);
}

#[test]
fn parse_partial_config_keeps_defaults() {
    let config = match WardenConfig::from_toml(
        r#"
[daemon]
socket_path = "/tmp/warden-test.sock"

[logging]
level = "debug"
"#,
    ) {
        Ok(config) => config,
        Err(err) => panic!("partial config should parse: {err}"),
    };
    assert_eq!(
        config.daemon.socket_path,
        PathBuf::from("/tmp/warden-test.sock")
    );
    assert_eq!(config.daemon.outbound_queue_depth, 64);
    assert_eq!(config.logging.level, "debug");
}

#[test]
fn out_of_range_values_are_clamped() {
    let config = WardenConfig::from_toml(
        r#"
[daemon]
outbound_queue_depth = 0
inbound_queue_depth = 0
max_message_len = 5000000
"#,
    )
    .expect("should parse");
    assert_eq!(config.daemon.outbound_queue_depth, 1);
    assert_eq!(config.daemon.inbound_queue_depth, 1);
    assert_eq!(config.daemon.max_message_len, MAX_MESSAGE_LEN);

    let tiny = WardenConfig::from_toml("[daemon]\nmax_message_len = 3\n").expect("should parse");
    assert_eq!(tiny.daemon.max_message_len, MIN_MESSAGE_LEN);
}

#[test]
fn malformed_toml_is_an_error() {
    assert!(WardenConfig::from_toml("[daemon\nsocket_path = 1").is_err());
    assert!(WardenConfig::from_toml("[daemon]\nsocket_path = 17\n").is_err());
}

#[test]
fn missing_file_yields_defaults() {
    let tmp = tempfile::tempdir().expect("should create temp dir");
    let path = tmp.path().join("absent.toml");
    let config = WardenConfig::load_with(env_from(vec![(
        CONFIG_PATH_ENV,
        path.display().to_string(),
    )]))
    .expect("defaults");
    assert_eq!(config.daemon.outbound_queue_depth, 64);
}

#[test]
fn env_overrides_file() {
    let tmp = tempfile::tempdir().expect("should create temp dir");
    let path = tmp.path().join("warden.toml");
    std::fs::write(
        &path,
        "[daemon]\nsocket_path = \"/tmp/from-file.sock\"\ndefault_verdict = 0\n\n[logging]\nlevel = \"warn\"\n",
    )
    .expect("should write config");
    let logs = tmp.path().join("logs");

    let config = WardenConfig::load_with(env_from(vec![
        (CONFIG_PATH_ENV, path.display().to_string()),
        ("WARDEN_SOCKET", "/tmp/from-env.sock".to_string()),
        ("WARDEN_LOGS_DIR", logs.display().to_string()),
        ("WARDEN_OUTBOUND_QUEUE_DEPTH", "8".to_string()),
    ]))
    .expect("should load");

    assert_eq!(
        config.daemon.socket_path,
        PathBuf::from("/tmp/from-env.sock")
    );
    assert_eq!(config.daemon.default_verdict(), Verdict::ALLOW);
    assert_eq!(config.daemon.outbound_queue_depth, 8);
    assert_eq!(config.logging.level, "warn");
    assert_eq!(config.logging.logs_dir, Some(logs));
}

#[test]
fn invalid_env_values_are_ignored() {
    let tmp = tempfile::tempdir().expect("should create temp dir");
    let config = WardenConfig::load_with(env_from(vec![
        (
            CONFIG_PATH_ENV,
            tmp.path().join("none.toml").display().to_string(),
        ),
        ("WARDEN_DEFAULT_VERDICT", "deny".to_string()),
        ("WARDEN_OUTBOUND_QUEUE_DEPTH", "-3".to_string()),
    ]))
    .expect("should load");
    assert_eq!(config.daemon.default_verdict(), Verdict::NO_DECISION);
    assert_eq!(config.daemon.outbound_queue_depth, 64);
}

#[test]
fn negative_env_verdict_falls_back() {
    let tmp = tempfile::tempdir().expect("should create temp dir");
    let config = WardenConfig::load_with(env_from(vec![
        (
            CONFIG_PATH_ENV,
            tmp.path().join("none.toml").display().to_string(),
        ),
        ("WARDEN_DEFAULT_VERDICT", "-9".to_string()),
    ]))
    .expect("should load");
    assert_eq!(config.daemon.default_verdict, Verdict::NO_DECISION.code());
}

#[test]
fn unreadable_config_path_is_an_error() {
    let tmp = tempfile::tempdir().expect("should create temp dir");
    // A directory cannot be read as a file.
    let result = WardenConfig::load_with(env_from(vec![(
        CONFIG_PATH_ENV,
        tmp.path().display().to_string(),
    )]));
    assert!(result.is_err());
}

#[test]
fn rendered_config_parses_back() {
    let mut config = WardenConfig::default();
    config.daemon.default_verdict = 0;
    config.logging.logs_dir = Some(PathBuf::from("/var/log/warden"));
    let text = config.to_toml().expect("should render");
    assert!(text.contains("[daemon]"));
    let back = WardenConfig::from_toml(&text).expect("should parse");
    assert_eq!(back.daemon.default_verdict(), Verdict::ALLOW);
    assert_eq!(back.logging.logs_dir, config.logging.logs_dir);
}
