//! CLI contract tests.

use std::path::Path;

use assert_cmd::Command;
use serde_json::Value;
use warden::wire::build;

fn warden() -> Command {
    Command::cargo_bin("warden").expect("binary should build")
}

fn capture(dir: &Path, frames: &[Vec<u8>]) -> std::path::PathBuf {
    let path = dir.join("capture.bin");
    std::fs::write(&path, frames.concat()).expect("should write capture");
    path
}

fn report_lines(stdout: &[u8]) -> Vec<Value> {
    String::from_utf8_lossy(stdout)
        .lines()
        .map(|l| serde_json::from_str(l).expect("each line should be JSON"))
        .collect()
}

#[test]
fn verify_accepts_well_formed_capture() {
    let tmp = tempfile::tempdir().expect("should create temp dir");
    let hello = build::hello(3, 2).expect("hello").into_bytes();
    let close = build::close(9).expect("close").into_bytes();
    let path = capture(tmp.path(), &[hello.clone(), close]);

    let output = warden()
        .arg("verify")
        .arg(&path)
        .output()
        .expect("should run");
    assert!(output.status.success());

    let lines = report_lines(&output.stdout);
    assert_eq!(lines.len(), 2);
    assert_eq!(lines[0]["offset"], 0);
    assert_eq!(lines[0]["opcode"], "C_HELLO");
    assert_eq!(lines[0]["valid"], true);
    assert_eq!(lines[1]["offset"], hello.len());
    assert_eq!(lines[1]["opcode"], "C_CLOSE");
    assert!(lines[1].get("error").is_none());
}

#[test]
fn verify_reports_bad_frames_and_fails() {
    let tmp = tempfile::tempdir().expect("should create temp dir");
    let mut corrupt = build::close(1).expect("close").into_bytes();
    let last = corrupt.len() - 1;
    corrupt[last] ^= 0xff;
    let good = build::close(2).expect("close").into_bytes();
    let path = capture(tmp.path(), &[corrupt, good, vec![0, 0]]);

    let output = warden()
        .arg("verify")
        .arg(&path)
        .output()
        .expect("should run");
    assert!(!output.status.success());

    let lines = report_lines(&output.stdout);
    assert_eq!(lines.len(), 3);
    assert_eq!(lines[0]["valid"], false);
    assert_eq!(lines[0]["error"], "checksum mismatch");
    assert_eq!(lines[1]["valid"], true);
    assert_eq!(lines[2]["error"], "truncated length prefix");
}

#[test]
fn verify_missing_file_is_an_error() {
    warden()
        .args(["verify", "/nonexistent/warden-capture.bin"])
        .assert()
        .failure();
}

#[test]
fn check_config_prints_effective_config() {
    let tmp = tempfile::tempdir().expect("should create temp dir");
    let config = tmp.path().join("warden.toml");
    std::fs::write(&config, "[daemon]\nsocket_path = \"/tmp/cli.sock\"\n")
        .expect("should write config");

    let output = warden()
        .arg("check-config")
        .env("WARDEN_CONFIG_PATH", &config)
        .env("WARDEN_DEFAULT_VERDICT", "0")
        .env_remove("WARDEN_SOCKET")
        .output()
        .expect("should run");
    assert!(output.status.success());

    let text = String::from_utf8_lossy(&output.stdout);
    let rendered: toml::Value = toml::from_str(&text).expect("output should be TOML");
    assert_eq!(rendered["daemon"]["socket_path"].as_str(), Some("/tmp/cli.sock"));
    assert_eq!(rendered["daemon"]["default_verdict"].as_integer(), Some(0));
}

#[test]
fn check_config_rejects_invalid_file() {
    let tmp = tempfile::tempdir().expect("should create temp dir");
    let config = tmp.path().join("warden.toml");
    std::fs::write(&config, "[daemon\n").expect("should write config");

    warden()
        .arg("check-config")
        .env("WARDEN_CONFIG_PATH", &config)
        .assert()
        .failure();
}

#[test]
fn unknown_subcommand_fails() {
    warden().arg("frobnicate").assert().failure();
}
