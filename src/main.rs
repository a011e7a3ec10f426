//! Warden CLI entry point.
//!
//! Provides `start`, `verify`, and `check-config` subcommands for running
//! the broker daemon, validating captured frames, or printing the
//! effective configuration.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::Context;
use clap::{Parser, Subcommand};
use serde::Serialize;
use tokio::sync::watch;
use tracing::{info, warn};

use warden::config::WardenConfig;
use warden::daemon::{self, Daemon};
use warden::wire::{self, opcode, Message, CHECKSUM_LEN};

/// Warden: notification broker for a security policy daemon.
#[derive(Parser)]
#[command(name = "warden", version, about)]
struct Cli {
    /// Subcommand to execute.
    #[command(subcommand)]
    command: Command,
}

/// Available CLI subcommands.
#[derive(Subcommand)]
enum Command {
    /// Run the broker daemon until interrupted.
    Start {
        /// Override the configured socket path.
        #[arg(long)]
        socket: Option<PathBuf>,
    },
    /// Validate a file of concatenated frames, one JSON line per frame.
    Verify {
        /// Capture file.
        file: PathBuf,
    },
    /// Load and print the effective configuration.
    CheckConfig,
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();

    match cli.command {
        Command::Start { socket } => handle_start(socket).await.map(|()| ExitCode::SUCCESS),
        Command::Verify { file } => handle_verify(&file),
        Command::CheckConfig => handle_check_config().map(|()| ExitCode::SUCCESS),
    }
}

/// Run the daemon.
async fn handle_start(socket: Option<PathBuf>) -> anyhow::Result<()> {
    let mut config = WardenConfig::load().context("failed to load config")?;
    if let Some(path) = socket {
        config.daemon.socket_path = path;
    }
    let _logging_guard = warden::logging::init_production(&config.logging)?;

    let listener = daemon::bind(&config.daemon.socket_path).with_context(|| {
        format!(
            "failed to bind {}",
            config.daemon.socket_path.display()
        )
    })?;
    info!(socket = %config.daemon.socket_path.display(), "listening");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let daemon = Daemon::new(config.daemon.clone());
    let task = tokio::spawn(daemon.run(listener, shutdown_rx));

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;
    info!("received shutdown signal");
    let _ = shutdown_tx.send(true);
    task.await.context("daemon task panicked")?;

    if let Err(e) = std::fs::remove_file(&config.daemon.socket_path) {
        warn!(error = %e, "could not remove socket");
    }
    Ok(())
}

/// One line of `warden verify` output.
#[derive(Serialize)]
struct FrameReport {
    offset: usize,
    opcode: Option<&'static str>,
    length: usize,
    valid: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    checksum: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

/// Walk the capture frame by frame. A frame whose length prefix is unusable
/// ends the walk.
fn handle_verify(path: &Path) -> anyhow::Result<ExitCode> {
    warden::logging::init_cli("warn");
    let bytes =
        std::fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;

    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    let mut offset = 0usize;
    let mut all_valid = true;

    while let Some(rest) = bytes.get(offset..).filter(|r| !r.is_empty()) {
        let report = match frame_at(rest) {
            Ok(msg) => {
                let result = wire::check(&msg);
                FrameReport {
                    offset,
                    opcode: msg.opcode().map(opcode::name),
                    length: msg.len(),
                    valid: result.is_ok(),
                    checksum: msg
                        .as_bytes()
                        .get(msg.len().saturating_sub(CHECKSUM_LEN)..)
                        .map(hex::encode),
                    error: result.err().map(|e| e.to_string()),
                }
            }
            Err(e) => FrameReport {
                offset,
                opcode: None,
                length: rest.len(),
                valid: false,
                checksum: None,
                error: Some(e),
            },
        };
        all_valid &= report.valid;
        let length = report.length;
        writeln!(out, "{}", serde_json::to_string(&report)?)?;
        if !report.valid && report.opcode.is_none() {
            break;
        }
        offset = offset.saturating_add(length);
    }

    Ok(if all_valid {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

fn frame_at(rest: &[u8]) -> Result<Message, String> {
    let prefix: [u8; 4] = rest
        .get(..4)
        .and_then(|p| p.try_into().ok())
        .ok_or_else(|| "truncated length prefix".to_string())?;
    let len = usize::try_from(u32::from_be_bytes(prefix)).map_err(|e| e.to_string())?;
    if !(wire::MIN_MESSAGE_LEN..=wire::MAX_MESSAGE_LEN).contains(&len) {
        return Err(format!("declared length {len} out of range"));
    }
    let frame = rest
        .get(..len)
        .ok_or_else(|| format!("declared length {len} exceeds remaining {} bytes", rest.len()))?;
    Ok(Message::from_bytes(frame.to_vec()))
}

/// Print the effective configuration as TOML.
fn handle_check_config() -> anyhow::Result<()> {
    warden::logging::init_cli("warn");
    let config = WardenConfig::load().context("failed to load config")?;
    print!("{}", config.to_toml()?);
    Ok(())
}
