//! Structured logging setup using `tracing-subscriber` and `tracing-appender`.
//!
//! Two modes:
//! - **Daemon** ([`init_production`]): stderr layer, plus a daily-rotated JSON
//!   file layer when a logs directory is configured
//! - **CLI** ([`init_cli`]): stderr only, for one-shot subcommands

use std::path::Path;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

use crate::config::LoggingConfig;

/// File name prefix for rotated logs.
pub const LOG_FILE_PREFIX: &str = "warden.log";

/// Keeps the file writer alive. Dropping it flushes pending entries.
pub struct LoggingGuard {
    _guard: Option<WorkerGuard>,
}

fn filter(default_level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level))
}

/// Initialise logging for `warden start`.
///
/// With `logs_dir` set, JSON lines go to `{logs_dir}/warden.log.YYYY-MM-DD`.
/// Stderr output is human-readable unless `json_console` is set. `RUST_LOG`
/// overrides the configured level.
///
/// # Errors
///
/// Returns an error if the logs directory cannot be created or a global
/// subscriber is already installed.
pub fn init_production(config: &LoggingConfig) -> anyhow::Result<LoggingGuard> {
    let (file_layer, guard) = match config.logs_dir.as_deref() {
        Some(dir) => {
            let (layer, guard) = file_layer(dir)?;
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    let console_layer = if config.json_console {
        tracing_subscriber::fmt::layer()
            .json()
            .with_writer(std::io::stderr)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer()
            .with_writer(std::io::stderr)
            .boxed()
    };

    tracing_subscriber::registry()
        .with(file_layer)
        .with(console_layer)
        .with(filter(&config.level))
        .try_init()
        .map_err(|e| anyhow::anyhow!("failed to install tracing subscriber: {e}"))?;

    Ok(LoggingGuard { _guard: guard })
}

type BoxedLayer = Box<dyn Layer<tracing_subscriber::Registry> + Send + Sync>;

fn file_layer(logs_dir: &Path) -> anyhow::Result<(BoxedLayer, WorkerGuard)> {
    std::fs::create_dir_all(logs_dir).map_err(|e| {
        anyhow::anyhow!(
            "failed to create logs directory {}: {e}",
            logs_dir.display()
        )
    })?;

    let file_appender = tracing_appender::rolling::daily(logs_dir, LOG_FILE_PREFIX);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
    let layer = tracing_subscriber::fmt::layer()
        .json()
        .with_writer(non_blocking)
        .boxed();
    Ok((layer, guard))
}

/// Initialise minimal logging for one-shot subcommands.
///
/// Human-readable stderr only. `RUST_LOG` overrides `level`. A second call
/// is a no-op.
pub fn init_cli(level: &str) {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter(level))
        .with_writer(std::io::stderr)
        .try_init();
}
