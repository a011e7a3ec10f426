//! Configuration loading.
//!
//! Loads Warden configuration from `./warden.toml` (or `$WARDEN_CONFIG_PATH`).
//! Precedence: env vars > config file > defaults.

use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::broker::DEFAULT_SETTLED_CAPACITY;
use crate::wire::{Verdict, MAX_MESSAGE_LEN, MIN_MESSAGE_LEN};

/// Env var naming the config file.
pub const CONFIG_PATH_ENV: &str = "WARDEN_CONFIG_PATH";

// ── Top-level config ────────────────────────────────────────────

/// Top-level configuration.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct WardenConfig {
    /// Socket daemon settings (`[daemon]`).
    pub daemon: DaemonConfig,
    /// Logging settings (`[logging]`).
    pub logging: LoggingConfig,
}

impl WardenConfig {
    /// Load configuration: env vars > TOML file > defaults.
    ///
    /// A missing file yields defaults.
    pub fn load() -> Result<Self> {
        Self::load_with(|key| std::env::var(key).ok())
    }

    /// Load using a custom env resolver.
    pub fn load_with(env: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let path = Self::config_path_with(&env);
        let mut config = match std::fs::read_to_string(&path) {
            Ok(contents) => {
                tracing::info!(path = %path.display(), "loading config from file");
                Self::from_toml(&contents)
                    .with_context(|| format!("invalid config file {}", path.display()))?
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(path = %path.display(), "no config file found, using defaults");
                Self::default()
            }
            Err(e) => {
                return Err(e).with_context(|| format!("failed to read {}", path.display()));
            }
        };
        config.apply_overrides(&env);
        config.normalize();
        Ok(config)
    }

    fn config_path_with(env: impl Fn(&str) -> Option<String>) -> PathBuf {
        env(CONFIG_PATH_ENV).map_or_else(|| PathBuf::from("warden.toml"), PathBuf::from)
    }

    /// Apply environment variable overrides. Invalid values are logged and
    /// ignored.
    fn apply_overrides(&mut self, env: impl Fn(&str) -> Option<String>) {
        if let Some(v) = env("WARDEN_SOCKET") {
            self.daemon.socket_path = PathBuf::from(v);
        }
        if let Some(v) = env("WARDEN_LOG_LEVEL") {
            self.logging.level = v;
        }
        if let Some(v) = env("WARDEN_LOGS_DIR") {
            self.logging.logs_dir = Some(PathBuf::from(v));
        }
        if let Some(v) = env("WARDEN_DEFAULT_VERDICT") {
            match v.parse() {
                Ok(n) => self.daemon.default_verdict = n,
                Err(_) => warn_invalid("WARDEN_DEFAULT_VERDICT", &v),
            }
        }
        if let Some(v) = env("WARDEN_OUTBOUND_QUEUE_DEPTH") {
            match v.parse() {
                Ok(n) => self.daemon.outbound_queue_depth = n,
                Err(_) => warn_invalid("WARDEN_OUTBOUND_QUEUE_DEPTH", &v),
            }
        }
    }

    /// Clamp values the rest of the daemon relies on.
    fn normalize(&mut self) {
        let d = &mut self.daemon;
        d.max_message_len = d.max_message_len.clamp(MIN_MESSAGE_LEN, MAX_MESSAGE_LEN);
        d.outbound_queue_depth = d.outbound_queue_depth.max(1);
        d.inbound_queue_depth = d.inbound_queue_depth.max(1);
        if Verdict::new(d.default_verdict).is_none() {
            warn_invalid("default_verdict", &d.default_verdict.to_string());
            d.default_verdict = Verdict::NO_DECISION.code();
        }
    }

    /// Parse a TOML string, applying the same clamping as [`Self::load`].
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        let mut config: WardenConfig =
            toml::from_str(toml_str).context("failed to parse config TOML")?;
        config.normalize();
        Ok(config)
    }

    /// Render as TOML.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("failed to render config")
    }
}

fn warn_invalid(var: &str, value: &str) {
    tracing::warn!(var, value, "ignoring invalid config value");
}

// ── Daemon config ───────────────────────────────────────────────

/// Socket daemon settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// Unix socket clients connect to.
    pub socket_path: PathBuf,
    /// Per-connection outbound queue; a full queue drops the client.
    pub outbound_queue_depth: usize,
    /// Shared queue from connection readers to the broker task.
    pub inbound_queue_depth: usize,
    /// Settled tokens remembered per session for late answers.
    pub settled_token_capacity: usize,
    /// Verdict for gated events nobody subscribed to.
    pub default_verdict: i32,
    /// Largest frame accepted from clients.
    pub max_message_len: usize,
}

impl DaemonConfig {
    /// [`Self::default_verdict`] as a [`Verdict`].
    pub fn default_verdict(&self) -> Verdict {
        Verdict::new(self.default_verdict).unwrap_or(Verdict::NO_DECISION)
    }
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            socket_path: PathBuf::from("/run/warden/warden.sock"),
            outbound_queue_depth: 64,
            inbound_queue_depth: 256,
            settled_token_capacity: DEFAULT_SETTLED_CAPACITY,
            default_verdict: Verdict::NO_DECISION.code(),
            max_message_len: MAX_MESSAGE_LEN,
        }
    }
}

// ── Logging config ──────────────────────────────────────────────

/// Logging settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter when `RUST_LOG` is unset.
    pub level: String,
    /// Directory for daily JSON log files. Console only when unset.
    pub logs_dir: Option<PathBuf>,
    /// Emit JSON on stderr as well.
    pub json_console: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            logs_dir: None,
            json_console: false,
        }
    }
}
