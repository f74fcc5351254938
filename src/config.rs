//! TOML configuration for the monitor.
//!
//! Every section has compiled-in defaults, so an empty (or missing) file
//! yields a working setup. The config file path can be overridden with the
//! `TOKYO_MONITOR_CONFIG` environment variable.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::push::ReconnectPolicy;

/// Environment variable naming the config file.
pub const CONFIG_ENV: &str = "TOKYO_MONITOR_CONFIG";

/// Config file looked up in the working directory when nothing else is set.
pub const DEFAULT_CONFIG_FILE: &str = "tokyo-monitor.toml";

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MonitorConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub client: ClientConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl MonitorConfig {
    /// Load configuration from a TOML file at `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let config: Self = toml::from_str(&content)
            .with_context(|| format!("failed to parse config file: {}", path.display()))?;
        info!(path = %path.display(), "loaded monitor configuration");
        Ok(config)
    }

    /// Resolve configuration from, in order:
    /// 1. `explicit`, if given (errors are fatal).
    /// 2. The path in `TOKYO_MONITOR_CONFIG`.
    /// 3. `./tokyo-monitor.toml`.
    /// 4. Compiled-in defaults.
    pub fn resolve(explicit: Option<&Path>) -> Result<Self> {
        if let Some(path) = explicit {
            return Self::load(path);
        }

        if let Ok(env_path) = std::env::var(CONFIG_ENV) {
            let path = Path::new(&env_path);
            match Self::load(path) {
                Ok(cfg) => return Ok(cfg),
                Err(e) => {
                    warn!(
                        path = %path.display(),
                        error = %e,
                        "{} set but file could not be loaded, trying fallback",
                        CONFIG_ENV
                    );
                }
            }
        }

        let local = Path::new(DEFAULT_CONFIG_FILE);
        if local.exists() {
            return Self::load(local);
        }

        debug!("no config file found, using compiled-in defaults");
        Ok(Self::default())
    }
}

// ---------------------------------------------------------------------------
// Server
// ---------------------------------------------------------------------------

/// Reference server settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address and port for the HTTP listener.
    pub listen_address: String,
    /// Period of the simulated threat level drift.
    pub push_interval_ms: u64,
    /// Probability that a capture of an active anomaly fails with a 500.
    pub capture_failure_rate: f64,
    /// Artificial latency added to every capture request.
    pub capture_latency_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_address: "127.0.0.1:3000".to_string(),
            push_interval_ms: 5000,
            capture_failure_rate: 0.3,
            capture_latency_ms: 500,
        }
    }
}

impl ServerConfig {
    pub fn push_interval(&self) -> Duration {
        Duration::from_millis(self.push_interval_ms)
    }
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

/// Dashboard client settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Base URL of the server, without the `/api` suffix.
    pub base_url: String,
    /// Deadline for fetch and capture calls.
    pub request_timeout_ms: u64,
    /// Delay before each push channel reconnect.
    pub reconnect_delay_ms: u64,
    /// Consecutive failed reconnects before giving up.
    pub max_reconnect_attempts: u32,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:3000".to_string(),
            request_timeout_ms: 10_000,
            reconnect_delay_ms: 3000,
            max_reconnect_attempts: 10,
        }
    }
}

impl ClientConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        ReconnectPolicy {
            delay: Duration::from_millis(self.reconnect_delay_ms),
            max_attempts: self.max_reconnect_attempts,
        }
    }
}

// ---------------------------------------------------------------------------
// Logging
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Pretty,
    Json,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Minimum tracing level (`trace`, `debug`, `info`, `warn`, `error`).
    /// `RUST_LOG` takes precedence when set.
    pub level: String,
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
