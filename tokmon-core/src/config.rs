use config::{Config as ConfigBuilder, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{BeamError, BeamResult};

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct BeamConfig {
    #[serde(default)]
    pub relay: RelayConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub aggregation: AggregationConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    /// Required. There is no default port.
    #[serde(default)]
    pub port: Option<u16>,

    #[serde(default = "default_host")]
    pub host: String,

    /// Frames queued per observer before it counts as stalled.
    #[serde(default = "default_outbound_buffer")]
    pub outbound_buffer: usize,

    #[serde(default = "default_send_timeout")]
    pub send_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// When unset the in-memory store is used.
    #[serde(default)]
    pub url: Option<String>,

    #[serde(default = "default_pool_min")]
    pub pool_min_connections: u32,

    #[serde(default = "default_pool_max")]
    pub pool_max_connections: u32,

    #[serde(default = "default_acquire_timeout")]
    pub pool_acquire_timeout_secs: u64,

    #[serde(default = "default_idle_timeout")]
    pub pool_idle_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default)]
    pub json_format: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregationConfig {
    #[serde(default = "default_store_timeout")]
    pub store_timeout_ms: u64,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_outbound_buffer() -> usize {
    64
}

fn default_send_timeout() -> u64 {
    5000
}

fn default_pool_min() -> u32 {
    1
}

fn default_pool_max() -> u32 {
    10
}

fn default_acquire_timeout() -> u64 {
    30
}

fn default_idle_timeout() -> u64 {
    600
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_store_timeout() -> u64 {
    5000
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            port: None,
            host: default_host(),
            outbound_buffer: default_outbound_buffer(),
            send_timeout_ms: default_send_timeout(),
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: None,
            pool_min_connections: default_pool_min(),
            pool_max_connections: default_pool_max(),
            pool_acquire_timeout_secs: default_acquire_timeout(),
            pool_idle_timeout_secs: default_idle_timeout(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json_format: false,
        }
    }
}

impl Default for AggregationConfig {
    fn default() -> Self {
        Self {
            store_timeout_ms: default_store_timeout(),
        }
    }
}

impl RelayConfig {
    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }

    pub fn bind_addr(&self) -> BeamResult<String> {
        let port = self.port.ok_or_else(missing_port)?;
        Ok(format!("{}:{}", self.host, port))
    }
}

impl AggregationConfig {
    pub fn store_timeout(&self) -> Duration {
        Duration::from_millis(self.store_timeout_ms)
    }
}

fn missing_port() -> BeamError {
    BeamError::ConfigMissing("relay.port (set WSS_PORT or TOKMON_RELAY__PORT)".to_string())
}

fn invalid(key: &str, message: impl Into<String>) -> BeamError {
    BeamError::ConfigInvalid {
        key: key.to_string(),
        message: message.into(),
    }
}

impl BeamConfig {
    /// Loads and validates; fails fast when the relay port is missing.
    pub fn load() -> BeamResult<Self> {
        let config = Self::load_unvalidated()?;
        config.validate()?;
        Ok(config)
    }

    /// Loads without validating, so callers can layer command-line
    /// overrides before calling [`validate`](Self::validate).
    pub fn load_unvalidated() -> BeamResult<Self> {
        Self::load_from_paths(get_config_paths())
    }

    pub fn load_from_paths(paths: Vec<PathBuf>) -> BeamResult<Self> {
        load_dotenv_files();

        let mut builder = ConfigBuilder::builder();

        for path in paths {
            if path.exists() {
                builder = builder.add_source(File::from(path).required(false));
            }
        }

        builder = builder.add_source(
            Environment::with_prefix("TOKMON")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let mut config: BeamConfig = builder.build()?.try_deserialize()?;
        config.apply_env_overrides(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Well-known variables that predate the `TOKMON_SECTION__KEY` scheme.
    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> BeamResult<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(raw) = lookup("WSS_PORT") {
            let port = raw
                .trim()
                .parse::<u16>()
                .map_err(|_| invalid("relay.port", format!("WSS_PORT '{}' is not a port", raw)))?;
            self.relay.port = Some(port);
        }

        if let Some(url) = lookup("DATABASE_URL").or_else(|| lookup("TOKMON_DATABASE_URL")) {
            if !url.is_empty() {
                self.database.url = Some(url);
            }
        }

        if let Some(level) = lookup("TOKMON_LOG_LEVEL").or_else(|| lookup("RUST_LOG")) {
            self.logging.level = level;
        }

        Ok(())
    }

    pub fn validate(&self) -> BeamResult<()> {
        match self.relay.port {
            None => return Err(missing_port()),
            Some(0) => return Err(invalid("relay.port", "Must be greater than 0")),
            Some(_) => {}
        }

        if self.relay.outbound_buffer == 0 {
            return Err(invalid("relay.outbound_buffer", "Must be greater than 0"));
        }

        if self.relay.send_timeout_ms == 0 {
            return Err(invalid("relay.send_timeout_ms", "Must be greater than 0"));
        }

        if self.aggregation.store_timeout_ms == 0 {
            return Err(invalid("aggregation.store_timeout_ms", "Must be greater than 0"));
        }

        if let Some(url) = &self.database.url {
            if !url.starts_with("postgres://") && !url.starts_with("postgresql://") {
                return Err(invalid(
                    "database.url",
                    "Must be a valid PostgreSQL URL starting with postgres:// or postgresql://",
                ));
            }
        }

        if self.database.pool_min_connections > self.database.pool_max_connections {
            return Err(invalid(
                "database.pool_min_connections",
                "Cannot be greater than pool_max_connections",
            ));
        }

        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        let level_lower = self.logging.level.to_lowercase();
        if !valid_levels.contains(&level_lower.as_str()) && !level_lower.contains('=') {
            return Err(invalid(
                "logging.level",
                format!(
                    "Invalid log level '{}'. Must be one of: {:?}",
                    self.logging.level, valid_levels
                ),
            ));
        }

        Ok(())
    }

    pub fn uses_database(&self) -> bool {
        self.database.url.is_some()
    }
}

fn get_config_paths() -> Vec<PathBuf> {
    let mut paths = Vec::new();

    if let Ok(cwd) = std::env::current_dir() {
        paths.push(cwd.join("config").join("default.toml"));
        paths.push(cwd.join("config").join("local.toml"));
        paths.push(cwd.join("tokmon-beam.toml"));
    }

    if let Some(config_dir) = dirs::config_dir() {
        paths.push(config_dir.join("tokmon-beam").join("config.toml"));
    }

    paths
}

fn load_dotenv_files() {
    let mut paths = Vec::new();

    if let Ok(cwd) = std::env::current_dir() {
        paths.push(cwd.join(".env"));
        paths.push(cwd.join(".env.local"));
    }

    if let Some(config_dir) = dirs::config_dir() {
        paths.push(config_dir.join("tokmon-beam").join(".env"));
    }

    for path in paths {
        if path.exists() {
            let _ = dotenvy::from_path(&path);
        }
    }
}
