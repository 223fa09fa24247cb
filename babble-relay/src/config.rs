//! Configuration system for the babble relay server.
//!
//! Supports layered configuration with the following priority (highest first):
//! 1. CLI arguments
//! 2. Environment variables (via clap `env` attribute)
//! 3. TOML config file (`~/.config/babble-relay/config.toml`)
//! 4. Compiled defaults

use std::path::PathBuf;

use crate::relay::DEFAULT_INBOUND_QUEUE_SIZE;
use crate::server::{DEFAULT_MAX_FRAME_SIZE, DEFAULT_SEND_QUEUE_SIZE};

/// Errors that can occur when loading relay configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to read the configuration file.
    #[error("failed to read config file {path}: {source}")]
    ReadFile {
        /// Path that was attempted.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// Failed to parse the TOML configuration.
    #[error("failed to parse config file: {0}")]
    ParseToml(#[from] toml::de::Error),

    /// A value was parsed but is not usable.
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

// ---------------------------------------------------------------------------
// TOML file structs (all fields Option for partial overrides)
// ---------------------------------------------------------------------------

/// Top-level TOML config file structure for the relay.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct RelayConfigFile {
    server: ServerFileConfig,
    log: LogFileConfig,
}

/// `[server]` section of the relay config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct ServerFileConfig {
    bind_addr: Option<String>,
    max_frame_size: Option<usize>,
    send_queue_size: Option<usize>,
    inbound_queue_size: Option<usize>,
}

/// `[log]` section of the relay config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct LogFileConfig {
    file: Option<PathBuf>,
}

// ---------------------------------------------------------------------------
// CLI arguments
// ---------------------------------------------------------------------------

/// CLI arguments for the relay server.
#[derive(clap::Parser, Debug, Default)]
#[command(version, about = "babble broadcast relay server")]
pub struct RelayCliArgs {
    /// Address to bind the relay server to.
    #[arg(short, long, env = "BABBLE_ADDR")]
    pub bind: Option<String>,

    /// Path to config file (default: `~/.config/babble-relay/config.toml`).
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Largest inbound WebSocket frame accepted, in bytes.
    #[arg(long)]
    pub max_frame_size: Option<usize>,

    /// Events buffered per connection before broadcasts to it are dropped.
    #[arg(long)]
    pub send_queue_size: Option<usize>,

    /// Inbound events buffered ahead of the relay task.
    #[arg(long)]
    pub inbound_queue_size: Option<usize>,

    /// Log level filter (trace, debug, info, warn, error).
    #[arg(long, default_value = "info", env = "BABBLE_LOG")]
    pub log_level: String,

    /// Also write logs to this file.
    #[arg(long)]
    pub log_file: Option<PathBuf>,
}

// ---------------------------------------------------------------------------
// Resolved configuration
// ---------------------------------------------------------------------------

/// Fully resolved relay server configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Address to bind the server to (e.g., `0.0.0.0:3003`).
    pub bind_addr: String,
    /// Largest inbound WebSocket frame accepted, in bytes.
    pub max_frame_size: usize,
    /// Capacity of each connection's outbound queue.
    pub send_queue_size: usize,
    /// Capacity of the relay task's inbound queue.
    pub inbound_queue_size: usize,
    /// Log level filter string.
    pub log_level: String,
    /// Optional log file path.
    pub log_file: Option<PathBuf>,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:3003".to_string(),
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            send_queue_size: DEFAULT_SEND_QUEUE_SIZE,
            inbound_queue_size: DEFAULT_INBOUND_QUEUE_SIZE,
            log_level: "info".to_string(),
            log_file: None,
        }
    }
}

impl RelayConfig {
    /// Load configuration by merging CLI args, env vars, and a TOML file.
    ///
    /// If `--config` is given and the file does not exist, returns an error.
    /// If no `--config` is given, the default path is tried and missing file
    /// is treated as empty config.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the explicit config file cannot be read
    /// or parsed, or if a resolved value is unusable.
    pub fn load(cli: &RelayCliArgs) -> Result<Self, ConfigError> {
        let file = load_config_file(cli.config.as_deref())?;
        let config = Self::resolve(cli, &file);
        config.validate()?;
        Ok(config)
    }

    /// Resolve a `RelayConfig` from CLI args and a parsed config file.
    ///
    /// Priority: CLI > file > default.
    #[must_use]
    fn resolve(cli: &RelayCliArgs, file: &RelayConfigFile) -> Self {
        let defaults = Self::default();

        Self {
            bind_addr: cli
                .bind
                .clone()
                .or_else(|| file.server.bind_addr.clone())
                .unwrap_or(defaults.bind_addr),
            max_frame_size: cli
                .max_frame_size
                .or(file.server.max_frame_size)
                .unwrap_or(defaults.max_frame_size),
            send_queue_size: cli
                .send_queue_size
                .or(file.server.send_queue_size)
                .unwrap_or(defaults.send_queue_size),
            inbound_queue_size: cli
                .inbound_queue_size
                .or(file.server.inbound_queue_size)
                .unwrap_or(defaults.inbound_queue_size),
            log_level: cli.log_level.clone(),
            log_file: cli.log_file.clone().or_else(|| file.log.file.clone()),
        }
    }

    /// Rejects values the runtime cannot work with.
    fn validate(&self) -> Result<(), ConfigError> {
        if self.send_queue_size == 0 {
            return Err(ConfigError::Invalid(
                "send_queue_size must be at least 1".to_string(),
            ));
        }
        if self.inbound_queue_size == 0 {
            return Err(ConfigError::Invalid(
                "inbound_queue_size must be at least 1".to_string(),
            ));
        }
        if self.max_frame_size == 0 {
            return Err(ConfigError::Invalid(
                "max_frame_size must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Internal helpers
// ---------------------------------------------------------------------------

/// Load and parse a TOML config file for the relay.
fn load_config_file(
    explicit_path: Option<&std::path::Path>,
) -> Result<RelayConfigFile, ConfigError> {
    let path = if let Some(p) = explicit_path {
        let contents = std::fs::read_to_string(p).map_err(|e| ConfigError::ReadFile {
            path: p.to_path_buf(),
            source: e,
        })?;
        return Ok(toml::from_str(&contents)?);
    } else {
        let Some(config_dir) = dirs::config_dir() else {
            return Ok(RelayConfigFile::default());
        };
        config_dir.join("babble-relay").join("config.toml")
    };

    match std::fs::read_to_string(&path) {
        Ok(contents) => Ok(toml::from_str(&contents)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(RelayConfigFile::default()),
        Err(e) => Err(ConfigError::ReadFile { path, source: e }),
    }
}
