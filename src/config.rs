//! Configuration for the server and client binaries.
//!
//! Both binaries run with no arguments at all. Optional flags and an
//! optional TOML file can override the defaults; CLI arguments take
//! precedence over config file values.

use crate::client::DispatchConfig;
use clap::Parser;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Command-line arguments for the server
///
/// Every flag is optional. With none given the server binds the fixed
/// default address `127.0.0.1:50051`.
#[derive(Parser, Debug)]
#[command(name = "snippets-server")]
#[command(version = "0.1.0")]
#[command(about = "Delayed-echo RPC server", long_about = None)]
pub struct ServerArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Address to bind to (e.g., 127.0.0.1:50051)
    #[arg(short = 'l', long)]
    pub listen: Option<String>,

    /// Maximum number of concurrent connections
    #[arg(long)]
    pub max_connections: Option<usize>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

/// Command-line arguments for the client
///
/// The only argument of the plain invocation is the optional positional
/// `NAME` (default `world`). The flags and `--config` are optional extras
/// for overriding the built-in defaults.
#[derive(Parser, Debug)]
#[command(name = "snippets-client")]
#[command(version = "0.1.0")]
#[command(about = "Fan out concurrent delayed-echo calls", long_about = None)]
pub struct ClientArgs {
    /// Name prefix sent with every request
    pub name: Option<String>,

    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Server address (e.g., localhost:50051)
    #[arg(short = 'a', long)]
    pub addr: Option<String>,

    /// Number of concurrent calls
    #[arg(short = 'n', long)]
    pub count: Option<usize>,

    /// Delay increment per call index, in milliseconds
    #[arg(long)]
    pub delay_step_ms: Option<u64>,

    /// How long to wait before abandoning outstanding calls, in milliseconds
    #[arg(long)]
    pub drain_ms: Option<u64>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub client: ClientSection,
    #[serde(default)]
    pub logging: LoggingSection,
}

/// Server-related configuration
#[derive(Debug, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_listen")]
    pub listen: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            max_connections: default_max_connections(),
        }
    }
}

/// Client-related configuration
#[derive(Debug, Deserialize)]
pub struct ClientSection {
    #[serde(default = "default_addr")]
    pub addr: String,
    #[serde(default = "default_name")]
    pub name: String,
    #[serde(default = "default_count")]
    pub count: usize,
    #[serde(default = "default_delay_step_ms")]
    pub delay_step_ms: u64,
    #[serde(default = "default_drain_ms")]
    pub drain_ms: u64,
}

impl Default for ClientSection {
    fn default() -> Self {
        Self {
            addr: default_addr(),
            name: default_name(),
            count: default_count(),
            delay_step_ms: default_delay_step_ms(),
            drain_ms: default_drain_ms(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Deserialize)]
pub struct LoggingSection {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_listen() -> String {
    "127.0.0.1:50051".to_string()
}

fn default_max_connections() -> usize {
    10_000
}

fn default_addr() -> String {
    "localhost:50051".to_string()
}

fn default_name() -> String {
    "world".to_string()
}

fn default_count() -> usize {
    10
}

fn default_delay_step_ms() -> u64 {
    1000
}

fn default_drain_ms() -> u64 {
    3000
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Resolved server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen: String,
    pub max_connections: usize,
    pub log_level: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        let toml = TomlConfig::default();
        Self {
            listen: toml.server.listen,
            max_connections: toml.server.max_connections,
            log_level: toml.logging.level,
        }
    }
}

impl ServerConfig {
    /// Load from the process arguments and optional TOML file.
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_args(ServerArgs::parse())
    }

    pub fn from_args(cli: ServerArgs) -> Result<Self, ConfigError> {
        let toml_config = load_toml(cli.config.as_deref())?;

        Ok(ServerConfig {
            listen: cli.listen.unwrap_or(toml_config.server.listen),
            max_connections: cli
                .max_connections
                .unwrap_or(toml_config.server.max_connections),
            log_level: merge_log_level(cli.log_level, toml_config.logging.level),
        })
    }
}

/// Resolved client configuration
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub dispatch: DispatchConfig,
    pub log_level: String,
}

impl ClientConfig {
    /// Load from the process arguments and optional TOML file.
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_args(ClientArgs::parse())
    }

    pub fn from_args(cli: ClientArgs) -> Result<Self, ConfigError> {
        let toml_config = load_toml(cli.config.as_deref())?;
        let client = toml_config.client;

        Ok(ClientConfig {
            dispatch: DispatchConfig {
                addr: cli.addr.unwrap_or(client.addr),
                count: cli.count.unwrap_or(client.count),
                name_prefix: cli.name.unwrap_or(client.name),
                delay_step: Duration::from_millis(
                    cli.delay_step_ms.unwrap_or(client.delay_step_ms),
                ),
                drain_timeout: Duration::from_millis(cli.drain_ms.unwrap_or(client.drain_ms)),
            },
            log_level: merge_log_level(cli.log_level, toml_config.logging.level),
        })
    }
}

fn load_toml(path: Option<&Path>) -> Result<TomlConfig, ConfigError> {
    match path {
        Some(path) => {
            let contents = std::fs::read_to_string(path)
                .map_err(|e| ConfigError::FileRead(path.to_path_buf(), e))?;
            toml::from_str(&contents).map_err(|e| ConfigError::TomlParse(path.to_path_buf(), e))
        }
        None => Ok(TomlConfig::default()),
    }
}

fn merge_log_level(cli: String, file: String) -> String {
    if cli != "info" {
        cli
    } else {
        file
    }
}

/// Configuration loading errors
#[derive(Debug)]
pub enum ConfigError {
    FileRead(PathBuf, std::io::Error),
    TomlParse(PathBuf, toml::de::Error),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::FileRead(path, e) => {
                write!(f, "Failed to read config file '{}': {}", path.display(), e)
            }
            ConfigError::TomlParse(path, e) => {
                write!(f, "Failed to parse config file '{}': {}", path.display(), e)
            }
        }
    }
}

impl std::error::Error for ConfigError {}
