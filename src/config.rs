//! Configuration for the echomux server and client binaries.
//!
//! The server supports both command-line arguments and a TOML
//! configuration file; CLI arguments take precedence over file values.
//! The client is configured entirely from the command line.

use crate::frame;
use clap::Parser;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Command-line arguments for the echo server.
#[derive(Parser, Debug)]
#[command(name = "echomux-server")]
#[command(version = "0.1.0")]
#[command(about = "A framed echo server over a non-blocking event loop", long_about = None)]
pub struct ServerArgs {
    /// Port to listen on
    pub port: u16,

    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Address to bind to (e.g. 0.0.0.0)
    #[arg(long)]
    pub host: Option<String>,

    /// Maximum number of simultaneous connections
    #[arg(long)]
    pub max_connections: Option<usize>,

    /// Largest accepted frame in bytes (18..=65535)
    #[arg(long)]
    pub max_frame_size: Option<usize>,

    /// Readiness poll timeout in milliseconds
    #[arg(long)]
    pub poll_timeout_ms: Option<u64>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    pub log_level: Option<String>,
}

/// Command-line arguments for the benchmark client.
#[derive(Parser, Debug)]
#[command(name = "echomux-client")]
#[command(version = "0.1.0")]
#[command(about = "RTT benchmark client for the echomux server", long_about = None)]
pub struct ClientArgs {
    /// Server host name or address
    pub host: String,

    /// Server port
    pub port: u16,

    /// Size of each frame in bytes (18..=65535)
    pub size: usize,

    /// Number of exchanges (1..=10000)
    pub count: usize,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

/// TOML configuration file structure.
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub logging: LoggingSection,
}

/// Server-related configuration.
#[derive(Debug, Deserialize)]
pub struct ServerSection {
    /// Address to bind to
    #[serde(default = "default_host")]
    pub host: String,
    /// Maximum number of simultaneous connections
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    /// Largest accepted frame in bytes
    #[serde(default = "default_max_frame_size")]
    pub max_frame_size: usize,
    /// Readiness poll timeout in milliseconds
    #[serde(default = "default_poll_timeout_ms")]
    pub poll_timeout_ms: u64,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            host: default_host(),
            max_connections: default_max_connections(),
            max_frame_size: default_max_frame_size(),
            poll_timeout_ms: default_poll_timeout_ms(),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Deserialize)]
pub struct LoggingSection {
    /// Log level
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

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_max_connections() -> usize {
    1024
}

fn default_max_frame_size() -> usize {
    frame::MAX_FRAME_LEN
}

fn default_poll_timeout_ms() -> u64 {
    100
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub max_connections: usize,
    pub max_frame_size: usize,
    pub poll_timeout: Duration,
    pub log_level: String,
}

impl ServerConfig {
    /// Load configuration from CLI args and optional TOML file.
    /// CLI arguments take precedence over TOML file values.
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_args(ServerArgs::parse())
    }

    pub fn from_args(args: ServerArgs) -> Result<Self, ConfigError> {
        let toml_config = if let Some(ref config_path) = args.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|e| ConfigError::FileRead(config_path.clone(), e))?;
            toml::from_str(&contents)
                .map_err(|e| ConfigError::TomlParse(config_path.clone(), e))?
        } else {
            TomlConfig::default()
        };

        let config = ServerConfig {
            host: args.host.unwrap_or(toml_config.server.host),
            port: args.port,
            max_connections: args
                .max_connections
                .unwrap_or(toml_config.server.max_connections),
            max_frame_size: args
                .max_frame_size
                .unwrap_or(toml_config.server.max_frame_size),
            poll_timeout: Duration::from_millis(
                args.poll_timeout_ms
                    .unwrap_or(toml_config.server.poll_timeout_ms),
            ),
            log_level: args.log_level.unwrap_or(toml_config.logging.level),
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.max_frame_size < frame::HEADER_LEN || self.max_frame_size > frame::MAX_FRAME_LEN {
            return Err(ConfigError::MaxFrameSizeOutOfRange(self.max_frame_size));
        }
        Ok(())
    }
}

/// Final resolved client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub host: String,
    pub port: u16,
    pub size: usize,
    pub count: usize,
    pub log_level: String,
}

/// Valid exchange counts for a benchmark run.
pub const MAX_COUNT: usize = 10_000;

impl ClientConfig {
    /// Load and validate configuration from CLI args.
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_args(ClientArgs::parse())
    }

    pub fn from_args(args: ClientArgs) -> Result<Self, ConfigError> {
        let config = ClientConfig {
            host: args.host,
            port: args.port,
            size: args.size,
            count: args.count,
            log_level: args.log_level,
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.size < frame::HEADER_LEN || self.size > frame::MAX_FRAME_LEN {
            return Err(ConfigError::SizeOutOfRange(self.size));
        }
        if self.count < 1 || self.count > MAX_COUNT {
            return Err(ConfigError::CountOutOfRange(self.count));
        }
        Ok(())
    }
}

/// Configuration loading errors.
#[derive(Debug)]
pub enum ConfigError {
    FileRead(PathBuf, std::io::Error),
    TomlParse(PathBuf, toml::de::Error),
    SizeOutOfRange(usize),
    CountOutOfRange(usize),
    MaxFrameSizeOutOfRange(usize),
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
            ConfigError::SizeOutOfRange(size) => {
                write!(
                    f,
                    "Size must be between {} and {} bytes, got {}",
                    frame::HEADER_LEN,
                    frame::MAX_FRAME_LEN,
                    size
                )
            }
            ConfigError::CountOutOfRange(count) => {
                write!(f, "Count must be between 1 and {MAX_COUNT}, got {count}")
            }
            ConfigError::MaxFrameSizeOutOfRange(size) => {
                write!(
                    f,
                    "Max frame size must be between {} and {} bytes, got {}",
                    frame::HEADER_LEN,
                    frame::MAX_FRAME_LEN,
                    size
                )
            }
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::FileRead(_, e) => Some(e),
            ConfigError::TomlParse(_, e) => Some(e),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn server_args(port: u16) -> ServerArgs {
        ServerArgs {
            port,
            config: None,
            host: None,
            max_connections: None,
            max_frame_size: None,
            poll_timeout_ms: None,
            log_level: None,
        }
    }

    fn client_args(size: usize, count: usize) -> ClientArgs {
        ClientArgs {
            host: "localhost".to_string(),
            port: 9000,
            size,
            count,
            log_level: "info".to_string(),
        }
    }

    #[test]
    fn test_server_defaults() {
        let config = ServerConfig::from_args(server_args(9000)).unwrap();
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.port, 9000);
        assert_eq!(config.max_connections, 1024);
        assert_eq!(config.max_frame_size, 65535);
        assert_eq!(config.poll_timeout, Duration::from_millis(100));
        assert_eq!(config.log_level, "info");
    }

    #[test]
    fn test_toml_parsing() {
        let toml_str = r#"
            [server]
            host = "127.0.0.1"
            max_connections = 64
            max_frame_size = 4096
            poll_timeout_ms = 250

            [logging]
            level = "debug"
        "#;

        let config: TomlConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.server.max_connections, 64);
        assert_eq!(config.server.max_frame_size, 4096);
        assert_eq!(config.server.poll_timeout_ms, 250);
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn test_cli_overrides_file_defaults() {
        let mut args = server_args(9000);
        args.host = Some("127.0.0.1".to_string());
        args.max_frame_size = Some(1024);
        args.log_level = Some("trace".to_string());

        let config = ServerConfig::from_args(args).unwrap();
        assert_eq!(config.host, "127.0.0.1");
        assert_eq!(config.max_frame_size, 1024);
        assert_eq!(config.log_level, "trace");
    }

    #[test]
    fn test_server_max_frame_size_bounds() {
        let mut args = server_args(9000);
        args.max_frame_size = Some(17);
        assert!(matches!(
            ServerConfig::from_args(args),
            Err(ConfigError::MaxFrameSizeOutOfRange(17))
        ));

        let mut args = server_args(9000);
        args.max_frame_size = Some(65536);
        assert!(matches!(
            ServerConfig::from_args(args),
            Err(ConfigError::MaxFrameSizeOutOfRange(65536))
        ));

        let mut args = server_args(9000);
        args.max_frame_size = Some(18);
        assert!(ServerConfig::from_args(args).is_ok());
    }

    #[test]
    fn test_client_size_bounds() {
        assert!(matches!(
            ClientConfig::from_args(client_args(17, 1)),
            Err(ConfigError::SizeOutOfRange(17))
        ));
        assert!(matches!(
            ClientConfig::from_args(client_args(65536, 1)),
            Err(ConfigError::SizeOutOfRange(65536))
        ));
        assert!(ClientConfig::from_args(client_args(18, 1)).is_ok());
        assert!(ClientConfig::from_args(client_args(65535, 1)).is_ok());
    }

    #[test]
    fn test_client_count_bounds() {
        assert!(matches!(
            ClientConfig::from_args(client_args(18, 0)),
            Err(ConfigError::CountOutOfRange(0))
        ));
        assert!(matches!(
            ClientConfig::from_args(client_args(18, 10_001)),
            Err(ConfigError::CountOutOfRange(10_001))
        ));
        assert!(ClientConfig::from_args(client_args(18, 10_000)).is_ok());
    }
}
