//! # Relay configuration
//!
//! A TOML file is deserialized into a [`FileConfig`], where every field is
//! optional. [`FileConfig::into_config`] fills the gaps with defaults and
//! validates the result into a [`Config`], the only type the relay consumes.
//!
//! ```toml
//! listen_address = "0.0.0.0"
//! listen_port = 8388
//! timeout = 300
//! verbose = false
//! fast_open = false
//! ```
use std::{
    fs,
    net::{SocketAddr, ToSocketAddrs},
};

use serde::{Deserialize, Serialize};

pub const DEFAULT_LISTEN_ADDRESS: &str = "0.0.0.0";

pub const DEFAULT_LISTEN_PORT: u16 = 8388;

/// idle timeout of a session, in seconds
pub const DEFAULT_TIMEOUT: u64 = 300;

/// size of the buffer used for a single socket read
pub const DEFAULT_BUFFER_SIZE: usize = 32 * 1024;

/// a request whose header block does not end within this many bytes is dropped
pub const DEFAULT_MAX_HEADER_SIZE: usize = 64 * 1024;

pub const DEFAULT_MAX_CONNECTIONS: usize = 10_000;

pub const DEFAULT_LOG_LEVEL: &str = "info";

pub const DEFAULT_LOG_TARGET: &str = "stdout";

/// Number of iterations a session may run through in one readiness
/// notification before it is considered stuck
pub const MAX_LOOP_ITERATIONS: usize = 100_000;

const MIN_BUFFER_SIZE: usize = 1024;
const MAX_BUFFER_SIZE: usize = 16 * 1024 * 1024;

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("could not read the configuration file {path}: {error}")]
    FileRead { path: String, error: std::io::Error },
    #[error("could not parse the configuration: {0}")]
    DeserializeToml(String),
    #[error("invalid listen address {address}: {message}")]
    InvalidListenAddress { address: String, message: String },
    #[error("buffer_size must be between {min} and {max}, got {value}")]
    InvalidBufferSize { value: usize, min: usize, max: usize },
    #[error("max_header_size must be greater than zero")]
    InvalidMaxHeaderSize,
    #[error("max_connections must be greater than zero")]
    InvalidMaxConnections,
}

/// Configuration as written in the TOML file
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileConfig {
    pub listen_address: Option<String>,
    pub listen_port: Option<u16>,
    /// idle timeout in seconds, 0 disables the sweep
    pub timeout: Option<u64>,
    pub verbose: Option<bool>,
    pub fast_open: Option<bool>,
    pub buffer_size: Option<usize>,
    pub max_header_size: Option<usize>,
    pub max_connections: Option<usize>,
    pub log_level: Option<String>,
    pub log_target: Option<String>,
}

impl FileConfig {
    pub fn load_from_path(path: &str) -> Result<FileConfig, ConfigError> {
        let data = fs::read_to_string(path).map_err(|error| ConfigError::FileRead {
            path: path.to_owned(),
            error,
        })?;

        FileConfig::from_toml(&data)
    }

    pub fn from_toml(data: &str) -> Result<FileConfig, ConfigError> {
        toml::from_str(data).map_err(|e| ConfigError::DeserializeToml(e.to_string()))
    }

    pub fn into_config(self) -> Result<Config, ConfigError> {
        let buffer_size = self.buffer_size.unwrap_or(DEFAULT_BUFFER_SIZE);
        if !(MIN_BUFFER_SIZE..=MAX_BUFFER_SIZE).contains(&buffer_size) {
            return Err(ConfigError::InvalidBufferSize {
                value: buffer_size,
                min: MIN_BUFFER_SIZE,
                max: MAX_BUFFER_SIZE,
            });
        }

        let max_header_size = self.max_header_size.unwrap_or(DEFAULT_MAX_HEADER_SIZE);
        if max_header_size == 0 {
            return Err(ConfigError::InvalidMaxHeaderSize);
        }

        let max_connections = self.max_connections.unwrap_or(DEFAULT_MAX_CONNECTIONS);
        if max_connections == 0 {
            return Err(ConfigError::InvalidMaxConnections);
        }

        Ok(Config {
            listen_address: self
                .listen_address
                .unwrap_or_else(|| DEFAULT_LISTEN_ADDRESS.to_owned()),
            listen_port: self.listen_port.unwrap_or(DEFAULT_LISTEN_PORT),
            timeout: self.timeout.unwrap_or(DEFAULT_TIMEOUT),
            verbose: self.verbose.unwrap_or(false),
            fast_open: self.fast_open.unwrap_or(false),
            buffer_size,
            max_header_size,
            max_connections,
            log_level: self
                .log_level
                .unwrap_or_else(|| DEFAULT_LOG_LEVEL.to_owned()),
            log_target: self
                .log_target
                .unwrap_or_else(|| DEFAULT_LOG_TARGET.to_owned()),
        })
    }
}

/// Validated relay configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    pub listen_address: String,
    pub listen_port: u16,
    pub timeout: u64,
    pub verbose: bool,
    pub fast_open: bool,
    pub buffer_size: usize,
    pub max_header_size: usize,
    pub max_connections: usize,
    pub log_level: String,
    pub log_target: String,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            listen_address: DEFAULT_LISTEN_ADDRESS.to_owned(),
            listen_port: DEFAULT_LISTEN_PORT,
            timeout: DEFAULT_TIMEOUT,
            verbose: false,
            fast_open: false,
            buffer_size: DEFAULT_BUFFER_SIZE,
            max_header_size: DEFAULT_MAX_HEADER_SIZE,
            max_connections: DEFAULT_MAX_CONNECTIONS,
            log_level: DEFAULT_LOG_LEVEL.to_owned(),
            log_target: DEFAULT_LOG_TARGET.to_owned(),
        }
    }
}

impl Config {
    pub fn load_from_path(path: &str) -> Result<Config, ConfigError> {
        FileConfig::load_from_path(path)?.into_config()
    }

    /// resolve the listen address and port to the first matching socket address
    pub fn listen_socket_address(&self) -> Result<SocketAddr, ConfigError> {
        let invalid = |message: String| ConfigError::InvalidListenAddress {
            address: format!("{}:{}", self.listen_address, self.listen_port),
            message,
        };

        (self.listen_address.as_str(), self.listen_port)
            .to_socket_addrs()
            .map_err(|e| invalid(e.to_string()))?
            .next()
            .ok_or_else(|| invalid("no address found".to_owned()))
    }

    /// log level taking the verbose flag into account
    pub fn effective_log_level(&self) -> &str {
        if self.verbose {
            "trace"
        } else {
            &self.log_level
        }
    }
}
