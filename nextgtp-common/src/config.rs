//! Configuration structures for a GTP connection
//!
//! A [`ConnConfig`] describes one UDP endpoint: the address it binds, the GTP
//! version it speaks, its Restart Counter, the request retry policy, the path
//! keepalive settings and an optional kernel GTP device.
//!
//! # Example
//!
//! ```
//! use nextgtp_common::config::load_conn_config_from_str;
//! use nextgtp_common::GtpVersion;
//!
//! let yaml = r#"
//! local_addr: "127.0.0.1:2123"
//! version: v2
//! restart_counter: 7
//! "#;
//! let config = load_conn_config_from_str(yaml).unwrap();
//! assert_eq!(config.version, GtpVersion::V2);
//! assert_eq!(config.retry.max_retries, 3);
//! ```

use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::{GtpRole, GtpVersion};

/// Errors that can occur during configuration loading.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// File I/O error
    #[error("Failed to read configuration file: {0}")]
    IoError(#[from] std::io::Error),

    /// YAML parsing error
    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    /// Configuration validation error
    #[error("Configuration validation failed: {0}")]
    ValidationError(#[from] ConfigValidationError),
}

/// Errors that can occur during configuration validation.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigValidationError {
    /// Invalid retry policy
    #[error("Invalid retry configuration: {0}")]
    InvalidRetry(String),

    /// Invalid path management settings
    #[error("Invalid path configuration: {0}")]
    InvalidPath(String),

    /// Invalid kernel device settings
    #[error("Invalid kernel configuration: {0}")]
    InvalidKernel(String),

    /// Invalid buffer or queue sizes
    #[error("Invalid size: {0}")]
    InvalidSize(String),
}

/// Request retransmission policy.
///
/// A request is sent once and retransmitted up to `max_retries` times, every
/// `interval_ms`. The caller sees a timeout one interval after the last
/// retransmission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Interval between retransmissions in milliseconds (T3-RESPONSE)
    #[serde(default = "default_retry_interval_ms")]
    pub interval_ms: u64,
    /// Number of retransmissions before giving up (N3-REQUESTS)
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

impl RetryConfig {
    /// Retransmission interval as a [`Duration`].
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_retry_interval_ms(),
            max_retries: default_max_retries(),
        }
    }
}

fn default_retry_interval_ms() -> u64 {
    3000
}

fn default_max_retries() -> u32 {
    3
}

/// Path management (Echo keepalive) configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathConfig {
    /// Whether the keepalive ticker runs
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Interval between Echo Request rounds in milliseconds
    #[serde(default = "default_echo_interval_ms")]
    pub echo_interval_ms: u64,
    /// Time to wait for an Echo Response in milliseconds
    #[serde(default = "default_echo_timeout_ms")]
    pub echo_timeout_ms: u64,
    /// Consecutive missed Echo Responses before a path is declared down
    #[serde(default = "default_max_missed")]
    pub max_missed: u32,
}

impl PathConfig {
    /// Echo interval as a [`Duration`].
    pub fn echo_interval(&self) -> Duration {
        Duration::from_millis(self.echo_interval_ms)
    }

    /// Echo timeout as a [`Duration`].
    pub fn echo_timeout(&self) -> Duration {
        Duration::from_millis(self.echo_timeout_ms)
    }
}

impl Default for PathConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            echo_interval_ms: default_echo_interval_ms(),
            echo_timeout_ms: default_echo_timeout_ms(),
            max_missed: default_max_missed(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_echo_interval_ms() -> u64 {
    60_000
}

fn default_echo_timeout_ms() -> u64 {
    3000
}

fn default_max_missed() -> u32 {
    3
}

/// Kernel GTP device configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KernelConfig {
    /// Name of the GTP network device (e.g. `gtp0`)
    pub device: String,
    /// Role of this node on the device
    #[serde(default)]
    pub role: GtpRole,
    /// Record kernel objects in memory instead of touching the system
    #[serde(default)]
    pub dry_run: bool,
}

/// Configuration of one GTP connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnConfig {
    /// Local UDP address to bind
    pub local_addr: SocketAddr,
    /// GTP version spoken on this socket
    #[serde(default)]
    pub version: GtpVersion,
    /// Restart Counter advertised in Recovery IEs
    #[serde(default)]
    pub restart_counter: u8,
    /// Request retransmission policy
    #[serde(default)]
    pub retry: RetryConfig,
    /// Path keepalive settings
    #[serde(default)]
    pub path: PathConfig,
    /// Receive buffer size in bytes
    #[serde(default = "default_recv_buffer_size")]
    pub recv_buffer_size: usize,
    /// Capacity of the queue feeding received user-plane packets to the application
    #[serde(default = "default_user_plane_queue")]
    pub user_plane_queue: usize,
    /// Optional kernel GTP device
    #[serde(default)]
    pub kernel: Option<KernelConfig>,
    /// Peers monitored from startup
    #[serde(default)]
    pub peers: Vec<SocketAddr>,
}

fn default_recv_buffer_size() -> usize {
    65535
}

fn default_user_plane_queue() -> usize {
    1024
}

impl ConnConfig {
    /// Creates a configuration with defaults for everything but the address and version.
    pub fn new(local_addr: SocketAddr, version: GtpVersion) -> Self {
        Self {
            local_addr,
            version,
            restart_counter: 0,
            retry: RetryConfig::default(),
            path: PathConfig::default(),
            recv_buffer_size: default_recv_buffer_size(),
            user_plane_queue: default_user_plane_queue(),
            kernel: None,
            peers: Vec::new(),
        }
    }

    /// Sets the Restart Counter.
    pub fn with_restart_counter(mut self, restart_counter: u8) -> Self {
        self.restart_counter = restart_counter;
        self
    }

    /// Sets the retry policy.
    pub fn with_retry(mut self, interval: Duration, max_retries: u32) -> Self {
        self.retry = RetryConfig {
            interval_ms: interval.as_millis() as u64,
            max_retries,
        };
        self
    }

    /// Replaces the path keepalive settings.
    pub fn with_path(mut self, path: PathConfig) -> Self {
        self.path = path;
        self
    }

    /// Disables the keepalive ticker.
    pub fn without_path_management(mut self) -> Self {
        self.path.enabled = false;
        self
    }
}

/// Loads a connection configuration from a YAML file.
pub fn load_conn_config<P: AsRef<Path>>(path: P) -> Result<ConnConfig, ConfigError> {
    let contents = std::fs::read_to_string(path.as_ref())?;
    load_conn_config_from_str(&contents)
}

/// Loads a connection configuration from a YAML string.
pub fn load_conn_config_from_str(yaml: &str) -> Result<ConnConfig, ConfigError> {
    let config: ConnConfig =
        serde_yaml::from_str(yaml).map_err(|e| ConfigError::ParseError(e.to_string()))?;
    Ok(config)
}

/// Validates a connection configuration.
pub fn validate_conn_config(config: &ConnConfig) -> Result<(), ConfigValidationError> {
    if config.retry.interval_ms == 0 {
        return Err(ConfigValidationError::InvalidRetry(
            "retry interval must be greater than 0".to_string(),
        ));
    }

    if config.path.enabled {
        if config.path.echo_interval_ms == 0 {
            return Err(ConfigValidationError::InvalidPath(
                "echo interval must be greater than 0".to_string(),
            ));
        }
        if config.path.echo_timeout_ms == 0
            || config.path.echo_timeout_ms >= config.path.echo_interval_ms
        {
            return Err(ConfigValidationError::InvalidPath(format!(
                "echo timeout ({} ms) must be non-zero and shorter than the echo interval ({} ms)",
                config.path.echo_timeout_ms, config.path.echo_interval_ms
            )));
        }
        if config.path.max_missed == 0 {
            return Err(ConfigValidationError::InvalidPath(
                "max_missed must be at least 1".to_string(),
            ));
        }
    }

    if let Some(kernel) = &config.kernel {
        if kernel.device.trim().is_empty() {
            return Err(ConfigValidationError::InvalidKernel(
                "device name must not be empty".to_string(),
            ));
        }
        // IFNAMSIZ includes the trailing NUL
        if kernel.device.len() > 15 {
            return Err(ConfigValidationError::InvalidKernel(format!(
                "device name '{}' exceeds 15 characters",
                kernel.device
            )));
        }
    }

    if config.recv_buffer_size < 8 {
        return Err(ConfigValidationError::InvalidSize(
            "receive buffer must hold at least a GTP header".to_string(),
        ));
    }
    if config.user_plane_queue == 0 {
        return Err(ConfigValidationError::InvalidSize(
            "user plane queue must not be empty".to_string(),
        ));
    }

    Ok(())
}
