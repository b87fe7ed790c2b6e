//! Common types and utilities for nextgtp
//!
//! This crate provides the configuration structures, logging setup, error type
//! and UDP transport shared by the nextgtp codec, connection engine and node
//! binary.

pub mod config;
pub mod error;
pub mod logging;
pub mod transport;
pub mod types;

pub use config::{
    load_conn_config, load_conn_config_from_str, validate_conn_config, ConfigError,
    ConfigValidationError, ConnConfig, KernelConfig, PathConfig, RetryConfig,
};
pub use error::Error;
pub use logging::{
    format_hex_dump, init_logging, init_logging_with_filter, log_gtp_message, Direction, LogLevel,
};
pub use transport::UdpTransport;
pub use types::{GtpRole, GtpVersion};
