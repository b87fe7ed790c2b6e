//! Logging infrastructure for nextgtp
//!
//! This module provides configurable logging using the `tracing` crate,
//! GTP message logging and hex dump formatting for debugging.

use std::fmt;
use tracing_subscriber::{fmt::format::FmtSpan, EnvFilter};

use crate::types::GtpVersion;

/// Log level configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogLevel {
    /// Trace level - most verbose
    Trace,
    /// Debug level
    Debug,
    /// Info level (default)
    #[default]
    Info,
    /// Warn level
    Warn,
    /// Error level - least verbose
    Error,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogLevel::Trace => write!(f, "trace"),
            LogLevel::Debug => write!(f, "debug"),
            LogLevel::Info => write!(f, "info"),
            LogLevel::Warn => write!(f, "warn"),
            LogLevel::Error => write!(f, "error"),
        }
    }
}

impl std::str::FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "trace" => Ok(LogLevel::Trace),
            "debug" => Ok(LogLevel::Debug),
            "info" => Ok(LogLevel::Info),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "error" => Ok(LogLevel::Error),
            _ => Err(format!("unknown log level: {s}")),
        }
    }
}

/// Initialize the tracing subscriber with the specified log level.
///
/// This should be called once at application startup. The log level can be
/// overridden by the `RUST_LOG` environment variable. Library crates never
/// call this.
///
/// # Example
///
/// ```no_run
/// use nextgtp_common::logging::{init_logging, LogLevel};
///
/// init_logging(LogLevel::Debug);
/// ```
pub fn init_logging(level: LogLevel) {
    init_logging_with_filter(&level.to_string());
}

/// Initialize logging with a custom filter string.
///
/// Allows fine-grained control over which modules log at which levels.
///
/// # Example
///
/// ```no_run
/// use nextgtp_common::logging::init_logging_with_filter;
///
/// // Default to info, but trace the transaction tracker
/// init_logging_with_filter("info,nextgtp_conn::transaction=trace");
/// ```
pub fn init_logging_with_filter(filter: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_span_events(FmtSpan::NONE)
        .try_init();
}

/// Protocol direction for logging
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Incoming/received message
    Rx,
    /// Outgoing/transmitted message
    Tx,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Rx => write!(f, "RX"),
            Direction::Tx => write!(f, "TX"),
        }
    }
}

/// Log a GTP message at debug level with a hex dump at trace level.
///
/// # Arguments
///
/// * `direction` - Message direction (RX or TX)
/// * `version` - GTP version of the message
/// * `msg_type` - Message type name
/// * `data` - Raw message bytes
///
/// # Example
///
/// ```
/// use nextgtp_common::logging::{log_gtp_message, Direction};
/// use nextgtp_common::GtpVersion;
///
/// let data = [0x32, 0x01, 0x00, 0x04, 0x00, 0x00, 0x00, 0x00];
/// log_gtp_message(Direction::Tx, GtpVersion::V1, "Echo Request", &data);
/// ```
pub fn log_gtp_message(direction: Direction, version: GtpVersion, msg_type: &str, data: &[u8]) {
    tracing::debug!(
        protocol = %version,
        direction = %direction,
        msg_type = msg_type,
        len = data.len(),
        "{} {} {}",
        direction,
        version,
        msg_type
    );
    tracing::trace!(
        protocol = %version,
        hex = %HexDump(data),
        "{} payload",
        version
    );
}

struct HexDump<'a>(&'a [u8]);

impl fmt::Display for HexDump<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

/// Format bytes as a hex dump with offset, hex, and ASCII columns.
///
/// # Example
///
/// ```
/// use nextgtp_common::logging::format_hex_dump;
///
/// let dump = format_hex_dump(b"GTP");
/// assert!(dump.starts_with("00000000  47 54 50"));
/// ```
pub fn format_hex_dump(data: &[u8]) -> String {
    if data.is_empty() {
        return String::from("(empty)");
    }

    let mut result = String::new();
    let mut offset = 0;

    for chunk in data.chunks(16) {
        result.push_str(&format!("{offset:08x}  "));

        for (i, byte) in chunk.iter().enumerate() {
            if i == 8 {
                result.push(' ');
            }
            result.push_str(&format!("{byte:02x} "));
        }

        // Padding for incomplete lines
        let padding = 16 - chunk.len();
        for i in 0..padding {
            if chunk.len() + i == 8 {
                result.push(' ');
            }
            result.push_str("   ");
        }

        result.push_str(" |");
        for byte in chunk {
            if byte.is_ascii_graphic() || *byte == b' ' {
                result.push(*byte as char);
            } else {
                result.push('.');
            }
        }
        result.push('|');
        result.push('\n');

        offset += 16;
    }

    result.pop();
    result
}
