//! Error types for nextgtp

use thiserror::Error;

/// Error type shared by the nextgtp crates for configuration and socket setup.
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration-related errors.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Network I/O errors.
    #[error("Network error: {0}")]
    Network(#[from] std::io::Error),

    /// The socket was closed.
    #[error("Socket closed")]
    Closed,

    /// YAML parsing errors.
    #[error("YAML parse error: {0}")]
    YamlParse(#[from] serde_yaml::Error),
}
