//! Error types for the connection engine

use std::fmt;
use std::net::SocketAddr;

use nextgtp_codec::CodecError;
use nextgtp_common::ConfigValidationError;
use thiserror::Error;

use crate::kernel::KernelObject;

/// Outcome of a request that did not produce a matched response
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransactionError {
    /// No response after the initial send and every retransmission
    #[error("request timed out after {retransmissions} retransmissions")]
    TimedOut {
        /// Number of retransmissions that were sent
        retransmissions: u32,
    },
    /// The caller gave up or the connection was closed
    #[error("transaction cancelled")]
    Cancelled,
    /// Every sequence number towards this peer is in flight
    #[error("no free sequence number towards {0}")]
    SequenceExhausted(SocketAddr),
    /// The tracker no longer accepts new transactions
    #[error("transaction tracker closed")]
    Closed,
}

/// Tunnel and session table errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TunnelError {
    /// TEID 0 is reserved
    #[error("invalid TEID: {0:#x}")]
    InvalidTeid(u32),
    /// A tunnel with this local TEID already exists
    #[error("duplicate tunnel: TEID {0:#x}")]
    DuplicateTeid(u32),
    /// No tunnel with this local TEID
    #[error("tunnel not found: TEID {0:#x}")]
    TunnelNotFound(u32),
    /// No session with this identifier
    #[error("session not found: {0}")]
    SessionNotFound(u64),
    /// A session for this subscriber already exists
    #[error("duplicate session for IMSI {0}")]
    DuplicateSession(String),
    /// Random allocation kept colliding with TEIDs in use
    #[error("TEID space exhausted")]
    TeidSpaceExhausted,
}

/// Kernel control channel errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum KernelError {
    /// External command exited unsuccessfully
    #[error("{command} failed ({status}): {stderr}")]
    CommandFailed {
        /// Command line that was run
        command: String,
        /// Exit status description
        status: String,
        /// Captured standard error
        stderr: String,
    },
    /// Command could not be started
    #[error("failed to run {command}: {reason}")]
    Spawn {
        /// Command line that was attempted
        command: String,
        /// Underlying I/O error text
        reason: String,
    },
    /// Object does not exist in the kernel
    #[error("kernel object not found: {0}")]
    NotFound(String),
    /// Object already exists in the kernel
    #[error("kernel object exists: {0}")]
    Exists(String),
    /// Kernel GTP is not enabled on this connection
    #[error("kernel GTP not enabled")]
    NotEnabled,
    /// Kernel GTP is already enabled on this connection
    #[error("kernel GTP already enabled on device {0}")]
    AlreadyEnabled(String),
    /// The bridge was closed; nothing more is programmed
    #[error("kernel GTP bridge closed")]
    Closed,
}

/// Every kernel object that could not be removed during cleanup
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CleanupError {
    /// Failed removals in the order they were attempted
    pub failures: Vec<(KernelObject, KernelError)>,
}

impl CleanupError {
    /// Whether cleanup completed without failures
    pub fn is_empty(&self) -> bool {
        self.failures.is_empty()
    }

    /// Number of objects left behind
    pub fn len(&self) -> usize {
        self.failures.len()
    }

    pub(crate) fn push(&mut self, object: KernelObject, error: KernelError) {
        self.failures.push((object, error));
    }

    pub(crate) fn into_result(self) -> Result<(), CleanupError> {
        if self.is_empty() {
            Ok(())
        } else {
            Err(self)
        }
    }
}

impl fmt::Display for CleanupError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} kernel objects not removed", self.failures.len())?;
        for (object, error) in &self.failures {
            write!(f, "; {object}: {error}")?;
        }
        Ok(())
    }
}

impl std::error::Error for CleanupError {}

/// Error returned by a message handler
///
/// Handler errors are logged by the receive loop and never stop it.
#[derive(Debug, Error)]
pub enum HandlerError {
    /// Message could not be decoded or built
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),
    /// Tunnel or session bookkeeping failed
    #[error("tunnel error: {0}")]
    Tunnel(#[from] TunnelError),
    /// Reply could not be sent or a connection operation failed
    #[error("connection error: {0}")]
    Conn(#[from] ConnError),
    /// Message was understood but rejected
    #[error("rejected: {0}")]
    Rejected(String),
}

/// Connection errors
#[derive(Debug, Error)]
pub enum ConnError {
    /// Configuration is invalid
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigValidationError),
    /// Socket setup or I/O failure
    #[error("transport error: {0}")]
    Transport(#[from] nextgtp_common::Error),
    /// Message encoding failure
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),
    /// Request did not complete
    #[error("transaction error: {0}")]
    Transaction(#[from] TransactionError),
    /// Tunnel or session table failure
    #[error("tunnel error: {0}")]
    Tunnel(#[from] TunnelError),
    /// Kernel programming failure; user-space state was left unchanged
    #[error("kernel error: {0}")]
    Kernel(#[from] KernelError),
    /// User-space state changed but the kernel could not follow
    #[error("kernel out of sync for TEID {tunnel:#x}: {source}")]
    Degraded {
        /// Local TEID of the affected tunnel
        tunnel: u32,
        /// Kernel failure
        source: KernelError,
    },
    /// Kernel objects were left behind on close
    #[error("cleanup incomplete: {0}")]
    Cleanup(#[from] CleanupError),
    /// Message version does not match the connection
    #[error("message version {actual} does not match connection version {expected}")]
    VersionMismatch {
        /// Connection version
        expected: nextgtp_common::GtpVersion,
        /// Message version
        actual: nextgtp_common::GtpVersion,
    },
    /// Another task is already running the receive loop
    #[error("receive loop already running")]
    AlreadyServing,
    /// Connection has been closed
    #[error("connection closed")]
    Closed,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        assert_eq!(
            TransactionError::TimedOut { retransmissions: 2 }.to_string(),
            "request timed out after 2 retransmissions"
        );
        assert_eq!(
            TunnelError::TunnelNotFound(0x1234).to_string(),
            "tunnel not found: TEID 0x1234"
        );
        let err = ConnError::Degraded {
            tunnel: 0x10,
            source: KernelError::NotEnabled,
        };
        assert_eq!(
            err.to_string(),
            "kernel out of sync for TEID 0x10: kernel GTP not enabled"
        );
    }

    #[test]
    fn test_cleanup_error_lists_every_failure() {
        let mut err = CleanupError::default();
        assert!(err.clone().into_result().is_ok());

        err.push(
            KernelObject::Device {
                name: "gtp0".into(),
            },
            KernelError::NotFound("gtp0".into()),
        );
        err.push(
            KernelObject::Rule {
                from: "10.0.0.1".parse().unwrap(),
                table: 100,
            },
            KernelError::NotEnabled,
        );
        assert_eq!(err.len(), 2);
        let text = err.to_string();
        assert!(text.starts_with("2 kernel objects not removed"));
        assert!(text.contains("device gtp0"));
        assert!(text.contains("rule from 10.0.0.1 table 100"));
    }
}
