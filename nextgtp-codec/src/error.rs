//! Codec error type

use thiserror::Error;

/// GTP codec errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// Buffer too short for the structure being decoded
    #[error("buffer too short: need {needed} bytes, have {available}")]
    BufferTooShort {
        /// Number of bytes needed
        needed: usize,
        /// Number of bytes available
        available: usize,
    },
    /// Version bits name a GTP version this codec does not handle
    #[error("invalid GTP version: {0}")]
    InvalidVersion(u8),
    /// Protocol type bit is 0 (GTP')
    #[error("invalid protocol type: {0}, expected 1 for GTP")]
    InvalidProtocolType(u8),
    /// Extension header length of zero or inconsistent with its type
    #[error("invalid extension header length: {0}")]
    InvalidExtHeaderLength(u8),
    /// TV-format IE whose fixed length is not known, so the rest of the message cannot be walked
    #[error("unknown TV information element: {0}")]
    UnknownTvIe(u8),
    /// IE value length does not match what its type requires
    #[error("invalid IE length for type {ie_type}: expected {expected}, got {actual}")]
    InvalidIeLength {
        /// IE type
        ie_type: u8,
        /// Required length
        expected: usize,
        /// Actual length
        actual: usize,
    },
    /// IE value is malformed
    #[error("invalid IE value for type {ie_type}: {reason}")]
    InvalidIeValue {
        /// IE type
        ie_type: u8,
        /// Description of the problem
        reason: String,
    },
    /// Header length field disagrees with the content
    #[error("length mismatch: header says {header_len}, actual {actual_len}")]
    LengthMismatch {
        /// Length specified in header
        header_len: usize,
        /// Actual length
        actual_len: usize,
    },
    /// Encoded message does not fit the 16-bit length field
    #[error("message too long: {0} bytes")]
    MessageTooLong(usize),
    /// Sequence number does not fit the header of this version
    #[error("sequence number {0:#x} out of range")]
    SequenceOutOfRange(u32),
    /// Mandatory IE missing
    #[error("missing mandatory IE: {0}")]
    MissingIe(&'static str),
}
