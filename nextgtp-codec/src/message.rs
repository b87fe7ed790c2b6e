//! Version-independent message surface
//!
//! The connection engine only ever talks to messages through [`Message`]:
//! type, TEID, sequence number and marshalling. Per-type IE structure stays
//! inside the version modules.

use bytes::Bytes;
use nextgtp_common::GtpVersion;

use crate::error::CodecError;
use crate::v1::{Gtpv1Message, Gtpv1MessageType};
use crate::v2::{Gtpv2Message, Gtpv2MessageType, MAX_SEQUENCE};

/// Minimal message surface consumed by the connection layer
pub trait Message {
    /// Protocol version of the message
    fn version(&self) -> GtpVersion;

    /// Message type value
    fn message_type(&self) -> u8;

    /// TEID from the header (0 when absent)
    fn teid(&self) -> u32;

    /// Sequence number, if the header carries one
    fn sequence(&self) -> Option<u32>;

    /// Overwrite the sequence number
    fn set_sequence(&mut self, seq: u32) -> Result<(), CodecError>;

    /// Encode to wire format
    fn marshal(&self) -> Result<Bytes, CodecError>;

    /// Human readable message type name
    fn name(&self) -> &'static str;
}

/// A decoded GTP message of either version
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GtpMessage {
    /// GTPv1-C or GTPv1-U
    V1(Gtpv1Message),
    /// GTPv2-C
    V2(Gtpv2Message),
}

impl GtpMessage {
    /// Echo Request for the given version
    ///
    /// GTPv1 Echo Requests carry no Recovery IE; GTPv2 ones always do.
    pub fn echo_request(version: GtpVersion, seq: u32, restart_counter: u8) -> Self {
        match version {
            GtpVersion::V1 => Self::V1(Gtpv1Message::echo_request(seq as u16)),
            GtpVersion::V2 => Self::V2(Gtpv2Message::echo_request(seq, restart_counter)),
        }
    }

    /// Echo Response for the given version
    pub fn echo_response(version: GtpVersion, seq: u32, restart_counter: u8) -> Self {
        match version {
            GtpVersion::V1 => Self::V1(Gtpv1Message::echo_response(seq as u16, restart_counter)),
            GtpVersion::V2 => Self::V2(Gtpv2Message::echo_response(seq, restart_counter)),
        }
    }

    /// Version Not Supported reply in the given version
    pub fn version_not_supported(version: GtpVersion, seq: u32) -> Self {
        match version {
            GtpVersion::V1 => Self::V1(Gtpv1Message::version_not_supported(seq as u16)),
            GtpVersion::V2 => Self::V2(Gtpv2Message::version_not_supported_indication(seq)),
        }
    }

    /// Whether this is a triggered reply that resolves an outstanding request
    pub fn is_response(&self) -> bool {
        match self {
            Self::V1(m) => m.kind().is_some_and(Gtpv1MessageType::is_response),
            Self::V2(m) => m.kind().is_some_and(Gtpv2MessageType::is_response),
        }
    }

    /// Whether this is an Echo Request
    pub fn is_echo_request(&self) -> bool {
        match self {
            Self::V1(m) => m.kind() == Some(Gtpv1MessageType::EchoRequest),
            Self::V2(m) => m.kind() == Some(Gtpv2MessageType::EchoRequest),
        }
    }

    /// Whether this is an Echo Response
    pub fn is_echo_response(&self) -> bool {
        match self {
            Self::V1(m) => m.kind() == Some(Gtpv1MessageType::EchoResponse),
            Self::V2(m) => m.kind() == Some(Gtpv2MessageType::EchoResponse),
        }
    }

    /// Restart Counter from the Recovery IE, if present
    pub fn recovery(&self) -> Option<u8> {
        match self {
            Self::V1(m) => m.recovery(),
            Self::V2(m) => m.recovery(),
        }
    }

    /// The GTPv1 message, if this is one
    pub fn as_v1(&self) -> Option<&Gtpv1Message> {
        match self {
            Self::V1(m) => Some(m),
            Self::V2(_) => None,
        }
    }

    /// The GTPv2 message, if this is one
    pub fn as_v2(&self) -> Option<&Gtpv2Message> {
        match self {
            Self::V2(m) => Some(m),
            Self::V1(_) => None,
        }
    }
}

impl Message for GtpMessage {
    fn version(&self) -> GtpVersion {
        match self {
            Self::V1(_) => GtpVersion::V1,
            Self::V2(_) => GtpVersion::V2,
        }
    }

    fn message_type(&self) -> u8 {
        match self {
            Self::V1(m) => m.message_type,
            Self::V2(m) => m.message_type,
        }
    }

    fn teid(&self) -> u32 {
        match self {
            Self::V1(m) => m.teid,
            Self::V2(m) => m.teid.unwrap_or(0),
        }
    }

    fn sequence(&self) -> Option<u32> {
        match self {
            Self::V1(m) => m.sequence_number.map(u32::from),
            Self::V2(m) => Some(m.sequence_number),
        }
    }

    fn set_sequence(&mut self, seq: u32) -> Result<(), CodecError> {
        match self {
            Self::V1(m) => {
                let seq = u16::try_from(seq).map_err(|_| CodecError::SequenceOutOfRange(seq))?;
                m.sequence_number = Some(seq);
            }
            Self::V2(m) => {
                if seq > MAX_SEQUENCE {
                    return Err(CodecError::SequenceOutOfRange(seq));
                }
                m.sequence_number = seq;
            }
        }
        Ok(())
    }

    fn marshal(&self) -> Result<Bytes, CodecError> {
        match self {
            Self::V1(m) => m.encode().map(|b| b.freeze()),
            Self::V2(m) => m.encode().map(|b| b.freeze()),
        }
    }

    fn name(&self) -> &'static str {
        match self {
            Self::V1(m) => m.kind().map_or("Unknown GTPv1", Gtpv1MessageType::name),
            Self::V2(m) => m.kind().map_or("Unknown GTPv2", Gtpv2MessageType::name),
        }
    }
}

impl From<Gtpv1Message> for GtpMessage {
    fn from(msg: Gtpv1Message) -> Self {
        Self::V1(msg)
    }
}

impl From<Gtpv2Message> for GtpMessage {
    fn from(msg: Gtpv2Message) -> Self {
        Self::V2(msg)
    }
}

/// Peek at the version bits of a datagram
pub fn peek_version(data: &[u8]) -> Result<u8, CodecError> {
    data.first()
        .map(|flags| (flags >> 5) & 0x07)
        .ok_or(CodecError::BufferTooShort {
            needed: 1,
            available: 0,
        })
}

/// Parse a datagram into a message, dispatching on the version bits
pub fn parse(data: &[u8]) -> Result<GtpMessage, CodecError> {
    match peek_version(data)? {
        1 => Gtpv1Message::decode(data).map(GtpMessage::V1),
        2 => Gtpv2Message::decode(data).map(GtpMessage::V2),
        other => Err(CodecError::InvalidVersion(other)),
    }
}
