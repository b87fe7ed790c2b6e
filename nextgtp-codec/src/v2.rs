//! GTPv2-C encoding/decoding (3GPP TS 29.274)
//!
//! The header carries an optional TEID, a 24-bit sequence number and an
//! optional message priority. IEs are `type | length | instance | value`;
//! grouped IEs nest further IEs inside their value.

use std::net::{Ipv4Addr, Ipv6Addr};

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::CodecError;

/// GTPv2 protocol version
pub const GTP_VERSION: u8 = 2;

/// Header size without TEID
pub const HEADER_SIZE_NO_TEID: usize = 8;

/// Header size with TEID
pub const HEADER_SIZE_WITH_TEID: usize = 12;

/// Largest sequence number representable in the header
pub const MAX_SEQUENCE: u32 = 0x00FF_FFFF;

/// GTPv2-C message types handled by the connection engine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Gtpv2MessageType {
    /// Echo Request
    EchoRequest = 1,
    /// Echo Response
    EchoResponse = 2,
    /// Version Not Supported Indication
    VersionNotSupportedIndication = 3,
    /// Create Session Request
    CreateSessionRequest = 32,
    /// Create Session Response
    CreateSessionResponse = 33,
    /// Modify Bearer Request
    ModifyBearerRequest = 34,
    /// Modify Bearer Response
    ModifyBearerResponse = 35,
    /// Delete Session Request
    DeleteSessionRequest = 36,
    /// Delete Session Response
    DeleteSessionResponse = 37,
    /// Create Bearer Request
    CreateBearerRequest = 95,
    /// Create Bearer Response
    CreateBearerResponse = 96,
    /// Update Bearer Request
    UpdateBearerRequest = 97,
    /// Update Bearer Response
    UpdateBearerResponse = 98,
    /// Delete Bearer Request
    DeleteBearerRequest = 99,
    /// Delete Bearer Response
    DeleteBearerResponse = 100,
    /// Delete PDN Connection Set Request
    DeletePdnConnectionSetRequest = 101,
    /// Delete PDN Connection Set Response
    DeletePdnConnectionSetResponse = 102,
    /// Release Access Bearers Request
    ReleaseAccessBearersRequest = 170,
    /// Release Access Bearers Response
    ReleaseAccessBearersResponse = 171,
    /// Downlink Data Notification
    DownlinkDataNotification = 176,
    /// Downlink Data Notification Acknowledge
    DownlinkDataNotificationAck = 177,
}

impl Gtpv2MessageType {
    /// Convert from u8 to a known message type
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::EchoRequest),
            2 => Some(Self::EchoResponse),
            3 => Some(Self::VersionNotSupportedIndication),
            32 => Some(Self::CreateSessionRequest),
            33 => Some(Self::CreateSessionResponse),
            34 => Some(Self::ModifyBearerRequest),
            35 => Some(Self::ModifyBearerResponse),
            36 => Some(Self::DeleteSessionRequest),
            37 => Some(Self::DeleteSessionResponse),
            95 => Some(Self::CreateBearerRequest),
            96 => Some(Self::CreateBearerResponse),
            97 => Some(Self::UpdateBearerRequest),
            98 => Some(Self::UpdateBearerResponse),
            99 => Some(Self::DeleteBearerRequest),
            100 => Some(Self::DeleteBearerResponse),
            101 => Some(Self::DeletePdnConnectionSetRequest),
            102 => Some(Self::DeletePdnConnectionSetResponse),
            170 => Some(Self::ReleaseAccessBearersRequest),
            171 => Some(Self::ReleaseAccessBearersResponse),
            176 => Some(Self::DownlinkDataNotification),
            177 => Some(Self::DownlinkDataNotificationAck),
            _ => None,
        }
    }

    /// Human readable name
    pub fn name(self) -> &'static str {
        match self {
            Self::EchoRequest => "Echo Request",
            Self::EchoResponse => "Echo Response",
            Self::VersionNotSupportedIndication => "Version Not Supported Indication",
            Self::CreateSessionRequest => "Create Session Request",
            Self::CreateSessionResponse => "Create Session Response",
            Self::ModifyBearerRequest => "Modify Bearer Request",
            Self::ModifyBearerResponse => "Modify Bearer Response",
            Self::DeleteSessionRequest => "Delete Session Request",
            Self::DeleteSessionResponse => "Delete Session Response",
            Self::CreateBearerRequest => "Create Bearer Request",
            Self::CreateBearerResponse => "Create Bearer Response",
            Self::UpdateBearerRequest => "Update Bearer Request",
            Self::UpdateBearerResponse => "Update Bearer Response",
            Self::DeleteBearerRequest => "Delete Bearer Request",
            Self::DeleteBearerResponse => "Delete Bearer Response",
            Self::DeletePdnConnectionSetRequest => "Delete PDN Connection Set Request",
            Self::DeletePdnConnectionSetResponse => "Delete PDN Connection Set Response",
            Self::ReleaseAccessBearersRequest => "Release Access Bearers Request",
            Self::ReleaseAccessBearersResponse => "Release Access Bearers Response",
            Self::DownlinkDataNotification => "Downlink Data Notification",
            Self::DownlinkDataNotificationAck => "Downlink Data Notification Acknowledge",
        }
    }

    /// Whether this type is a triggered reply matched against an outstanding request
    pub fn is_response(self) -> bool {
        matches!(
            self,
            Self::EchoResponse
                | Self::VersionNotSupportedIndication
                | Self::CreateSessionResponse
                | Self::ModifyBearerResponse
                | Self::DeleteSessionResponse
                | Self::CreateBearerResponse
                | Self::UpdateBearerResponse
                | Self::DeleteBearerResponse
                | Self::DeletePdnConnectionSetResponse
                | Self::ReleaseAccessBearersResponse
                | Self::DownlinkDataNotificationAck
        )
    }
}

/// GTPv2 IE types used by the engine
pub mod ie_type {
    /// International Mobile Subscriber Identity
    pub const IMSI: u8 = 1;
    /// Cause
    pub const CAUSE: u8 = 2;
    /// Recovery (Restart Counter)
    pub const RECOVERY: u8 = 3;
    /// Access Point Name
    pub const APN: u8 = 71;
    /// Aggregate Maximum Bit Rate
    pub const AMBR: u8 = 72;
    /// EPS Bearer ID
    pub const EBI: u8 = 73;
    /// MSISDN
    pub const MSISDN: u8 = 76;
    /// PDN Address Allocation
    pub const PAA: u8 = 79;
    /// RAT Type
    pub const RAT_TYPE: u8 = 82;
    /// Fully Qualified TEID
    pub const F_TEID: u8 = 87;
    /// Bearer Context (grouped)
    pub const BEARER_CONTEXT: u8 = 93;
    /// PDN Type
    pub const PDN_TYPE: u8 = 99;
    /// Private Extension
    pub const PRIVATE_EXTENSION: u8 = 255;
}

/// Cause values (TS 29.274 table 8.4-1)
pub mod cause {
    /// Request accepted
    pub const REQUEST_ACCEPTED: u8 = 16;
    /// Request accepted partially
    pub const REQUEST_ACCEPTED_PARTIALLY: u8 = 17;
    /// Context Not Found
    pub const CONTEXT_NOT_FOUND: u8 = 64;
    /// Invalid message format
    pub const INVALID_MESSAGE_FORMAT: u8 = 65;
    /// Mandatory IE missing
    pub const MANDATORY_IE_MISSING: u8 = 70;
    /// System failure
    pub const SYSTEM_FAILURE: u8 = 72;
    /// No resources available
    pub const NO_RESOURCES_AVAILABLE: u8 = 73;

    /// Whether the cause value reports acceptance
    pub fn is_accepted(value: u8) -> bool {
        (16..=63).contains(&value)
    }
}

/// F-TEID interface types (TS 29.274 section 8.22)
pub mod interface_type {
    /// S1-U eNodeB GTP-U
    pub const S1U_ENODEB_GTPU: u8 = 0;
    /// S1-U SGW GTP-U
    pub const S1U_SGW_GTPU: u8 = 1;
    /// S5/S8 SGW GTP-U
    pub const S5S8_SGW_GTPU: u8 = 4;
    /// S5/S8 PGW GTP-U
    pub const S5S8_PGW_GTPU: u8 = 5;
    /// S5/S8 SGW GTP-C
    pub const S5S8_SGW_GTPC: u8 = 6;
    /// S5/S8 PGW GTP-C
    pub const S5S8_PGW_GTPC: u8 = 7;
    /// S11 MME GTP-C
    pub const S11_MME_GTPC: u8 = 10;
    /// S11/S4 SGW GTP-C
    pub const S11S4_SGW_GTPC: u8 = 11;
}

/// GTPv2 Information Element
///
/// IEs the engine does not interpret are carried verbatim, so a message
/// can be re-marshalled without loss.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ie {
    /// IE type
    pub ie_type: u8,
    /// Instance (low 4 bits of the fourth octet)
    pub instance: u8,
    /// Raw value
    pub value: Bytes,
}

impl Ie {
    /// Create an IE with instance 0
    pub fn new(ie_type: u8, value: impl Into<Bytes>) -> Self {
        Self {
            ie_type,
            instance: 0,
            value: value.into(),
        }
    }

    /// Set the instance
    pub fn with_instance(mut self, instance: u8) -> Self {
        self.instance = instance & 0x0F;
        self
    }

    /// Grouped IE built from child IEs
    pub fn grouped(ie_type: u8, children: &[Ie]) -> Result<Self, CodecError> {
        let mut buf = BytesMut::new();
        for child in children {
            child.encode_to(&mut buf)?;
        }
        Ok(Self::new(ie_type, buf.freeze()))
    }

    /// Decode the value of a grouped IE into its children
    pub fn children(&self) -> Result<Vec<Ie>, CodecError> {
        Ie::decode_all(&self.value)
    }

    /// Recovery IE carrying a Restart Counter
    pub fn recovery(restart_counter: u8) -> Self {
        Self::new(ie_type::RECOVERY, vec![restart_counter])
    }

    /// Cause IE with no flags set
    pub fn cause(value: u8) -> Self {
        Self::new(ie_type::CAUSE, vec![value, 0])
    }

    /// EPS Bearer ID IE
    pub fn ebi(ebi: u8) -> Self {
        Self::new(ie_type::EBI, vec![ebi & 0x0F])
    }

    /// IMSI IE, TBCD-encoded
    pub fn imsi(imsi: &str) -> Result<Self, CodecError> {
        Ok(Self::new(ie_type::IMSI, encode_tbcd(ie_type::IMSI, imsi)?))
    }

    /// F-TEID IE
    pub fn fteid(fteid: &FTeid) -> Self {
        Self::new(ie_type::F_TEID, fteid.encode())
    }

    /// PAA IE
    pub fn paa(paa: &Paa) -> Self {
        Self::new(ie_type::PAA, paa.encode())
    }

    /// First value octet
    pub fn as_u8(&self) -> Result<u8, CodecError> {
        self.value.first().copied().ok_or(CodecError::InvalidIeLength {
            ie_type: self.ie_type,
            expected: 1,
            actual: 0,
        })
    }

    /// IMSI digits
    pub fn as_imsi(&self) -> Result<String, CodecError> {
        decode_tbcd(self.ie_type, &self.value)
    }

    /// Cause value
    pub fn as_cause(&self) -> Result<u8, CodecError> {
        if self.value.len() < 2 {
            return Err(CodecError::InvalidIeLength {
                ie_type: self.ie_type,
                expected: 2,
                actual: self.value.len(),
            });
        }
        Ok(self.value[0])
    }

    /// EPS Bearer ID
    pub fn as_ebi(&self) -> Result<u8, CodecError> {
        Ok(self.as_u8()? & 0x0F)
    }

    /// F-TEID
    pub fn as_fteid(&self) -> Result<FTeid, CodecError> {
        FTeid::decode(&self.value)
    }

    /// PDN Address Allocation
    pub fn as_paa(&self) -> Result<Paa, CodecError> {
        Paa::decode(&self.value)
    }

    /// Encoded size in bytes
    pub fn encoded_size(&self) -> usize {
        4 + self.value.len()
    }

    /// Encode the IE to a buffer
    pub fn encode_to(&self, buf: &mut BytesMut) -> Result<(), CodecError> {
        if self.value.len() > u16::MAX as usize {
            return Err(CodecError::MessageTooLong(self.value.len()));
        }
        buf.put_u8(self.ie_type);
        buf.put_u16(self.value.len() as u16);
        buf.put_u8(self.instance & 0x0F);
        buf.put_slice(&self.value);
        Ok(())
    }

    /// Decode a list of IEs filling `data`
    pub fn decode_all(mut data: &[u8]) -> Result<Vec<Ie>, CodecError> {
        let mut ies = Vec::new();
        while data.has_remaining() {
            if data.remaining() < 4 {
                return Err(CodecError::BufferTooShort {
                    needed: 4,
                    available: data.remaining(),
                });
            }
            let ie_type = data.get_u8();
            let len = data.get_u16() as usize;
            let instance = data.get_u8() & 0x0F;
            if data.remaining() < len {
                return Err(CodecError::BufferTooShort {
                    needed: len,
                    available: data.remaining(),
                });
            }
            ies.push(Ie {
                ie_type,
                instance,
                value: Bytes::copy_from_slice(&data[..len]),
            });
            data.advance(len);
        }
        Ok(ies)
    }
}

fn encode_tbcd(ie_type: u8, digits: &str) -> Result<Vec<u8>, CodecError> {
    let nibbles = digits
        .chars()
        .map(|c| {
            c.to_digit(10).map(|d| d as u8).ok_or(CodecError::InvalidIeValue {
                ie_type,
                reason: format!("non-digit character {c:?}"),
            })
        })
        .collect::<Result<Vec<u8>, _>>()?;
    if nibbles.is_empty() || nibbles.len() > 15 {
        return Err(CodecError::InvalidIeValue {
            ie_type,
            reason: format!("{} digits, expected 1..=15", nibbles.len()),
        });
    }
    Ok(nibbles
        .chunks(2)
        .map(|pair| pair[0] | (pair.get(1).copied().unwrap_or(0x0F) << 4))
        .collect())
}

fn decode_tbcd(ie_type: u8, data: &[u8]) -> Result<String, CodecError> {
    let mut out = String::with_capacity(data.len() * 2);
    for byte in data {
        for nibble in [byte & 0x0F, byte >> 4] {
            match nibble {
                0..=9 => out.push(char::from(b'0' + nibble)),
                0x0F => return Ok(out),
                other => {
                    return Err(CodecError::InvalidIeValue {
                        ie_type,
                        reason: format!("invalid TBCD nibble {other:#x}"),
                    })
                }
            }
        }
    }
    Ok(out)
}

/// Fully Qualified TEID
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FTeid {
    /// Interface type (see [`interface_type`])
    pub interface_type: u8,
    /// TEID or GRE key
    pub teid: u32,
    /// IPv4 address
    pub ipv4: Option<Ipv4Addr>,
    /// IPv6 address
    pub ipv6: Option<Ipv6Addr>,
}

impl FTeid {
    /// IPv4 F-TEID
    pub fn v4(interface_type: u8, teid: u32, addr: Ipv4Addr) -> Self {
        Self {
            interface_type,
            teid,
            ipv4: Some(addr),
            ipv6: None,
        }
    }

    /// Preferred address (IPv4 first)
    pub fn ip(&self) -> Option<std::net::IpAddr> {
        self.ipv4
            .map(std::net::IpAddr::V4)
            .or(self.ipv6.map(std::net::IpAddr::V6))
    }

    fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(25);
        let flags = (if self.ipv4.is_some() { 0x80 } else { 0 })
            | (if self.ipv6.is_some() { 0x40 } else { 0 })
            | (self.interface_type & 0x3F);
        out.push(flags);
        out.extend_from_slice(&self.teid.to_be_bytes());
        if let Some(v4) = self.ipv4 {
            out.extend_from_slice(&v4.octets());
        }
        if let Some(v6) = self.ipv6 {
            out.extend_from_slice(&v6.octets());
        }
        out
    }

    fn decode(mut data: &[u8]) -> Result<Self, CodecError> {
        let too_short = |needed: usize, available: usize| CodecError::InvalidIeLength {
            ie_type: ie_type::F_TEID,
            expected: needed,
            actual: available,
        };
        if data.len() < 5 {
            return Err(too_short(5, data.len()));
        }
        let flags = data.get_u8();
        let teid = data.get_u32();
        let has_v4 = flags & 0x80 != 0;
        let has_v6 = flags & 0x40 != 0;
        let needed = 5 + if has_v4 { 4 } else { 0 } + if has_v6 { 16 } else { 0 };
        if data.remaining() + 5 < needed {
            return Err(too_short(needed, data.remaining() + 5));
        }
        let ipv4 = has_v4.then(|| Ipv4Addr::from(data.get_u32()));
        let ipv6 = has_v6.then(|| Ipv6Addr::from(data.get_u128()));
        Ok(Self {
            interface_type: flags & 0x3F,
            teid,
            ipv4,
            ipv6,
        })
    }
}

/// PDN Address Allocation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Paa {
    /// IPv4 address
    V4(Ipv4Addr),
    /// IPv6 prefix
    V6 {
        /// Prefix length
        prefix_len: u8,
        /// Prefix / interface identifier
        addr: Ipv6Addr,
    },
    /// Dual stack
    V4V6 {
        /// IPv6 prefix length
        prefix_len: u8,
        /// IPv6 address
        v6: Ipv6Addr,
        /// IPv4 address
        v4: Ipv4Addr,
    },
}

impl Paa {
    /// IPv4 address, if allocated
    pub fn ipv4(&self) -> Option<Ipv4Addr> {
        match self {
            Paa::V4(v4) | Paa::V4V6 { v4, .. } => Some(*v4),
            Paa::V6 { .. } => None,
        }
    }

    fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(22);
        match self {
            Paa::V4(v4) => {
                out.push(1);
                out.extend_from_slice(&v4.octets());
            }
            Paa::V6 { prefix_len, addr } => {
                out.push(2);
                out.push(*prefix_len);
                out.extend_from_slice(&addr.octets());
            }
            Paa::V4V6 { prefix_len, v6, v4 } => {
                out.push(3);
                out.push(*prefix_len);
                out.extend_from_slice(&v6.octets());
                out.extend_from_slice(&v4.octets());
            }
        }
        out
    }

    fn decode(mut data: &[u8]) -> Result<Self, CodecError> {
        let invalid = |expected: usize, actual: usize| CodecError::InvalidIeLength {
            ie_type: ie_type::PAA,
            expected,
            actual,
        };
        let total = data.len();
        if total == 0 {
            return Err(invalid(1, 0));
        }
        match data.get_u8() & 0x07 {
            1 if total >= 5 => Ok(Paa::V4(Ipv4Addr::from(data.get_u32()))),
            1 => Err(invalid(5, total)),
            2 if total >= 18 => {
                let prefix_len = data.get_u8();
                Ok(Paa::V6 {
                    prefix_len,
                    addr: Ipv6Addr::from(data.get_u128()),
                })
            }
            2 => Err(invalid(18, total)),
            3 if total >= 22 => {
                let prefix_len = data.get_u8();
                let v6 = Ipv6Addr::from(data.get_u128());
                let v4 = Ipv4Addr::from(data.get_u32());
                Ok(Paa::V4V6 { prefix_len, v6, v4 })
            }
            3 => Err(invalid(22, total)),
            other => Err(CodecError::InvalidIeValue {
                ie_type: ie_type::PAA,
                reason: format!("unknown PDN type {other}"),
            }),
        }
    }
}

/// GTPv2-C message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Gtpv2Message {
    /// Message type
    pub message_type: u8,
    /// TEID, present when the T flag is set
    pub teid: Option<u32>,
    /// 24-bit sequence number
    pub sequence_number: u32,
    /// Message priority, present when the MP flag is set
    pub message_priority: Option<u8>,
    /// IEs in wire order, including unrecognised ones
    pub ies: Vec<Ie>,
}

impl Gtpv2Message {
    /// Create a message; `teid` of `None` clears the T flag
    pub fn new(message_type: u8, teid: Option<u32>, sequence_number: u32) -> Self {
        Self {
            message_type,
            teid,
            sequence_number: sequence_number & MAX_SEQUENCE,
            message_priority: None,
            ies: Vec::new(),
        }
    }

    /// Echo Request carrying the local Restart Counter
    pub fn echo_request(sequence_number: u32, restart_counter: u8) -> Self {
        Self::new(Gtpv2MessageType::EchoRequest as u8, None, sequence_number)
            .with_ie(Ie::recovery(restart_counter))
    }

    /// Echo Response carrying the local Restart Counter
    pub fn echo_response(sequence_number: u32, restart_counter: u8) -> Self {
        Self::new(Gtpv2MessageType::EchoResponse as u8, None, sequence_number)
            .with_ie(Ie::recovery(restart_counter))
    }

    /// Version Not Supported Indication echoing the offending sequence number
    pub fn version_not_supported_indication(sequence_number: u32) -> Self {
        Self::new(
            Gtpv2MessageType::VersionNotSupportedIndication as u8,
            None,
            sequence_number,
        )
    }

    /// Append an IE
    pub fn with_ie(mut self, ie: Ie) -> Self {
        self.ies.push(ie);
        self
    }

    /// Set the message priority (0-15)
    pub fn with_priority(mut self, priority: u8) -> Self {
        self.message_priority = Some(priority & 0x0F);
        self
    }

    /// Known message type, if any
    pub fn kind(&self) -> Option<Gtpv2MessageType> {
        Gtpv2MessageType::from_u8(self.message_type)
    }

    /// First IE with the given type and instance
    pub fn ie(&self, ie_type: u8, instance: u8) -> Option<&Ie> {
        self.ies
            .iter()
            .find(|ie| ie.ie_type == ie_type && ie.instance == instance)
    }

    /// Restart Counter from the Recovery IE, if present
    pub fn recovery(&self) -> Option<u8> {
        self.ie(ie_type::RECOVERY, 0).and_then(|ie| ie.as_u8().ok())
    }

    /// Cause value, if present
    pub fn cause(&self) -> Option<u8> {
        self.ie(ie_type::CAUSE, 0).and_then(|ie| ie.as_cause().ok())
    }

    fn header_size(&self) -> usize {
        if self.teid.is_some() {
            HEADER_SIZE_WITH_TEID
        } else {
            HEADER_SIZE_NO_TEID
        }
    }

    /// Calculate the encoded size of this message
    pub fn encoded_size(&self) -> usize {
        self.header_size() + self.ies.iter().map(Ie::encoded_size).sum::<usize>()
    }

    /// Encode the message to bytes
    pub fn encode(&self) -> Result<BytesMut, CodecError> {
        if self.sequence_number > MAX_SEQUENCE {
            return Err(CodecError::SequenceOutOfRange(self.sequence_number));
        }
        let total = self.encoded_size();
        let length = total - 4;
        if length > u16::MAX as usize {
            return Err(CodecError::MessageTooLong(length));
        }

        let mut buf = BytesMut::with_capacity(total);
        let flags = (GTP_VERSION << 5)
            | (if self.teid.is_some() { 0x08 } else { 0 })
            | (if self.message_priority.is_some() { 0x04 } else { 0 });
        buf.put_u8(flags);
        buf.put_u8(self.message_type);
        buf.put_u16(length as u16);
        if let Some(teid) = self.teid {
            buf.put_u32(teid);
        }
        let seq = self.sequence_number.to_be_bytes();
        buf.put_slice(&seq[1..]);
        buf.put_u8(self.message_priority.map(|p| p << 4).unwrap_or(0));

        for ie in &self.ies {
            ie.encode_to(&mut buf)?;
        }
        Ok(buf)
    }

    /// Decode a GTPv2-C message
    ///
    /// A piggybacked message (P flag) following the first one is ignored.
    pub fn decode(data: &[u8]) -> Result<Self, CodecError> {
        if data.len() < HEADER_SIZE_NO_TEID {
            return Err(CodecError::BufferTooShort {
                needed: HEADER_SIZE_NO_TEID,
                available: data.len(),
            });
        }

        let mut buf = data;
        let flags = buf.get_u8();
        let version = (flags >> 5) & 0x07;
        if version != GTP_VERSION {
            return Err(CodecError::InvalidVersion(version));
        }
        let has_teid = flags & 0x08 != 0;
        let has_priority = flags & 0x04 != 0;

        let message_type = buf.get_u8();
        let length = buf.get_u16() as usize;
        let total = 4 + length;
        if data.len() < total {
            return Err(CodecError::BufferTooShort {
                needed: total,
                available: data.len(),
            });
        }
        let header_size = if has_teid {
            HEADER_SIZE_WITH_TEID
        } else {
            HEADER_SIZE_NO_TEID
        };
        if total < header_size {
            return Err(CodecError::LengthMismatch {
                header_len: length,
                actual_len: header_size - 4,
            });
        }

        let mut buf = &buf[..length];
        let teid = has_teid.then(|| buf.get_u32());
        let sequence_number = (u32::from(buf.get_u8()) << 16)
            | (u32::from(buf.get_u8()) << 8)
            | u32::from(buf.get_u8());
        let spare = buf.get_u8();
        let message_priority = has_priority.then_some(spare >> 4);

        let ies = Ie::decode_all(buf)?;

        Ok(Self {
            message_type,
            teid,
            sequence_number,
            message_priority,
            ies,
        })
    }
}
