//! GTPv1 encoding/decoding
//!
//! Implements the GTPv1 header shared by GTPv1-C (3GPP TS 29.060) and GTPv1-U
//! (3GPP TS 29.281), its extension headers, and the TV/TLV Information
//! Elements carried by signalling messages. G-PDU bodies are kept opaque.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::CodecError;

/// GTPv1 protocol version
pub const GTP_VERSION: u8 = 1;

/// Protocol type (1 for GTP, 0 for GTP')
pub const GTP_PROTOCOL_TYPE: u8 = 1;

/// Minimum GTPv1 header size (without optional fields)
pub const MIN_HEADER_SIZE: usize = 8;

/// GTPv1 message types handled by the connection engine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Gtpv1MessageType {
    /// Echo Request
    EchoRequest = 1,
    /// Echo Response
    EchoResponse = 2,
    /// Version Not Supported
    VersionNotSupported = 3,
    /// Create PDP Context Request
    CreatePdpContextRequest = 16,
    /// Create PDP Context Response
    CreatePdpContextResponse = 17,
    /// Update PDP Context Request
    UpdatePdpContextRequest = 18,
    /// Update PDP Context Response
    UpdatePdpContextResponse = 19,
    /// Delete PDP Context Request
    DeletePdpContextRequest = 20,
    /// Delete PDP Context Response
    DeletePdpContextResponse = 21,
    /// Error Indication
    ErrorIndication = 26,
    /// Supported Extension Headers Notification
    SupportedExtHeadersNotification = 31,
    /// End Marker
    EndMarker = 254,
    /// G-PDU (user data)
    GPdu = 255,
}

impl Gtpv1MessageType {
    /// Convert from u8 to a known message type
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::EchoRequest),
            2 => Some(Self::EchoResponse),
            3 => Some(Self::VersionNotSupported),
            16 => Some(Self::CreatePdpContextRequest),
            17 => Some(Self::CreatePdpContextResponse),
            18 => Some(Self::UpdatePdpContextRequest),
            19 => Some(Self::UpdatePdpContextResponse),
            20 => Some(Self::DeletePdpContextRequest),
            21 => Some(Self::DeletePdpContextResponse),
            26 => Some(Self::ErrorIndication),
            31 => Some(Self::SupportedExtHeadersNotification),
            254 => Some(Self::EndMarker),
            255 => Some(Self::GPdu),
            _ => None,
        }
    }

    /// Human readable name
    pub fn name(self) -> &'static str {
        match self {
            Self::EchoRequest => "Echo Request",
            Self::EchoResponse => "Echo Response",
            Self::VersionNotSupported => "Version Not Supported",
            Self::CreatePdpContextRequest => "Create PDP Context Request",
            Self::CreatePdpContextResponse => "Create PDP Context Response",
            Self::UpdatePdpContextRequest => "Update PDP Context Request",
            Self::UpdatePdpContextResponse => "Update PDP Context Response",
            Self::DeletePdpContextRequest => "Delete PDP Context Request",
            Self::DeletePdpContextResponse => "Delete PDP Context Response",
            Self::ErrorIndication => "Error Indication",
            Self::SupportedExtHeadersNotification => "Supported Extension Headers Notification",
            Self::EndMarker => "End Marker",
            Self::GPdu => "G-PDU",
        }
    }

    /// Whether this type is a triggered reply matched against an outstanding request
    pub fn is_response(self) -> bool {
        matches!(
            self,
            Self::EchoResponse
                | Self::VersionNotSupported
                | Self::CreatePdpContextResponse
                | Self::UpdatePdpContextResponse
                | Self::DeletePdpContextResponse
        )
    }
}

/// GTPv1 Information Element types used by the engine
pub mod ie_type {
    /// Cause (TV, 1 octet)
    pub const CAUSE: u8 = 1;
    /// IMSI (TV, 8 octets)
    pub const IMSI: u8 = 2;
    /// Recovery (TV, 1 octet)
    pub const RECOVERY: u8 = 14;
    /// Tunnel Endpoint Identifier Data I (TV, 4 octets)
    pub const TEID_DATA_I: u8 = 16;
    /// Tunnel Endpoint Identifier Control Plane (TV, 4 octets)
    pub const TEID_C_PLANE: u8 = 17;
    /// NSAPI (TV, 1 octet)
    pub const NSAPI: u8 = 20;
    /// End User Address (TLV)
    pub const END_USER_ADDRESS: u8 = 128;
    /// GSN Address (TLV)
    pub const GSN_ADDRESS: u8 = 133;
    /// Extension Header Type List (TLV)
    pub const EXTENSION_HEADER_TYPE_LIST: u8 = 141;
    /// Private Extension (TLV)
    pub const PRIVATE_EXTENSION: u8 = 255;
}

/// Fixed value length of a TV-format IE (types below 128), TS 29.060 section 7.7.
fn tv_length(ie_type: u8) -> Option<usize> {
    let len = match ie_type {
        1 => 1,   // Cause
        2 => 8,   // IMSI
        3 => 6,   // RAI
        4 => 4,   // TLLI
        5 => 4,   // P-TMSI
        8 => 1,   // Reordering Required
        9 => 28,  // Authentication Triplet
        11 => 1,  // MAP Cause
        12 => 3,  // P-TMSI Signature
        13 => 1,  // MS Validated
        14 => 1,  // Recovery
        15 => 1,  // Selection Mode
        16 => 4,  // TEID Data I
        17 => 4,  // TEID Control Plane
        18 => 5,  // TEID Data II
        19 => 1,  // Teardown Ind
        20 => 1,  // NSAPI
        21 => 1,  // RANAP Cause
        22 => 9,  // RAB Context
        23 => 1,  // Radio Priority SMS
        24 => 1,  // Radio Priority
        25 => 2,  // Packet Flow Id
        26 => 2,  // Charging Characteristics
        27 => 2,  // Trace Reference
        28 => 2,  // Trace Type
        29 => 1,  // MS Not Reachable Reason
        127 => 4, // Charging ID
        _ => return None,
    };
    Some(len)
}

/// GTPv1 Information Element
///
/// Types below 128 use the TV format with a fixed length, the rest use TLV
/// with a 16-bit length.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ie {
    /// IE type
    pub ie_type: u8,
    /// Raw value (without type and length)
    pub value: Bytes,
}

impl Ie {
    /// Create an IE from its type and raw value
    pub fn new(ie_type: u8, value: impl Into<Bytes>) -> Self {
        Self {
            ie_type,
            value: value.into(),
        }
    }

    /// Recovery IE carrying a Restart Counter
    pub fn recovery(restart_counter: u8) -> Self {
        Self::new(ie_type::RECOVERY, vec![restart_counter])
    }

    /// Cause IE
    pub fn cause(cause: u8) -> Self {
        Self::new(ie_type::CAUSE, vec![cause])
    }

    /// Tunnel Endpoint Identifier Data I IE
    pub fn teid_data_i(teid: u32) -> Self {
        Self::new(ie_type::TEID_DATA_I, teid.to_be_bytes().to_vec())
    }

    /// GSN Address IE
    pub fn gsn_address(addr: IpAddr) -> Self {
        let value = match addr {
            IpAddr::V4(v4) => v4.octets().to_vec(),
            IpAddr::V6(v6) => v6.octets().to_vec(),
        };
        Self::new(ie_type::GSN_ADDRESS, value)
    }

    /// Extension Header Type List IE
    pub fn extension_header_type_list(types: &[u8]) -> Self {
        let mut value = Vec::with_capacity(types.len() + 1);
        value.push(types.len() as u8);
        value.extend_from_slice(types);
        Self::new(ie_type::EXTENSION_HEADER_TYPE_LIST, value)
    }

    /// Value as a single octet
    pub fn as_u8(&self) -> Result<u8, CodecError> {
        self.value.first().copied().ok_or(CodecError::InvalidIeLength {
            ie_type: self.ie_type,
            expected: 1,
            actual: 0,
        })
    }

    /// Value as a big-endian 32-bit integer
    pub fn as_u32(&self) -> Result<u32, CodecError> {
        let bytes: [u8; 4] = self.value[..]
            .try_into()
            .map_err(|_| CodecError::InvalidIeLength {
                ie_type: self.ie_type,
                expected: 4,
                actual: self.value.len(),
            })?;
        Ok(u32::from_be_bytes(bytes))
    }

    /// Value as an IPv4 or IPv6 address
    pub fn as_ip(&self) -> Result<IpAddr, CodecError> {
        match self.value.len() {
            4 => {
                let octets: [u8; 4] = self.value[..4].try_into().unwrap_or([0; 4]);
                Ok(IpAddr::V4(Ipv4Addr::from(octets)))
            }
            16 => {
                let octets: [u8; 16] = self.value[..16].try_into().unwrap_or([0; 16]);
                Ok(IpAddr::V6(Ipv6Addr::from(octets)))
            }
            actual => Err(CodecError::InvalidIeLength {
                ie_type: self.ie_type,
                expected: 4,
                actual,
            }),
        }
    }

    /// Encoded size in bytes
    pub fn encoded_size(&self) -> usize {
        if self.ie_type < 128 {
            1 + self.value.len()
        } else {
            3 + self.value.len()
        }
    }

    /// Encode the IE to a buffer
    pub fn encode_to(&self, buf: &mut BytesMut) -> Result<(), CodecError> {
        buf.put_u8(self.ie_type);
        if self.ie_type < 128 {
            let expected = tv_length(self.ie_type).ok_or(CodecError::UnknownTvIe(self.ie_type))?;
            if expected != self.value.len() {
                return Err(CodecError::InvalidIeLength {
                    ie_type: self.ie_type,
                    expected,
                    actual: self.value.len(),
                });
            }
        } else {
            if self.value.len() > u16::MAX as usize {
                return Err(CodecError::MessageTooLong(self.value.len()));
            }
            buf.put_u16(self.value.len() as u16);
        }
        buf.put_slice(&self.value);
        Ok(())
    }

    /// Decode a list of IEs filling `data`
    pub fn decode_all(mut data: &[u8]) -> Result<Vec<Ie>, CodecError> {
        let mut ies = Vec::new();
        while data.has_remaining() {
            let ie_type = data.get_u8();
            let len = if ie_type < 128 {
                tv_length(ie_type).ok_or(CodecError::UnknownTvIe(ie_type))?
            } else {
                if data.remaining() < 2 {
                    return Err(CodecError::BufferTooShort {
                        needed: 2,
                        available: data.remaining(),
                    });
                }
                data.get_u16() as usize
            };
            if data.remaining() < len {
                return Err(CodecError::BufferTooShort {
                    needed: len,
                    available: data.remaining(),
                });
            }
            ies.push(Ie::new(ie_type, Bytes::copy_from_slice(&data[..len])));
            data.advance(len);
        }
        Ok(ies)
    }
}

/// Extension header type values
pub mod ext_header_type {
    /// No more extension headers
    pub const NO_MORE: u8 = 0x00;
    /// UDP Port
    pub const UDP_PORT: u8 = 0x40;
    /// Long PDCP PDU Number
    pub const LONG_PDCP_PDU_NUMBER: u8 = 0x82;
    /// PDU Session Container
    pub const PDU_SESSION_CONTAINER: u8 = 0x85;
    /// PDCP PDU Number
    pub const PDCP_PDU_NUMBER: u8 = 0xC0;
}

/// GTPv1 extension header
///
/// Extension headers the engine does not interpret are preserved verbatim
/// in [`ExtHeader::Other`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExtHeader {
    /// UDP Port extension header (carried in Error Indication)
    UdpPort {
        /// UDP port number
        port: u16,
    },
    /// PDCP PDU Number extension header
    PdcpPduNumber {
        /// PDCP PDU number
        pdu_number: u16,
    },
    /// PDU Session Container extension header
    PduSessionContainer {
        /// Container content, padded to the 4-octet boundary
        data: Bytes,
    },
    /// Any other extension header
    Other {
        /// Extension header type
        ext_type: u8,
        /// Content between the length octet and the next-type octet
        content: Bytes,
    },
}

impl ExtHeader {
    fn ext_type(&self) -> u8 {
        match self {
            Self::UdpPort { .. } => ext_header_type::UDP_PORT,
            Self::PdcpPduNumber { .. } => ext_header_type::PDCP_PDU_NUMBER,
            Self::PduSessionContainer { .. } => ext_header_type::PDU_SESSION_CONTAINER,
            Self::Other { ext_type, .. } => *ext_type,
        }
    }

    fn content(&self) -> Bytes {
        match self {
            Self::UdpPort { port } => Bytes::copy_from_slice(&port.to_be_bytes()),
            Self::PdcpPduNumber { pdu_number } => Bytes::copy_from_slice(&pdu_number.to_be_bytes()),
            Self::PduSessionContainer { data } => data.clone(),
            Self::Other { content, .. } => content.clone(),
        }
    }

    /// Encoded size: the type octet that announces it, the length octet, the content and padding
    fn encoded_size(&self) -> usize {
        let content_len = self.content().len() + 2;
        content_len.div_ceil(4) * 4
    }

    /// Encode with the announcing type octet first; the following header's
    /// type octet (or NO_MORE) closes it.
    fn encode_to(&self, buf: &mut BytesMut) {
        let content = self.content();
        let units = (content.len() + 2).div_ceil(4);
        buf.put_u8(self.ext_type());
        buf.put_u8(units as u8);
        buf.put_slice(&content);
        let padding = units * 4 - content.len() - 2;
        buf.put_bytes(0, padding);
    }

    /// Decode one extension header; `data` starts at its length octet.
    ///
    /// Returns (header, bytes consumed, next extension header type).
    fn decode(ext_type: u8, data: &[u8]) -> Result<(Self, usize, u8), CodecError> {
        let units = *data.first().ok_or(CodecError::BufferTooShort {
            needed: 1,
            available: 0,
        })? as usize;
        if units == 0 {
            return Err(CodecError::InvalidExtHeaderLength(0));
        }
        let total_len = units * 4;
        if data.len() < total_len {
            return Err(CodecError::BufferTooShort {
                needed: total_len,
                available: data.len(),
            });
        }

        let next_ext_type = data[total_len - 1];
        let content = &data[1..total_len - 1];

        let ext = match ext_type {
            ext_header_type::UDP_PORT if units == 1 => Self::UdpPort {
                port: u16::from_be_bytes([content[0], content[1]]),
            },
            ext_header_type::PDCP_PDU_NUMBER if units == 1 => Self::PdcpPduNumber {
                pdu_number: u16::from_be_bytes([content[0], content[1]]),
            },
            ext_header_type::UDP_PORT | ext_header_type::PDCP_PDU_NUMBER => {
                return Err(CodecError::InvalidExtHeaderLength(units as u8));
            }
            ext_header_type::PDU_SESSION_CONTAINER => Self::PduSessionContainer {
                data: Bytes::copy_from_slice(content),
            },
            other => Self::Other {
                ext_type: other,
                content: Bytes::copy_from_slice(content),
            },
        };

        Ok((ext, total_len, next_ext_type))
    }
}

/// GTPv1 message
///
/// The header fields plus either a list of IEs (signalling messages) or an
/// opaque payload (G-PDU).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Gtpv1Message {
    /// Message type
    pub message_type: u8,
    /// Tunnel Endpoint Identifier
    pub teid: u32,
    /// Sequence number (optional)
    pub sequence_number: Option<u16>,
    /// N-PDU number (optional)
    pub n_pdu_number: Option<u8>,
    /// Extension headers
    pub extension_headers: Vec<ExtHeader>,
    /// Information Elements, in wire order (signalling messages only)
    pub ies: Vec<Ie>,
    /// User data (G-PDU only)
    pub payload: Bytes,
}

impl Gtpv1Message {
    /// Create a message with no optional fields
    pub fn new(message_type: u8, teid: u32) -> Self {
        Self {
            message_type,
            teid,
            sequence_number: None,
            n_pdu_number: None,
            extension_headers: Vec::new(),
            ies: Vec::new(),
            payload: Bytes::new(),
        }
    }

    /// Create a G-PDU message (user data)
    pub fn g_pdu(teid: u32, payload: Bytes) -> Self {
        let mut msg = Self::new(Gtpv1MessageType::GPdu as u8, teid);
        msg.payload = payload;
        msg
    }

    /// Create an End Marker
    pub fn end_marker(teid: u32) -> Self {
        Self::new(Gtpv1MessageType::EndMarker as u8, teid)
    }

    /// Create an Echo Request (TEID 0, sequence number present)
    pub fn echo_request(sequence_number: u16) -> Self {
        Self::new(Gtpv1MessageType::EchoRequest as u8, 0).with_sequence_number(sequence_number)
    }

    /// Create an Echo Response carrying the local Restart Counter
    pub fn echo_response(sequence_number: u16, restart_counter: u8) -> Self {
        Self::new(Gtpv1MessageType::EchoResponse as u8, 0)
            .with_sequence_number(sequence_number)
            .with_ie(Ie::recovery(restart_counter))
    }

    /// Create a Version Not Supported message echoing the offending sequence number
    pub fn version_not_supported(sequence_number: u16) -> Self {
        Self::new(Gtpv1MessageType::VersionNotSupported as u8, 0)
            .with_sequence_number(sequence_number)
    }

    /// Create an Error Indication for a G-PDU that arrived on an unknown TEID
    ///
    /// `teid` is the TEID of the offending G-PDU and `local_addr` the address
    /// of this node, so the peer can identify the tunnel to tear down.
    pub fn error_indication(teid: u32, local_addr: IpAddr) -> Self {
        Self::new(Gtpv1MessageType::ErrorIndication as u8, 0)
            .with_ie(Ie::teid_data_i(teid))
            .with_ie(Ie::gsn_address(local_addr))
    }

    /// Set sequence number
    pub fn with_sequence_number(mut self, seq: u16) -> Self {
        self.sequence_number = Some(seq);
        self
    }

    /// Set N-PDU number
    pub fn with_n_pdu_number(mut self, n_pdu: u8) -> Self {
        self.n_pdu_number = Some(n_pdu);
        self
    }

    /// Add an extension header
    pub fn with_extension_header(mut self, ext: ExtHeader) -> Self {
        self.extension_headers.push(ext);
        self
    }

    /// Append an IE
    pub fn with_ie(mut self, ie: Ie) -> Self {
        self.ies.push(ie);
        self
    }

    /// Known message type, if any
    pub fn kind(&self) -> Option<Gtpv1MessageType> {
        Gtpv1MessageType::from_u8(self.message_type)
    }

    /// First IE of the given type
    pub fn ie(&self, ie_type: u8) -> Option<&Ie> {
        self.ies.iter().find(|ie| ie.ie_type == ie_type)
    }

    /// Restart Counter from the Recovery IE, if present
    pub fn recovery(&self) -> Option<u8> {
        self.ie(ie_type::RECOVERY).and_then(|ie| ie.as_u8().ok())
    }

    /// TEID Data I value (Error Indication)
    pub fn teid_data_i(&self) -> Option<u32> {
        self.ie(ie_type::TEID_DATA_I).and_then(|ie| ie.as_u32().ok())
    }

    /// GSN Address value (Error Indication)
    pub fn gsn_address(&self) -> Option<IpAddr> {
        self.ie(ie_type::GSN_ADDRESS).and_then(|ie| ie.as_ip().ok())
    }

    fn carries_user_data(message_type: u8) -> bool {
        message_type == Gtpv1MessageType::GPdu as u8
    }

    fn has_optional_fields(&self) -> bool {
        self.sequence_number.is_some()
            || self.n_pdu_number.is_some()
            || !self.extension_headers.is_empty()
    }

    fn body_len(&self) -> usize {
        if Self::carries_user_data(self.message_type) {
            self.payload.len()
        } else {
            self.ies.iter().map(Ie::encoded_size).sum()
        }
    }

    /// Value of the header length field (bytes after the TEID)
    fn calculate_length(&self) -> usize {
        let mut length = 0;

        if self.has_optional_fields() {
            length += 4; // seq (2) + n_pdu (1) + next_ext_type (1)
            length += self
                .extension_headers
                .iter()
                .map(ExtHeader::encoded_size)
                .sum::<usize>();
        }

        length + self.body_len()
    }

    /// Calculate the encoded size of this message
    pub fn encoded_size(&self) -> usize {
        MIN_HEADER_SIZE + self.calculate_length()
    }

    /// Encode the message to bytes
    pub fn encode(&self) -> Result<BytesMut, CodecError> {
        let mut buf = BytesMut::with_capacity(self.encoded_size());
        self.encode_to(&mut buf)?;
        Ok(buf)
    }

    /// Encode the message to an existing buffer
    pub fn encode_to(&self, buf: &mut BytesMut) -> Result<(), CodecError> {
        let length = self.calculate_length();
        if length > u16::MAX as usize {
            return Err(CodecError::MessageTooLong(length));
        }

        let has_ext = !self.extension_headers.is_empty();
        let has_seq = self.sequence_number.is_some();
        let has_n_pdu = self.n_pdu_number.is_some();

        // version (3 bits) | PT (1 bit) | reserved (1 bit) | E | S | PN
        let flags: u8 = (GTP_VERSION << 5)
            | (GTP_PROTOCOL_TYPE << 4)
            | (if has_ext { 0x04 } else { 0 })
            | (if has_seq { 0x02 } else { 0 })
            | (if has_n_pdu { 0x01 } else { 0 });

        buf.put_u8(flags);
        buf.put_u8(self.message_type);
        buf.put_u16(length as u16);
        buf.put_u32(self.teid);

        if self.has_optional_fields() {
            buf.put_u16(self.sequence_number.unwrap_or(0));
            buf.put_u8(self.n_pdu_number.unwrap_or(0));

            for ext in &self.extension_headers {
                ext.encode_to(buf);
            }

            buf.put_u8(ext_header_type::NO_MORE);
        }

        if Self::carries_user_data(self.message_type) {
            buf.put_slice(&self.payload);
        } else {
            for ie in &self.ies {
                ie.encode_to(buf)?;
            }
        }

        Ok(())
    }

    /// Decode a GTPv1 message from bytes
    pub fn decode(data: &[u8]) -> Result<Self, CodecError> {
        if data.len() < MIN_HEADER_SIZE {
            return Err(CodecError::BufferTooShort {
                needed: MIN_HEADER_SIZE,
                available: data.len(),
            });
        }

        let mut buf = data;

        let flags = buf.get_u8();
        let version = (flags >> 5) & 0x07;
        let protocol_type = (flags >> 4) & 0x01;
        let has_ext = (flags & 0x04) != 0;
        let has_seq = (flags & 0x02) != 0;
        let has_n_pdu = (flags & 0x01) != 0;

        if version != GTP_VERSION {
            return Err(CodecError::InvalidVersion(version));
        }
        if protocol_type != GTP_PROTOCOL_TYPE {
            return Err(CodecError::InvalidProtocolType(protocol_type));
        }

        let message_type = buf.get_u8();
        let length = buf.get_u16() as usize;
        let teid = buf.get_u32();

        let total_needed = MIN_HEADER_SIZE + length;
        if data.len() < total_needed {
            return Err(CodecError::BufferTooShort {
                needed: total_needed,
                available: data.len(),
            });
        }
        // Ignore anything past the announced length (UDP padding)
        let mut buf = &buf[..length];

        let mut sequence_number = None;
        let mut n_pdu_number = None;
        let mut extension_headers = Vec::new();

        if has_ext || has_seq || has_n_pdu {
            if buf.remaining() < 4 {
                return Err(CodecError::LengthMismatch {
                    header_len: length,
                    actual_len: 4,
                });
            }

            let seq = buf.get_u16();
            let n_pdu = buf.get_u8();
            let mut next_ext_type = buf.get_u8();

            if has_seq {
                sequence_number = Some(seq);
            }
            if has_n_pdu {
                n_pdu_number = Some(n_pdu);
            }

            while has_ext && next_ext_type != ext_header_type::NO_MORE {
                let (ext, consumed, next_type) = ExtHeader::decode(next_ext_type, buf)?;
                extension_headers.push(ext);
                buf.advance(consumed);
                next_ext_type = next_type;
            }
        }

        let (ies, payload) = if Self::carries_user_data(message_type) {
            (Vec::new(), Bytes::copy_from_slice(buf))
        } else {
            (Ie::decode_all(buf)?, Bytes::new())
        };

        Ok(Self {
            message_type,
            teid,
            sequence_number,
            n_pdu_number,
            extension_headers,
            ies,
            payload,
        })
    }
}
