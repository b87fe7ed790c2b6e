//! GTP wire codec
//!
//! Header and Information Element encoding/decoding for:
//! - GTPv1-C / GTPv1-U (3GPP TS 29.060, TS 29.281)
//! - GTPv2-C (3GPP TS 29.274)
//!
//! [`parse`] dispatches on the version bits and returns a [`GtpMessage`];
//! everything above the codec works through the [`Message`] trait.

pub mod error;
pub mod message;
pub mod v1;
pub mod v2;

pub use error::CodecError;
pub use message::{parse, peek_version, GtpMessage, Message};
pub use v1::{ExtHeader, Gtpv1Message, Gtpv1MessageType};
pub use v2::{FTeid, Gtpv2Message, Gtpv2MessageType, Paa};

/// GTP-U UDP port
pub const GTPU_PORT: u16 = 2152;

/// GTP-C UDP port
pub const GTPC_PORT: u16 = 2123;
