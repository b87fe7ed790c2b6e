//! Shared protocol-level enums

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// GTP protocol version spoken by a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum GtpVersion {
    /// GTPv1 (GTPv1-C, TS 29.060 and GTPv1-U, TS 29.281)
    #[default]
    V1,
    /// GTPv2-C (TS 29.274)
    V2,
}

impl GtpVersion {
    /// Value carried in the three version bits of the first header octet.
    pub fn wire_value(self) -> u8 {
        match self {
            GtpVersion::V1 => 1,
            GtpVersion::V2 => 2,
        }
    }

    /// Largest sequence number representable in the header of this version.
    ///
    /// GTPv1 carries a 16-bit sequence number, GTPv2 a 24-bit one.
    pub fn max_sequence(self) -> u32 {
        match self {
            GtpVersion::V1 => 0xFFFF,
            GtpVersion::V2 => 0x00FF_FFFF,
        }
    }

    /// Default UDP port for this version (GTP-U for v1, GTP-C for v2).
    pub fn default_port(self) -> u16 {
        match self {
            GtpVersion::V1 => 2152,
            GtpVersion::V2 => 2123,
        }
    }
}

impl fmt::Display for GtpVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GtpVersion::V1 => write!(f, "GTPv1"),
            GtpVersion::V2 => write!(f, "GTPv2"),
        }
    }
}

/// Role of the local node when a kernel GTP device is created.
///
/// Mirrors the `role` attribute of the Linux GTP link type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum GtpRole {
    /// Gateway side (GGSN / P-GW / UPF): tunnels are matched on the MS address as destination
    #[default]
    Ggsn,
    /// Access side (SGSN / S-GW / gNB): tunnels are matched on the MS address as source
    Sgsn,
}

impl fmt::Display for GtpRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GtpRole::Ggsn => write!(f, "ggsn"),
            GtpRole::Sgsn => write!(f, "sgsn"),
        }
    }
}

impl FromStr for GtpRole {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "ggsn" | "pgw" | "upf" => Ok(GtpRole::Ggsn),
            "sgsn" | "sgw" | "gnb" | "enb" => Ok(GtpRole::Sgsn),
            _ => Err(format!("unknown GTP role: {s}")),
        }
    }
}
