//! SM wire format
//!
//! - `header`: the three segment header shapes and their CRC-16 check
//! - `pack`: several sub-messages chained inside one datagram
//! - `framing`: UDP transport header and SMS preamble + Base85 text
//!
//! Byte order on the wire is big-endian throughout.

pub mod framing;
pub mod header;
pub mod pack;

pub use framing::Framing;
pub use header::{parse_header, PacketHeader, SegmentShape, MAX_HEADER_LEN};
pub use pack::{encode_pack, PackIter};

use crate::FailureKind;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Supported SM-over-UDP protocol version (high nibble of the UDP header byte)
pub const SM_UDP_VERSION: u8 = 0x01;

// Info byte
pub const INFO_MULTIPART: u8 = 0x80;
pub const INFO_REQUEST: u8 = 0x40;
pub const INFO_RESPONSE_NEEDED: u8 = 0x20;
pub const INFO_REQUEST_ID_HIGH: u8 = 0x03;
/// Info bits bound into the AEAD additional data
pub const INFO_AAD_MASK: u8 = 0x63;

// cmd_status byte
pub const CS_COMPRESSED: u8 = 0x80;
pub const CS_ENCRYPTED: u8 = 0x40;
pub const CS_NEW_KEY: u8 = 0x20;
pub const CS_ERROR: u8 = 0x10;
pub const CS_COMMAND_MASK: u8 = 0x1F;

/// Request IDs are 10 bits: two in the info byte, eight in the next.
pub const REQUEST_ID_MASK: u16 = 0x03FF;
/// Never issued on encrypted transports; reaching it means a new key is needed.
pub const REQUEST_ID_LAST: u16 = REQUEST_ID_MASK;

/// Pack flag bit: the peer has more queued messages for us
pub const PACK_MORE_DATA: u8 = 0x01;

/// Wire-format errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum WireError {
    #[error("Buffer too short: need {need} bytes, got {got}")]
    BufferTooShort { need: usize, got: usize },

    #[error("CRC16 mismatch: header {expected:#06x}, computed {computed:#06x}")]
    CrcMismatch { expected: u16, computed: u16 },

    #[error("Invalid segment {number} of {count}")]
    InvalidSegment { number: u8, count: u8 },

    #[error("Segment limit exceeded: {got} (max {max})")]
    TooManySegments { got: usize, max: usize },

    #[error("Segment payload too large: {len} bytes (max {max})")]
    SegmentTooLarge { len: usize, max: usize },

    #[error("Pack command inside a pack command")]
    NestedPack,

    #[error("Pack command sent as a multipart message")]
    MultipartPack,

    #[error("Unsupported SM UDP version: {0}")]
    UnsupportedVersion(u8),

    #[error("Compressed message received but compression is disabled")]
    CompressionUnsupported,

    #[error("Encryption flag {flag} does not match transport policy")]
    EncryptionMismatch { flag: bool },

    #[error("Pack entry length {len} exceeds {max}")]
    PackEntryTooLarge { len: usize, max: usize },
}

impl WireError {
    pub fn kind(&self) -> FailureKind {
        match self {
            WireError::CrcMismatch { .. } => FailureKind::Integrity,
            WireError::UnsupportedVersion(_) => FailureKind::Fatal,
            _ => FailureKind::Malformed,
        }
    }
}

/// SM command carried in the low bits of `cmd_status` on requests
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Command {
    /// Every response, whatever the request was
    OpaqueResponse,
    Connect,
    Ping,
    Data,
    NoOp,
    Reboot,
    Batch,
    Cli,
    Config,
    Pack,
    Other(u8),
}

impl Command {
    pub fn from_code(code: u8) -> Self {
        match code & CS_COMMAND_MASK {
            0x00 => Command::Connect,
            0x01 => Command::Ping,
            0x02 => Command::Data,
            0x03 => Command::NoOp,
            0x04 => Command::Reboot,
            0x05 => Command::Batch,
            0x06 => Command::Cli,
            0x07 => Command::Config,
            0x1F => Command::Pack,
            other => Command::Other(other),
        }
    }

    /// Command bits for `cmd_status` (zero for responses)
    pub fn code(&self) -> u8 {
        match self {
            Command::OpaqueResponse | Command::Connect => 0x00,
            Command::Ping => 0x01,
            Command::Data => 0x02,
            Command::NoOp => 0x03,
            Command::Reboot => 0x04,
            Command::Batch => 0x05,
            Command::Cli => 0x06,
            Command::Config => 0x07,
            Command::Pack => 0x1F,
            Command::Other(code) => code & CS_COMMAND_MASK,
        }
    }
}

/// SM transport, as tagged in the AEAD nonce and the configuration store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum TransportKind {
    Sms = 0,
    Satellite = 1,
    Udp = 2,
    /// Main TCP connection; only used for key-wide persistence and the key check tag
    Edp = 3,
}

impl TransportKind {
    pub fn tag(&self) -> u8 {
        *self as u8
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TransportKind::Sms => "sms",
            TransportKind::Satellite => "satellite",
            TransportKind::Udp => "udp",
            TransportKind::Edp => "edp",
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TransportKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "sms" => Ok(TransportKind::Sms),
            "satellite" => Ok(TransportKind::Satellite),
            "udp" => Ok(TransportKind::Udp),
            "edp" => Ok(TransportKind::Edp),
            other => Err(format!("unknown transport: {}", other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_codes() {
        for code in 0..=CS_COMMAND_MASK {
            assert_eq!(Command::from_code(code).code(), code);
        }
        assert_eq!(Command::from_code(0x1F), Command::Pack);
        assert_eq!(Command::from_code(0x09), Command::Other(0x09));
        // Flag bits never leak into the command
        assert_eq!(Command::from_code(CS_ENCRYPTED | 0x02), Command::Data);
    }

    #[test]
    fn test_transport_tags() {
        assert_eq!(TransportKind::Sms.tag(), 0);
        assert_eq!(TransportKind::Satellite.tag(), 1);
        assert_eq!(TransportKind::Udp.tag(), 2);
        assert_eq!(TransportKind::Edp.tag(), 3);
    }

    #[test]
    fn test_transport_parse_and_display() {
        assert_eq!("UDP".parse::<TransportKind>(), Ok(TransportKind::Udp));
        assert_eq!(TransportKind::Sms.to_string(), "sms");
        assert!("tcp".parse::<TransportKind>().is_err());
    }

    #[test]
    fn test_error_kinds() {
        assert_eq!(
            WireError::CrcMismatch { expected: 1, computed: 2 }.kind(),
            FailureKind::Integrity
        );
        assert_eq!(WireError::UnsupportedVersion(2).kind(), FailureKind::Fatal);
        assert_eq!(WireError::NestedPack.kind(), FailureKind::Malformed);
    }
}
