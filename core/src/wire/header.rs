//! SM packet header codec
//!
//! Header shapes (`crc16` is absent inside a pack):
//! - Single:       [info][req_low][cmd_status][crc16]
//! - Segment 0:    [info][req_low][0][count][cmd_status][crc16]
//! - Segment N>0:  [info][req_low][N][crc16]
//!
//! The CRC covers the whole message (header + payload) with its own field read as zero.

use super::{
    Command, WireError, CS_COMMAND_MASK, CS_COMPRESSED, CS_ENCRYPTED, CS_ERROR, CS_NEW_KEY,
    INFO_MULTIPART, INFO_REQUEST, INFO_REQUEST_ID_HIGH, INFO_RESPONSE_NEEDED, REQUEST_ID_MASK,
};
use crate::codec::crc16;

const CRC_LEN: usize = 2;

/// Largest header on the wire (segment 0 with CRC)
pub const MAX_HEADER_LEN: usize = 7;

/// Which of the three header layouts a segment uses
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentShape {
    Single { cmd_status: u8 },
    First { count: u8, cmd_status: u8 },
    /// Continuation segments inherit count and cmd_status from segment 0
    Continuation { number: u8 },
}

impl SegmentShape {
    pub fn header_len(&self, packed: bool) -> usize {
        let base = match self {
            SegmentShape::Single { .. } => 3,
            SegmentShape::First { .. } => 5,
            SegmentShape::Continuation { .. } => 3,
        };
        if packed {
            base
        } else {
            base + CRC_LEN
        }
    }
}

/// Parsed per-segment metadata
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PacketHeader {
    /// Raw info byte
    pub info: u8,
    pub request_id: u16,
    pub shape: SegmentShape,
    /// `None` for packed sub-messages
    pub crc16: Option<u16>,
    pub payload_len: usize,
}

impl PacketHeader {
    pub fn new(request_id: u16, is_request: bool, response_needed: bool, shape: SegmentShape) -> Self {
        let mut info = ((request_id >> 8) as u8) & INFO_REQUEST_ID_HIGH;
        if is_request {
            info |= INFO_REQUEST;
        }
        if response_needed {
            info |= INFO_RESPONSE_NEEDED;
        }
        if !matches!(shape, SegmentShape::Single { .. }) {
            info |= INFO_MULTIPART;
        }

        Self {
            info,
            request_id: request_id & REQUEST_ID_MASK,
            shape,
            crc16: None,
            payload_len: 0,
        }
    }

    pub fn is_multipart(&self) -> bool {
        self.info & INFO_MULTIPART != 0
    }

    pub fn is_request(&self) -> bool {
        self.info & INFO_REQUEST != 0
    }

    pub fn response_needed(&self) -> bool {
        self.info & INFO_RESPONSE_NEEDED != 0
    }

    pub fn segment_number(&self) -> u8 {
        match self.shape {
            SegmentShape::Continuation { number } => number,
            _ => 0,
        }
    }

    /// Known only on segment 0 and single segments
    pub fn segment_count(&self) -> Option<u8> {
        match self.shape {
            SegmentShape::Single { .. } => Some(1),
            SegmentShape::First { count, .. } => Some(count),
            SegmentShape::Continuation { .. } => None,
        }
    }

    pub fn cmd_status(&self) -> Option<u8> {
        match self.shape {
            SegmentShape::Single { cmd_status } | SegmentShape::First { cmd_status, .. } => {
                Some(cmd_status)
            }
            SegmentShape::Continuation { .. } => None,
        }
    }

    /// Requests carry a command code; responses are always opaque.
    pub fn command(&self) -> Option<Command> {
        let cs = self.cmd_status()?;
        if self.is_request() {
            Some(Command::from_code(cs & CS_COMMAND_MASK))
        } else {
            Some(Command::OpaqueResponse)
        }
    }

    fn cs_flag(&self, mask: u8) -> bool {
        self.cmd_status().map(|cs| cs & mask != 0).unwrap_or(false)
    }

    pub fn is_compressed(&self) -> bool {
        self.cs_flag(CS_COMPRESSED)
    }

    pub fn is_encrypted(&self) -> bool {
        self.cs_flag(CS_ENCRYPTED)
    }

    pub fn has_new_key(&self) -> bool {
        self.cs_flag(CS_NEW_KEY)
    }

    /// Error flag is only meaningful on responses
    pub fn is_error(&self) -> bool {
        !self.is_request() && self.cs_flag(CS_ERROR)
    }

    /// Reject headers the local configuration cannot process.
    ///
    /// Continuation segments carry no cmd_status and always pass the flag checks.
    pub fn check_policy(
        &self,
        compression: bool,
        encryption: bool,
        max_segments: u8,
    ) -> Result<(), WireError> {
        if let Some(count) = self.segment_count() {
            if count > max_segments {
                return Err(WireError::TooManySegments {
                    got: count as usize,
                    max: max_segments as usize,
                });
            }
        }
        if self.segment_number() >= max_segments {
            return Err(WireError::TooManySegments {
                got: self.segment_number() as usize + 1,
                max: max_segments as usize,
            });
        }

        if self.is_compressed() && !compression {
            return Err(WireError::CompressionUnsupported);
        }

        if self.cmd_status().is_some() {
            let encrypted = self.is_encrypted();
            if encrypted != encryption {
                return Err(WireError::EncryptionMismatch { flag: encrypted });
            }
            if self.has_new_key() && !encryption {
                return Err(WireError::EncryptionMismatch { flag: true });
            }
        }

        Ok(())
    }

    /// Serialize header + payload. The CRC is filled in unless `packed`.
    pub fn encode(&self, payload: &[u8], packed: bool) -> Vec<u8> {
        let header_len = self.shape.header_len(packed);
        let mut buf = Vec::with_capacity(header_len + payload.len());

        buf.push(self.info);
        buf.push((self.request_id & 0xFF) as u8);
        match self.shape {
            SegmentShape::Single { cmd_status } => buf.push(cmd_status),
            SegmentShape::First { count, cmd_status } => {
                buf.extend_from_slice(&[0, count, cmd_status]);
            }
            SegmentShape::Continuation { number } => buf.push(number),
        }

        if packed {
            buf.extend_from_slice(payload);
            return buf;
        }

        let crc_offset = buf.len();
        buf.extend_from_slice(&[0, 0]);
        buf.extend_from_slice(payload);

        let crc = crc16(0, &buf);
        buf[crc_offset..crc_offset + CRC_LEN].copy_from_slice(&crc.to_be_bytes());
        buf
    }
}

fn byte_at(message: &[u8], index: usize) -> Result<u8, WireError> {
    message.get(index).copied().ok_or(WireError::BufferTooShort {
        need: index + 1,
        got: message.len(),
    })
}

/// Parse one segment header from the start of `message`.
///
/// `message` must span exactly one SM message (a whole datagram, or one pack
/// entry) since the CRC covers everything after the header. Returns the header
/// and the number of header bytes consumed; the payload is the rest.
pub fn parse_header(message: &[u8], packed: bool) -> Result<(PacketHeader, usize), WireError> {
    let info = byte_at(message, 0)?;
    let request_low = byte_at(message, 1)?;
    let request_id = (((info & INFO_REQUEST_ID_HIGH) as u16) << 8) | request_low as u16;
    let is_request = info & INFO_REQUEST != 0;

    let shape = if info & INFO_MULTIPART != 0 {
        let number = byte_at(message, 2)?;
        if number == 0 {
            let count = byte_at(message, 3)?;
            if count == 0 {
                return Err(WireError::InvalidSegment { number, count });
            }
            SegmentShape::First {
                count,
                cmd_status: byte_at(message, 4)?,
            }
        } else {
            SegmentShape::Continuation { number }
        }
    } else {
        SegmentShape::Single {
            cmd_status: byte_at(message, 2)?,
        }
    };

    let header_len = shape.header_len(packed);
    if message.len() < header_len {
        return Err(WireError::BufferTooShort {
            need: header_len,
            got: message.len(),
        });
    }

    let mut header = PacketHeader {
        info,
        request_id,
        shape,
        crc16: None,
        payload_len: message.len() - header_len,
    };

    if is_request && header.command() == Some(Command::Pack) {
        if packed {
            return Err(WireError::NestedPack);
        }
        if header.is_multipart() {
            return Err(WireError::MultipartPack);
        }
    }

    if !packed {
        let crc_offset = header_len - CRC_LEN;
        let expected = u16::from_be_bytes([message[crc_offset], message[crc_offset + 1]]);

        let mut computed = crc16(0, &message[..crc_offset]);
        computed = crc16(computed, &[0, 0]);
        computed = crc16(computed, &message[header_len..]);

        if computed != expected {
            return Err(WireError::CrcMismatch { expected, computed });
        }
        header.crc16 = Some(expected);
    }

    Ok((header, header_len))
}
