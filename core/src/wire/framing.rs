//! Transport framing around SM messages
//!
//! UDP:  [version << 4 | id_type][peer id bytes][SM message]
//! SMS:  "(" peer-id "):" base85(SM message)

use super::{WireError, MAX_HEADER_LEN, SM_UDP_VERSION};
use crate::codec::{decode85, encode85};

const SMS_PREFIX: &[u8] = b"(";
const SMS_SUFFIX: &[u8] = b"):";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Framing {
    /// UDP and satellite links
    Datagram { id_type: u8, peer_id: Vec<u8> },
    /// SMS text, shared key in the preamble
    Sms { peer_id: Vec<u8> },
}

impl Framing {
    pub fn datagram(id_type: u8, peer_id: impl Into<Vec<u8>>) -> Self {
        Framing::Datagram {
            id_type: id_type & 0x0F,
            peer_id: peer_id.into(),
        }
    }

    pub fn sms(peer_id: impl Into<Vec<u8>>) -> Self {
        Framing::Sms {
            peer_id: peer_id.into(),
        }
    }

    /// Bytes (or characters) the framing adds ahead of the SM message
    pub fn preamble_len(&self) -> usize {
        match self {
            Framing::Datagram { peer_id, .. } => 1 + peer_id.len(),
            Framing::Sms { peer_id } if peer_id.is_empty() => 0,
            Framing::Sms { peer_id } => SMS_PREFIX.len() + peer_id.len() + SMS_SUFFIX.len(),
        }
    }

    /// Largest segment payload that still fits in one `mtu`-sized datagram
    pub fn max_payload_bytes(&self, mtu: usize) -> usize {
        let room = mtu.saturating_sub(self.preamble_len());
        match self {
            Framing::Datagram { .. } => room.saturating_sub(MAX_HEADER_LEN),
            Framing::Sms { .. } => (room * 4 / 5).saturating_sub(MAX_HEADER_LEN),
        }
    }

    /// Strip framing from a received datagram.
    ///
    /// `Ok(None)` means the datagram is not addressed to us and should be
    /// ignored. A UDP version mismatch is an error the caller must treat as fatal.
    pub fn unwrap(&self, datagram: &[u8]) -> Result<Option<Vec<u8>>, WireError> {
        match self {
            Framing::Datagram { id_type, peer_id } => {
                let first = *datagram
                    .first()
                    .ok_or(WireError::BufferTooShort { need: 1, got: 0 })?;
                let version = first >> 4;
                if version != SM_UDP_VERSION {
                    return Err(WireError::UnsupportedVersion(version));
                }
                if first & 0x0F != *id_type {
                    return Ok(None);
                }

                let start = 1 + peer_id.len();
                match datagram.get(1..start) {
                    Some(id) if id == peer_id.as_slice() => Ok(Some(datagram[start..].to_vec())),
                    _ => Ok(None),
                }
            }
            Framing::Sms { peer_id } => {
                let text = if peer_id.is_empty() {
                    datagram
                } else {
                    let id_end = SMS_PREFIX.len() + peer_id.len();
                    let start = id_end + SMS_SUFFIX.len();
                    let valid = datagram.len() >= start
                        && datagram.starts_with(SMS_PREFIX)
                        && datagram[SMS_PREFIX.len()..id_end].eq_ignore_ascii_case(peer_id)
                        && &datagram[id_end..start] == SMS_SUFFIX;
                    if !valid {
                        return Ok(None);
                    }
                    &datagram[start..]
                };
                Ok(Some(decode85(text)))
            }
        }
    }

    /// Add framing to an encoded SM message.
    pub fn wrap(&self, message: &[u8]) -> Vec<u8> {
        match self {
            Framing::Datagram { id_type, peer_id } => {
                let mut out = Vec::with_capacity(1 + peer_id.len() + message.len());
                out.push((SM_UDP_VERSION << 4) | id_type);
                out.extend_from_slice(peer_id);
                out.extend_from_slice(message);
                out
            }
            Framing::Sms { peer_id } => {
                let mut out = Vec::with_capacity(self.preamble_len() + message.len() * 5 / 4 + 1);
                if !peer_id.is_empty() {
                    out.extend_from_slice(SMS_PREFIX);
                    out.extend_from_slice(peer_id);
                    out.extend_from_slice(SMS_SUFFIX);
                }
                out.extend_from_slice(&encode85(message));
                out
            }
        }
    }
}
