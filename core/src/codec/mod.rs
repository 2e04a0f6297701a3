//! Byte-level codecs shared by every SM transport
//!
//! - `crc`: CRC-16/ARC used to integrity-check non-packed segments
//! - `base85`: text-safe encoding used by the SMS transport (5 symbols per 4 bytes)

pub mod base85;
pub mod crc;

pub use base85::{decode85, decoded_len, encode85, encoded_len};
pub use crc::crc16;
