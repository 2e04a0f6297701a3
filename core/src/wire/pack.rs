//! Pack command body
//!
//! ```text
//! [flag][be16 len][sub-message ...]  ([be16 len][sub-message ...])*
//! ```
//!
//! The outer message is a single-segment `Pack` request whose CRC covers the
//! whole body. Sub-messages use the packed header shapes (no CRC). Trailing
//! bytes shorter than the smallest packed message are ignored.

use super::{WireError, PACK_MORE_DATA};

/// Smallest trailing remainder that can still hold `[len][header]`
const MIN_ENTRY_BYTES: usize = 5;

/// Iterates the sub-messages of a pack body
pub struct PackIter<'a> {
    body: &'a [u8],
    offset: usize,
    more_data: bool,
    failed: bool,
}

impl<'a> PackIter<'a> {
    /// Read the leading flag byte. The first entry's length follows it directly.
    pub fn new(body: &'a [u8]) -> Result<Self, WireError> {
        let flag = *body.first().ok_or(WireError::BufferTooShort { need: 3, got: 0 })?;
        Ok(Self {
            body,
            offset: 1,
            more_data: flag & PACK_MORE_DATA != 0,
            failed: false,
        })
    }

    /// Peer has more messages queued
    pub fn more_data(&self) -> bool {
        self.more_data
    }

    /// Bytes consumed so far
    pub fn offset(&self) -> usize {
        self.offset
    }
}

impl<'a> Iterator for PackIter<'a> {
    type Item = Result<&'a [u8], WireError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }

        let remaining = self.body.len() - self.offset;
        let first = self.offset == 1;
        // The first entry is always read; later ones only if a minimal entry fits
        if (first && remaining < 2) || (!first && remaining < MIN_ENTRY_BYTES) {
            if first {
                self.failed = true;
                return Some(Err(WireError::BufferTooShort {
                    need: self.offset + 2,
                    got: self.body.len(),
                }));
            }
            return None;
        }

        let len = u16::from_be_bytes([self.body[self.offset], self.body[self.offset + 1]]) as usize;
        let start = self.offset + 2;
        let end = start + len;
        if end > self.body.len() {
            self.failed = true;
            return Some(Err(WireError::PackEntryTooLarge {
                len,
                max: self.body.len() - start,
            }));
        }

        self.offset = end;
        Some(Ok(&self.body[start..end]))
    }
}

/// Build a pack body from already-encoded (packed-shape) sub-messages.
pub fn encode_pack(entries: &[&[u8]], more_data: bool) -> Result<Vec<u8>, WireError> {
    let total = 1 + entries.iter().map(|e| 2 + e.len()).sum::<usize>();
    let mut body = Vec::with_capacity(total);
    body.push(if more_data { PACK_MORE_DATA } else { 0 });

    for entry in entries {
        if entry.len() > u16::MAX as usize {
            return Err(WireError::PackEntryTooLarge {
                len: entry.len(),
                max: u16::MAX as usize,
            });
        }
        body.extend_from_slice(&(entry.len() as u16).to_be_bytes());
        body.extend_from_slice(entry);
    }

    Ok(body)
}
