// Replay tracker — one bit per request ID seen under the current key epoch

use super::TRACKING_BYTES;
use crate::store::{ConfigStore, EncryptionDataType, StoreError};
use crate::wire::TransportKind;

const TRACKING_BITS: usize = TRACKING_BYTES * 8;

#[derive(Clone, PartialEq, Eq)]
pub struct ReplayTracker {
    bits: [u8; TRACKING_BYTES],
}

impl Default for ReplayTracker {
    fn default() -> Self {
        Self {
            bits: [0u8; TRACKING_BYTES],
        }
    }
}

impl std::fmt::Debug for ReplayTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplayTracker")
            .field("seen", &self.seen_count())
            .finish()
    }
}

fn locate(request_id: u16) -> (usize, u8) {
    let bit = request_id as usize % TRACKING_BITS;
    (bit / 8, 1 << (bit % 8))
}

impl ReplayTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Restore from persisted bytes. Short records are zero-extended.
    pub fn from_bytes(bytes: &[u8]) -> Self {
        let mut tracker = Self::default();
        let len = bytes.len().min(TRACKING_BYTES);
        tracker.bits[..len].copy_from_slice(&bytes[..len]);
        tracker
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bits
    }

    pub fn load(store: &dyn ConfigStore, transport: TransportKind) -> Result<Self, StoreError> {
        Ok(store
            .load(transport, EncryptionDataType::Tracking)?
            .map(|bytes| Self::from_bytes(&bytes))
            .unwrap_or_default())
    }

    pub fn persist(&self, store: &dyn ConfigStore, transport: TransportKind) -> Result<(), StoreError> {
        store.store(transport, EncryptionDataType::Tracking, &self.bits)
    }

    pub fn has_seen(&self, request_id: u16) -> bool {
        let (byte, mask) = locate(request_id);
        self.bits[byte] & mask != 0
    }

    pub fn mark_seen(&mut self, request_id: u16) {
        let (byte, mask) = locate(request_id);
        self.bits[byte] |= mask;
    }

    /// Returns false (and changes nothing) if `request_id` was already seen.
    pub fn check_and_set(&mut self, request_id: u16) -> bool {
        if self.has_seen(request_id) {
            return false;
        }
        self.mark_seen(request_id);
        true
    }

    pub fn clear(&mut self) {
        self.bits = [0u8; TRACKING_BYTES];
    }

    pub fn seen_count(&self) -> usize {
        self.bits.iter().map(|b| b.count_ones() as usize).sum()
    }
}
