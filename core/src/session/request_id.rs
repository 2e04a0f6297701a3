// Request ID allocation for locally-originated requests

use crate::store::{ConfigStore, EncryptionDataType, StoreError};
use crate::wire::{TransportKind, REQUEST_ID_LAST, REQUEST_ID_MASK};

/// Per-transport request ID counter.
///
/// Encrypted transports must never reuse an ID under the same key, so the
/// counter is persisted after every increment and stops at `REQUEST_ID_LAST`.
/// Unencrypted transports wrap around and skip IDs held by live sessions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RequestIdCounter {
    next: u16,
}

impl RequestIdCounter {
    pub fn new(start: u16) -> Self {
        Self {
            next: start & REQUEST_ID_MASK,
        }
    }

    pub fn value(&self) -> u16 {
        self.next
    }

    pub fn reset(&mut self) {
        self.next = 0;
    }

    pub fn load(store: &dyn ConfigStore, transport: TransportKind) -> Result<Self, StoreError> {
        match store.load(transport, EncryptionDataType::RequestId)? {
            None => Ok(Self::default()),
            Some(bytes) if bytes.is_empty() => Ok(Self::default()),
            Some(bytes) if bytes.len() == 2 => Ok(Self::new(u16::from_be_bytes([bytes[0], bytes[1]]))),
            Some(bytes) => Err(StoreError::Corrupt {
                data_type: EncryptionDataType::RequestId.to_string(),
                reason: format!("expected 2 bytes, found {}", bytes.len()),
            }),
        }
    }

    pub fn persist(&self, store: &dyn ConfigStore, transport: TransportKind) -> Result<(), StoreError> {
        store.store(transport, EncryptionDataType::RequestId, &self.next.to_be_bytes())
    }

    /// Allocate the next ID on an encrypted transport.
    ///
    /// `Ok(None)` once the ID space is used up (a new key resets it). If
    /// `persist` fails the counter is parked at `REQUEST_ID_LAST` so no further
    /// ID can be issued under this key.
    pub fn next_persisted<F>(&mut self, persist: F) -> Result<Option<u16>, StoreError>
    where
        F: FnOnce(u16) -> Result<(), StoreError>,
    {
        if self.next >= REQUEST_ID_LAST {
            return Ok(None);
        }

        let id = self.next;
        self.next += 1;
        if let Err(e) = persist(self.next) {
            self.next = REQUEST_ID_LAST;
            return Err(e);
        }
        Ok(Some(id))
    }

    /// Allocate the next ID on an unencrypted transport, skipping IDs for which
    /// `in_use` is true. `None` when every ID is taken.
    pub fn next_free<F>(&mut self, in_use: F) -> Option<u16>
    where
        F: Fn(u16) -> bool,
    {
        let start = self.next;
        loop {
            self.next = (self.next + 1) & REQUEST_ID_MASK;
            if !in_use(self.next) {
                return Some(self.next);
            }
            if self.next == start {
                return None;
            }
        }
    }
}
