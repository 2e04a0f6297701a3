//! Configuration store: persisted key material, request-ID counters and replay bitmaps.
//!
//! The engine never touches stable storage directly. Everything that must
//! survive a restart goes through [`ConfigStore`], keyed by SM transport and
//! [`EncryptionDataType`]. Key material shared by every transport is stored
//! under [`TransportKind::Edp`].

use super::{StorageBackend, StoreError};
use crate::wire::TransportKind;
use std::fmt;

/// What is being persisted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EncryptionDataType {
    CurrentKey,
    PreviousKey,
    RequestId,
    Tracking,
}

impl EncryptionDataType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EncryptionDataType::CurrentKey => "current_key",
            EncryptionDataType::PreviousKey => "previous_key",
            EncryptionDataType::RequestId => "request_id",
            EncryptionDataType::Tracking => "tracking",
        }
    }
}

impl fmt::Display for EncryptionDataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// External persistence capability.
///
/// Storing an empty value clears the entry (a retired previous key is stored
/// as empty); a cleared entry may load back as `None`.
#[cfg_attr(test, mockall::automock)]
pub trait ConfigStore: Send + Sync {
    fn load(
        &self,
        transport: TransportKind,
        data_type: EncryptionDataType,
    ) -> Result<Option<Vec<u8>>, StoreError>;

    fn store(
        &self,
        transport: TransportKind,
        data_type: EncryptionDataType,
        data: &[u8],
    ) -> Result<(), StoreError>;
}

/// [`ConfigStore`] over any [`StorageBackend`], keyed `sm/<transport>/<type>`.
///
/// Every store is synced before it returns; an empty value erases the key.
pub struct BackendConfigStore<B: StorageBackend> {
    backend: B,
}

impl<B: StorageBackend> BackendConfigStore<B> {
    pub fn new(backend: B) -> Self {
        Self { backend }
    }

    pub fn key(transport: TransportKind, data_type: EncryptionDataType) -> Vec<u8> {
        format!("sm/{}/{}", transport, data_type).into_bytes()
    }

    /// Every persisted SM entry, for diagnostics
    pub fn entries(&self) -> Result<Vec<(String, Vec<u8>)>, StoreError> {
        let raw = self.backend.list(b"sm/")?;
        Ok(raw
            .into_iter()
            .map(|(key, value)| (String::from_utf8_lossy(&key).into_owned(), value))
            .collect())
    }
}

impl<B: StorageBackend> ConfigStore for BackendConfigStore<B> {
    fn load(
        &self,
        transport: TransportKind,
        data_type: EncryptionDataType,
    ) -> Result<Option<Vec<u8>>, StoreError> {
        self.backend.read(&Self::key(transport, data_type))
    }

    fn store(
        &self,
        transport: TransportKind,
        data_type: EncryptionDataType,
        data: &[u8],
    ) -> Result<(), StoreError> {
        let key = Self::key(transport, data_type);
        if data.is_empty() {
            self.backend.erase(&key)?;
        } else {
            self.backend.write(&key, data)?;
        }
        self.backend.sync()
    }
}
