//! Byte-keyed storage beneath [`BackendConfigStore`](super::BackendConfigStore).
//!
//! A backend may buffer writes. Nothing written is considered durable until
//! [`StorageBackend::sync`] returns, and the config store syncs after every
//! change: a request-ID counter or replay bit lost in a crash means a reused
//! nonce.

use super::StoreError;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use tracing::debug;

#[cfg_attr(test, mockall::automock)]
pub trait StorageBackend: Send + Sync {
    fn read(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError>;
    fn write(&self, key: &[u8], value: &[u8]) -> Result<(), StoreError>;
    /// Drop `key`; erasing a missing key is not an error.
    fn erase(&self, key: &[u8]) -> Result<(), StoreError>;
    /// Entries under `prefix`, ordered by key
    fn list(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StoreError>;
    fn sync(&self) -> Result<(), StoreError>;
}

/// Volatile backend: state is lost with the process. Clones share one map.
#[derive(Debug, Clone, Default)]
pub struct MemoryStorage {
    entries: Arc<RwLock<BTreeMap<Vec<u8>, Vec<u8>>>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StorageBackend for MemoryStorage {
    fn read(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.entries.read().get(key).cloned())
    }

    fn write(&self, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
        self.entries.write().insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    fn erase(&self, key: &[u8]) -> Result<(), StoreError> {
        self.entries.write().remove(key);
        Ok(())
    }

    fn list(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StoreError> {
        let entries = self.entries.read();
        Ok(entries
            .range(prefix.to_vec()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect())
    }

    fn sync(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

/// sled database on local disk
pub struct SledStorage {
    db: sled::Db,
}

fn sled_error(e: sled::Error) -> StoreError {
    StoreError::Backend(e.to_string())
}

impl SledStorage {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        let db = sled::open(path).map_err(sled_error)?;
        debug!(path = %path.display(), recovered = db.was_recovered(), "SM store opened");
        Ok(Self { db })
    }
}

impl StorageBackend for SledStorage {
    fn read(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.db.get(key).map_err(sled_error)?.map(|value| value.to_vec()))
    }

    fn write(&self, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
        self.db.insert(key, value).map_err(sled_error)?;
        Ok(())
    }

    fn erase(&self, key: &[u8]) -> Result<(), StoreError> {
        self.db.remove(key).map_err(sled_error)?;
        Ok(())
    }

    fn list(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StoreError> {
        self.db
            .scan_prefix(prefix)
            .map(|entry| {
                let (key, value) = entry.map_err(sled_error)?;
                Ok((key.to_vec(), value.to_vec()))
            })
            .collect()
    }

    fn sync(&self) -> Result<(), StoreError> {
        let bytes = self.db.flush().map_err(sled_error)?;
        debug!(bytes, "SM store synced");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn check_backend(backend: &dyn StorageBackend) {
        backend.write(b"sm/udp/request_id", &[0, 7]).unwrap();
        backend.write(b"sm/sms/request_id", &[0, 9]).unwrap();
        backend.write(b"sn/other", b"x").unwrap();
        backend.sync().unwrap();

        assert_eq!(backend.read(b"sm/udp/request_id").unwrap(), Some(vec![0, 7]));
        assert_eq!(backend.read(b"sm/edp/current_key").unwrap(), None);

        let listed: Vec<Vec<u8>> = backend.list(b"sm/").unwrap().into_iter().map(|(k, _)| k).collect();
        assert_eq!(listed, vec![b"sm/sms/request_id".to_vec(), b"sm/udp/request_id".to_vec()]);

        backend.erase(b"sm/udp/request_id").unwrap();
        backend.erase(b"sm/udp/request_id").unwrap();
        assert_eq!(backend.read(b"sm/udp/request_id").unwrap(), None);
        assert_eq!(backend.list(b"sm/").unwrap().len(), 1);
    }

    #[test]
    fn test_memory_storage() {
        check_backend(&MemoryStorage::new());
    }

    #[test]
    fn test_memory_storage_clones_share_entries() {
        let a = MemoryStorage::new();
        let b = a.clone();
        a.write(b"k", b"v").unwrap();
        assert_eq!(b.read(b"k").unwrap(), Some(b"v".to_vec()));
    }

    #[test]
    fn test_sled_storage() {
        let dir = tempdir().unwrap();
        check_backend(&SledStorage::open(dir.path().join("sm.db")).unwrap());
    }

    #[test]
    fn test_sled_storage_reopen_keeps_synced_writes() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("sm.db");
        {
            let backend = SledStorage::open(&path).unwrap();
            backend.write(b"sm/edp/current_key", &[0xA1; 16]).unwrap();
            backend.sync().unwrap();
        }
        let backend = SledStorage::open(&path).unwrap();
        assert_eq!(backend.read(b"sm/edp/current_key").unwrap(), Some(vec![0xA1; 16]));
    }
}
