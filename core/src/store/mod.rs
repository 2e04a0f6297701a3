// Store module — persistence of SM key material and counters

pub mod backend;
pub mod config_store;

pub use backend::{MemoryStorage, SledStorage, StorageBackend};
pub use config_store::{BackendConfigStore, ConfigStore, EncryptionDataType};

#[cfg(test)]
pub use config_store::MockConfigStore;

use thiserror::Error;

/// Persistence errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("Storage backend error: {0}")]
    Backend(String),

    #[error("Corrupt {data_type} record: {reason}")]
    Corrupt { data_type: String, reason: String },
}
