// Cryptography module — SM message encryption, key rotation and replay tracking

pub mod keyring;
pub mod provider;
pub mod replay;

pub use keyring::{build_aad, build_nonce, IvPool, IvType, KeyRing, SmKey};
pub use provider::{AesGcmProvider, EncryptionProvider};
pub use replay::ReplayTracker;

use crate::wire::TransportKind;
use crate::FailureKind;
use thiserror::Error;

pub const KEY_LENGTH: usize = 16;
pub const NONCE_LENGTH: usize = 12;
pub const TAG_LENGTH: usize = 16;
pub const DEVICE_ID_LENGTH: usize = 16;
/// device ID + masked info byte + cmd_status
pub const AAD_LENGTH: usize = DEVICE_ID_LENGTH + 2;
/// Replay bitmap size: one bit per request ID
pub const TRACKING_BYTES: usize = 128;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CryptoError {
    #[error("No encryption key installed")]
    NoKey,

    #[error("Invalid key length: {0} (expected {KEY_LENGTH})")]
    InvalidKeyLength(usize),

    #[error("Ciphertext too short: {0} bytes")]
    CiphertextTooShort(usize),

    #[error("Authentication failed with every available key")]
    AuthenticationFailed,

    #[error("Request {request_id} already seen on {transport}")]
    Replay { transport: TransportKind, request_id: u16 },

    #[error("Transport {0} is not registered with the key ring")]
    UnknownTransport(TransportKind),

    #[error("Encryption failed: {0}")]
    EncryptionFailed(String),

    #[error("Unable to persist {transport} tracking data: {reason}")]
    TrackingPersist { transport: TransportKind, reason: String },
}

impl CryptoError {
    pub fn kind(&self) -> FailureKind {
        match self {
            CryptoError::NoKey | CryptoError::EncryptionFailed(_) => FailureKind::Resource,
            _ => FailureKind::Integrity,
        }
    }
}
