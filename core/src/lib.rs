// Cloudlink Core — Short Message (SM) protocol engine
//
// Receives raw datagrams from a lossy transport (UDP, SMS), rebuilds
// application messages that may span many datagrams, verifies, decrypts and
// decompresses them, and drives each message through a per-session state
// machine to delivery.

pub mod codec;
pub mod crypto;
pub mod engine;
pub mod session;
pub mod store;
pub mod wire;

use thiserror::Error;

pub use codec::{crc16, decode85, encode85};
pub use crypto::{AesGcmProvider, CryptoError, EncryptionProvider, KeyRing};
pub use engine::{
    Clock, ConfigService, Delivery, DeliveryStatus, ManualClock, MessageEncoder, NetworkLink,
    NetworkStatus, OutboundMessage, PollStatus, RequestOptions, SmConfig, SmConnector, SmDelegate,
    SystemClock, TransportConfig, TransportContext,
};
pub use session::{Direction, ErrorCode, SessionError, SessionState};
pub use store::{
    BackendConfigStore, ConfigStore, EncryptionDataType, MemoryStorage, SledStorage,
    StorageBackend, StoreError,
};
pub use wire::{Command, TransportKind, WireError};

// ============================================================================
// ERROR TYPES
// ============================================================================

/// How the dispatcher reacts to a failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Bad header shape, unsupported flags, nested pack: drop and continue
    Malformed,
    /// CRC mismatch, failed decrypt, replay: drop and continue
    Integrity,
    /// Out of sessions, IDs or storage: retry later
    Resource,
    /// The transport cannot continue safely
    Fatal,
}

#[derive(Debug, Error, Clone)]
pub enum SmError {
    #[error(transparent)]
    Wire(#[from] WireError),

    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("Unable to persist {transport} request ID: {source}")]
    RequestIdPersist {
        transport: TransportKind,
        #[source]
        source: StoreError,
    },

    #[error("Key installation failed: {0}")]
    KeyInstall(String),

    #[error("Session limit reached ({max})")]
    SessionLimit { max: usize },

    #[error("No request ID available on {0}")]
    RequestIdExhausted(TransportKind),

    #[error("Decompression failed: {0}")]
    Decompression(String),

    #[error("Compression failed: {0}")]
    Compression(String),

    #[error("Message needs {needed} segments (max {max})")]
    MessageTooLarge { needed: usize, max: usize },

    #[error("Network send failed: {0}")]
    Link(String),

    #[error("Transport aborted: {0}")]
    Aborted(String),

    #[error("No session for request {0}")]
    UnknownSession(u16),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl SmError {
    pub fn kind(&self) -> FailureKind {
        match self {
            SmError::Wire(e) => e.kind(),
            SmError::Crypto(e) => e.kind(),
            SmError::Store(_) => FailureKind::Resource,
            SmError::RequestIdPersist { .. } => FailureKind::Fatal,
            SmError::KeyInstall(_) => FailureKind::Fatal,
            SmError::SessionLimit { .. } => FailureKind::Resource,
            SmError::RequestIdExhausted(_) => FailureKind::Resource,
            SmError::Decompression(_) => FailureKind::Integrity,
            SmError::Compression(_) => FailureKind::Resource,
            SmError::MessageTooLarge { .. } => FailureKind::Malformed,
            SmError::Link(_) => FailureKind::Resource,
            SmError::Aborted(_) => FailureKind::Fatal,
            SmError::UnknownSession(_) => FailureKind::Malformed,
            SmError::InvalidConfig(_) => FailureKind::Fatal,
        }
    }

    pub fn is_fatal(&self) -> bool {
        self.kind() == FailureKind::Fatal
    }
}
