//! SM engine: the connector shared by every transport and the per-transport
//! context the caller's poll loop drives.
//!
//! Nothing here blocks. `receive_next` parses at most one datagram (or resumes
//! a retained one) and `step` advances at most one session; both report
//! whether work was done so the caller can decide when to sleep.

pub mod clock;
pub mod config;
pub mod config_service;
pub mod delegate;
pub mod dispatch;
pub mod machine;
pub mod send;

#[cfg(test)]
pub(crate) mod testing;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{SmConfig, TransportConfig};
pub use config_service::ConfigService;
pub use delegate::{Delivery, DeliveryStatus, NetworkLink, NetworkStatus, SmDelegate};
pub use send::{MessageEncoder, OutboundMessage, RequestOptions};

use crate::crypto::{EncryptionProvider, KeyRing};
use crate::session::{Direction, RequestIdCounter, SessionError, SessionState, SessionTable};
use crate::store::ConfigStore;
use crate::wire::{Framing, TransportKind};
use crate::SmError;
use dispatch::Retained;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::info;

/// Outcome of one engine operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollStatus {
    /// Something was processed; call again soon
    Working,
    /// Nothing to do right now
    Idle,
    /// Blocked on a resource (sessions, request IDs, a delegate); retry later
    Pending,
}

impl PollStatus {
    /// Fold two results: any work wins, then any pending.
    pub fn merge(self, other: PollStatus) -> PollStatus {
        match (self, other) {
            (PollStatus::Working, _) | (_, PollStatus::Working) => PollStatus::Working,
            (PollStatus::Pending, _) | (_, PollStatus::Pending) => PollStatus::Pending,
            _ => PollStatus::Idle,
        }
    }
}

// ============================================================================
// CONNECTOR
// ============================================================================

/// Device-wide engine state: configuration, the shared key ring and the
/// application callbacks.
pub struct SmConnector {
    config: SmConfig,
    keyring: Arc<Mutex<KeyRing>>,
    delegate: Arc<dyn SmDelegate>,
    clock: Arc<dyn Clock>,
}

impl SmConnector {
    /// Load persisted keys and build the connector.
    pub fn new(
        config: SmConfig,
        provider: Arc<dyn EncryptionProvider>,
        store: Arc<dyn ConfigStore>,
        delegate: Arc<dyn SmDelegate>,
    ) -> Result<Self, SmError> {
        config.validate()?;
        let keyring = KeyRing::load(config.device_id, provider, store)?;
        info!(
            device_id = %hex::encode(config.device_id),
            encryption = config.encryption,
            compression = config.compression,
            has_key = keyring.has_key(),
            "SM connector ready"
        );
        Ok(Self {
            config,
            keyring: Arc::new(Mutex::new(keyring)),
            delegate,
            clock: Arc::new(SystemClock),
        })
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn config(&self) -> &SmConfig {
        &self.config
    }

    pub fn keyring(&self) -> Arc<Mutex<KeyRing>> {
        Arc::clone(&self.keyring)
    }

    /// Open a transport over `link`, restoring its persisted replay bitmap
    /// and request-ID counter.
    pub fn open(
        &self,
        transport: TransportConfig,
        link: Arc<dyn NetworkLink>,
    ) -> Result<TransportContext, SmError> {
        transport.validate()?;
        let framing = transport.framing()?;
        let max_payload = framing.max_payload_bytes(transport.mtu);
        self.keyring.lock().join(transport.kind)?;

        info!(
            transport = %transport.kind,
            mtu = transport.mtu,
            max_payload,
            encryption = self.config.encryption,
            "SM transport opened"
        );

        Ok(TransportContext {
            config: self.config.clone(),
            sessions: SessionTable::new(self.config.max_sessions),
            transport,
            framing,
            max_payload,
            request_ids: RequestIdCounter::default(),
            keyring: Arc::clone(&self.keyring),
            link,
            delegate: Arc::clone(&self.delegate),
            clock: Arc::clone(&self.clock),
            retained: VecDeque::new(),
            closed: false,
        })
    }

    /// Handler for SM configuration requests (capabilities, key set).
    pub fn config_service(&self) -> ConfigService {
        ConfigService::new(Arc::clone(&self.keyring), &self.config)
    }
}

// ============================================================================
// TRANSPORT CONTEXT
// ============================================================================

/// Everything one SM transport owns. The key ring is shared with the other
/// transports of the connector.
pub struct TransportContext {
    config: SmConfig,
    transport: TransportConfig,
    framing: Framing,
    max_payload: usize,
    sessions: SessionTable,
    /// Request IDs for unencrypted transports
    request_ids: RequestIdCounter,
    keyring: Arc<Mutex<KeyRing>>,
    link: Arc<dyn NetworkLink>,
    delegate: Arc<dyn SmDelegate>,
    clock: Arc<dyn Clock>,
    /// Messages parsed but not yet applied (resource exhaustion, pack entries)
    retained: VecDeque<Retained>,
    closed: bool,
}

impl TransportContext {
    pub fn kind(&self) -> TransportKind {
        self.transport.kind
    }

    pub fn max_payload_bytes(&self) -> usize {
        self.max_payload
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn session_state(&self, request_id: u16, direction: Direction) -> Option<SessionState> {
        self.sessions.get(&(request_id, direction)).map(|s| s.state)
    }

    /// Datagram parts held back for a later `receive_next`
    pub fn retained_count(&self) -> usize {
        self.retained.len()
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Read (or resume) one datagram, then step every live session once.
    pub fn poll(&mut self) -> Result<PollStatus, SmError> {
        let mut status = self.receive_next()?;
        for _ in 0..self.sessions.len() {
            status = status.merge(self.step()?);
        }
        Ok(status)
    }

    /// Force one session (either direction) to `error` and delete it.
    ///
    /// Returns false if no session uses `request_id`.
    pub fn cancel_session(&mut self, request_id: u16) -> Result<bool, SmError> {
        let mut found = false;
        for direction in [Direction::ClientOriginated, Direction::CloudOriginated] {
            let key = (request_id, direction);
            if let Some(session) = self.sessions.get_mut(&key) {
                session.fail(SessionError::Cancelled);
                self.handle_error(key)?;
                found = true;
            }
        }
        Ok(found)
    }

    /// Cancel every live session.
    pub fn cancel_all(&mut self) -> Result<(), SmError> {
        for key in self.sessions.keys() {
            if let Some(session) = self.sessions.get_mut(&key) {
                session.fail(SessionError::Cancelled);
            }
            self.handle_error(key)?;
        }
        Ok(())
    }

    /// Cancel everything, drop retained datagrams and refuse further work.
    pub fn shutdown(&mut self) -> Result<(), SmError> {
        if self.closed {
            return Ok(());
        }
        let result = self.cancel_all();
        self.retained.clear();
        self.closed = true;
        info!(transport = %self.transport.kind, "SM transport closed");
        result
    }

    fn ensure_open(&self) -> Result<(), SmError> {
        if self.closed {
            return Err(SmError::Aborted(format!("{} transport is closed", self.transport.kind)));
        }
        Ok(())
    }
}

impl std::fmt::Debug for TransportContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportContext")
            .field("transport", &self.transport.kind)
            .field("sessions", &self.sessions.len())
            .field("retained", &self.retained.len())
            .field("closed", &self.closed)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_poll_status_merge() {
        use PollStatus::*;
        assert_eq!(Idle.merge(Idle), Idle);
        assert_eq!(Idle.merge(Pending), Pending);
        assert_eq!(Pending.merge(Working), Working);
        assert_eq!(Working.merge(Idle), Working);
    }
}
