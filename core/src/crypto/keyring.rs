//! Key ring: current/previous AES key, nonce and AAD construction, replay
//! bookkeeping and encrypted request-ID allocation.
//!
//! One key ring is shared by every SM transport of a device (the key is
//! device-wide). Each transport that joins gets its own replay bitmap and
//! request-ID counter, both persisted through the [`ConfigStore`].
//!
//! Decrypt policy:
//! 1. Try the current key. On success, retire a still-valid previous key and
//!    clear the transport's replay bitmap: the peer has provably rotated.
//! 2. Otherwise try the previous key (messages sealed just before a rotation).
//! 3. On success with either key, reject the message if its request ID was
//!    already seen; else mark it seen and persist the bitmap.

use super::{
    CryptoError, EncryptionProvider, ReplayTracker, AAD_LENGTH, DEVICE_ID_LENGTH, KEY_LENGTH,
    NONCE_LENGTH,
};
use crate::session::RequestIdCounter;
use crate::store::{ConfigStore, EncryptionDataType};
use crate::wire::{TransportKind, INFO_AAD_MASK, INFO_REQUEST};
use crate::SmError;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Nonce byte 1, high bit: which side of the exchange
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum IvType {
    Request = 0x00,
    Response = 0x80,
}

/// Nonce byte 1: who sealed the message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum IvPool {
    Device = 0x00,
    Server = 0x40,
}

/// 128-bit symmetric key, wiped on drop
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct SmKey([u8; KEY_LENGTH]);

impl SmKey {
    pub fn from_slice(bytes: &[u8]) -> Result<Self, CryptoError> {
        let key: [u8; KEY_LENGTH] = bytes
            .try_into()
            .map_err(|_| CryptoError::InvalidKeyLength(bytes.len()))?;
        Ok(Self(key))
    }

    pub fn as_bytes(&self) -> &[u8; KEY_LENGTH] {
        &self.0
    }
}

impl std::fmt::Debug for SmKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SmKey(..)")
    }
}

/// Nonce: `[transport, type | pool, id_hi, id_lo, 0...]` XOR the tail of the device ID
pub fn build_nonce(
    device_id: &[u8; DEVICE_ID_LENGTH],
    transport: TransportKind,
    iv_type: IvType,
    pool: IvPool,
    request_id: u16,
) -> [u8; NONCE_LENGTH] {
    let mut iv = [0u8; NONCE_LENGTH];
    iv[0] = transport.tag();
    iv[1] = iv_type as u8 | pool as u8;
    iv[2..4].copy_from_slice(&request_id.to_be_bytes());

    let suffix = &device_id[DEVICE_ID_LENGTH - NONCE_LENGTH..];
    for (byte, mask) in iv.iter_mut().zip(suffix) {
        *byte ^= mask;
    }
    iv
}

pub fn build_aad(device_id: &[u8; DEVICE_ID_LENGTH], info: u8, cmd_status: u8) -> [u8; AAD_LENGTH] {
    let mut aad = [0u8; AAD_LENGTH];
    aad[..DEVICE_ID_LENGTH].copy_from_slice(device_id);
    aad[DEVICE_ID_LENGTH] = info & INFO_AAD_MASK;
    aad[DEVICE_ID_LENGTH + 1] = cmd_status;
    aad
}

fn iv_type_for(info: u8) -> IvType {
    if info & INFO_REQUEST != 0 {
        IvType::Request
    } else {
        IvType::Response
    }
}

#[derive(Debug, Default)]
struct Member {
    tracking: ReplayTracker,
    request_id: RequestIdCounter,
}

pub struct KeyRing {
    device_id: [u8; DEVICE_ID_LENGTH],
    current: Option<SmKey>,
    previous: Option<SmKey>,
    members: BTreeMap<TransportKind, Member>,
    provider: Arc<dyn EncryptionProvider>,
    store: Arc<dyn ConfigStore>,
}

impl KeyRing {
    /// Empty key ring; nothing is read from the store.
    pub fn new(
        device_id: [u8; DEVICE_ID_LENGTH],
        provider: Arc<dyn EncryptionProvider>,
        store: Arc<dyn ConfigStore>,
    ) -> Self {
        Self {
            device_id,
            current: None,
            previous: None,
            members: BTreeMap::new(),
            provider,
            store,
        }
    }

    /// Key ring with the persisted current and previous keys.
    pub fn load(
        device_id: [u8; DEVICE_ID_LENGTH],
        provider: Arc<dyn EncryptionProvider>,
        store: Arc<dyn ConfigStore>,
    ) -> Result<Self, SmError> {
        let mut ring = Self::new(device_id, provider, store);
        ring.current = ring.load_key(EncryptionDataType::CurrentKey)?;
        ring.previous = ring.load_key(EncryptionDataType::PreviousKey)?;
        info!(
            have_key = ring.current.is_some(),
            have_previous = ring.previous.is_some(),
            "Key ring loaded"
        );
        Ok(ring)
    }

    fn load_key(&self, data_type: EncryptionDataType) -> Result<Option<SmKey>, SmError> {
        let Some(bytes) = self.store.load(TransportKind::Edp, data_type)? else {
            return Ok(None);
        };
        if bytes.is_empty() {
            return Ok(None);
        }
        match SmKey::from_slice(&bytes) {
            Ok(key) => Ok(Some(key)),
            Err(e) => {
                warn!(%data_type, "Ignoring persisted key: {}", e);
                Ok(None)
            }
        }
    }

    /// Register a transport, restoring its replay bitmap and request-ID counter.
    pub fn join(&mut self, transport: TransportKind) -> Result<(), SmError> {
        let store = self.store.as_ref();
        let member = Member {
            tracking: ReplayTracker::load(store, transport)?,
            request_id: RequestIdCounter::load(store, transport)?,
        };
        debug!(%transport, seen = member.tracking.seen_count(), next_id = member.request_id.value(), "Transport joined key ring");
        self.members.insert(transport, member);
        Ok(())
    }

    pub fn device_id(&self) -> &[u8; DEVICE_ID_LENGTH] {
        &self.device_id
    }

    pub fn has_key(&self) -> bool {
        self.current.is_some()
    }

    pub fn has_previous_key(&self) -> bool {
        self.previous.is_some()
    }

    pub fn transports(&self) -> Vec<TransportKind> {
        self.members.keys().copied().collect()
    }

    /// Next request ID the transport would issue
    pub fn request_id(&self, transport: TransportKind) -> Option<u16> {
        self.members.get(&transport).map(|m| m.request_id.value())
    }

    pub fn has_seen(&self, transport: TransportKind, request_id: u16) -> bool {
        self.members
            .get(&transport)
            .map(|m| m.tracking.has_seen(request_id))
            .unwrap_or(false)
    }

    fn member_mut(&mut self, transport: TransportKind) -> Result<&mut Member, CryptoError> {
        self.members
            .get_mut(&transport)
            .ok_or(CryptoError::UnknownTransport(transport))
    }

    /// Seal `plaintext` for the wire: returns `ciphertext || tag`.
    pub fn encrypt(
        &self,
        transport: TransportKind,
        request_id: u16,
        info: u8,
        cmd_status: u8,
        pool: IvPool,
        plaintext: &[u8],
    ) -> Result<Vec<u8>, CryptoError> {
        let key = self.current.as_ref().ok_or(CryptoError::NoKey)?;
        let nonce = build_nonce(&self.device_id, transport, iv_type_for(info), pool, request_id);
        let aad = build_aad(&self.device_id, info, cmd_status);
        self.provider.encrypt(key.as_bytes(), &nonce, &aad, plaintext)
    }

    /// Open a received message (`ciphertext || tag`) under the decrypt policy.
    pub fn decrypt(
        &mut self,
        transport: TransportKind,
        request_id: u16,
        info: u8,
        cmd_status: u8,
        pool: IvPool,
        sealed: &[u8],
    ) -> Result<Vec<u8>, CryptoError> {
        self.member_mut(transport)?;
        let store = Arc::clone(&self.store);
        let current = self.current.as_ref().ok_or(CryptoError::NoKey)?;
        let nonce = build_nonce(&self.device_id, transport, iv_type_for(info), pool, request_id);
        let aad = build_aad(&self.device_id, info, cmd_status);

        let plaintext = match self.provider.decrypt(current.as_bytes(), &nonce, &aad, sealed) {
            Ok(plaintext) => {
                if self.previous.take().is_some() {
                    info!(%transport, "Peer rotated to the current key; retiring previous key");
                    if let Err(e) = store.store(TransportKind::Edp, EncryptionDataType::PreviousKey, &[]) {
                        warn!(%transport, "Unable to clear previous key: {}", e);
                    }
                    let member = self.member_mut(transport)?;
                    member.tracking.clear();
                    if let Err(e) = member.tracking.persist(store.as_ref(), transport) {
                        warn!(%transport, "Unable to clear tracking data: {}", e);
                    }
                }
                plaintext
            }
            Err(current_err) => {
                let previous = self.previous.as_ref().ok_or(current_err)?;
                debug!(%transport, request_id, "Current key failed, trying previous key");
                self.provider.decrypt(previous.as_bytes(), &nonce, &aad, sealed)?
            }
        };

        let member = self.member_mut(transport)?;
        if !member.tracking.check_and_set(request_id) {
            warn!(%transport, request_id, "Dropping replayed request");
            return Err(CryptoError::Replay { transport, request_id });
        }
        member
            .tracking
            .persist(store.as_ref(), transport)
            .map_err(|e| CryptoError::TrackingPersist {
                transport,
                reason: e.to_string(),
            })?;

        Ok(plaintext)
    }

    /// Install a new current key.
    ///
    /// The old current key becomes the previous key and every joined
    /// transport's request-ID counter restarts at zero. Every counter reset is
    /// persisted before the key is written; if any of those writes fail the
    /// counters already written are put back and the ring keeps its old key.
    /// Either failure is fatal: the device could no longer guarantee unique
    /// nonces.
    pub fn install_key(&mut self, key: &[u8]) -> Result<(), SmError> {
        let key = SmKey::from_slice(key)?;

        let fresh = RequestIdCounter::default();
        let mut written: Vec<TransportKind> = Vec::with_capacity(self.members.len());
        for transport in self.members.keys().copied() {
            if let Err(source) = fresh.persist(self.store.as_ref(), transport) {
                self.restore_request_ids(&written);
                return Err(SmError::RequestIdPersist { transport, source });
            }
            written.push(transport);
        }

        if let Err(e) = self
            .store
            .store(TransportKind::Edp, EncryptionDataType::CurrentKey, key.as_bytes())
        {
            self.restore_request_ids(&written);
            return Err(SmError::KeyInstall(format!("unable to store new key: {}", e)));
        }

        for member in self.members.values_mut() {
            member.request_id.reset();
        }

        if let Some(old) = self.current.take() {
            if let Err(e) = self.store.store(TransportKind::Edp, EncryptionDataType::PreviousKey, old.as_bytes()) {
                warn!("Unable to store previous key: {}", e);
            }
            self.previous = Some(old);
        }
        self.current = Some(key);

        info!(transports = ?self.transports(), "Installed new SM key");
        Ok(())
    }

    /// Write the in-memory counters back over resets already stored by an
    /// install that did not go through.
    fn restore_request_ids(&self, transports: &[TransportKind]) {
        for transport in transports {
            let Some(member) = self.members.get(transport) else {
                continue;
            };
            if let Err(e) = member.request_id.persist(self.store.as_ref(), *transport) {
                error!(%transport, next_id = member.request_id.value(), "Unable to restore request ID counter: {}", e);
            }
        }
    }

    /// Rewrite every transport's replay bitmap to the store.
    pub fn write_tracking(&self) -> Result<(), SmError> {
        for (transport, member) in &self.members {
            member.tracking.persist(self.store.as_ref(), *transport)?;
        }
        Ok(())
    }

    /// Allocate a request ID on an encrypted transport.
    ///
    /// `Ok(None)` when the ID space under this key is exhausted.
    pub fn next_request_id(&mut self, transport: TransportKind) -> Result<Option<u16>, SmError> {
        let store = Arc::clone(&self.store);
        let member = self.member_mut(transport)?;
        member
            .request_id
            .next_persisted(|next| {
                store.store(transport, EncryptionDataType::RequestId, &next.to_be_bytes())
            })
            .map_err(|source| SmError::RequestIdPersist { transport, source })
    }

    /// GCM tag of an empty message under the current key, so the server can
    /// confirm which key the device holds.
    pub fn key_check_tag(&self) -> Result<Vec<u8>, CryptoError> {
        let key = self.current.as_ref().ok_or(CryptoError::NoKey)?;
        let nonce = build_nonce(&self.device_id, TransportKind::Edp, IvType::Request, IvPool::Device, 0);
        self.provider.encrypt(key.as_bytes(), &nonce, &self.device_id, &[])
    }

    /// Forget the current key (the provider can no longer use it).
    pub fn invalidate_current(&mut self) {
        self.current = None;
    }
}

impl std::fmt::Debug for KeyRing {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyRing")
            .field("has_key", &self.current.is_some())
            .field("has_previous", &self.previous.is_some())
            .field("members", &self.members)
            .finish()
    }
}
