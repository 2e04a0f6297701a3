//! SM configuration service: capability discovery and key installation.
//!
//! Requests and responses are opcode-prefixed byte strings:
//!
//! | Request              | Response                                   |
//! |----------------------|--------------------------------------------|
//! | `[0x00]`             | `[0x00, flags]` + key check tag if keyed   |
//! | `[0x01, key(16)]`    | `[0x02, tag(16)]` or `[0x03, error text]`  |
//! | anything else        | `[0x03, "invalid opcode"]`                 |

use super::SmConfig;
use crate::crypto::{KeyRing, KEY_LENGTH};
use crate::wire::TransportKind;
use crate::SmError;
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{error, info, warn};

pub const OPCODE_CAPABILITIES: u8 = 0x00;
pub const OPCODE_KEY_SET: u8 = 0x01;
pub const OPCODE_KEY_ACK: u8 = 0x02;
pub const OPCODE_ERROR: u8 = 0x03;

pub const CAP_SMS: u8 = 0x01;
pub const CAP_UDP: u8 = 0x02;
pub const CAP_ENCRYPTION: u8 = 0x04;
pub const CAP_HAVE_KEY: u8 = 0x08;
pub const CAP_COMPRESSION: u8 = 0x10;
pub const CAP_PACK: u8 = 0x20;

pub struct ConfigService {
    keyring: Arc<Mutex<KeyRing>>,
    encryption: bool,
    compression: bool,
}

impl ConfigService {
    pub fn new(keyring: Arc<Mutex<KeyRing>>, config: &SmConfig) -> Self {
        Self {
            keyring,
            encryption: config.encryption,
            compression: config.compression,
        }
    }

    /// Answer one request.
    ///
    /// Rejected requests are answered with `[0x03, reason]`. A key that was
    /// accepted but could not be persisted is an `Err`: the caller must stop
    /// the transport rather than reply.
    pub fn handle(&self, request: &[u8]) -> Result<Vec<u8>, SmError> {
        match request.first() {
            Some(&OPCODE_CAPABILITIES) => Ok(self.capabilities()),
            Some(&OPCODE_KEY_SET) => match self.set_key(&request[1..]) {
                Ok(tag) => {
                    let mut response = Vec::with_capacity(1 + tag.len());
                    response.push(OPCODE_KEY_ACK);
                    response.extend_from_slice(&tag);
                    Ok(response)
                }
                Err(KeySetError::Rejected(reason)) => {
                    warn!("Key set rejected: {}", reason);
                    Ok(error_response(reason))
                }
                Err(KeySetError::Fatal(e)) => {
                    error!("Key set failed: {}", e);
                    Err(e)
                }
            },
            _ => Ok(error_response("invalid opcode")),
        }
    }

    fn capabilities(&self) -> Vec<u8> {
        let mut keyring = self.keyring.lock();

        let mut flags = CAP_PACK;
        for transport in keyring.transports() {
            match transport {
                TransportKind::Sms => flags |= CAP_SMS,
                TransportKind::Udp | TransportKind::Satellite => flags |= CAP_UDP,
                TransportKind::Edp => {}
            }
        }
        if self.encryption {
            flags |= CAP_ENCRYPTION;
        }
        if self.compression {
            flags |= CAP_COMPRESSION;
        }

        let mut tag = None;
        if keyring.has_key() {
            match keyring.key_check_tag() {
                Ok(t) => tag = Some(t),
                Err(e) => {
                    warn!("Unable to generate key check tag, dropping key: {}", e);
                    keyring.invalidate_current();
                }
            }
        }

        let mut response = vec![OPCODE_CAPABILITIES];
        match tag {
            Some(tag) => {
                response.push(flags | CAP_HAVE_KEY);
                response.extend_from_slice(&tag);
            }
            None => response.push(flags),
        }
        response
    }

    fn set_key(&self, body: &[u8]) -> Result<Vec<u8>, KeySetError> {
        if !self.encryption {
            return Err(KeySetError::Rejected("encryption disabled"));
        }
        let key = body
            .get(..KEY_LENGTH)
            .ok_or(KeySetError::Rejected("invalid key length"))?;

        let mut keyring = self.keyring.lock();
        keyring
            .install_key(key)
            .map_err(|e| KeySetError::escalate(e, "unable to store key"))?;
        keyring
            .write_tracking()
            .map_err(|e| KeySetError::escalate(e, "unable to write tracking data"))?;
        let tag = keyring.key_check_tag().map_err(|e| {
            warn!("{}", e);
            KeySetError::Rejected("unable to generate tag")
        })?;

        info!("SM key installed through config service");
        Ok(tag)
    }
}

enum KeySetError {
    /// Answered with an error response
    Rejected(&'static str),
    Fatal(SmError),
}

impl KeySetError {
    fn escalate(e: SmError, reason: &'static str) -> Self {
        if e.is_fatal() {
            return KeySetError::Fatal(e);
        }
        warn!("{}", e);
        KeySetError::Rejected(reason)
    }
}

fn error_response(reason: &str) -> Vec<u8> {
    let mut response = Vec::with_capacity(1 + reason.len());
    response.push(OPCODE_ERROR);
    response.extend_from_slice(reason.as_bytes());
    response
}
