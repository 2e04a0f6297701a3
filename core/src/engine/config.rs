//! Engine and per-transport configuration

use crate::crypto::DEVICE_ID_LENGTH;
use crate::wire::{Framing, TransportKind, MAX_HEADER_LEN};
use crate::SmError;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default bound on live sessions per transport
pub const DEFAULT_MAX_SESSIONS: usize = 20;
/// Default segment limit for multipart messages
pub const DEFAULT_MAX_SEGMENTS: u8 = 16;
/// Default receive timeout
pub const DEFAULT_RX_TIMEOUT_SECS: u32 = 60;

/// Engine-wide settings shared by every transport
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SmConfig {
    /// Device identity bound into every nonce and AAD
    pub device_id: [u8; DEVICE_ID_LENGTH],
    /// Messages are sealed with AES-128-GCM
    pub encryption: bool,
    /// Compressed bodies are accepted and outgoing bodies are deflated
    pub compression: bool,
    /// Receive timeout for partially received sessions (`None` waits forever)
    pub rx_timeout_secs: Option<u32>,
    /// Upper bound on live sessions per transport
    pub max_sessions: usize,
}

impl SmConfig {
    pub fn rx_timeout(&self) -> Option<Duration> {
        self.rx_timeout_secs.map(|secs| Duration::from_secs(u64::from(secs)))
    }

    pub fn validate(&self) -> Result<(), SmError> {
        if self.max_sessions == 0 {
            return Err(SmError::InvalidConfig("max_sessions cannot be zero".to_string()));
        }
        Ok(())
    }
}

impl Default for SmConfig {
    fn default() -> Self {
        Self {
            device_id: [0u8; DEVICE_ID_LENGTH],
            encryption: false,
            compression: true,
            rx_timeout_secs: Some(DEFAULT_RX_TIMEOUT_SECS),
            max_sessions: DEFAULT_MAX_SESSIONS,
        }
    }
}

/// Settings for one SM transport
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    pub kind: TransportKind,
    /// Largest datagram the link carries
    pub mtu: usize,
    pub max_segments: u8,
    /// Datagram framing ID type (low nibble of the UDP header byte)
    pub id_type: u8,
    /// Transport ID (UDP) or shared-key text (SMS) identifying this device
    pub peer_id: Vec<u8>,
}

impl TransportConfig {
    pub fn udp(mtu: usize, id_type: u8, peer_id: impl Into<Vec<u8>>) -> Self {
        Self {
            kind: TransportKind::Udp,
            mtu,
            max_segments: DEFAULT_MAX_SEGMENTS,
            id_type,
            peer_id: peer_id.into(),
        }
    }

    pub fn sms(mtu: usize, shared_key: impl Into<Vec<u8>>) -> Self {
        Self {
            kind: TransportKind::Sms,
            mtu,
            max_segments: DEFAULT_MAX_SEGMENTS,
            id_type: 0,
            peer_id: shared_key.into(),
        }
    }

    pub fn with_max_segments(mut self, max_segments: u8) -> Self {
        self.max_segments = max_segments;
        self
    }

    /// Framing for this transport. Satellite links carry UDP-style datagrams.
    pub fn framing(&self) -> Result<Framing, SmError> {
        match self.kind {
            TransportKind::Udp | TransportKind::Satellite => {
                if self.id_type > 0x0F {
                    return Err(SmError::InvalidConfig(format!(
                        "id_type {:#x} does not fit in a nibble",
                        self.id_type
                    )));
                }
                Ok(Framing::datagram(self.id_type, self.peer_id.clone()))
            }
            TransportKind::Sms => Ok(Framing::sms(self.peer_id.clone())),
            TransportKind::Edp => Err(SmError::InvalidConfig(
                "edp is not a datagram transport".to_string(),
            )),
        }
    }

    pub fn max_payload_bytes(&self) -> Result<usize, SmError> {
        Ok(self.framing()?.max_payload_bytes(self.mtu))
    }

    pub fn validate(&self) -> Result<(), SmError> {
        if self.max_segments == 0 {
            return Err(SmError::InvalidConfig("max_segments cannot be zero".to_string()));
        }
        let payload = self.max_payload_bytes()?;
        if payload == 0 {
            return Err(SmError::InvalidConfig(format!(
                "mtu {} leaves no room for payload after {} header bytes",
                self.mtu, MAX_HEADER_LEN
            )));
        }
        Ok(())
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self::udp(512, 0, Vec::new())
    }
}
