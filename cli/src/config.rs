// Configuration management for the cloudlink CLI
//
// Cross-platform config stored in:
// - macOS: ~/Library/Application Support/cloudlink/config.json
// - Linux: ~/.config/cloudlink/config.json
// - Windows: %APPDATA%\cloudlink\config.json

use anyhow::{Context, Result};
use cloudlink_core::{SmConfig, TransportConfig, TransportKind};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// 16-byte device ID, hex encoded
    pub device_id: String,

    /// Encrypt every SM message (requires a key set by the cloud)
    pub encryption: bool,

    /// Accept and produce compressed bodies
    pub compression: bool,

    /// Receive timeout in seconds, 0 for none
    pub rx_timeout_secs: u32,

    /// Upper bound on concurrent sessions
    pub max_sessions: usize,

    /// Storage path for keys and replay state
    pub storage_path: Option<String>,

    /// Transport settings
    pub transport: TransportSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportSettings {
    /// `udp`, `satellite` or `sms`
    pub kind: TransportKind,

    pub mtu: usize,

    pub max_segments: u8,

    /// UDP ID type (low nibble of the transport header)
    pub id_type: u8,

    /// UDP peer ID as hex, or the SMS shared key as plain text
    pub peer_id: String,

    /// Local socket address
    pub bind_addr: String,

    /// Cloud (or SMS gateway) address
    pub remote_addr: String,
}

impl Default for Config {
    fn default() -> Self {
        let defaults = SmConfig::default();
        Self {
            device_id: hex::encode(rand::random::<[u8; 16]>()),
            encryption: defaults.encryption,
            compression: defaults.compression,
            rx_timeout_secs: defaults.rx_timeout_secs.unwrap_or(0),
            max_sessions: defaults.max_sessions,
            storage_path: None,
            transport: TransportSettings::default(),
        }
    }
}

impl Default for TransportSettings {
    fn default() -> Self {
        let defaults = TransportConfig::default();
        Self {
            kind: defaults.kind,
            mtu: defaults.mtu,
            max_segments: defaults.max_segments,
            id_type: defaults.id_type,
            peer_id: String::new(),
            bind_addr: "0.0.0.0:0".to_string(),
            remote_addr: "127.0.0.1:9090".to_string(),
        }
    }
}

impl Config {
    /// Get the config directory path (cross-platform)
    pub fn config_dir() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .context("Failed to determine config directory")?
            .join("cloudlink");

        std::fs::create_dir_all(&config_dir).context("Failed to create config directory")?;

        Ok(config_dir)
    }

    /// Get the data directory path (cross-platform)
    pub fn data_dir() -> Result<PathBuf> {
        let data_dir = dirs::data_local_dir()
            .context("Failed to determine data directory")?
            .join("cloudlink");

        std::fs::create_dir_all(&data_dir).context("Failed to create data directory")?;

        Ok(data_dir)
    }

    pub fn config_file() -> Result<PathBuf> {
        Ok(Self::config_dir()?.join("config.json"))
    }

    /// Load config from file, or create default if not exists
    pub fn load() -> Result<Self> {
        let config_file = Self::config_file()?;

        if config_file.exists() {
            let contents =
                std::fs::read_to_string(&config_file).context("Failed to read config file")?;
            let config: Config =
                serde_json::from_str(&contents).context("Failed to parse config file")?;
            Ok(config)
        } else {
            // First run also fixes the device ID
            let config = Config::default();
            config.save()?;
            Ok(config)
        }
    }

    pub fn save(&self) -> Result<()> {
        let config_file = Self::config_file()?;
        let contents = serde_json::to_string_pretty(self).context("Failed to serialize config")?;
        std::fs::write(&config_file, contents).context("Failed to write config file")?;
        Ok(())
    }

    /// Where the sled database lives
    pub fn storage_dir(&self) -> Result<PathBuf> {
        match &self.storage_path {
            Some(path) => Ok(PathBuf::from(path)),
            None => Ok(Self::data_dir()?.join("store")),
        }
    }

    /// Engine-wide settings
    pub fn sm_config(&self) -> Result<SmConfig> {
        let bytes = hex::decode(&self.device_id).context("Device ID is not valid hex")?;
        let device_id: [u8; 16] = bytes
            .as_slice()
            .try_into()
            .context("Device ID must be 16 bytes")?;

        Ok(SmConfig {
            device_id,
            encryption: self.encryption,
            compression: self.compression,
            rx_timeout_secs: (self.rx_timeout_secs > 0).then_some(self.rx_timeout_secs),
            max_sessions: self.max_sessions,
        })
    }

    /// Per-transport settings
    pub fn transport_config(&self) -> Result<TransportConfig> {
        let t = &self.transport;
        let config = match t.kind {
            TransportKind::Sms => TransportConfig::sms(t.mtu, t.peer_id.as_bytes()),
            TransportKind::Udp | TransportKind::Satellite => {
                let peer_id = hex::decode(&t.peer_id).context("Peer ID is not valid hex")?;
                TransportConfig {
                    kind: t.kind,
                    ..TransportConfig::udp(t.mtu, t.id_type, peer_id)
                }
            }
            TransportKind::Edp => anyhow::bail!("The edp transport cannot be driven from the CLI"),
        };
        Ok(config.with_max_segments(t.max_segments))
    }

    pub fn bind_addr(&self) -> Result<SocketAddr> {
        self.transport.bind_addr.parse().context("Invalid bind address")
    }

    pub fn remote_addr(&self) -> Result<SocketAddr> {
        self.transport.remote_addr.parse().context("Invalid remote address")
    }

    /// Set a config value and save
    pub fn set(&mut self, key: &str, value: &str) -> Result<()> {
        self.apply(key, value)?;
        self.save()
    }

    /// Set a config value in memory
    pub fn apply(&mut self, key: &str, value: &str) -> Result<()> {
        match key {
            "device_id" => {
                let bytes = hex::decode(value).context("Invalid hex value")?;
                if bytes.len() != 16 {
                    anyhow::bail!("Device ID must be 16 bytes, got {}", bytes.len());
                }
                self.device_id = value.to_ascii_lowercase();
            }
            "encryption" => {
                self.encryption = value.parse().context("Invalid boolean value")?;
            }
            "compression" => {
                self.compression = value.parse().context("Invalid boolean value")?;
            }
            "rx_timeout_secs" => {
                self.rx_timeout_secs = value.parse().context("Invalid number")?;
            }
            "max_sessions" => {
                self.max_sessions = value.parse().context("Invalid number")?;
            }
            "storage_path" => {
                self.storage_path = if value.is_empty() {
                    None
                } else {
                    Some(value.to_string())
                };
            }
            "transport" => {
                self.transport.kind = value.parse().map_err(anyhow::Error::msg)?;
            }
            "mtu" => {
                self.transport.mtu = value.parse().context("Invalid number")?;
            }
            "max_segments" => {
                self.transport.max_segments = value.parse().context("Invalid number")?;
            }
            "id_type" => {
                self.transport.id_type = value.parse().context("Invalid number")?;
            }
            "peer_id" => {
                self.transport.peer_id = value.to_string();
            }
            "bind_addr" => {
                value.parse::<SocketAddr>().context("Invalid socket address")?;
                self.transport.bind_addr = value.to_string();
            }
            "remote_addr" => {
                value.parse::<SocketAddr>().context("Invalid socket address")?;
                self.transport.remote_addr = value.to_string();
            }
            _ => anyhow::bail!("Unknown config key: {}", key),
        }
        Ok(())
    }

    pub fn get(&self, key: &str) -> Option<String> {
        match key {
            "device_id" => Some(self.device_id.clone()),
            "encryption" => Some(self.encryption.to_string()),
            "compression" => Some(self.compression.to_string()),
            "rx_timeout_secs" => Some(self.rx_timeout_secs.to_string()),
            "max_sessions" => Some(self.max_sessions.to_string()),
            "storage_path" => self.storage_path.clone(),
            "transport" => Some(self.transport.kind.to_string()),
            "mtu" => Some(self.transport.mtu.to_string()),
            "max_segments" => Some(self.transport.max_segments.to_string()),
            "id_type" => Some(self.transport.id_type.to_string()),
            "peer_id" => Some(self.transport.peer_id.clone()),
            "bind_addr" => Some(self.transport.bind_addr.clone()),
            "remote_addr" => Some(self.transport.remote_addr.clone()),
            _ => None,
        }
    }

    pub fn list(&self) -> Vec<(String, String)> {
        vec![
            ("device_id".to_string(), self.device_id.clone()),
            ("encryption".to_string(), self.encryption.to_string()),
            ("compression".to_string(), self.compression.to_string()),
            (
                "rx_timeout_secs".to_string(),
                match self.rx_timeout_secs {
                    0 => "(none)".to_string(),
                    secs => format!("{}s", secs),
                },
            ),
            ("max_sessions".to_string(), self.max_sessions.to_string()),
            (
                "storage_path".to_string(),
                self.storage_path.clone().unwrap_or_else(|| "(auto)".to_string()),
            ),
            ("transport".to_string(), self.transport.kind.to_string()),
            ("mtu".to_string(), self.transport.mtu.to_string()),
            ("max_segments".to_string(), self.transport.max_segments.to_string()),
            ("id_type".to_string(), self.transport.id_type.to_string()),
            ("peer_id".to_string(), self.transport.peer_id.clone()),
            ("bind_addr".to_string(), self.transport.bind_addr.clone()),
            ("remote_addr".to_string(), self.transport.remote_addr.clone()),
        ]
    }
}
