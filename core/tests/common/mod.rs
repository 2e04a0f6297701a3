// Shared fixtures for the integration tests: an in-memory datagram link, a
// delegate that records every callback, and a cloud-side encoder.
#![allow(dead_code)]

use cloudlink_core::crypto::IvPool;
use cloudlink_core::session::{Direction, ErrorCode, SessionError};
use cloudlink_core::wire::{Command, TransportKind};
use cloudlink_core::{
    AesGcmProvider, BackendConfigStore, ConfigStore, Delivery, DeliveryStatus, ManualClock,
    MemoryStorage, MessageEncoder, NetworkLink, NetworkStatus, OutboundMessage, PollStatus,
    SmConfig, SmConnector, SmDelegate, TransportConfig, TransportContext,
};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

pub const DEVICE_ID: [u8; 16] = *b"device-0000-0001";
pub const UDP_PEER_ID: [u8; 6] = [0x02, 0x00, 0x5E, 0x10, 0x20, 0x30];

#[derive(Default)]
pub struct QueueLink {
    inbound: Mutex<VecDeque<Vec<u8>>>,
    sent: Mutex<Vec<Vec<u8>>>,
}

impl QueueLink {
    pub fn push(&self, datagram: Vec<u8>) {
        self.inbound.lock().unwrap().push_back(datagram);
    }

    pub fn take_sent(&self) -> Vec<Vec<u8>> {
        std::mem::take(&mut *self.sent.lock().unwrap())
    }
}

impl NetworkLink for QueueLink {
    fn receive(&self, buf: &mut [u8]) -> NetworkStatus {
        match self.inbound.lock().unwrap().pop_front() {
            Some(datagram) => {
                let len = datagram.len().min(buf.len());
                buf[..len].copy_from_slice(&datagram[..len]);
                NetworkStatus::Continue(len)
            }
            None => NetworkStatus::Busy,
        }
    }

    fn send(&self, datagram: &[u8]) -> Result<(), String> {
        self.sent.lock().unwrap().push(datagram.to_vec());
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Received {
    pub transport: TransportKind,
    pub request_id: u16,
    pub direction: Direction,
    pub command: Command,
    pub error: Option<ErrorCode>,
    pub data: Vec<u8>,
    pub last: bool,
}

#[derive(Default)]
pub struct Recorder {
    pub received: Mutex<Vec<Received>>,
    pub failures: Mutex<Vec<(u16, SessionError)>>,
    pub more_data: Mutex<usize>,
}

impl Recorder {
    pub fn received(&self) -> Vec<Received> {
        self.received.lock().unwrap().clone()
    }

    /// Concatenated bytes of every delivery for one request
    pub fn body(&self, request_id: u16) -> Vec<u8> {
        self.received()
            .into_iter()
            .filter(|r| r.request_id == request_id)
            .flat_map(|r| r.data)
            .collect()
    }
}

impl SmDelegate for Recorder {
    fn deliver(&self, delivery: &Delivery<'_>) -> DeliveryStatus {
        self.received.lock().unwrap().push(Received {
            transport: delivery.transport,
            request_id: delivery.request_id,
            direction: delivery.direction,
            command: delivery.command,
            error: delivery.error,
            data: delivery.data.to_vec(),
            last: delivery.last,
        });
        DeliveryStatus::Working
    }

    fn more_data(&self, _transport: TransportKind) {
        *self.more_data.lock().unwrap() += 1;
    }

    fn reboot(&self) -> DeliveryStatus {
        DeliveryStatus::Working
    }

    fn session_failed(&self, _transport: TransportKind, request_id: u16, error: SessionError) {
        self.failures.lock().unwrap().push((request_id, error));
    }
}

/// One device transport wired to in-memory collaborators
pub struct Device {
    pub connector: SmConnector,
    pub transport: TransportConfig,
    pub ctx: TransportContext,
    pub link: Arc<QueueLink>,
    pub recorder: Arc<Recorder>,
    pub clock: Arc<ManualClock>,
}

pub fn memory_store() -> Arc<dyn ConfigStore> {
    Arc::new(BackendConfigStore::new(MemoryStorage::new()))
}

pub fn sm_config(encryption: bool) -> SmConfig {
    SmConfig {
        device_id: DEVICE_ID,
        encryption,
        compression: true,
        rx_timeout_secs: Some(20),
        max_sessions: 8,
    }
}

pub fn udp_transport() -> TransportConfig {
    TransportConfig::udp(96, 0x03, UDP_PEER_ID.to_vec())
}

pub fn device(config: SmConfig, transport: TransportConfig, store: Arc<dyn ConfigStore>) -> Device {
    let recorder = Arc::new(Recorder::default());
    let clock = Arc::new(ManualClock::new());
    let link = Arc::new(QueueLink::default());
    let connector = SmConnector::new(config, Arc::new(AesGcmProvider), store, recorder.clone())
        .unwrap()
        .with_clock(clock.clone());
    let ctx = connector.open(transport.clone(), link.clone()).unwrap();
    Device {
        connector,
        transport,
        ctx,
        link,
        recorder,
        clock,
    }
}

impl Device {
    /// Encode `message` the way the cloud would address it to this device.
    pub fn from_cloud(&self, message: &OutboundMessage<'_>) -> Vec<Vec<u8>> {
        let framing = self.transport.framing().unwrap();
        let keyring = self.connector.keyring();
        let keyring = keyring.lock();
        let mut encoder = MessageEncoder::new(
            &framing,
            self.ctx.max_payload_bytes(),
            self.transport.max_segments,
        );
        if self.connector.config().encryption {
            encoder = encoder.with_encryption(&keyring, self.transport.kind, IvPool::Server);
        }
        encoder.encode(message).unwrap()
    }

    pub fn push_all(&self, datagrams: Vec<Vec<u8>>) {
        for datagram in datagrams {
            self.link.push(datagram);
        }
    }

    /// Poll until the engine reports nothing left to do.
    pub fn run(&mut self) {
        for _ in 0..500 {
            if self.ctx.poll().unwrap() == PollStatus::Idle {
                return;
            }
        }
        panic!("engine never went idle");
    }
}
