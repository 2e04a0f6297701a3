// In-memory link and recording delegate for engine tests

use super::*;
use crate::crypto::{AesGcmProvider, IvPool};
use crate::session::{ErrorCode, SessionError};
use crate::store::{BackendConfigStore, MemoryStorage};
use crate::wire::Command;
use std::sync::atomic::{AtomicUsize, Ordering};

#[derive(Default)]
pub(crate) struct QueueLink {
    inbound: Mutex<VecDeque<Vec<u8>>>,
    sent: Mutex<Vec<Vec<u8>>>,
}

impl QueueLink {
    pub fn push(&self, datagram: Vec<u8>) {
        self.inbound.lock().push_back(datagram);
    }

    pub fn take_sent(&self) -> Vec<Vec<u8>> {
        std::mem::take(&mut *self.sent.lock())
    }
}

impl NetworkLink for QueueLink {
    fn receive(&self, buf: &mut [u8]) -> NetworkStatus {
        match self.inbound.lock().pop_front() {
            Some(datagram) => {
                let len = datagram.len().min(buf.len());
                buf[..len].copy_from_slice(&datagram[..len]);
                NetworkStatus::Continue(len)
            }
            None => NetworkStatus::Busy,
        }
    }

    fn send(&self, datagram: &[u8]) -> Result<(), String> {
        self.sent.lock().push(datagram.to_vec());
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Recorded {
    pub request_id: u16,
    pub direction: Direction,
    pub command: Command,
    pub error: Option<ErrorCode>,
    pub data: Vec<u8>,
    pub last: bool,
}

pub(crate) struct RecordingDelegate {
    pub deliveries: Mutex<Vec<Recorded>>,
    pub failures: Mutex<Vec<(u16, SessionError)>>,
    pub more_data: AtomicUsize,
    pub reboots: AtomicUsize,
    pub deliver_status: Mutex<DeliveryStatus>,
    pub reboot_status: Mutex<DeliveryStatus>,
}

impl Default for RecordingDelegate {
    fn default() -> Self {
        Self {
            deliveries: Mutex::new(Vec::new()),
            failures: Mutex::new(Vec::new()),
            more_data: AtomicUsize::new(0),
            reboots: AtomicUsize::new(0),
            deliver_status: Mutex::new(DeliveryStatus::Working),
            reboot_status: Mutex::new(DeliveryStatus::Working),
        }
    }
}

impl RecordingDelegate {
    pub fn delivered(&self) -> Vec<Recorded> {
        self.deliveries.lock().clone()
    }
}

impl SmDelegate for RecordingDelegate {
    fn deliver(&self, delivery: &Delivery<'_>) -> DeliveryStatus {
        let status = *self.deliver_status.lock();
        if status == DeliveryStatus::Working {
            self.deliveries.lock().push(Recorded {
                request_id: delivery.request_id,
                direction: delivery.direction,
                command: delivery.command,
                error: delivery.error,
                data: delivery.data.to_vec(),
                last: delivery.last,
            });
        }
        status
    }

    fn more_data(&self, _transport: TransportKind) {
        self.more_data.fetch_add(1, Ordering::SeqCst);
    }

    fn reboot(&self) -> DeliveryStatus {
        self.reboots.fetch_add(1, Ordering::SeqCst);
        *self.reboot_status.lock()
    }

    fn session_failed(&self, _transport: TransportKind, request_id: u16, error: SessionError) {
        self.failures.lock().push((request_id, error));
    }
}

pub(crate) struct Harness {
    pub connector: SmConnector,
    pub ctx: TransportContext,
    pub link: Arc<QueueLink>,
    pub delegate: Arc<RecordingDelegate>,
    pub clock: Arc<ManualClock>,
}

pub(crate) const PEER_ID: [u8; 4] = [0xDE, 0xAD, 0xBE, 0xEF];
pub(crate) const DEVICE_ID: [u8; 16] = [0x11; 16];

pub(crate) fn harness(config: SmConfig, transport: TransportConfig) -> Harness {
    let store: Arc<dyn ConfigStore> = Arc::new(BackendConfigStore::new(MemoryStorage::new()));
    let delegate = Arc::new(RecordingDelegate::default());
    let clock = Arc::new(ManualClock::new());
    let link = Arc::new(QueueLink::default());

    let connector = SmConnector::new(config, Arc::new(AesGcmProvider), store, delegate.clone())
        .unwrap()
        .with_clock(clock.clone());
    let ctx = connector.open(transport, link.clone()).unwrap();

    Harness {
        connector,
        ctx,
        link,
        delegate,
        clock,
    }
}

pub(crate) fn udp_harness(encryption: bool) -> Harness {
    let config = SmConfig {
        device_id: DEVICE_ID,
        encryption,
        compression: true,
        rx_timeout_secs: Some(30),
        max_sessions: 4,
    };
    harness(config, TransportConfig::udp(64, 1, PEER_ID.to_vec()).with_max_segments(8))
}

impl Harness {
    /// Datagrams as the cloud would send them to this device.
    pub fn cloud(&self, message: &OutboundMessage<'_>) -> Vec<Vec<u8>> {
        let keyring = self.connector.keyring();
        let keyring = keyring.lock();
        let mut encoder =
            MessageEncoder::new(&self.ctx.framing, self.ctx.max_payload, self.ctx.transport.max_segments);
        if self.ctx.config.encryption {
            encoder = encoder.with_encryption(&keyring, self.ctx.transport.kind, IvPool::Server);
        }
        encoder.encode(message).unwrap()
    }

    pub fn push_all(&self, datagrams: Vec<Vec<u8>>) {
        for datagram in datagrams {
            self.link.push(datagram);
        }
    }

    /// Poll until nothing is left to do.
    pub fn run(&mut self) {
        for _ in 0..200 {
            if self.ctx.poll().unwrap() == PollStatus::Idle {
                return;
            }
        }
        panic!("engine did not go idle");
    }

    pub fn install_key(&self, key: [u8; 16]) {
        self.connector.keyring().lock().install_key(&key).unwrap();
    }
}
