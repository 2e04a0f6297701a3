//! Collaborators the engine calls out to: the network link and the
//! application delegate.

use crate::session::{Direction, ErrorCode, SessionError};
use crate::wire::{Command, TransportKind};

/// Result of a non-blocking network read
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkStatus {
    /// `n` bytes were written into the buffer
    Continue(usize),
    /// Nothing to read right now
    Busy,
    /// The link is gone
    Abort,
}

/// Raw datagram link for one transport
pub trait NetworkLink: Send + Sync {
    /// Pull at most `buf.len()` bytes of the next datagram. Never blocks.
    fn receive(&self, buf: &mut [u8]) -> NetworkStatus;
    /// Send one framed datagram.
    fn send(&self, datagram: &[u8]) -> Result<(), String>;
}

/// What the delegate did with a delivery
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryStatus {
    /// Accepted; the session moves on
    Working,
    /// Not now; the same delivery is offered again on a later step
    Pending,
    /// Rejected; the session fails with `Cancelled`
    Abort,
}

/// A reconstructed message (or one decompressed chunk of it)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Delivery<'a> {
    pub transport: TransportKind,
    pub request_id: u16,
    pub direction: Direction,
    pub command: Command,
    pub response_needed: bool,
    /// Set when the peer answered with an error response
    pub error: Option<ErrorCode>,
    pub data: &'a [u8],
    /// No more chunks follow for this message
    pub last: bool,
}

/// Application callbacks
pub trait SmDelegate: Send + Sync {
    /// A message (or chunk) is ready
    fn deliver(&self, delivery: &Delivery<'_>) -> DeliveryStatus;
    /// The peer flagged that more data is queued for us
    fn more_data(&self, transport: TransportKind);
    /// A reboot request completed; reboot now or answer `Pending`
    fn reboot(&self) -> DeliveryStatus;
    /// A request we sent ended without a usable response
    fn session_failed(&self, transport: TransportKind, request_id: u16, error: SessionError);
}
