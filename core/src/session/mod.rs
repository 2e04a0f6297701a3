//! Session layer: one in-flight SM message per `(request_id, direction)`.
//!
//! - `reassembly`: per-segment storage until the segment count is satisfied
//! - `inflate`: streaming decompression of the assembled body
//! - `table`: owned collection of live sessions
//! - `request_id`: allocation of locally-originated request IDs

pub mod inflate;
pub mod reassembly;
pub mod request_id;
pub mod table;

pub use inflate::Inflater;
pub use reassembly::SegmentBuffer;
pub use request_id::RequestIdCounter;
pub use table::{SessionKey, SessionTable};

use crate::wire::Command;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use web_time::Instant;

/// Who started the exchange
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Direction {
    /// Device sent the request; the session collects the cloud's response
    ClientOriginated,
    /// Cloud sent the request
    CloudOriginated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SessionState {
    ReceiveData,
    Decrypt,
    Decompress,
    ProcessPayload,
    Complete,
    Error,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::ReceiveData => "receive_data",
            SessionState::Decrypt => "decrypt",
            SessionState::Decompress => "decompress",
            SessionState::ProcessPayload => "process_payload",
            SessionState::Complete => "complete",
            SessionState::Error => "error",
        };
        f.write_str(name)
    }
}

/// Error code carried in the first two payload bytes of an error response
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    InRequest,
    Unavailable,
    Unknown(u16),
}

impl ErrorCode {
    pub fn from_u16(value: u16) -> Self {
        match value {
            1 => ErrorCode::InRequest,
            2 => ErrorCode::Unavailable,
            other => ErrorCode::Unknown(other),
        }
    }

    pub fn as_u16(&self) -> u16 {
        match self {
            ErrorCode::InRequest => 1,
            ErrorCode::Unavailable => 2,
            ErrorCode::Unknown(code) => *code,
        }
    }
}

/// Why a session ended in `error`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionError {
    Timeout,
    Cancelled,
    /// Decompression failed or the body was unusable
    BadPayload,
    /// The response could not be sent
    SendFailed,
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            SessionError::Timeout => "timeout",
            SessionError::Cancelled => "cancelled",
            SessionError::BadPayload => "bad payload",
            SessionError::SendFailed => "send failed",
        };
        f.write_str(text)
    }
}

/// Session flag bitset
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionFlags(u8);

impl SessionFlags {
    pub const MULTIPART: u8 = 0x01;
    pub const COMPRESSED: u8 = 0x02;
    pub const ENCRYPTED: u8 = 0x04;
    pub const NEW_KEY: u8 = 0x08;
    pub const ERROR: u8 = 0x10;
    pub const RESPONSE_NEEDED: u8 = 0x20;
    pub const LAST_DATA: u8 = 0x40;
    pub const REBOOT: u8 = 0x80;

    pub fn contains(&self, flag: u8) -> bool {
        self.0 & flag == flag
    }

    pub fn set(&mut self, flag: u8) {
        self.0 |= flag;
    }

    pub fn bits(&self) -> u8 {
        self.0
    }
}

/// One in-flight message
#[derive(Debug)]
pub struct Session {
    pub request_id: u16,
    pub direction: Direction,
    /// Info and cmd_status bytes of segment 0 (the AEAD binds them)
    pub info: u8,
    pub cmd_status: u8,
    pub command: Command,
    pub flags: SessionFlags,
    pub state: SessionState,
    pub segments: SegmentBuffer,
    /// Message body once reassembled (and decrypted)
    pub body: Option<Vec<u8>>,
    /// Present only while `state == Decompress`
    pub inflater: Option<Inflater>,
    /// Decompressed chunk the delegate has not yet accepted
    pub pending_chunk: Option<(Vec<u8>, bool)>,
    pub start_time: Instant,
    /// `None` waits forever
    pub timeout: Option<Duration>,
    pub error: Option<SessionError>,
    /// Error code from a peer error response
    pub peer_error: Option<ErrorCode>,
    /// Every segment arrived and the session left `receive_data`
    pub assembled: bool,
}

impl Session {
    pub fn new(
        request_id: u16,
        direction: Direction,
        segments: SegmentBuffer,
        start_time: Instant,
        timeout: Option<Duration>,
    ) -> Self {
        Self {
            request_id,
            direction,
            info: 0,
            cmd_status: 0,
            command: Command::OpaqueResponse,
            flags: SessionFlags::default(),
            state: SessionState::ReceiveData,
            segments,
            body: None,
            inflater: None,
            pending_chunk: None,
            start_time,
            timeout,
            error: None,
            peer_error: None,
            assembled: false,
        }
    }

    pub fn key(&self) -> SessionKey {
        (self.request_id, self.direction)
    }

    /// True once `now` is strictly past `start_time + timeout`
    pub fn is_expired(&self, now: Instant) -> bool {
        match self.timeout {
            Some(timeout) => now.saturating_duration_since(self.start_time) > timeout,
            None => false,
        }
    }

    /// Force the session to `error`, dropping any decompression state.
    pub fn fail(&mut self, error: SessionError) {
        self.state = SessionState::Error;
        self.error = Some(error);
        self.inflater = None;
        self.pending_chunk = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session(timeout: Option<Duration>, start: Instant) -> Session {
        Session::new(1, Direction::CloudOriginated, SegmentBuffer::new(1, 64), start, timeout)
    }

    #[test]
    fn test_error_codes() {
        assert_eq!(ErrorCode::from_u16(1), ErrorCode::InRequest);
        assert_eq!(ErrorCode::from_u16(2), ErrorCode::Unavailable);
        assert_eq!(ErrorCode::from_u16(9), ErrorCode::Unknown(9));
        assert_eq!(ErrorCode::Unavailable.as_u16(), 2);
    }

    #[test]
    fn test_flags() {
        let mut flags = SessionFlags::default();
        assert!(!flags.contains(SessionFlags::COMPRESSED));
        flags.set(SessionFlags::COMPRESSED);
        flags.set(SessionFlags::REBOOT);
        assert!(flags.contains(SessionFlags::COMPRESSED));
        assert!(flags.contains(SessionFlags::REBOOT));
        assert!(!flags.contains(SessionFlags::ERROR));
        assert_eq!(flags.bits(), 0x82);
    }

    #[test]
    fn test_expiry_is_strict() {
        let start = Instant::now();
        let s = session(Some(Duration::from_secs(10)), start);
        assert!(!s.is_expired(start + Duration::from_secs(10)));
        assert!(s.is_expired(start + Duration::from_secs(11)));
    }

    #[test]
    fn test_infinite_timeout_never_expires() {
        let start = Instant::now();
        let s = session(None, start);
        assert!(!s.is_expired(start + Duration::from_secs(365 * 24 * 3600)));
    }

    #[test]
    fn test_fail_drops_inflater() {
        let mut s = session(None, Instant::now());
        s.inflater = Some(Inflater::new(vec![vec![0x03, 0x00]], 16));
        s.fail(SessionError::Cancelled);
        assert_eq!(s.state, SessionState::Error);
        assert_eq!(s.error, Some(SessionError::Cancelled));
        assert!(s.inflater.is_none());
    }
}
