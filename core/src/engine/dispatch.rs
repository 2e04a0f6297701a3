// Receive-side dispatcher: datagram -> framing -> header -> session update

use super::{NetworkStatus, PollStatus, TransportContext};
use crate::session::{Direction, ErrorCode, SegmentBuffer, Session, SessionFlags, SessionState};
use crate::wire::{parse_header, Command, PackIter, PacketHeader, SegmentShape, WireError};
use crate::{FailureKind, SmError};
use tracing::{debug, error, warn};

/// One SM message waiting to be applied
#[derive(Debug)]
pub(crate) struct Retained {
    bytes: Vec<u8>,
    /// Pack entry (no CRC in the header)
    packed: bool,
}

impl TransportContext {
    /// Parse one datagram from the link, or resume messages retained by an
    /// earlier call.
    ///
    /// Malformed and integrity failures drop the offending message and report
    /// `Working`. Resource exhaustion keeps the message for the next call and
    /// reports `Pending`. Only fatal conditions (link abort, protocol version
    /// mismatch, key persistence) are returned as errors.
    pub fn receive_next(&mut self) -> Result<PollStatus, SmError> {
        self.ensure_open()?;
        if !self.retained.is_empty() {
            return self.drain_retained();
        }

        let mut buf = vec![0u8; self.transport.mtu];
        let len = match self.link.receive(&mut buf) {
            NetworkStatus::Continue(len) => len.min(buf.len()),
            NetworkStatus::Busy => return Ok(PollStatus::Idle),
            NetworkStatus::Abort => {
                error!(transport = %self.transport.kind, "Network link aborted");
                return Err(SmError::Aborted("network link aborted".to_string()));
            }
        };
        buf.truncate(len);
        self.dispatch_datagram(&buf)
    }

    /// Process one raw datagram as if it had just been read from the link.
    pub fn dispatch_datagram(&mut self, datagram: &[u8]) -> Result<PollStatus, SmError> {
        self.ensure_open()?;
        let transport = self.transport.kind;

        let message = match self.framing.unwrap(datagram) {
            Ok(Some(message)) => message,
            Ok(None) => {
                debug!(%transport, len = datagram.len(), "Datagram not addressed to this device");
                return Ok(PollStatus::Working);
            }
            Err(e) if e.kind() == FailureKind::Fatal => {
                error!(%transport, "Aborting transport: {}", e);
                return Err(e.into());
            }
            Err(e) => {
                warn!(%transport, "Dropping datagram: {}", e);
                return Ok(PollStatus::Working);
            }
        };

        self.retained.push_back(Retained {
            bytes: message,
            packed: false,
        });
        self.drain_retained()
    }

    fn drain_retained(&mut self) -> Result<PollStatus, SmError> {
        let transport = self.transport.kind;
        while let Some(entry) = self.retained.pop_front() {
            let Err(e) = self.accept(&entry.bytes, entry.packed) else {
                continue;
            };
            match e.kind() {
                FailureKind::Malformed | FailureKind::Integrity => {
                    warn!(%transport, packed = entry.packed, "Dropping message: {}", e);
                }
                FailureKind::Resource => {
                    debug!(%transport, retained = self.retained.len() + 1, "Retaining message: {}", e);
                    self.retained.push_front(entry);
                    return Ok(PollStatus::Pending);
                }
                FailureKind::Fatal => {
                    error!(%transport, "Aborting transport: {}", e);
                    self.retained.clear();
                    return Err(e);
                }
            }
        }
        Ok(PollStatus::Working)
    }

    /// Apply one SM message: a pack is split into its entries, anything else
    /// updates its session.
    fn accept(&mut self, message: &[u8], packed: bool) -> Result<(), SmError> {
        let (header, header_len) = parse_header(message, packed)?;
        header.check_policy(
            self.config.compression,
            self.config.encryption,
            self.transport.max_segments,
        )?;
        let payload = &message[header_len..];

        if header.is_request() && header.command() == Some(Command::Pack) {
            return self.unpack(payload);
        }
        self.update_session(&header, payload)
    }

    fn unpack(&mut self, body: &[u8]) -> Result<(), SmError> {
        let transport = self.transport.kind;
        let entries = PackIter::new(body)?;
        if entries.more_data() {
            debug!(%transport, "Peer has more data queued");
            self.delegate.more_data(transport);
        }

        // Entries go to the front, in order, ahead of anything still retained
        let mut unpacked = Vec::new();
        for entry in entries {
            match entry {
                Ok(bytes) => unpacked.push(Retained {
                    bytes: bytes.to_vec(),
                    packed: true,
                }),
                Err(e) => {
                    warn!(%transport, "Truncated pack: {}", e);
                    break;
                }
            }
        }
        debug!(%transport, entries = unpacked.len(), "Unpacked datagram");
        for entry in unpacked.into_iter().rev() {
            self.retained.push_front(entry);
        }
        Ok(())
    }

    fn update_session(&mut self, header: &PacketHeader, payload: &[u8]) -> Result<(), SmError> {
        let direction = if header.is_request() {
            Direction::CloudOriginated
        } else {
            Direction::ClientOriginated
        };
        let key = (header.request_id, direction);

        // The error code leads segment 0 of an error response
        let (peer_error, payload) = if header.is_error() {
            let code = payload.get(..2).ok_or(WireError::BufferTooShort {
                need: 2,
                got: payload.len(),
            })?;
            (
                Some(ErrorCode::from_u16(u16::from_be_bytes([code[0], code[1]]))),
                &payload[2..],
            )
        } else {
            (None, payload)
        };

        if !self.sessions.contains(&key) {
            let segments = if header.is_multipart() {
                SegmentBuffer::new(self.transport.max_segments, self.max_payload)
            } else {
                SegmentBuffer::single()
            };
            let session = Session::new(
                header.request_id,
                direction,
                segments,
                self.clock.now(),
                self.config.rx_timeout(),
            );
            self.sessions.insert(session)?;
        }
        let session = self
            .sessions
            .get_mut(&key)
            .ok_or(SmError::UnknownSession(header.request_id))?;

        if session.state != SessionState::ReceiveData {
            debug!(
                request_id = header.request_id,
                state = %session.state,
                "Ignoring segment for a session past receive_data"
            );
            return Ok(());
        }

        if let Some(cmd_status) = header.cmd_status() {
            session.info = header.info;
            session.cmd_status = cmd_status;
            session.command = header.command().unwrap_or(Command::OpaqueResponse);
            if header.is_compressed() {
                session.flags.set(SessionFlags::COMPRESSED);
            }
            if header.is_encrypted() {
                session.flags.set(SessionFlags::ENCRYPTED);
            }
            if header.has_new_key() {
                session.flags.set(SessionFlags::NEW_KEY);
            }
            if header.response_needed() {
                session.flags.set(SessionFlags::RESPONSE_NEEDED);
            }
            if header.is_request() && session.command == Command::Reboot {
                session.flags.set(SessionFlags::REBOOT);
            }
            if let Some(code) = peer_error {
                session.flags.set(SessionFlags::ERROR);
                session.peer_error = Some(code);
            }
        }

        match header.shape {
            SegmentShape::Single { .. } => {
                if session.segments.received() > 0 {
                    return Err(WireError::InvalidSegment { number: 0, count: 1 }.into());
                }
                // Sessions we registered for a response do not know the shape yet
                if session.segments.count() != Some(1) {
                    session.segments = SegmentBuffer::single();
                }
                session.segments.insert(0, payload)?;
            }
            SegmentShape::First { count, .. } => {
                session.flags.set(SessionFlags::MULTIPART);
                session.segments.set_count(count);
                session.segments.insert(0, payload)?;
            }
            SegmentShape::Continuation { number } => {
                session.flags.set(SessionFlags::MULTIPART);
                session.segments.insert(number, payload)?;
            }
        }

        if session.segments.is_complete() {
            session.assembled = true;
            session.state = if self.config.encryption {
                SessionState::Decrypt
            } else if session.flags.contains(SessionFlags::COMPRESSED) {
                SessionState::Decompress
            } else {
                SessionState::ProcessPayload
            };
            debug!(
                request_id = session.request_id,
                direction = ?session.direction,
                bytes = session.segments.total_len(),
                next = %session.state,
                "Message reassembled"
            );
        }
        Ok(())
    }
}
