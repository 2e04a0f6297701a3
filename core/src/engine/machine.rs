// Per-session state machine
//
//   receive_data -> decrypt -> decompress -> process_payload -> complete
//        \______________\___________\______________\_____________-> error
//
// `step` advances exactly one session by one state per call, round-robin
// across the session table.

use super::{Delivery, DeliveryStatus, PollStatus, TransportContext};
use crate::crypto::{IvPool, KEY_LENGTH};
use crate::session::{
    Direction, ErrorCode, Inflater, Session, SessionError, SessionFlags, SessionKey, SessionState,
};
use crate::wire::TransportKind;
use crate::SmError;
use tracing::{debug, error, info, warn};
use zeroize::Zeroize;

fn delivery<'a>(transport: TransportKind, session: &Session, data: &'a [u8], last: bool) -> Delivery<'a> {
    Delivery {
        transport,
        request_id: session.request_id,
        direction: session.direction,
        command: session.command,
        response_needed: session.flags.contains(SessionFlags::RESPONSE_NEEDED),
        error: session.peer_error,
        data,
        last,
    }
}

impl TransportContext {
    /// Advance the next session (round-robin) by one state.
    pub fn step(&mut self) -> Result<PollStatus, SmError> {
        self.ensure_open()?;
        let Some(key) = self.sessions.next_key() else {
            return Ok(PollStatus::Idle);
        };
        self.step_session(key)
    }

    fn step_session(&mut self, key: SessionKey) -> Result<PollStatus, SmError> {
        let Some(state) = self.sessions.get(&key).map(|s| s.state) else {
            return Ok(PollStatus::Idle);
        };
        match state {
            SessionState::ReceiveData => self.check_timeout(key),
            SessionState::Decrypt => self.decrypt(key),
            SessionState::Decompress => self.decompress(key),
            SessionState::ProcessPayload => self.process_payload(key),
            SessionState::Complete => self.complete(key),
            SessionState::Error => self.handle_error(key),
        }
    }

    fn check_timeout(&mut self, key: SessionKey) -> Result<PollStatus, SmError> {
        let now = self.clock.now();
        let Some(session) = self.sessions.get_mut(&key) else {
            return Ok(PollStatus::Idle);
        };
        if !session.is_expired(now) {
            return Ok(PollStatus::Idle);
        }
        info!(
            transport = %self.transport.kind,
            request_id = session.request_id,
            direction = ?session.direction,
            received = session.segments.received(),
            "Session timed out"
        );
        session.fail(SessionError::Timeout);
        self.handle_error(key)
    }

    fn decrypt(&mut self, key: SessionKey) -> Result<PollStatus, SmError> {
        let transport = self.transport.kind;
        let Some(session) = self.sessions.get_mut(&key) else {
            return Ok(PollStatus::Idle);
        };
        let sealed = session.segments.assemble();
        let result = self.keyring.lock().decrypt(
            transport,
            session.request_id,
            session.info,
            session.cmd_status,
            IvPool::Server,
            &sealed,
        );

        let mut plaintext = match result {
            Ok(plaintext) => plaintext,
            Err(e) => {
                // Undecryptable messages vanish without an error response
                warn!(%transport, request_id = session.request_id, "Discarding session: {}", e);
                self.sessions.remove(&key);
                return Ok(PollStatus::Working);
            }
        };

        if session.flags.contains(SessionFlags::NEW_KEY) {
            if plaintext.len() < KEY_LENGTH {
                warn!(%transport, request_id = session.request_id, len = plaintext.len(), "New-key message too short");
                session.fail(SessionError::BadPayload);
                return Ok(PollStatus::Working);
            }
            let rest = plaintext.split_off(KEY_LENGTH);
            let installed = self.keyring.lock().install_key(&plaintext);
            plaintext.zeroize();
            if let Err(e) = installed {
                if e.is_fatal() {
                    error!(%transport, "Key rotation failed: {}", e);
                    return Err(e);
                }
                warn!(%transport, request_id = session.request_id, "Rejected new key: {}", e);
                session.fail(SessionError::BadPayload);
                return Ok(PollStatus::Working);
            }
            plaintext = rest;
        }

        session.segments.take_segments();
        session.body = Some(plaintext);
        session.state = if session.flags.contains(SessionFlags::COMPRESSED) {
            SessionState::Decompress
        } else {
            SessionState::ProcessPayload
        };
        debug!(%transport, request_id = session.request_id, next = %session.state, "Message decrypted");
        Ok(PollStatus::Working)
    }

    fn decompress(&mut self, key: SessionKey) -> Result<PollStatus, SmError> {
        let transport = self.transport.kind;
        let chunk_size = self.max_payload;
        let Some(session) = self.sessions.get_mut(&key) else {
            return Ok(PollStatus::Idle);
        };

        if session.inflater.is_none() && session.pending_chunk.is_none() {
            let inputs = match session.body.take() {
                Some(body) => vec![body],
                None => session.segments.take_segments(),
            };
            session.inflater = Some(Inflater::new(inputs, chunk_size));
        }

        if session.pending_chunk.is_none() {
            let next = match session.inflater.as_mut() {
                Some(inflater) => inflater.next_chunk(),
                None => Err("inflater missing".to_string()),
            };
            match next {
                Ok(chunk) => session.pending_chunk = Some(chunk),
                Err(e) => {
                    warn!(%transport, request_id = session.request_id, "{}", SmError::Decompression(e));
                    session.fail(SessionError::BadPayload);
                    return Ok(PollStatus::Working);
                }
            }
        }

        let Some((data, last)) = session.pending_chunk.as_ref() else {
            return Ok(PollStatus::Idle);
        };
        let last = *last;
        let status = self.delegate.deliver(&delivery(transport, session, data, last));

        match status {
            DeliveryStatus::Working => {
                session.pending_chunk = None;
                if last {
                    session.inflater = None;
                    session.flags.set(SessionFlags::LAST_DATA);
                    session.state = SessionState::Complete;
                }
                Ok(PollStatus::Working)
            }
            DeliveryStatus::Pending => Ok(PollStatus::Pending),
            DeliveryStatus::Abort => {
                session.fail(SessionError::Cancelled);
                Ok(PollStatus::Working)
            }
        }
    }

    fn process_payload(&mut self, key: SessionKey) -> Result<PollStatus, SmError> {
        let transport = self.transport.kind;
        let Some(session) = self.sessions.get_mut(&key) else {
            return Ok(PollStatus::Idle);
        };
        if session.body.is_none() {
            session.body = Some(session.segments.take_segments().concat());
        }

        let data = session.body.as_deref().unwrap_or_default();
        let status = self.delegate.deliver(&delivery(transport, session, data, true));

        match status {
            DeliveryStatus::Working => {
                debug!(%transport, request_id = session.request_id, "Payload delivered");
                session.body = None;
                session.flags.set(SessionFlags::LAST_DATA);
                session.state = SessionState::Complete;
                Ok(PollStatus::Working)
            }
            DeliveryStatus::Pending => Ok(PollStatus::Pending),
            DeliveryStatus::Abort => {
                session.fail(SessionError::Cancelled);
                Ok(PollStatus::Working)
            }
        }
    }

    fn complete(&mut self, key: SessionKey) -> Result<PollStatus, SmError> {
        let reboot = self
            .sessions
            .get(&key)
            .map(|s| s.flags.contains(SessionFlags::REBOOT))
            .unwrap_or(false);

        if reboot {
            match self.delegate.reboot() {
                DeliveryStatus::Pending => return Ok(PollStatus::Pending),
                DeliveryStatus::Working => info!(transport = %self.transport.kind, "Reboot processed"),
                DeliveryStatus::Abort => warn!(transport = %self.transport.kind, "Reboot refused"),
            }
        }

        if let Some(session) = self.sessions.remove(&key) {
            debug!(
                transport = %self.transport.kind,
                request_id = session.request_id,
                direction = ?session.direction,
                "Session complete"
            );
        }
        Ok(PollStatus::Working)
    }

    /// Report a failed session and delete it.
    pub(crate) fn handle_error(&mut self, key: SessionKey) -> Result<PollStatus, SmError> {
        let transport = self.transport.kind;
        let Some(session) = self.sessions.remove(&key) else {
            return Ok(PollStatus::Idle);
        };
        let error = session.error.unwrap_or(SessionError::Cancelled);
        info!(
            %transport,
            request_id = session.request_id,
            direction = ?session.direction,
            %error,
            "Session failed"
        );

        match session.direction {
            Direction::CloudOriginated => {
                if session.assembled && session.flags.contains(SessionFlags::RESPONSE_NEEDED) {
                    if let Err(e) =
                        self.send_response(session.request_id, &[], Some(ErrorCode::Unavailable))
                    {
                        if e.is_fatal() {
                            return Err(e);
                        }
                        warn!(%transport, request_id = session.request_id, "Unable to send error response: {}", e);
                    }
                }
            }
            Direction::ClientOriginated => {
                self.delegate.session_failed(transport, session.request_id, error);
            }
        }
        Ok(PollStatus::Working)
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::udp_harness;
    use super::super::{OutboundMessage, RequestOptions};
    use super::*;
    use crate::wire::{parse_header, Command, Framing};
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    const KEY_A: [u8; 16] = [0xA1; 16];
    const KEY_B: [u8; 16] = [0xB2; 16];
    const KEY_C: [u8; 16] = [0xC3; 16];

    #[test]
    fn test_partial_session_times_out() {
        let mut h = udp_harness(false);
        let payload = vec![1u8; 80];
        let segments = h.cloud(&OutboundMessage::request(6, Command::Data, &payload).with_response_needed(true));
        h.link.push(segments[0].clone());
        h.run();
        assert_eq!(h.ctx.session_count(), 1);

        h.clock.advance(Duration::from_secs(30));
        h.run();
        assert_eq!(h.ctx.session_count(), 1);

        h.clock.advance(Duration::from_secs(1));
        h.ctx.poll().unwrap();
        assert_eq!(h.ctx.session_count(), 0);
        // Partial cloud requests are dropped without an error response
        assert!(h.link.take_sent().is_empty());
        assert!(h.delegate.delivered().is_empty());
    }

    #[test]
    fn test_infinite_timeout_never_expires() {
        let mut h = udp_harness(false);
        h.ctx.config.rx_timeout_secs = None;
        let segments = h.cloud(&OutboundMessage::request(6, Command::Data, &[2u8; 80]));
        h.link.push(segments[0].clone());
        h.run();

        h.clock.advance(Duration::from_secs(10 * 365 * 24 * 3600));
        h.run();
        assert_eq!(
            h.ctx.session_state(6, Direction::CloudOriginated),
            Some(SessionState::ReceiveData)
        );
    }

    #[test]
    fn test_request_timeout_notifies_delegate() {
        let mut h = udp_harness(false);
        let options = RequestOptions {
            timeout: Some(Duration::from_secs(5)),
            ..Default::default()
        };
        let id = h.ctx.send_request(Command::Ping, b"", options).unwrap();
        h.clock.advance(Duration::from_secs(6));
        h.run();

        assert_eq!(*h.delegate.failures.lock(), vec![(id, SessionError::Timeout)]);
        assert_eq!(h.ctx.session_count(), 0);
    }

    #[test]
    fn test_pending_delivery_is_retried() {
        let mut h = udp_harness(false);
        *h.delegate.deliver_status.lock() = DeliveryStatus::Pending;
        h.push_all(h.cloud(&OutboundMessage::request(8, Command::Data, b"later")));

        h.ctx.receive_next().unwrap();
        assert_eq!(h.ctx.step().unwrap(), PollStatus::Pending);
        assert_eq!(h.ctx.step().unwrap(), PollStatus::Pending);
        assert_eq!(
            h.ctx.session_state(8, Direction::CloudOriginated),
            Some(SessionState::ProcessPayload)
        );

        *h.delegate.deliver_status.lock() = DeliveryStatus::Working;
        h.run();
        assert_eq!(h.delegate.delivered()[0].data, b"later");
        assert_eq!(h.ctx.session_count(), 0);
    }

    #[test]
    fn test_aborted_delivery_sends_error_response() {
        let mut h = udp_harness(false);
        *h.delegate.deliver_status.lock() = DeliveryStatus::Abort;
        h.push_all(h.cloud(&OutboundMessage::request(0x155, Command::Cli, b"cmd").with_response_needed(true)));
        h.run();

        let sent = h.link.take_sent();
        assert_eq!(sent.len(), 1);
        let message = Framing::datagram(1, super::super::testing::PEER_ID.to_vec())
            .unwrap(&sent[0])
            .unwrap()
            .unwrap();
        let (header, len) = parse_header(&message, false).unwrap();
        assert_eq!(header.request_id, 0x155);
        assert!(!header.is_request());
        assert!(header.is_error());
        assert_eq!(&message[len..], &[0x00, 0x02]);
    }

    #[test]
    fn test_reboot_runs_before_delete() {
        let mut h = udp_harness(false);
        *h.delegate.reboot_status.lock() = DeliveryStatus::Pending;
        h.push_all(h.cloud(&OutboundMessage::request(4, Command::Reboot, b"")));
        h.ctx.receive_next().unwrap();

        assert_eq!(h.ctx.step().unwrap(), PollStatus::Working);
        assert_eq!(h.ctx.step().unwrap(), PollStatus::Pending);
        assert_eq!(
            h.ctx.session_state(4, Direction::CloudOriginated),
            Some(SessionState::Complete)
        );

        *h.delegate.reboot_status.lock() = DeliveryStatus::Working;
        assert_eq!(h.ctx.step().unwrap(), PollStatus::Working);
        assert_eq!(h.ctx.session_count(), 0);
        assert_eq!(h.delegate.reboots.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_decompressed_in_chunks() {
        let mut h = udp_harness(false);
        let payload = b"abcdefgh".repeat(40);
        h.push_all(h.cloud(&OutboundMessage::request(12, Command::Batch, &payload).with_compression(true)));
        h.run();

        let delivered = h.delegate.delivered();
        assert!(delivered.len() > 1);
        assert!(delivered.iter().all(|d| d.data.len() <= h.ctx.max_payload_bytes()));
        assert!(delivered[..delivered.len() - 1].iter().all(|d| !d.last));
        assert!(delivered[delivered.len() - 1].last);
        let joined: Vec<u8> = delivered.iter().flat_map(|d| d.data.clone()).collect();
        assert_eq!(joined, payload);
    }

    #[test]
    fn test_corrupt_compressed_body_fails() {
        let mut h = udp_harness(false);
        let header = crate::wire::PacketHeader::new(
            13,
            true,
            true,
            crate::wire::SegmentShape::Single {
                cmd_status: Command::Data.code() | crate::wire::CS_COMPRESSED,
            },
        );
        let datagram = Framing::datagram(1, super::super::testing::PEER_ID.to_vec())
            .wrap(&header.encode(&[0xFF; 16], false));
        h.link.push(datagram);
        h.run();

        assert!(h.delegate.delivered().is_empty());
        assert_eq!(h.ctx.session_count(), 0);
        // Fully received and response needed: the cloud hears about it
        assert_eq!(h.link.take_sent().len(), 1);
    }

    #[test]
    fn test_encrypted_delivery_and_replay() {
        let mut h = udp_harness(true);
        h.install_key(KEY_A);
        let datagrams = h.cloud(&OutboundMessage::request(21, Command::Data, b"secret"));
        h.push_all(datagrams.clone());
        h.run();
        assert_eq!(h.delegate.delivered()[0].data, b"secret");

        h.push_all(datagrams);
        h.run();
        assert_eq!(h.delegate.delivered().len(), 1);
        assert_eq!(h.ctx.session_count(), 0);
    }

    #[test]
    fn test_unknown_key_discarded_silently() {
        let mut h = udp_harness(true);
        h.install_key(KEY_A);
        let stale = h.cloud(&OutboundMessage::request(22, Command::Data, b"old").with_response_needed(true));
        h.install_key(KEY_B);
        h.install_key(KEY_C);

        h.push_all(stale);
        h.run();
        assert!(h.delegate.delivered().is_empty());
        assert!(h.link.take_sent().is_empty());
        assert_eq!(h.ctx.session_count(), 0);
    }

    #[test]
    fn test_new_key_installed_from_message() {
        let mut h = udp_harness(true);
        h.install_key(KEY_A);
        h.push_all(h.cloud(&OutboundMessage::request(30, Command::Config, b"rotate").with_new_key(KEY_B)));
        h.run();
        assert_eq!(h.delegate.delivered()[0].data, b"rotate");

        let keyring = h.connector.keyring();
        assert!(keyring.lock().has_previous_key());
        // Request IDs restart under the new key
        assert_eq!(keyring.lock().request_id(crate::wire::TransportKind::Udp), Some(0));

        // The harness cloud now seals with the new key
        h.push_all(h.cloud(&OutboundMessage::request(31, Command::Data, b"after")));
        h.run();
        assert_eq!(h.delegate.delivered()[1].data, b"after");
        assert!(!keyring.lock().has_previous_key());
    }

    #[test]
    fn test_encrypted_compressed_multipart() {
        let mut h = udp_harness(true);
        h.install_key(KEY_A);
        let payload: Vec<u8> = (0..150u32).map(|i| (i.wrapping_mul(2_654_435_761) >> 13) as u8).collect();
        let datagrams = h.cloud(&OutboundMessage::request(40, Command::Data, &payload).with_compression(true));
        assert!(datagrams.len() > 1);
        for datagram in datagrams.into_iter().rev() {
            h.link.push(datagram);
        }
        h.run();

        let joined: Vec<u8> = h.delegate.delivered().iter().flat_map(|d| d.data.clone()).collect();
        assert_eq!(joined, payload);
    }

    #[test]
    fn test_cancel_all_notifies_pending_requests() {
        let mut h = udp_harness(false);
        let first = h.ctx.send_request(Command::Data, b"a", RequestOptions::default()).unwrap();
        let second = h.ctx.send_request(Command::Data, b"b", RequestOptions::default()).unwrap();
        assert_ne!(first, second);

        h.ctx.shutdown().unwrap();
        let mut failures = h.delegate.failures.lock().clone();
        failures.sort_by_key(|(id, _)| *id);
        assert_eq!(failures, vec![(first, SessionError::Cancelled), (second, SessionError::Cancelled)]);
        assert!(h.ctx.is_closed());
        assert!(matches!(h.ctx.receive_next(), Err(SmError::Aborted(_))));
    }
}
