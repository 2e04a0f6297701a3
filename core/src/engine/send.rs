//! Send path: payload -> deflate -> seal -> segment -> header/CRC -> framing.

use super::TransportContext;
use crate::crypto::{IvPool, KeyRing, KEY_LENGTH};
use crate::session::{Direction, ErrorCode, SegmentBuffer, Session};
use crate::wire::{
    Command, Framing, PacketHeader, SegmentShape, TransportKind, CS_COMPRESSED, CS_ENCRYPTED,
    CS_ERROR, CS_NEW_KEY,
};
use crate::SmError;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use std::io::Write;
use std::time::Duration;
use tracing::{debug, info};

/// Bytes of zlib header stripped from every deflate stream on the wire
const ZLIB_HEADER_LEN: usize = 2;

/// How a locally-originated request is sent
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestOptions {
    /// Register a session to collect the cloud's response
    pub response_needed: bool,
    /// How long to wait for that response (`None` waits forever)
    pub timeout: Option<Duration>,
    /// Deflate the body (ignored when compression is disabled)
    pub compress: bool,
}

impl Default for RequestOptions {
    fn default() -> Self {
        Self {
            response_needed: true,
            timeout: Some(Duration::from_secs(60)),
            compress: false,
        }
    }
}

/// A message about to be encoded
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutboundMessage<'a> {
    pub request_id: u16,
    /// `None` for responses
    pub command: Option<Command>,
    pub response_needed: bool,
    /// Error code for an error response
    pub error: Option<ErrorCode>,
    pub compress: bool,
    /// Key the receiver installs before processing the body (sealed messages only)
    pub new_key: Option<[u8; KEY_LENGTH]>,
    pub payload: &'a [u8],
}

impl<'a> OutboundMessage<'a> {
    pub fn request(request_id: u16, command: Command, payload: &'a [u8]) -> Self {
        Self {
            request_id,
            command: Some(command),
            response_needed: false,
            error: None,
            compress: false,
            new_key: None,
            payload,
        }
    }

    pub fn response(request_id: u16, payload: &'a [u8]) -> Self {
        Self {
            request_id,
            command: None,
            response_needed: false,
            error: None,
            compress: false,
            new_key: None,
            payload,
        }
    }

    pub fn with_response_needed(mut self, response_needed: bool) -> Self {
        self.response_needed = response_needed;
        self
    }

    pub fn with_compression(mut self, compress: bool) -> Self {
        self.compress = compress;
        self
    }

    pub fn with_error(mut self, code: ErrorCode) -> Self {
        self.error = Some(code);
        self
    }

    pub fn with_new_key(mut self, key: [u8; KEY_LENGTH]) -> Self {
        self.new_key = Some(key);
        self
    }

    fn is_request(&self) -> bool {
        self.command.is_some()
    }
}

struct Sealer<'a> {
    keyring: &'a KeyRing,
    transport: TransportKind,
    pool: IvPool,
}

/// Turns one outbound message into framed datagrams.
pub struct MessageEncoder<'a> {
    framing: &'a Framing,
    max_payload: usize,
    max_segments: u8,
    sealer: Option<Sealer<'a>>,
}

impl<'a> MessageEncoder<'a> {
    pub fn new(framing: &'a Framing, max_payload: usize, max_segments: u8) -> Self {
        Self {
            framing,
            max_payload,
            max_segments,
            sealer: None,
        }
    }

    /// Seal bodies under the key ring's current key. Devices use
    /// `IvPool::Device`; a simulated cloud peer uses `IvPool::Server`.
    pub fn with_encryption(mut self, keyring: &'a KeyRing, transport: TransportKind, pool: IvPool) -> Self {
        self.sealer = Some(Sealer {
            keyring,
            transport,
            pool,
        });
        self
    }

    pub fn encode(&self, message: &OutboundMessage<'_>) -> Result<Vec<Vec<u8>>, SmError> {
        if self.max_payload == 0 {
            return Err(SmError::InvalidConfig("no room for segment payload".to_string()));
        }
        let is_request = message.is_request();
        let request_id = message.request_id;

        let mut cmd_status = message.command.map(|c| c.code()).unwrap_or(0);
        let mut body = if message.compress {
            cmd_status |= CS_COMPRESSED;
            deflate(message.payload)?
        } else {
            message.payload.to_vec()
        };
        let error = message.error.filter(|_| !is_request);
        if error.is_some() {
            cmd_status |= CS_ERROR;
        }

        if let Some(key) = &message.new_key {
            if self.sealer.is_none() {
                return Err(SmError::InvalidConfig("a new key can only travel sealed".to_string()));
            }
            cmd_status |= CS_NEW_KEY;
            body.splice(0..0, key.iter().copied());
        }

        if let Some(sealer) = &self.sealer {
            cmd_status |= CS_ENCRYPTED;
            // The AAD masks out the multipart bit, so the single-shape info byte serves
            let info = PacketHeader::new(
                request_id,
                is_request,
                message.response_needed,
                SegmentShape::Single { cmd_status },
            )
            .info;
            body = sealer.keyring.encrypt(
                sealer.transport,
                request_id,
                info,
                cmd_status,
                sealer.pool,
                &body,
            )?;
        }

        let mut wire = Vec::with_capacity(body.len() + 2);
        if let Some(code) = error {
            wire.extend_from_slice(&code.as_u16().to_be_bytes());
        }
        wire.extend_from_slice(&body);

        let header = |shape| PacketHeader::new(request_id, is_request, message.response_needed, shape);

        if wire.len() <= self.max_payload {
            let segment = header(SegmentShape::Single { cmd_status }).encode(&wire, false);
            return Ok(vec![self.framing.wrap(&segment)]);
        }

        let chunks: Vec<&[u8]> = wire.chunks(self.max_payload).collect();
        if chunks.len() > self.max_segments as usize {
            return Err(SmError::MessageTooLarge {
                needed: chunks.len(),
                max: self.max_segments as usize,
            });
        }
        let count = chunks.len() as u8;

        Ok(chunks
            .iter()
            .enumerate()
            .map(|(number, chunk)| {
                let shape = if number == 0 {
                    SegmentShape::First { count, cmd_status }
                } else {
                    SegmentShape::Continuation {
                        number: number as u8,
                    }
                };
                self.framing.wrap(&header(shape).encode(chunk, false))
            })
            .collect())
    }
}

/// Deflate `payload` and strip the zlib header the receiver re-injects.
fn deflate(payload: &[u8]) -> Result<Vec<u8>, SmError> {
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(payload)
        .map_err(|e| SmError::Compression(e.to_string()))?;
    let stream = encoder
        .finish()
        .map_err(|e| SmError::Compression(e.to_string()))?;
    stream
        .get(ZLIB_HEADER_LEN..)
        .map(<[u8]>::to_vec)
        .ok_or_else(|| SmError::Compression("truncated zlib stream".to_string()))
}

impl TransportContext {
    /// Send a request to the cloud and return its request ID.
    ///
    /// With `response_needed`, a client-originated session is registered
    /// before anything is sent so the response has somewhere to land.
    pub fn send_request(
        &mut self,
        command: Command,
        payload: &[u8],
        options: RequestOptions,
    ) -> Result<u16, SmError> {
        self.ensure_open()?;
        let request_id = self.allocate_request_id()?;
        let key = (request_id, Direction::ClientOriginated);

        if options.response_needed {
            let segments = SegmentBuffer::new(self.transport.max_segments, self.max_payload);
            let session = Session::new(
                request_id,
                Direction::ClientOriginated,
                segments,
                self.clock.now(),
                options.timeout,
            );
            self.sessions.insert(session)?;
        }

        let message = OutboundMessage::request(request_id, command, payload)
            .with_response_needed(options.response_needed)
            .with_compression(options.compress && self.config.compression);
        if let Err(e) = self.transmit(&message) {
            self.sessions.remove(&key);
            return Err(e);
        }

        info!(
            transport = %self.transport.kind,
            request_id,
            ?command,
            len = payload.len(),
            response_needed = options.response_needed,
            "Request sent"
        );
        Ok(request_id)
    }

    /// Answer a cloud request, optionally as an error response.
    pub fn send_response(
        &self,
        request_id: u16,
        payload: &[u8],
        error: Option<ErrorCode>,
    ) -> Result<(), SmError> {
        self.ensure_open()?;
        let mut message = OutboundMessage::response(request_id, payload)
            .with_compression(self.config.compression && !payload.is_empty());
        if let Some(code) = error {
            message = message.with_error(code);
        }
        self.transmit(&message)?;
        debug!(transport = %self.transport.kind, request_id, ?error, "Response sent");
        Ok(())
    }

    fn allocate_request_id(&mut self) -> Result<u16, SmError> {
        let transport = self.transport.kind;
        let allocated = if self.config.encryption {
            self.keyring.lock().next_request_id(transport)?
        } else {
            let sessions = &self.sessions;
            self.request_ids.next_free(|id| sessions.in_use(id))
        };
        allocated.ok_or(SmError::RequestIdExhausted(transport))
    }

    fn transmit(&self, message: &OutboundMessage<'_>) -> Result<(), SmError> {
        let datagrams = {
            let keyring = self.keyring.lock();
            let mut encoder =
                MessageEncoder::new(&self.framing, self.max_payload, self.transport.max_segments);
            if self.config.encryption {
                encoder = encoder.with_encryption(&keyring, self.transport.kind, IvPool::Device);
            }
            encoder.encode(message)?
        };

        for datagram in &datagrams {
            self.link.send(datagram).map_err(SmError::Link)?;
        }
        debug!(
            transport = %self.transport.kind,
            request_id = message.request_id,
            segments = datagrams.len(),
            "Message transmitted"
        );
        Ok(())
    }
}
