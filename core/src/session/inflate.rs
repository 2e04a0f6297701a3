// Streaming inflate of an SM message body
//
// Senders strip the 2-byte zlib header from the deflate stream, so a fixed
// header is fed to the decoder before the first input byte.

use flate2::{Decompress, FlushDecompress, Status};
use std::collections::VecDeque;

/// Synthetic zlib header injected ahead of every compressed body
pub const ZLIB_HEADER: [u8; 2] = [0x58, 0xC3];

pub struct Inflater {
    stream: Decompress,
    inputs: VecDeque<Vec<u8>>,
    current: Vec<u8>,
    position: usize,
    chunk_size: usize,
    finished: bool,
}

impl std::fmt::Debug for Inflater {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Inflater")
            .field("total_in", &self.stream.total_in())
            .field("total_out", &self.stream.total_out())
            .field("pending_inputs", &self.inputs.len())
            .field("finished", &self.finished)
            .finish()
    }
}

impl Inflater {
    /// `inputs` are consumed in order; output comes back in `chunk_size` pieces.
    pub fn new(inputs: Vec<Vec<u8>>, chunk_size: usize) -> Self {
        Self {
            stream: Decompress::new(true),
            inputs: inputs.into(),
            current: ZLIB_HEADER.to_vec(),
            position: 0,
            chunk_size: chunk_size.max(1),
            finished: false,
        }
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Produce the next chunk of output.
    ///
    /// Returns the bytes and whether this is the last chunk. The stream ends at
    /// the deflate end marker or when every input has been consumed.
    pub fn next_chunk(&mut self) -> Result<(Vec<u8>, bool), String> {
        if self.finished {
            return Ok((Vec::new(), true));
        }

        let mut out = Vec::with_capacity(self.chunk_size);
        while out.len() < self.chunk_size {
            if self.position == self.current.len() {
                match self.inputs.pop_front() {
                    Some(next) => {
                        self.current = next;
                        self.position = 0;
                        continue;
                    }
                    None => {
                        if self.flush_pending(&mut out)? {
                            self.finished = true;
                            break;
                        }
                        continue;
                    }
                }
            }

            let before_in = self.stream.total_in();
            let before_out = self.stream.total_out();
            let status = self
                .stream
                .decompress_vec(&self.current[self.position..], &mut out, FlushDecompress::None)
                .map_err(|e| e.to_string())?;
            let consumed = (self.stream.total_in() - before_in) as usize;
            let produced = self.stream.total_out() - before_out;
            self.position += consumed;

            if status == Status::StreamEnd {
                self.finished = true;
                break;
            }
            if consumed == 0 && produced == 0 && out.len() < out.capacity() {
                return Err("inflate made no progress".to_string());
            }
        }

        Ok((out, self.finished))
    }

    /// Input is used up but the decoder may still hold output that did not fit
    /// the last chunk. Returns true once nothing more can come out.
    fn flush_pending(&mut self, out: &mut Vec<u8>) -> Result<bool, String> {
        let before_out = self.stream.total_out();
        let status = self
            .stream
            .decompress_vec(&[], out, FlushDecompress::None)
            .map_err(|e| e.to_string())?;
        let produced = self.stream.total_out() - before_out;
        Ok(status == Status::StreamEnd || produced == 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::ZlibEncoder;
    use flate2::Compression;
    use std::io::Write;

    /// Deflate the way a sender does: zlib stream minus its 2-byte header
    fn sender_compress(data: &[u8]) -> Vec<u8> {
        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(data).unwrap();
        encoder.finish().unwrap()[2..].to_vec()
    }

    fn drain(inflater: &mut Inflater) -> (Vec<u8>, usize) {
        let mut out = Vec::new();
        let mut chunks = 0;
        loop {
            let (chunk, last) = inflater.next_chunk().unwrap();
            out.extend_from_slice(&chunk);
            chunks += 1;
            if last {
                return (out, chunks);
            }
        }
    }

    #[test]
    fn test_zlib_header_is_valid() {
        let check = ((ZLIB_HEADER[0] as u16) << 8) | ZLIB_HEADER[1] as u16;
        assert_eq!(check % 31, 0);
        assert_eq!(ZLIB_HEADER[0] & 0x0F, 8);
    }

    #[test]
    fn test_single_input() {
        let data = b"hello hello hello hello compressed world".repeat(4);
        let mut inflater = Inflater::new(vec![sender_compress(&data)], 1024);
        let (out, chunks) = drain(&mut inflater);
        assert_eq!(out, data);
        assert_eq!(chunks, 1);
        assert!(inflater.is_finished());
    }

    #[test]
    fn test_chunked_output() {
        let data: Vec<u8> = (0..2000u32).map(|i| (i % 251) as u8).collect();
        let mut inflater = Inflater::new(vec![sender_compress(&data)], 100);
        let (out, chunks) = drain(&mut inflater);
        assert_eq!(out, data);
        assert!(chunks >= 20);
    }

    #[test]
    fn test_highly_compressible_output_spans_chunks() {
        // The whole input is consumed long before the output is drained
        let data = vec![b'a'; 10_000];
        let compressed = sender_compress(&data);
        assert!(compressed.len() < 100);

        let mut inflater = Inflater::new(vec![compressed], 100);
        let (out, chunks) = drain(&mut inflater);
        assert_eq!(out.len(), data.len());
        assert_eq!(out, data);
        assert!(chunks >= 100);
    }

    #[test]
    fn test_input_split_across_segments() {
        let data = b"segmented deflate stream ".repeat(40);
        let compressed = sender_compress(&data);
        let inputs: Vec<Vec<u8>> = compressed.chunks(7).map(|c| c.to_vec()).collect();

        let mut inflater = Inflater::new(inputs, 64);
        let (out, _) = drain(&mut inflater);
        assert_eq!(out, data);
    }

    #[test]
    fn test_missing_trailer_ends_at_input_exhaustion() {
        let data = b"no adler trailer".to_vec();
        let mut compressed = sender_compress(&data);
        compressed.truncate(compressed.len() - 4);

        let mut inflater = Inflater::new(vec![compressed], 256);
        let (out, _) = drain(&mut inflater);
        assert_eq!(out, data);
    }

    #[test]
    fn test_garbage_fails() {
        let mut inflater = Inflater::new(vec![vec![0xFF; 32]], 64);
        assert!(inflater.next_chunk().is_err());
    }

    #[test]
    fn test_finished_returns_empty_last() {
        let mut inflater = Inflater::new(vec![sender_compress(b"x")], 64);
        drain(&mut inflater);
        assert_eq!(inflater.next_chunk().unwrap(), (Vec::new(), true));
    }
}
