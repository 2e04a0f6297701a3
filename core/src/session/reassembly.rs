// Segment reassembly — collects the segments of one message in any order

use crate::wire::WireError;
use tracing::debug;

/// Per-slot segment storage.
///
/// Slots are allocated for `max_segments` up front because continuation
/// segments can arrive before segment 0 tells us the real count. A re-sent
/// segment is ignored (first copy wins) without comparing bytes.
#[derive(Debug, Clone)]
pub struct SegmentBuffer {
    slots: Vec<Option<Vec<u8>>>,
    count: Option<u8>,
    received: usize,
    max_payload: usize,
}

impl SegmentBuffer {
    pub fn new(max_segments: u8, max_payload: usize) -> Self {
        Self {
            slots: vec![None; max_segments.max(1) as usize],
            count: None,
            received: 0,
            max_payload,
        }
    }

    /// Buffer for a single-segment message (no payload limit)
    pub fn single() -> Self {
        let mut buffer = Self::new(1, usize::MAX);
        buffer.count = Some(1);
        buffer
    }

    /// Fix the segment count (known from segment 0). Segments already stored
    /// at an index beyond the count are discarded.
    pub fn set_count(&mut self, count: u8) {
        let count = count.max(1).min(self.slots.len() as u8);
        for slot in self.slots.iter_mut().skip(count as usize) {
            if slot.take().is_some() {
                self.received -= 1;
            }
        }
        self.count = Some(count);
    }

    pub fn count(&self) -> Option<u8> {
        self.count
    }

    pub fn received(&self) -> usize {
        self.received
    }

    /// Store one segment. Returns `Ok(false)` for a duplicate.
    pub fn insert(&mut self, number: u8, payload: &[u8]) -> Result<bool, WireError> {
        let limit = self.count.map(|c| c as usize).unwrap_or(self.slots.len());
        if number as usize >= limit {
            return Err(WireError::InvalidSegment {
                number,
                count: limit as u8,
            });
        }
        if payload.len() > self.max_payload {
            return Err(WireError::SegmentTooLarge {
                len: payload.len(),
                max: self.max_payload,
            });
        }

        let slot = &mut self.slots[number as usize];
        if slot.is_some() {
            debug!(segment = number, "Duplicate segment ignored");
            return Ok(false);
        }
        *slot = Some(payload.to_vec());
        self.received += 1;
        Ok(true)
    }

    pub fn is_complete(&self) -> bool {
        self.count.map(|c| self.received >= c as usize).unwrap_or(false)
    }

    /// Sum of the true segment lengths
    pub fn total_len(&self) -> usize {
        self.slots.iter().flatten().map(Vec::len).sum()
    }

    /// Concatenate the stored segments in index order.
    pub fn assemble(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.total_len());
        for segment in self.slots.iter().flatten() {
            out.extend_from_slice(segment);
        }
        out
    }

    /// Hand out the stored segments in index order, leaving the buffer empty.
    pub fn take_segments(&mut self) -> Vec<Vec<u8>> {
        self.received = 0;
        self.slots.iter_mut().filter_map(Option::take).collect()
    }
}
