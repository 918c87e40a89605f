//! Stream receive half (RFC 9000 Sections 2.2, 3.2).
//!
//! Out-of-order segments land in an offset-sorted map, overlap-trimmed
//! against both the read offset and each other, so the application
//! observes each byte exactly once and in order.

#![forbid(unsafe_code)]

use crate::error::{QuicError, Result, TransportErrorCode};
use crate::types::StreamOffset;
use bytes::Bytes;
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecvState {
    Open,
    Closed,
}

/// A reset received from the peer, surfaced to the application once any
/// reliable prefix has been delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecvReset {
    pub error_code: u64,
    pub final_size: StreamOffset,
}

#[derive(Debug)]
pub struct RecvHalf {
    state: RecvState,

    /// Buffered out-of-order segments; non-overlapping, offset-keyed.
    segments: BTreeMap<StreamOffset, Bytes>,
    buffered_bytes: u64,

    current_read_offset: StreamOffset,
    final_offset: Option<StreamOffset>,

    /// Highest contiguous-or-not offset seen, for flow accounting.
    highest_received: StreamOffset,

    /// Reset waiting for its reliable prefix to drain.
    pending_reset: Option<(RecvReset, StreamOffset)>,

    /// Reset already surfaced to the application.
    reset_delivered: Option<RecvReset>,
}

impl Default for RecvHalf {
    fn default() -> Self {
        Self {
            state: RecvState::Open,
            segments: BTreeMap::new(),
            buffered_bytes: 0,
            current_read_offset: 0,
            final_offset: None,
            highest_received: 0,
            pending_reset: None,
            reset_delivered: None,
        }
    }
}

impl RecvHalf {
    pub fn state(&self) -> RecvState {
        self.state
    }

    pub fn current_read_offset(&self) -> StreamOffset {
        self.current_read_offset
    }

    pub fn final_offset(&self) -> Option<StreamOffset> {
        self.final_offset
    }

    pub fn highest_received(&self) -> StreamOffset {
        self.highest_received
    }

    pub fn buffered_bytes(&self) -> u64 {
        self.buffered_bytes
    }

    /// Ingest one STREAM segment.
    ///
    /// Returns the advance of `highest_received`, the amount that counts
    /// against connection-level flow control.
    pub fn on_data(&mut self, offset: StreamOffset, data: &[u8], fin: bool) -> Result<u64> {
        let end = offset + data.len() as u64;

        // Final-size consistency (RFC 9000 Section 4.5).
        if let Some(final_offset) = self.final_offset {
            if end > final_offset || (fin && end != final_offset) {
                return Err(QuicError::final_size("data past final size"));
            }
        } else if fin {
            if end < self.highest_received {
                return Err(QuicError::final_size("final size below received data"));
            }
            self.final_offset = Some(end);
        }

        let advance = end.saturating_sub(self.highest_received);
        self.highest_received = self.highest_received.max(end);

        if self.state == RecvState::Closed {
            // Late data after a plain reset is discarded, not an error.
            return Ok(advance);
        }

        // Trim against what the application already consumed, then insert
        // only the pieces that fill gaps between buffered segments.
        let mut pos = offset.max(self.current_read_offset);
        while pos < end {
            // Skip past any segment already covering `pos`.
            if let Some((&seg_off, seg)) = self.segments.range(..=pos).next_back() {
                let seg_end = seg_off + seg.len() as u64;
                if seg_end > pos {
                    pos = seg_end;
                    continue;
                }
            }
            // The next buffered segment bounds this piece.
            let piece_end = self
                .segments
                .range(pos..)
                .next()
                .map(|(&next_off, _)| next_off)
                .unwrap_or(end)
                .min(end);
            let slice = &data[(pos - offset) as usize..(piece_end - offset) as usize];
            self.segments.insert(pos, Bytes::copy_from_slice(slice));
            self.buffered_bytes += piece_end - pos;
            pos = piece_end;
        }

        Ok(advance)
    }

    /// Whether a read would yield data, FIN, or a reset notification.
    pub fn readable(&self) -> bool {
        if self.reset_ready() {
            return true;
        }
        if self.state == RecvState::Closed {
            return false;
        }
        self.segments.contains_key(&self.current_read_offset)
            || self.final_offset == Some(self.current_read_offset)
    }

    fn reset_ready(&self) -> bool {
        self.pending_reset
            .is_some_and(|(_, reliable)| self.current_read_offset >= reliable)
    }

    /// Read up to `max_len` contiguous bytes.
    ///
    /// Returns the data and whether the stream is finished (FIN reached
    /// or reset surfaced).
    pub fn read(&mut self, max_len: usize) -> (Bytes, bool) {
        if self.state == RecvState::Closed {
            return (Bytes::new(), true);
        }

        let mut out = Bytes::new();
        if let Some(seg) = self.segments.remove(&self.current_read_offset) {
            if seg.len() > max_len {
                let rest = seg.slice(max_len..);
                self.segments
                    .insert(self.current_read_offset + max_len as u64, rest);
                out = seg.slice(..max_len);
            } else {
                out = seg;
            }
            self.buffered_bytes -= out.len() as u64;
            self.current_read_offset += out.len() as u64;
        }

        // A pending reliable reset fires once its prefix is consumed.
        if self.reset_ready() {
            let (reset, _) = self.pending_reset.take().expect("reset_ready checked");
            self.finish_reset(reset);
            return (out, true);
        }

        let fin = self.final_offset == Some(self.current_read_offset);
        if fin {
            self.state = RecvState::Closed;
        }
        (out, fin)
    }

    /// Peer reset the stream.
    ///
    /// With a reliable size, delivery continues up to it; everything at
    /// or above is discarded immediately.
    pub fn on_reset(
        &mut self,
        error_code: u64,
        final_size: StreamOffset,
        reliable_size: Option<StreamOffset>,
    ) -> Result<u64> {
        if final_size < self.highest_received {
            return Err(QuicError::final_size("reset final size below received data"));
        }
        if let Some(existing) = self.final_offset {
            if existing != final_size {
                return Err(QuicError::final_size("reset final size conflicts with FIN"));
            }
        }
        // The whole final size counts against connection flow control.
        let advance = final_size.saturating_sub(self.highest_received);
        self.highest_received = final_size;
        self.final_offset = Some(final_size);

        if self.state == RecvState::Closed {
            return Ok(advance);
        }

        let reset = RecvReset { error_code, final_size };
        let reliable = reliable_size.unwrap_or(0);

        // Drop buffered data at or above the reliable prefix.
        let doomed: Vec<StreamOffset> = self
            .segments
            .range(..)
            .filter(|(&off, seg)| off + seg.len() as u64 > reliable)
            .map(|(&off, _)| off)
            .collect();
        for off in doomed {
            let seg = self.segments.remove(&off).expect("key observed");
            if off < reliable {
                let keep = (reliable - off) as usize;
                self.buffered_bytes -= (seg.len() - keep) as u64;
                self.segments.insert(off, seg.slice(..keep));
            } else {
                self.buffered_bytes -= seg.len() as u64;
            }
        }

        if self.current_read_offset >= reliable {
            self.finish_reset(reset);
        } else {
            self.pending_reset = Some((reset, reliable));
        }
        Ok(advance)
    }

    fn finish_reset(&mut self, reset: RecvReset) {
        self.segments.clear();
        self.buffered_bytes = 0;
        self.reset_delivered = Some(reset);
        self.state = RecvState::Closed;
        tracing::trace!(error = reset.error_code, "stream receive half reset");
    }

    /// The reset to surface to the application, once.
    pub fn take_reset(&mut self) -> Option<RecvReset> {
        self.reset_delivered.take()
    }

    pub fn is_terminal(&self) -> bool {
        self.state == RecvState::Closed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn in_order_read() {
        let mut half = RecvHalf::default();
        half.on_data(0, b"hello", false).unwrap();
        assert!(half.readable());
        let (data, fin) = half.read(100);
        assert_eq!(&data[..], b"hello");
        assert!(!fin);
    }

    #[test]
    fn hol_coalesce_advances_to_seven() {
        // Segments (0,3), (5,2), (3,2): readable offset goes 0 -> 7 and
        // the reader sees one ordered 7-byte sequence.
        let mut half = RecvHalf::default();
        half.on_data(0, b"abc", false).unwrap();
        half.on_data(5, b"fg", false).unwrap();
        half.on_data(3, b"de", false).unwrap();

        let mut collected = Vec::new();
        while half.readable() {
            let (data, fin) = half.read(100);
            collected.extend_from_slice(&data);
            if fin || data.is_empty() {
                break;
            }
        }
        assert_eq!(collected, b"abcdefg");
        assert_eq!(half.current_read_offset(), 7);
    }

    #[test]
    fn duplicate_and_overlap_deliver_once() {
        let mut half = RecvHalf::default();
        half.on_data(0, b"abcd", false).unwrap();
        // Full duplicate plus an overlap extending the range.
        half.on_data(0, b"abcd", false).unwrap();
        half.on_data(2, b"cdef", false).unwrap();
        let (data, _) = half.read(100);
        assert_eq!(&data[..], b"abcd");
        let (data, _) = half.read(100);
        assert_eq!(&data[..], b"ef");
        assert_eq!(half.buffered_bytes(), 0);
    }

    #[test]
    fn overlap_behind_read_offset_trimmed() {
        let mut half = RecvHalf::default();
        half.on_data(0, b"abcd", false).unwrap();
        half.read(100);
        // Retransmission covering already-read bytes plus new ones.
        half.on_data(0, b"abcdEF", false).unwrap();
        let (data, _) = half.read(100);
        assert_eq!(&data[..], b"EF");
    }

    #[test]
    fn fin_consistency_enforced() {
        let mut half = RecvHalf::default();
        half.on_data(0, b"abcde", true).unwrap();
        // Conflicting FIN at a different size.
        let err = half.on_data(0, b"ab", true).unwrap_err();
        assert_eq!(err.code, TransportErrorCode::FinalSizeError);
        // Data past the final size.
        assert!(half.on_data(3, b"xyz", false).is_err());
    }

    #[test]
    fn fin_below_received_rejected() {
        let mut half = RecvHalf::default();
        half.on_data(10, b"late", false).unwrap();
        let err = half.on_data(0, b"ab", true).unwrap_err();
        assert_eq!(err.code, TransportErrorCode::FinalSizeError);
    }

    #[test]
    fn fin_reached_closes() {
        let mut half = RecvHalf::default();
        half.on_data(0, b"ab", true).unwrap();
        let (data, fin) = half.read(100);
        assert_eq!(&data[..], b"ab");
        assert!(fin);
        assert!(half.is_terminal());
    }

    #[test]
    fn flow_accounting_counts_highest_offset_advance() {
        let mut half = RecvHalf::default();
        assert_eq!(half.on_data(0, b"abcd", false).unwrap(), 4);
        // Duplicate advances nothing.
        assert_eq!(half.on_data(0, b"abcd", false).unwrap(), 0);
        // A gap still advances by the full distance.
        assert_eq!(half.on_data(10, b"xy", false).unwrap(), 8);
    }

    #[test]
    fn plain_reset_discards_buffered_data() {
        let mut half = RecvHalf::default();
        half.on_data(0, b"abc", false).unwrap();
        half.on_reset(42, 10, None).unwrap();
        assert!(half.is_terminal());
        assert_eq!(half.take_reset(), Some(RecvReset { error_code: 42, final_size: 10 }));
        assert_eq!(half.buffered_bytes(), 0);
    }

    #[test]
    fn reset_final_size_checks() {
        let mut half = RecvHalf::default();
        half.on_data(0, b"abcdef", false).unwrap();
        let err = half.on_reset(1, 3, None).unwrap_err();
        assert_eq!(err.code, TransportErrorCode::FinalSizeError);
    }

    #[test]
    fn reliable_reset_delivers_prefix_first() {
        let mut half = RecvHalf::default();
        half.on_data(0, b"abcdef", false).unwrap();
        // Reliable size 4: bytes 0..4 must still reach the application.
        half.on_reset(9, 6, Some(4)).unwrap();
        assert!(!half.is_terminal());
        let (data, done) = half.read(100);
        assert_eq!(&data[..], b"abcd");
        assert!(done);
        assert!(half.is_terminal());
        assert_eq!(half.take_reset(), Some(RecvReset { error_code: 9, final_size: 6 }));
    }

    #[test]
    fn reliable_reset_with_prefix_already_read_closes_now() {
        let mut half = RecvHalf::default();
        half.on_data(0, b"abcd", false).unwrap();
        half.read(100);
        half.on_reset(9, 8, Some(4)).unwrap();
        assert!(half.is_terminal());
    }
}
