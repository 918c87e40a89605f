//! Stream send half (RFC 9000 Sections 2.2, 3.1).
//!
//! Four buffers carry a byte from the application to delivery: the write
//! buffer (accepted, unsent), the retransmission buffer (sent, unacked,
//! keyed by offset), the loss buffer (declared lost, sorted and
//! coalesced, drained before fresh data), and the acked interval set.
//! FIN occupies one extra logical offset so delivery of the final byte
//! is observable as an interval reaching `final_offset`.

#![forbid(unsafe_code)]

use crate::error::{QuicError, Result, TransportErrorCode};
use crate::range_set::RangeSet;
use crate::types::StreamOffset;
use bytes::{Bytes, BytesMut};
use std::collections::{BTreeMap, VecDeque};

/// Send-side lifecycle: `Open -> ResetSent -> Closed`, or
/// `Open -> Closed` once everything is delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendState {
    Open,
    ResetSent,
    Closed,
}

/// A contiguous run of sent (or to-be-resent) bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendSegment {
    pub offset: StreamOffset,
    pub data: Bytes,
    pub fin: bool,
}

impl SendSegment {
    pub fn end(&self) -> StreamOffset {
        self.offset + self.data.len() as u64
    }
}

/// The reset currently owed to (or sent to) the peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingReset {
    pub error_code: u64,
    pub final_size: StreamOffset,
    pub reliable_size: Option<StreamOffset>,
}

#[derive(Debug)]
pub struct SendHalf {
    state: SendState,

    /// Accepted application bytes not yet sent.
    write_buffer: VecDeque<Bytes>,
    buffered_bytes: u64,

    /// Next fresh offset to put on the wire.
    current_write_offset: StreamOffset,

    /// Total bytes accepted from the application.
    app_offset: StreamOffset,

    /// Sent-but-unacked segments, keyed by offset, non-overlapping.
    retransmission_buffer: BTreeMap<StreamOffset, SendSegment>,

    /// Segments declared lost, offset-sorted, contiguous runs merged.
    loss_buffer: VecDeque<SendSegment>,

    /// Delivered intervals; FIN counts as one extra byte.
    acked: RangeSet,

    final_offset: Option<StreamOffset>,
    fin_sent: bool,

    /// Application error code on the wire; immutable once chosen.
    reset: Option<PendingReset>,
    reset_needs_send: bool,
    reset_acked: bool,
}

impl Default for SendHalf {
    fn default() -> Self {
        Self {
            state: SendState::Open,
            write_buffer: VecDeque::new(),
            buffered_bytes: 0,
            current_write_offset: 0,
            app_offset: 0,
            retransmission_buffer: BTreeMap::new(),
            loss_buffer: VecDeque::new(),
            acked: RangeSet::new(),
            final_offset: None,
            fin_sent: false,
            reset: None,
            reset_needs_send: false,
            reset_acked: false,
        }
    }
}

impl SendHalf {
    pub fn state(&self) -> SendState {
        self.state
    }

    pub fn current_write_offset(&self) -> StreamOffset {
        self.current_write_offset
    }

    pub fn buffered_bytes(&self) -> u64 {
        self.buffered_bytes
    }

    pub fn final_offset(&self) -> Option<StreamOffset> {
        self.final_offset
    }

    pub fn pending_reset(&self) -> Option<PendingReset> {
        self.reset
    }

    /// Accept application bytes; `fin` marks the end of the stream.
    pub fn write(&mut self, data: Bytes, fin: bool) -> Result<()> {
        if self.state != SendState::Open {
            return Err(QuicError::new(TransportErrorCode::StreamStateError, "write after reset"));
        }
        if self.final_offset.is_some() {
            return Err(QuicError::new(TransportErrorCode::StreamStateError, "write after FIN"));
        }
        self.app_offset += data.len() as u64;
        if !data.is_empty() {
            self.buffered_bytes += data.len() as u64;
            self.write_buffer.push_back(data);
        }
        if fin {
            self.final_offset = Some(self.app_offset);
        }
        Ok(())
    }

    /// Whether the scheduler has anything to emit for this stream.
    pub fn wants_to_send(&self) -> bool {
        match self.state {
            SendState::Open => {
                !self.loss_buffer.is_empty()
                    || self.buffered_bytes > 0
                    || (self.final_offset.is_some() && !self.fin_sent)
            }
            SendState::ResetSent => self.reset_needs_send || !self.loss_buffer.is_empty(),
            SendState::Closed => false,
        }
    }

    /// Whether only lost (previously sent) data remains; such data is
    /// exempt from connection-level flow control, which it already
    /// consumed the first time.
    pub fn has_lost_data(&self) -> bool {
        !self.loss_buffer.is_empty()
    }

    pub fn has_fresh_data(&self) -> bool {
        self.state == SendState::Open
            && (self.buffered_bytes > 0 || (self.final_offset.is_some() && !self.fin_sent))
    }

    /// Dequeue the next segment to send: the loss buffer drains first,
    /// then fresh bytes bounded by `max_len` and `flow_limit` (stream
    /// credit for fresh data). Returns `None` when nothing fits.
    pub fn dequeue_segment(&mut self, max_len: usize, flow_limit: u64) -> Option<SendSegment> {
        if max_len == 0 {
            return None;
        }
        if let Some(seg) = self.dequeue_lost(max_len) {
            return Some(seg);
        }
        self.dequeue_fresh(max_len, flow_limit)
    }

    fn dequeue_lost(&mut self, max_len: usize) -> Option<SendSegment> {
        let mut seg = self.loss_buffer.pop_front()?;
        if seg.data.len() > max_len {
            // Head goes out now; the tail keeps its place (and FIN).
            let tail = SendSegment {
                offset: seg.offset + max_len as u64,
                data: seg.data.split_off(max_len),
                fin: seg.fin,
            };
            seg.fin = false;
            self.loss_buffer.push_front(tail);
        }
        self.track_sent(seg.clone());
        Some(seg)
    }

    fn dequeue_fresh(&mut self, max_len: usize, flow_limit: u64) -> Option<SendSegment> {
        if self.state != SendState::Open {
            return None;
        }
        let budget = (max_len as u64).min(flow_limit);
        let mut out = BytesMut::new();
        while out.len() < budget as usize {
            let Some(mut chunk) = self.write_buffer.pop_front() else { break };
            let room = budget as usize - out.len();
            if chunk.len() > room {
                let rest = chunk.split_off(room);
                self.write_buffer.push_front(rest);
            }
            self.buffered_bytes -= chunk.len() as u64;
            out.extend_from_slice(&chunk);
        }

        let fin_due = self.final_offset == Some(self.current_write_offset + out.len() as u64)
            && self.buffered_bytes == 0
            && !self.fin_sent;

        if out.is_empty() && !fin_due {
            return None;
        }

        let seg = SendSegment { offset: self.current_write_offset, data: out.freeze(), fin: fin_due };
        self.current_write_offset = seg.end();
        if fin_due {
            self.fin_sent = true;
        }
        self.track_sent(seg.clone());
        Some(seg)
    }

    fn track_sent(&mut self, seg: SendSegment) {
        debug_assert!(
            self.retransmission_buffer
                .range(..seg.end())
                .next_back()
                .map_or(true, |(_, prev)| prev.end() <= seg.offset || prev.offset >= seg.end()),
            "overlapping retransmission entries"
        );
        if !seg.data.is_empty() || seg.fin {
            self.retransmission_buffer.insert(seg.offset, seg);
        }
    }

    /// The closed interval `[start, end]` a segment occupies in the acked
    /// set; FIN adds one logical byte.
    fn acked_interval(offset: StreamOffset, len: u64, fin: bool) -> Option<(u64, u64)> {
        match (len, fin) {
            (0, false) => None,
            (0, true) => Some((offset, offset)),
            (len, false) => Some((offset, offset + len - 1)),
            (len, true) => Some((offset, offset + len)),
        }
    }

    /// Apply an acknowledgment of `[offset, offset+len)` (+FIN).
    ///
    /// Returns `true` when this ack completed delivery of the stream.
    pub fn on_ack(&mut self, offset: StreamOffset, len: u64, fin: bool) -> bool {
        if let Some((start, end)) = Self::acked_interval(offset, len, fin) {
            self.acked.insert(start, end);
        }
        self.remove_acked_range(offset, offset + len, fin);
        // Acked data can no longer be pending retransmission.
        self.remove_from_loss_buffer(offset, offset + len);

        if self.state == SendState::Open && self.all_delivered() {
            self.state = SendState::Closed;
            return true;
        }
        false
    }

    /// Acknowledgment of a RESET_STREAM we sent.
    pub fn on_reset_acked(&mut self) {
        if self.state == SendState::ResetSent {
            self.reset_acked = true;
            self.state = SendState::Closed;
        }
    }

    fn remove_acked_range(&mut self, start: StreamOffset, end: StreamOffset, fin: bool) {
        let keys: Vec<StreamOffset> = self
            .retransmission_buffer
            .range(..=end)
            .filter(|(_, seg)| {
                (seg.end() > start && seg.offset < end)
                    || (fin && seg.fin && seg.data.is_empty() && seg.offset == end)
            })
            .map(|(&k, _)| k)
            .collect();
        for key in keys {
            let seg = self.retransmission_buffer.remove(&key).expect("key observed");
            // Leading remainder survives the ack.
            if seg.offset < start {
                let keep = (start - seg.offset) as usize;
                self.retransmission_buffer.insert(
                    seg.offset,
                    SendSegment { offset: seg.offset, data: seg.data.slice(..keep), fin: false },
                );
            }
            // Trailing remainder likewise, keeping FIN on the tail.
            if seg.end() > end {
                let skip = (end - seg.offset) as usize;
                self.retransmission_buffer.insert(
                    end,
                    SendSegment { offset: end, data: seg.data.slice(skip..), fin: seg.fin },
                );
            }
        }
    }

    /// Whether every byte (and the FIN) has been acknowledged.
    pub fn all_delivered(&self) -> bool {
        match self.final_offset {
            // The FIN byte itself must be covered.
            Some(fin_at) => self.fin_sent && self.acked.covers(0, fin_at),
            None => false,
        }
    }

    /// Move a sent range into the loss buffer for retransmission.
    pub fn on_loss(&mut self, offset: StreamOffset, len: u64, fin: bool) {
        let end = offset + len;
        let keys: Vec<StreamOffset> = self
            .retransmission_buffer
            .range(..end.max(offset + 1))
            .filter(|(_, seg)| seg.end() > offset || (fin && seg.fin && seg.offset == offset))
            .map(|(&k, _)| k)
            .collect();
        for key in keys {
            let seg = self.retransmission_buffer.remove(&key).expect("key observed");
            self.insert_lost(seg);
        }
    }

    /// Insert into the loss buffer preserving order and merging runs.
    fn insert_lost(&mut self, seg: SendSegment) {
        // Skip anything already delivered.
        if !seg.data.is_empty() {
            let last = seg.end() - 1;
            if self.acked.covers(seg.offset, last) && !seg.fin {
                return;
            }
        }

        let pos = self
            .loss_buffer
            .iter()
            .position(|entry| entry.offset > seg.offset)
            .unwrap_or(self.loss_buffer.len());

        // Merge with the predecessor when contiguous.
        if pos > 0 {
            let prev = &mut self.loss_buffer[pos - 1];
            if prev.end() == seg.offset && !prev.fin {
                let mut merged = BytesMut::from(&prev.data[..]);
                merged.extend_from_slice(&seg.data);
                prev.data = merged.freeze();
                prev.fin = seg.fin;
                self.merge_forward(pos - 1);
                return;
            }
        }
        self.loss_buffer.insert(pos, seg);
        self.merge_forward(pos);
    }

    fn merge_forward(&mut self, pos: usize) {
        while pos + 1 < self.loss_buffer.len() {
            if self.loss_buffer[pos].end() == self.loss_buffer[pos + 1].offset
                && !self.loss_buffer[pos].fin
            {
                let next = self.loss_buffer.remove(pos + 1).expect("index checked");
                let entry = &mut self.loss_buffer[pos];
                let mut merged = BytesMut::from(&entry.data[..]);
                merged.extend_from_slice(&next.data);
                entry.data = merged.freeze();
                entry.fin = next.fin;
            } else {
                break;
            }
        }
    }

    fn remove_from_loss_buffer(&mut self, start: StreamOffset, end: StreamOffset) {
        let mut rebuilt: VecDeque<SendSegment> = VecDeque::new();
        for seg in self.loss_buffer.drain(..) {
            if seg.end() <= start || seg.offset >= end {
                rebuilt.push_back(seg);
                continue;
            }
            if seg.offset < start {
                let keep = (start - seg.offset) as usize;
                rebuilt.push_back(SendSegment {
                    offset: seg.offset,
                    data: seg.data.slice(..keep),
                    fin: false,
                });
            }
            if seg.end() > end {
                let skip = (end - seg.offset) as usize;
                rebuilt.push_back(SendSegment {
                    offset: end,
                    data: seg.data.slice(skip..),
                    fin: seg.fin,
                });
            }
        }
        self.loss_buffer = rebuilt;
    }

    /// Locally reset the stream (RESET_STREAM / RESET_STREAM_AT).
    ///
    /// The application error code is immutable once chosen; the only
    /// permitted change is upgrading a reliable reset to a plain one by
    /// clearing the reliable size.
    pub fn reset(&mut self, error_code: u64, reliable_size: Option<StreamOffset>) -> Result<()> {
        if self.state == SendState::Closed {
            return Err(QuicError::new(TransportErrorCode::StreamStateError, "reset after close"));
        }
        if let Some(existing) = self.reset {
            if existing.error_code != error_code {
                return Err(QuicError::new(
                    TransportErrorCode::StreamStateError,
                    "reset error code is immutable",
                ));
            }
            let upgrade = reliable_size.is_none()
                || (existing.reliable_size.is_some_and(|prev| reliable_size.unwrap() < prev));
            if !upgrade {
                return Ok(());
            }
        }

        // The final size reported to the peer is the highest offset that
        // was ever put on the wire.
        let reset = PendingReset { error_code, final_size: self.current_write_offset, reliable_size };
        self.reset = Some(reset);
        self.reset_needs_send = true;
        self.state = SendState::ResetSent;

        // Fresh data is abandoned; retransmittable data above the
        // reliable size is dropped too.
        self.write_buffer.clear();
        self.buffered_bytes = 0;
        let keep_below = reliable_size.unwrap_or(0);
        self.retransmission_buffer.retain(|&off, _| off < keep_below);
        for (_, seg) in self.retransmission_buffer.iter_mut() {
            if seg.end() > keep_below {
                let keep = (keep_below - seg.offset) as usize;
                seg.data = seg.data.slice(..keep);
                seg.fin = false;
            }
        }
        self.remove_from_loss_buffer_above(keep_below);
        Ok(())
    }

    fn remove_from_loss_buffer_above(&mut self, floor: StreamOffset) {
        let mut rebuilt: VecDeque<SendSegment> = VecDeque::new();
        for mut seg in self.loss_buffer.drain(..) {
            if seg.offset >= floor {
                continue;
            }
            if seg.end() > floor {
                let keep = (floor - seg.offset) as usize;
                seg.data = seg.data.slice(..keep);
                seg.fin = false;
            }
            rebuilt.push_back(seg);
        }
        self.loss_buffer = rebuilt;
    }

    /// Read back sent-but-unacked bytes covering `[offset, offset+len)`
    /// for probe cloning. Returns `None` unless the whole range is still
    /// held for retransmission.
    pub fn peek_range(&self, offset: StreamOffset, len: u64, fin: bool) -> Option<SendSegment> {
        if len == 0 {
            return self
                .retransmission_buffer
                .get(&offset)
                .filter(|s| s.data.is_empty() && (!fin || s.fin))
                .cloned();
        }
        let end = offset + len;
        let mut data = BytesMut::new();
        let mut fin_flag = false;
        let mut pos = offset;
        while pos < end {
            let (&seg_off, seg) = self.retransmission_buffer.range(..=pos).next_back()?;
            let seg_end = seg.end();
            if seg_end <= pos {
                return None; // gap: part of the range was acked meanwhile
            }
            let from = (pos - seg_off) as usize;
            let to = (seg_end.min(end) - seg_off) as usize;
            data.extend_from_slice(&seg.data[from..to]);
            if seg.fin && seg_end == end {
                fin_flag = true;
            }
            pos = seg_end.min(end);
        }
        Some(SendSegment { offset, data: data.freeze(), fin: fin_flag && fin })
    }

    /// The reset frame to emit, if one is owed.
    pub fn take_pending_reset(&mut self) -> Option<PendingReset> {
        if self.reset_needs_send {
            self.reset_needs_send = false;
            self.reset
        } else {
            None
        }
    }

    /// The reset frame was carried by a packet later declared lost.
    pub fn resend_reset(&mut self) {
        if self.state == SendState::ResetSent && !self.reset_acked {
            self.reset_needs_send = true;
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.state == SendState::Closed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn half_with(data: &'static [u8], fin: bool) -> SendHalf {
        let mut half = SendHalf::default();
        half.write(Bytes::from_static(data), fin).unwrap();
        half
    }

    #[test]
    fn fresh_data_respects_max_len_and_flow() {
        let mut half = half_with(b"hello world", false);
        let seg = half.dequeue_segment(5, 1000).unwrap();
        assert_eq!((seg.offset, &seg.data[..]), (0, &b"hello"[..]));
        // Flow limit caps the next pull.
        let seg = half.dequeue_segment(100, 3).unwrap();
        assert_eq!(&seg.data[..], b" wo");
        assert_eq!(half.current_write_offset(), 8);
    }

    #[test]
    fn fin_rides_last_segment() {
        let mut half = half_with(b"abc", true);
        let seg = half.dequeue_segment(100, 100).unwrap();
        assert!(seg.fin);
        assert!(!half.wants_to_send());
    }

    #[test]
    fn fin_only_segment_when_data_already_sent() {
        let mut half = half_with(b"abc", false);
        half.dequeue_segment(100, 100).unwrap();
        half.write(Bytes::new(), true).unwrap();
        let seg = half.dequeue_segment(100, 100).unwrap();
        assert_eq!((seg.offset, seg.data.len(), seg.fin), (3, 0, true));
    }

    #[test]
    fn write_after_fin_rejected() {
        let mut half = half_with(b"abc", true);
        assert!(half.write(Bytes::from_static(b"more"), false).is_err());
    }

    #[test]
    fn ack_completes_delivery_with_fin_byte() {
        let mut half = half_with(b"abcde", true);
        let seg = half.dequeue_segment(100, 100).unwrap();
        assert!(!half.on_ack(seg.offset, 4, false));
        // Covering the rest including the FIN byte finishes the stream.
        assert!(half.on_ack(4, 1, true));
        assert!(half.is_terminal());
    }

    #[test]
    fn partial_ack_splits_retransmission_entry() {
        let mut half = half_with(b"0123456789", false);
        half.dequeue_segment(100, 100).unwrap();
        half.on_ack(3, 4, false);
        // Loss of the full range must resend only the two remainders.
        half.on_loss(0, 10, false);
        let first = half.dequeue_segment(100, 100).unwrap();
        assert_eq!((first.offset, &first.data[..]), (0, &b"012"[..]));
        let second = half.dequeue_segment(100, 100).unwrap();
        assert_eq!((second.offset, &second.data[..]), (7, &b"789"[..]));
    }

    #[test]
    fn lost_segments_coalesce_and_drain_first() {
        let mut half = half_with(b"aaabbb", false);
        let s1 = half.dequeue_segment(3, 100).unwrap();
        let s2 = half.dequeue_segment(3, 100).unwrap();
        half.write(Bytes::from_static(b"ccc"), false).unwrap();
        half.on_loss(s1.offset, 3, false);
        half.on_loss(s2.offset, 3, false);
        // Both lost runs merge into one segment, sent before fresh data.
        let seg = half.dequeue_segment(100, 100).unwrap();
        assert_eq!((seg.offset, &seg.data[..]), (0, &b"aaabbb"[..]));
        let fresh = half.dequeue_segment(100, 100).unwrap();
        assert_eq!((fresh.offset, &fresh.data[..]), (6, &b"ccc"[..]));
    }

    #[test]
    fn retransmission_preserves_offset_and_fin() {
        let mut half = half_with(b"finale", true);
        let seg = half.dequeue_segment(100, 100).unwrap();
        assert!(seg.fin);
        half.on_loss(seg.offset, seg.data.len() as u64, true);
        let again = half.dequeue_segment(100, 100).unwrap();
        assert_eq!(again, seg);
    }

    #[test]
    fn split_lost_fin_keeps_fin_on_tail() {
        let mut half = half_with(b"0123456789", true);
        let seg = half.dequeue_segment(100, 100).unwrap();
        half.on_loss(seg.offset, seg.data.len() as u64, true);
        let head = half.dequeue_segment(4, 100).unwrap();
        assert!(!head.fin);
        let tail = half.dequeue_segment(100, 100).unwrap();
        assert_eq!(tail.offset, 4);
        assert!(tail.fin);
    }

    #[test]
    fn ack_of_lost_range_cancels_retransmission() {
        let mut half = half_with(b"0123456789", false);
        let seg = half.dequeue_segment(100, 100).unwrap();
        half.on_loss(seg.offset, 10, false);
        // A late ACK for the original transmission arrives.
        half.on_ack(0, 10, false);
        assert!(half.dequeue_segment(100, 100).is_none());
    }

    #[test]
    fn reset_error_code_immutable() {
        let mut half = half_with(b"abc", false);
        half.reset(7, None).unwrap();
        assert!(half.reset(8, None).is_err());
        assert_eq!(half.state(), SendState::ResetSent);
        let pending = half.take_pending_reset().unwrap();
        assert_eq!(pending.error_code, 7);
        assert!(half.take_pending_reset().is_none());
    }

    #[test]
    fn reliable_reset_upgrade_clears_reliable_size() {
        let mut half = half_with(b"0123456789", false);
        half.dequeue_segment(100, 100).unwrap();
        half.reset(7, Some(4)).unwrap();
        // Upgrading to a plain reset with the same code is allowed.
        half.reset(7, None).unwrap();
        let pending = half.take_pending_reset().unwrap();
        assert_eq!(pending.reliable_size, None);
    }

    #[test]
    fn reliable_reset_keeps_data_below_reliable_size() {
        let mut half = half_with(b"0123456789", false);
        let seg = half.dequeue_segment(100, 100).unwrap();
        half.on_loss(seg.offset, 10, false);
        half.reset(1, Some(4)).unwrap();
        // Only bytes below the reliable size survive for retransmission.
        let seg = half.dequeue_segment(100, 100).unwrap();
        assert_eq!((seg.offset, &seg.data[..]), (0, &b"0123"[..]));
        assert!(half.dequeue_segment(100, 100).is_none());
    }

    #[test]
    fn reset_ack_closes() {
        let mut half = half_with(b"abc", false);
        half.reset(1, None).unwrap();
        half.on_reset_acked();
        assert!(half.is_terminal());
    }
}
