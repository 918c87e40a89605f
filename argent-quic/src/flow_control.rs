//! Flow control windows (RFC 9000 Section 4).
//!
//! The same send/receive window pair serves both levels: per-stream
//! (MAX_STREAM_DATA / STREAM_DATA_BLOCKED) and per-connection
//! (MAX_DATA / DATA_BLOCKED). Stream-count limits use the same shape
//! over stream ordinals.

#![forbid(unsafe_code)]

use crate::error::{QuicError, Result};

/// Receive-side window: what we allow the peer to send.
///
/// The advertised limit slides forward by `window_size` whenever the
/// remaining headroom falls below half a window.
#[derive(Debug, Clone)]
pub struct RecvWindow {
    window_size: u64,
    advertised_max: u64,

    /// Bytes the application has consumed (or the receiver has discarded
    /// after a reset).
    consumed: u64,

    /// Highest offset the peer has used so far.
    highest_received: u64,

    /// An advertisement bumped the limit but no frame carried it yet.
    pending_update: bool,
}

impl RecvWindow {
    pub fn new(initial_max: u64) -> Self {
        Self {
            window_size: initial_max,
            advertised_max: initial_max,
            consumed: 0,
            highest_received: 0,
            pending_update: false,
        }
    }

    pub fn advertised_max(&self) -> u64 {
        self.advertised_max
    }

    pub fn highest_received(&self) -> u64 {
        self.highest_received
    }

    /// Account data extending up to `new_end`; rejects window violations.
    pub fn on_data(&mut self, new_end: u64) -> Result<()> {
        if new_end > self.advertised_max {
            return Err(QuicError::flow_control("peer exceeded advertised window"));
        }
        if new_end > self.highest_received {
            self.highest_received = new_end;
        }
        Ok(())
    }

    /// Account newly consumed bytes and grow the window when headroom
    /// drops below half.
    pub fn on_consumed(&mut self, n: u64) {
        self.consumed += n;
        if self.advertised_max - self.consumed < self.window_size / 2 {
            self.advertised_max = self.consumed + self.window_size;
            self.pending_update = true;
        }
    }

    /// The new limit to advertise, if an update frame is owed.
    pub fn take_pending_update(&mut self) -> Option<u64> {
        self.pending_update.then(|| {
            self.pending_update = false;
            self.advertised_max
        })
    }

    /// Re-arm the advertisement after the carrying packet was lost.
    pub fn resend_update(&mut self) {
        self.pending_update = true;
    }

    pub fn has_pending_update(&self) -> bool {
        self.pending_update
    }
}

/// Send-side window: what the peer allows us to send.
#[derive(Debug, Clone)]
pub struct SendWindow {
    peer_max: u64,

    /// Highest offset consumed against the limit.
    used: u64,

    /// Limit at which a BLOCKED frame was already emitted.
    blocked_sent_at: Option<u64>,
}

impl SendWindow {
    pub fn new(initial_peer_max: u64) -> Self {
        Self { peer_max: initial_peer_max, used: 0, blocked_sent_at: None }
    }

    pub fn available(&self) -> u64 {
        self.peer_max - self.used
    }

    pub fn used(&self) -> u64 {
        self.used
    }

    pub fn peer_max(&self) -> u64 {
        self.peer_max
    }

    /// Consume `n` bytes of credit.
    pub fn consume(&mut self, n: u64) -> Result<()> {
        if n > self.available() {
            return Err(QuicError::internal("send window overcommitted"));
        }
        self.used += n;
        Ok(())
    }

    /// Peer raised the limit; decreases are ignored (RFC 9000 Section 4.1).
    pub fn on_max(&mut self, new_max: u64) {
        if new_max > self.peer_max {
            self.peer_max = new_max;
            self.blocked_sent_at = None;
        }
    }

    /// The limit to report in a BLOCKED frame, once per limit value.
    pub fn blocked_frame_due(&mut self) -> Option<u64> {
        if self.available() == 0 && self.blocked_sent_at != Some(self.peer_max) {
            self.blocked_sent_at = Some(self.peer_max);
            Some(self.peer_max)
        } else {
            None
        }
    }
}

/// Per-direction stream-count window (MAX_STREAMS / STREAMS_BLOCKED).
#[derive(Debug, Clone)]
pub struct StreamCountWindow {
    window_size: u64,
    advertised_max: u64,
    closed: u64,
    opened_by_peer: u64,
    pending_update: bool,
}

impl StreamCountWindow {
    pub fn new(initial_max: u64) -> Self {
        Self {
            window_size: initial_max,
            advertised_max: initial_max,
            closed: 0,
            opened_by_peer: 0,
            pending_update: false,
        }
    }

    pub fn advertised_max(&self) -> u64 {
        self.advertised_max
    }

    /// Peer opened streams up to ordinal `count`; errors above the limit.
    pub fn on_peer_opened(&mut self, count: u64) -> Result<()> {
        if count > self.advertised_max {
            return Err(QuicError::new(
                crate::error::TransportErrorCode::StreamLimitError,
                "peer exceeded stream limit",
            ));
        }
        if count > self.opened_by_peer {
            self.opened_by_peer = count;
        }
        Ok(())
    }

    /// A peer-initiated stream fully closed; replenish the window when
    /// half of it is used up.
    pub fn on_stream_closed(&mut self) {
        self.closed += 1;
        if self.advertised_max - self.closed < self.window_size / 2 {
            self.advertised_max = self.closed + self.window_size;
            self.pending_update = true;
        }
    }

    pub fn take_pending_update(&mut self) -> Option<u64> {
        self.pending_update.then(|| {
            self.pending_update = false;
            self.advertised_max
        })
    }

    pub fn resend_update(&mut self) {
        self.pending_update = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recv_window_rejects_overflow() {
        let mut w = RecvWindow::new(100);
        w.on_data(100).unwrap();
        assert!(w.on_data(101).is_err());
    }

    #[test]
    fn recv_window_advances_at_half() {
        let mut w = RecvWindow::new(100);
        w.on_data(60).unwrap();
        w.on_consumed(40);
        // Headroom 100 - 40 = 60 >= 50: no update yet.
        assert!(w.take_pending_update().is_none());
        w.on_consumed(20);
        // Headroom 100 - 60 = 40 < 50: advertise consumed + window.
        assert_eq!(w.take_pending_update(), Some(160));
        assert!(w.take_pending_update().is_none());
    }

    #[test]
    fn send_window_consume_and_raise() {
        let mut w = SendWindow::new(50);
        w.consume(50).unwrap();
        assert_eq!(w.available(), 0);
        assert!(w.consume(1).is_err());
        w.on_max(80);
        assert_eq!(w.available(), 30);
        // Lowering is ignored.
        w.on_max(10);
        assert_eq!(w.peer_max(), 80);
    }

    #[test]
    fn blocked_frame_emitted_once_per_limit() {
        let mut w = SendWindow::new(10);
        w.consume(10).unwrap();
        assert_eq!(w.blocked_frame_due(), Some(10));
        assert_eq!(w.blocked_frame_due(), None);
        w.on_max(20);
        w.consume(10).unwrap();
        assert_eq!(w.blocked_frame_due(), Some(20));
    }

    #[test]
    fn stream_count_limit_enforced_and_replenished() {
        let mut w = StreamCountWindow::new(4);
        w.on_peer_opened(4).unwrap();
        assert!(w.on_peer_opened(5).is_err());
        w.on_stream_closed();
        w.on_stream_closed();
        w.on_stream_closed();
        // 4 - 3 = 1 < 2: replenish to closed + window = 7.
        assert_eq!(w.take_pending_update(), Some(7));
        w.on_peer_opened(5).unwrap();
    }
}
