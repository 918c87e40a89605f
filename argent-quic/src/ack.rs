//! # ACK engine (RFC 9000 Section 13.2, draft-ietf-quic-ack-frequency)
//!
//! One [`AckTracker`] per packet number space: the received-range set,
//! the immediate-vs-delayed decision, ACK frame construction, and the
//! peer-driven ACK frequency policy.

#![forbid(unsafe_code)]

use crate::error::{QuicError, Result, TransportErrorCode};
use crate::frames::{AckBlock, AckFrame, AckFrequencyFrame, EcnCounts};
use crate::range_set::RangeSet;
use crate::settings::AckFrequencyPolicy;
use crate::types::{Instant, PacketNumber};
use core::time::Duration;
use tinyvec::TinyVec;

/// ECN codepoint observed on a received datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Ecn {
    #[default]
    NotEct,
    Ect0,
    Ect1,
    Ce,
}

impl Ecn {
    /// Decode the two ECN bits of an IP TOS byte.
    pub fn from_tos(tos: u8) -> Self {
        match tos & 0x03 {
            0b01 => Ecn::Ect1,
            0b10 => Ecn::Ect0,
            0b11 => Ecn::Ce,
            _ => Ecn::NotEct,
        }
    }
}

/// Outcome of recording a received packet number.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceivedDisposition {
    /// Already in the range set; the caller drops the packet silently.
    Duplicate,
    New,
}

/// Per-space receive-side ACK state.
#[derive(Debug)]
pub struct AckTracker {
    ranges: RangeSet,
    largest_received: Option<PacketNumber>,
    largest_received_time: Option<Instant>,

    needs_immediate_ack: bool,
    ack_eliciting_outstanding: u64,
    delayed_deadline: Option<Instant>,

    /// Largest packet number carried in an ACK we already sent.
    largest_acked_scheduled: Option<PacketNumber>,

    ecn_counts: EcnCounts,

    /// Current policy; peer ACK_FREQUENCY frames override the local one.
    ack_eliciting_threshold: u64,
    reordering_threshold: u64,
    min_rtt_divisor: u32,
    max_ack_delay: Duration,

    /// Highest ACK_FREQUENCY sequence applied (out-of-order frames lose).
    ack_frequency_sequence: Option<u64>,
}

impl AckTracker {
    pub fn new(policy: AckFrequencyPolicy, max_ack_delay: Duration) -> Self {
        Self {
            ranges: RangeSet::new(),
            largest_received: None,
            largest_received_time: None,
            needs_immediate_ack: false,
            ack_eliciting_outstanding: 0,
            delayed_deadline: None,
            largest_acked_scheduled: None,
            ecn_counts: EcnCounts::default(),
            ack_eliciting_threshold: policy.ack_eliciting_threshold,
            reordering_threshold: policy.reordering_threshold.max(1),
            min_rtt_divisor: policy.min_rtt_divisor.max(1),
            max_ack_delay,
            ack_frequency_sequence: None,
        }
    }

    pub fn largest_received(&self) -> Option<PacketNumber> {
        self.largest_received
    }

    pub fn has_unacked_data(&self) -> bool {
        self.ack_eliciting_outstanding > 0 || self.needs_immediate_ack
    }

    /// Record an incoming packet and decide the ACK posture.
    ///
    /// `srtt` feeds the delayed-ACK deadline; `None` before the first RTT
    /// sample falls back to `max_ack_delay` alone.
    pub fn on_packet_received(
        &mut self,
        pn: PacketNumber,
        now: Instant,
        ack_eliciting: bool,
        ecn: Ecn,
        srtt: Option<Duration>,
    ) -> ReceivedDisposition {
        if self.ranges.contains(pn) {
            return ReceivedDisposition::Duplicate;
        }

        let expected = self.largest_received.map_or(0, |l| l + 1);
        self.ranges.insert_one(pn);

        if self.largest_received.is_none_or(|l| pn > l) {
            self.largest_received = Some(pn);
            self.largest_received_time = Some(now);
        }

        match ecn {
            Ecn::NotEct => {}
            Ecn::Ect0 => self.ecn_counts.ect0 += 1,
            Ecn::Ect1 => self.ecn_counts.ect1 += 1,
            Ecn::Ce => {
                self.ecn_counts.ce += 1;
                self.needs_immediate_ack = true;
            }
        }

        if !ack_eliciting {
            return ReceivedDisposition::New;
        }
        self.ack_eliciting_outstanding += 1;

        // Reordering beyond the threshold forces an immediate ACK so the
        // sender's loss detection sees the gap quickly.
        let distance = if pn >= expected { pn - expected } else { expected - pn };
        if distance >= self.reordering_threshold {
            self.needs_immediate_ack = true;
        }

        if self.ack_eliciting_outstanding >= self.ack_eliciting_threshold {
            self.needs_immediate_ack = true;
        }

        if !self.needs_immediate_ack && self.delayed_deadline.is_none() {
            let delay = match srtt {
                Some(srtt) => self.max_ack_delay.min(srtt / self.min_rtt_divisor),
                None => self.max_ack_delay,
            };
            self.delayed_deadline = Some(now + delay);
        }

        ReceivedDisposition::New
    }

    /// Peer requested an immediate acknowledgment.
    pub fn on_immediate_ack(&mut self) {
        if !self.ranges.is_empty() {
            self.needs_immediate_ack = true;
        }
    }

    /// Apply a peer ACK_FREQUENCY frame; stale sequences are ignored.
    pub fn on_ack_frequency(&mut self, frame: &AckFrequencyFrame) -> Result<()> {
        if frame.ack_eliciting_threshold == 0 {
            return Err(QuicError::new(
                TransportErrorCode::ProtocolViolation,
                "ack-eliciting threshold of zero",
            ));
        }
        if self.ack_frequency_sequence.is_some_and(|seq| frame.sequence <= seq) {
            return Ok(());
        }
        self.ack_frequency_sequence = Some(frame.sequence);
        self.ack_eliciting_threshold = frame.ack_eliciting_threshold;
        self.reordering_threshold = frame.reordering_threshold.max(1);
        self.max_ack_delay = frame.requested_max_ack_delay;
        tracing::trace!(
            seq = frame.sequence,
            threshold = frame.ack_eliciting_threshold,
            "ack frequency updated by peer"
        );
        Ok(())
    }

    /// Whether an ACK should go out right now.
    pub fn should_ack_now(&self, now: Instant) -> bool {
        if self.needs_immediate_ack {
            return true;
        }
        self.delayed_deadline.is_some_and(|d| d <= now)
    }

    /// When the delayed-ACK timer should fire; `None` when nothing is
    /// pending.
    pub fn ack_deadline(&self) -> Option<Instant> {
        if self.needs_immediate_ack {
            // Fire as soon as the write loop runs.
            return Some(Instant::ZERO);
        }
        self.delayed_deadline
    }

    /// Whether an ACK frame could be built at all.
    pub fn can_build_ack(&self) -> bool {
        !self.ranges.is_empty() && self.ack_eliciting_outstanding > 0
    }

    /// Build an ACK frame and reset the scheduling state.
    ///
    /// `ecn_enabled` controls whether counters ride along as ACK_ECN.
    pub fn build_ack(&mut self, now: Instant, ecn_enabled: bool) -> Option<AckFrame> {
        let largest = self.ranges.max()?;
        let delay = self
            .largest_received_time
            .map(|t| now.saturating_duration_since(t))
            .unwrap_or(Duration::ZERO)
            .min(self.max_ack_delay);

        let mut blocks: TinyVec<[AckBlock; 8]> = TinyVec::new();
        for interval in self.ranges.iter_descending() {
            blocks.push(AckBlock { start: interval.start, end: interval.end });
        }

        self.largest_acked_scheduled = Some(largest);
        self.needs_immediate_ack = false;
        self.ack_eliciting_outstanding = 0;
        self.delayed_deadline = None;

        Some(AckFrame {
            largest_acked: largest,
            ack_delay: delay,
            blocks,
            ecn: (ecn_enabled
                && (self.ecn_counts.ect0 | self.ecn_counts.ect1 | self.ecn_counts.ce) != 0)
                .then_some(self.ecn_counts),
        })
    }

    /// The peer acknowledged an ACK of ours whose largest was `largest`;
    /// ranges below it no longer need reporting (bounds memory).
    pub fn on_ack_of_ack(&mut self, largest: PacketNumber) {
        self.ranges.prune_below(largest);
    }

    /// Number of tracked intervals (test and introspection hook).
    pub fn interval_count(&self) -> usize {
        self.ranges.interval_count()
    }
}
