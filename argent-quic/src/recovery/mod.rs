//! # Loss detection and recovery (RFC 9002)
//!
//! The outstanding-packet ledger per space, ACK processing with RTT
//! sampling, packet- and time-threshold loss declaration, spurious-loss
//! detection with adaptive reordering thresholds, PTO scheduling, and
//! the congestion controller seam.

#![forbid(unsafe_code)]

pub mod bbr2;
pub mod pacer;
pub mod rtt;

pub use rtt::RttEstimator;

use crate::crypto::EncryptionLevel;
use crate::error::{QuicError, Result, TransportErrorCode};
use crate::frames::AckFrame;
use crate::packet::PacketNumberSpace;
use crate::types::{Instant, PacketNumber, StreamId};
use core::time::Duration;
use smallvec::SmallVec;
use std::collections::HashSet;
use std::collections::VecDeque;

/// Default packet reordering threshold (RFC 9002 `kPacketThreshold`).
pub const PACKET_REORDERING_THRESHOLD: u64 = 3;

/// Probes scheduled per PTO expiration.
pub const PROBES_PER_PTO: usize = 2;

// ============================================================================
// Bandwidth
// ============================================================================

/// Bytes-per-second rate used by the controller and the pacer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct Bandwidth {
    bytes_per_second: u64,
}

impl Bandwidth {
    pub const ZERO: Bandwidth = Bandwidth { bytes_per_second: 0 };

    pub fn from_bytes_per_second(bytes_per_second: u64) -> Self {
        Self { bytes_per_second }
    }

    /// Rate observed when `bytes` were delivered over `interval`.
    pub fn from_delivery(bytes: u64, interval: Duration) -> Self {
        if interval.is_zero() {
            return Bandwidth::ZERO;
        }
        Self {
            bytes_per_second: ((bytes as u128 * 1_000_000_000) / interval.as_nanos().max(1)) as u64,
        }
    }

    pub fn bytes_per_second(&self) -> u64 {
        self.bytes_per_second
    }

    /// Bytes transferable in `d` at this rate.
    pub fn bytes_in(&self, d: Duration) -> u64 {
        ((self.bytes_per_second as u128 * d.as_nanos()) / 1_000_000_000) as u64
    }

    pub fn scale(&self, gain: f64) -> Bandwidth {
        Bandwidth { bytes_per_second: (self.bytes_per_second as f64 * gain) as u64 }
    }

    /// Time to transfer `bytes` at this rate.
    pub fn transfer_time(&self, bytes: u64) -> Duration {
        if self.bytes_per_second == 0 {
            return Duration::ZERO;
        }
        Duration::from_nanos(((bytes as u128 * 1_000_000_000) / self.bytes_per_second as u128) as u64)
    }
}

// ============================================================================
// Outstanding packets
// ============================================================================

/// Lightweight descriptor of a frame in a sent packet; enough to replay
/// its effect on loss or settle it on ack, never the payload itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SentFrame {
    Ack { largest_acked: PacketNumber },
    Stream { id: StreamId, offset: u64, len: u64, fin: bool },
    Crypto { level: EncryptionLevel, offset: u64, len: u64 },
    ResetStream { id: StreamId },
    StopSending { id: StreamId, error_code: u64 },
    MaxData { maximum: u64 },
    MaxStreamData { id: StreamId, maximum: u64 },
    MaxStreamsBidi { maximum: u64 },
    MaxStreamsUni { maximum: u64 },
    NewConnectionId { sequence: u64 },
    RetireConnectionId { sequence: u64 },
    PathChallenge { data: [u8; 8] },
    PathResponse { data: [u8; 8] },
    HandshakeDone,
    Ping,
    NewToken,
    Datagram { len: u64 },
    AckFrequency { sequence: u64 },
    ImmediateAck,
    Knob { knob_space: u64, id: u64 },
    DataBlocked,
    StreamDataBlocked { id: StreamId },
    StreamsBlockedBidi,
    StreamsBlockedUni,
}

/// Tag shared by an original packet and its PTO clones so that delivery
/// is counted once no matter which copy is acknowledged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClonedPacketIdentifier {
    pub space: PacketNumberSpace,
    pub first_packet_number: PacketNumber,
}

/// Ledger entry for a sent ack-eliciting packet.
#[derive(Debug, Clone)]
pub struct OutstandingPacket {
    pub packet_number: PacketNumber,
    pub space: PacketNumberSpace,
    pub sent_time: Instant,
    pub size: u64,
    pub ack_eliciting: bool,

    /// Counts toward bytes in flight.
    pub in_flight: bool,

    /// The scheduler had cwnd headroom but no data when this was sent.
    pub app_limited: bool,

    pub frames: SmallVec<[SentFrame; 4]>,

    /// Set on the original and every clone of a probe family.
    pub clone_id: Option<ClonedPacketIdentifier>,

    pub declared_lost: bool,

    // Delivery-rate snapshot (rate sampling), filled on send.
    pub delivered_at_send: u64,
    pub delivered_time_at_send: Instant,
    pub first_sent_time: Instant,
    pub inflight_at_send: u64,
    pub lost_at_send: u64,
}

impl OutstandingPacket {
    pub fn new(
        packet_number: PacketNumber,
        space: PacketNumberSpace,
        sent_time: Instant,
        size: u64,
        ack_eliciting: bool,
        frames: SmallVec<[SentFrame; 4]>,
    ) -> Self {
        Self {
            packet_number,
            space,
            sent_time,
            size,
            ack_eliciting,
            in_flight: ack_eliciting,
            app_limited: false,
            frames,
            clone_id: None,
            declared_lost: false,
            delivered_at_send: 0,
            delivered_time_at_send: sent_time,
            first_sent_time: sent_time,
            inflight_at_send: 0,
            lost_at_send: 0,
        }
    }
}

// ============================================================================
// Congestion controller seam
// ============================================================================

/// Everything a controller needs from one ACK (or loss) processing pass.
pub struct CongestionSignal<'a> {
    pub now: Instant,
    pub acked: &'a [OutstandingPacket],
    pub lost: &'a [OutstandingPacket],

    /// Bytes in flight before this pass removed acked/lost packets.
    pub prior_inflight: u64,
    pub inflight: u64,

    /// Aggregate delivered counter after this pass.
    pub delivered_bytes: u64,
    pub delivered_time: Instant,

    pub rtt: &'a RttEstimator,

    /// Whether this pass contained at least one loss event.
    pub has_loss: bool,

    /// All packets in the persistent-congestion window were lost.
    pub persistent_congestion: bool,
}

/// Pluggable congestion controller (spec: opaque `CongestionState`).
pub trait CongestionController: Send {
    fn on_packet_sent(&mut self, packet: &OutstandingPacket, inflight: u64, now: Instant);

    fn on_ack_or_loss(&mut self, signal: &CongestionSignal<'_>);

    /// Bytes the connection may put in flight right now.
    fn writable_bytes(&self, inflight: u64) -> u64;

    fn congestion_window(&self) -> u64;

    fn pacing_rate(&self) -> Bandwidth;

    fn bandwidth_estimate(&self) -> Option<Bandwidth>;

    fn is_app_limited(&self) -> bool;

    /// The sender drained its data with window to spare.
    fn set_app_limited(&mut self);
}

// ============================================================================
// Per-space ledger
// ============================================================================

#[derive(Debug, Default)]
struct SpaceLedger {
    /// Strictly increasing packet numbers.
    sent: VecDeque<OutstandingPacket>,
    largest_acked: Option<PacketNumber>,
    largest_sent: Option<PacketNumber>,
    loss_time: Option<Instant>,
    last_ack_eliciting_sent: Option<Instant>,
    ack_eliciting_outstanding: usize,
}

/// Result of one ACK frame application.
#[derive(Debug)]
pub struct AckOutcome {
    pub newly_acked: Vec<OutstandingPacket>,
    pub newly_lost: Vec<OutstandingPacket>,
    pub rtt_sample: Option<Duration>,

    /// Packets previously declared lost that turned out delivered.
    pub spurious: Vec<PacketNumber>,

    /// Largest packet number newly acknowledged by this frame.
    pub largest_newly_acked: Option<PacketNumber>,
}

/// What a fired loss-detection timer asks the connection to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerVerdict {
    /// Nothing due (stale timer; idempotent no-op).
    None,

    /// Losses were declared; retransmit via the frame replay path.
    LossesDeclared,

    /// Send up to `probes` ack-eliciting probes in `space`.
    SendProbes { space: PacketNumberSpace, probes: usize },
}

// ============================================================================
// Recovery
// ============================================================================

pub struct Recovery {
    spaces: [SpaceLedger; 3],
    rtt: RttEstimator,
    max_ack_delay: Duration,

    pto_count: u32,
    bytes_in_flight: u64,
    total_bytes_sent: u64,
    total_bytes_acked: u64,

    reordering_threshold: u64,
    adaptive_reordering: bool,

    /// Scale the packet threshold with half the outstanding count.
    inflight_reordering: bool,

    /// Clone families whose delivery effects already ran.
    delivered_clones: HashSet<ClonedPacketIdentifier>,

    // Rate-sampling aggregates.
    delivered_bytes: u64,
    delivered_time: Option<Instant>,
    first_sent_time: Option<Instant>,
    lost_bytes_total: u64,

    /// Rate samples are app-limited until `delivered_bytes` passes this.
    app_limited_until: u64,
}

impl Recovery {
    pub fn new(
        initial_rtt: Duration,
        max_ack_delay: Duration,
        adaptive_reordering: bool,
        inflight_reordering: bool,
    ) -> Self {
        Self {
            spaces: Default::default(),
            rtt: RttEstimator::new(initial_rtt),
            max_ack_delay,
            pto_count: 0,
            bytes_in_flight: 0,
            total_bytes_sent: 0,
            total_bytes_acked: 0,
            reordering_threshold: PACKET_REORDERING_THRESHOLD,
            adaptive_reordering,
            inflight_reordering,
            delivered_clones: HashSet::new(),
            delivered_bytes: 0,
            delivered_time: None,
            first_sent_time: None,
            lost_bytes_total: 0,
            app_limited_until: 0,
        }
    }

    pub fn rtt(&self) -> &RttEstimator {
        self.rtt_estimator()
    }

    pub fn rtt_estimator(&self) -> &RttEstimator {
        &self.rtt
    }

    pub fn bytes_in_flight(&self) -> u64 {
        self.bytes_in_flight
    }

    pub fn total_bytes_sent(&self) -> u64 {
        self.total_bytes_sent
    }

    pub fn total_bytes_acked(&self) -> u64 {
        self.total_bytes_acked
    }

    pub fn delivered_bytes(&self) -> u64 {
        self.delivered_bytes
    }

    pub fn pto_count(&self) -> u32 {
        self.pto_count
    }

    pub fn reordering_threshold(&self) -> u64 {
        self.reordering_threshold
    }

    pub fn largest_acked(&self, space: PacketNumberSpace) -> Option<PacketNumber> {
        self.spaces[space.index()].largest_acked
    }

    pub fn has_outstanding(&self, space: PacketNumberSpace) -> bool {
        self.spaces[space.index()].ack_eliciting_outstanding > 0
    }

    /// Earliest space with ack-eliciting data outstanding.
    pub fn earliest_outstanding_space(&self) -> Option<PacketNumberSpace> {
        PacketNumberSpace::ALL
            .into_iter()
            .find(|s| self.has_outstanding(*s))
    }

    /// Record a sent packet; numbers must be strictly increasing per
    /// space.
    pub fn on_packet_sent(&mut self, mut packet: OutstandingPacket, app_limited: bool) {
        let ledger = &mut self.spaces[packet.space.index()];
        debug_assert!(ledger.largest_sent.is_none_or(|l| packet.packet_number > l));
        ledger.largest_sent = Some(packet.packet_number);

        packet.delivered_at_send = self.delivered_bytes;
        packet.delivered_time_at_send = self.delivered_time.unwrap_or(packet.sent_time);
        packet.first_sent_time = self.first_sent_time.unwrap_or(packet.sent_time);
        packet.inflight_at_send = self.bytes_in_flight;
        packet.lost_at_send = self.lost_bytes_total;
        packet.app_limited = app_limited || self.delivered_bytes < self.app_limited_until;

        if self.first_sent_time.is_none() {
            self.first_sent_time = Some(packet.sent_time);
        }

        self.total_bytes_sent += packet.size;
        if packet.in_flight {
            self.bytes_in_flight += packet.size;
            ledger.ack_eliciting_outstanding += 1;
            ledger.last_ack_eliciting_sent = Some(packet.sent_time);
        }
        ledger.sent.push_back(packet);
    }

    /// Mark the sender app-limited: rate samples stay tainted until
    /// everything currently in flight is delivered.
    pub fn mark_app_limited(&mut self) {
        self.app_limited_until = self.delivered_bytes + self.bytes_in_flight;
    }

    pub fn is_app_limited(&self) -> bool {
        self.delivered_bytes < self.app_limited_until
    }

    /// Apply an ACK frame to a space's ledger.
    pub fn on_ack_received(
        &mut self,
        space: PacketNumberSpace,
        ack: &AckFrame,
        now: Instant,
    ) -> Result<AckOutcome> {
        let ledger = &mut self.spaces[space.index()];

        if ledger.largest_sent.is_none_or(|l| ack.largest_acked > l) {
            return Err(QuicError::with_frame_type(
                TransportErrorCode::ProtocolViolation,
                crate::frames::FRAME_ACK,
                "ack for a packet never sent",
            ));
        }

        let mut newly_acked: Vec<OutstandingPacket> = Vec::new();
        let mut spurious: Vec<PacketNumber> = Vec::new();

        // Split out acked entries; the ledger is pn-sorted so one pass
        // suffices even with out-of-order ACK ranges.
        let mut remaining: VecDeque<OutstandingPacket> = VecDeque::with_capacity(ledger.sent.len());
        for packet in ledger.sent.drain(..) {
            if ack.acks(packet.packet_number) {
                if packet.declared_lost {
                    spurious.push(packet.packet_number);
                    continue;
                }
                newly_acked.push(packet);
            } else {
                remaining.push_back(packet);
            }
        }
        ledger.sent = remaining;

        if newly_acked.is_empty() && spurious.is_empty() {
            return Ok(AckOutcome {
                newly_acked,
                newly_lost: Vec::new(),
                rtt_sample: None,
                spurious,
                largest_newly_acked: None,
            });
        }

        let largest_newly_acked = newly_acked.iter().map(|p| p.packet_number).max();

        // RTT sample from the largest newly acked, if it is the frame's
        // largest and was ack-eliciting (RFC 9002 Section 5.1).
        let mut rtt_sample = None;
        if let Some(largest) = largest_newly_acked {
            if largest == ack.largest_acked {
                if let Some(pkt) = newly_acked.iter().find(|p| p.packet_number == largest) {
                    if pkt.ack_eliciting {
                        let sample = now.saturating_duration_since(pkt.sent_time);
                        self.rtt.update(sample, ack.ack_delay);
                        rtt_sample = Some(sample);
                    }
                }
            }
        }

        if ledger.largest_acked.is_none_or(|l| ack.largest_acked > l) {
            ledger.largest_acked = Some(ack.largest_acked);
        }

        // Settle counters for delivered packets.
        for packet in &newly_acked {
            if packet.in_flight {
                self.bytes_in_flight = self.bytes_in_flight.saturating_sub(packet.size);
                self.spaces[space.index()].ack_eliciting_outstanding = self.spaces[space.index()]
                    .ack_eliciting_outstanding
                    .saturating_sub(1);
            }
            self.total_bytes_acked += packet.size;
            self.delivered_bytes += packet.size;
        }
        self.delivered_time = Some(now);

        if !spurious.is_empty() {
            self.on_spurious_loss(&spurious);
        }

        let newly_lost = self.detect_lost_packets(space, now);

        // Forward progress resets the PTO backoff.
        self.pto_count = 0;

        Ok(AckOutcome { newly_acked, newly_lost, rtt_sample, spurious, largest_newly_acked })
    }

    fn on_spurious_loss(&mut self, packets: &[PacketNumber]) {
        tracing::debug!(count = packets.len(), "spurious loss detected");
        if self.adaptive_reordering {
            // Each spurious event widens the reordering tolerance.
            self.reordering_threshold = (self.reordering_threshold + 1).min(64);
        }
    }

    /// Declare losses in `space`: packet threshold or time threshold
    /// (RFC 9002 Section 6.1). Re-arms the loss timer as a side effect.
    pub fn detect_lost_packets(&mut self, space: PacketNumberSpace, now: Instant) -> Vec<OutstandingPacket> {
        let loss_delay = self.rtt.loss_delay();
        let mut threshold = self.reordering_threshold;
        if self.inflight_reordering {
            // Tolerate more reordering on fat pipes: half the packets
            // currently outstanding in this space.
            let outstanding = self.spaces[space.index()].ack_eliciting_outstanding as u64;
            threshold = threshold.max(outstanding / 2);
        }
        let ledger = &mut self.spaces[space.index()];
        let Some(largest_acked) = ledger.largest_acked else {
            return Vec::new();
        };

        let mut lost = Vec::new();
        let mut loss_time: Option<Instant> = None;

        for packet in ledger.sent.iter_mut() {
            if packet.packet_number >= largest_acked || packet.declared_lost {
                continue;
            }
            let by_count = largest_acked - packet.packet_number >= threshold;
            let deadline = packet.sent_time + loss_delay;
            let by_time = deadline <= now;
            if by_count || by_time {
                packet.declared_lost = true;
                lost.push(packet.clone());
            } else {
                loss_time = Some(loss_time.map_or(deadline, |t| t.min(deadline)));
            }
        }
        ledger.loss_time = loss_time;

        for packet in &lost {
            if packet.in_flight {
                self.bytes_in_flight = self.bytes_in_flight.saturating_sub(packet.size);
                self.spaces[space.index()].ack_eliciting_outstanding = self.spaces[space.index()]
                    .ack_eliciting_outstanding
                    .saturating_sub(1);
            }
            self.lost_bytes_total += packet.size;
        }
        if !lost.is_empty() {
            tracing::debug!(space = ?space, count = lost.len(), "packets declared lost");
        }
        lost
    }

    /// All packets sent within `3 * PTO` around the lost range were lost
    /// (RFC 9002 Section 7.6). Evaluated over a loss batch.
    pub fn is_persistent_congestion(&self, lost: &[OutstandingPacket]) -> bool {
        if lost.len() < 2 || !self.rtt.has_sample() {
            return false;
        }
        let window = self.rtt.pto_base(self.max_ack_delay) * 3;
        let first = lost.iter().map(|p| p.sent_time).min().expect("non-empty");
        let last = lost.iter().map(|p| p.sent_time).max().expect("non-empty");
        last.saturating_duration_since(first) >= window
    }

    // ========================================================================
    // Timers
    // ========================================================================

    /// Next loss-detection deadline: the earliest per-space loss time, or
    /// failing that the PTO (RFC 9002 Section 6.2.1).
    pub fn timer_deadline(&self) -> Option<Instant> {
        let loss = self
            .spaces
            .iter()
            .filter_map(|l| l.loss_time)
            .min();
        if loss.is_some() {
            return loss;
        }

        let space = self.earliest_outstanding_space()?;
        let base = self.spaces[space.index()].last_ack_eliciting_sent?;
        // The ack-delay allowance only applies to the application space.
        let mad = if space == PacketNumberSpace::AppData {
            self.max_ack_delay
        } else {
            Duration::ZERO
        };
        Some(base + self.rtt.pto(mad, self.pto_count))
    }

    /// Handle a loss-detection timer expiration; idempotent when stale.
    pub fn on_timer(&mut self, now: Instant) -> TimerVerdict {
        // A pending loss time takes precedence over PTO.
        if let Some(space) = self
            .spaces
            .iter()
            .position(|l| l.loss_time.is_some_and(|t| t <= now))
            .map(|i| PacketNumberSpace::ALL[i])
        {
            let lost = self.detect_lost_packets(space, now);
            if !lost.is_empty() {
                // Losses are handed back through detect_lost_packets on
                // the connection's next processing pass.
                return TimerVerdict::LossesDeclared;
            }
            return TimerVerdict::None;
        }

        let Some(space) = self.earliest_outstanding_space() else {
            return TimerVerdict::None;
        };
        self.pto_count += 1;
        tracing::debug!(?space, pto_count = self.pto_count, "PTO fired");
        TimerVerdict::SendProbes { space, probes: PROBES_PER_PTO }
    }

    // ========================================================================
    // Clones
    // ========================================================================

    /// Register delivery of a clone family; returns `true` the first
    /// time, `false` for every sibling ack after it.
    pub fn register_clone_delivery(&mut self, id: ClonedPacketIdentifier) -> bool {
        self.delivered_clones.insert(id)
    }

    pub fn clone_already_delivered(&self, id: &ClonedPacketIdentifier) -> bool {
        self.delivered_clones.contains(id)
    }

    /// Outstanding packets of a space eligible for probe cloning, newest
    /// first.
    pub fn clone_candidates(&mut self, space: PacketNumberSpace, count: usize) -> Vec<OutstandingPacket> {
        let delivered = &self.delivered_clones;
        let mut out = Vec::new();
        for packet in self.spaces[space.index()].sent.iter_mut().rev() {
            if out.len() >= count {
                break;
            }
            if !packet.ack_eliciting || packet.declared_lost {
                continue;
            }
            if packet.clone_id.as_ref().is_some_and(|id| delivered.contains(id)) {
                continue;
            }
            // Tag the original so an ack of either copy settles both.
            let id = packet.clone_id.unwrap_or(ClonedPacketIdentifier {
                space,
                first_packet_number: packet.packet_number,
            });
            packet.clone_id = Some(id);
            out.push(packet.clone());
        }
        out
    }

    /// Drop a space's ledger when its keys are discarded.
    pub fn discard_space(&mut self, space: PacketNumberSpace) {
        let ledger = &mut self.spaces[space.index()];
        for packet in ledger.sent.drain(..) {
            if packet.in_flight {
                self.bytes_in_flight = self.bytes_in_flight.saturating_sub(packet.size);
            }
        }
        *ledger = SpaceLedger::default();
        tracing::debug!(?space, "packet number space discarded");
    }
}
