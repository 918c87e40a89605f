//! Observer and event-log plumbing.
//!
//! Internal subsystems report sent/acked/lost/spurious packet events and
//! state changes through [`TransportObserver`]; embedders that want a
//! qlog-style structured trace install an [`EventLogger`].

#![forbid(unsafe_code)]

use crate::crypto::KeyPhase;
use crate::packet::PacketNumberSpace;
use crate::types::{Instant, PacketNumber, StreamId};
use core::time::Duration;

/// Passive observer of transport internals; all methods default to
/// no-ops so implementors pick what they care about.
pub trait TransportObserver: Send {
    fn on_packet_sent(
        &mut self,
        _space: PacketNumberSpace,
        _pn: PacketNumber,
        _size: u64,
        _ack_eliciting: bool,
    ) {
    }

    fn on_packets_acked(&mut self, _space: PacketNumberSpace, _pns: &[PacketNumber]) {}

    fn on_packets_lost(&mut self, _space: PacketNumberSpace, _pns: &[PacketNumber]) {}

    /// A packet declared lost was later acknowledged.
    fn on_spurious_loss(&mut self, _space: PacketNumberSpace, _pns: &[PacketNumber]) {}

    fn on_key_update(&mut self, _phase: KeyPhase) {}

    /// Peer delivered a transport knob.
    fn on_knob(&mut self, _knob_space: u64, _id: u64, _blob: &[u8]) {}

    fn on_stream_opened(&mut self, _id: StreamId) {}

    fn on_stream_closed(&mut self, _id: StreamId) {}
}

/// No-op observer for embedders that install none.
pub struct NullObserver;

impl TransportObserver for NullObserver {}

/// Structured events for an external qlog-style sink.
#[derive(Debug, Clone)]
pub enum LogEvent {
    PacketSent {
        space: PacketNumberSpace,
        pn: PacketNumber,
        size: u64,
        at: Instant,
    },
    PacketReceived {
        space: PacketNumberSpace,
        pn: PacketNumber,
        size: u64,
        at: Instant,
    },
    PacketLost {
        space: PacketNumberSpace,
        pn: PacketNumber,
    },
    MetricsUpdated {
        cwnd: u64,
        bytes_in_flight: u64,
        srtt: Duration,
        pacing_rate_bps: u64,
    },
    KeyPhaseUpdated {
        phase: KeyPhase,
    },
    ConnectionStateUpdated {
        state: &'static str,
    },
}

/// Optional structured sink (spec: `EventLogger`).
pub trait EventLogger: Send {
    fn log_event(&mut self, event: LogEvent);
}
