//! Transport configuration and negotiated parameters.
//!
//! [`TransportSettings`] is the locally configured behavior of the core;
//! [`TransportParameters`] is the subset negotiated with the peer during
//! the handshake. Loading settings from files or CLI flags is the
//! embedder's job; the core only consumes the validated struct.

use core::time::Duration;
use serde::{Deserialize, Serialize};

/// ACK scheduling policy knobs (draft-ietf-quic-ack-frequency semantics).
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct AckFrequencyPolicy {
    /// Send an ACK after this many ack-eliciting packets.
    pub ack_eliciting_threshold: u64,

    /// Out-of-order distance that forces an immediate ACK.
    pub reordering_threshold: u64,

    /// Delayed-ACK deadline is `min(max_ack_delay, srtt / min_rtt_divisor)`.
    pub min_rtt_divisor: u32,

    /// Ack every other packet while the peer is likely in slow start.
    pub use_small_threshold_during_startup: bool,
}

impl Default for AckFrequencyPolicy {
    fn default() -> Self {
        Self {
            ack_eliciting_threshold: 10,
            reordering_threshold: 1,
            min_rtt_divisor: 4,
            use_small_threshold_during_startup: true,
        }
    }
}

/// Default priority applied to newly created streams.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamPriority {
    /// Urgency level, 0 (highest) through 7 (lowest).
    pub level: u8,

    /// Round-robin within the level instead of strict stream-id order.
    pub incremental: bool,
}

impl Default for StreamPriority {
    fn default() -> Self {
        Self { level: 3, incremental: true }
    }
}

/// Locally configured transport behavior.
///
/// Field groups mirror the subsystems they feed: flow control bootstraps,
/// ACK policy, CID quota, congestion/pacing, the write loop, and key
/// rotation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportSettings {
    /// Close the connection after this long without activity.
    pub idle_timeout: Duration,

    /// Clamp on outgoing UDP payload size.
    pub max_udp_payload_size: usize,

    /// Connection-level receive window bootstrap.
    pub initial_max_data: u64,

    /// Stream receive window for locally-initiated bidirectional streams.
    pub initial_max_stream_data_bidi_local: u64,

    /// Stream receive window for peer-initiated bidirectional streams.
    pub initial_max_stream_data_bidi_remote: u64,

    /// Stream receive window for unidirectional streams.
    pub initial_max_stream_data_uni: u64,

    /// How many bidirectional streams the peer may open.
    pub initial_max_streams_bidi: u64,

    /// How many unidirectional streams the peer may open.
    pub initial_max_streams_uni: u64,

    /// Exponent applied to ACK delay encoding.
    pub ack_delay_exponent: u8,

    /// Largest intentional ACK delay.
    pub max_ack_delay: Duration,

    /// How many self connection IDs the peer may hold.
    pub active_connection_id_limit: u64,

    /// Reject packets from non-validated paths.
    pub disable_migration: bool,

    /// Enforce the 3x amplification cap before address validation.
    pub enable_writable_bytes_limit: bool,

    /// Initial congestion window, in packets.
    pub init_cwnd_in_mss: u64,

    /// Congestion window floor, in packets.
    pub min_cwnd_in_mss: u64,

    /// Pace even the initial window.
    pub pace_init_cwnd: bool,

    /// Resolution of the pacing timer.
    pub pacing_timer_tick_interval: Duration,

    /// Per-write-loop cap on packets carrying connection data.
    pub write_connection_data_packets_limit: usize,

    /// Packets handed to the batch writer per flush.
    pub max_batch_size: usize,

    /// Fraction of an RTT the write loop may occupy before yielding.
    pub write_limit_rtt_fraction: u32,

    /// Initiate a key update after this many packets in a phase.
    pub key_update_packet_count_interval: u64,

    /// Allow locally-initiated key updates.
    pub initiate_key_update: bool,

    /// Acknowledge opportunistically when a packet is already being built.
    pub opportunistic_acking: bool,

    /// ACK scheduling policy.
    pub ack_frequency: AckFrequencyPolicy,

    /// Pad short-header packets to a multiple of this; 0 disables.
    pub padding_modulo: u64,

    /// Priority assigned to streams that never set one explicitly.
    pub default_priority: StreamPriority,

    /// Raise the reordering threshold when spurious losses are observed.
    pub use_adaptive_loss_reordering_thresholds: bool,

    /// Scale the reordering threshold with the inflight packet count.
    pub use_inflight_reordering_threshold: bool,

    /// Send keepalive PINGs at half the idle interval.
    pub enable_keepalive: bool,

    /// Carry congestion hints in the session ticket for 0-RTT resumption.
    pub include_cwnd_hints_in_session_ticket: bool,

    /// Bound on buffered DATAGRAM frames in each direction.
    pub datagram_queue_capacity: usize,
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(60),
            max_udp_payload_size: crate::types::DEFAULT_UDP_PAYLOAD_SIZE,
            initial_max_data: 10 * 1024 * 1024,
            initial_max_stream_data_bidi_local: 1024 * 1024,
            initial_max_stream_data_bidi_remote: 1024 * 1024,
            initial_max_stream_data_uni: 1024 * 1024,
            initial_max_streams_bidi: 100,
            initial_max_streams_uni: 100,
            ack_delay_exponent: 3,
            max_ack_delay: Duration::from_millis(25),
            active_connection_id_limit: 4,
            disable_migration: false,
            enable_writable_bytes_limit: true,
            init_cwnd_in_mss: 10,
            min_cwnd_in_mss: 4,
            pace_init_cwnd: false,
            pacing_timer_tick_interval: Duration::from_millis(1),
            write_connection_data_packets_limit: 25,
            max_batch_size: 16,
            write_limit_rtt_fraction: 4,
            key_update_packet_count_interval: 8 * 1024 * 1024,
            initiate_key_update: false,
            opportunistic_acking: false,
            ack_frequency: AckFrequencyPolicy::default(),
            padding_modulo: 0,
            default_priority: StreamPriority::default(),
            use_adaptive_loss_reordering_thresholds: false,
            use_inflight_reordering_threshold: false,
            enable_keepalive: false,
            include_cwnd_hints_in_session_ticket: false,
            datagram_queue_capacity: 64,
        }
    }
}

impl TransportSettings {
    /// Validate the settings, collecting every problem found.
    pub fn validate(&self) -> core::result::Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.max_udp_payload_size < 1200 {
            errors.push(format!(
                "max_udp_payload_size {} below the RFC 9000 minimum of 1200",
                self.max_udp_payload_size
            ));
        }
        if self.ack_delay_exponent > 20 {
            errors.push(format!(
                "ack_delay_exponent {} exceeds the maximum of 20",
                self.ack_delay_exponent
            ));
        }
        if self.max_ack_delay >= Duration::from_secs(1 << 14) {
            errors.push("max_ack_delay must be below 2^14 seconds".into());
        }
        if self.active_connection_id_limit < 2 {
            errors.push("active_connection_id_limit must be at least 2".into());
        }
        if self.min_cwnd_in_mss == 0 || self.init_cwnd_in_mss < self.min_cwnd_in_mss {
            errors.push("congestion window bounds are inconsistent".into());
        }
        if self.max_batch_size == 0 || self.write_connection_data_packets_limit == 0 {
            errors.push("write loop limits must be non-zero".into());
        }
        if self.default_priority.level > 7 {
            errors.push(format!(
                "default_priority.level {} out of range 0-7",
                self.default_priority.level
            ));
        }
        if self.ack_frequency.min_rtt_divisor == 0 {
            errors.push("ack_frequency.min_rtt_divisor must be non-zero".into());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

/// Transport parameters learned from the peer during the handshake
/// (RFC 9000 Section 18.2). Only the fields the core consumes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportParameters {
    pub initial_max_data: u64,
    pub initial_max_stream_data_bidi_local: u64,
    pub initial_max_stream_data_bidi_remote: u64,
    pub initial_max_stream_data_uni: u64,
    pub initial_max_streams_bidi: u64,
    pub initial_max_streams_uni: u64,
    pub ack_delay_exponent: u8,
    pub max_ack_delay: Duration,
    pub max_udp_payload_size: usize,
    pub active_connection_id_limit: u64,
    pub max_idle_timeout: Duration,
    pub disable_active_migration: bool,
    pub max_datagram_frame_size: u64,
    pub stateless_reset_token: Option<crate::types::StatelessResetToken>,
}

impl Default for TransportParameters {
    fn default() -> Self {
        Self {
            initial_max_data: 0,
            initial_max_stream_data_bidi_local: 0,
            initial_max_stream_data_bidi_remote: 0,
            initial_max_stream_data_uni: 0,
            initial_max_streams_bidi: 0,
            initial_max_streams_uni: 0,
            ack_delay_exponent: 3,
            max_ack_delay: Duration::from_millis(25),
            max_udp_payload_size: 65527,
            active_connection_id_limit: 2,
            max_idle_timeout: Duration::ZERO,
            disable_active_migration: false,
            max_datagram_frame_size: 0,
            stateless_reset_token: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        assert!(TransportSettings::default().validate().is_ok());
    }

    #[test]
    fn validation_collects_all_errors() {
        let settings = TransportSettings {
            max_udp_payload_size: 600,
            ack_delay_exponent: 30,
            active_connection_id_limit: 1,
            ..TransportSettings::default()
        };
        let errors = settings.validate().unwrap_err();
        assert_eq!(errors.len(), 3);
    }

    #[test]
    fn priority_level_bounds_checked() {
        let settings = TransportSettings {
            default_priority: StreamPriority { level: 9, incremental: false },
            ..TransportSettings::default()
        };
        assert!(settings.validate().is_err());
    }
}
