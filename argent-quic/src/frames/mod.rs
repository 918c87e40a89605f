//! # QUIC frames (RFC 9000 Section 19, plus extensions)
//!
//! The frame vocabulary is a tagged sum over every frame the core speaks:
//! the RFC 9000 set, DATAGRAM (RFC 9221), ACK_FREQUENCY / IMMEDIATE_ACK
//! (draft-ietf-quic-ack-frequency), RESET_STREAM_AT
//! (draft-ietf-quic-reliable-stream-reset), transport KNOB frames and
//! group-stream variants.
//!
//! Parsing is zero-copy: payload-bearing frames borrow from the decrypted
//! packet buffer.

#![forbid(unsafe_code)]

pub mod build;
pub mod parse;

pub use parse::{FrameDecoder, FrameIter};

use crate::types::{ApplicationErrorCode, PacketNumber, StreamId, StreamOffset, VarInt};
use bytes::Bytes;
use core::time::Duration;
use tinyvec::TinyVec;

// ============================================================================
// Frame type constants
// ============================================================================

pub const FRAME_PADDING: u64 = 0x00;
pub const FRAME_PING: u64 = 0x01;
pub const FRAME_ACK: u64 = 0x02;
pub const FRAME_ACK_ECN: u64 = 0x03;
pub const FRAME_RESET_STREAM: u64 = 0x04;
pub const FRAME_STOP_SENDING: u64 = 0x05;
pub const FRAME_CRYPTO: u64 = 0x06;
pub const FRAME_NEW_TOKEN: u64 = 0x07;
pub const FRAME_STREAM_BASE: u64 = 0x08; // 0x08-0x0f
pub const FRAME_MAX_DATA: u64 = 0x10;
pub const FRAME_MAX_STREAM_DATA: u64 = 0x11;
pub const FRAME_MAX_STREAMS_BIDI: u64 = 0x12;
pub const FRAME_MAX_STREAMS_UNI: u64 = 0x13;
pub const FRAME_DATA_BLOCKED: u64 = 0x14;
pub const FRAME_STREAM_DATA_BLOCKED: u64 = 0x15;
pub const FRAME_STREAMS_BLOCKED_BIDI: u64 = 0x16;
pub const FRAME_STREAMS_BLOCKED_UNI: u64 = 0x17;
pub const FRAME_NEW_CONNECTION_ID: u64 = 0x18;
pub const FRAME_RETIRE_CONNECTION_ID: u64 = 0x19;
pub const FRAME_PATH_CHALLENGE: u64 = 0x1a;
pub const FRAME_PATH_RESPONSE: u64 = 0x1b;
pub const FRAME_CONNECTION_CLOSE: u64 = 0x1c;
pub const FRAME_CONNECTION_CLOSE_APP: u64 = 0x1d;
pub const FRAME_HANDSHAKE_DONE: u64 = 0x1e;
pub const FRAME_IMMEDIATE_ACK: u64 = 0x1f;
pub const FRAME_RESET_STREAM_AT: u64 = 0x24;
pub const FRAME_DATAGRAM: u64 = 0x30;
pub const FRAME_DATAGRAM_LEN: u64 = 0x31;
pub const FRAME_GROUP_STREAM_BASE: u64 = 0x32; // 0x32-0x39
pub const FRAME_ACK_FREQUENCY: u64 = 0xaf;
pub const FRAME_KNOB: u64 = 0x1550;

/// STREAM / group-stream type-byte flag bits (RFC 9000 Section 19.8).
pub const STREAM_BIT_FIN: u64 = 0x01;
pub const STREAM_BIT_LEN: u64 = 0x02;
pub const STREAM_BIT_OFF: u64 = 0x04;

/// Streams above this cannot be granted by MAX_STREAMS (RFC 9000
/// Section 19.11).
pub const MAX_STREAMS_LIMIT: u64 = 1 << 60;

// ============================================================================
// Frame payload structs
// ============================================================================

/// One acknowledged packet-number range, closed on both ends.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AckBlock {
    pub start: PacketNumber,
    pub end: PacketNumber,
}

/// ECN counts reported alongside an ACK (RFC 9000 Section 19.3.2).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EcnCounts {
    pub ect0: u64,
    pub ect1: u64,
    pub ce: u64,
}

/// ACK frame with decoded ranges, largest first (RFC 9000 Section 19.3).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AckFrame {
    pub largest_acked: PacketNumber,

    /// Peer's intentional delay, already scaled by its ack-delay exponent.
    pub ack_delay: Duration,

    /// Acknowledged ranges in descending order; the first covers
    /// `largest_acked`.
    pub blocks: TinyVec<[AckBlock; 8]>,

    pub ecn: Option<EcnCounts>,
}

impl AckFrame {
    /// Whether `pn` is acknowledged by this frame.
    pub fn acks(&self, pn: PacketNumber) -> bool {
        self.blocks.iter().any(|b| b.start <= pn && pn <= b.end)
    }

    /// Smallest acknowledged packet number.
    pub fn smallest_acked(&self) -> PacketNumber {
        self.blocks.last().map(|b| b.start).unwrap_or(self.largest_acked)
    }
}

/// RESET_STREAM / RESET_STREAM_AT (RFC 9000 Section 19.4 and
/// draft-ietf-quic-reliable-stream-reset). A plain reset carries no
/// reliable size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResetStreamFrame {
    pub stream_id: StreamId,
    pub error_code: ApplicationErrorCode,
    pub final_size: StreamOffset,

    /// Bytes that must still be delivered before the reset takes effect.
    pub reliable_size: Option<StreamOffset>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StopSendingFrame {
    pub stream_id: StreamId,
    pub error_code: ApplicationErrorCode,
}

/// CRYPTO frame; handshake bytes at an offset (RFC 9000 Section 19.6).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CryptoFrame<'a> {
    pub offset: StreamOffset,
    pub data: &'a [u8],
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewTokenFrame {
    pub token: Bytes,
}

/// STREAM frame, optionally a group-stream variant carrying a group id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamFrame<'a> {
    pub stream_id: StreamId,

    /// Stream group the frame belongs to; `None` for plain STREAM frames.
    pub group_id: Option<VarInt>,

    pub offset: StreamOffset,
    pub data: &'a [u8],
    pub fin: bool,
}

impl StreamFrame<'_> {
    /// Offset one past the last byte carried.
    pub fn end_offset(&self) -> StreamOffset {
        self.offset + self.data.len() as u64
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewConnectionIdFrame {
    pub sequence: VarInt,
    pub retire_prior_to: VarInt,
    pub cid: crate::types::ConnectionId,
    pub reset_token: crate::types::StatelessResetToken,
}

/// CONNECTION_CLOSE, transport (0x1c) or application (0x1d) variant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionCloseFrame {
    pub error_code: u64,

    /// Offending frame type; transport variant only.
    pub frame_type: Option<VarInt>,

    pub reason: Bytes,
    pub application_close: bool,
}

/// ACK_FREQUENCY (draft-ietf-quic-ack-frequency Section 4).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AckFrequencyFrame {
    pub sequence: VarInt,
    pub ack_eliciting_threshold: VarInt,
    pub requested_max_ack_delay: Duration,
    pub reordering_threshold: VarInt,
}

/// Transport KNOB: out-of-band setting delivery `(space, id, blob)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KnobFrame<'a> {
    pub knob_space: VarInt,
    pub id: VarInt,
    pub blob: &'a [u8],
}

// ============================================================================
// The frame sum
// ============================================================================

/// Every frame the core can parse or emit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame<'a> {
    /// A contiguous run of padding bytes, coalesced into one frame.
    Padding { len: usize },
    Ping,
    Ack(AckFrame),
    ResetStream(ResetStreamFrame),
    StopSending(StopSendingFrame),
    Crypto(CryptoFrame<'a>),
    NewToken(NewTokenFrame),
    Stream(StreamFrame<'a>),
    MaxData { maximum: VarInt },
    MaxStreamData { stream_id: StreamId, maximum: VarInt },
    MaxStreamsBidi { maximum: VarInt },
    MaxStreamsUni { maximum: VarInt },
    DataBlocked { limit: VarInt },
    StreamDataBlocked { stream_id: StreamId, limit: VarInt },
    StreamsBlockedBidi { limit: VarInt },
    StreamsBlockedUni { limit: VarInt },
    NewConnectionId(NewConnectionIdFrame),
    RetireConnectionId { sequence: VarInt },
    PathChallenge { data: [u8; 8] },
    PathResponse { data: [u8; 8] },
    ConnectionClose(ConnectionCloseFrame),
    HandshakeDone,
    ImmediateAck,
    Datagram { data: &'a [u8] },
    AckFrequency(AckFrequencyFrame),
    Knob(KnobFrame<'a>),
}

impl Frame<'_> {
    /// Whether the frame obliges the peer to acknowledge the packet
    /// (RFC 9000 Section 13.2.1: everything except ACK, PADDING and
    /// CONNECTION_CLOSE).
    pub fn is_ack_eliciting(&self) -> bool {
        !matches!(
            self,
            Frame::Padding { .. } | Frame::Ack(_) | Frame::ConnectionClose(_)
        )
    }

    /// The wire type this frame encodes as.
    pub fn frame_type(&self) -> u64 {
        match self {
            Frame::Padding { .. } => FRAME_PADDING,
            Frame::Ping => FRAME_PING,
            Frame::Ack(ack) if ack.ecn.is_some() => FRAME_ACK_ECN,
            Frame::Ack(_) => FRAME_ACK,
            Frame::ResetStream(reset) if reset.reliable_size.is_some() => FRAME_RESET_STREAM_AT,
            Frame::ResetStream(_) => FRAME_RESET_STREAM,
            Frame::StopSending(_) => FRAME_STOP_SENDING,
            Frame::Crypto(_) => FRAME_CRYPTO,
            Frame::NewToken(_) => FRAME_NEW_TOKEN,
            Frame::Stream(frame) => {
                let base = if frame.group_id.is_some() {
                    FRAME_GROUP_STREAM_BASE
                } else {
                    FRAME_STREAM_BASE
                };
                // OFF and LEN are always emitted; FIN as needed. The
                // group-stream base is not 8-aligned, so flags add.
                base + (STREAM_BIT_OFF | STREAM_BIT_LEN | if frame.fin { STREAM_BIT_FIN } else { 0 })
            }
            Frame::MaxData { .. } => FRAME_MAX_DATA,
            Frame::MaxStreamData { .. } => FRAME_MAX_STREAM_DATA,
            Frame::MaxStreamsBidi { .. } => FRAME_MAX_STREAMS_BIDI,
            Frame::MaxStreamsUni { .. } => FRAME_MAX_STREAMS_UNI,
            Frame::DataBlocked { .. } => FRAME_DATA_BLOCKED,
            Frame::StreamDataBlocked { .. } => FRAME_STREAM_DATA_BLOCKED,
            Frame::StreamsBlockedBidi { .. } => FRAME_STREAMS_BLOCKED_BIDI,
            Frame::StreamsBlockedUni { .. } => FRAME_STREAMS_BLOCKED_UNI,
            Frame::NewConnectionId(_) => FRAME_NEW_CONNECTION_ID,
            Frame::RetireConnectionId { .. } => FRAME_RETIRE_CONNECTION_ID,
            Frame::PathChallenge { .. } => FRAME_PATH_CHALLENGE,
            Frame::PathResponse { .. } => FRAME_PATH_RESPONSE,
            Frame::ConnectionClose(close) if close.application_close => FRAME_CONNECTION_CLOSE_APP,
            Frame::ConnectionClose(_) => FRAME_CONNECTION_CLOSE,
            Frame::HandshakeDone => FRAME_HANDSHAKE_DONE,
            Frame::ImmediateAck => FRAME_IMMEDIATE_ACK,
            Frame::Datagram { .. } => FRAME_DATAGRAM_LEN,
            Frame::AckFrequency(_) => FRAME_ACK_FREQUENCY,
            Frame::Knob(_) => FRAME_KNOB,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ack_eliciting_classification() {
        // RFC 9000 Section 13.2.1.
        assert!(!Frame::Padding { len: 4 }.is_ack_eliciting());
        assert!(!Frame::Ack(AckFrame {
            largest_acked: 0,
            ack_delay: Duration::ZERO,
            blocks: TinyVec::new(),
            ecn: None,
        })
        .is_ack_eliciting());
        assert!(!Frame::ConnectionClose(ConnectionCloseFrame {
            error_code: 0,
            frame_type: None,
            reason: Bytes::new(),
            application_close: false,
        })
        .is_ack_eliciting());
        assert!(Frame::Ping.is_ack_eliciting());
        assert!(Frame::HandshakeDone.is_ack_eliciting());
        assert!(Frame::Datagram { data: &[] }.is_ack_eliciting());
    }

    #[test]
    fn stream_frame_type_bits() {
        let frame = Frame::Stream(StreamFrame {
            stream_id: StreamId::new(4),
            group_id: None,
            offset: 0,
            data: b"x",
            fin: true,
        });
        assert_eq!(frame.frame_type(), FRAME_STREAM_BASE | STREAM_BIT_OFF | STREAM_BIT_LEN | STREAM_BIT_FIN);

        let grouped = Frame::Stream(StreamFrame {
            stream_id: StreamId::new(4),
            group_id: Some(9),
            offset: 0,
            data: b"x",
            fin: false,
        });
        assert_eq!(grouped.frame_type(), FRAME_GROUP_STREAM_BASE + (STREAM_BIT_OFF | STREAM_BIT_LEN));
    }

    #[test]
    fn reset_variant_selection() {
        let plain = Frame::ResetStream(ResetStreamFrame {
            stream_id: StreamId::new(0),
            error_code: 1,
            final_size: 10,
            reliable_size: None,
        });
        assert_eq!(plain.frame_type(), FRAME_RESET_STREAM);

        let reliable = Frame::ResetStream(ResetStreamFrame {
            stream_id: StreamId::new(0),
            error_code: 1,
            final_size: 10,
            reliable_size: Some(5),
        });
        assert_eq!(reliable.frame_type(), FRAME_RESET_STREAM_AT);
    }
}
