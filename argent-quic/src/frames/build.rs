//! Frame serialization.
//!
//! Every frame encodes into a growable buffer; [`encoded_size`] gives the
//! exact wire size so the write scheduler can budget a packet before
//! committing bytes.

#![forbid(unsafe_code)]

use super::*;
use crate::types::VarIntCodec;
use bytes::BytesMut;

fn varint_size(v: u64) -> usize {
    VarIntCodec::size(v)
}

/// Exact wire size of `frame`.
pub fn encoded_size(frame: &Frame<'_>) -> usize {
    let type_size = varint_size(frame.frame_type());
    type_size
        + match frame {
            Frame::Padding { len } => len - 1,
            Frame::Ping | Frame::HandshakeDone | Frame::ImmediateAck => 0,
            Frame::Ack(ack) => ack_body_size(ack),
            Frame::ResetStream(r) => {
                varint_size(r.stream_id.value())
                    + varint_size(r.error_code)
                    + varint_size(r.final_size)
                    + r.reliable_size.map_or(0, varint_size)
            }
            Frame::StopSending(s) => varint_size(s.stream_id.value()) + varint_size(s.error_code),
            Frame::Crypto(c) => {
                varint_size(c.offset) + varint_size(c.data.len() as u64) + c.data.len()
            }
            Frame::NewToken(t) => varint_size(t.token.len() as u64) + t.token.len(),
            Frame::Stream(s) => {
                s.group_id.map_or(0, varint_size)
                    + varint_size(s.stream_id.value())
                    + varint_size(s.offset)
                    + varint_size(s.data.len() as u64)
                    + s.data.len()
            }
            Frame::MaxData { maximum }
            | Frame::MaxStreamsBidi { maximum }
            | Frame::MaxStreamsUni { maximum } => varint_size(*maximum),
            Frame::MaxStreamData { stream_id, maximum } => {
                varint_size(stream_id.value()) + varint_size(*maximum)
            }
            Frame::DataBlocked { limit }
            | Frame::StreamsBlockedBidi { limit }
            | Frame::StreamsBlockedUni { limit } => varint_size(*limit),
            Frame::StreamDataBlocked { stream_id, limit } => {
                varint_size(stream_id.value()) + varint_size(*limit)
            }
            Frame::NewConnectionId(f) => {
                varint_size(f.sequence) + varint_size(f.retire_prior_to) + 1 + f.cid.len() + 16
            }
            Frame::RetireConnectionId { sequence } => varint_size(*sequence),
            Frame::PathChallenge { .. } | Frame::PathResponse { .. } => 8,
            Frame::ConnectionClose(c) => {
                varint_size(c.error_code)
                    + c.frame_type.map_or(0, varint_size)
                    + varint_size(c.reason.len() as u64)
                    + c.reason.len()
            }
            Frame::Datagram { data } => varint_size(data.len() as u64) + data.len(),
            Frame::AckFrequency(f) => {
                varint_size(f.sequence)
                    + varint_size(f.ack_eliciting_threshold)
                    + varint_size(f.requested_max_ack_delay.as_micros() as u64)
                    + varint_size(f.reordering_threshold)
            }
            Frame::Knob(k) => {
                varint_size(k.knob_space)
                    + varint_size(k.id)
                    + varint_size(k.blob.len() as u64)
                    + k.blob.len()
            }
        }
}

fn ack_body_size(ack: &AckFrame) -> usize {
    let raw_delay = (ack.ack_delay.as_micros() as u64) >> 3;
    let mut size = varint_size(ack.largest_acked)
        + varint_size(raw_delay)
        + varint_size(ack.blocks.len().saturating_sub(1) as u64);
    let first = &ack.blocks[0];
    size += varint_size(first.end - first.start);
    let mut prev_start = first.start;
    for block in &ack.blocks[1..] {
        size += varint_size(prev_start - block.end - 2) + varint_size(block.end - block.start);
        prev_start = block.start;
    }
    if let Some(ecn) = &ack.ecn {
        size += varint_size(ecn.ect0) + varint_size(ecn.ect1) + varint_size(ecn.ce);
    }
    size
}

/// Serialize `frame` into `out`.
///
/// ACK delay is re-encoded with the local exponent of 3; the ACK engine
/// hands frames pre-scaled accordingly.
pub fn encode_frame(frame: &Frame<'_>, out: &mut BytesMut) {
    VarIntCodec::put(frame.frame_type(), out);
    match frame {
        Frame::Padding { len } => {
            // The type byte already contributed one zero.
            out.resize(out.len() + (len - 1), 0x00);
        }
        Frame::Ping | Frame::HandshakeDone | Frame::ImmediateAck => {}
        Frame::Ack(ack) => encode_ack_body(ack, out),
        Frame::ResetStream(r) => {
            VarIntCodec::put(r.stream_id.value(), out);
            VarIntCodec::put(r.error_code, out);
            VarIntCodec::put(r.final_size, out);
            if let Some(reliable) = r.reliable_size {
                VarIntCodec::put(reliable, out);
            }
        }
        Frame::StopSending(s) => {
            VarIntCodec::put(s.stream_id.value(), out);
            VarIntCodec::put(s.error_code, out);
        }
        Frame::Crypto(c) => {
            VarIntCodec::put(c.offset, out);
            VarIntCodec::put(c.data.len() as u64, out);
            out.extend_from_slice(c.data);
        }
        Frame::NewToken(t) => {
            VarIntCodec::put(t.token.len() as u64, out);
            out.extend_from_slice(&t.token);
        }
        Frame::Stream(s) => {
            if let Some(group) = s.group_id {
                VarIntCodec::put(group, out);
            }
            VarIntCodec::put(s.stream_id.value(), out);
            VarIntCodec::put(s.offset, out);
            VarIntCodec::put(s.data.len() as u64, out);
            out.extend_from_slice(s.data);
        }
        Frame::MaxData { maximum }
        | Frame::MaxStreamsBidi { maximum }
        | Frame::MaxStreamsUni { maximum } => VarIntCodec::put(*maximum, out),
        Frame::MaxStreamData { stream_id, maximum } => {
            VarIntCodec::put(stream_id.value(), out);
            VarIntCodec::put(*maximum, out);
        }
        Frame::DataBlocked { limit }
        | Frame::StreamsBlockedBidi { limit }
        | Frame::StreamsBlockedUni { limit } => VarIntCodec::put(*limit, out),
        Frame::StreamDataBlocked { stream_id, limit } => {
            VarIntCodec::put(stream_id.value(), out);
            VarIntCodec::put(*limit, out);
        }
        Frame::NewConnectionId(f) => {
            VarIntCodec::put(f.sequence, out);
            VarIntCodec::put(f.retire_prior_to, out);
            out.extend_from_slice(&[f.cid.len() as u8]);
            out.extend_from_slice(f.cid.as_bytes());
            out.extend_from_slice(&f.reset_token);
        }
        Frame::RetireConnectionId { sequence } => VarIntCodec::put(*sequence, out),
        Frame::PathChallenge { data } | Frame::PathResponse { data } => {
            out.extend_from_slice(data);
        }
        Frame::ConnectionClose(c) => {
            VarIntCodec::put(c.error_code, out);
            if !c.application_close {
                VarIntCodec::put(c.frame_type.unwrap_or(0), out);
            }
            VarIntCodec::put(c.reason.len() as u64, out);
            out.extend_from_slice(&c.reason);
        }
        Frame::Datagram { data } => {
            VarIntCodec::put(data.len() as u64, out);
            out.extend_from_slice(data);
        }
        Frame::AckFrequency(f) => {
            VarIntCodec::put(f.sequence, out);
            VarIntCodec::put(f.ack_eliciting_threshold, out);
            VarIntCodec::put(f.requested_max_ack_delay.as_micros() as u64, out);
            VarIntCodec::put(f.reordering_threshold, out);
        }
        Frame::Knob(k) => {
            VarIntCodec::put(k.knob_space, out);
            VarIntCodec::put(k.id, out);
            VarIntCodec::put(k.blob.len() as u64, out);
            out.extend_from_slice(k.blob);
        }
    }
}

fn encode_ack_body(ack: &AckFrame, out: &mut BytesMut) {
    debug_assert!(!ack.blocks.is_empty());
    VarIntCodec::put(ack.largest_acked, out);
    VarIntCodec::put((ack.ack_delay.as_micros() as u64) >> 3, out);
    VarIntCodec::put(ack.blocks.len().saturating_sub(1) as u64, out);

    let first = &ack.blocks[0];
    debug_assert_eq!(first.end, ack.largest_acked);
    VarIntCodec::put(first.end - first.start, out);

    let mut prev_start = first.start;
    for block in &ack.blocks[1..] {
        debug_assert!(block.end + 2 <= prev_start);
        VarIntCodec::put(prev_start - block.end - 2, out);
        VarIntCodec::put(block.end - block.start, out);
        prev_start = block.start;
    }

    if let Some(ecn) = &ack.ecn {
        VarIntCodec::put(ecn.ect0, out);
        VarIntCodec::put(ecn.ect1, out);
        VarIntCodec::put(ecn.ce, out);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frames::parse::{Cursor, FrameDecoder};
    use bytes::Bytes;
    use core::time::Duration;
    use tinyvec::tiny_vec;

    fn roundtrip(frame: Frame<'_>) {
        let mut out = BytesMut::new();
        encode_frame(&frame, &mut out);
        assert_eq!(encoded_size(&frame), out.len(), "size mismatch for {frame:?}");
        let decoded = FrameDecoder::default()
            .decode_frame(&mut Cursor::new(&out))
            .unwrap();
        assert_eq!(decoded, frame);
    }

    #[test]
    fn simple_frames_roundtrip() {
        roundtrip(Frame::Ping);
        roundtrip(Frame::HandshakeDone);
        roundtrip(Frame::ImmediateAck);
        roundtrip(Frame::MaxData { maximum: 123_456 });
        roundtrip(Frame::MaxStreamData { stream_id: StreamId::new(8), maximum: 99 });
        roundtrip(Frame::MaxStreamsBidi { maximum: 64 });
        roundtrip(Frame::DataBlocked { limit: 5000 });
        roundtrip(Frame::StreamsBlockedUni { limit: 10 });
        roundtrip(Frame::RetireConnectionId { sequence: 3 });
        roundtrip(Frame::PathChallenge { data: [9; 8] });
        roundtrip(Frame::PathResponse { data: [7; 8] });
    }

    #[test]
    fn ack_roundtrip_multi_block() {
        let ack = AckFrame {
            largest_acked: 1000,
            ack_delay: Duration::from_micros(800),
            blocks: tiny_vec![
                AckBlock { start: 990, end: 1000 },
                AckBlock { start: 968, end: 978 },
                AckBlock { start: 956, end: 956 },
                AckBlock { start: 944, end: 954 }
            ],
            ecn: None,
        };
        roundtrip(Frame::Ack(ack));
    }

    #[test]
    fn ack_ecn_roundtrip() {
        let ack = AckFrame {
            largest_acked: 42,
            ack_delay: Duration::ZERO,
            blocks: tiny_vec![AckBlock { start: 40, end: 42 }],
            ecn: Some(EcnCounts { ect0: 1, ect1: 2, ce: 3 }),
        };
        roundtrip(Frame::Ack(ack));
    }

    #[test]
    fn stream_and_crypto_roundtrip() {
        roundtrip(Frame::Stream(StreamFrame {
            stream_id: StreamId::new(4),
            group_id: None,
            offset: 7777,
            data: b"payload bytes",
            fin: true,
        }));
        roundtrip(Frame::Stream(StreamFrame {
            stream_id: StreamId::new(12),
            group_id: Some(2),
            offset: 0,
            data: b"grouped",
            fin: false,
        }));
        roundtrip(Frame::Crypto(CryptoFrame { offset: 1200, data: b"hello tls" }));
    }

    #[test]
    fn reset_variants_roundtrip() {
        roundtrip(Frame::ResetStream(ResetStreamFrame {
            stream_id: StreamId::new(0),
            error_code: 77,
            final_size: 5000,
            reliable_size: None,
        }));
        roundtrip(Frame::ResetStream(ResetStreamFrame {
            stream_id: StreamId::new(0),
            error_code: 77,
            final_size: 5000,
            reliable_size: Some(100),
        }));
        roundtrip(Frame::StopSending(StopSendingFrame { stream_id: StreamId::new(3), error_code: 9 }));
    }

    #[test]
    fn connection_close_variants_roundtrip() {
        roundtrip(Frame::ConnectionClose(ConnectionCloseFrame {
            error_code: 0x0a,
            frame_type: Some(0x02),
            reason: Bytes::from_static(b"ack gone wrong"),
            application_close: false,
        }));
        roundtrip(Frame::ConnectionClose(ConnectionCloseFrame {
            error_code: 0x99,
            frame_type: None,
            reason: Bytes::from_static(b"app says no"),
            application_close: true,
        }));
    }

    #[test]
    fn extension_frames_roundtrip() {
        roundtrip(Frame::AckFrequency(AckFrequencyFrame {
            sequence: 1,
            ack_eliciting_threshold: 4,
            requested_max_ack_delay: Duration::from_micros(25_000),
            reordering_threshold: 2,
        }));
        roundtrip(Frame::Datagram { data: b"unreliable" });
        roundtrip(Frame::NewConnectionId(NewConnectionIdFrame {
            sequence: 5,
            retire_prior_to: 2,
            cid: crate::types::ConnectionId::from_slice(&[1, 2, 3, 4, 5, 6]).unwrap(),
            reset_token: [0xab; 16],
        }));
        roundtrip(Frame::NewToken(NewTokenFrame { token: Bytes::from_static(b"tokentoken") }));
    }

    #[test]
    fn padding_run_encodes_full_length() {
        let frame = Frame::Padding { len: 17 };
        let mut out = BytesMut::new();
        encode_frame(&frame, &mut out);
        assert_eq!(out.len(), 17);
        assert!(out.iter().all(|&b| b == 0));
        assert_eq!(encoded_size(&frame), 17);
    }
}
