//! Frame parsing (RFC 9000 Section 12.4).
//!
//! A [`FrameDecoder`] walks a decrypted payload frame by frame. Parsing is
//! zero-copy and never panics on malformed input; every failure surfaces
//! as a `FrameEncodingError` carrying the offending frame type.

#![forbid(unsafe_code)]

use super::*;
use crate::error::{QuicError, Result, TransportErrorCode};
use crate::types::{ConnectionId, StreamId, VarIntCodec, MAX_CID_LENGTH, VARINT_MAX};
use bytes::Bytes;
use core::time::Duration;
use tinyvec::TinyVec;

/// Bounded read cursor over a borrowed payload.
pub(crate) struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    pub(crate) fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub(crate) fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    pub(crate) fn peek(&self) -> Option<u8> {
        self.buf.get(self.pos).copied()
    }

    pub(crate) fn u8(&mut self) -> Result<u8> {
        let b = self
            .peek()
            .ok_or_else(|| QuicError::frame_encoding("truncated byte"))?;
        self.pos += 1;
        Ok(b)
    }

    pub(crate) fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.remaining() < n {
            return Err(QuicError::frame_encoding("truncated field"));
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    /// Consume everything left in the payload.
    pub(crate) fn rest(&mut self) -> &'a [u8] {
        let out = &self.buf[self.pos..];
        self.pos = self.buf.len();
        out
    }

    pub(crate) fn varint(&mut self) -> Result<u64> {
        let (value, consumed) = VarIntCodec::decode(&self.buf[self.pos..])
            .ok_or_else(|| QuicError::frame_encoding("truncated varint"))?;
        self.pos += consumed;
        Ok(value)
    }

    /// A varint whose downstream use restricts it below `cap`.
    pub(crate) fn varint_below(&mut self, cap: u64, reason: &'static str) -> Result<u64> {
        let value = self.varint()?;
        if value > cap {
            return Err(QuicError::frame_encoding(reason));
        }
        Ok(value)
    }
}

/// Frame decoder, parameterized by the negotiated ACK-delay exponent.
#[derive(Debug, Clone, Copy)]
pub struct FrameDecoder {
    /// Exponent applied to ACK delay fields; 3 until the peer's transport
    /// parameters are known (RFC 9000 Section 18.2).
    pub ack_delay_exponent: u8,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self { ack_delay_exponent: 3 }
    }
}

impl FrameDecoder {
    pub fn new(ack_delay_exponent: u8) -> Self {
        Self { ack_delay_exponent }
    }

    /// Iterate over every frame in a decrypted payload.
    pub fn iter<'a>(&self, payload: &'a [u8]) -> FrameIter<'a> {
        FrameIter {
            decoder: *self,
            cursor: Cursor::new(payload),
            failed: false,
        }
    }

    /// Parse one frame from the cursor.
    pub(crate) fn decode_frame<'a>(&self, cur: &mut Cursor<'a>) -> Result<Frame<'a>> {
        let frame_type = cur.varint()?;

        // A run of padding bytes collapses into a single frame; stop at
        // the first non-padding byte and leave it for the caller.
        if frame_type == FRAME_PADDING {
            let mut len = 1;
            while cur.peek() == Some(0x00) {
                cur.u8()?;
                len += 1;
            }
            return Ok(Frame::Padding { len });
        }

        let frame = match frame_type {
            FRAME_PING => Frame::Ping,
            FRAME_ACK => Frame::Ack(self.decode_ack(cur, false)?),
            FRAME_ACK_ECN => Frame::Ack(self.decode_ack(cur, true)?),
            FRAME_RESET_STREAM => Frame::ResetStream(Self::decode_reset(cur, false)?),
            FRAME_RESET_STREAM_AT => Frame::ResetStream(Self::decode_reset(cur, true)?),
            FRAME_STOP_SENDING => Frame::StopSending(StopSendingFrame {
                stream_id: StreamId::new(cur.varint()?),
                error_code: cur.varint()?,
            }),
            FRAME_CRYPTO => {
                let offset = cur.varint()?;
                let len = cur.varint()?;
                if len > cur.remaining() as u64 {
                    return Err(QuicError::frame_encoding("crypto length past packet end"));
                }
                if offset.checked_add(len).is_none_or(|end| end > VARINT_MAX) {
                    return Err(QuicError::frame_encoding("crypto offset overflow"));
                }
                Frame::Crypto(CryptoFrame { offset, data: cur.take(len as usize)? })
            }
            FRAME_NEW_TOKEN => {
                let len = cur.varint()?;
                if len == 0 || len > cur.remaining() as u64 {
                    return Err(QuicError::frame_encoding("bad NEW_TOKEN length"));
                }
                Frame::NewToken(NewTokenFrame {
                    token: Bytes::copy_from_slice(cur.take(len as usize)?),
                })
            }
            t if (FRAME_STREAM_BASE..=FRAME_STREAM_BASE + 0x07).contains(&t) => {
                Frame::Stream(Self::decode_stream(cur, t, None)?)
            }
            t if (FRAME_GROUP_STREAM_BASE..=FRAME_GROUP_STREAM_BASE + 0x07).contains(&t) => {
                // The group-stream base is not 8-aligned: flags are the
                // distance from the base, then re-anchored on 0x08.
                let group_id = cur.varint()?;
                let flags = t - FRAME_GROUP_STREAM_BASE;
                Frame::Stream(Self::decode_stream(cur, FRAME_STREAM_BASE + flags, Some(group_id))?)
            }
            FRAME_MAX_DATA => Frame::MaxData { maximum: cur.varint()? },
            FRAME_MAX_STREAM_DATA => Frame::MaxStreamData {
                stream_id: StreamId::new(cur.varint()?),
                maximum: cur.varint()?,
            },
            FRAME_MAX_STREAMS_BIDI => Frame::MaxStreamsBidi {
                maximum: cur.varint_below(MAX_STREAMS_LIMIT, "MAX_STREAMS above 2^60")?,
            },
            FRAME_MAX_STREAMS_UNI => Frame::MaxStreamsUni {
                maximum: cur.varint_below(MAX_STREAMS_LIMIT, "MAX_STREAMS above 2^60")?,
            },
            FRAME_DATA_BLOCKED => Frame::DataBlocked { limit: cur.varint()? },
            FRAME_STREAM_DATA_BLOCKED => Frame::StreamDataBlocked {
                stream_id: StreamId::new(cur.varint()?),
                limit: cur.varint()?,
            },
            FRAME_STREAMS_BLOCKED_BIDI => Frame::StreamsBlockedBidi {
                limit: cur.varint_below(MAX_STREAMS_LIMIT, "STREAMS_BLOCKED above 2^60")?,
            },
            FRAME_STREAMS_BLOCKED_UNI => Frame::StreamsBlockedUni {
                limit: cur.varint_below(MAX_STREAMS_LIMIT, "STREAMS_BLOCKED above 2^60")?,
            },
            FRAME_NEW_CONNECTION_ID => {
                let sequence = cur.varint()?;
                let retire_prior_to = cur.varint()?;
                if retire_prior_to > sequence {
                    return Err(QuicError::frame_encoding("retire_prior_to above sequence"));
                }
                let cid_len = cur.u8()? as usize;
                if cid_len == 0 || cid_len > MAX_CID_LENGTH {
                    return Err(QuicError::frame_encoding("bad connection ID length"));
                }
                let cid = ConnectionId::from_slice(cur.take(cid_len)?)
                    .ok_or_else(|| QuicError::frame_encoding("bad connection ID length"))?;
                let mut reset_token = [0u8; 16];
                reset_token.copy_from_slice(cur.take(16)?);
                Frame::NewConnectionId(NewConnectionIdFrame { sequence, retire_prior_to, cid, reset_token })
            }
            FRAME_RETIRE_CONNECTION_ID => Frame::RetireConnectionId { sequence: cur.varint()? },
            FRAME_PATH_CHALLENGE => {
                let mut data = [0u8; 8];
                data.copy_from_slice(cur.take(8)?);
                Frame::PathChallenge { data }
            }
            FRAME_PATH_RESPONSE => {
                let mut data = [0u8; 8];
                data.copy_from_slice(cur.take(8)?);
                Frame::PathResponse { data }
            }
            FRAME_CONNECTION_CLOSE | FRAME_CONNECTION_CLOSE_APP => {
                let application_close = frame_type == FRAME_CONNECTION_CLOSE_APP;
                let error_code = cur.varint()?;
                let offending = if application_close { None } else { Some(cur.varint()?) };
                let reason_len = cur.varint()?;
                if reason_len > cur.remaining() as u64 {
                    return Err(QuicError::frame_encoding("close reason past packet end"));
                }
                Frame::ConnectionClose(ConnectionCloseFrame {
                    error_code,
                    frame_type: offending,
                    reason: Bytes::copy_from_slice(cur.take(reason_len as usize)?),
                    application_close,
                })
            }
            FRAME_HANDSHAKE_DONE => Frame::HandshakeDone,
            FRAME_IMMEDIATE_ACK => Frame::ImmediateAck,
            FRAME_DATAGRAM => Frame::Datagram { data: cur.rest() },
            FRAME_DATAGRAM_LEN => {
                let len = cur.varint()?;
                if len > cur.remaining() as u64 {
                    return Err(QuicError::frame_encoding("datagram length past packet end"));
                }
                Frame::Datagram { data: cur.take(len as usize)? }
            }
            FRAME_ACK_FREQUENCY => {
                let sequence = cur.varint()?;
                let ack_eliciting_threshold = cur.varint()?;
                let delay_us = cur.varint()?;
                let reordering_threshold = cur.varint()?;
                Frame::AckFrequency(AckFrequencyFrame {
                    sequence,
                    ack_eliciting_threshold,
                    requested_max_ack_delay: Duration::from_micros(delay_us),
                    reordering_threshold,
                })
            }
            FRAME_KNOB => {
                let knob_space = cur.varint()?;
                let id = cur.varint()?;
                let len = cur.varint()?;
                if len > cur.remaining() as u64 {
                    return Err(QuicError::frame_encoding("knob blob past packet end"));
                }
                Frame::Knob(KnobFrame { knob_space, id, blob: cur.take(len as usize)? })
            }
            _ => {
                return Err(QuicError::with_frame_type(
                    TransportErrorCode::FrameEncodingError,
                    frame_type,
                    "unknown frame type",
                ))
            }
        };
        Ok(frame)
    }

    /// ACK decode (RFC 9000 Section 19.3): the first block hangs off
    /// `largest_acked`; each following `(gap, len)` pair ends two below
    /// the previous block's start minus the gap.
    fn decode_ack<'a>(&self, cur: &mut Cursor<'a>, ecn: bool) -> Result<AckFrame> {
        let largest_acked = cur.varint()?;
        let raw_delay = cur.varint()?;
        let additional_blocks = cur.varint()?;
        let first_len = cur.varint()?;

        if first_len > largest_acked {
            return Err(QuicError::with_frame_type(
                TransportErrorCode::FrameEncodingError,
                FRAME_ACK,
                "first ack block exceeds largest acked",
            ));
        }

        let mut blocks: TinyVec<[AckBlock; 8]> = TinyVec::new();
        blocks.push(AckBlock { start: largest_acked - first_len, end: largest_acked });

        let mut prev_start = largest_acked - first_len;
        for _ in 0..additional_blocks {
            let gap = cur.varint()?;
            let len = cur.varint()?;
            let end = prev_start
                .checked_sub(gap)
                .and_then(|v| v.checked_sub(2))
                .ok_or_else(|| {
                    QuicError::with_frame_type(
                        TransportErrorCode::FrameEncodingError,
                        FRAME_ACK,
                        "ack block end underflow",
                    )
                })?;
            let start = end.checked_sub(len).ok_or_else(|| {
                QuicError::with_frame_type(
                    TransportErrorCode::FrameEncodingError,
                    FRAME_ACK,
                    "ack block start underflow",
                )
            })?;
            blocks.push(AckBlock { start, end });
            prev_start = start;
        }

        // Delay is raw * 2^exponent microseconds; overflow is a peer error.
        let micros = raw_delay
            .checked_mul(1u64 << self.ack_delay_exponent.min(63))
            .ok_or_else(|| {
                QuicError::with_frame_type(
                    TransportErrorCode::FrameEncodingError,
                    FRAME_ACK,
                    "ack delay overflow",
                )
            })?;

        let ecn = if ecn {
            Some(EcnCounts { ect0: cur.varint()?, ect1: cur.varint()?, ce: cur.varint()? })
        } else {
            None
        };

        Ok(AckFrame {
            largest_acked,
            ack_delay: Duration::from_micros(micros),
            blocks,
            ecn,
        })
    }

    fn decode_reset(cur: &mut Cursor<'_>, reliable: bool) -> Result<ResetStreamFrame> {
        let stream_id = StreamId::new(cur.varint()?);
        let error_code = cur.varint()?;
        let final_size = cur.varint()?;
        let reliable_size = if reliable { Some(cur.varint()?) } else { None };
        if reliable_size.is_some_and(|r| r > final_size) {
            return Err(QuicError::with_frame_type(
                TransportErrorCode::FrameEncodingError,
                FRAME_RESET_STREAM_AT,
                "reliable size exceeds final size",
            ));
        }
        Ok(ResetStreamFrame { stream_id, error_code, final_size, reliable_size })
    }

    fn decode_stream<'a>(
        cur: &mut Cursor<'a>,
        frame_type: u64,
        group_id: Option<u64>,
    ) -> Result<StreamFrame<'a>> {
        let stream_id = StreamId::new(cur.varint()?);
        let offset = if frame_type & STREAM_BIT_OFF != 0 { cur.varint()? } else { 0 };
        let data = if frame_type & STREAM_BIT_LEN != 0 {
            let len = cur.varint()?;
            if len > cur.remaining() as u64 {
                return Err(QuicError::frame_encoding("stream length past packet end"));
            }
            cur.take(len as usize)?
        } else {
            // Length absent: the frame runs to the end of the packet.
            cur.rest()
        };
        if offset.checked_add(data.len() as u64).is_none_or(|end| end > VARINT_MAX) {
            return Err(QuicError::frame_encoding("stream offset overflow"));
        }
        Ok(StreamFrame {
            stream_id,
            group_id,
            offset,
            data,
            fin: frame_type & STREAM_BIT_FIN != 0,
        })
    }
}

/// Iterator over the frames of one payload; stops permanently after the
/// first error.
pub struct FrameIter<'a> {
    decoder: FrameDecoder,
    cursor: Cursor<'a>,
    failed: bool,
}

impl<'a> Iterator for FrameIter<'a> {
    type Item = Result<Frame<'a>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.cursor.is_empty() {
            return None;
        }
        match self.decoder.decode_frame(&mut self.cursor) {
            Ok(frame) => Some(Ok(frame)),
            Err(e) => {
                self.failed = true;
                Some(Err(e))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frames::build::encode_frame;
    use bytes::BytesMut;

    fn decode_one(buf: &[u8]) -> Result<Frame<'_>> {
        FrameDecoder::default().decode_frame(&mut Cursor::new(buf))
    }

    #[test]
    fn padding_run_coalesces() {
        let buf = [0x00, 0x00, 0x00, 0x01];
        let mut cur = Cursor::new(&buf);
        let decoder = FrameDecoder::default();
        assert_eq!(decoder.decode_frame(&mut cur).unwrap(), Frame::Padding { len: 3 });
        assert_eq!(decoder.decode_frame(&mut cur).unwrap(), Frame::Ping);
    }

    #[test]
    fn ack_three_additional_blocks() {
        // largest = 1000, delay = 100 (exponent 3 => 800us), 3 extra
        // blocks (10,10), (10,0), (0,10).
        let mut buf = BytesMut::new();
        for v in [0x02u64, 1000, 100, 3, 10, 10, 10, 10, 0, 0, 10] {
            crate::types::VarIntCodec::put(v, &mut buf);
        }
        let frame = decode_one(&buf).unwrap();
        let Frame::Ack(ack) = frame else { panic!("not an ack") };
        assert_eq!(ack.largest_acked, 1000);
        assert_eq!(ack.ack_delay, Duration::from_micros(800));
        let ranges: Vec<(u64, u64)> = ack.blocks.iter().map(|b| (b.start, b.end)).collect();
        assert_eq!(ranges, vec![(990, 1000), (968, 978), (956, 956), (944, 954)]);
    }

    #[test]
    fn ack_first_block_exceeding_largest_rejected() {
        let mut buf = BytesMut::new();
        for v in [0x02u64, 1000, 0, 0, 2000] {
            crate::types::VarIntCodec::put(v, &mut buf);
        }
        let err = decode_one(&buf).unwrap_err();
        assert_eq!(err.code, TransportErrorCode::FrameEncodingError);
    }

    #[test]
    fn ack_gap_underflow_rejected() {
        // Second block would end below zero.
        let mut buf = BytesMut::new();
        for v in [0x02u64, 5, 0, 1, 0, 10, 0] {
            crate::types::VarIntCodec::put(v, &mut buf);
        }
        assert!(decode_one(&buf).is_err());
    }

    #[test]
    fn ack_zero_length_block_is_single_packet() {
        let mut buf = BytesMut::new();
        for v in [0x02u64, 100, 0, 1, 0, 3, 0] {
            crate::types::VarIntCodec::put(v, &mut buf);
        }
        let Frame::Ack(ack) = decode_one(&buf).unwrap() else { panic!() };
        assert_eq!(ack.blocks[1].start, ack.blocks[1].end);
        assert_eq!(ack.blocks[1].end, 95);
    }

    #[test]
    fn ack_ecn_counts_follow_blocks() {
        let mut buf = BytesMut::new();
        for v in [0x03u64, 10, 0, 0, 0, 7, 8, 9] {
            crate::types::VarIntCodec::put(v, &mut buf);
        }
        let Frame::Ack(ack) = decode_one(&buf).unwrap() else { panic!() };
        assert_eq!(ack.ecn, Some(EcnCounts { ect0: 7, ect1: 8, ce: 9 }));
    }

    #[test]
    fn ack_delay_overflow_rejected() {
        let decoder = FrameDecoder::new(20);
        let mut buf = BytesMut::new();
        for v in [0x02u64, 10, VARINT_MAX, 0, 0] {
            crate::types::VarIntCodec::put(v, &mut buf);
        }
        assert!(decoder.decode_frame(&mut Cursor::new(&buf)).is_err());
    }

    #[test]
    fn stream_without_length_runs_to_packet_end() {
        // Type 0x0c: OFF set, LEN clear, FIN clear.
        let mut buf = BytesMut::new();
        crate::types::VarIntCodec::put(0x0c, &mut buf);
        crate::types::VarIntCodec::put(4, &mut buf); // stream id
        crate::types::VarIntCodec::put(100, &mut buf); // offset
        buf.extend_from_slice(b"tail bytes");
        let Frame::Stream(frame) = decode_one(&buf).unwrap() else { panic!() };
        assert_eq!(frame.stream_id, StreamId::new(4));
        assert_eq!(frame.offset, 100);
        assert_eq!(frame.data, b"tail bytes");
        assert!(!frame.fin);
    }

    #[test]
    fn stream_length_past_end_rejected() {
        let mut buf = BytesMut::new();
        crate::types::VarIntCodec::put(0x0a, &mut buf); // LEN set
        crate::types::VarIntCodec::put(4, &mut buf);
        crate::types::VarIntCodec::put(50, &mut buf); // length
        buf.extend_from_slice(b"short");
        assert!(decode_one(&buf).is_err());
    }

    #[test]
    fn group_stream_carries_group_id() {
        let mut buf = BytesMut::new();
        crate::types::VarIntCodec::put(FRAME_GROUP_STREAM_BASE + STREAM_BIT_LEN, &mut buf);
        crate::types::VarIntCodec::put(17, &mut buf); // group id
        crate::types::VarIntCodec::put(8, &mut buf); // stream id
        crate::types::VarIntCodec::put(3, &mut buf); // length
        buf.extend_from_slice(b"abc");
        let Frame::Stream(frame) = decode_one(&buf).unwrap() else { panic!() };
        assert_eq!(frame.group_id, Some(17));
        assert_eq!(frame.data, b"abc");
    }

    #[test]
    fn reset_stream_at_reliable_above_final_rejected() {
        let mut buf = BytesMut::new();
        for v in [FRAME_RESET_STREAM_AT, 0, 0, 10, 11] {
            crate::types::VarIntCodec::put(v, &mut buf);
        }
        let err = decode_one(&buf).unwrap_err();
        assert_eq!(err.code, TransportErrorCode::FrameEncodingError);
        assert_eq!(err.frame_type, Some(FRAME_RESET_STREAM_AT));
    }

    #[test]
    fn new_connection_id_validations() {
        // retire_prior_to must not exceed sequence.
        let mut buf = BytesMut::new();
        crate::types::VarIntCodec::put(FRAME_NEW_CONNECTION_ID, &mut buf);
        crate::types::VarIntCodec::put(1, &mut buf); // sequence
        crate::types::VarIntCodec::put(2, &mut buf); // retire_prior_to
        buf.extend_from_slice(&[4, 1, 2, 3, 4]);
        buf.extend_from_slice(&[0u8; 16]);
        assert!(decode_one(&buf).is_err());
    }

    #[test]
    fn unknown_frame_type_rejected() {
        let mut buf = BytesMut::new();
        crate::types::VarIntCodec::put(0x4242, &mut buf);
        let err = decode_one(&buf).unwrap_err();
        assert_eq!(err.frame_type, Some(0x4242));
    }

    #[test]
    fn max_streams_above_two_pow_sixty_rejected() {
        let mut buf = BytesMut::new();
        crate::types::VarIntCodec::put(FRAME_MAX_STREAMS_BIDI, &mut buf);
        crate::types::VarIntCodec::put(MAX_STREAMS_LIMIT + 1, &mut buf);
        assert!(decode_one(&buf).is_err());
    }

    #[test]
    fn datagram_with_and_without_length() {
        let mut buf = BytesMut::new();
        crate::types::VarIntCodec::put(FRAME_DATAGRAM_LEN, &mut buf);
        crate::types::VarIntCodec::put(3, &mut buf);
        buf.extend_from_slice(b"xyzrest");
        let mut cur = Cursor::new(&buf);
        let decoder = FrameDecoder::default();
        let Frame::Datagram { data } = decoder.decode_frame(&mut cur).unwrap() else { panic!() };
        assert_eq!(data, b"xyz");

        let mut buf = BytesMut::new();
        crate::types::VarIntCodec::put(FRAME_DATAGRAM, &mut buf);
        buf.extend_from_slice(b"to the end");
        let Frame::Datagram { data } = decode_one(&buf).unwrap() else { panic!() };
        assert_eq!(data, b"to the end");
    }

    #[test]
    fn knob_frame_roundtrip() {
        let knob = Frame::Knob(KnobFrame { knob_space: 0xccaa, id: 7, blob: b"on" });
        let mut out = BytesMut::new();
        encode_frame(&knob, &mut out);
        assert_eq!(decode_one(&out).unwrap(), knob);
    }

    #[test]
    fn iterator_stops_after_error() {
        let mut buf = BytesMut::new();
        crate::types::VarIntCodec::put(FRAME_PING, &mut buf);
        crate::types::VarIntCodec::put(0x4242, &mut buf); // unknown
        crate::types::VarIntCodec::put(FRAME_PING, &mut buf);
        let decoder = FrameDecoder::default();
        let results: Vec<_> = decoder.iter(&buf).collect();
        assert_eq!(results.len(), 2);
        assert!(results[0].is_ok());
        assert!(results[1].is_err());
    }
}
