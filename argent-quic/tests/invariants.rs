//! Property tests for the universal codec and buffer invariants:
//! round-trips, permutation insensitivity, ordered delivery, and
//! panic-freedom on malformed input.

use argent_quic::frames::{
    build::{encode_frame, encoded_size},
    AckBlock, AckFrame, Frame, FrameDecoder, ResetStreamFrame, StreamFrame,
};
use argent_quic::range_set::RangeSet;
use argent_quic::stream::RecvHalf;
use argent_quic::types::{StreamId, VarIntCodec, VARINT_MAX};
use bytes::BytesMut;
use core::time::Duration;
use proptest::prelude::*;
use tinyvec::TinyVec;

fn decode_single(buf: &[u8]) -> Frame<'_> {
    let mut iter = FrameDecoder::default().iter(buf);
    let frame = iter.next().expect("one frame").expect("valid frame");
    assert!(iter.next().is_none(), "trailing bytes after frame");
    frame
}

proptest! {
    /// For all v < 2^62: decode(encode(v)) == v, with the minimum form.
    #[test]
    fn varint_roundtrip(v in 0u64..=VARINT_MAX) {
        let mut buf = [0u8; 8];
        let written = VarIntCodec::encode(v, &mut buf).expect("encodable");
        prop_assert_eq!(written, VarIntCodec::size(v));
        let expected_len = match v {
            0..=63 => 1,
            64..=16383 => 2,
            16384..=1073741823 => 4,
            _ => 8,
        };
        prop_assert_eq!(written, expected_len);
        let (decoded, consumed) = VarIntCodec::decode(&buf[..written]).expect("decodable");
        prop_assert_eq!(decoded, v);
        prop_assert_eq!(consumed, written);
    }

    /// Malformed frame bytes never panic; they yield errors at worst.
    #[test]
    fn arbitrary_bytes_never_panic(data in prop::collection::vec(any::<u8>(), 0..1024)) {
        for frame in FrameDecoder::default().iter(&data) {
            let _ = frame;
        }
    }

    /// ACK frames round-trip through encode/decode for arbitrary
    /// well-formed block lists.
    #[test]
    fn ack_frame_roundtrip(
        below_largest in 0u64..64,
        extra in prop::collection::vec((0u64..32, 0u64..32), 0..8),
        delay_units in 0u64..1_000_000,
    ) {
        // Build descending blocks; keep everything above zero.
        let mut needed = below_largest;
        for (gap, len) in &extra {
            needed += gap + 2 + len;
        }
        let largest = needed + 1000;

        let mut blocks: TinyVec<[AckBlock; 8]> = TinyVec::new();
        blocks.push(AckBlock { start: largest - below_largest, end: largest });
        let mut prev_start = largest - below_largest;
        for (gap, len) in &extra {
            let end = prev_start - gap - 2;
            let start = end - len;
            blocks.push(AckBlock { start, end });
            prev_start = start;
        }

        let frame = Frame::Ack(AckFrame {
            largest_acked: largest,
            ack_delay: Duration::from_micros(delay_units * 8),
            blocks,
            ecn: None,
        });

        let mut out = BytesMut::new();
        encode_frame(&frame, &mut out);
        prop_assert_eq!(encoded_size(&frame), out.len());
        prop_assert_eq!(decode_single(&out), frame);
    }

    /// STREAM frames round-trip with arbitrary ids, offsets and data.
    #[test]
    fn stream_frame_roundtrip(
        id in 0u64..(1 << 40),
        offset in 0u64..(1 << 40),
        data in prop::collection::vec(any::<u8>(), 0..512),
        fin in any::<bool>(),
        grouped in any::<bool>(),
    ) {
        let frame = Frame::Stream(StreamFrame {
            stream_id: StreamId::new(id),
            group_id: grouped.then_some(id / 2),
            offset,
            data: &data,
            fin,
        });
        let mut out = BytesMut::new();
        encode_frame(&frame, &mut out);
        prop_assert_eq!(encoded_size(&frame), out.len());
        prop_assert_eq!(decode_single(&out), frame);
    }

    /// RESET_STREAM / RESET_STREAM_AT round-trip.
    #[test]
    fn reset_frame_roundtrip(
        id in 0u64..(1 << 40),
        error_code in 0u64..(1 << 40),
        final_size in 0u64..(1 << 40),
        reliable in any::<bool>(),
    ) {
        let frame = Frame::ResetStream(ResetStreamFrame {
            stream_id: StreamId::new(id),
            error_code,
            final_size,
            reliable_size: reliable.then_some(final_size / 2),
        });
        let mut out = BytesMut::new();
        encode_frame(&frame, &mut out);
        prop_assert_eq!(decode_single(&out), frame);
    }

    /// Any insertion order yields the same canonical interval set, and
    /// membership agrees with the underlying values.
    #[test]
    fn range_set_is_permutation_insensitive(
        values in prop::collection::vec(0u64..256, 1..64).prop_shuffle(),
    ) {
        let mut shuffled = RangeSet::new();
        for &v in &values {
            shuffled.insert_one(v);
        }
        let mut sorted_values = values.clone();
        sorted_values.sort_unstable();
        let mut sorted = RangeSet::new();
        for &v in &sorted_values {
            sorted.insert_one(v);
        }
        prop_assert_eq!(&shuffled, &sorted);

        for probe in 0u64..256 {
            prop_assert_eq!(shuffled.contains(probe), values.contains(&probe));
        }
    }

    /// Any arrival interleaving whose union covers [0, N) delivers
    /// exactly bytes 0..N in order, each once.
    #[test]
    fn reassembly_delivers_in_order(
        payload in prop::collection::vec(any::<u8>(), 1..512),
        cuts in prop::collection::vec(any::<prop::sample::Index>(), 0..8),
        order in prop::collection::vec(any::<prop::sample::Index>(), 8),
        duplicate_first in any::<bool>(),
    ) {
        // Partition the payload at the cut points.
        let mut offsets: Vec<usize> = cuts.iter().map(|i| i.index(payload.len())).collect();
        offsets.push(0);
        offsets.push(payload.len());
        offsets.sort_unstable();
        offsets.dedup();

        let mut segments: Vec<(u64, &[u8])> = offsets
            .windows(2)
            .map(|w| (w[0] as u64, &payload[w[0]..w[1]]))
            .collect();

        // Shuffle deterministically via the index vector.
        let segments_len = segments.len();
        for (i, idx) in order.iter().enumerate().take(segments_len) {
            segments.swap(i, idx.index(segments_len));
        }
        if duplicate_first && !segments.is_empty() {
            segments.push(segments[0]);
        }

        let mut half = RecvHalf::default();
        for &(offset, data) in &segments {
            half.on_data(offset, data, false).expect("consistent data");
        }

        let mut collected = Vec::new();
        loop {
            let (chunk, _) = half.read(usize::MAX);
            if chunk.is_empty() {
                break;
            }
            collected.extend_from_slice(&chunk);
        }
        prop_assert_eq!(collected, payload);
    }

    /// The send window never lets committed bytes exceed the advertised
    /// limit, whatever the interleaving of grants and sends.
    #[test]
    fn send_window_never_overcommits(
        ops in prop::collection::vec((any::<bool>(), 1u64..5000), 1..64),
    ) {
        let mut window = argent_quic::flow_control::SendWindow::new(10_000);
        for (is_grant, amount) in ops {
            if is_grant {
                window.on_max(window.peer_max() + amount);
            } else {
                let take = amount.min(window.available());
                if take > 0 {
                    window.consume(take).expect("within available");
                }
            }
            prop_assert!(window.used() <= window.peer_max());
        }
    }
}

#[test]
fn spec_ack_scenario_decodes_exact_ranges() {
    // largest 1000, delay 100 @ exponent 3, blocks (10,10) (10,0) (0,10).
    let mut buf = BytesMut::new();
    for v in [0x02u64, 1000, 100, 3, 10, 10, 10, 10, 0, 0, 10] {
        VarIntCodec::put(v, &mut buf);
    }
    let Frame::Ack(ack) = decode_single(&buf) else { panic!("not an ack") };
    let ranges: Vec<(u64, u64)> = ack.blocks.iter().map(|b| (b.start, b.end)).collect();
    assert_eq!(ranges, vec![(990, 1000), (968, 978), (956, 956), (944, 954)]);
    assert_eq!(ack.ack_delay, Duration::from_micros(800));
}
