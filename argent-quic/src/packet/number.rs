//! Packet number truncation (RFC 9000 Section 17.1, Appendices A.2/A.3).
//!
//! Numbers go on the wire in 1-4 bytes relative to the largest
//! acknowledged; the decoder reconstructs the full 62-bit value around
//! `largest_received + 1`.

#![forbid(unsafe_code)]

use crate::error::{QuicError, Result};
use crate::types::PacketNumber;

/// Wire length of a truncated packet number.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketNumberLen {
    One = 1,
    Two = 2,
    Three = 3,
    Four = 4,
}

impl PacketNumberLen {
    /// Low two bits of the (unprotected) first header byte.
    pub fn from_bits(bits: u8) -> Self {
        match bits & 0x3 {
            0 => PacketNumberLen::One,
            1 => PacketNumberLen::Two,
            2 => PacketNumberLen::Three,
            _ => PacketNumberLen::Four,
        }
    }

    pub fn to_bits(self) -> u8 {
        self as u8 - 1
    }

    pub fn bytes(self) -> usize {
        self as usize
    }

    pub fn bits(self) -> usize {
        self.bytes() * 8
    }
}

/// Smallest encoding that disambiguates `full_pn` against everything at
/// or below `largest_acked` (RFC 9000 Appendix A.2).
pub fn packet_number_len(full_pn: PacketNumber, largest_acked: Option<PacketNumber>) -> PacketNumberLen {
    let num_unacked = match largest_acked {
        Some(acked) => full_pn.saturating_sub(acked),
        None => full_pn + 1,
    };
    if num_unacked < 1 << 7 {
        PacketNumberLen::One
    } else if num_unacked < 1 << 15 {
        PacketNumberLen::Two
    } else if num_unacked < 1 << 23 {
        PacketNumberLen::Three
    } else {
        PacketNumberLen::Four
    }
}

/// Truncate `full_pn` to `len` big-endian bytes.
pub fn encode_packet_number(full_pn: PacketNumber, len: PacketNumberLen, out: &mut bytes::BytesMut) {
    let bytes = full_pn.to_be_bytes();
    out.extend_from_slice(&bytes[8 - len.bytes()..]);
}

/// Read `len` big-endian bytes as the truncated number.
pub fn parse_truncated(buf: &[u8], len: PacketNumberLen) -> Result<u32> {
    if buf.len() < len.bytes() {
        return Err(QuicError::frame_encoding("truncated packet number"));
    }
    let mut value = 0u32;
    for &b in &buf[..len.bytes()] {
        value = (value << 8) | b as u32;
    }
    Ok(value)
}

/// Reconstruct the full packet number (RFC 9000 Appendix A.3): of the
/// candidates sharing the truncated low bits, pick the one closest to
/// `largest_received + 1`.
pub fn decode_packet_number(
    largest_received: Option<PacketNumber>,
    truncated: u32,
    bits: usize,
) -> PacketNumber {
    let expected = largest_received.map_or(0, |l| l + 1);
    let win = 1u64 << bits;
    let hwin = win / 2;
    let mask = win - 1;

    let candidate = (expected & !mask) | truncated as u64;
    if candidate + hwin <= expected && candidate + win < (1u64 << 62) {
        candidate + win
    } else if candidate > expected + hwin && candidate >= win {
        candidate - win
    } else {
        candidate
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;

    #[test]
    fn rfc_appendix_a_example() {
        // RFC 9000 Appendix A.3: largest 0xa82f30ea, truncated 0x9b32.
        assert_eq!(decode_packet_number(Some(0xa82f30ea), 0x9b32, 16), 0xa82f9b32);
    }

    #[test]
    fn wraparound_upward() {
        assert_eq!(decode_packet_number(Some(255), 0, 8), 256);
        assert_eq!(decode_packet_number(Some(65535), 0, 16), 65536);
    }

    #[test]
    fn first_packet_in_space() {
        assert_eq!(decode_packet_number(None, 0, 8), 0);
        assert_eq!(decode_packet_number(None, 3, 8), 3);
    }

    #[test]
    fn length_choice_tracks_ack_distance() {
        assert_eq!(packet_number_len(10, Some(5)), PacketNumberLen::One);
        assert_eq!(packet_number_len(300, Some(5)), PacketNumberLen::Two);
        assert_eq!(packet_number_len(70_000, Some(5)), PacketNumberLen::Three);
        assert_eq!(packet_number_len(10_000_000, Some(5)), PacketNumberLen::Four);
        assert_eq!(packet_number_len(0, None), PacketNumberLen::One);
    }

    #[test]
    fn encode_decode_roundtrip() {
        for (full, largest) in [(42u64, Some(40u64)), (1_000_000, Some(999_950)), (0, None), (256, Some(255))] {
            let len = packet_number_len(full, largest);
            let mut out = BytesMut::new();
            encode_packet_number(full, len, &mut out);
            let truncated = parse_truncated(&out, len).unwrap();
            // Receiver expectation: decoding happens against its own
            // largest received, here one below the sent number.
            let decoded = decode_packet_number(full.checked_sub(1), truncated, len.bits());
            assert_eq!(decoded, full);
        }
    }

    #[test]
    fn truncated_buffer_rejected() {
        assert!(parse_truncated(&[0x12], PacketNumberLen::Two).is_err());
    }
}
