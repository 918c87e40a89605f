//! Packet header parsing and construction (RFC 9000 Section 17).
//!
//! Parsing is pre-decryption: it locates the packet number and payload
//! but leaves both protected. Datagrams may coalesce several long-header
//! packets; [`parse_packet`] returns how many bytes the packet occupies
//! so the caller can continue with the remainder.

#![forbid(unsafe_code)]

use super::{LongHeaderType, PacketNumberLen};
use crate::error::{QuicError, Result};
use crate::types::{ConnectionId, VarIntCodec, MAX_CID_LENGTH, QUIC_V1};
use bytes::BytesMut;

/// Header form bit (RFC 9000 Section 17.2): set for long headers.
pub const FORM_BIT: u8 = 0x80;

/// Fixed bit (RFC 9000 Section 17.2/17.3): must be set in v1 packets.
pub const FIXED_BIT: u8 = 0x40;

/// Key phase bit in short headers (RFC 9001 Section 6).
pub const KEY_PHASE_BIT: u8 = 0x04;

/// Spin bit in short headers.
pub const SPIN_BIT: u8 = 0x20;

/// A parsed, still-protected packet header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PacketHeader<'a> {
    /// Version negotiation: version field of zero (RFC 9000 Section 17.2.1).
    VersionNegotiation {
        dcid: ConnectionId,
        scid: ConnectionId,
        versions: Vec<u32>,
    },

    /// Retry packet carrying a token and integrity tag (Section 17.2.5).
    Retry {
        version: u32,
        dcid: ConnectionId,
        scid: ConnectionId,
        token: &'a [u8],
        integrity_tag: [u8; 16],
    },

    /// Initial / 0-RTT / Handshake long header.
    Long {
        ty: LongHeaderType,
        version: u32,
        dcid: ConnectionId,
        scid: ConnectionId,
        /// Initial packets only; empty otherwise.
        token: &'a [u8],
        /// Offset of the (protected) packet number within the packet.
        pn_offset: usize,
        /// Total packet length inside the datagram.
        packet_len: usize,
    },

    /// 1-RTT short header.
    Short {
        dcid: ConnectionId,
        pn_offset: usize,
        packet_len: usize,
    },
}

impl PacketHeader<'_> {
    pub fn dcid(&self) -> &ConnectionId {
        match self {
            PacketHeader::VersionNegotiation { dcid, .. }
            | PacketHeader::Retry { dcid, .. }
            | PacketHeader::Long { dcid, .. }
            | PacketHeader::Short { dcid, .. } => dcid,
        }
    }
}

/// Parse the packet at the front of `datagram`.
///
/// `short_dcid_len` is the length of connection IDs this endpoint issues,
/// needed to delimit short headers. Returns the header and the total
/// packet length; bytes beyond it are further coalesced packets.
pub fn parse_packet<'a>(datagram: &'a [u8], short_dcid_len: usize) -> Result<(PacketHeader<'a>, usize)> {
    let first = *datagram
        .first()
        .ok_or_else(|| QuicError::frame_encoding("empty packet"))?;

    if first & FORM_BIT == 0 {
        return parse_short(datagram, first, short_dcid_len);
    }

    // Long header: version, DCID, SCID.
    let mut pos = 1;
    let version = read_u32(datagram, &mut pos)?;
    let dcid = read_cid(datagram, &mut pos)?;
    let scid = read_cid(datagram, &mut pos)?;

    if version == 0 {
        // Version negotiation ignores the fixed bit and has no length
        // field; it always occupies the whole datagram.
        let mut versions = Vec::new();
        while pos < datagram.len() {
            versions.push(read_u32(datagram, &mut pos)?);
        }
        return Ok((PacketHeader::VersionNegotiation { dcid, scid, versions }, pos));
    }

    if first & FIXED_BIT == 0 {
        return Err(QuicError::frame_encoding("fixed bit clear"));
    }

    let ty = LongHeaderType::from_bits(first >> 4);

    if ty == LongHeaderType::Retry {
        // Everything up to the trailing 16-byte tag is the token.
        let remaining = datagram.len() - pos;
        if remaining < 16 {
            return Err(QuicError::frame_encoding("retry too short for integrity tag"));
        }
        let token = &datagram[pos..datagram.len() - 16];
        let mut integrity_tag = [0u8; 16];
        integrity_tag.copy_from_slice(&datagram[datagram.len() - 16..]);
        return Ok((
            PacketHeader::Retry { version, dcid, scid, token, integrity_tag },
            datagram.len(),
        ));
    }

    let token: &[u8] = if ty == LongHeaderType::Initial {
        let (token_len, consumed) = VarIntCodec::decode(&datagram[pos..])
            .ok_or_else(|| QuicError::frame_encoding("truncated token length"))?;
        pos += consumed;
        if token_len > (datagram.len() - pos) as u64 {
            return Err(QuicError::frame_encoding("token past datagram end"));
        }
        let token = &datagram[pos..pos + token_len as usize];
        pos += token_len as usize;
        token
    } else {
        &[]
    };

    let (length, consumed) = VarIntCodec::decode(&datagram[pos..])
        .ok_or_else(|| QuicError::frame_encoding("truncated length field"))?;
    pos += consumed;
    if length > (datagram.len() - pos) as u64 {
        return Err(QuicError::frame_encoding("length field past datagram end"));
    }

    let packet_len = pos + length as usize;
    Ok((
        PacketHeader::Long { ty, version, dcid, scid, token, pn_offset: pos, packet_len },
        packet_len,
    ))
}

fn parse_short<'a>(
    datagram: &'a [u8],
    first: u8,
    short_dcid_len: usize,
) -> Result<(PacketHeader<'a>, usize)> {
    if first & FIXED_BIT == 0 {
        return Err(QuicError::frame_encoding("fixed bit clear"));
    }
    if datagram.len() < 1 + short_dcid_len {
        return Err(QuicError::frame_encoding("short header truncated"));
    }
    let dcid = ConnectionId::from_slice(&datagram[1..1 + short_dcid_len])
        .ok_or_else(|| QuicError::internal("configured DCID length out of range"))?;
    // A short header packet always extends to the end of the datagram.
    Ok((
        PacketHeader::Short { dcid, pn_offset: 1 + short_dcid_len, packet_len: datagram.len() },
        datagram.len(),
    ))
}

fn read_u32(buf: &[u8], pos: &mut usize) -> Result<u32> {
    if buf.len() < *pos + 4 {
        return Err(QuicError::frame_encoding("truncated 32-bit field"));
    }
    let v = u32::from_be_bytes([buf[*pos], buf[*pos + 1], buf[*pos + 2], buf[*pos + 3]]);
    *pos += 4;
    Ok(v)
}

fn read_cid(buf: &[u8], pos: &mut usize) -> Result<ConnectionId> {
    let len = *buf
        .get(*pos)
        .ok_or_else(|| QuicError::frame_encoding("truncated CID length"))? as usize;
    *pos += 1;
    if len > MAX_CID_LENGTH {
        return Err(QuicError::frame_encoding("CID longer than 20 bytes"));
    }
    if buf.len() < *pos + len {
        return Err(QuicError::frame_encoding("truncated CID"));
    }
    let cid = ConnectionId::from_slice(&buf[*pos..*pos + len]).expect("length checked");
    *pos += len;
    Ok(cid)
}

// ============================================================================
// Construction
// ============================================================================

/// Write a long header up to and including the length field; the caller
/// appends the truncated packet number and payload.
///
/// `length` must already cover packet number bytes, payload and AEAD
/// overhead.
pub fn encode_long_header(
    ty: LongHeaderType,
    version: u32,
    dcid: &ConnectionId,
    scid: &ConnectionId,
    token: &[u8],
    pn_len: PacketNumberLen,
    length: u64,
    out: &mut BytesMut,
) {
    out.extend_from_slice(&[FORM_BIT | FIXED_BIT | ((ty as u8) << 4) | pn_len.to_bits()]);
    out.extend_from_slice(&version.to_be_bytes());
    out.extend_from_slice(&[dcid.len() as u8]);
    out.extend_from_slice(dcid.as_bytes());
    out.extend_from_slice(&[scid.len() as u8]);
    out.extend_from_slice(scid.as_bytes());
    if ty == LongHeaderType::Initial {
        VarIntCodec::put(token.len() as u64, out);
        out.extend_from_slice(token);
    }
    VarIntCodec::put(length, out);
}

/// Write a short header up to the packet number.
pub fn encode_short_header(
    dcid: &ConnectionId,
    key_phase: bool,
    pn_len: PacketNumberLen,
    out: &mut BytesMut,
) {
    let mut first = FIXED_BIT | pn_len.to_bits();
    if key_phase {
        first |= KEY_PHASE_BIT;
    }
    out.extend_from_slice(&[first]);
    out.extend_from_slice(dcid.as_bytes());
}

/// Build a complete version negotiation packet (RFC 9000 Section 17.2.1).
pub fn encode_version_negotiation(
    dcid: &ConnectionId,
    scid: &ConnectionId,
    versions: &[u32],
    out: &mut BytesMut,
) {
    out.extend_from_slice(&[FORM_BIT]);
    out.extend_from_slice(&0u32.to_be_bytes());
    out.extend_from_slice(&[dcid.len() as u8]);
    out.extend_from_slice(dcid.as_bytes());
    out.extend_from_slice(&[scid.len() as u8]);
    out.extend_from_slice(scid.as_bytes());
    for v in versions {
        out.extend_from_slice(&v.to_be_bytes());
    }
}

/// Build a complete Retry packet; the integrity tag is computed by the
/// external retry cipher and supplied here.
pub fn encode_retry(
    dcid: &ConnectionId,
    scid: &ConnectionId,
    token: &[u8],
    integrity_tag: &[u8; 16],
    out: &mut BytesMut,
) {
    out.extend_from_slice(&[FORM_BIT | FIXED_BIT | ((LongHeaderType::Retry as u8) << 4)]);
    out.extend_from_slice(&QUIC_V1.to_be_bytes());
    out.extend_from_slice(&[dcid.len() as u8]);
    out.extend_from_slice(dcid.as_bytes());
    out.extend_from_slice(&[scid.len() as u8]);
    out.extend_from_slice(scid.as_bytes());
    out.extend_from_slice(token);
    out.extend_from_slice(integrity_tag);
}
