//! Address validation token payloads (RFC 9000 Section 8.1).
//!
//! The core emits and parses the *plaintext* token layout; sealing and
//! opening is the external token cipher's job. Layout:
//! `[timestamp_ms: u64 BE][tag: u8][variant payload]` where the Retry
//! variant carries the original DCID plus the client's address, and the
//! NEW_TOKEN variant carries only the address.

#![forbid(unsafe_code)]

use crate::error::{QuicError, Result, TransportErrorCode};
use crate::types::{ConnectionId, MAX_CID_LENGTH};
use bytes::{BufMut, Bytes, BytesMut};
use core::time::Duration;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

const TAG_RETRY: u8 = 0x01;
const TAG_NEW_TOKEN: u8 = 0x02;

const FAMILY_V4: u8 = 4;
const FAMILY_V6: u8 = 6;

/// How a token was minted; Retry tokens bind the original DCID and port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TokenVariant {
    Retry {
        original_dcid: ConnectionId,
        ip: IpAddr,
        port: u16,
    },
    NewToken {
        ip: IpAddr,
    },
}

/// Decrypted token contents.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlaintextToken {
    /// Wall-clock milliseconds at minting.
    pub timestamp_ms: u64,
    pub variant: TokenVariant,
}

impl PlaintextToken {
    pub fn retry(timestamp_ms: u64, original_dcid: ConnectionId, ip: IpAddr, port: u16) -> Self {
        Self { timestamp_ms, variant: TokenVariant::Retry { original_dcid, ip, port } }
    }

    pub fn new_token(timestamp_ms: u64, ip: IpAddr) -> Self {
        Self { timestamp_ms, variant: TokenVariant::NewToken { ip } }
    }

    /// Staleness check against the variant-specific validity window.
    pub fn is_stale(&self, now_ms: u64, max_age: Duration) -> bool {
        now_ms.saturating_sub(self.timestamp_ms) > max_age.as_millis() as u64
    }

    /// Whether the token was minted for `ip`.
    pub fn matches_ip(&self, ip: IpAddr) -> bool {
        match &self.variant {
            TokenVariant::Retry { ip: minted, .. } | TokenVariant::NewToken { ip: minted } => {
                *minted == ip
            }
        }
    }

    pub fn encode(&self) -> Bytes {
        let mut out = BytesMut::new();
        out.put_u64(self.timestamp_ms);
        match &self.variant {
            TokenVariant::Retry { original_dcid, ip, port } => {
                out.put_u8(TAG_RETRY);
                out.put_u8(original_dcid.len() as u8);
                out.put_slice(original_dcid.as_bytes());
                put_ip(ip, &mut out);
                out.put_u16(*port);
            }
            TokenVariant::NewToken { ip } => {
                out.put_u8(TAG_NEW_TOKEN);
                put_ip(ip, &mut out);
            }
        }
        out.freeze()
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        let mut pos = 0usize;
        let timestamp_ms = take(buf, &mut pos, 8).map(|b| {
            u64::from_be_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]])
        })?;
        let tag = take(buf, &mut pos, 1)?[0];
        let variant = match tag {
            TAG_RETRY => {
                let cid_len = take(buf, &mut pos, 1)?[0] as usize;
                if cid_len > MAX_CID_LENGTH {
                    return Err(invalid("token ODCID too long"));
                }
                let original_dcid = ConnectionId::from_slice(take(buf, &mut pos, cid_len)?)
                    .ok_or_else(|| invalid("token ODCID too long"))?;
                let ip = take_ip(buf, &mut pos)?;
                let port = take(buf, &mut pos, 2).map(|b| u16::from_be_bytes([b[0], b[1]]))?;
                TokenVariant::Retry { original_dcid, ip, port }
            }
            TAG_NEW_TOKEN => TokenVariant::NewToken { ip: take_ip(buf, &mut pos)? },
            _ => return Err(invalid("unknown token variant")),
        };
        if pos != buf.len() {
            return Err(invalid("trailing bytes in token"));
        }
        Ok(Self { timestamp_ms, variant })
    }
}

fn invalid(reason: &'static str) -> QuicError {
    QuicError::new(TransportErrorCode::InvalidToken, reason)
}

fn take<'a>(buf: &'a [u8], pos: &mut usize, n: usize) -> Result<&'a [u8]> {
    let out = buf
        .get(*pos..*pos + n)
        .ok_or_else(|| invalid("truncated token"))?;
    *pos += n;
    Ok(out)
}

fn put_ip(ip: &IpAddr, out: &mut BytesMut) {
    match ip {
        IpAddr::V4(v4) => {
            out.put_u8(FAMILY_V4);
            out.put_slice(&v4.octets());
        }
        IpAddr::V6(v6) => {
            out.put_u8(FAMILY_V6);
            out.put_slice(&v6.octets());
        }
    }
}

fn take_ip(buf: &[u8], pos: &mut usize) -> Result<IpAddr> {
    match take(buf, pos, 1)?[0] {
        FAMILY_V4 => {
            let b = take(buf, pos, 4)?;
            Ok(IpAddr::V4(Ipv4Addr::new(b[0], b[1], b[2], b[3])))
        }
        FAMILY_V6 => {
            let b = take(buf, pos, 16)?;
            let mut octets = [0u8; 16];
            octets.copy_from_slice(b);
            Ok(IpAddr::V6(Ipv6Addr::from(octets)))
        }
        _ => Err(invalid("unknown address family")),
    }
}
