//! # Core transport types (RFC 8999, RFC 9000)
//!
//! Fundamental vocabulary shared by every module: variable-length
//! integers, connection and stream identifiers, and the monotonic clock
//! abstraction the rest of the core is driven by.

#![forbid(unsafe_code)]

use bytes::Bytes;
use core::time::Duration;

// ============================================================================
// Variable-Length Integer Encoding (RFC 9000 Section 16)
// ============================================================================

/// Variable-length integer (RFC 9000 Section 16).
///
/// The two most-significant bits of the first byte select the width:
/// `00` = 1 byte, `01` = 2 bytes, `10` = 4 bytes, `11` = 8 bytes.
pub type VarInt = u64;

/// Maximum encodable value, 2^62 - 1.
pub const VARINT_MAX: u64 = (1u64 << 62) - 1;

/// VarInt encode/decode utilities.
pub struct VarIntCodec;

impl VarIntCodec {
    /// Decode a VarInt from the front of `buf`, returning `(value, consumed)`.
    ///
    /// Returns `None` on truncation.
    pub fn decode(buf: &[u8]) -> Option<(VarInt, usize)> {
        let first = *buf.first()?;
        let len = 1usize << (first >> 6);
        if buf.len() < len {
            return None;
        }
        let mut value = (first & 0x3f) as u64;
        for b in &buf[1..len] {
            value = (value << 8) | *b as u64;
        }
        Some((value, len))
    }

    /// Encode `value` into `buf`, returning bytes written.
    ///
    /// Returns `None` if `value` exceeds [`VARINT_MAX`] or `buf` is too small.
    pub fn encode(value: VarInt, buf: &mut [u8]) -> Option<usize> {
        if value > VARINT_MAX {
            return None;
        }
        let len = Self::size(value);
        if buf.len() < len {
            return None;
        }
        let tag = (len.trailing_zeros() as u8) << 6;
        for (i, slot) in buf[..len].iter_mut().enumerate() {
            *slot = (value >> ((len - 1 - i) * 8)) as u8;
        }
        buf[0] |= tag;
        Some(len)
    }

    /// Append `value` to a growable buffer.
    ///
    /// Panics only if `value` exceeds [`VARINT_MAX`]; callers validate
    /// against field-specific ranges before encoding.
    pub fn put(value: VarInt, out: &mut bytes::BytesMut) {
        debug_assert!(value <= VARINT_MAX);
        let mut scratch = [0u8; 8];
        let len = Self::encode(value, &mut scratch).expect("value within varint range");
        out.extend_from_slice(&scratch[..len]);
    }

    /// Minimum-form encoded size of `value`.
    pub fn size(value: VarInt) -> usize {
        if value < 1 << 6 {
            1
        } else if value < 1 << 14 {
            2
        } else if value < 1 << 30 {
            4
        } else {
            8
        }
    }
}

// ============================================================================
// Connection ID (RFC 9000 Section 5.1)
// ============================================================================

/// Maximum connection ID length (RFC 9000 Section 17.2).
pub const MAX_CID_LENGTH: usize = 20;

/// Opaque connection identifier, 0-20 bytes.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId {
    bytes: Bytes,
}

impl ConnectionId {
    /// Wrap `bytes` as a connection ID; `None` if longer than 20 bytes.
    pub fn new(bytes: Bytes) -> Option<Self> {
        (bytes.len() <= MAX_CID_LENGTH).then_some(Self { bytes })
    }

    /// Copy a connection ID out of a borrowed slice.
    pub fn from_slice(slice: &[u8]) -> Option<Self> {
        (slice.len() <= MAX_CID_LENGTH).then(|| Self {
            bytes: Bytes::copy_from_slice(slice),
        })
    }

    /// Generate a random CID of `len` bytes from the injected RNG.
    pub fn random(rng: &mut dyn rand::RngCore, len: usize) -> Self {
        debug_assert!(len <= MAX_CID_LENGTH);
        let mut buf = vec![0u8; len];
        rng.fill_bytes(&mut buf);
        Self { bytes: buf.into() }
    }

    /// Zero-length connection ID.
    pub fn empty() -> Self {
        Self { bytes: Bytes::new() }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

impl core::fmt::Debug for ConnectionId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "Cid(")?;
        for byte in &self.bytes[..] {
            write!(f, "{byte:02x}")?;
        }
        write!(f, ")")
    }
}

// ============================================================================
// Stream ID (RFC 9000 Section 2.1)
// ============================================================================

/// 62-bit stream identifier; the two low bits encode initiator and
/// directionality.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamId(pub u64);

impl StreamId {
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    /// Compose a stream ID from its components.
    pub fn compose(index: u64, initiator: Side, dir: StreamDirection) -> Self {
        let mut bits = index << 2;
        if initiator == Side::Server {
            bits |= 0x01;
        }
        if dir == StreamDirection::Unidirectional {
            bits |= 0x02;
        }
        Self(bits)
    }

    pub fn value(self) -> u64 {
        self.0
    }

    /// The ordinal of this stream among streams of the same type.
    pub fn index(self) -> u64 {
        self.0 >> 2
    }

    pub fn initiator(self) -> Side {
        if self.0 & 0x01 == 0 {
            Side::Client
        } else {
            Side::Server
        }
    }

    pub fn direction(self) -> StreamDirection {
        if self.0 & 0x02 == 0 {
            StreamDirection::Bidirectional
        } else {
            StreamDirection::Unidirectional
        }
    }

    pub fn is_bidirectional(self) -> bool {
        self.direction() == StreamDirection::Bidirectional
    }
}

impl core::fmt::Display for StreamId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Stream directionality.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamDirection {
    Bidirectional,
    Unidirectional,
}

/// Connection endpoint role.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Client,
    Server,
}

impl Side {
    pub fn is_client(self) -> bool {
        matches!(self, Side::Client)
    }

    pub fn peer(self) -> Side {
        match self {
            Side::Client => Side::Server,
            Side::Server => Side::Client,
        }
    }
}

// ============================================================================
// Packet numbers (RFC 9000 Section 12.3)
// ============================================================================

/// 62-bit packet number, monotone within a packet number space.
pub type PacketNumber = u64;

/// Largest valid packet number (2^62 - 1).
pub const MAX_PACKET_NUMBER: u64 = VARINT_MAX;

/// Byte offset within a stream.
pub type StreamOffset = u64;

/// 62-bit application error code carried by RESET_STREAM / STOP_SENDING /
/// CONNECTION_CLOSE (application variant).
pub type ApplicationErrorCode = u64;

/// 16-byte stateless reset token (RFC 9000 Section 10.3).
pub type StatelessResetToken = [u8; 16];

// ============================================================================
// Time (injected, deterministic in tests)
// ============================================================================

/// Monotonic timestamp: nanoseconds since an arbitrary epoch.
///
/// The core never reads a system clock; embedders supply a [`Clock`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Instant {
    nanos: u64,
}

impl Instant {
    pub const ZERO: Instant = Instant { nanos: 0 };

    pub fn from_nanos(nanos: u64) -> Self {
        Self { nanos }
    }

    pub fn from_micros(micros: u64) -> Self {
        Self { nanos: micros.saturating_mul(1_000) }
    }

    pub fn from_millis(millis: u64) -> Self {
        Self { nanos: millis.saturating_mul(1_000_000) }
    }

    pub fn as_nanos(self) -> u64 {
        self.nanos
    }

    /// `self - earlier`, or `None` if `earlier` is later than `self`.
    pub fn duration_since(self, earlier: Instant) -> Option<Duration> {
        self.nanos
            .checked_sub(earlier.nanos)
            .map(Duration::from_nanos)
    }

    /// `self - earlier`, clamped at zero.
    pub fn saturating_duration_since(self, earlier: Instant) -> Duration {
        Duration::from_nanos(self.nanos.saturating_sub(earlier.nanos))
    }

    pub fn checked_add(self, d: Duration) -> Option<Instant> {
        u64::try_from(d.as_nanos())
            .ok()
            .and_then(|n| self.nanos.checked_add(n))
            .map(Instant::from_nanos)
    }
}

impl core::ops::Add<Duration> for Instant {
    type Output = Instant;

    fn add(self, d: Duration) -> Instant {
        Instant::from_nanos(self.nanos.saturating_add(d.as_nanos() as u64))
    }
}

impl core::ops::Sub<Duration> for Instant {
    type Output = Instant;

    fn sub(self, d: Duration) -> Instant {
        Instant::from_nanos(self.nanos.saturating_sub(d.as_nanos() as u64))
    }
}

/// Monotonic clock plus coarse wall time for token timestamps.
pub trait Clock {
    /// Monotonic now.
    fn now(&self) -> Instant;

    /// Wall-clock milliseconds since the Unix epoch; only consumed by the
    /// token codec for staleness decisions.
    fn wall_millis(&self) -> u64;
}

// ============================================================================
// Wire constants (RFC 9000 Section 14)
// ============================================================================

/// Minimum size a client Initial datagram must be padded to.
pub const MIN_INITIAL_PACKET_SIZE: usize = 1200;

/// Default maximum UDP payload the core will emit before the peer's
/// `max_udp_payload_size` transport parameter is known.
pub const DEFAULT_UDP_PAYLOAD_SIZE: usize = 1252;

/// Timer granularity floor used by loss detection (RFC 9002 `kGranularity`).
pub const TIMER_GRANULARITY: Duration = Duration::from_millis(1);

/// QUIC v1 (RFC 9000).
pub const QUIC_V1: u32 = 0x0000_0001;

// ============================================================================
// Unit Tests
// ============================================================================
