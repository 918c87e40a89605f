//! # Cryptographic seams (RFC 9001)
//!
//! The core never derives secrets or computes masks. It consumes three
//! adapter surfaces: an AEAD per protection level, a header cipher per
//! direction, and the [`CryptoHandshake`] driver that turns CRYPTO stream
//! bytes into key material and transport parameters.

#![forbid(unsafe_code)]

pub mod keys;

pub use keys::{KeyPhase, OneRttKeys};

use crate::error::{QuicError, Result};
use crate::settings::TransportParameters;
use crate::types::ConnectionId;
use bytes::Bytes;

/// Encryption levels the handshake produces keys for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EncryptionLevel {
    Initial,
    ZeroRtt,
    Handshake,
    OneRtt,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyDirection {
    Read,
    Write,
}

/// Payload protection for one level and direction.
///
/// `advance` yields the next key-phase generation (RFC 9001 Section 6);
/// only meaningful for 1-RTT keys.
pub trait AeadCipher: Send {
    /// Tag overhead added by `seal`.
    fn overhead(&self) -> usize;

    /// Encrypt `plaintext` with the packet number and header as AAD.
    fn seal(&self, packet_number: u64, header: &[u8], plaintext: &[u8]) -> Result<Bytes>;

    /// Decrypt; failure means the packet is silently dropped by the caller.
    fn open(&self, packet_number: u64, header: &[u8], ciphertext: &[u8]) -> Result<Bytes>;

    /// Derive the cipher for the next key phase.
    fn advance(&self) -> Box<dyn AeadCipher>;
}

/// Header protection: mask derived from a ciphertext sample
/// (RFC 9001 Section 5.4). Unchanged across key updates.
pub trait HeaderCipher: Send {
    fn mask(&self, sample: &[u8; 16]) -> [u8; 5];
}

/// Key material for one level and direction.
pub struct PacketKeys {
    pub aead: Box<dyn AeadCipher>,
    pub header: Box<dyn HeaderCipher>,
}

impl core::fmt::Debug for PacketKeys {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("PacketKeys").finish_non_exhaustive()
    }
}

/// Events surfaced by the handshake driver.
pub enum HandshakeEvent {
    /// Queue crypto bytes on the given level's CRYPTO stream.
    TransmitCryptoData { level: EncryptionLevel, data: Bytes },

    /// Keys became available for a level/direction.
    KeysAvailable {
        level: EncryptionLevel,
        direction: KeyDirection,
        keys: PacketKeys,
    },

    /// TLS handshake finished (server: send HANDSHAKE_DONE).
    HandshakeDone,

    /// The peer's transport parameters arrived.
    PeerTransportParameters(TransportParameters),

    /// Handshake failure with a TLS alert code.
    Failed { alert: u8 },
}

/// The TLS 1.3 handshake adapter (external collaborator).
pub trait CryptoHandshake: Send {
    /// Install Initial secrets derived from the client's first DCID.
    fn install_initial_keys(&mut self, dcid: &ConnectionId) -> Result<()>;

    /// Feed reassembled CRYPTO stream bytes at a level.
    fn feed(&mut self, level: EncryptionLevel, data: &[u8]) -> Result<()>;

    /// Drain pending events.
    fn poll(&mut self) -> Vec<HandshakeEvent>;
}

// ============================================================================
// Header protection application (RFC 9001 Section 5.4.1)
// ============================================================================

/// Sample offset relative to the start of the packet number field.
const SAMPLE_SKIP: usize = 4;

fn sample_at(packet: &[u8], pn_offset: usize) -> Result<[u8; 16]> {
    let start = pn_offset + SAMPLE_SKIP;
    let slice = packet
        .get(start..start + 16)
        .ok_or_else(|| QuicError::frame_encoding("packet too short for header sample"))?;
    let mut sample = [0u8; 16];
    sample.copy_from_slice(slice);
    Ok(sample)
}

/// Mask the first byte and packet number of an assembled packet.
pub fn protect_header(
    packet: &mut [u8],
    pn_offset: usize,
    pn_len: usize,
    hp: &dyn HeaderCipher,
) -> Result<()> {
    let mask = hp.mask(&sample_at(packet, pn_offset)?);
    let bits = if packet[0] & 0x80 != 0 { 0x0f } else { 0x1f };
    packet[0] ^= mask[0] & bits;
    for i in 0..pn_len {
        packet[pn_offset + i] ^= mask[1 + i];
    }
    Ok(())
}

/// Remove header protection in place; returns the unprotected first byte
/// and the packet number length it encodes.
pub fn unprotect_header(
    packet: &mut [u8],
    pn_offset: usize,
    hp: &dyn HeaderCipher,
) -> Result<(u8, usize)> {
    let mask = hp.mask(&sample_at(packet, pn_offset)?);
    let bits = if packet[0] & 0x80 != 0 { 0x0f } else { 0x1f };
    packet[0] ^= mask[0] & bits;
    let pn_len = (packet[0] & 0x03) as usize + 1;
    if packet.len() < pn_offset + pn_len {
        return Err(QuicError::frame_encoding("packet too short for packet number"));
    }
    for i in 0..pn_len {
        packet[pn_offset + i] ^= mask[1 + i];
    }
    Ok((packet[0], pn_len))
}


#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;

    #[test]
    fn header_protection_roundtrip_short() {
        let hp = NullHeaderCipher;
        // Short header: 1 byte + 8-byte DCID + 2-byte PN + payload.
        let mut packet = vec![0x41u8];
        packet.extend_from_slice(&[7u8; 8]);
        packet.extend_from_slice(&[0x01, 0x2c]);
        packet.extend_from_slice(&[0xcc; 20]);
        let original = packet.clone();

        protect_header(&mut packet, 9, 2, &hp).unwrap();
        assert_ne!(packet[0], original[0]);
        assert_ne!(&packet[9..11], &original[9..11]);
        // Payload untouched.
        assert_eq!(&packet[11..], &original[11..]);

        let (first, pn_len) = unprotect_header(&mut packet, 9, &hp).unwrap();
        assert_eq!(packet, original);
        assert_eq!(first, 0x41);
        assert_eq!(pn_len, 2);
    }

    #[test]
    fn header_protection_masks_four_bits_of_long_header() {
        let hp = NullHeaderCipher;
        let mut packet = vec![0xc0u8];
        packet.extend_from_slice(&[0u8; 30]);
        protect_header(&mut packet, 5, 1, &hp).unwrap();
        // Form and fixed bits survive masking.
        assert_eq!(packet[0] & 0xc0, 0xc0);
    }

    #[test]
    fn sample_requires_enough_ciphertext() {
        let hp = NullHeaderCipher;
        let mut packet = vec![0x41u8; 12];
        assert!(protect_header(&mut packet, 9, 1, &hp).is_err());
    }

    #[test]
    fn null_aead_detects_wrong_generation() {
        let gen0 = NullAead { generation: 0 };
        let gen1 = gen0.advance();
        let sealed = gen0.seal(1, b"hdr", b"payload").unwrap();
        assert!(gen1.open(1, b"hdr", &sealed).is_err());
        assert_eq!(gen0.open(1, b"hdr", &sealed).unwrap(), Bytes::from_static(b"payload"));
    }
}
