//! 1-RTT key phase management (RFC 9001 Section 6).
//!
//! Read and write phases advance independently: the writer flips when a
//! local update is initiated, the reader when a packet under the flipped
//! bit authenticates. The previous read generation stays installed so
//! reordered old-phase packets still open.

#![forbid(unsafe_code)]

use super::{AeadCipher, HeaderCipher, PacketKeys};
use crate::error::{QuicError, Result, TransportErrorCode};
use crate::types::PacketNumber;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyPhase {
    Zero,
    One,
}

impl KeyPhase {
    pub fn bit(self) -> bool {
        matches!(self, KeyPhase::One)
    }

    pub fn from_bit(bit: bool) -> Self {
        if bit {
            KeyPhase::One
        } else {
            KeyPhase::Zero
        }
    }

    pub fn flipped(self) -> Self {
        match self {
            KeyPhase::Zero => KeyPhase::One,
            KeyPhase::One => KeyPhase::Zero,
        }
    }

    fn index(self) -> usize {
        self.bit() as usize
    }
}

/// 1-RTT key state for both directions.
///
/// Header protection keys never rotate; only the AEADs advance per phase.
pub struct OneRttKeys {
    write_aead: [Option<Box<dyn AeadCipher>>; 2],
    read_aead: [Option<Box<dyn AeadCipher>>; 2],
    write_hp: Option<Box<dyn HeaderCipher>>,
    read_hp: Option<Box<dyn HeaderCipher>>,

    write_phase: KeyPhase,
    read_phase: KeyPhase,

    /// Ack-eliciting packets sent under the current write phase.
    packets_sent_in_phase: u64,

    /// First packet number sent after a local update; it must be
    /// acknowledged by a packet protected under the new phase.
    pending_verification: Option<PacketNumber>,

    /// An update happened and the first new-phase packet is still unsent.
    awaiting_first_send: bool,
}

impl Default for OneRttKeys {
    fn default() -> Self {
        Self {
            write_aead: [None, None],
            read_aead: [None, None],
            write_hp: None,
            read_hp: None,
            write_phase: KeyPhase::Zero,
            read_phase: KeyPhase::Zero,
            packets_sent_in_phase: 0,
            pending_verification: None,
            awaiting_first_send: false,
        }
    }
}

impl OneRttKeys {
    pub fn install_write(&mut self, keys: PacketKeys) {
        self.write_aead[KeyPhase::Zero.index()] = Some(keys.aead);
        self.write_hp = Some(keys.header);
    }

    pub fn install_read(&mut self, keys: PacketKeys) {
        self.read_aead[KeyPhase::Zero.index()] = Some(keys.aead);
        self.read_hp = Some(keys.header);
    }

    pub fn write_ready(&self) -> bool {
        self.write_aead[self.write_phase.index()].is_some()
    }

    pub fn read_ready(&self) -> bool {
        self.read_hp.is_some()
    }

    pub fn write_phase(&self) -> KeyPhase {
        self.write_phase
    }

    pub fn read_phase(&self) -> KeyPhase {
        self.read_phase
    }

    pub fn write_cipher(&self) -> Result<(&dyn AeadCipher, &dyn HeaderCipher)> {
        let aead = self.write_aead[self.write_phase.index()]
            .as_deref()
            .ok_or_else(|| QuicError::internal("1-RTT write keys not installed"))?;
        let hp = self
            .write_hp
            .as_deref()
            .ok_or_else(|| QuicError::internal("1-RTT header keys not installed"))?;
        Ok((aead, hp))
    }

    pub fn read_header_cipher(&self) -> Result<&dyn HeaderCipher> {
        self.read_hp
            .as_deref()
            .ok_or_else(|| QuicError::internal("1-RTT read keys not installed"))
    }

    /// AEAD for an incoming packet's key-phase bit. A flipped bit selects
    /// the next generation, derived on demand; the phase only commits via
    /// [`confirm_read_phase`](Self::confirm_read_phase) once the packet
    /// authenticates.
    pub fn read_cipher(&mut self, bit: bool) -> Result<&dyn AeadCipher> {
        let phase = KeyPhase::from_bit(bit);
        if phase != self.read_phase && self.read_aead[phase.index()].is_none() {
            let next = self.read_aead[self.read_phase.index()]
                .as_deref()
                .ok_or_else(|| QuicError::internal("1-RTT read keys not installed"))?
                .advance();
            self.read_aead[phase.index()] = Some(next);
        }
        self.read_aead[phase.index()]
            .as_deref()
            .ok_or_else(|| QuicError::internal("1-RTT read keys not installed"))
    }

    /// Commit a read-phase advance after a packet under `bit` opened.
    pub fn confirm_read_phase(&mut self, bit: bool) {
        let phase = KeyPhase::from_bit(bit);
        if phase != self.read_phase {
            tracing::debug!(?phase, "read key phase advanced");
            self.read_phase = phase;
        }
    }

    /// Locally initiate a key update (RFC 9001 Section 6.1).
    pub fn initiate_update(&mut self) -> Result<()> {
        if self.pending_verification.is_some() {
            // The previous update has not been confirmed yet.
            return Err(QuicError::new(
                TransportErrorCode::KeyUpdateError,
                "key update while previous unconfirmed",
            ));
        }
        let next_phase = self.write_phase.flipped();
        let next = self.write_aead[self.write_phase.index()]
            .as_deref()
            .ok_or_else(|| QuicError::internal("1-RTT write keys not installed"))?
            .advance();
        self.write_aead[next_phase.index()] = Some(next);
        self.write_phase = next_phase;
        self.packets_sent_in_phase = 0;
        self.awaiting_first_send = true;
        tracing::debug!(phase = ?next_phase, "write key phase advanced");
        Ok(())
    }

    /// Record an ack-eliciting 1-RTT send; the first send after an update
    /// becomes the verification anchor.
    pub fn on_packet_sent(&mut self, pn: PacketNumber) {
        if self.awaiting_first_send {
            self.pending_verification = Some(pn);
            self.awaiting_first_send = false;
        }
        self.packets_sent_in_phase += 1;
    }

    /// Whether a local update is due under the configured interval.
    pub fn update_due(&self, interval: u64) -> bool {
        interval > 0
            && self.packets_sent_in_phase >= interval
            && self.pending_verification.is_none()
            && !self.awaiting_first_send
    }

    /// Validate an ACK against the phase it arrived under. An ACK that
    /// covers a post-update packet but was itself protected with the old
    /// phase is a key update failure.
    pub fn validate_ack_phase(&mut self, rx_phase: KeyPhase, largest_acked: PacketNumber) -> Result<()> {
        if let Some(anchor) = self.pending_verification {
            if largest_acked >= anchor {
                if rx_phase != self.write_phase {
                    return Err(QuicError::new(
                        TransportErrorCode::KeyUpdateError,
                        "new-phase packet acknowledged under old phase",
                    ));
                }
                self.pending_verification = None;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::testing::null_keys;

    fn installed() -> OneRttKeys {
        let mut keys = OneRttKeys::default();
        keys.install_write(null_keys());
        keys.install_read(null_keys());
        keys
    }

    #[test]
    fn phases_start_at_zero() {
        let keys = installed();
        assert_eq!(keys.write_phase(), KeyPhase::Zero);
        assert_eq!(keys.read_phase(), KeyPhase::Zero);
        assert!(keys.write_ready());
        assert!(keys.read_ready());
    }

    #[test]
    fn initiate_update_flips_write_phase_only() {
        let mut keys = installed();
        keys.initiate_update().unwrap();
        assert_eq!(keys.write_phase(), KeyPhase::One);
        assert_eq!(keys.read_phase(), KeyPhase::Zero);
    }

    #[test]
    fn read_phase_advances_on_confirmation() {
        let mut keys = installed();
        // A packet arrives with the flipped bit: next keys derive on
        // demand, phase commits only after confirmation.
        keys.read_cipher(true).unwrap();
        assert_eq!(keys.read_phase(), KeyPhase::Zero);
        keys.confirm_read_phase(true);
        assert_eq!(keys.read_phase(), KeyPhase::One);
        // Old-phase packets still have keys installed.
        keys.read_cipher(false).unwrap();
    }

    #[test]
    fn update_due_tracks_sent_counter() {
        let mut keys = installed();
        for pn in 0..5 {
            keys.on_packet_sent(pn);
        }
        assert!(!keys.update_due(10));
        assert!(keys.update_due(5));
        assert!(!keys.update_due(0));
    }

    #[test]
    fn ack_under_old_phase_fails_verification() {
        let mut keys = installed();
        keys.initiate_update().unwrap();
        keys.on_packet_sent(42);

        // Peer acknowledges packet 42 but still sends under phase zero.
        let err = keys.validate_ack_phase(KeyPhase::Zero, 42).unwrap_err();
        assert_eq!(err.code, TransportErrorCode::KeyUpdateError);
    }

    #[test]
    fn ack_under_new_phase_confirms_update() {
        let mut keys = installed();
        keys.initiate_update().unwrap();
        keys.on_packet_sent(42);
        keys.validate_ack_phase(KeyPhase::One, 42).unwrap();
        // A second update is now allowed.
        keys.initiate_update().unwrap();
    }

    #[test]
    fn double_update_without_confirmation_rejected() {
        let mut keys = installed();
        keys.initiate_update().unwrap();
        keys.on_packet_sent(1);
        assert!(keys.initiate_update().is_err());
    }
}
