//! Connection ID lifecycle (RFC 9000 Sections 5.1, 10.3).
//!
//! Each endpoint issues self-CIDs with stateless reset tokens up to the
//! peer's `active_connection_id_limit`, and tracks the peer's CIDs by
//! sequence number. Retirement is monotone per sequence number.

#![forbid(unsafe_code)]

use crate::error::{QuicError, Result, TransportErrorCode};
use crate::frames::NewConnectionIdFrame;
use crate::types::{ConnectionId, StatelessResetToken};

/// A connection ID we issued for the peer to route with.
#[derive(Debug, Clone)]
pub struct SelfCid {
    pub sequence: u64,
    pub cid: ConnectionId,
    pub reset_token: StatelessResetToken,
    pub retired: bool,
}

/// A connection ID the peer issued for us to route with.
#[derive(Debug, Clone)]
pub struct PeerCid {
    pub sequence: u64,
    pub cid: ConnectionId,
    pub reset_token: Option<StatelessResetToken>,
    pub in_use: bool,
}

#[derive(Debug)]
pub struct CidManager {
    self_cids: Vec<SelfCid>,
    peer_cids: Vec<PeerCid>,

    next_self_sequence: u64,
    self_cid_len: usize,

    /// The peer's `active_connection_id_limit`.
    peer_limit: u64,

    /// Sequences below this were retired by peer request.
    retire_prior_to: u64,

    /// NEW_CONNECTION_ID frames owed to the peer.
    pending_issue: Vec<u64>,

    /// RETIRE_CONNECTION_ID frames owed to the peer.
    pending_retirements: Vec<u64>,
}

impl CidManager {
    /// Start with the handshake-established CID pair at sequence 0.
    pub fn new(initial_self: SelfCid, initial_peer: ConnectionId) -> Self {
        let self_cid_len = initial_self.cid.len();
        Self {
            self_cids: vec![initial_self],
            peer_cids: vec![PeerCid { sequence: 0, cid: initial_peer, reset_token: None, in_use: true }],
            next_self_sequence: 1,
            self_cid_len,
            peer_limit: 2,
            retire_prior_to: 0,
            pending_issue: Vec::new(),
            pending_retirements: Vec::new(),
        }
    }

    pub fn set_peer_limit(&mut self, limit: u64) {
        self.peer_limit = limit.max(2);
    }

    /// Adopt the server's handshake SCID as peer CID sequence 0
    /// (RFC 9000 Section 7.2: the client switches on the first response).
    pub fn update_initial_peer_cid(&mut self, cid: ConnectionId) {
        if let Some(entry) = self.peer_cids.iter_mut().find(|c| c.sequence == 0) {
            entry.cid = cid;
        }
    }

    pub fn self_cid_len(&self) -> usize {
        self.self_cid_len
    }

    /// The CID currently used to address the peer.
    pub fn active_peer_cid(&self) -> &ConnectionId {
        &self
            .peer_cids
            .iter()
            .find(|c| c.in_use)
            .unwrap_or(&self.peer_cids[0])
            .cid
    }

    /// Whether `cid` routes to this connection.
    pub fn owns_self_cid(&self, cid: &ConnectionId) -> bool {
        self.self_cids.iter().any(|c| !c.retired && &c.cid == cid)
    }

    /// Our current source CID for long headers.
    pub fn active_self_cid(&self) -> &ConnectionId {
        &self
            .self_cids
            .iter()
            .find(|c| !c.retired)
            .unwrap_or(&self.self_cids[0])
            .cid
    }

    /// Anything owed to the peer (issues or retirements)?
    pub fn has_pending(&self) -> bool {
        !self.pending_issue.is_empty() || !self.pending_retirements.is_empty()
    }

    /// Mint self-CIDs up to the peer's quota; returns frames to send.
    pub fn issue_self_cids(&mut self, rng: &mut dyn rand::RngCore) -> Vec<NewConnectionIdFrame> {
        let mut frames = Vec::new();
        let active = self.self_cids.iter().filter(|c| !c.retired).count() as u64;
        for _ in active..self.peer_limit {
            let cid = ConnectionId::random(rng, self.self_cid_len.max(8));
            let mut reset_token = [0u8; 16];
            rng.fill_bytes(&mut reset_token);
            let sequence = self.next_self_sequence;
            self.next_self_sequence += 1;
            self.self_cids.push(SelfCid { sequence, cid: cid.clone(), reset_token, retired: false });
            self.pending_issue.push(sequence);
            frames.push(NewConnectionIdFrame {
                sequence,
                retire_prior_to: self.retire_prior_to,
                cid,
                reset_token,
            });
        }
        frames
    }

    /// Frame payload for re-issuing a sequence (retransmission path).
    pub fn reissue_frame(&self, sequence: u64) -> Option<NewConnectionIdFrame> {
        self.self_cids
            .iter()
            .find(|c| c.sequence == sequence && !c.retired)
            .map(|c| NewConnectionIdFrame {
                sequence: c.sequence,
                retire_prior_to: self.retire_prior_to,
                cid: c.cid.clone(),
                reset_token: c.reset_token,
            })
    }

    /// Peer retired one of our CIDs.
    pub fn on_retire_cid(&mut self, sequence: u64, packet_dcid: &ConnectionId) -> Result<()> {
        if sequence >= self.next_self_sequence {
            return Err(QuicError::new(
                TransportErrorCode::ProtocolViolation,
                "retired sequence never issued",
            ));
        }
        let entry = self
            .self_cids
            .iter_mut()
            .find(|c| c.sequence == sequence)
            .ok_or_else(|| QuicError::protocol_violation("retired unknown sequence"))?;
        // RFC 9000 Section 19.16: the frame must not name the CID it
        // arrived on.
        if &entry.cid == packet_dcid {
            return Err(QuicError::protocol_violation("retired the carrying CID"));
        }
        entry.retired = true;
        Ok(())
    }

    /// Peer issued a new CID for us.
    pub fn on_new_cid(&mut self, frame: &NewConnectionIdFrame) -> Result<()> {
        // A re-announcement must match exactly.
        if let Some(existing) = self.peer_cids.iter().find(|c| c.sequence == frame.sequence) {
            if existing.cid != frame.cid {
                return Err(QuicError::protocol_violation("sequence reused for different CID"));
            }
            return Ok(());
        }

        let active = self.peer_cids.iter().filter(|c| frame.retire_prior_to <= c.sequence).count();
        // Count the new one too.
        if active as u64 + 1 > self.peer_limit.max(2) * 2 {
            // Generous local bound; the strict quota is ours to enforce
            // via our own transport parameter.
            return Err(QuicError::new(
                TransportErrorCode::ConnectionIdLimitError,
                "peer exceeded CID quota",
            ));
        }

        self.peer_cids.push(PeerCid {
            sequence: frame.sequence,
            cid: frame.cid.clone(),
            reset_token: Some(frame.reset_token),
            in_use: false,
        });

        if frame.retire_prior_to > self.retire_prior_to {
            self.retire_prior_to = frame.retire_prior_to;
            self.retire_peer_cids_below(frame.retire_prior_to);
        }
        Ok(())
    }

    fn retire_peer_cids_below(&mut self, floor: u64) {
        let mut must_switch = false;
        let mut retired = Vec::new();
        self.peer_cids.retain(|c| {
            if c.sequence < floor {
                retired.push(c.sequence);
                must_switch |= c.in_use;
                false
            } else {
                true
            }
        });
        self.pending_retirements.extend(retired);
        if must_switch || !self.peer_cids.iter().any(|c| c.in_use) {
            if let Some(next) = self.peer_cids.iter_mut().min_by_key(|c| c.sequence) {
                next.in_use = true;
            }
        }
    }

    /// Switch to a fresh peer CID (migration); retires the old one.
    pub fn rotate_peer_cid(&mut self) -> Option<ConnectionId> {
        let current = self.peer_cids.iter().position(|c| c.in_use)?;
        let fresh = self
            .peer_cids
            .iter()
            .position(|c| !c.in_use && c.sequence > self.peer_cids[current].sequence)?;
        let old_seq = self.peer_cids[current].sequence;
        self.peer_cids[current].in_use = false;
        self.peer_cids[fresh].in_use = true;
        let cid = self.peer_cids[fresh].cid.clone();
        self.pending_retirements.push(old_seq);
        self.peer_cids.retain(|c| c.sequence != old_seq);
        Some(cid)
    }

    /// NEW_CONNECTION_ID sequences owed to the peer.
    pub fn take_pending_issues(&mut self) -> Vec<u64> {
        core::mem::take(&mut self.pending_issue)
    }

    /// RETIRE_CONNECTION_ID frames owed to the peer.
    pub fn take_pending_retirements(&mut self) -> Vec<u64> {
        core::mem::take(&mut self.pending_retirements)
    }

    pub fn requeue_retirement(&mut self, sequence: u64) {
        if !self.pending_retirements.contains(&sequence) {
            self.pending_retirements.push(sequence);
        }
    }

    /// Does a datagram tail match any peer-issued stateless reset token?
    pub fn matches_reset_token(&self, token: &StatelessResetToken) -> bool {
        self.peer_cids
            .iter()
            .any(|c| c.reset_token.as_ref() == Some(token))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::mock::StepRng;

    fn manager() -> CidManager {
        let self_cid = SelfCid {
            sequence: 0,
            cid: ConnectionId::from_slice(&[1; 8]).unwrap(),
            reset_token: [0xaa; 16],
            retired: false,
        };
        CidManager::new(self_cid, ConnectionId::from_slice(&[2; 8]).unwrap())
    }

    #[test]
    fn issue_up_to_peer_limit() {
        let mut mgr = manager();
        mgr.set_peer_limit(4);
        let mut rng = StepRng::new(7, 11);
        let frames = mgr.issue_self_cids(&mut rng);
        assert_eq!(frames.len(), 3);
        assert_eq!(frames[0].sequence, 1);
        assert_eq!(frames[2].sequence, 3);
        // Quota full: nothing more to issue.
        assert!(mgr.issue_self_cids(&mut rng).is_empty());
    }

    #[test]
    fn retire_validations() {
        let mut mgr = manager();
        mgr.set_peer_limit(3);
        let mut rng = StepRng::new(7, 11);
        let frames = mgr.issue_self_cids(&mut rng);
        let other_dcid = ConnectionId::from_slice(&[9; 8]).unwrap();

        // Retiring an unissued sequence is a violation.
        assert!(mgr.on_retire_cid(99, &other_dcid).is_err());
        // Retiring the CID the packet arrived on is a violation.
        let carried = frames[0].cid.clone();
        assert!(mgr.on_retire_cid(frames[0].sequence, &carried).is_err());
        // A proper retirement succeeds and frees quota.
        mgr.on_retire_cid(frames[0].sequence, &other_dcid).unwrap();
        assert!(!mgr.owns_self_cid(&carried));
        assert_eq!(mgr.issue_self_cids(&mut rng).len(), 1);
    }

    #[test]
    fn new_cid_sequence_reuse_rejected() {
        let mut mgr = manager();
        let frame = NewConnectionIdFrame {
            sequence: 1,
            retire_prior_to: 0,
            cid: ConnectionId::from_slice(&[3; 8]).unwrap(),
            reset_token: [1; 16],
        };
        mgr.on_new_cid(&frame).unwrap();
        // Exact duplicate is fine.
        mgr.on_new_cid(&frame).unwrap();
        // Same sequence, different CID is not.
        let conflicting = NewConnectionIdFrame {
            cid: ConnectionId::from_slice(&[4; 8]).unwrap(),
            ..frame
        };
        assert!(mgr.on_new_cid(&conflicting).is_err());
    }

    #[test]
    fn retire_prior_to_rotates_active_cid() {
        let mut mgr = manager();
        for seq in 1..=2u64 {
            mgr.on_new_cid(&NewConnectionIdFrame {
                sequence: seq,
                retire_prior_to: 0,
                cid: ConnectionId::from_slice(&[seq as u8 + 10; 8]).unwrap(),
                reset_token: [seq as u8; 16],
            })
            .unwrap();
        }
        // Peer demands retirement of everything below 2.
        mgr.on_new_cid(&NewConnectionIdFrame {
            sequence: 3,
            retire_prior_to: 2,
            cid: ConnectionId::from_slice(&[33; 8]).unwrap(),
            reset_token: [3; 16],
        })
        .unwrap();
        let retired = mgr.take_pending_retirements();
        assert!(retired.contains(&0));
        assert!(retired.contains(&1));
        // The active CID moved to a surviving sequence.
        assert_eq!(mgr.active_peer_cid(), &ConnectionId::from_slice(&[12; 8]).unwrap());
    }

    #[test]
    fn rotation_for_migration() {
        let mut mgr = manager();
        mgr.on_new_cid(&NewConnectionIdFrame {
            sequence: 1,
            retire_prior_to: 0,
            cid: ConnectionId::from_slice(&[7; 8]).unwrap(),
            reset_token: [7; 16],
        })
        .unwrap();
        let fresh = mgr.rotate_peer_cid().unwrap();
        assert_eq!(fresh, ConnectionId::from_slice(&[7; 8]).unwrap());
        assert_eq!(mgr.take_pending_retirements(), vec![0]);
        // No spare CID left: rotation unavailable.
        assert!(mgr.rotate_peer_cid().is_none());
    }

    #[test]
    fn stateless_reset_token_matching() {
        let mut mgr = manager();
        mgr.on_new_cid(&NewConnectionIdFrame {
            sequence: 1,
            retire_prior_to: 0,
            cid: ConnectionId::from_slice(&[7; 8]).unwrap(),
            reset_token: [0x5c; 16],
        })
        .unwrap();
        assert!(mgr.matches_reset_token(&[0x5c; 16]));
        assert!(!mgr.matches_reset_token(&[0; 16]));
    }
}
