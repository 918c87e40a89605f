//! Path state, validation and migration (RFC 9000 Sections 8.2, 9).
//!
//! A path is validated by a PATH_CHALLENGE / PATH_RESPONSE exchange.
//! Challenges spend from a small refilling credit so a port-flapping
//! peer cannot make us probe endlessly, and servers respect the 3x
//! amplification cap until an address validates.

#![forbid(unsafe_code)]

use crate::types::Instant;
use core::time::Duration;
use std::net::SocketAddr;

/// Challenges available per refill window.
const VALIDATION_CREDITS: u32 = 3;

/// Credit refill interval.
const CREDIT_REFILL_INTERVAL: Duration = Duration::from_secs(1);

/// How long to wait for a PATH_RESPONSE before retrying.
const CHALLENGE_TIMEOUT: Duration = Duration::from_millis(500);

/// Pre-validation send budget multiplier (anti-amplification).
const AMPLIFICATION_FACTOR: u64 = 3;

#[derive(Debug)]
pub struct PathState {
    pub peer: SocketAddr,
    pub validated: bool,

    /// Outstanding challenge payload, if validation is in flight.
    challenge: Option<[u8; 8]>,

    /// Challenge queued for the scheduler.
    challenge_pending_send: bool,

    /// Deadline for the outstanding challenge.
    pub challenge_deadline: Option<Instant>,

    /// PATH_RESPONSE payloads owed to the peer.
    pending_responses: Vec<[u8; 8]>,

    bytes_received: u64,
    bytes_sent: u64,
    amplification_limited: bool,

    credits: u32,
    credit_refill_at: Option<Instant>,
}

impl PathState {
    pub fn new(peer: SocketAddr, validated: bool, amplification_limited: bool) -> Self {
        Self {
            peer,
            validated,
            challenge: None,
            challenge_pending_send: false,
            challenge_deadline: None,
            pending_responses: Vec::new(),
            bytes_received: 0,
            bytes_sent: 0,
            amplification_limited,
            credits: VALIDATION_CREDITS,
            credit_refill_at: None,
        }
    }

    pub fn on_received(&mut self, bytes: u64) {
        self.bytes_received += bytes;
    }

    pub fn on_sent(&mut self, bytes: u64) {
        self.bytes_sent += bytes;
    }

    /// Bytes sendable on this path right now. Unvalidated paths are
    /// capped at three times what the peer has sent us.
    pub fn send_budget(&self) -> u64 {
        if self.validated || !self.amplification_limited {
            return u64::MAX;
        }
        (self.bytes_received * AMPLIFICATION_FACTOR).saturating_sub(self.bytes_sent)
    }

    /// Start (or restart) validation; spends one credit.
    pub fn begin_validation(&mut self, rng: &mut dyn rand::RngCore, now: Instant) -> bool {
        if let Some(refill_at) = self.credit_refill_at {
            if now >= refill_at {
                self.credits = VALIDATION_CREDITS;
                self.credit_refill_at = None;
            }
        }
        if self.credits == 0 {
            tracing::debug!(peer = %self.peer, "path validation credit exhausted");
            return false;
        }
        self.credits -= 1;
        if self.credit_refill_at.is_none() {
            self.credit_refill_at = Some(now + CREDIT_REFILL_INTERVAL);
        }

        let mut data = [0u8; 8];
        rng.fill_bytes(&mut data);
        self.challenge = Some(data);
        self.challenge_pending_send = true;
        self.challenge_deadline = Some(now + CHALLENGE_TIMEOUT);
        true
    }

    /// Challenge payload to put in the next packet, once per attempt.
    pub fn take_pending_challenge(&mut self) -> Option<[u8; 8]> {
        if self.challenge_pending_send {
            self.challenge_pending_send = false;
            self.challenge
        } else {
            None
        }
    }

    /// A PATH_RESPONSE arrived; validates on payload match.
    pub fn on_path_response(&mut self, data: &[u8; 8]) -> bool {
        if self.challenge.as_ref() == Some(data) {
            self.validated = true;
            self.challenge = None;
            self.challenge_deadline = None;
            tracing::debug!(peer = %self.peer, "path validated");
            true
        } else {
            false
        }
    }

    /// A PATH_CHALLENGE arrived; queue the echo.
    pub fn on_path_challenge(&mut self, data: [u8; 8]) {
        self.pending_responses.push(data);
    }

    /// Re-queue a challenge whose carrying packet was lost.
    pub fn requeue_challenge(&mut self, data: [u8; 8]) {
        if self.challenge == Some(data) && !self.validated {
            self.challenge_pending_send = true;
        }
    }

    pub fn take_pending_responses(&mut self) -> Vec<[u8; 8]> {
        core::mem::take(&mut self.pending_responses)
    }

    pub fn has_pending_responses(&self) -> bool {
        !self.pending_responses.is_empty()
    }

    pub fn has_pending_challenge(&self) -> bool {
        self.challenge_pending_send
    }

    /// The validation timer fired: retry if the challenge is still open.
    /// No-op when validation already finished (idempotent).
    pub fn on_validation_timeout(&mut self, rng: &mut dyn rand::RngCore, now: Instant) -> bool {
        if self.validated || self.challenge.is_none() {
            return false;
        }
        if self.challenge_deadline.is_some_and(|d| d <= now) {
            return self.begin_validation(rng, now);
        }
        false
    }

    pub fn validation_in_flight(&self) -> bool {
        self.challenge.is_some()
    }
}
