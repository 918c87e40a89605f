//! Token-bucket pacer.
//!
//! Converts the controller's pacing rate into per-write budgets. Pacing
//! is expressed as a deadline handed to the embedder's timer; the core
//! never sleeps.

#![forbid(unsafe_code)]

use super::Bandwidth;
use crate::types::Instant;
use core::time::Duration;

#[derive(Debug)]
pub struct Pacer {
    rate: Bandwidth,

    /// Spendable bytes in the bucket.
    tokens: u64,

    /// Bucket capacity; refills never exceed it.
    burst_bytes: u64,

    last_refill: Option<Instant>,

    /// Floor on the refill interval, matching the embedder's timer
    /// resolution.
    tick: Duration,

    mss: u64,
}

impl Pacer {
    pub fn new(mss: u64, initial_burst: u64, tick: Duration) -> Self {
        Self {
            rate: Bandwidth::ZERO,
            tokens: initial_burst,
            burst_bytes: initial_burst.max(2 * mss),
            last_refill: None,
            tick,
            mss,
        }
    }

    /// Adopt a new rate and burst allowance from the controller.
    pub fn on_rate_update(&mut self, rate: Bandwidth, burst_bytes: u64) {
        self.rate = rate;
        self.burst_bytes = burst_bytes.max(2 * self.mss);
    }

    pub fn rate(&self) -> Bandwidth {
        self.rate
    }

    fn refill(&mut self, now: Instant) {
        let Some(last) = self.last_refill else {
            self.last_refill = Some(now);
            return;
        };
        let elapsed = now.saturating_duration_since(last);
        if elapsed < self.tick {
            return;
        }
        self.tokens = (self.tokens + self.rate.bytes_in(elapsed)).min(self.burst_bytes);
        self.last_refill = Some(now);
    }

    /// Bytes this write round may emit. An unset rate means unpaced.
    pub fn writable_bytes(&mut self, now: Instant) -> u64 {
        if self.rate == Bandwidth::ZERO {
            return u64::MAX;
        }
        self.refill(now);
        self.tokens
    }

    /// Whole packets this burst may carry.
    pub fn packets_this_burst(&mut self, now: Instant) -> u64 {
        let writable = self.writable_bytes(now);
        if writable == u64::MAX {
            return u64::MAX;
        }
        writable / self.mss
    }

    pub fn on_sent(&mut self, bytes: u64) {
        if self.rate != Bandwidth::ZERO {
            self.tokens = self.tokens.saturating_sub(bytes);
        }
    }

    /// When the bucket will next cover a full packet; `None` means now.
    pub fn next_send_time(&mut self, now: Instant) -> Option<Instant> {
        if self.rate == Bandwidth::ZERO {
            return None;
        }
        self.refill(now);
        if self.tokens >= self.mss {
            return None;
        }
        let needed = self.mss - self.tokens;
        let wait = self.rate.transfer_time(needed).max(self.tick);
        Some(now + wait)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pacer() -> Pacer {
        let mut p = Pacer::new(1200, 12_000, Duration::from_millis(1));
        // 1.2 MB/s: one packet per millisecond.
        p.on_rate_update(Bandwidth::from_bytes_per_second(1_200_000), 12_000);
        p
    }

    #[test]
    fn unpaced_until_rate_known() {
        let mut p = Pacer::new(1200, 12_000, Duration::from_millis(1));
        assert_eq!(p.writable_bytes(Instant::from_millis(0)), u64::MAX);
        assert!(p.next_send_time(Instant::from_millis(0)).is_none());
    }

    #[test]
    fn initial_burst_then_deadline() {
        let mut p = pacer();
        let now = Instant::from_millis(0);
        assert_eq!(p.writable_bytes(now), 12_000);
        p.on_sent(12_000);
        // Bucket empty: a deadline one packet away is returned.
        let deadline = p.next_send_time(now).unwrap();
        assert_eq!(deadline, now + Duration::from_millis(1));
    }

    #[test]
    fn refill_caps_at_burst() {
        let mut p = pacer();
        let t0 = Instant::from_millis(0);
        p.writable_bytes(t0);
        p.on_sent(12_000);
        // A long idle period refills only to the burst cap.
        let later = Instant::from_millis(1000);
        assert_eq!(p.writable_bytes(later), 12_000);
    }

    #[test]
    fn refill_respects_tick_floor() {
        let mut p = pacer();
        let t0 = Instant::from_millis(0);
        p.writable_bytes(t0);
        p.on_sent(12_000);
        // Under one tick nothing refills.
        let within_tick = Instant::from_nanos(500_000);
        assert_eq!(p.writable_bytes(within_tick), 0);
        let after_tick = Instant::from_millis(2);
        assert_eq!(p.writable_bytes(after_tick), 2_400);
    }

    #[test]
    fn packets_per_burst() {
        let mut p = pacer();
        assert_eq!(p.packets_this_burst(Instant::from_millis(0)), 10);
    }
}
