//! RTT estimation (RFC 9002 Section 5).

#![forbid(unsafe_code)]

use crate::types::TIMER_GRANULARITY;
use core::time::Duration;

/// Smoothed RTT state driven by ACK samples.
#[derive(Debug, Clone)]
pub struct RttEstimator {
    srtt: Duration,
    rttvar: Duration,
    min_rtt: Duration,
    latest: Duration,
    has_sample: bool,
}

impl RttEstimator {
    pub fn new(initial_rtt: Duration) -> Self {
        Self {
            srtt: initial_rtt,
            rttvar: initial_rtt / 2,
            min_rtt: Duration::ZERO,
            latest: initial_rtt,
            has_sample: false,
        }
    }

    /// Fold in a sample; `ack_delay` is the peer's reported intentional
    /// delay, subtracted only when the remainder stays above `min_rtt`
    /// (RFC 9002 Section 5.3).
    pub fn update(&mut self, sample: Duration, ack_delay: Duration) {
        self.latest = sample;

        if !self.has_sample {
            self.min_rtt = sample;
            self.srtt = sample;
            self.rttvar = sample / 2;
            self.has_sample = true;
            return;
        }

        if sample < self.min_rtt {
            self.min_rtt = sample;
        }

        let adjusted = if sample > self.min_rtt + ack_delay {
            sample - ack_delay
        } else {
            sample
        };

        let var_sample = if self.srtt > adjusted {
            self.srtt - adjusted
        } else {
            adjusted - self.srtt
        };
        self.rttvar = (self.rttvar * 3 + var_sample) / 4;
        self.srtt = (self.srtt * 7 + adjusted) / 8;
    }

    pub fn has_sample(&self) -> bool {
        self.has_sample
    }

    pub fn srtt(&self) -> Duration {
        self.srtt
    }

    pub fn rttvar(&self) -> Duration {
        self.rttvar
    }

    /// Zero until the first sample arrives.
    pub fn min_rtt(&self) -> Duration {
        self.min_rtt
    }

    pub fn latest(&self) -> Duration {
        self.latest
    }

    /// Base probe timeout, before exponential backoff
    /// (RFC 9002 Section 6.2).
    pub fn pto_base(&self, max_ack_delay: Duration) -> Duration {
        self.srtt + (self.rttvar * 4).max(TIMER_GRANULARITY) + max_ack_delay
    }

    /// PTO after `pto_count` consecutive expirations.
    pub fn pto(&self, max_ack_delay: Duration, pto_count: u32) -> Duration {
        self.pto_base(max_ack_delay) * 2u32.saturating_pow(pto_count.min(16))
    }

    /// Loss delay for the time threshold: `9/8 * max(srtt, latest)`.
    pub fn loss_delay(&self) -> Duration {
        let base = self.srtt.max(self.latest);
        (base * 9 / 8).max(TIMER_GRANULARITY)
    }
}
