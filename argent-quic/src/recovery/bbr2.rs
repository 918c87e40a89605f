//! BBRv2 congestion controller.
//!
//! Model-based control: a windowed max-bandwidth filter and a min-RTT
//! filter feed a BDP estimate; the state machine (Startup, Drain, the
//! four ProbeBW phases, ProbeRTT) picks pacing and cwnd gains around it,
//! bounded by the loss-informed `inflight_hi` / `inflight_lo` pair.
//!
//! See draft-cardwell-iccrg-bbr-congestion-control-02.

#![forbid(unsafe_code)]

use super::{Bandwidth, CongestionController, CongestionSignal, OutstandingPacket};
use crate::settings::TransportSettings;
use crate::types::Instant;
use core::time::Duration;
use rand::{Rng, RngCore};

// ============================================================================
// Constants
// ============================================================================

/// Max-bandwidth filter window, in ProbeBW cycles.
const MAX_BW_FILTER_LEN: usize = 2;

/// Min-RTT filter window.
const MIN_RTT_FILTER_LEN: Duration = Duration::from_secs(10);

/// Minimum interval between ProbeRTT rounds.
const PROBE_RTT_INTERVAL: Duration = Duration::from_secs(5);

/// How long ProbeRTT holds inflight down.
const PROBE_RTT_DURATION: Duration = Duration::from_millis(200);

/// Startup exits when bandwidth stops growing by this factor across
/// [`FULL_BW_ROUNDS`] consecutive rounds.
const FULL_BW_GROWTH: f64 = 0.25;
const FULL_BW_ROUNDS: u32 = 3;

/// Loss rate above which a round counts against the bounds.
const LOSS_THRESHOLD: f64 = 0.02;

/// Loss events in one round that, with the rate, end Startup.
const STARTUP_FULL_LOSS_COUNT: u64 = 6;

/// Multiplicative decrease applied to the lower bounds on loss rounds.
const BETA: f64 = 0.7;

/// Fraction of `inflight_hi` usable while cruising.
const HEADROOM: f64 = 0.85;

/// Congestion window floor, in packets.
const MIN_CWND_IN_MSS: u64 = 4;

/// ProbeBW wait interval bounds; the actual wait is randomized.
const PROBE_BW_WAIT_MIN_MS: u64 = 2000;
const PROBE_BW_WAIT_MAX_MS: u64 = 3000;

/// Pacing is discounted 1% below the modeled bandwidth.
const PACING_MARGIN: f64 = 0.01;

/// Quantization budget multiplier on the send quantum.
const QUANTA: u64 = 3;

// ============================================================================
// Gains (pacing, cwnd) per state
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Startup,
    Drain,
    ProbeBwDown,
    ProbeBwCruise,
    ProbeBwRefill,
    ProbeBwUp,
    ProbeRtt,
}

impl State {
    fn pacing_gain(self) -> f64 {
        match self {
            State::Startup => 2.89,
            State::Drain => 0.5,
            State::ProbeBwDown => 0.9,
            State::ProbeBwCruise => 1.0,
            State::ProbeBwRefill => 1.0,
            State::ProbeBwUp => 1.25,
            State::ProbeRtt => 1.0,
        }
    }

    fn cwnd_gain(self) -> f64 {
        match self {
            State::Startup => 2.89,
            State::Drain => 2.89,
            State::ProbeBwDown => 2.0,
            State::ProbeBwCruise => 2.0,
            State::ProbeBwRefill => 2.0,
            State::ProbeBwUp => 2.25,
            State::ProbeRtt => 0.5,
        }
    }

    fn is_probe_bw(self) -> bool {
        matches!(
            self,
            State::ProbeBwDown | State::ProbeBwCruise | State::ProbeBwRefill | State::ProbeBwUp
        )
    }
}

// ============================================================================
// Filters
// ============================================================================

/// Windowed max filter over the last [`MAX_BW_FILTER_LEN`] ProbeBW cycles.
#[derive(Debug, Default)]
struct MaxBwFilter {
    samples: [Bandwidth; MAX_BW_FILTER_LEN],
}

impl MaxBwFilter {
    fn update(&mut self, sample: Bandwidth) {
        if sample > self.samples[MAX_BW_FILTER_LEN - 1] {
            self.samples[MAX_BW_FILTER_LEN - 1] = sample;
        }
    }

    fn advance_cycle(&mut self) {
        self.samples.rotate_left(1);
        self.samples[MAX_BW_FILTER_LEN - 1] = Bandwidth::ZERO;
    }

    fn get(&self) -> Bandwidth {
        self.samples.iter().copied().max().unwrap_or(Bandwidth::ZERO)
    }
}

/// Packet-timed round trip counter keyed on the delivered counter.
#[derive(Debug, Default)]
struct RoundCounter {
    count: u64,
    next_round_delivered: u64,
    is_round_start: bool,
}

impl RoundCounter {
    fn update(&mut self, largest_acked: &OutstandingPacket, delivered_now: u64) {
        self.is_round_start = largest_acked.delivered_at_send >= self.next_round_delivered;
        if self.is_round_start {
            self.count += 1;
            self.next_round_delivered = delivered_now;
        }
    }
}

// ============================================================================
// The controller
// ============================================================================

pub struct Bbr2 {
    mss: u64,
    min_cwnd: u64,
    state: State,

    cwnd: u64,
    pacing_rate: Bandwidth,
    send_quantum: u64,

    max_bw: MaxBwFilter,
    min_rtt: Duration,
    min_rtt_stamp: Option<Instant>,

    round: RoundCounter,

    // Startup full-pipe estimation.
    filled_pipe: bool,
    full_bw: Bandwidth,
    full_bw_count: u32,

    // Per-round loss accounting.
    loss_events_in_round: u64,
    lost_bytes_in_round: u64,
    delivered_bytes_in_round: u64,
    loss_round_start_delivered: u64,

    // Short-term model bounds.
    inflight_hi: Option<u64>,
    inflight_lo: Option<u64>,
    bandwidth_lo: Option<Bandwidth>,
    inflight_latest: u64,
    bandwidth_latest: Bandwidth,

    // ProbeBW cycling.
    cycle_stamp: Option<Instant>,
    cycle_wait: Duration,
    rounds_since_bw_probe: u64,
    probe_up_acks: u64,

    // ProbeRTT bookkeeping.
    probe_rtt_done_stamp: Option<Instant>,
    probe_rtt_last: Option<Instant>,
    probe_rtt_round_done: bool,

    app_limited: bool,

    rng: Box<dyn RngCore + Send>,
}

impl Bbr2 {
    pub fn new(settings: &TransportSettings, rng: Box<dyn RngCore + Send>) -> Self {
        let mss = settings.max_udp_payload_size as u64;
        let init_cwnd = settings.init_cwnd_in_mss.max(MIN_CWND_IN_MSS) * mss;
        Self {
            mss,
            min_cwnd: settings.min_cwnd_in_mss.max(MIN_CWND_IN_MSS) * mss,
            state: State::Startup,
            cwnd: init_cwnd,
            pacing_rate: Bandwidth::ZERO,
            send_quantum: 2 * mss,
            max_bw: MaxBwFilter::default(),
            min_rtt: Duration::ZERO,
            min_rtt_stamp: None,
            round: RoundCounter::default(),
            filled_pipe: false,
            full_bw: Bandwidth::ZERO,
            full_bw_count: 0,
            loss_events_in_round: 0,
            lost_bytes_in_round: 0,
            delivered_bytes_in_round: 0,
            loss_round_start_delivered: 0,
            inflight_hi: None,
            inflight_lo: None,
            bandwidth_lo: None,
            inflight_latest: 0,
            bandwidth_latest: Bandwidth::ZERO,
            cycle_stamp: None,
            cycle_wait: Duration::from_millis(PROBE_BW_WAIT_MIN_MS),
            rounds_since_bw_probe: 0,
            probe_up_acks: 0,
            probe_rtt_done_stamp: None,
            probe_rtt_last: None,
            probe_rtt_round_done: false,
            app_limited: false,
            rng,
        }
    }

    fn bdp(&self, gain: f64) -> u64 {
        if self.min_rtt.is_zero() {
            return self.cwnd;
        }
        let bw = self.bandwidth();
        (bw.scale(gain).bytes_in(self.min_rtt)).max(self.min_cwnd)
    }

    fn bandwidth(&self) -> Bandwidth {
        let modeled = self.max_bw.get();
        match self.bandwidth_lo {
            Some(lo) if !self.state.is_probe_bw() || self.state == State::ProbeBwCruise => {
                modeled.min(lo.max(self.bandwidth_latest))
            }
            _ => modeled,
        }
    }

    /// Target inflight: BDP at the state's cwnd gain, padded by the
    /// quantization budget, bounded by the hi/lo model and the floor.
    fn target_inflight(&self) -> u64 {
        let mut target = self.bdp(self.state.cwnd_gain()) + QUANTA * self.send_quantum;

        if let Some(hi) = self.inflight_hi {
            let cap = if self.state == State::ProbeBwCruise {
                ((hi as f64) * HEADROOM) as u64
            } else {
                hi
            };
            target = target.min(cap);
        }
        if let Some(lo) = self.inflight_lo {
            if self.state == State::ProbeBwCruise {
                target = target.min(lo.max(self.inflight_latest));
            }
        }
        target.max(self.min_cwnd)
    }

    // ========================================================================
    // Model updates
    // ========================================================================

    fn update_bandwidth_sample(&mut self, signal: &CongestionSignal<'_>) {
        let Some(largest) = signal.acked.iter().max_by_key(|p| p.packet_number) else {
            return;
        };

        self.round.update(largest, signal.delivered_bytes);
        if self.round.is_round_start {
            self.bandwidth_latest = Bandwidth::ZERO;
            self.inflight_latest = 0;
            self.loss_events_in_round = 0;
            self.lost_bytes_in_round = 0;
            self.delivered_bytes_in_round = 0;
            self.loss_round_start_delivered = signal.delivered_bytes;
        }

        // Rate sample per the delivery-rate draft: delivered delta over
        // the slower of the send and ack intervals.
        let delivered_delta = signal.delivered_bytes.saturating_sub(largest.delivered_at_send);
        let send_elapsed = largest.sent_time.saturating_duration_since(largest.first_sent_time);
        let ack_elapsed = signal
            .delivered_time
            .saturating_duration_since(largest.delivered_time_at_send);
        let interval = send_elapsed.max(ack_elapsed);
        if !interval.is_zero() {
            let sample = Bandwidth::from_delivery(delivered_delta, interval);
            self.bandwidth_latest = self.bandwidth_latest.max(sample);
            if sample >= self.max_bw.get() || !largest.app_limited {
                self.max_bw.update(sample);
            }
        }
        self.inflight_latest = self.inflight_latest.max(signal.prior_inflight);

        let acked_bytes: u64 = signal.acked.iter().map(|p| p.size).sum();
        self.delivered_bytes_in_round += acked_bytes;
    }

    fn update_min_rtt(&mut self, signal: &CongestionSignal<'_>) {
        let latest = signal.rtt.latest();
        if latest.is_zero() {
            return;
        }
        let expired = self
            .min_rtt_stamp
            .is_none_or(|stamp| signal.now.saturating_duration_since(stamp) > MIN_RTT_FILTER_LEN);
        if self.min_rtt.is_zero() || latest < self.min_rtt || expired {
            self.min_rtt = latest;
            self.min_rtt_stamp = Some(signal.now);
        }
    }

    fn loss_rate_in_round(&self) -> f64 {
        let delivered = self.delivered_bytes_in_round + self.lost_bytes_in_round;
        if delivered == 0 {
            return 0.0;
        }
        self.lost_bytes_in_round as f64 / delivered as f64
    }

    fn update_loss_model(&mut self, signal: &CongestionSignal<'_>) {
        if !signal.has_loss {
            return;
        }
        self.loss_events_in_round += signal.lost.len() as u64;
        self.lost_bytes_in_round += signal.lost.iter().map(|p| p.size).sum::<u64>();

        // Lower bounds decay multiplicatively on loss rounds.
        let prior_lo = self.inflight_lo.unwrap_or(self.cwnd);
        self.inflight_lo = Some(self.inflight_latest.max((prior_lo as f64 * BETA) as u64));
        let prior_bw_lo = self.bandwidth_lo.unwrap_or_else(|| self.max_bw.get());
        self.bandwidth_lo = Some(self.bandwidth_latest.max(prior_bw_lo.scale(BETA)));

        // Sustained loss above the threshold drags the upper bound down.
        if self.loss_rate_in_round() > LOSS_THRESHOLD {
            let shrunk = ((signal.prior_inflight as f64) * BETA) as u64;
            self.inflight_hi = Some(match self.inflight_hi {
                Some(hi) => hi.min(shrunk.max(self.min_cwnd)),
                None => shrunk.max(self.min_cwnd),
            });
        }

        if signal.persistent_congestion {
            self.cwnd = self.min_cwnd;
            self.inflight_lo = None;
            self.bandwidth_lo = None;
        }
    }

    // ========================================================================
    // State machine
    // ========================================================================

    fn check_startup_done(&mut self, signal: &CongestionSignal<'_>) {
        if self.filled_pipe || !self.round.is_round_start {
            return;
        }

        // Bandwidth plateau: growth below 25% for three rounds.
        if !self.app_limited {
            let threshold = self.full_bw.scale(1.0 + FULL_BW_GROWTH);
            if self.max_bw.get() >= threshold {
                self.full_bw = self.max_bw.get();
                self.full_bw_count = 0;
            } else {
                self.full_bw_count += 1;
                if self.full_bw_count >= FULL_BW_ROUNDS {
                    self.filled_pipe = true;
                }
            }
        }

        // Sustained loss also ends Startup.
        if self.loss_events_in_round >= STARTUP_FULL_LOSS_COUNT
            && self.loss_rate_in_round() > LOSS_THRESHOLD
        {
            self.filled_pipe = true;
            self.inflight_hi = Some(self.bdp(1.0).max(self.inflight_latest));
        }

        if self.filled_pipe {
            tracing::debug!("startup done, entering drain");
            self.state = State::Drain;
        }
        let _ = signal;
    }

    fn check_drain_done(&mut self, signal: &CongestionSignal<'_>) {
        if self.state == State::Drain && signal.inflight <= self.bdp(1.0) {
            self.enter_probe_bw_down(signal.now);
        }
    }

    fn enter_probe_bw_down(&mut self, now: Instant) {
        self.state = State::ProbeBwDown;
        self.max_bw.advance_cycle();
        self.cycle_stamp = Some(now);
        // Randomized wall-clock wait plus 0-1 extra rounds, decorrelating
        // flows that share a bottleneck.
        let wait_ms = self.rng.gen_range(PROBE_BW_WAIT_MIN_MS..=PROBE_BW_WAIT_MAX_MS);
        self.cycle_wait = Duration::from_millis(wait_ms);
        self.rounds_since_bw_probe = self.rng.gen_range(0..=1);
        self.probe_up_acks = 0;
        tracing::trace!(wait_ms, "probe-bw cycle restarted");
    }

    fn update_probe_bw(&mut self, signal: &CongestionSignal<'_>) {
        match self.state {
            State::ProbeBwDown => {
                // Deceleration done once inflight fits the headroom target.
                if signal.inflight <= self.target_inflight() {
                    self.state = State::ProbeBwCruise;
                }
            }
            State::ProbeBwCruise => {
                if self.round.is_round_start {
                    self.rounds_since_bw_probe += 1;
                }
                let waited = self
                    .cycle_stamp
                    .is_some_and(|s| signal.now.saturating_duration_since(s) >= self.cycle_wait);
                if waited {
                    // Refill the pipe for one round before accelerating.
                    self.state = State::ProbeBwRefill;
                    self.inflight_lo = None;
                    self.bandwidth_lo = None;
                    self.rounds_since_bw_probe = 0;
                }
            }
            State::ProbeBwRefill => {
                if self.round.is_round_start {
                    self.state = State::ProbeBwUp;
                    self.probe_up_acks = 0;
                }
            }
            State::ProbeBwUp => {
                // Acks above the current cap raise it.
                if let Some(hi) = self.inflight_hi {
                    if signal.prior_inflight > hi {
                        self.inflight_hi = Some(signal.prior_inflight);
                    }
                } else {
                    self.inflight_hi = Some(self.bdp(1.25));
                }
                let overshoot = signal.inflight >= self.bdp(1.25);
                let loss_too_high = self.loss_rate_in_round() > LOSS_THRESHOLD;
                if self.round.is_round_start && (overshoot || loss_too_high) {
                    self.enter_probe_bw_down(signal.now);
                }
            }
            _ => {}
        }
    }

    fn check_probe_rtt(&mut self, signal: &CongestionSignal<'_>) {
        let due = self
            .probe_rtt_last
            .zip(self.min_rtt_stamp)
            .map(|(last, _)| signal.now.saturating_duration_since(last) >= PROBE_RTT_INTERVAL)
            .unwrap_or_else(|| {
                self.min_rtt_stamp.is_some_and(|stamp| {
                    signal.now.saturating_duration_since(stamp) >= PROBE_RTT_INTERVAL
                })
            });

        if self.state != State::ProbeRtt && due && !self.app_limited {
            self.state = State::ProbeRtt;
            self.probe_rtt_done_stamp = None;
            self.probe_rtt_round_done = false;
            self.probe_rtt_last = Some(signal.now);
            tracing::debug!("entering probe-rtt");
        }

        if self.state == State::ProbeRtt {
            if self.probe_rtt_done_stamp.is_none() && signal.inflight <= self.min_cwnd {
                self.probe_rtt_done_stamp = Some(signal.now + PROBE_RTT_DURATION);
                self.probe_rtt_round_done = false;
            } else if let Some(done) = self.probe_rtt_done_stamp {
                if self.round.is_round_start {
                    self.probe_rtt_round_done = true;
                }
                if self.probe_rtt_round_done && signal.now >= done {
                    self.min_rtt_stamp = Some(signal.now);
                    if self.filled_pipe {
                        self.enter_probe_bw_down(signal.now);
                    } else {
                        self.state = State::Startup;
                    }
                }
            }
        }
    }

    // ========================================================================
    // Outputs
    // ========================================================================

    fn update_pacing_and_quantum(&mut self) {
        let rate = self.bandwidth().scale(self.state.pacing_gain() * (1.0 - PACING_MARGIN));
        if rate > Bandwidth::ZERO {
            self.pacing_rate = rate;
        }
        // Quantum: about 1ms of the pacing rate, floored at two packets.
        let per_ms = self.pacing_rate.bytes_in(Duration::from_millis(1));
        self.send_quantum = per_ms.clamp(2 * self.mss, 64 * 1024);
    }

    fn update_cwnd(&mut self, signal: &CongestionSignal<'_>) {
        let acked: u64 = signal.acked.iter().map(|p| p.size).sum();
        let target = self.target_inflight();

        if self.state == State::ProbeRtt {
            self.cwnd = self.cwnd.min(target).max(self.min_cwnd);
            return;
        }

        if self.filled_pipe {
            self.cwnd = (self.cwnd + acked).min(target);
        } else {
            // Startup grows without the target cap but honors inflight_hi.
            self.cwnd += acked;
            if let Some(hi) = self.inflight_hi {
                self.cwnd = self.cwnd.min(hi);
            }
        }
        self.cwnd = self.cwnd.max(self.min_cwnd);
    }
}

impl CongestionController for Bbr2 {
    fn on_packet_sent(&mut self, _packet: &OutstandingPacket, _inflight: u64, _now: Instant) {}

    fn on_ack_or_loss(&mut self, signal: &CongestionSignal<'_>) {
        self.update_min_rtt(signal);
        self.update_bandwidth_sample(signal);
        self.update_loss_model(signal);

        match self.state {
            State::Startup => {
                self.check_startup_done(signal);
                self.check_drain_done(signal);
            }
            State::Drain => self.check_drain_done(signal),
            _ if self.state.is_probe_bw() => self.update_probe_bw(signal),
            _ => {}
        }
        self.check_probe_rtt(signal);

        self.update_pacing_and_quantum();
        self.update_cwnd(signal);
    }

    fn writable_bytes(&self, inflight: u64) -> u64 {
        self.cwnd.saturating_sub(inflight)
    }

    fn congestion_window(&self) -> u64 {
        self.cwnd
    }

    fn pacing_rate(&self) -> Bandwidth {
        if self.pacing_rate == Bandwidth::ZERO {
            // Before any bandwidth sample: initial cwnd per min RTT guess.
            Bandwidth::from_delivery(self.cwnd, Duration::from_millis(100))
                .scale(self.state.pacing_gain())
        } else {
            self.pacing_rate
        }
    }

    fn bandwidth_estimate(&self) -> Option<Bandwidth> {
        let bw = self.max_bw.get();
        (bw > Bandwidth::ZERO).then_some(bw)
    }

    fn is_app_limited(&self) -> bool {
        self.app_limited
    }

    fn set_app_limited(&mut self) {
        self.app_limited = true;
    }
}
