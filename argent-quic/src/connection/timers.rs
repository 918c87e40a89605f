//! Connection timer table.
//!
//! Every timer is idempotent: firing one whose condition has cleared is
//! a no-op, which the connection guarantees by re-deriving the condition
//! when the deadline fires rather than trusting the timer itself.

#![forbid(unsafe_code)]

use crate::types::Instant;

/// The timers a connection arms (spec: idle, keepalive, delayed-ACK,
/// loss/PTO, path validation, pacing, drain).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerKind {
    Idle = 0,
    Keepalive = 1,
    DelayedAck = 2,
    LossDetection = 3,
    PathValidation = 4,
    Pacing = 5,
    Drain = 6,
}

const TIMER_COUNT: usize = 7;

const ALL: [TimerKind; TIMER_COUNT] = [
    TimerKind::Idle,
    TimerKind::Keepalive,
    TimerKind::DelayedAck,
    TimerKind::LossDetection,
    TimerKind::PathValidation,
    TimerKind::Pacing,
    TimerKind::Drain,
];

/// Deadlines per timer kind; `None` means disarmed.
#[derive(Debug, Default)]
pub struct TimerTable {
    deadlines: [Option<Instant>; TIMER_COUNT],
}

impl TimerTable {
    pub fn arm(&mut self, kind: TimerKind, deadline: Instant) {
        self.deadlines[kind as usize] = Some(deadline);
    }

    pub fn cancel(&mut self, kind: TimerKind) {
        self.deadlines[kind as usize] = None;
    }

    pub fn cancel_all(&mut self) {
        self.deadlines = Default::default();
    }

    pub fn deadline(&self, kind: TimerKind) -> Option<Instant> {
        self.deadlines[kind as usize]
    }

    /// Earliest armed deadline; what the embedder's timer should target.
    pub fn next(&self) -> Option<(TimerKind, Instant)> {
        ALL.iter()
            .filter_map(|&k| self.deadlines[k as usize].map(|d| (k, d)))
            .min_by_key(|&(_, d)| d)
    }

    /// Timers whose deadlines have passed; each is disarmed as it fires.
    pub fn expired(&mut self, now: Instant) -> Vec<TimerKind> {
        let mut fired = Vec::new();
        for kind in ALL {
            if self.deadlines[kind as usize].is_some_and(|d| d <= now) {
                self.deadlines[kind as usize] = None;
                fired.push(kind);
            }
        }
        fired
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn next_returns_earliest() {
        let mut timers = TimerTable::default();
        timers.arm(TimerKind::Idle, Instant::from_millis(500));
        timers.arm(TimerKind::DelayedAck, Instant::from_millis(30));
        timers.arm(TimerKind::LossDetection, Instant::from_millis(100));
        assert_eq!(timers.next(), Some((TimerKind::DelayedAck, Instant::from_millis(30))));
    }

    #[test]
    fn expired_disarms_and_reports() {
        let mut timers = TimerTable::default();
        timers.arm(TimerKind::DelayedAck, Instant::from_millis(10));
        timers.arm(TimerKind::Idle, Instant::from_millis(1000));
        let fired = timers.expired(Instant::from_millis(50));
        assert_eq!(fired, vec![TimerKind::DelayedAck]);
        assert_eq!(timers.deadline(TimerKind::DelayedAck), None);
        assert!(timers.deadline(TimerKind::Idle).is_some());
    }

    #[test]
    fn cancel_all_clears() {
        let mut timers = TimerTable::default();
        timers.arm(TimerKind::Idle, Instant::from_millis(1));
        timers.arm(TimerKind::Drain, Instant::from_millis(2));
        timers.cancel_all();
        assert_eq!(timers.next(), None);
    }

    #[test]
    fn firing_disarmed_timer_is_noop() {
        let mut timers = TimerTable::default();
        assert!(timers.expired(Instant::from_millis(100)).is_empty());
    }
}
