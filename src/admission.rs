//! Admission control for worker job submission
//!
//! A coarse circuit breaker. Every accepted submission bumps a counter; when
//! the counter outruns `2 + K` (K = sum of role targets) jobs are assumed to be
//! crash-looping and submission locks for at least the cooldown. A separate
//! decay tick subtracts K from the counter, floored at zero.
//!
//! ```text
//!            counter > 2 + K (on tick)
//!   Open ───────────────────────────────> Locked
//!     ^                                     │
//!     └──── now - locked_at >= cooldown ────┘
//! ```
//!
//! Time is passed in explicitly so the state machine is deterministic under
//! test.

use std::time::{Duration, Instant};

use tracing::{info, warn};

/// Submission gate state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmissionState {
    /// Submissions are accepted
    Open,
    /// Submissions are refused until the cooldown elapses
    Locked,
}

/// State change reported by [`AdmissionController::tick`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// Open to Locked, with the counter that tripped it
    Locked {
        /// Counter value at the transition
        counter: u64,
    },
    /// Locked to Open after the cooldown
    Unlocked,
    /// Periodic decay changed the counter
    Decayed {
        /// Counter before decay
        from: u64,
        /// Counter after decay
        to: u64,
    },
}

/// Counter-and-cooldown admission state machine.
#[derive(Debug, Clone)]
pub struct AdmissionController {
    pool_size: u64,
    cooldown: Duration,
    decay_interval: Duration,
    counter: u64,
    state: SubmissionState,
    locked_at: Option<Instant>,
    last_decay: Instant,
}

impl AdmissionController {
    /// Create an open controller for a pool of `pool_size` jobs across all
    /// roles. The decay clock starts at `now`.
    #[must_use]
    pub const fn new(
        pool_size: u64,
        cooldown: Duration,
        decay_interval: Duration,
        now: Instant,
    ) -> Self {
        Self {
            pool_size,
            cooldown,
            decay_interval,
            counter: 0,
            state: SubmissionState::Open,
            locked_at: None,
            last_decay: now,
        }
    }

    /// Counter value above which submission locks.
    #[must_use]
    pub const fn threshold(&self) -> u64 {
        self.pool_size.saturating_add(2)
    }

    /// Submissions counted and not yet decayed.
    #[must_use]
    pub const fn counter(&self) -> u64 {
        self.counter
    }

    /// Current gate state.
    #[must_use]
    pub const fn state(&self) -> SubmissionState {
        self.state
    }

    /// When the current lock episode started.
    #[must_use]
    pub const fn locked_at(&self) -> Option<Instant> {
        self.locked_at
    }

    /// Ask to submit one job. Counts and returns `true` unless locked.
    pub fn try_admit(&mut self) -> bool {
        match self.state {
            SubmissionState::Open => {
                self.counter = self.counter.saturating_add(1);
                true
            }
            SubmissionState::Locked => false,
        }
    }

    /// Advance the state machine to `now`.
    ///
    /// At most one lock transition happens per call. Decay catches up on
    /// every whole interval elapsed since the last decay.
    pub fn tick(&mut self, now: Instant) -> Vec<Transition> {
        let mut transitions = Vec::new();

        match self.state {
            SubmissionState::Open if self.counter > self.threshold() => {
                self.state = SubmissionState::Locked;
                self.locked_at = Some(now);
                warn!(
                    counter = self.counter,
                    threshold = self.threshold(),
                    "submissions outpacing completions, locking job submission"
                );
                transitions.push(Transition::Locked {
                    counter: self.counter,
                });
            }
            SubmissionState::Locked => {
                let elapsed = self
                    .locked_at
                    .map_or(Duration::MAX, |at| now.saturating_duration_since(at));
                if elapsed >= self.cooldown {
                    self.state = SubmissionState::Open;
                    self.locked_at = None;
                    info!(?elapsed, "cooldown elapsed, job submission unlocked");
                    transitions.push(Transition::Unlocked);
                }
            }
            SubmissionState::Open => {}
        }

        if let Some(decayed) = self.decay(now) {
            transitions.push(decayed);
        }
        transitions
    }

    fn decay(&mut self, now: Instant) -> Option<Transition> {
        let from = self.counter;
        if self.decay_interval.is_zero() {
            self.counter = self.counter.saturating_sub(self.pool_size);
            self.last_decay = now;
        } else {
            while now.saturating_duration_since(self.last_decay) >= self.decay_interval {
                self.last_decay += self.decay_interval;
                self.counter = self.counter.saturating_sub(self.pool_size);
            }
        }
        (from != self.counter).then_some(Transition::Decayed {
            from,
            to: self.counter,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MIN: Duration = Duration::from_secs(60);

    fn controller(start: Instant) -> AdmissionController {
        AdmissionController::new(3, 10 * MIN, 5 * MIN, start)
    }

    #[test]
    fn test_threshold_is_pool_plus_two() {
        assert_eq!(controller(Instant::now()).threshold(), 5);
    }

    #[test]
    fn test_at_threshold_stays_open() {
        let t0 = Instant::now();
        let mut c = controller(t0);
        for _ in 0..5 {
            assert!(c.try_admit());
        }
        assert!(c.tick(t0).is_empty());
        assert_eq!(c.state(), SubmissionState::Open);
    }

    #[test]
    fn test_locked_refuses_and_does_not_count() {
        let t0 = Instant::now();
        let mut c = controller(t0);
        for _ in 0..6 {
            c.try_admit();
        }
        assert_eq!(c.tick(t0), vec![Transition::Locked { counter: 6 }]);
        assert!(!c.try_admit());
        assert_eq!(c.counter(), 6);
    }

    #[test]
    fn test_zero_decay_interval_decays_every_tick() {
        let t0 = Instant::now();
        let mut c = AdmissionController::new(2, MIN, Duration::ZERO, t0);
        c.try_admit();
        c.try_admit();
        c.try_admit();
        assert_eq!(c.tick(t0), vec![Transition::Decayed { from: 3, to: 1 }]);
        assert_eq!(c.tick(t0), vec![Transition::Decayed { from: 1, to: 0 }]);
        assert!(c.tick(t0).is_empty());
    }

    #[test]
    fn test_decay_catches_up_missed_intervals() {
        let t0 = Instant::now();
        let mut c = controller(t0);
        for _ in 0..5 {
            c.try_admit();
        }
        let transitions = c.tick(t0 + 10 * MIN);
        assert_eq!(transitions, vec![Transition::Decayed { from: 5, to: 0 }]);
    }
}
