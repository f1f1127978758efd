//! Per-node timers advanced by the simulation tick.

use std::time::Duration;

/// Fixed-period accumulator.  Fires at most once per [`Scheduler::advance`]
/// and carries any excess time into the next period.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Scheduler {
    accumulated: Duration,
    period: Duration,
}

impl Scheduler {
    pub fn new(period: Duration) -> Self {
        Self {
            accumulated: Duration::ZERO,
            period,
        }
    }

    /// A scheduler whose first `advance` fires.
    pub fn primed(period: Duration) -> Self {
        Self {
            accumulated: period,
            period,
        }
    }

    pub fn advance(&mut self, elapsed: Duration) -> bool {
        self.accumulated = self.accumulated.saturating_add(elapsed);
        if self.accumulated < self.period {
            return false;
        }
        self.accumulated -= self.period;
        true
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    pub fn accumulated(&self) -> Duration {
        self.accumulated
    }
}

/// One-shot countdown used for the handheld download delay.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Countdown {
    remaining: Option<Duration>,
}

impl Countdown {
    pub fn start(&mut self, duration: Duration) {
        self.remaining = Some(duration);
    }

    pub fn is_running(&self) -> bool {
        self.remaining.is_some()
    }

    pub fn remaining(&self) -> Option<Duration> {
        self.remaining
    }

    /// Returns `true` once when the countdown reaches zero, then stops.
    pub fn advance(&mut self, elapsed: Duration) -> bool {
        let Some(remaining) = self.remaining else {
            return false;
        };
        let remaining = remaining.saturating_sub(elapsed);
        if remaining.is_zero() {
            self.remaining = None;
            return true;
        }
        self.remaining = Some(remaining);
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scheduler_carries_remainder() {
        let mut scheduler = Scheduler::new(Duration::from_secs(3));
        assert!(!scheduler.advance(Duration::from_secs(2)));
        assert!(scheduler.advance(Duration::from_millis(1_500)));
        assert_eq!(scheduler.accumulated(), Duration::from_millis(500));
        assert!(!scheduler.advance(Duration::from_millis(2_000)));
        assert!(scheduler.advance(Duration::from_millis(500)));
    }

    #[test]
    fn scheduler_fires_once_per_advance_even_with_backlog() {
        let mut scheduler = Scheduler::new(Duration::from_secs(3));
        assert!(scheduler.advance(Duration::from_secs(7)));
        assert_eq!(scheduler.accumulated(), Duration::from_secs(4));
        assert!(scheduler.advance(Duration::ZERO));
        assert!(!scheduler.advance(Duration::ZERO));
    }

    #[test]
    fn primed_scheduler_fires_first() {
        let mut scheduler = Scheduler::primed(Duration::from_secs(2));
        assert!(scheduler.advance(Duration::from_millis(100)));
        assert!(!scheduler.advance(Duration::from_millis(100)));
    }

    #[test]
    fn countdown_finishes_exactly_once() {
        let mut countdown = Countdown::default();
        assert!(!countdown.advance(Duration::from_secs(1)));
        countdown.start(Duration::from_millis(300));
        assert!(!countdown.advance(Duration::from_millis(200)));
        assert!(countdown.is_running());
        assert!(countdown.advance(Duration::from_millis(100)));
        assert!(!countdown.is_running());
        assert!(!countdown.advance(Duration::from_millis(100)));
    }
}
