//! Wall-clock timers for election timeouts and resend cadences.
//!
//! The consensus core never reads the clock itself. Every operation receives
//! the current [`Instant`] from the event loop, which keeps the protocol
//! deterministic under test: a harness can fabricate instants and step time
//! forward without sleeping.
//!
//! Timers are re-armed from the current instant rather than accumulated, so a
//! late tick never causes a burst of catch-up firings.

use std::ops::Range;
use std::time::{Duration, Instant};

use rand::Rng;

/// A one-shot deadline that can be re-armed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timer {
    armed_at: Instant,
    timeout: Duration,
}

impl Timer {
    /// Arms a timer that expires `timeout` after `now`.
    pub fn new(now: Instant, timeout: Duration) -> Self {
        Self {
            armed_at: now,
            timeout,
        }
    }

    /// Restarts the countdown with the current timeout.
    pub fn rearm(&mut self, now: Instant) {
        self.armed_at = now;
    }

    /// Restarts the countdown with a new timeout.
    pub fn rearm_with(&mut self, now: Instant, timeout: Duration) {
        self.armed_at = now;
        self.timeout = timeout;
    }

    pub fn deadline(&self) -> Instant {
        self.armed_at + self.timeout
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.armed_at) >= self.timeout
    }
}

/// Draws a timeout uniformly from `range` (millisecond granularity).
///
/// Jitter keeps replicas that time out together from splitting the vote again
/// on every retry.
pub fn random_timeout<R: Rng + ?Sized>(rng: &mut R, range: &Range<Duration>) -> Duration {
    let low = range.start.as_millis() as u64;
    let high = range.end.as_millis() as u64;
    if high <= low {
        return range.start;
    }
    Duration::from_millis(rng.gen_range(low..high))
}
