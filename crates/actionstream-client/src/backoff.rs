//! Reconnect backoff.

use std::time::Duration;

/// Jitter is drawn from `[0, JITTER_FACTOR * base)`.
const JITTER_FACTOR: f64 = 0.1;

/// Exponential backoff with additive jitter.
///
/// The first wait is the floor; each later base doubles up to `max`.
#[derive(Debug, Clone)]
pub struct Backoff {
    floor: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    #[must_use]
    pub fn new(floor: Duration, max: Duration) -> Self {
        let floor = floor.min(max);
        Self {
            floor,
            max,
            current: floor,
        }
    }

    /// Base of the next wait, without jitter.
    #[must_use]
    pub const fn current(&self) -> Duration {
        self.current
    }

    /// Next wait, and advance.
    pub fn next_delay(&mut self) -> Duration {
        let base = self.current;
        self.current = base.checked_mul(2).map_or(self.max, |d| d.min(self.max));
        base + base.mul_f64(rand::random::<f64>() * JITTER_FACTOR)
    }

    /// Back to the floor.
    pub fn reset(&mut self) {
        self.current = self.floor;
    }
}
