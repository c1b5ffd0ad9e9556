// SPDX-License-Identifier: MIT OR Apache-2.0
//! Exponential reconnect backoff with jitter.

use rand::Rng;
use std::time::Duration;

/// Backoff ceiling.
const CAP: Duration = Duration::from_secs(30);

/// Maximum additive jitter per delay.
const JITTER_MS: u64 = 250;

/// Exponential backoff: starts at the configured floor, doubles per
/// failure, caps at 30 s, and adds 0–250 ms of jitter to every delay.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    current: Duration,
}

impl Backoff {
    /// A backoff starting at `initial`.
    #[must_use]
    pub fn new(initial: Duration) -> Self {
        Self {
            initial,
            current: initial,
        }
    }

    /// The next delay to sleep; doubles the base for the following call.
    pub fn next_delay(&mut self) -> Duration {
        let base = self.current.min(CAP);
        self.current = (self.current * 2).min(CAP);
        base + Duration::from_millis(rand::thread_rng().gen_range(0..JITTER_MS))
    }

    /// Reset to the floor after a successful connection.
    pub fn reset(&mut self) {
        self.current = self.initial;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn doubles_until_the_cap() {
        let mut backoff = Backoff::new(Duration::from_millis(1_000));
        let d1 = backoff.next_delay();
        let d2 = backoff.next_delay();
        let d3 = backoff.next_delay();
        assert!(d1 >= Duration::from_millis(1_000) && d1 < Duration::from_millis(1_250));
        assert!(d2 >= Duration::from_millis(2_000) && d2 < Duration::from_millis(2_250));
        assert!(d3 >= Duration::from_millis(4_000) && d3 < Duration::from_millis(4_250));
    }

    #[test]
    fn caps_at_thirty_seconds() {
        let mut backoff = Backoff::new(Duration::from_secs(20));
        backoff.next_delay(); // 20s, base moves to 40s -> capped
        let capped = backoff.next_delay();
        assert!(capped >= Duration::from_secs(30));
        assert!(capped < Duration::from_secs(30) + Duration::from_millis(250));
    }

    #[test]
    fn reset_returns_to_the_floor() {
        let mut backoff = Backoff::new(Duration::from_millis(100));
        backoff.next_delay();
        backoff.next_delay();
        backoff.reset();
        let after = backoff.next_delay();
        assert!(after < Duration::from_millis(100 + 250));
    }
}
