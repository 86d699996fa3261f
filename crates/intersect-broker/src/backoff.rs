// SPDX-License-Identifier: MIT OR Apache-2.0
//! Capped exponential backoff for broker reconnection.

use rand::Rng;
use std::time::Duration;

const INITIAL_DELAY: Duration = Duration::from_millis(250);
const MAX_DELAY: Duration = Duration::from_secs(30);
const JITTER_FRACTION: f64 = 0.2;

/// Reconnect pacing: 250 ms doubling to a 30 s ceiling, ±20 % jitter.
#[derive(Debug, Clone)]
pub struct ReconnectBackoff {
    attempt: u32,
    initial: Duration,
    cap: Duration,
}

impl Default for ReconnectBackoff {
    fn default() -> Self {
        Self::new()
    }
}

impl ReconnectBackoff {
    /// Backoff with the protocol's standard pacing.
    #[must_use]
    pub fn new() -> Self {
        Self {
            attempt: 0,
            initial: INITIAL_DELAY,
            cap: MAX_DELAY,
        }
    }

    /// Backoff with custom pacing (tests).
    #[must_use]
    pub fn with_bounds(initial: Duration, cap: Duration) -> Self {
        Self {
            attempt: 0,
            initial,
            cap,
        }
    }

    /// Number of delays handed out since the last [`reset`](Self::reset).
    #[must_use]
    pub fn attempts(&self) -> u32 {
        self.attempt
    }

    /// The next delay to sleep before reconnecting.
    pub fn next_delay(&mut self) -> Duration {
        let exponent = self.attempt.min(30);
        self.attempt = self.attempt.saturating_add(1);
        let base = self
            .initial
            .saturating_mul(2u32.saturating_pow(exponent))
            .min(self.cap);
        jitter(base)
    }

    /// Start over after a successful connection.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

fn jitter(base: Duration) -> Duration {
    let factor = rand::thread_rng().gen_range(1.0 - JITTER_FRACTION..=1.0 + JITTER_FRACTION);
    base.mul_f64(factor)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delays_double_up_to_the_cap() {
        let mut backoff = ReconnectBackoff::new();
        let mut previous_base = Duration::ZERO;
        for i in 0..12 {
            let delay = backoff.next_delay();
            let expected_base = INITIAL_DELAY
                .saturating_mul(2u32.saturating_pow(i))
                .min(MAX_DELAY);
            let low = expected_base.mul_f64(1.0 - JITTER_FRACTION);
            let high = expected_base.mul_f64(1.0 + JITTER_FRACTION);
            assert!(delay >= low && delay <= high, "attempt {i}: {delay:?}");
            assert!(delay >= previous_base.mul_f64(1.0 - JITTER_FRACTION) || expected_base == MAX_DELAY);
            previous_base = expected_base;
        }
    }

    #[test]
    fn ceiling_holds_with_jitter() {
        let mut backoff = ReconnectBackoff::new();
        for _ in 0..40 {
            let delay = backoff.next_delay();
            assert!(delay <= MAX_DELAY.mul_f64(1.0 + JITTER_FRACTION));
        }
    }

    #[test]
    fn reset_restarts_the_sequence() {
        let mut backoff = ReconnectBackoff::new();
        for _ in 0..8 {
            backoff.next_delay();
        }
        backoff.reset();
        assert_eq!(backoff.attempts(), 0);
        let delay = backoff.next_delay();
        assert!(delay <= INITIAL_DELAY.mul_f64(1.0 + JITTER_FRACTION));
    }
}
