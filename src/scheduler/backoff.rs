// SPDX-FileCopyrightText: 2026 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

use std::time::Duration;

use rand::Rng;

/// Exponential backoff with jitter.
///
/// The delay for attempt `n` (1-based) is `base * 2^(n-1)` capped at `max`,
/// scaled by a uniform jitter factor in `[0.75, 1.25]`.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    base: Duration,
    max: Duration,
}

impl RetryPolicy {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self { base, max }
    }

    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(24);
        let unjittered = self
            .base
            .saturating_mul(1u32 << exponent)
            .min(self.max)
            .as_millis() as u64;
        let jitter: f64 = rand::thread_rng().gen_range(0.75..=1.25);
        Duration::from_millis((unjittered as f64 * jitter) as u64)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(300))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_and_is_capped() {
        let policy = RetryPolicy::new(Duration::from_secs(1), Duration::from_secs(60));
        let first = policy.backoff(1);
        assert!(first >= Duration::from_millis(750));
        assert!(first <= Duration::from_millis(1_250));

        // Far beyond the cap; jitter still applies on top of the cap.
        let late = policy.backoff(20);
        assert!(late >= Duration::from_millis(45_000));
        assert!(late <= Duration::from_millis(75_000));
    }

    #[test]
    fn huge_attempt_counts_do_not_overflow() {
        let policy = RetryPolicy::new(Duration::from_secs(1), Duration::from_secs(60));
        let delay = policy.backoff(u32::MAX);
        assert!(delay <= Duration::from_millis(75_000));
    }
}
