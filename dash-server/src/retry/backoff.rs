//! Backoff between retry attempts.
//!
//! - Delay before retry `n` (1-based) = base * 2^(n - 1)
//! - Capped at `max_backoff`
//! - Optional jitter adds up to a quarter of the capped delay

use std::time::Duration;

use rand::random;

/// Default base backoff duration (1 second).
pub const DEFAULT_BASE_BACKOFF: Duration = Duration::from_secs(1);

/// Default maximum backoff duration (30 seconds).
pub const DEFAULT_MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Maximum exponent to prevent overflow.
const MAX_EXPONENT: u32 = 10;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub base_backoff: Duration,
    pub max_backoff: Duration,
    pub jitter: bool,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base_backoff: DEFAULT_BASE_BACKOFF,
            max_backoff: DEFAULT_MAX_BACKOFF,
            jitter: false,
        }
    }
}

impl BackoffPolicy {
    pub fn new(base_backoff: Duration, max_backoff: Duration) -> Self {
        Self {
            base_backoff,
            max_backoff,
            jitter: false,
        }
    }

    /// Same delay before every retry.
    pub fn fixed(delay: Duration) -> Self {
        Self::new(delay, delay)
    }

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Delay before retry number `retry` (1-based). Zero for `retry == 0`.
    pub fn delay_for(&self, retry: u32) -> Duration {
        if retry == 0 {
            return Duration::ZERO;
        }

        let exponent = (retry - 1).min(MAX_EXPONENT);
        let multiplier = 2u32.saturating_pow(exponent);
        let capped = self
            .base_backoff
            .saturating_mul(multiplier)
            .min(self.max_backoff);

        if !self.jitter {
            return capped;
        }

        let capped_ms = capped.as_millis() as u64;
        let jitter_ms = random::<u64>() % (capped_ms / 4 + 1);
        capped + Duration::from_millis(jitter_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(0, 0)]
    #[case(1, 100)]
    #[case(2, 200)]
    #[case(3, 400)]
    #[case(4, 800)]
    #[case(5, 1000)]
    #[case(40, 1000)]
    fn test_delay_for(#[case] retry: u32, #[case] expected_ms: u64) {
        let policy = BackoffPolicy::new(Duration::from_millis(100), Duration::from_secs(1));
        assert_eq!(policy.delay_for(retry), Duration::from_millis(expected_ms));
    }

    #[test]
    fn test_fixed_policy() {
        let policy = BackoffPolicy::fixed(Duration::from_millis(50));
        assert_eq!(policy.delay_for(1), Duration::from_millis(50));
        assert_eq!(policy.delay_for(7), Duration::from_millis(50));
    }

    #[test]
    fn test_jitter_bounds() {
        let policy =
            BackoffPolicy::new(Duration::from_millis(400), Duration::from_secs(10)).with_jitter(true);
        for _ in 0..100 {
            let delay = policy.delay_for(1);
            assert!(delay >= Duration::from_millis(400));
            assert!(delay <= Duration::from_millis(500));
        }
    }
}
