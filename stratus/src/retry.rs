//! Retry strategies with exponential backoff.
//!
//! Used by the subscription engine in two places with different defaults:
//! user callbacks retry without an attempt bound (delivery is at-least-once
//! and giving up would drop the event), while change-feed reopens are bounded
//! before the subscription surfaces a failure.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Exponential-backoff retry configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryStrategy {
    /// Maximum number of attempts, or `None` to retry forever.
    pub max_attempts: Option<u32>,
    /// Delay before the first retry.
    pub base_delay: Duration,
    /// Upper bound on the delay between attempts.
    pub max_delay: Duration,
    /// Multiplier applied to the delay after each attempt.
    pub backoff_multiplier: f64,
    /// Whether to add jitter to spread out concurrent retriers.
    pub use_jitter: bool,
}

impl Default for RetryStrategy {
    fn default() -> Self {
        Self {
            max_attempts: Some(3),
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
            backoff_multiplier: 2.0,
            use_jitter: true,
        }
    }
}

impl RetryStrategy {
    /// Unbounded retry from 100 ms doubling up to a 5 s cap.
    ///
    /// The default for user-callback delivery.
    pub const fn unbounded() -> Self {
        Self {
            max_attempts: None,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
            backoff_multiplier: 2.0,
            use_jitter: true,
        }
    }

    /// Bounded retry for re-establishing a change-feed cursor.
    pub const fn feed_reopen() -> Self {
        Self {
            max_attempts: Some(10),
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(10),
            backoff_multiplier: 2.0,
            use_jitter: true,
        }
    }

    /// Simple backoff from the three classic parameters, retrying forever.
    pub const fn backoff(initial: Duration, max: Duration, multiplier: f64) -> Self {
        Self {
            max_attempts: None,
            base_delay: initial,
            max_delay: max,
            backoff_multiplier: multiplier,
            use_jitter: false,
        }
    }

    /// Whether another attempt is allowed after `attempts` tries.
    pub fn allows_attempt(&self, attempts: u32) -> bool {
        self.max_attempts.map_or(true, |max| attempts < max)
    }

    /// The delay to wait before attempt number `attempt` (1-based; attempt 0
    /// is the initial try and waits nothing).
    #[allow(clippy::cast_precision_loss)]
    #[allow(clippy::cast_possible_truncation)]
    #[allow(clippy::cast_sign_loss)]
    pub fn calculate_delay(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let delay_ms = self.base_delay.as_millis() as f64
            * self.backoff_multiplier.powi(attempt.saturating_sub(1) as i32);
        let delay = Duration::from_millis(delay_ms as u64);
        let capped = std::cmp::min(delay, self.max_delay);

        if self.use_jitter {
            add_jitter(capped)
        } else {
            capped
        }
    }
}

/// Scales the delay by a random factor in `[0.8, 1.2)`.
#[allow(clippy::cast_precision_loss)]
#[allow(clippy::cast_possible_truncation)]
#[allow(clippy::cast_sign_loss)]
fn add_jitter(delay: Duration) -> Duration {
    use rand::Rng;
    let jitter_factor = rand::thread_rng().gen_range(0.8..1.2);
    let jittered_ms = (delay.as_millis() as f64 * jitter_factor) as u64;
    Duration::from_millis(jittered_ms)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn without_jitter(mut strategy: RetryStrategy) -> RetryStrategy {
        strategy.use_jitter = false;
        strategy
    }

    #[test]
    fn delay_grows_exponentially_until_the_cap() {
        let strategy = without_jitter(RetryStrategy::default());
        assert_eq!(strategy.calculate_delay(0), Duration::ZERO);
        assert_eq!(strategy.calculate_delay(1), Duration::from_millis(100));
        assert_eq!(strategy.calculate_delay(2), Duration::from_millis(200));
        assert_eq!(strategy.calculate_delay(3), Duration::from_millis(400));
        assert_eq!(strategy.calculate_delay(10), Duration::from_secs(5));
    }

    #[test]
    fn unbounded_strategy_always_allows_another_attempt() {
        let strategy = RetryStrategy::unbounded();
        assert!(strategy.allows_attempt(0));
        assert!(strategy.allows_attempt(1_000_000));
    }

    #[test]
    fn bounded_strategy_stops_at_max_attempts() {
        let strategy = RetryStrategy::feed_reopen();
        assert!(strategy.allows_attempt(9));
        assert!(!strategy.allows_attempt(10));
    }

    #[test]
    fn jitter_stays_within_twenty_percent() {
        let strategy = RetryStrategy {
            use_jitter: true,
            ..RetryStrategy::default()
        };
        for _ in 0..100 {
            let delay = strategy.calculate_delay(2);
            assert!(delay >= Duration::from_millis(160));
            assert!(delay <= Duration::from_millis(240));
        }
    }

    #[test]
    fn backoff_constructor_carries_the_parameters() {
        let strategy =
            RetryStrategy::backoff(Duration::from_millis(50), Duration::from_secs(1), 3.0);
        assert_eq!(strategy.calculate_delay(1), Duration::from_millis(50));
        assert_eq!(strategy.calculate_delay(2), Duration::from_millis(150));
        assert_eq!(strategy.calculate_delay(3), Duration::from_millis(450));
        assert_eq!(strategy.calculate_delay(4), Duration::from_secs(1));
    }
}
