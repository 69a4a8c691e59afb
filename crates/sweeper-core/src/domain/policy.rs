//! Retry policy: how many attempts, and how long to wait between them.

use std::time::Duration;

/// Longest pause `next_delay` returns, unless `base_delay` is already longer.
pub const MAX_DELAY: Duration = Duration::from_secs(60 * 60);

/// Bounded retry policy.
///
/// The service runs with fixed delays (`multiplier == 1.0`): 5 dial attempts
/// 5s apart, 3 delete attempts 2s apart. Both are configurable.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one. Never zero.
    pub max_attempts: u32,

    /// Delay after the first failed attempt.
    pub base_delay: Duration,

    /// Backoff multiplier; `1.0` keeps the delay fixed.
    pub multiplier: f64,
}

impl RetryPolicy {
    /// Fixed delay between attempts.
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay: delay,
            multiplier: 1.0,
        }
    }

    /// Exponential backoff: delay = base_delay * multiplier^(attempts - 1).
    /// A multiplier below 1.0 or not finite falls back to a fixed delay.
    pub fn exponential(max_attempts: u32, base_delay: Duration, multiplier: f64) -> Self {
        let multiplier = if multiplier.is_finite() && multiplier >= 1.0 {
            multiplier
        } else {
            1.0
        };
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            multiplier,
        }
    }

    /// Broker dial policy: 5 attempts, 5s apart.
    pub fn dial_default() -> Self {
        Self::fixed(5, Duration::from_secs(5))
    }

    /// Remote delete policy: 3 attempts, 2s apart.
    pub fn delete_default() -> Self {
        Self::fixed(3, Duration::from_secs(2))
    }

    /// Delay to wait after `attempts` failed attempts (1-indexed).
    /// `attempts == 0` is treated like the first failure.
    /// The result never exceeds `max(MAX_DELAY, base_delay)`.
    pub fn next_delay(&self, attempts: u32) -> Duration {
        let cap = MAX_DELAY.max(self.base_delay);
        let exponent = i32::try_from(attempts.saturating_sub(1)).unwrap_or(i32::MAX);
        let delay_secs = self.base_delay.as_secs_f64() * self.multiplier.powi(exponent);
        if delay_secs.is_nan() || delay_secs < 0.0 {
            // multiplier was set to garbage through the public field
            return self.base_delay;
        }
        Duration::try_from_secs_f64(delay_secs).map_or(cap, |delay| delay.min(cap))
    }

    /// Is there an attempt left after `attempts` have failed?
    pub fn allows_retry(&self, attempts: u32) -> bool {
        attempts < self.max_attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn defaults_match_the_service_policy() {
        let dial = RetryPolicy::dial_default();
        assert_eq!(dial.max_attempts, 5);
        assert_eq!(dial.next_delay(1), Duration::from_secs(5));

        let delete = RetryPolicy::delete_default();
        assert_eq!(delete.max_attempts, 3);
        assert_eq!(delete.next_delay(1), Duration::from_secs(2));
    }

    #[test]
    fn fixed_policy_never_grows() {
        let policy = RetryPolicy::fixed(3, Duration::from_secs(2));
        assert_eq!(policy.next_delay(1), policy.next_delay(3));
    }

    #[test]
    fn exponential_backoff_increases() {
        let policy = RetryPolicy::exponential(5, Duration::from_secs(2), 2.0);

        // attempt 1: 2s, attempt 2: 4s, attempt 3: 8s
        assert_eq!(policy.next_delay(1), Duration::from_secs(2));
        assert_eq!(policy.next_delay(2), Duration::from_secs(4));
        assert_eq!(policy.next_delay(3), Duration::from_secs(8));
    }

    #[test]
    fn exponential_growth_is_capped() {
        let policy = RetryPolicy::exponential(2000, Duration::from_secs(1), 2.0);
        assert_eq!(policy.next_delay(12), Duration::from_secs(2048));
        assert_eq!(policy.next_delay(13), MAX_DELAY);
        assert_eq!(policy.next_delay(1500), MAX_DELAY);
        assert_eq!(policy.next_delay(u32::MAX), MAX_DELAY);
    }

    #[rstest]
    #[case::shrinking(0.5)]
    #[case::negative(-2.0)]
    #[case::nan(f64::NAN)]
    #[case::infinite(f64::INFINITY)]
    fn invalid_multiplier_falls_back_to_fixed(#[case] multiplier: f64) {
        let policy = RetryPolicy::exponential(10, Duration::from_secs(3), multiplier);
        assert_eq!(policy.multiplier, 1.0);
        assert_eq!(policy.next_delay(9), Duration::from_secs(3));
    }

    #[test]
    fn garbage_in_public_field_does_not_panic() {
        let mut policy = RetryPolicy::fixed(3, Duration::from_secs(2));
        policy.multiplier = f64::NAN;
        assert_eq!(policy.next_delay(2), Duration::from_secs(2));
        policy.multiplier = -3.0;
        assert_eq!(policy.next_delay(2), Duration::from_secs(2));
        policy.multiplier = f64::INFINITY;
        assert_eq!(policy.next_delay(2), MAX_DELAY);
    }

    #[test]
    fn long_base_delay_is_not_cut_by_the_cap() {
        let policy = RetryPolicy::fixed(2, Duration::from_secs(2 * 60 * 60));
        assert_eq!(policy.next_delay(1), Duration::from_secs(2 * 60 * 60));
    }

    #[test]
    fn zero_attempts_is_clamped_to_one() {
        let policy = RetryPolicy::fixed(0, Duration::from_secs(1));
        assert_eq!(policy.max_attempts, 1);
        assert!(!policy.allows_retry(1));
    }
}
