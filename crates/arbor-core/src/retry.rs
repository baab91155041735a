//! Retry policy: decides backoff delays.

use rand::Rng;
use std::time::Duration;

/// No retries: a single transient failure gives up immediately.
pub const RETRY_NEVER: u32 = 0;
/// One retry.
pub const RETRY_ONCE: u32 = 1;
/// A handful of retries; the default budget.
pub const RETRY_A_FEW: u32 = 5;
/// Persistent retrying for operations expected to succeed eventually.
pub const RETRY_A_LOT: u32 = 32;
/// Effectively unbounded. Finite so the budget invariant stays total.
pub const RETRY_FOREVER: u32 = u32::MAX;

/// Jittered exponential backoff for transiently-failed work.
///
/// For attempt `r` (0-based) the delay is
/// `unit * uniform(1, min(2^(r+1), max_ticks))`.
///
/// The jitter keeps sibling trees from retrying in lockstep; the cap bounds
/// the worst-case wait (default unit 1s, cap 4096 ticks, just over an hour).
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Length of one backoff tick.
    pub unit: Duration,

    /// Upper bound on the jitter range, in ticks.
    pub max_ticks: u32,
}

impl RetryPolicy {
    /// The standard policy: 1-second ticks, capped at 4096.
    pub fn standard() -> Self {
        Self {
            unit: Duration::from_secs(1),
            max_ticks: 4096,
        }
    }

    /// A policy with a custom tick length. Shrinking the tick is the
    /// intended way to speed up tests and demos.
    pub fn with_unit(unit: Duration) -> Self {
        Self {
            unit,
            max_ticks: 4096,
        }
    }

    /// Delay before the next retry, given how many retries have already
    /// been consumed (0-based).
    pub fn next_delay(&self, attempts: u32) -> Duration {
        let ticks = rand::thread_rng().gen_range(1..=self.ceiling(attempts));
        self.unit * ticks
    }

    /// Upper bound of the jitter range for a given attempt count.
    pub fn ceiling(&self, attempts: u32) -> u32 {
        // 2^(attempts+1), saturating well before u32 overflow.
        let exp = attempts.saturating_add(1).min(31);
        (1u32 << exp).min(self.max_ticks).max(1)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::standard()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(0, 2)]
    #[case(1, 4)]
    #[case(2, 8)]
    #[case(5, 64)]
    #[case(11, 4096)]
    #[case(12, 4096)]
    #[case(31, 4096)]
    fn ceiling_follows_doubling_up_to_cap(#[case] attempts: u32, #[case] expected: u32) {
        let policy = RetryPolicy::standard();
        assert_eq!(policy.ceiling(attempts), expected);
    }

    #[rstest]
    #[case(0)]
    #[case(1)]
    #[case(3)]
    #[case(10)]
    #[case(20)]
    fn delay_stays_within_bounds(#[case] attempts: u32) {
        let policy = RetryPolicy::standard();
        let ceiling = policy.ceiling(attempts) as u64;
        for _ in 0..200 {
            let d = policy.next_delay(attempts);
            assert!(d >= Duration::from_secs(1));
            assert!(d <= Duration::from_secs(ceiling));
        }
    }

    #[test]
    fn ceiling_never_overflows() {
        let policy = RetryPolicy::standard();
        assert_eq!(policy.ceiling(u32::MAX), 4096);
    }

    #[test]
    fn budget_constants_are_ordered() {
        assert!(RETRY_NEVER < RETRY_ONCE);
        assert!(RETRY_ONCE < RETRY_A_FEW);
        assert!(RETRY_A_FEW < RETRY_A_LOT);
        assert!(RETRY_A_LOT < RETRY_FOREVER);
    }
}
