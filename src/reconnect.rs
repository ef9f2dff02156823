//! Randomized exponential backoff for transport reconnection.
//!
//! Both the device [`Connection`](crate::device::Connection) and the
//! federation [`RemoteLinkClient`](crate::federation::RemoteLinkClient)
//! reconnect through a [`ReconnectPolicy`]. Attempts are 1-based.

use std::time::Duration;

use rand::Rng;

/// Backoff schedule and attempt bound for a reconnecting transport.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectPolicy {
    /// Delay before the first attempt; doubles on every following attempt.
    pub initial_delay: Duration,
    /// Upper bound for the pre-jitter delay.
    pub max_delay: Duration,
    /// Upper bound (exclusive) of the random jitter added to each delay.
    pub max_jitter: Duration,
    /// Maximum number of attempts; `None` retries forever.
    pub max_attempts: Option<u32>,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            max_jitter: Duration::from_secs(1),
            max_attempts: Some(5),
        }
    }
}

impl ReconnectPolicy {
    /// Pre-jitter delay for `attempt`: `initial_delay · 2^(attempt − 1)`,
    /// capped at `max_delay`. Non-decreasing in `attempt`.
    #[must_use]
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        let multiplier = 2_u32.saturating_pow(exponent);
        self.initial_delay
            .checked_mul(multiplier)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Delay to sleep before `attempt`, including random jitter.
    #[must_use]
    pub fn delay(&self, attempt: u32) -> Duration {
        let base = self.base_delay(attempt);
        if self.max_jitter.is_zero() {
            return base;
        }
        let jitter = rand::rng().random_range(0.0..self.max_jitter.as_secs_f64());
        base + Duration::from_secs_f64(jitter)
    }

    /// Returns `true` if `attempt` is still within the bound.
    #[must_use]
    pub fn allows(&self, attempt: u32) -> bool {
        self.max_attempts.is_none_or(|max| attempt <= max)
    }
}

#[cfg(test)]
#[allow(clippy::panic)]
mod tests {
    use super::*;

    fn policy(max_attempts: Option<u32>) -> ReconnectPolicy {
        ReconnectPolicy {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            max_jitter: Duration::from_secs(1),
            max_attempts,
        }
    }

    #[test]
    fn base_delay_doubles_until_cap() {
        let p = policy(None);
        assert_eq!(p.base_delay(1), Duration::from_secs(1));
        assert_eq!(p.base_delay(2), Duration::from_secs(2));
        assert_eq!(p.base_delay(3), Duration::from_secs(4));
        assert_eq!(p.base_delay(5), Duration::from_secs(16));
        assert_eq!(p.base_delay(6), Duration::from_secs(30));
        assert_eq!(p.base_delay(40), Duration::from_secs(30));
    }

    #[test]
    fn base_delay_is_non_decreasing() {
        let p = policy(None);
        let mut last = Duration::ZERO;
        for attempt in 1..64 {
            let d = p.base_delay(attempt);
            assert!(d >= last, "attempt {attempt} went backwards");
            last = d;
        }
    }

    #[test]
    fn jitter_stays_in_range() {
        let p = policy(None);
        for attempt in 1..8 {
            let base = p.base_delay(attempt);
            let d = p.delay(attempt);
            assert!(d >= base);
            assert!(d < base + Duration::from_secs(1));
        }
    }

    #[test]
    fn zero_jitter_is_exact() {
        let p = ReconnectPolicy {
            max_jitter: Duration::ZERO,
            ..policy(None)
        };
        assert_eq!(p.delay(3), Duration::from_secs(4));
    }

    #[test]
    fn bounded_policy_stops_after_max() {
        let p = policy(Some(5));
        assert!(p.allows(1));
        assert!(p.allows(5));
        assert!(!p.allows(6));
    }

    #[test]
    fn unbounded_policy_always_allows() {
        let p = policy(None);
        assert!(p.allows(u32::MAX));
    }
}
