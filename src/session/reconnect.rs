//! Reconnect policy
//!
//! When a session drops without an explicit stop, the registry can dial a
//! replacement automatically. The policy is injectable so callers decide
//! how persistent that should be; the stock behavior selected by
//! `auto_reconnect` is [`ReconnectPolicy::fixed_interval`].

use std::time::Duration;

/// Retry strategy for re-establishing a dropped session.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    /// Whether to reconnect at all.
    pub enabled: bool,
    /// Maximum attempts, `None` meaning retry forever.
    pub max_attempts: Option<u32>,
    /// Delay before the first attempt (ms).
    pub initial_delay_ms: u64,
    /// Ceiling on the backoff delay (ms).
    pub max_delay_ms: u64,
    /// Multiplier applied per attempt.
    pub backoff_multiplier: f64,
    /// Consecutive authentication failures tolerated before giving up,
    /// regardless of `max_attempts`. A stored password that has gone
    /// stale should not hammer the server until the account locks.
    pub max_auth_failures: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            enabled: false,
            max_attempts: Some(5),
            initial_delay_ms: 1000,
            max_delay_ms: 30000,
            backoff_multiplier: 1.5,
            max_auth_failures: 3,
        }
    }
}

impl ReconnectPolicy {
    /// Retry forever at a fixed five second cadence. This is what a
    /// session gets when its connect parameters ask for auto reconnect.
    pub fn fixed_interval() -> Self {
        Self {
            enabled: true,
            max_attempts: None,
            initial_delay_ms: 5000,
            max_delay_ms: 5000,
            backoff_multiplier: 1.0,
            max_auth_failures: 3,
        }
    }

    /// Whether attempt number `attempt` (1-based) is still allowed.
    pub fn allows_attempt(&self, attempt: u32) -> bool {
        match self.max_attempts {
            Some(max) => attempt <= max,
            None => true,
        }
    }

    /// Capped exponential delay before attempt number `attempt`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let base = self.initial_delay_ms as f64;
        let exponent = attempt.saturating_sub(1) as i32;
        let delay = base * self.backoff_multiplier.powi(exponent);
        Duration::from_millis(delay.min(self.max_delay_ms as f64) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_policy_is_disabled_with_backoff() {
        let policy = ReconnectPolicy::default();
        assert!(!policy.enabled);
        assert_eq!(policy.max_attempts, Some(5));
        assert_eq!(policy.max_auth_failures, 3);
    }

    #[test]
    fn delay_grows_exponentially_up_to_the_cap() {
        let policy = ReconnectPolicy::default();
        assert_eq!(policy.delay_for(1), Duration::from_millis(1000));
        assert_eq!(policy.delay_for(2), Duration::from_millis(1500));
        assert_eq!(policy.delay_for(3), Duration::from_millis(2250));
        assert_eq!(policy.delay_for(100), Duration::from_millis(30000));
    }

    #[test]
    fn fixed_interval_never_backs_off_and_never_stops() {
        let policy = ReconnectPolicy::fixed_interval();
        assert!(policy.enabled);
        assert_eq!(policy.delay_for(1), Duration::from_secs(5));
        assert_eq!(policy.delay_for(50), Duration::from_secs(5));
        assert!(policy.allows_attempt(1));
        assert!(policy.allows_attempt(u32::MAX));
    }

    #[test]
    fn bounded_policy_refuses_attempts_past_the_limit() {
        let policy = ReconnectPolicy::default();
        assert!(policy.allows_attempt(5));
        assert!(!policy.allows_attempt(6));
    }
}
