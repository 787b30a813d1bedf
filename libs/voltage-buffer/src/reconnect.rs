//! Reconnect backoff for broker transports
//!
//! Exponential backoff with optional ±25% jitter. Transports retry forever;
//! published messages are buffered meanwhile, so there is no attempt limit.

use rand::Rng;
use std::time::Duration;

/// Backoff policy configuration
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectPolicy {
    /// Delay before the first retry
    pub initial_delay: Duration,
    /// Upper bound for any delay
    pub max_delay: Duration,
    /// Growth factor per failed attempt
    pub backoff_multiplier: f64,
    /// Randomize delays by ±25%
    pub jitter: bool,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }
}

impl ReconnectPolicy {
    /// Create from configuration values
    pub fn from_config(initial_delay_ms: u64, max_delay_ms: u64) -> Self {
        Self {
            initial_delay: Duration::from_millis(initial_delay_ms),
            max_delay: Duration::from_millis(max_delay_ms.max(initial_delay_ms)),
            ..Default::default()
        }
    }
}

/// Attempt counter driving a [`ReconnectPolicy`]
#[derive(Debug)]
pub struct Backoff {
    policy: ReconnectPolicy,
    attempt: u32,
}

impl Backoff {
    pub fn new(policy: ReconnectPolicy) -> Self {
        Self { policy, attempt: 0 }
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Register a failed attempt and return how long to wait before the next one.
    pub fn next_delay(&mut self) -> Duration {
        self.attempt = self.attempt.saturating_add(1);
        self.delay_for(self.attempt)
    }

    /// Back to the initial delay after a successful connect.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;

        // delay = initial_delay * (multiplier ^ attempt), capped
        let factor = self.policy.backoff_multiplier.powi(exponent);
        let mut delay = if factor.is_finite() {
            self.policy
                .initial_delay
                .mul_f64(factor)
                .min(self.policy.max_delay)
        } else {
            self.policy.max_delay
        };

        if self.policy.jitter {
            let millis = delay.as_millis() as f64;
            let jitter_range = millis * 0.25;
            if jitter_range > 0.0 {
                let jitter = rand::thread_rng().gen_range(-jitter_range..jitter_range);
                delay = Duration::from_millis((millis + jitter).max(0.0) as u64);
            }
        }

        delay
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(jitter: bool) -> ReconnectPolicy {
        ReconnectPolicy {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            backoff_multiplier: 2.0,
            jitter,
        }
    }

    #[test]
    fn test_exponential_backoff() {
        let mut backoff = Backoff::new(policy(false));

        assert_eq!(backoff.next_delay(), Duration::from_millis(100));
        assert_eq!(backoff.next_delay(), Duration::from_millis(200));
        assert_eq!(backoff.next_delay(), Duration::from_millis(400));
        assert_eq!(backoff.next_delay(), Duration::from_millis(800));
        assert_eq!(backoff.attempt(), 4);
    }

    #[test]
    fn test_max_delay_limit() {
        let mut backoff = Backoff::new(ReconnectPolicy {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(5),
            backoff_multiplier: 2.0,
            jitter: false,
        });

        for _ in 0..200 {
            assert!(backoff.next_delay() <= Duration::from_secs(5));
        }
    }

    #[test]
    fn test_reset_restarts_sequence() {
        let mut backoff = Backoff::new(policy(false));
        backoff.next_delay();
        backoff.next_delay();
        backoff.reset();

        assert_eq!(backoff.attempt(), 0);
        assert_eq!(backoff.next_delay(), Duration::from_millis(100));
    }

    #[test]
    fn test_jitter_stays_within_quarter() {
        let mut backoff = Backoff::new(policy(true));
        for _ in 0..50 {
            backoff.reset();
            let delay = backoff.next_delay();
            assert!(delay >= Duration::from_millis(75));
            assert!(delay <= Duration::from_millis(125));
        }
    }

    #[test]
    fn test_from_config_keeps_max_above_initial() {
        let policy = ReconnectPolicy::from_config(2_000, 500);
        assert_eq!(policy.initial_delay, Duration::from_secs(2));
        assert_eq!(policy.max_delay, Duration::from_secs(2));
    }
}
