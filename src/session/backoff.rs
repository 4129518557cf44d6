use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Reconnect schedule: exponential delays with a cap, jitter and a budget.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffPolicy {
    /// Delay before the first reconnect attempt.
    pub base_delay_ms: u64,
    /// Upper bound for a single delay.
    pub max_delay_ms: u64,
    /// Reconnect attempts before giving up.
    pub max_attempts: u32,
    /// Fraction in `[0, 1]` by which a delay may be shortened at random.
    pub jitter: f64,
    /// Total time spent reconnecting before giving up.
    pub overall_timeout_ms: u64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base_delay_ms: 1_000,
            max_delay_ms: 30_000,
            max_attempts: 5,
            jitter: 0.2,
            overall_timeout_ms: 300_000,
        }
    }
}

impl BackoffPolicy {
    /// Delay before attempt `attempt` (1-based) without jitter.
    pub fn nominal_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(32);
        let ms = self
            .base_delay_ms
            .saturating_mul(1u64 << exponent)
            .min(self.max_delay_ms);
        Duration::from_millis(ms)
    }

    /// Delay before attempt `attempt` (1-based) with jitter applied.
    pub fn delay(&self, attempt: u32) -> Duration {
        let nominal = self.nominal_delay(attempt);
        if self.jitter <= 0.0 {
            return nominal;
        }
        let cut = rand::thread_rng().gen_range(0.0..=self.jitter.min(1.0));
        nominal.mul_f64(1.0 - cut)
    }

    pub fn overall_timeout(&self) -> Duration {
        Duration::from_millis(self.overall_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delays_double_until_cap() {
        let policy = BackoffPolicy::default();
        let delays: Vec<u64> = (1..=7).map(|n| policy.nominal_delay(n).as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 16, 30, 30]);
    }

    #[test]
    fn test_jitter_only_shortens() {
        let policy = BackoffPolicy::default();
        for attempt in 1..=6 {
            let nominal = policy.nominal_delay(attempt);
            for _ in 0..50 {
                let delay = policy.delay(attempt);
                assert!(delay <= nominal);
                assert!(delay >= nominal.mul_f64(0.8));
            }
        }
    }

    #[test]
    fn test_no_jitter_is_exact() {
        let policy = BackoffPolicy {
            jitter: 0.0,
            ..BackoffPolicy::default()
        };
        assert_eq!(policy.delay(3), Duration::from_secs(4));
    }

    #[test]
    fn test_huge_attempt_does_not_overflow() {
        let policy = BackoffPolicy::default();
        assert_eq!(policy.nominal_delay(u32::MAX), Duration::from_secs(30));
    }
}
