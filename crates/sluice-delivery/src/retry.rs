//! Retry scheduling and backoff calculation.
//!
//! Consumes attempt outcomes and decides between scheduling the next retry
//! and declaring terminal failure, honoring the subscription's delivery
//! mode. Linear strategies wait a fixed interval between attempts;
//! exponential strategies double from the base duration up to a cap.

use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use sluice_core::models::{DeliveryMode, RetryConfig, RetryStrategy};

/// Retry policy applied to a delivery.
///
/// Built from the project-level retry configuration, optionally overridden
/// per subscription. `retry_count` is the number of retries after the
/// initial attempt, so a delivery makes at most `retry_count + 1` attempts
/// before reaching Failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Backoff strategy.
    pub strategy: RetryStrategy,

    /// Base interval between attempts.
    pub duration: Duration,

    /// Number of retries after the initial attempt.
    pub retry_count: u32,

    /// Cap on the interval for exponential backoff.
    pub max_delay: Duration,

    /// Jitter fraction (0.0 to 1.0) randomizing each delay.
    pub jitter_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            strategy: RetryStrategy::Exponential,
            duration: Duration::from_secs(1),
            retry_count: 10,
            max_delay: Duration::from_secs(512),
            jitter_factor: 0.0,
        }
    }
}

impl RetryPolicy {
    /// Builds a policy from persisted retry configuration.
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            strategy: config.strategy,
            duration: config.duration,
            retry_count: config.retry_count,
            ..Self::default()
        }
    }

    /// Maximum number of attempts, including the initial one.
    pub fn max_attempts(&self) -> u32 {
        self.retry_count.saturating_add(1)
    }

    /// Delay before the retry that would become attempt `attempt + 1`,
    /// where `attempt` is the 1-based number of the attempt that just
    /// failed.
    pub fn delay_after_attempt(&self, attempt: u32) -> Duration {
        let base = match self.strategy {
            RetryStrategy::Linear => self.duration,
            RetryStrategy::Exponential => {
                let exponent = attempt.saturating_sub(1).min(20);
                self.duration.saturating_mul(2_u32.saturating_pow(exponent))
            },
        };

        let capped = std::cmp::min(base, self.max_delay);
        std::cmp::min(apply_jitter(capped, self.jitter_factor), self.max_delay)
    }
}

/// Decision produced after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NextAction {
    /// Schedule the next attempt at the given instant.
    ScheduleRetry(DateTime<Utc>),

    /// Stop retrying; the delivery is terminally failed.
    Fail,
}

/// Decides what happens after attempt number `attempt` failed.
///
/// `attempt` is 1-based and counts actual dispatches (rate-limit deferrals
/// are not attempts). At-most-once deliveries never retry: the single
/// attempt is terminal regardless of outcome. At-least-once deliveries
/// retry until the budget of `retry_count + 1` attempts is exhausted.
pub fn next_action(
    policy: &RetryPolicy,
    mode: DeliveryMode,
    attempt: u32,
    failed_at: DateTime<Utc>,
) -> NextAction {
    if mode == DeliveryMode::AtMostOnce {
        return NextAction::Fail;
    }

    if attempt >= policy.max_attempts() {
        return NextAction::Fail;
    }

    let delay = policy.delay_after_attempt(attempt);
    let Ok(delay) = chrono::Duration::from_std(delay) else {
        return NextAction::Fail;
    };

    NextAction::ScheduleRetry(failed_at + delay)
}

/// Randomizes a delay by up to `jitter_factor` in either direction, spreading
/// synchronized retries across a window instead of a thundering herd.
fn apply_jitter(duration: Duration, jitter_factor: f64) -> Duration {
    if jitter_factor <= 0.0 {
        return duration;
    }

    let clamped = jitter_factor.clamp(0.0, 1.0);
    let mut rng = rand::rng();
    let range = duration.as_secs_f64() * clamped;
    let offset = rng.random_range(-range..=range);

    Duration::from_secs_f64((duration.as_secs_f64() + offset).max(0.0))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn linear_policy(duration_ms: u64, retry_count: u32) -> RetryPolicy {
        RetryPolicy {
            strategy: RetryStrategy::Linear,
            duration: Duration::from_millis(duration_ms),
            retry_count,
            max_delay: Duration::from_secs(3600),
            jitter_factor: 0.0,
        }
    }

    fn exponential_policy(duration_ms: u64, retry_count: u32) -> RetryPolicy {
        RetryPolicy {
            strategy: RetryStrategy::Exponential,
            duration: Duration::from_millis(duration_ms),
            retry_count,
            max_delay: Duration::from_secs(3600),
            jitter_factor: 0.0,
        }
    }

    #[test]
    fn linear_strategy_uses_a_fixed_interval() {
        let policy = linear_policy(1000, 10);
        for attempt in 1..=10 {
            assert_eq!(policy.delay_after_attempt(attempt), Duration::from_millis(1000));
        }
    }

    #[test]
    fn linear_schedule_matches_specified_scenario() {
        // duration=1000ms, retry_count=10: failures 1..=10 each schedule the
        // next retry at now+1000ms; the 11th failure exhausts the budget.
        let policy = linear_policy(1000, 10);
        let now = Utc::now();

        for attempt in 1..=10 {
            match next_action(&policy, DeliveryMode::AtLeastOnce, attempt, now) {
                NextAction::ScheduleRetry(at) => {
                    assert_eq!(at, now + chrono::Duration::milliseconds(1000));
                },
                NextAction::Fail => unreachable!("attempt {attempt} should schedule a retry"),
            }
        }

        assert_eq!(next_action(&policy, DeliveryMode::AtLeastOnce, 11, now), NextAction::Fail);
    }

    #[test]
    fn exponential_delay_doubles_each_attempt() {
        let policy = exponential_policy(1000, 10);

        assert_eq!(policy.delay_after_attempt(1), Duration::from_millis(1000));
        assert_eq!(policy.delay_after_attempt(2), Duration::from_millis(2000));
        assert_eq!(policy.delay_after_attempt(3), Duration::from_millis(4000));
        assert_eq!(policy.delay_after_attempt(4), Duration::from_millis(8000));
        assert_eq!(policy.delay_after_attempt(10), Duration::from_millis(512_000));
    }

    #[test]
    fn exponential_delay_respects_the_cap() {
        let policy = RetryPolicy {
            max_delay: Duration::from_secs(60),
            ..exponential_policy(1000, 30)
        };

        assert_eq!(policy.delay_after_attempt(20), Duration::from_secs(60));
    }

    #[test]
    fn at_least_once_fails_only_after_budget_exhaustion() {
        let policy = exponential_policy(100, 3);
        let now = Utc::now();

        // Attempts 1..=3 schedule retries; attempt 4 (= retry_count + 1) fails.
        for attempt in 1..=3 {
            assert!(matches!(
                next_action(&policy, DeliveryMode::AtLeastOnce, attempt, now),
                NextAction::ScheduleRetry(_)
            ));
        }
        assert_eq!(next_action(&policy, DeliveryMode::AtLeastOnce, 4, now), NextAction::Fail);
    }

    #[test]
    fn at_most_once_never_schedules_a_retry() {
        let policy = exponential_policy(100, 10);
        let now = Utc::now();

        assert_eq!(next_action(&policy, DeliveryMode::AtMostOnce, 1, now), NextAction::Fail);
    }

    #[test]
    fn jitter_varies_the_delay_within_bounds() {
        let policy = RetryPolicy {
            jitter_factor: 0.5,
            ..linear_policy(10_000, 5)
        };

        let mut seen = std::collections::HashSet::new();
        for _ in 0..20 {
            let delay = policy.delay_after_attempt(1);
            assert!(delay >= Duration::from_millis(5_000), "delay too small: {delay:?}");
            assert!(delay <= Duration::from_millis(15_000), "delay too large: {delay:?}");
            seen.insert(delay.as_millis());
        }
        assert!(seen.len() > 1, "jitter should create variation");
    }

    #[test]
    fn policy_from_config_keeps_strategy_and_budget() {
        let config = RetryConfig {
            strategy: RetryStrategy::Linear,
            duration: Duration::from_millis(250),
            retry_count: 4,
        };
        let policy = RetryPolicy::from_config(&config);

        assert_eq!(policy.strategy, RetryStrategy::Linear);
        assert_eq!(policy.duration, Duration::from_millis(250));
        assert_eq!(policy.max_attempts(), 5);
    }
}
