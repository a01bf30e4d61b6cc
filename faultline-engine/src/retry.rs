//! Retry decisions and backoff for a single guarded call.
//!
//! A [`RetryPolicy`] wraps a command's [`RetryConfig`] and answers two
//! questions after each failed attempt: should the call be attempted again,
//! and how long to pause first. [`RetryAttempt`] carries the per-call
//! attempt counter and start instant.
//!
//! # Example
//!
//! ```
//! use faultline_core::{ErrorKind, ErrorKindSet, RetryConfig};
//! use faultline_engine::retry::{RetryDecision, RetryPolicy, StopReason};
//! use std::time::Duration;
//!
//! let policy = RetryPolicy::new(
//!     RetryConfig::default()
//!         .with_max_retries(1)
//!         .with_abort_on(ErrorKindSet::of(["auth"])),
//! );
//!
//! let io = ErrorKind::new("io");
//! assert_eq!(policy.should_retry(1, &io, Duration::ZERO), RetryDecision::Retry);
//! assert_eq!(
//!     policy.should_retry(2, &io, Duration::ZERO),
//!     RetryDecision::Stop(StopReason::MaxRetries)
//! );
//! assert_eq!(
//!     policy.should_retry(1, &ErrorKind::new("auth.expired"), Duration::ZERO),
//!     RetryDecision::Stop(StopReason::Aborted)
//! );
//! ```

use std::time::Duration;

use faultline_core::{ErrorKind, RetryConfig};
use rand::Rng;
use tokio::time::Instant;

/// Why a failed call will not be attempted again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// The error matched `abort_on`
    Aborted,
    /// The error did not match `retry_on`
    NotRetryable,
    /// The `max_duration` budget is spent
    MaxDuration,
    /// All `max_retries` retries were used
    MaxRetries,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    Retry,
    Stop(StopReason),
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    config: RetryConfig,
}

impl RetryPolicy {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Decides whether to retry after `attempt` (1-based) failed with `error`.
    pub fn should_retry(&self, attempt: u32, error: &ErrorKind, elapsed: Duration) -> RetryDecision {
        if self.config.abort_on.matches(error) {
            return RetryDecision::Stop(StopReason::Aborted);
        }
        if !self.config.retry_on.matches(error) {
            return RetryDecision::Stop(StopReason::NotRetryable);
        }
        if !self.config.max_duration.is_zero() && elapsed >= self.config.max_duration {
            return RetryDecision::Stop(StopReason::MaxDuration);
        }
        if self.config.max_retries != -1 {
            let max_attempts = i64::from(self.config.max_retries) + 1;
            if i64::from(attempt) >= max_attempts {
                return RetryDecision::Stop(StopReason::MaxRetries);
            }
        }
        RetryDecision::Retry
    }

    /// Pause before the next attempt: `delay` shifted by a uniform sample
    /// from `[-jitter, +jitter]`, never below zero.
    pub fn next_delay(&self) -> Duration {
        self.next_delay_with(&mut rand::thread_rng())
    }

    pub fn next_delay_with<R: Rng>(&self, rng: &mut R) -> Duration {
        let delay = self.config.delay.as_nanos() as i128;
        let jitter = self.config.jitter.as_nanos() as i128;
        if jitter == 0 {
            return self.config.delay;
        }

        let offset = rng.gen_range(-jitter..=jitter);
        let nanos = (delay + offset).max(0);
        Duration::from_nanos(u64::try_from(nanos).unwrap_or(u64::MAX))
    }
}

/// Attempt bookkeeping for one top-level call.
#[derive(Debug)]
pub struct RetryAttempt {
    attempt: u32,
    started: Instant,
    policy: Option<RetryPolicy>,
}

impl RetryAttempt {
    pub fn start(policy: Option<RetryPolicy>) -> Self {
        Self {
            attempt: 1,
            started: Instant::now(),
            policy,
        }
    }

    /// The attempt currently running, starting at 1.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn retries(&self) -> u32 {
        self.attempt - 1
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn is_enabled(&self) -> bool {
        self.policy.is_some()
    }

    /// Evaluates the failure of the current attempt. On `Retry` the counter
    /// advances and the pause to take is returned.
    pub fn on_failure(&mut self, error: &ErrorKind) -> Result<Duration, StopReason> {
        let Some(policy) = &self.policy else {
            return Err(StopReason::NotRetryable);
        };
        match policy.should_retry(self.attempt, error, self.elapsed()) {
            RetryDecision::Retry => {
                self.attempt += 1;
                Ok(policy.next_delay())
            }
            RetryDecision::Stop(reason) => Err(reason),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use faultline_core::ErrorKindSet;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use rstest::rstest;

    fn io() -> ErrorKind {
        ErrorKind::new("io")
    }

    #[test]
    fn test_fourth_failure_with_three_retries_stops() {
        let policy = RetryPolicy::new(
            RetryConfig::default()
                .with_max_retries(3)
                .with_delay(Duration::from_millis(100))
                .with_jitter(Duration::from_millis(20)),
        );

        for attempt in 1..=3 {
            assert_eq!(
                policy.should_retry(attempt, &io(), Duration::ZERO),
                RetryDecision::Retry
            );
        }
        assert_eq!(
            policy.should_retry(4, &io(), Duration::ZERO),
            RetryDecision::Stop(StopReason::MaxRetries)
        );
    }

    #[test]
    fn test_jittered_delay_stays_in_bounds() {
        let policy = RetryPolicy::new(
            RetryConfig::default()
                .with_delay(Duration::from_millis(100))
                .with_jitter(Duration::from_millis(20)),
        );
        let mut rng = StdRng::seed_from_u64(7);

        for _ in 0..1_000 {
            let delay = policy.next_delay_with(&mut rng);
            assert!(delay >= Duration::from_millis(80), "{delay:?}");
            assert!(delay <= Duration::from_millis(120), "{delay:?}");
        }
    }

    #[test]
    fn test_jitter_larger_than_delay_clamps_at_zero() {
        let policy = RetryPolicy::new(
            RetryConfig::default()
                .with_delay(Duration::from_millis(5))
                .with_jitter(Duration::from_millis(50)),
        );
        let mut rng = StdRng::seed_from_u64(1);
        for _ in 0..200 {
            assert!(policy.next_delay_with(&mut rng) <= Duration::from_millis(55));
        }
    }

    #[test]
    fn test_no_jitter_returns_exact_delay() {
        let policy = RetryPolicy::new(
            RetryConfig::default()
                .with_delay(Duration::from_millis(40))
                .with_jitter(Duration::ZERO),
        );
        assert_eq!(policy.next_delay(), Duration::from_millis(40));
    }

    #[test]
    fn test_abort_wins_over_retry() {
        let policy = RetryPolicy::new(
            RetryConfig::default()
                .with_retry_on(ErrorKindSet::of(["io"]))
                .with_abort_on(ErrorKindSet::of(["io"])),
        );
        assert_eq!(
            policy.should_retry(1, &io(), Duration::ZERO),
            RetryDecision::Stop(StopReason::Aborted)
        );
    }

    #[rstest]
    #[case("io", RetryDecision::Retry)]
    #[case("io.timeout", RetryDecision::Retry)]
    #[case("other", RetryDecision::Stop(StopReason::NotRetryable))]
    fn test_retry_on_filters_errors(#[case] kind: &str, #[case] expected: RetryDecision) {
        let policy =
            RetryPolicy::new(RetryConfig::default().with_retry_on(ErrorKindSet::of(["io"])));
        assert_eq!(
            policy.should_retry(1, &ErrorKind::new(kind), Duration::ZERO),
            expected
        );
    }

    #[test]
    fn test_max_duration_stops_retrying() {
        let policy = RetryPolicy::new(
            RetryConfig::default().with_max_duration(Duration::from_millis(500)),
        );
        assert_eq!(
            policy.should_retry(1, &io(), Duration::from_millis(499)),
            RetryDecision::Retry
        );
        assert_eq!(
            policy.should_retry(1, &io(), Duration::from_millis(500)),
            RetryDecision::Stop(StopReason::MaxDuration)
        );
    }

    #[test]
    fn test_unlimited_retries() {
        let policy = RetryPolicy::new(
            RetryConfig::default()
                .with_max_retries(-1)
                .with_max_duration(Duration::ZERO),
        );
        assert_eq!(
            policy.should_retry(10_000, &io(), Duration::from_secs(3600)),
            RetryDecision::Retry
        );
    }

    #[tokio::test]
    async fn test_attempt_counter_advances_on_retry() {
        let mut attempt = RetryAttempt::start(Some(RetryPolicy::new(
            RetryConfig::default()
                .with_max_retries(1)
                .with_jitter(Duration::ZERO),
        )));

        assert_eq!(attempt.attempt(), 1);
        assert_eq!(attempt.on_failure(&io()), Ok(Duration::ZERO));
        assert_eq!(attempt.attempt(), 2);
        assert_eq!(attempt.retries(), 1);
        assert_eq!(attempt.on_failure(&io()), Err(StopReason::MaxRetries));
    }

    #[tokio::test]
    async fn test_attempt_without_policy_never_retries() {
        let mut attempt = RetryAttempt::start(None);
        assert!(!attempt.is_enabled());
        assert_eq!(attempt.on_failure(&io()), Err(StopReason::NotRetryable));
    }
}
