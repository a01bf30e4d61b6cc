//! Policy configuration for a guarded command.
//!
//! An [`ExecutionMetadata`] value describes every policy that applies to one
//! command. It is resolved once, validated, cached by the engine and only
//! ever replaced wholesale.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::duration::serde_duration;
use crate::error::{ConfigError, ErrorKindSet};

/// Identity of a guarded command, written `<group>.<command>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct CommandId {
    group: String,
    command: String,
}

impl CommandId {
    pub fn new(group: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            group: group.into(),
            command: command.into(),
        }
    }

    pub fn group(&self) -> &str {
        &self.group
    }

    pub fn command(&self) -> &str {
        &self.command
    }
}

impl fmt::Display for CommandId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.group, self.command)
    }
}

impl FromStr for CommandId {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('.') {
            Some((group, command))
                if !group.is_empty() && !command.is_empty() && !command.contains('.') =>
            {
                Ok(Self::new(group, command))
            }
            _ => Err(ConfigError::InvalidCommandId(s.to_string())),
        }
    }
}

impl TryFrom<String> for CommandId {
    type Error = ConfigError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<CommandId> for String {
    fn from(id: CommandId) -> Self {
        id.to_string()
    }
}

/// Retry policy settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(default, rename_all = "kebab-case")]
pub struct RetryConfig {
    /// Retries after the first attempt; `-1` retries without limit
    #[validate(range(min = -1))]
    pub max_retries: i32,
    /// Base pause between attempts
    #[serde(with = "serde_duration")]
    pub delay: Duration,
    /// Maximum random deviation applied to `delay`, in both directions
    #[serde(with = "serde_duration")]
    pub jitter: Duration,
    /// Total time budget for retrying; zero means unbounded
    #[serde(with = "serde_duration")]
    pub max_duration: Duration,
    pub retry_on: ErrorKindSet,
    pub abort_on: ErrorKindSet,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            delay: Duration::ZERO,
            jitter: Duration::from_millis(200),
            max_duration: Duration::from_secs(180),
            retry_on: ErrorKindSet::any(),
            abort_on: ErrorKindSet::none(),
        }
    }
}

impl RetryConfig {
    pub fn with_max_retries(mut self, max_retries: i32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn with_jitter(mut self, jitter: Duration) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn with_max_duration(mut self, max_duration: Duration) -> Self {
        self.max_duration = max_duration;
        self
    }

    pub fn with_retry_on(mut self, retry_on: ErrorKindSet) -> Self {
        self.retry_on = retry_on;
        self
    }

    pub fn with_abort_on(mut self, abort_on: ErrorKindSet) -> Self {
        self.abort_on = abort_on;
        self
    }

    fn check_window(&self) -> Result<(), String> {
        if !self.max_duration.is_zero() && self.max_duration < self.delay {
            return Err(format!(
                "retry max-duration ({:?}) must not be shorter than delay ({:?})",
                self.max_duration, self.delay
            ));
        }
        Ok(())
    }
}

/// Circuit breaker settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(default, rename_all = "kebab-case")]
pub struct CircuitBreakerConfig {
    /// Size of the rolling outcome window
    #[validate(range(min = 1))]
    pub request_volume_threshold: u32,
    /// Failure ratio at which a full window opens the circuit
    #[validate(range(min = 0.0, max = 1.0))]
    pub failure_ratio: f64,
    /// How long the circuit stays open before probing
    #[serde(with = "serde_duration")]
    pub delay: Duration,
    /// Successful probes needed to close a half-open circuit
    #[validate(range(min = 1))]
    pub success_threshold: u32,
    pub force_open: bool,
    pub force_closed: bool,
    /// Errors counted as failures; anything else is recorded as a success
    pub fail_on: ErrorKindSet,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            request_volume_threshold: 20,
            failure_ratio: 0.5,
            delay: Duration::from_secs(5),
            success_threshold: 1,
            force_open: false,
            force_closed: false,
            fail_on: ErrorKindSet::any(),
        }
    }
}

impl CircuitBreakerConfig {
    pub fn with_request_volume_threshold(mut self, threshold: u32) -> Self {
        self.request_volume_threshold = threshold;
        self
    }

    pub fn with_failure_ratio(mut self, ratio: f64) -> Self {
        self.failure_ratio = ratio;
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn with_success_threshold(mut self, threshold: u32) -> Self {
        self.success_threshold = threshold;
        self
    }

    pub fn with_fail_on(mut self, fail_on: ErrorKindSet) -> Self {
        self.fail_on = fail_on;
        self
    }

    pub fn forced_open(mut self) -> Self {
        self.force_open = true;
        self
    }

    pub fn forced_closed(mut self) -> Self {
        self.force_closed = true;
        self
    }
}

/// Concurrency limit settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
#[serde(default, rename_all = "kebab-case")]
pub struct BulkheadConfig {
    #[validate(range(min = 1))]
    pub max_concurrent: usize,
    /// Waiting slots, used only by asynchronous commands
    #[validate(range(min = 1))]
    pub max_queue_size: usize,
}

impl Default for BulkheadConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 10,
            max_queue_size: 10,
        }
    }
}

impl BulkheadConfig {
    pub fn new(max_concurrent: usize) -> Self {
        Self {
            max_concurrent,
            ..Default::default()
        }
    }

    pub fn with_max_queue_size(mut self, size: usize) -> Self {
        self.max_queue_size = size;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    #[serde(with = "serde_duration")]
    pub duration: Duration,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            duration: Duration::from_secs(1),
        }
    }
}

impl TimeoutConfig {
    pub fn new(duration: Duration) -> Self {
        Self { duration }
    }
}

/// What a fallback resolves to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FallbackTarget<'a> {
    /// A named handler object
    Handler(&'a str),
    /// A named function next to the guarded operation
    Method(&'a str),
}

/// Describes the fallback of a command. The capability itself is supplied
/// with each invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct FallbackDefinition {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub handler: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    pub enabled: bool,
    /// Errors that propagate without invoking the fallback
    pub skip_on: ErrorKindSet,
}

impl Default for FallbackDefinition {
    fn default() -> Self {
        Self {
            handler: None,
            method: None,
            enabled: true,
            skip_on: ErrorKindSet::none(),
        }
    }
}

impl FallbackDefinition {
    pub fn handler(name: impl Into<String>) -> Self {
        Self {
            handler: Some(name.into()),
            ..Default::default()
        }
    }

    pub fn method(name: impl Into<String>) -> Self {
        Self {
            method: Some(name.into()),
            ..Default::default()
        }
    }

    pub fn with_skip_on(mut self, skip_on: ErrorKindSet) -> Self {
        self.skip_on = skip_on;
        self
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// The configured target, or `None` unless exactly one is set.
    pub fn target(&self) -> Option<FallbackTarget<'_>> {
        match (&self.handler, &self.method) {
            (Some(handler), None) => Some(FallbackTarget::Handler(handler)),
            (None, Some(method)) => Some(FallbackTarget::Method(method)),
            _ => None,
        }
    }
}

/// All policies guarding one command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(rename_all = "kebab-case")]
pub struct ExecutionMetadata {
    pub command: CommandId,
    #[validate(nested)]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryConfig>,
    #[validate(nested)]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub circuit_breaker: Option<CircuitBreakerConfig>,
    #[validate(nested)]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bulkhead: Option<BulkheadConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<TimeoutConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fallback: Option<FallbackDefinition>,
    #[serde(default)]
    pub asynchronous: bool,
}

impl ExecutionMetadata {
    pub fn new(command: CommandId) -> Self {
        Self {
            command,
            retry: None,
            circuit_breaker: None,
            bulkhead: None,
            timeout: None,
            fallback: None,
            asynchronous: false,
        }
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = Some(retry);
        self
    }

    pub fn with_circuit_breaker(mut self, circuit_breaker: CircuitBreakerConfig) -> Self {
        self.circuit_breaker = Some(circuit_breaker);
        self
    }

    pub fn with_bulkhead(mut self, bulkhead: BulkheadConfig) -> Self {
        self.bulkhead = Some(bulkhead);
        self
    }

    pub fn with_timeout(mut self, duration: Duration) -> Self {
        self.timeout = Some(TimeoutConfig::new(duration));
        self
    }

    pub fn with_fallback(mut self, fallback: FallbackDefinition) -> Self {
        self.fallback = Some(fallback);
        self
    }

    pub fn asynchronous(mut self) -> Self {
        self.asynchronous = true;
        self
    }

    /// Validates field ranges and the rules that span several fields.
    pub fn check(&self) -> Result<(), ConfigError> {
        let invalid = |message: String| ConfigError::Invalid {
            command: self.command.to_string(),
            message,
        };

        self.validate().map_err(|e| invalid(e.to_string()))?;

        if let Some(retry) = &self.retry {
            retry.check_window().map_err(invalid)?;
        }

        if let Some(cb) = &self.circuit_breaker {
            // NaN slips through the range rule above
            if !(0.0..=1.0).contains(&cb.failure_ratio) {
                return Err(invalid(format!(
                    "circuit breaker failure ratio must be within [0, 1], got {}",
                    cb.failure_ratio
                )));
            }
            if cb.force_open && cb.force_closed {
                return Err(invalid(
                    "circuit breaker cannot be forced open and closed at once".to_string(),
                ));
            }
        }

        if let Some(fallback) = &self.fallback {
            if fallback.target().is_none() {
                return Err(invalid(
                    "fallback must name exactly one of a handler or a method".to_string(),
                ));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn command() -> CommandId {
        CommandId::new("inventory", "reserve")
    }

    #[test]
    fn test_command_id_parse_and_display() {
        let id: CommandId = "inventory.reserve".parse().unwrap();
        assert_eq!(id.group(), "inventory");
        assert_eq!(id.command(), "reserve");
        assert_eq!(id.to_string(), "inventory.reserve");

        assert!("inventory".parse::<CommandId>().is_err());
        assert!(".reserve".parse::<CommandId>().is_err());
        assert!("a.b.c".parse::<CommandId>().is_err());
    }

    #[test]
    fn test_defaults_are_valid() {
        let metadata = ExecutionMetadata::new(command())
            .with_retry(RetryConfig::default())
            .with_circuit_breaker(CircuitBreakerConfig::default())
            .with_bulkhead(BulkheadConfig::default())
            .with_timeout(Duration::from_secs(1))
            .with_fallback(FallbackDefinition::method("reserve_cached"));

        assert!(metadata.check().is_ok());
    }

    #[rstest]
    #[case::retry_below_unlimited(ExecutionMetadata::new(command())
        .with_retry(RetryConfig::default().with_max_retries(-2)))]
    #[case::max_duration_shorter_than_delay(ExecutionMetadata::new(command())
        .with_retry(RetryConfig::default()
            .with_delay(Duration::from_secs(2))
            .with_max_duration(Duration::from_secs(1))))]
    #[case::zero_volume_threshold(ExecutionMetadata::new(command())
        .with_circuit_breaker(CircuitBreakerConfig::default().with_request_volume_threshold(0)))]
    #[case::ratio_above_one(ExecutionMetadata::new(command())
        .with_circuit_breaker(CircuitBreakerConfig::default().with_failure_ratio(1.5)))]
    #[case::negative_ratio(ExecutionMetadata::new(command())
        .with_circuit_breaker(CircuitBreakerConfig::default().with_failure_ratio(-0.1)))]
    #[case::nan_ratio(ExecutionMetadata::new(command())
        .with_circuit_breaker(CircuitBreakerConfig::default().with_failure_ratio(f64::NAN)))]
    #[case::infinite_ratio(ExecutionMetadata::new(command())
        .with_circuit_breaker(CircuitBreakerConfig::default().with_failure_ratio(f64::INFINITY)))]
    #[case::zero_success_threshold(ExecutionMetadata::new(command())
        .with_circuit_breaker(CircuitBreakerConfig::default().with_success_threshold(0)))]
    #[case::both_forced(ExecutionMetadata::new(command())
        .with_circuit_breaker(CircuitBreakerConfig::default().forced_open().forced_closed()))]
    #[case::zero_bulkhead(ExecutionMetadata::new(command())
        .with_bulkhead(BulkheadConfig::new(0)))]
    #[case::zero_queue(ExecutionMetadata::new(command())
        .with_bulkhead(BulkheadConfig::new(2).with_max_queue_size(0)))]
    #[case::fallback_without_target(ExecutionMetadata::new(command())
        .with_fallback(FallbackDefinition::default()))]
    #[case::fallback_with_two_targets(ExecutionMetadata::new(command())
        .with_fallback(FallbackDefinition {
            handler: Some("cache".into()),
            method: Some("reserve_cached".into()),
            ..Default::default()
        }))]
    fn test_invalid_metadata_is_rejected(#[case] metadata: ExecutionMetadata) {
        assert!(matches!(metadata.check(), Err(ConfigError::Invalid { .. })));
    }

    #[test]
    fn test_unbounded_max_duration_ignores_delay() {
        let metadata = ExecutionMetadata::new(command()).with_retry(
            RetryConfig::default()
                .with_delay(Duration::from_secs(10))
                .with_max_duration(Duration::ZERO),
        );
        assert!(metadata.check().is_ok());
    }

    #[test]
    fn test_fallback_target() {
        assert_eq!(
            FallbackDefinition::handler("cache").target(),
            Some(FallbackTarget::Handler("cache"))
        );
        assert_eq!(
            FallbackDefinition::method("reserve_cached").target(),
            Some(FallbackTarget::Method("reserve_cached"))
        );
    }
}
