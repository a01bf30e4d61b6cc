//! Individually addressable policy properties and runtime updates.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::duration::{format_duration, parse_duration};
use crate::error::ConfigError;
use crate::metadata::ExecutionMetadata;

/// One configurable field of a command's policies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PropertyKind {
    RetryMaxRetries,
    RetryDelay,
    RetryJitter,
    RetryMaxDuration,
    CircuitBreakerRequestVolumeThreshold,
    CircuitBreakerFailureRatio,
    CircuitBreakerDelay,
    CircuitBreakerSuccessThreshold,
    CircuitBreakerForceOpen,
    CircuitBreakerForceClosed,
    BulkheadValue,
    BulkheadWaitingTaskQueue,
    TimeoutValue,
    FallbackEnabled,
    Asynchronous,
}

/// How a property's raw configuration value is interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueType {
    Integer,
    Ratio,
    Boolean,
    Duration,
}

impl PropertyKind {
    pub const ALL: [PropertyKind; 15] = [
        PropertyKind::RetryMaxRetries,
        PropertyKind::RetryDelay,
        PropertyKind::RetryJitter,
        PropertyKind::RetryMaxDuration,
        PropertyKind::CircuitBreakerRequestVolumeThreshold,
        PropertyKind::CircuitBreakerFailureRatio,
        PropertyKind::CircuitBreakerDelay,
        PropertyKind::CircuitBreakerSuccessThreshold,
        PropertyKind::CircuitBreakerForceOpen,
        PropertyKind::CircuitBreakerForceClosed,
        PropertyKind::BulkheadValue,
        PropertyKind::BulkheadWaitingTaskQueue,
        PropertyKind::TimeoutValue,
        PropertyKind::FallbackEnabled,
        PropertyKind::Asynchronous,
    ];

    /// Policy segment of the configuration key.
    pub fn policy(&self) -> &'static str {
        use PropertyKind::*;
        match self {
            RetryMaxRetries | RetryDelay | RetryJitter | RetryMaxDuration => "retry",
            CircuitBreakerRequestVolumeThreshold
            | CircuitBreakerFailureRatio
            | CircuitBreakerDelay
            | CircuitBreakerSuccessThreshold
            | CircuitBreakerForceOpen
            | CircuitBreakerForceClosed => "circuit-breaker",
            BulkheadValue | BulkheadWaitingTaskQueue => "bulkhead",
            TimeoutValue => "timeout",
            FallbackEnabled => "fallback",
            Asynchronous => "asynchronous",
        }
    }

    /// Property segment of the configuration key.
    pub fn name(&self) -> &'static str {
        use PropertyKind::*;
        match self {
            RetryMaxRetries => "max-retries",
            RetryDelay | CircuitBreakerDelay => "delay",
            RetryJitter => "jitter",
            RetryMaxDuration => "max-duration",
            CircuitBreakerRequestVolumeThreshold => "request-volume-threshold",
            CircuitBreakerFailureRatio => "failure-ratio",
            CircuitBreakerSuccessThreshold => "success-threshold",
            CircuitBreakerForceOpen => "force-open",
            CircuitBreakerForceClosed => "force-closed",
            BulkheadValue | TimeoutValue | Asynchronous => "value",
            BulkheadWaitingTaskQueue => "waiting-task-queue",
            FallbackEnabled => "enabled",
        }
    }

    pub fn from_key(policy: &str, name: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.policy() == policy && kind.name() == name)
    }

    pub fn value_type(&self) -> ValueType {
        use PropertyKind::*;
        match self {
            RetryMaxRetries
            | CircuitBreakerRequestVolumeThreshold
            | CircuitBreakerSuccessThreshold
            | BulkheadValue
            | BulkheadWaitingTaskQueue => ValueType::Integer,
            CircuitBreakerFailureRatio => ValueType::Ratio,
            CircuitBreakerForceOpen | CircuitBreakerForceClosed | FallbackEnabled
            | Asynchronous => ValueType::Boolean,
            RetryDelay | RetryJitter | RetryMaxDuration | CircuitBreakerDelay | TimeoutValue => {
                ValueType::Duration
            }
        }
    }

    /// Properties fixed once the command's gates have been built.
    pub fn is_runtime_updatable(&self) -> bool {
        !matches!(
            self,
            PropertyKind::BulkheadValue
                | PropertyKind::BulkheadWaitingTaskQueue
                | PropertyKind::Asynchronous
        )
    }
}

impl fmt::Display for PropertyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.policy(), self.name())
    }
}

/// A typed property value.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum PropertyValue {
    Integer(i64),
    Ratio(f64),
    Boolean(bool),
    Duration(Duration),
}

impl PropertyValue {
    /// Parses a raw configuration string into the type `kind` expects.
    pub fn parse(kind: PropertyKind, raw: &str) -> Result<Self, ConfigError> {
        let invalid = || ConfigError::InvalidValue {
            key: kind.to_string(),
            value: raw.to_string(),
        };
        let trimmed = raw.trim();

        match kind.value_type() {
            ValueType::Integer => trimmed
                .parse()
                .map(PropertyValue::Integer)
                .map_err(|_| invalid()),
            ValueType::Ratio => trimmed
                .parse::<f64>()
                .ok()
                .filter(|ratio| ratio.is_finite())
                .map(PropertyValue::Ratio)
                .ok_or_else(invalid),
            ValueType::Boolean => trimmed
                .parse()
                .map(PropertyValue::Boolean)
                .map_err(|_| invalid()),
            ValueType::Duration => parse_duration(trimmed).map(PropertyValue::Duration),
        }
    }
}

impl fmt::Display for PropertyValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PropertyValue::Integer(v) => write!(f, "{v}"),
            PropertyValue::Ratio(v) => write!(f, "{v}"),
            PropertyValue::Boolean(v) => write!(f, "{v}"),
            PropertyValue::Duration(v) => f.write_str(&format_duration(*v)),
        }
    }
}

fn mismatch(kind: PropertyKind, value: PropertyValue) -> ConfigError {
    ConfigError::InvalidValue {
        key: kind.to_string(),
        value: value.to_string(),
    }
}

fn as_int<T: TryFrom<i64>>(kind: PropertyKind, value: PropertyValue) -> Result<T, ConfigError> {
    match value {
        PropertyValue::Integer(v) => T::try_from(v).map_err(|_| mismatch(kind, value)),
        other => Err(mismatch(kind, other)),
    }
}

fn as_duration(kind: PropertyKind, value: PropertyValue) -> Result<Duration, ConfigError> {
    match value {
        PropertyValue::Duration(d) => Ok(d),
        PropertyValue::Integer(ms) if ms >= 0 => Ok(Duration::from_millis(ms as u64)),
        other => Err(mismatch(kind, other)),
    }
}

fn as_bool(kind: PropertyKind, value: PropertyValue) -> Result<bool, ConfigError> {
    match value {
        PropertyValue::Boolean(b) => Ok(b),
        other => Err(mismatch(kind, other)),
    }
}

fn as_ratio(kind: PropertyKind, value: PropertyValue) -> Result<f64, ConfigError> {
    match value {
        PropertyValue::Ratio(r) => Ok(r),
        PropertyValue::Integer(i) => Ok(i as f64),
        other => Err(mismatch(kind, other)),
    }
}

impl ExecutionMetadata {
    /// Whether the policy owning `kind` is present on this command.
    pub fn configures(&self, kind: PropertyKind) -> bool {
        match kind.policy() {
            "retry" => self.retry.is_some(),
            "circuit-breaker" => self.circuit_breaker.is_some(),
            "bulkhead" => self.bulkhead.is_some(),
            "timeout" => self.timeout.is_some(),
            "fallback" => self.fallback.is_some(),
            _ => true,
        }
    }

    /// Returns a copy with one property replaced.
    ///
    /// The result is validated; the property's policy must already be
    /// configured on this command.
    pub fn with_property(
        &self,
        kind: PropertyKind,
        value: PropertyValue,
    ) -> Result<ExecutionMetadata, ConfigError> {
        let mut next = self.clone();
        next.set_property(kind, value)?;
        next.check()?;
        Ok(next)
    }

    /// Assigns one property in place without re-validating.
    pub fn set_property(
        &mut self,
        kind: PropertyKind,
        value: PropertyValue,
    ) -> Result<(), ConfigError> {
        use PropertyKind::*;

        let missing = || ConfigError::PolicyNotConfigured {
            command: self.command.clone(),
            property: kind,
        };

        match kind {
            RetryMaxRetries | RetryDelay | RetryJitter | RetryMaxDuration => {
                let retry = self.retry.as_mut().ok_or_else(missing)?;
                match kind {
                    RetryMaxRetries => retry.max_retries = as_int(kind, value)?,
                    RetryDelay => retry.delay = as_duration(kind, value)?,
                    RetryJitter => retry.jitter = as_duration(kind, value)?,
                    _ => retry.max_duration = as_duration(kind, value)?,
                }
            }
            CircuitBreakerRequestVolumeThreshold
            | CircuitBreakerFailureRatio
            | CircuitBreakerDelay
            | CircuitBreakerSuccessThreshold
            | CircuitBreakerForceOpen
            | CircuitBreakerForceClosed => {
                let cb = self.circuit_breaker.as_mut().ok_or_else(missing)?;
                match kind {
                    CircuitBreakerRequestVolumeThreshold => {
                        cb.request_volume_threshold = as_int(kind, value)?
                    }
                    CircuitBreakerFailureRatio => cb.failure_ratio = as_ratio(kind, value)?,
                    CircuitBreakerDelay => cb.delay = as_duration(kind, value)?,
                    CircuitBreakerSuccessThreshold => cb.success_threshold = as_int(kind, value)?,
                    CircuitBreakerForceOpen => cb.force_open = as_bool(kind, value)?,
                    _ => cb.force_closed = as_bool(kind, value)?,
                }
            }
            BulkheadValue | BulkheadWaitingTaskQueue => {
                let bulkhead = self.bulkhead.as_mut().ok_or_else(missing)?;
                if kind == BulkheadValue {
                    bulkhead.max_concurrent = as_int(kind, value)?;
                } else {
                    bulkhead.max_queue_size = as_int(kind, value)?;
                }
            }
            TimeoutValue => {
                let timeout = self.timeout.as_mut().ok_or_else(missing)?;
                timeout.duration = as_duration(kind, value)?;
            }
            FallbackEnabled => {
                let fallback = self.fallback.as_mut().ok_or_else(missing)?;
                fallback.enabled = as_bool(kind, value)?;
            }
            Asynchronous => self.asynchronous = as_bool(kind, value)?,
        }
        Ok(())
    }
}
