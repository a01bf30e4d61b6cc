use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::metadata::CommandId;
use crate::property::PropertyKind;

/// Hierarchical, dot-separated error classification.
///
/// A kind matches another when it is equal to it or nested below it, so
/// `io.connection_refused` is an `io` error. The wildcard `*` matches
/// every kind.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ErrorKind(String);

impl ErrorKind {
    pub const WILDCARD: &'static str = "*";
    pub const CIRCUIT_BREAKER_OPEN: &'static str = "fault_tolerance.circuit_breaker_open";
    pub const BULKHEAD_REJECTED: &'static str = "fault_tolerance.bulkhead_rejected";
    pub const TIMEOUT: &'static str = "fault_tolerance.timeout";
    pub const FALLBACK_FAILED: &'static str = "fault_tolerance.fallback_failed";
    pub const CONFIGURATION: &'static str = "fault_tolerance.configuration";
    pub const CANCELLED: &'static str = "fault_tolerance.cancelled";
    pub const PANIC: &'static str = "panic";

    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns true when `self` equals `ancestor` or is nested below it.
    pub fn is_a(&self, ancestor: &ErrorKind) -> bool {
        if ancestor.0 == Self::WILDCARD || self.0 == ancestor.0 {
            return true;
        }
        self.0
            .strip_prefix(ancestor.0.as_str())
            .is_some_and(|rest| rest.starts_with('.'))
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ErrorKind {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

impl From<String> for ErrorKind {
    fn from(name: String) -> Self {
        Self(name)
    }
}

/// A set of error kinds used by `retry_on`, `abort_on`, `fail_on` and
/// `skip_on` classification.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ErrorKindSet(Vec<ErrorKind>);

impl ErrorKindSet {
    /// Matches every error.
    pub fn any() -> Self {
        Self(vec![ErrorKind::new(ErrorKind::WILDCARD)])
    }

    /// Matches nothing.
    pub fn none() -> Self {
        Self(Vec::new())
    }

    pub fn of<I, K>(kinds: I) -> Self
    where
        I: IntoIterator<Item = K>,
        K: Into<ErrorKind>,
    {
        Self(kinds.into_iter().map(Into::into).collect())
    }

    pub fn matches(&self, kind: &ErrorKind) -> bool {
        self.0.iter().any(|candidate| kind.is_a(candidate))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ErrorKind> {
        self.0.iter()
    }
}

/// Failure raised by a guarded operation.
#[derive(Debug, Clone)]
pub struct OperationError {
    kind: ErrorKind,
    message: String,
    source: Option<Arc<dyn std::error::Error + Send + Sync>>,
}

impl OperationError {
    pub fn new(kind: impl Into<ErrorKind>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
            source: None,
        }
    }

    /// Wraps an underlying error, keeping it reachable through `source()`.
    pub fn from_error<E>(kind: impl Into<ErrorKind>, error: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self {
            kind: kind.into(),
            message: error.to_string(),
            source: Some(Arc::new(error)),
        }
    }

    pub fn kind(&self) -> &ErrorKind {
        &self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl fmt::Display for OperationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl std::error::Error for OperationError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source
            .as_deref()
            .map(|e| e as &(dyn std::error::Error + 'static))
    }
}

impl PartialEq for OperationError {
    fn eq(&self, other: &Self) -> bool {
        self.kind == other.kind && self.message == other.message
    }
}

/// Invalid or unusable policy configuration.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("Invalid configuration for {command}: {message}")]
    Invalid { command: String, message: String },

    #[error("Property {property} of {command} cannot be changed at runtime")]
    Immutable {
        command: CommandId,
        property: PropertyKind,
    },

    #[error("Policy for property {property} is not configured on {command}")]
    PolicyNotConfigured {
        command: CommandId,
        property: PropertyKind,
    },

    #[error("Unknown command: {0}")]
    UnknownCommand(String),

    #[error("Invalid command id '{0}', expected <group>.<command>")]
    InvalidCommandId(String),

    #[error("Invalid duration '{0}'")]
    InvalidDuration(String),

    #[error("Invalid value '{value}' for {key}")]
    InvalidValue { key: String, value: String },

    #[error("Unknown property key: {0}")]
    UnknownProperty(String),

    #[error("Configuration source error: {0}")]
    Source(String),
}

/// Every failure a guarded call can surface.
#[derive(Error, Debug, Clone)]
pub enum FaultToleranceError {
    #[error("Circuit breaker is open for {command}")]
    CircuitBreakerOpen { command: CommandId },

    #[error("Bulkhead rejected call to {command}")]
    BulkheadRejected { command: CommandId },

    #[error("Call to {command} timed out after {timeout:?}")]
    Timeout { command: CommandId, timeout: Duration },

    #[error(transparent)]
    Operation(#[from] OperationError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Fallback for {command} failed: {source}")]
    FallbackFailed {
        command: CommandId,
        #[source]
        source: Box<FaultToleranceError>,
    },

    #[error("Call to {command} was cancelled")]
    Cancelled { command: CommandId },
}

impl FaultToleranceError {
    /// Classification used by every policy's error filters.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::CircuitBreakerOpen { .. } => ErrorKind::new(ErrorKind::CIRCUIT_BREAKER_OPEN),
            Self::BulkheadRejected { .. } => ErrorKind::new(ErrorKind::BULKHEAD_REJECTED),
            Self::Timeout { .. } => ErrorKind::new(ErrorKind::TIMEOUT),
            Self::Operation(e) => e.kind().clone(),
            Self::Config(_) => ErrorKind::new(ErrorKind::CONFIGURATION),
            Self::FallbackFailed { .. } => ErrorKind::new(ErrorKind::FALLBACK_FAILED),
            Self::Cancelled { .. } => ErrorKind::new(ErrorKind::CANCELLED),
        }
    }

    /// Errors that describe the call itself rather than an attempt, and
    /// so are never retried or replaced by a fallback.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Config(_) | Self::FallbackFailed { .. } | Self::Cancelled { .. }
        )
    }

    /// Whether a circuit breaker with `fail_on` counts this error as a
    /// failure. Only operation errors are filtered; timeouts and bulkhead
    /// rejections always count.
    pub fn counts_as_failure(&self, fail_on: &ErrorKindSet) -> bool {
        match self {
            Self::Operation(e) => fail_on.matches(e.kind()),
            Self::Timeout { .. } | Self::BulkheadRejected { .. } => true,
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, FaultToleranceError>;
