use std::time::Duration;

use serde::Serialize;

use crate::error::ErrorKind;
use crate::metadata::CommandId;

/// How a top-level guarded call ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InvocationOutcome {
    Succeeded,
    FallbackSucceeded,
    Failed,
}

/// Observable moments in the life of a guarded call.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum FaultToleranceEvent {
    InvocationStarted {
        command: CommandId,
    },
    InvocationFinished {
        command: CommandId,
        outcome: InvocationOutcome,
        retries: u32,
        retry_enabled: bool,
        elapsed: Duration,
    },
    RetryScheduled {
        command: CommandId,
        attempt: u32,
        delay: Duration,
        cause: ErrorKind,
    },
    CircuitSucceeded {
        command: CommandId,
    },
    CircuitFailed {
        command: CommandId,
        cause: ErrorKind,
    },
    CallPrevented {
        command: CommandId,
    },
    CircuitOpened {
        command: CommandId,
    },
    CircuitHalfOpened {
        command: CommandId,
    },
    CircuitClosed {
        command: CommandId,
    },
    BulkheadAccepted {
        command: CommandId,
    },
    BulkheadRejected {
        command: CommandId,
    },
    TimedOut {
        command: CommandId,
        timeout: Duration,
    },
    CompletedWithinTimeout {
        command: CommandId,
        elapsed: Duration,
    },
    FallbackInvoked {
        command: CommandId,
        cause: ErrorKind,
    },
}

impl FaultToleranceEvent {
    pub fn command(&self) -> &CommandId {
        use FaultToleranceEvent::*;
        match self {
            InvocationStarted { command }
            | InvocationFinished { command, .. }
            | RetryScheduled { command, .. }
            | CircuitSucceeded { command }
            | CircuitFailed { command, .. }
            | CallPrevented { command }
            | CircuitOpened { command }
            | CircuitHalfOpened { command }
            | CircuitClosed { command }
            | BulkheadAccepted { command }
            | BulkheadRejected { command }
            | TimedOut { command, .. }
            | CompletedWithinTimeout { command, .. }
            | FallbackInvoked { command, .. } => command,
        }
    }

    pub fn name(&self) -> &'static str {
        use FaultToleranceEvent::*;
        match self {
            InvocationStarted { .. } => "invocation_started",
            InvocationFinished { .. } => "invocation_finished",
            RetryScheduled { .. } => "retry_scheduled",
            CircuitSucceeded { .. } => "circuit_succeeded",
            CircuitFailed { .. } => "circuit_failed",
            CallPrevented { .. } => "call_prevented",
            CircuitOpened { .. } => "circuit_opened",
            CircuitHalfOpened { .. } => "circuit_half_opened",
            CircuitClosed { .. } => "circuit_closed",
            BulkheadAccepted { .. } => "bulkhead_accepted",
            BulkheadRejected { .. } => "bulkhead_rejected",
            TimedOut { .. } => "timed_out",
            CompletedWithinTimeout { .. } => "completed_within_timeout",
            FallbackInvoked { .. } => "fallback_invoked",
        }
    }
}
