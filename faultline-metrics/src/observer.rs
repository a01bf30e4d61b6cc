use faultline_core::{ExecutionObserver, FaultToleranceEvent, InvocationOutcome};
use metrics::{counter, histogram};

// ============================================================================
// Metric Names
// ============================================================================

pub const INVOCATIONS_TOTAL: &str = "ft.invocations.total";
pub const INVOCATIONS_FAILED_TOTAL: &str = "ft.invocations.failed.total";
pub const INVOCATION_DURATION: &str = "ft.invocations.duration.seconds";

pub const RETRY_RETRIES_TOTAL: &str = "ft.retry.retries.total";
pub const RETRY_SUCCEEDED_NOT_RETRIED_TOTAL: &str = "ft.retry.calls_succeeded_not_retried.total";
pub const RETRY_SUCCEEDED_RETRIED_TOTAL: &str = "ft.retry.calls_succeeded_retried.total";
pub const RETRY_FAILED_TOTAL: &str = "ft.retry.calls_failed.total";

pub const TIMEOUT_TIMED_OUT_TOTAL: &str = "ft.timeout.calls_timed_out.total";
pub const TIMEOUT_NOT_TIMED_OUT_TOTAL: &str = "ft.timeout.calls_not_timed_out.total";
pub const TIMEOUT_EXECUTION_DURATION: &str = "ft.timeout.execution_duration.seconds";

pub const CIRCUIT_SUCCEEDED_TOTAL: &str = "ft.circuitbreaker.calls_succeeded.total";
pub const CIRCUIT_FAILED_TOTAL: &str = "ft.circuitbreaker.calls_failed.total";
pub const CIRCUIT_PREVENTED_TOTAL: &str = "ft.circuitbreaker.calls_prevented.total";
pub const CIRCUIT_OPENED_TOTAL: &str = "ft.circuitbreaker.opened.total";

pub const BULKHEAD_ACCEPTED_TOTAL: &str = "ft.bulkhead.calls_accepted.total";
pub const BULKHEAD_REJECTED_TOTAL: &str = "ft.bulkhead.calls_rejected.total";

pub const FALLBACK_CALLS_TOTAL: &str = "ft.fallback.calls.total";

// ============================================================================
// Metrics Observer
// ============================================================================

/// Publishes engine events through the `metrics` facade, labelled by
/// `command`. Without an installed recorder every call is a no-op.
#[derive(Debug, Default, Clone, Copy)]
pub struct MetricsObserver;

impl MetricsObserver {
    pub fn new() -> Self {
        Self
    }
}

impl ExecutionObserver for MetricsObserver {
    fn on_event(&self, event: &FaultToleranceEvent) {
        use FaultToleranceEvent::*;

        let command = event.command().to_string();
        match event {
            InvocationStarted { .. } => {
                counter!(INVOCATIONS_TOTAL, "command" => command).increment(1);
            }
            InvocationFinished {
                outcome,
                retries,
                retry_enabled,
                elapsed,
                ..
            } => {
                histogram!(INVOCATION_DURATION, "command" => command.clone())
                    .record(elapsed.as_secs_f64());

                if *outcome == InvocationOutcome::Failed {
                    counter!(INVOCATIONS_FAILED_TOTAL, "command" => command.clone())
                        .increment(1);
                }
                if *retry_enabled {
                    let name = match (*outcome, *retries) {
                        (InvocationOutcome::Succeeded, 0) => RETRY_SUCCEEDED_NOT_RETRIED_TOTAL,
                        (InvocationOutcome::Succeeded, _) => RETRY_SUCCEEDED_RETRIED_TOTAL,
                        _ => RETRY_FAILED_TOTAL,
                    };
                    counter!(name, "command" => command).increment(1);
                }
            }
            RetryScheduled { .. } => {
                counter!(RETRY_RETRIES_TOTAL, "command" => command).increment(1);
            }
            CircuitSucceeded { .. } => {
                counter!(CIRCUIT_SUCCEEDED_TOTAL, "command" => command).increment(1);
            }
            CircuitFailed { .. } => {
                counter!(CIRCUIT_FAILED_TOTAL, "command" => command).increment(1);
            }
            CallPrevented { .. } => {
                counter!(CIRCUIT_PREVENTED_TOTAL, "command" => command).increment(1);
            }
            CircuitOpened { .. } => {
                counter!(CIRCUIT_OPENED_TOTAL, "command" => command).increment(1);
            }
            CircuitHalfOpened { .. } | CircuitClosed { .. } => {}
            BulkheadAccepted { .. } => {
                counter!(BULKHEAD_ACCEPTED_TOTAL, "command" => command).increment(1);
            }
            BulkheadRejected { .. } => {
                counter!(BULKHEAD_REJECTED_TOTAL, "command" => command).increment(1);
            }
            TimedOut { timeout, .. } => {
                counter!(TIMEOUT_TIMED_OUT_TOTAL, "command" => command.clone()).increment(1);
                histogram!(TIMEOUT_EXECUTION_DURATION, "command" => command)
                    .record(timeout.as_secs_f64());
            }
            CompletedWithinTimeout { elapsed, .. } => {
                counter!(TIMEOUT_NOT_TIMED_OUT_TOTAL, "command" => command.clone()).increment(1);
                histogram!(TIMEOUT_EXECUTION_DURATION, "command" => command)
                    .record(elapsed.as_secs_f64());
            }
            FallbackInvoked { .. } => {
                counter!(FALLBACK_CALLS_TOTAL, "command" => command).increment(1);
            }
        }
    }
}
