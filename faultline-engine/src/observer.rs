use std::sync::Arc;

use faultline_core::{ExecutionObserver, FaultToleranceEvent, InvocationOutcome};
use tracing::{debug, info, trace, warn};

/// Writes engine events to the `tracing` subscriber.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingObserver;

impl ExecutionObserver for TracingObserver {
    fn on_event(&self, event: &FaultToleranceEvent) {
        use FaultToleranceEvent::*;

        let command = event.command();
        match event {
            InvocationFinished {
                outcome: InvocationOutcome::Failed,
                retries,
                elapsed,
                ..
            } => warn!(command = %command, retries, ?elapsed, "Guarded call failed"),
            InvocationFinished {
                outcome,
                retries,
                elapsed,
                ..
            } => debug!(command = %command, ?outcome, retries, ?elapsed, "Guarded call finished"),
            RetryScheduled {
                attempt,
                delay,
                cause,
                ..
            } => debug!(command = %command, attempt, ?delay, cause = %cause, "Retrying"),
            CircuitOpened { .. } => warn!(command = %command, "Circuit opened"),
            CircuitHalfOpened { .. } => info!(command = %command, "Circuit half-open"),
            CircuitClosed { .. } => info!(command = %command, "Circuit closed"),
            CallPrevented { .. } => debug!(command = %command, "Call prevented by open circuit"),
            FallbackInvoked { cause, .. } => {
                info!(command = %command, cause = %cause, "Fallback invoked")
            }
            other => trace!(command = %command, event = other.name()),
        }
    }
}

/// Fans every event out to several observers in order.
#[derive(Clone, Default)]
pub struct CompositeObserver {
    observers: Vec<Arc<dyn ExecutionObserver>>,
}

impl CompositeObserver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, observer: Arc<dyn ExecutionObserver>) -> Self {
        self.observers.push(observer);
        self
    }

    pub fn len(&self) -> usize {
        self.observers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.observers.is_empty()
    }
}

impl ExecutionObserver for CompositeObserver {
    fn on_event(&self, event: &FaultToleranceEvent) {
        for observer in &self.observers {
            observer.on_event(event);
        }
    }
}
