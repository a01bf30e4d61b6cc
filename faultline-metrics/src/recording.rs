use std::time::Duration;

use dashmap::DashMap;
use faultline_core::{CommandId, ExecutionObserver, FaultToleranceEvent, InvocationOutcome};
use serde::Serialize;

/// Per-command counters kept in process.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CommandStats {
    pub invocations: u64,
    pub succeeded: u64,
    pub fallback_succeeded: u64,
    pub failed: u64,
    pub retries: u64,
    pub circuit_failures: u64,
    pub prevented: u64,
    pub circuit_opened: u64,
    pub bulkhead_rejected: u64,
    pub timed_out: u64,
    pub fallback_invoked: u64,
    #[serde(with = "millis")]
    pub total_elapsed: Duration,
}

impl CommandStats {
    /// Mean wall time of finished invocations.
    pub fn mean_elapsed(&self) -> Duration {
        let finished = self.succeeded + self.fallback_succeeded + self.failed;
        if finished == 0 {
            return Duration::ZERO;
        }
        self.total_elapsed / finished as u32
    }

    fn apply(&mut self, event: &FaultToleranceEvent) {
        use FaultToleranceEvent::*;

        match event {
            InvocationStarted { .. } => self.invocations += 1,
            InvocationFinished {
                outcome, elapsed, ..
            } => {
                match outcome {
                    InvocationOutcome::Succeeded => self.succeeded += 1,
                    InvocationOutcome::FallbackSucceeded => self.fallback_succeeded += 1,
                    InvocationOutcome::Failed => self.failed += 1,
                }
                self.total_elapsed += *elapsed;
            }
            RetryScheduled { .. } => self.retries += 1,
            CircuitFailed { .. } => self.circuit_failures += 1,
            CallPrevented { .. } => self.prevented += 1,
            CircuitOpened { .. } => self.circuit_opened += 1,
            BulkheadRejected { .. } => self.bulkhead_rejected += 1,
            TimedOut { .. } => self.timed_out += 1,
            FallbackInvoked { .. } => self.fallback_invoked += 1,
            _ => {}
        }
    }
}

/// Aggregates events into [`CommandStats`] for inspection and tests.
#[derive(Debug, Default)]
pub struct RecordingObserver {
    stats: DashMap<CommandId, CommandStats>,
}

impl RecordingObserver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stats(&self, command: &CommandId) -> Option<CommandStats> {
        self.stats.get(command).map(|s| s.clone())
    }

    /// Every command seen so far, sorted by id.
    pub fn snapshot(&self) -> Vec<(CommandId, CommandStats)> {
        let mut all: Vec<_> = self
            .stats
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();
        all.sort_by(|a, b| a.0.cmp(&b.0));
        all
    }

    pub fn reset(&self) {
        self.stats.clear();
    }
}

impl ExecutionObserver for RecordingObserver {
    fn on_event(&self, event: &FaultToleranceEvent) {
        self.stats
            .entry(event.command().clone())
            .or_default()
            .apply(event);
    }
}

mod millis {
    use serde::Serializer;
    use std::time::Duration;

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(duration.as_millis() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use faultline_core::ErrorKind;
    use pretty_assertions::assert_eq;

    fn command() -> CommandId {
        CommandId::new("inventory", "reserve")
    }

    fn finished(outcome: InvocationOutcome, elapsed_ms: u64) -> FaultToleranceEvent {
        FaultToleranceEvent::InvocationFinished {
            command: command(),
            outcome,
            retries: 0,
            retry_enabled: false,
            elapsed: Duration::from_millis(elapsed_ms),
        }
    }

    #[test]
    fn test_aggregates_per_command() {
        let observer = RecordingObserver::new();
        let events = [
            FaultToleranceEvent::InvocationStarted { command: command() },
            finished(InvocationOutcome::Succeeded, 10),
            FaultToleranceEvent::InvocationStarted { command: command() },
            FaultToleranceEvent::FallbackInvoked {
                command: command(),
                cause: ErrorKind::new("io"),
            },
            finished(InvocationOutcome::FallbackSucceeded, 30),
            FaultToleranceEvent::InvocationStarted {
                command: CommandId::new("billing", "charge"),
            },
        ];
        for event in &events {
            observer.on_event(event);
        }

        let stats = observer.stats(&command()).unwrap();
        assert_eq!(
            stats,
            CommandStats {
                invocations: 2,
                succeeded: 1,
                fallback_succeeded: 1,
                fallback_invoked: 1,
                total_elapsed: Duration::from_millis(40),
                ..Default::default()
            }
        );
        assert_eq!(stats.mean_elapsed(), Duration::from_millis(20));

        let commands: Vec<_> = observer.snapshot().into_iter().map(|(id, _)| id).collect();
        assert_eq!(commands, vec![CommandId::new("billing", "charge"), command()]);
    }

    #[test]
    fn test_stats_serialize_elapsed_as_millis() {
        let stats = CommandStats {
            total_elapsed: Duration::from_millis(1500),
            ..Default::default()
        };
        let json = serde_json::to_value(&stats).unwrap();
        assert_eq!(json["total_elapsed"], 1500);
    }

    #[test]
    fn test_reset_clears_everything() {
        let observer = RecordingObserver::new();
        observer.on_event(&FaultToleranceEvent::InvocationStarted { command: command() });
        observer.reset();
        assert!(observer.snapshot().is_empty());
    }
}
