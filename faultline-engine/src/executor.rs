//! Composition of every policy into one guarded call.
//!
//! Policies nest in a fixed order, outermost first:
//!
//! ```text
//! Retry -> CircuitBreaker -> Timeout -> Bulkhead -> Operation
//! ```
//!
//! Each attempt asks the circuit breaker for admission, then runs bulkhead
//! admission and the operation under the timeout. Attempt outcomes feed the
//! breaker; failed attempts are offered to the retry policy. When the call
//! finally fails, the command's fallback replaces the error unless the
//! error is excluded from fallback handling.
//!
//! # Example
//!
//! ```no_run
//! use faultline_core::{CommandId, ExecutionMetadata, OperationError, RetryConfig};
//! use faultline_engine::{FaultToleranceExecutor, Invocation};
//! use std::time::Duration;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let executor = FaultToleranceExecutor::new();
//! let metadata = ExecutionMetadata::new(CommandId::new("users", "lookup"))
//!     .with_retry(RetryConfig::default().with_max_retries(2))
//!     .with_timeout(Duration::from_millis(500));
//!
//! let name = executor
//!     .execute(
//!         &metadata,
//!         Invocation::new(|| async { Ok::<_, OperationError>("ada".to_string()) }),
//!     )
//!     .await?;
//! # Ok(())
//! # }
//! ```

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use faultline_core::{
    CircuitBreakerConfig, CommandId, ConfigError, ErrorKind, ExecutionContextActivator,
    ExecutionMetadata, ExecutionObserver, FallbackContext, FaultToleranceError, FaultToleranceEvent,
    InvocationOutcome, NoopActivator, Operation, PropertyKind, PropertyValue, Result,
};
use tokio::task::JoinHandle;
use tracing::{debug, info_span, Instrument};
use uuid::Uuid;

use crate::circuit_breaker::{CircuitBreaker, Transition};
use crate::fallback::{fallback_decision, invoke_fallback, SharedFallback};
use crate::observer::TracingObserver;
use crate::registry::{CommandEntry, CommandRegistry};
use crate::retry::{RetryAttempt, RetryPolicy};
use crate::timeout::{flatten_join, IsolatedTask, TimeoutGuard};

/// One call request: the operation, its arguments and an optional fallback.
pub struct Invocation<T> {
    operation: Arc<dyn Operation<T>>,
    parameters: Arc<Vec<serde_json::Value>>,
    fallback: Option<SharedFallback<T>>,
}

impl<T: 'static> Invocation<T> {
    pub fn new(operation: impl Operation<T>) -> Self {
        Self {
            operation: Arc::new(operation),
            parameters: Arc::new(Vec::new()),
            fallback: None,
        }
    }

    /// Arguments handed to the fallback alongside the failure.
    pub fn with_parameters(mut self, parameters: Vec<serde_json::Value>) -> Self {
        self.parameters = Arc::new(parameters);
        self
    }

    pub fn with_fallback(mut self, fallback: SharedFallback<T>) -> Self {
        self.fallback = Some(fallback);
        self
    }
}

impl<T> Clone for Invocation<T> {
    fn clone(&self) -> Self {
        Self {
            operation: self.operation.clone(),
            parameters: self.parameters.clone(),
            fallback: self.fallback.clone(),
        }
    }
}

struct ExecutorInner {
    registry: Arc<CommandRegistry>,
    observer: Arc<dyn ExecutionObserver>,
    activator: Arc<dyn ExecutionContextActivator>,
}

/// Runs operations under their commands' fault-tolerance policies.
#[derive(Clone)]
pub struct FaultToleranceExecutor {
    inner: Arc<ExecutorInner>,
}

impl Default for FaultToleranceExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl FaultToleranceExecutor {
    pub fn new() -> Self {
        Self::builder().build()
    }

    pub fn builder() -> ExecutorBuilder {
        ExecutorBuilder::default()
    }

    pub fn registry(&self) -> &Arc<CommandRegistry> {
        &self.inner.registry
    }

    /// Validates and caches a command's metadata ahead of its first call.
    pub fn register(&self, metadata: &ExecutionMetadata) -> std::result::Result<(), ConfigError> {
        self.inner.registry.get_or_register(metadata).map(|_| ())
    }

    pub fn update_property(
        &self,
        command: &CommandId,
        kind: PropertyKind,
        value: PropertyValue,
    ) -> std::result::Result<Arc<ExecutionMetadata>, ConfigError> {
        self.inner.registry.update_property(command, kind, value)
    }

    /// Runs one guarded call on the current task.
    pub async fn execute<T>(&self, metadata: &ExecutionMetadata, invocation: Invocation<T>) -> Result<T>
    where
        T: Send + 'static,
    {
        let entry = self.inner.registry.get_or_register(metadata)?;
        let invocation_id = Uuid::new_v4();
        let span = info_span!(
            "guarded_call",
            command = %metadata.command,
            invocation_id = %invocation_id,
        );
        self.run(entry, invocation, invocation_id)
            .instrument(span)
            .await
    }

    /// Runs one guarded call on its own task.
    pub fn submit<T>(&self, metadata: &ExecutionMetadata, invocation: Invocation<T>) -> ExecutionHandle<T>
    where
        T: Send + 'static,
    {
        let executor = self.clone();
        let metadata = metadata.clone();
        let command = metadata.command.clone();
        let handle = tokio::spawn(async move { executor.execute(&metadata, invocation).await });
        ExecutionHandle { command, handle }
    }

    async fn run<T>(
        &self,
        entry: Arc<CommandEntry>,
        invocation: Invocation<T>,
        invocation_id: Uuid,
    ) -> Result<T>
    where
        T: Send + 'static,
    {
        let metadata = entry.metadata();
        let command = metadata.command.clone();

        if let Some(definition) = &metadata.fallback {
            if invocation.fallback.is_none() {
                return Err(ConfigError::Invalid {
                    command: command.to_string(),
                    message: format!(
                        "fallback {:?} is configured but no fallback was supplied",
                        definition.target()
                    ),
                }
                .into());
            }
        }

        self.emit(FaultToleranceEvent::InvocationStarted {
            command: command.clone(),
        });

        let mut attempts = RetryAttempt::start(metadata.retry.clone().map(RetryPolicy::new));
        let result = loop {
            let snapshot = entry.metadata();
            match self.attempt(&entry, &snapshot, &invocation).await {
                Ok(value) => break Ok(value),
                Err(error) if error.is_terminal() => break Err(error),
                Err(error) => {
                    let cause = error.kind();
                    match attempts.on_failure(&cause) {
                        Ok(delay) => {
                            self.emit(FaultToleranceEvent::RetryScheduled {
                                command: command.clone(),
                                attempt: attempts.attempt(),
                                delay,
                                cause,
                            });
                            tokio::time::sleep(delay).await;
                        }
                        Err(reason) => {
                            debug!(command = %command, ?reason, "Not retrying");
                            break Err(error);
                        }
                    }
                }
            }
        };

        let (result, outcome) = match result {
            Ok(value) => (Ok(value), InvocationOutcome::Succeeded),
            Err(error) => {
                self.recover(&entry, &invocation, invocation_id, error)
                    .await
            }
        };

        self.emit(FaultToleranceEvent::InvocationFinished {
            command,
            outcome,
            retries: attempts.retries(),
            retry_enabled: attempts.is_enabled(),
            elapsed: attempts.elapsed(),
        });
        result
    }

    async fn recover<T>(
        &self,
        entry: &CommandEntry,
        invocation: &Invocation<T>,
        invocation_id: Uuid,
        error: FaultToleranceError,
    ) -> (Result<T>, InvocationOutcome)
    where
        T: Send + 'static,
    {
        let metadata = entry.metadata();
        let handler = match (&invocation.fallback, fallback_decision(&metadata, &error)) {
            (Some(handler), Ok(())) => handler,
            (_, Err(skip)) => {
                debug!(command = %metadata.command, ?skip, "Fallback not applied");
                return (Err(error), InvocationOutcome::Failed);
            }
            (None, Ok(())) => return (Err(error), InvocationOutcome::Failed),
        };

        self.emit(FaultToleranceEvent::FallbackInvoked {
            command: metadata.command.clone(),
            cause: error.kind(),
        });

        let context = FallbackContext {
            command: metadata.command.clone(),
            invocation_id,
            parameters: invocation.parameters.clone(),
            failure: error,
        };
        match invoke_fallback(handler, context, self.inner.activator.as_ref()).await {
            Ok(value) => (Ok(value), InvocationOutcome::FallbackSucceeded),
            Err(error) => (Err(error), InvocationOutcome::Failed),
        }
    }

    /// One pass through circuit breaker, timeout, bulkhead and operation.
    async fn attempt<T>(
        &self,
        entry: &CommandEntry,
        metadata: &ExecutionMetadata,
        invocation: &Invocation<T>,
    ) -> Result<T>
    where
        T: Send + 'static,
    {
        let command = &metadata.command;

        let Some(cb) = &metadata.circuit_breaker else {
            return self.guarded(entry, metadata, invocation).await;
        };

        let admission = entry.breaker().attempt_execution(cb);
        self.emit_transition(command, admission.transition);
        if !admission.permitted {
            self.emit(FaultToleranceEvent::CallPrevented {
                command: command.clone(),
            });
            return Err(FaultToleranceError::CircuitBreakerOpen {
                command: command.clone(),
            });
        }

        let mut outcome = PendingOutcome {
            executor: self,
            breaker: entry.breaker(),
            config: cb,
            settled: false,
        };
        let result = self.guarded(entry, metadata, invocation).await;
        match &result {
            Ok(_) => outcome.success(),
            Err(error) if error.is_terminal() => {}
            Err(error) if error.counts_as_failure(&cb.fail_on) => outcome.failure(error.kind()),
            Err(_) => outcome.success(),
        }
        result
    }

    /// Timeout around bulkhead admission and the operation.
    async fn guarded<T>(
        &self,
        entry: &CommandEntry,
        metadata: &ExecutionMetadata,
        invocation: &Invocation<T>,
    ) -> Result<T>
    where
        T: Send + 'static,
    {
        let work = self.admitted(entry, metadata, invocation);
        let Some(timeout) = metadata.timeout else {
            return work.await;
        };

        let timed = TimeoutGuard::new(metadata.command.clone(), timeout.duration)
            .run(work)
            .await;
        if timed.timed_out {
            self.emit(FaultToleranceEvent::TimedOut {
                command: metadata.command.clone(),
                timeout: timeout.duration,
            });
        } else {
            self.emit(FaultToleranceEvent::CompletedWithinTimeout {
                command: metadata.command.clone(),
                elapsed: timed.elapsed,
            });
        }
        timed.result
    }

    async fn admitted<T>(
        &self,
        entry: &CommandEntry,
        metadata: &ExecutionMetadata,
        invocation: &Invocation<T>,
    ) -> Result<T>
    where
        T: Send + 'static,
    {
        let command = metadata.command.clone();
        let ticket = match entry.bulkhead() {
            Some(bulkhead) => match bulkhead.admit().await {
                Ok(ticket) => {
                    self.emit(FaultToleranceEvent::BulkheadAccepted {
                        command: command.clone(),
                    });
                    Some(ticket)
                }
                Err(error) => {
                    self.emit(FaultToleranceEvent::BulkheadRejected { command });
                    return Err(error);
                }
            },
            None => None,
        };

        if metadata.asynchronous {
            let operation = invocation.operation.clone();
            let activator = self.inner.activator.clone();
            IsolatedTask::spawn(command.clone(), async move {
                let _ticket = ticket;
                let _context = activator.activate(&command);
                operation.invoke().await.map_err(FaultToleranceError::from)
            })
            .await
        } else {
            let _ticket = ticket;
            invocation
                .operation
                .invoke()
                .await
                .map_err(FaultToleranceError::from)
        }
    }

    fn emit(&self, event: FaultToleranceEvent) {
        self.inner.observer.on_event(&event);
    }

    fn emit_transition(&self, command: &CommandId, transition: Transition) {
        let command = command.clone();
        match transition {
            Transition::None => {}
            Transition::Opened => self.emit(FaultToleranceEvent::CircuitOpened { command }),
            Transition::HalfOpened => {
                self.emit(FaultToleranceEvent::CircuitHalfOpened { command })
            }
            Transition::Closed => self.emit(FaultToleranceEvent::CircuitClosed { command }),
        }
    }
}

/// Breaker bookkeeping for one admitted attempt. An attempt abandoned
/// before it settles counts as a failed probe.
struct PendingOutcome<'a> {
    executor: &'a FaultToleranceExecutor,
    breaker: &'a CircuitBreaker,
    config: &'a CircuitBreakerConfig,
    settled: bool,
}

impl PendingOutcome<'_> {
    fn success(&mut self) {
        self.settled = true;
        let command = self.breaker.command().clone();
        self.executor
            .emit(FaultToleranceEvent::CircuitSucceeded { command: command.clone() });
        let transition = self.breaker.mark_success(self.config);
        self.executor.emit_transition(&command, transition);
    }

    fn failure(&mut self, cause: ErrorKind) {
        self.settled = true;
        let command = self.breaker.command().clone();
        self.executor.emit(FaultToleranceEvent::CircuitFailed {
            command: command.clone(),
            cause,
        });
        let transition = self.breaker.mark_failure(self.config);
        self.executor.emit_transition(&command, transition);
    }
}

impl Drop for PendingOutcome<'_> {
    fn drop(&mut self) {
        if !self.settled {
            let transition = self.breaker.mark_non_success(self.config);
            self.executor
                .emit_transition(self.breaker.command(), transition);
        }
    }
}

#[derive(Default)]
pub struct ExecutorBuilder {
    registry: Option<Arc<CommandRegistry>>,
    observer: Option<Arc<dyn ExecutionObserver>>,
    activator: Option<Arc<dyn ExecutionContextActivator>>,
}

impl ExecutorBuilder {
    pub fn registry(mut self, registry: Arc<CommandRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn observer(mut self, observer: Arc<dyn ExecutionObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn activator(mut self, activator: Arc<dyn ExecutionContextActivator>) -> Self {
        self.activator = Some(activator);
        self
    }

    pub fn build(self) -> FaultToleranceExecutor {
        FaultToleranceExecutor {
            inner: Arc::new(ExecutorInner {
                registry: self.registry.unwrap_or_default(),
                observer: self.observer.unwrap_or_else(|| Arc::new(TracingObserver)),
                activator: self.activator.unwrap_or_else(|| Arc::new(NoopActivator)),
            }),
        }
    }
}

/// A call running on its own task. Resolves to the call's result.
pub struct ExecutionHandle<T> {
    command: CommandId,
    handle: JoinHandle<Result<T>>,
}

impl<T> ExecutionHandle<T> {
    pub fn command(&self) -> &CommandId {
        &self.command
    }

    /// Cancels the call at its current suspension point, releasing any
    /// bulkhead slot it holds.
    pub fn cancel(&self) {
        self.handle.abort();
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

impl<T> Future for ExecutionHandle<T> {
    type Output = Result<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let joined = match Pin::new(&mut self.handle).poll(cx) {
            Poll::Pending => return Poll::Pending,
            Poll::Ready(joined) => joined,
        };
        Poll::Ready(flatten_join(&self.command, joined))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fallback::fallback_value;
    use faultline_core::{
        BulkheadConfig, CircuitBreakerConfig, FallbackDefinition, OperationError, RetryConfig,
    };
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    fn command() -> CommandId {
        CommandId::new("unit", "executor")
    }

    #[tokio::test]
    async fn test_plain_call_passes_through() {
        let executor = FaultToleranceExecutor::new();
        let metadata = ExecutionMetadata::new(command());

        let value = executor
            .execute(&metadata, Invocation::new(|| async { Ok::<_, OperationError>(3) }))
            .await
            .unwrap();
        assert_eq!(value, 3);
    }

    #[tokio::test]
    async fn test_missing_fallback_capability_is_a_config_error() {
        let executor = FaultToleranceExecutor::new();
        let metadata =
            ExecutionMetadata::new(command()).with_fallback(FallbackDefinition::method("cached"));

        let err = executor
            .execute(&metadata, Invocation::new(|| async { Ok::<_, OperationError>(3) }))
            .await
            .unwrap_err();
        assert!(matches!(err, FaultToleranceError::Config(_)));
    }

    #[tokio::test]
    async fn test_retry_then_succeed() {
        let executor = FaultToleranceExecutor::new();
        let metadata = ExecutionMetadata::new(command()).with_retry(
            RetryConfig::default()
                .with_max_retries(3)
                .with_jitter(Duration::ZERO),
        );

        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let value = executor
            .execute(
                &metadata,
                Invocation::new(move || {
                    let counter = counter.clone();
                    async move {
                        if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                            Err(OperationError::new("io", "flaky"))
                        } else {
                            Ok("done")
                        }
                    }
                }),
            )
            .await
            .unwrap();

        assert_eq!(value, "done");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_abandoned_probe_reopens_circuit() {
        let executor = FaultToleranceExecutor::new();
        let metadata = ExecutionMetadata::new(command()).with_circuit_breaker(
            CircuitBreakerConfig::default()
                .with_request_volume_threshold(1)
                .with_delay(Duration::from_millis(20)),
        );

        let _ = executor
            .execute(
                &metadata,
                Invocation::new(|| async { Err::<(), _>(OperationError::new("io", "down")) }),
            )
            .await;
        tokio::time::sleep(Duration::from_millis(40)).await;

        let slow = executor.execute(
            &metadata,
            Invocation::new(|| async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok::<_, OperationError>(())
            }),
        );
        let _ = tokio::time::timeout(Duration::from_millis(20), slow).await;

        let stats = executor.registry().circuit_stats(&command()).unwrap();
        assert_eq!(stats.opened_total, 2);
    }

    #[tokio::test]
    async fn test_submit_and_cancel_release_bulkhead() {
        let executor = FaultToleranceExecutor::new();
        let metadata = ExecutionMetadata::new(command())
            .with_bulkhead(BulkheadConfig::new(1))
            .asynchronous();

        let handle = executor.submit(
            &metadata,
            Invocation::new(|| async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok::<_, OperationError>(1)
            }),
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(
            executor
                .registry()
                .bulkhead_stats(&command())
                .unwrap()
                .concurrent_executions,
            1
        );

        handle.cancel();
        let err = handle.await.unwrap_err();
        assert!(matches!(err, FaultToleranceError::Cancelled { .. }));

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(
            executor
                .registry()
                .bulkhead_stats(&command())
                .unwrap()
                .concurrent_executions,
            0
        );
    }

    #[tokio::test]
    async fn test_fallback_replaces_final_error() {
        let executor = FaultToleranceExecutor::new();
        let metadata =
            ExecutionMetadata::new(command()).with_fallback(FallbackDefinition::handler("zero"));

        let value = executor
            .execute(
                &metadata,
                Invocation::new(|| async { Err::<u32, _>(OperationError::new("io", "down")) })
                    .with_fallback(fallback_value(0)),
            )
            .await
            .unwrap();
        assert_eq!(value, 0);
    }
}
