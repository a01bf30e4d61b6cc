//! Fallback capabilities and the rule deciding when they run.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use faultline_core::{
    CommandId, ExecutionContextActivator, ExecutionMetadata, FallbackContext, FallbackHandler,
    FaultToleranceError, OperationError,
};
use tracing::{debug, warn};

/// A fallback capability shared between calls.
pub type SharedFallback<T> = Arc<dyn FallbackHandler<T>>;

/// Adapts a function taking the failure context into a fallback.
pub struct FnFallback<F> {
    f: F,
}

#[async_trait]
impl<T, F, Fut> FallbackHandler<T> for FnFallback<F>
where
    T: Send + 'static,
    F: Fn(FallbackContext) -> Fut + Send + Sync,
    Fut: Future<Output = Result<T, OperationError>> + Send,
{
    async fn handle(&self, context: FallbackContext) -> Result<T, OperationError> {
        (self.f)(context).await
    }
}

/// Always answers with a clone of the same value.
pub struct ValueFallback<T> {
    value: T,
}

#[async_trait]
impl<T> FallbackHandler<T> for ValueFallback<T>
where
    T: Clone + Send + Sync + 'static,
{
    async fn handle(&self, _context: FallbackContext) -> Result<T, OperationError> {
        Ok(self.value.clone())
    }
}

pub fn fallback_fn<T, F, Fut>(f: F) -> SharedFallback<T>
where
    T: Send + 'static,
    F: Fn(FallbackContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T, OperationError>> + Send + 'static,
{
    Arc::new(FnFallback { f })
}

pub fn fallback_value<T>(value: T) -> SharedFallback<T>
where
    T: Clone + Send + Sync + 'static,
{
    Arc::new(ValueFallback { value })
}

/// Why a terminal failure is returned as-is instead of being replaced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FallbackSkip {
    NotConfigured,
    Disabled,
    /// The error describes the call itself (configuration, cancellation)
    Terminal,
    /// The error matched the fallback's `skip_on`
    SkipOn,
    /// The operation error falls outside the breaker's `fail_on`
    BusinessError,
}

/// Decides whether `error`, the final failure of a call, goes to the
/// command's fallback.
pub fn fallback_decision(
    metadata: &ExecutionMetadata,
    error: &FaultToleranceError,
) -> Result<(), FallbackSkip> {
    let Some(definition) = &metadata.fallback else {
        return Err(FallbackSkip::NotConfigured);
    };
    if !definition.enabled {
        return Err(FallbackSkip::Disabled);
    }
    if error.is_terminal() {
        return Err(FallbackSkip::Terminal);
    }

    let kind = error.kind();
    if definition.skip_on.matches(&kind) {
        return Err(FallbackSkip::SkipOn);
    }
    if let (Some(cb), FaultToleranceError::Operation(_)) = (&metadata.circuit_breaker, error) {
        if !error.counts_as_failure(&cb.fail_on) {
            return Err(FallbackSkip::BusinessError);
        }
    }
    Ok(())
}

/// Runs a fallback under the ambient context, wrapping its failure.
pub async fn invoke_fallback<T>(
    handler: &SharedFallback<T>,
    context: FallbackContext,
    activator: &dyn ExecutionContextActivator,
) -> Result<T, FaultToleranceError> {
    let command: CommandId = context.command.clone();
    debug!(command = %command, cause = %context.failure.kind(), "Invoking fallback");

    let _context = activator.activate(&command);
    handler.handle(context).await.map_err(|error| {
        warn!(command = %command, error = %error, "Fallback failed");
        FaultToleranceError::FallbackFailed {
            command,
            source: Box::new(FaultToleranceError::Operation(error)),
        }
    })
}
