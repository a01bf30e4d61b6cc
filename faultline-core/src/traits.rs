use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use uuid::Uuid;

use crate::error::{FaultToleranceError, OperationError};
use crate::events::FaultToleranceEvent;
use crate::metadata::CommandId;

/// The guarded unit of work. Invoked once per attempt.
pub trait Operation<T>: Send + Sync + 'static {
    fn invoke(&self) -> BoxFuture<'static, Result<T, OperationError>>;
}

impl<T, F, Fut> Operation<T> for F
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T, OperationError>> + Send + 'static,
{
    fn invoke(&self) -> BoxFuture<'static, Result<T, OperationError>> {
        Box::pin(self())
    }
}

/// Everything a fallback needs to know about the call it replaces.
#[derive(Debug, Clone)]
pub struct FallbackContext {
    pub command: CommandId,
    pub invocation_id: Uuid,
    pub parameters: Arc<Vec<serde_json::Value>>,
    pub failure: FaultToleranceError,
}

/// Produces a substitute result when the guarded call cannot complete.
#[async_trait]
pub trait FallbackHandler<T>: Send + Sync {
    async fn handle(&self, context: FallbackContext) -> Result<T, OperationError>;
}

/// Receives engine events. Implementations must not block.
pub trait ExecutionObserver: Send + Sync {
    fn on_event(&self, event: &FaultToleranceEvent);
}

/// Observer that discards every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

impl ExecutionObserver for NoopObserver {
    fn on_event(&self, _event: &FaultToleranceEvent) {}
}

/// Restores the caller's ambient context when dropped.
#[must_use = "the context is deactivated as soon as the guard is dropped"]
pub struct ContextGuard {
    deactivate: Option<Box<dyn FnOnce() + Send>>,
}

impl ContextGuard {
    pub fn new(deactivate: impl FnOnce() + Send + 'static) -> Self {
        Self {
            deactivate: Some(Box::new(deactivate)),
        }
    }

    pub fn noop() -> Self {
        Self { deactivate: None }
    }
}

impl Drop for ContextGuard {
    fn drop(&mut self) {
        if let Some(deactivate) = self.deactivate.take() {
            deactivate();
        }
    }
}

impl std::fmt::Debug for ContextGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContextGuard")
            .field("active", &self.deactivate.is_some())
            .finish()
    }
}

/// Carries ambient request context onto worker tasks and fallbacks.
pub trait ExecutionContextActivator: Send + Sync {
    fn activate(&self, command: &CommandId) -> ContextGuard;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopActivator;

impl ExecutionContextActivator for NoopActivator {
    fn activate(&self, _command: &CommandId) -> ContextGuard {
        ContextGuard::noop()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_closures_are_operations() {
        let op = || async { Ok::<_, OperationError>(7) };
        assert_eq!(op.invoke().await.unwrap(), 7);
        assert_eq!(op.invoke().await.unwrap(), 7);
    }

    #[test]
    fn test_context_guard_deactivates_once_on_drop() {
        let released = Arc::new(AtomicUsize::new(0));
        let counter = released.clone();
        {
            let _guard = ContextGuard::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            });
            assert_eq!(released.load(Ordering::SeqCst), 0);
        }
        assert_eq!(released.load(Ordering::SeqCst), 1);
    }
}
