//! Fault-tolerance policy engine.
//!
//! Guards calls to unreliable operations with a circuit breaker, retries,
//! a bulkhead and a timeout, and substitutes a fallback result when the
//! call cannot complete. See [`executor`] for how the policies compose.

pub mod bulkhead;
pub mod circuit_breaker;
pub mod executor;
pub mod fallback;
pub mod observer;
pub mod registry;
pub mod retry;
pub mod timeout;

pub use bulkhead::{Bulkhead, BulkheadMode, BulkheadStats, BulkheadTicket};
pub use circuit_breaker::{CircuitBreaker, CircuitBreakerStats, CircuitState, Transition};
pub use executor::{ExecutionHandle, ExecutorBuilder, FaultToleranceExecutor, Invocation};
pub use fallback::{fallback_fn, fallback_value, SharedFallback};
pub use observer::{CompositeObserver, TracingObserver};
pub use registry::{CommandEntry, CommandRegistry};
pub use retry::{RetryAttempt, RetryDecision, RetryPolicy, StopReason};
pub use timeout::{IsolatedTask, TimeoutGuard};
