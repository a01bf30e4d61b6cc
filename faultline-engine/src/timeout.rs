//! Deadlines for guarded work.
//!
//! [`TimeoutGuard`] races a unit of work against a deadline. When the
//! deadline wins the work future is dropped, which cancels it at its next
//! suspension point. Work that must run on its own task is wrapped in an
//! [`IsolatedTask`], whose task is aborted when the guard gives up on it.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use faultline_core::{CommandId, ErrorKind, FaultToleranceError, OperationError};
use tokio::task::{JoinError, JoinHandle};
use tokio::time::Instant;
use tracing::warn;

/// Outcome of guarded work together with how long it ran.
#[derive(Debug)]
pub struct Timed<T> {
    pub result: Result<T, FaultToleranceError>,
    pub elapsed: Duration,
    pub timed_out: bool,
}

#[derive(Debug, Clone)]
pub struct TimeoutGuard {
    command: CommandId,
    duration: Duration,
}

impl TimeoutGuard {
    pub fn new(command: CommandId, duration: Duration) -> Self {
        Self { command, duration }
    }

    pub fn duration(&self) -> Duration {
        self.duration
    }

    /// Runs `work` until it finishes or the deadline passes.
    pub async fn run<T, F>(&self, work: F) -> Timed<T>
    where
        F: Future<Output = Result<T, FaultToleranceError>>,
    {
        let started = Instant::now();
        match tokio::time::timeout(self.duration, work).await {
            Ok(result) => Timed {
                result,
                elapsed: started.elapsed(),
                timed_out: false,
            },
            Err(_) => {
                warn!(
                    command = %self.command,
                    timeout = ?self.duration,
                    "Guarded call timed out"
                );
                Timed {
                    result: Err(FaultToleranceError::Timeout {
                        command: self.command.clone(),
                        timeout: self.duration,
                    }),
                    elapsed: started.elapsed(),
                    timed_out: true,
                }
            }
        }
    }
}

/// Work running on its own task. Dropping the handle aborts the task.
pub struct IsolatedTask<T> {
    command: CommandId,
    handle: JoinHandle<Result<T, FaultToleranceError>>,
}

impl<T: Send + 'static> IsolatedTask<T> {
    pub fn spawn<F>(command: CommandId, work: F) -> Self
    where
        F: Future<Output = Result<T, FaultToleranceError>> + Send + 'static,
    {
        Self {
            command,
            handle: tokio::spawn(work),
        }
    }
}

impl<T> IsolatedTask<T> {
    pub fn abort(&self) {
        self.handle.abort();
    }
}

impl<T> Future for IsolatedTask<T> {
    type Output = Result<T, FaultToleranceError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let joined = match Pin::new(&mut self.handle).poll(cx) {
            Poll::Pending => return Poll::Pending,
            Poll::Ready(joined) => joined,
        };
        Poll::Ready(flatten_join(&self.command, joined))
    }
}

/// Folds a task's join error into the error it would have returned.
pub(crate) fn flatten_join<T>(
    command: &CommandId,
    joined: Result<Result<T, FaultToleranceError>, JoinError>,
) -> Result<T, FaultToleranceError> {
    match joined {
        Ok(result) => result,
        Err(join_error) if join_error.is_cancelled() => Err(FaultToleranceError::Cancelled {
            command: command.clone(),
        }),
        Err(join_error) => Err(FaultToleranceError::Operation(OperationError::new(
            ErrorKind::PANIC,
            join_error.to_string(),
        ))),
    }
}

impl<T> Drop for IsolatedTask<T> {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use tokio::time::sleep;

    fn command() -> CommandId {
        CommandId::new("test", "timeout")
    }

    #[tokio::test]
    async fn test_work_within_deadline_succeeds() {
        let guard = TimeoutGuard::new(command(), Duration::from_millis(100));
        let timed = guard.run(async { Ok::<_, FaultToleranceError>(42) }).await;

        assert!(!timed.timed_out);
        assert_eq!(timed.result.unwrap(), 42);
    }

    #[tokio::test]
    async fn test_slow_work_times_out() {
        let guard = TimeoutGuard::new(command(), Duration::from_millis(20));
        let timed = guard
            .run(async {
                sleep(Duration::from_secs(5)).await;
                Ok::<_, FaultToleranceError>(())
            })
            .await;

        assert!(timed.timed_out);
        assert!(matches!(
            timed.result,
            Err(FaultToleranceError::Timeout { timeout, .. }) if timeout == Duration::from_millis(20)
        ));
    }

    #[tokio::test]
    async fn test_errors_propagate_unchanged() {
        let guard = TimeoutGuard::new(command(), Duration::from_secs(1));
        let timed = guard
            .run(async {
                Err::<(), _>(FaultToleranceError::from(OperationError::new("io", "boom")))
            })
            .await;

        assert_eq!(timed.result.unwrap_err().kind().as_str(), "io");
    }

    #[tokio::test]
    async fn test_isolated_task_is_aborted_on_timeout() {
        let finished = Arc::new(AtomicBool::new(false));
        let flag = finished.clone();

        let task = IsolatedTask::spawn(command(), async move {
            sleep(Duration::from_millis(200)).await;
            flag.store(true, Ordering::SeqCst);
            Ok::<_, FaultToleranceError>(())
        });

        let guard = TimeoutGuard::new(command(), Duration::from_millis(20));
        let timed = guard.run(task).await;
        assert!(timed.timed_out);

        sleep(Duration::from_millis(300)).await;
        assert!(!finished.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_isolated_task_reports_panics() {
        let explode = true;
        let task = IsolatedTask::spawn(command(), async move {
            if explode {
                panic!("worker exploded");
            }
            Ok::<_, FaultToleranceError>(())
        });
        let err = task.await.unwrap_err();
        assert_eq!(err.kind().as_str(), ErrorKind::PANIC);
    }
}
