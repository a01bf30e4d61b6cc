//! Concurrency admission gate.
//!
//! A bulkhead limits how many calls to one command run at the same time.
//! Synchronous commands use a plain semaphore: a call that finds every
//! permit taken is rejected immediately. Asynchronous commands get a bounded
//! waiting queue in front of the permits, so a call is only rejected when
//! both the workers and the queue are full.
//!
//! Admission yields a [`BulkheadTicket`] that returns its permit exactly once,
//! on explicit release or when dropped.

use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use faultline_core::{BulkheadConfig, CommandId, FaultToleranceError};
use serde::Serialize;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum BulkheadMode {
    /// Reject as soon as every permit is taken
    Semaphore,
    /// Wait in a bounded queue for a free worker
    Queued,
}

/// Point-in-time occupancy of a bulkhead.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BulkheadStats {
    pub concurrent_executions: usize,
    pub waiting: usize,
    pub accepted: u64,
    pub rejected: u64,
}

pub struct Bulkhead {
    command: CommandId,
    mode: BulkheadMode,
    config: BulkheadConfig,
    semaphore: Arc<Semaphore>,
    waiting: AtomicUsize,
    accepted: AtomicU64,
    rejected: AtomicU64,
}

impl Bulkhead {
    pub fn new(command: CommandId, config: BulkheadConfig, mode: BulkheadMode) -> Self {
        debug!(
            command = %command,
            max_concurrent = config.max_concurrent,
            max_queue_size = config.max_queue_size,
            ?mode,
            "Creating bulkhead"
        );
        Self {
            command,
            mode,
            semaphore: Arc::new(Semaphore::new(config.max_concurrent)),
            config,
            waiting: AtomicUsize::new(0),
            accepted: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
        }
    }

    pub fn mode(&self) -> BulkheadMode {
        self.mode
    }

    pub fn config(&self) -> &BulkheadConfig {
        &self.config
    }

    pub fn stats(&self) -> BulkheadStats {
        BulkheadStats {
            concurrent_executions: self
                .config
                .max_concurrent
                .saturating_sub(self.semaphore.available_permits()),
            waiting: self.waiting.load(Ordering::Acquire),
            accepted: self.accepted.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
        }
    }

    /// Admits a call according to the bulkhead's mode.
    pub async fn admit(&self) -> Result<BulkheadTicket, FaultToleranceError> {
        match self.mode {
            BulkheadMode::Semaphore => self.try_acquire(),
            BulkheadMode::Queued => self.acquire().await,
        }
    }

    /// Takes a permit without waiting.
    pub fn try_acquire(&self) -> Result<BulkheadTicket, FaultToleranceError> {
        match self.semaphore.clone().try_acquire_owned() {
            Ok(permit) => Ok(self.accept(permit)),
            Err(_) => Err(self.reject()),
        }
    }

    /// Takes a permit, waiting in the queue when every worker is busy.
    ///
    /// Cancellation safe: dropping the future leaves the queue and holds no
    /// permit.
    pub async fn acquire(&self) -> Result<BulkheadTicket, FaultToleranceError> {
        if let Ok(permit) = self.semaphore.clone().try_acquire_owned() {
            return Ok(self.accept(permit));
        }

        let queued = self
            .waiting
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |waiting| {
                (waiting < self.config.max_queue_size).then_some(waiting + 1)
            });
        if queued.is_err() {
            return Err(self.reject());
        }

        let _slot = QueueSlot(&self.waiting);
        debug!(command = %self.command, "Waiting for bulkhead permit");
        match self.semaphore.clone().acquire_owned().await {
            Ok(permit) => Ok(self.accept(permit)),
            Err(_) => Err(self.reject()),
        }
    }

    fn accept(&self, permit: OwnedSemaphorePermit) -> BulkheadTicket {
        self.accepted.fetch_add(1, Ordering::Relaxed);
        BulkheadTicket {
            permit: Some(permit),
        }
    }

    fn reject(&self) -> FaultToleranceError {
        self.rejected.fetch_add(1, Ordering::Relaxed);
        warn!(command = %self.command, "Bulkhead is full, rejecting call");
        FaultToleranceError::BulkheadRejected {
            command: self.command.clone(),
        }
    }
}

impl fmt::Debug for Bulkhead {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Bulkhead")
            .field("command", &self.command)
            .field("mode", &self.mode)
            .field("stats", &self.stats())
            .finish()
    }
}

/// Occupies one waiting-queue slot until dropped.
struct QueueSlot<'a>(&'a AtomicUsize);

impl Drop for QueueSlot<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

/// One admitted slot of a bulkhead.
#[derive(Debug)]
pub struct BulkheadTicket {
    permit: Option<OwnedSemaphorePermit>,
}

impl BulkheadTicket {
    /// Returns the slot. Later calls do nothing.
    pub fn release(&mut self) {
        self.permit.take();
    }

    pub fn is_released(&self) -> bool {
        self.permit.is_none()
    }
}

impl Drop for BulkheadTicket {
    fn drop(&mut self) {
        self.release();
    }
}
