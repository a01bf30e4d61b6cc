//! Lock-free circuit breaker with a rolling outcome window.
//!
//! The breaker tracks the outcomes of the last `request_volume_threshold`
//! calls. Once that window is full and the share of failures reaches
//! `failure_ratio`, the circuit opens and calls are prevented for `delay`.
//! After the delay the circuit half-opens and admits at most
//! `success_threshold` probe calls; that many consecutive successes close it
//! again, while any failing probe re-opens it.
//!
//! # States
//!
//! - **Closed**: calls pass through and outcomes are recorded
//! - **Open**: calls are prevented until the delay elapses
//! - **HalfOpen**: a bounded number of probes decide whether to close
//!
//! Every transition is a compare-and-swap on the status word, so exactly one
//! caller performs it and observes the returned [`Transition`].
//!
//! # Example
//!
//! ```
//! use faultline_core::{CircuitBreakerConfig, CommandId};
//! use faultline_engine::circuit_breaker::{CircuitBreaker, CircuitState};
//!
//! let config = CircuitBreakerConfig::default()
//!     .with_request_volume_threshold(2)
//!     .with_failure_ratio(0.5);
//! let breaker = CircuitBreaker::new(CommandId::new("users", "lookup"));
//!
//! assert!(breaker.attempt_execution(&config).permitted);
//! breaker.mark_success(&config);
//! breaker.mark_failure(&config);
//! assert_eq!(breaker.state(), CircuitState::Open);
//! assert!(!breaker.attempt_execution(&config).permitted);
//! ```

use std::fmt;
use std::sync::atomic::{AtomicI64, AtomicU32, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwap;
use faultline_core::{CircuitBreakerConfig, CommandId};
use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, info, warn};

const CLOSED: u8 = 0;
const OPEN: u8 = 1;
const HALF_OPEN: u8 = 2;

const NOT_OPENED: i64 = -1;

const SLOT_EMPTY: u8 = 0;
const SLOT_SUCCESS: u8 = 1;
const SLOT_FAILURE: u8 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    fn from_raw(raw: u8) -> Self {
        match raw {
            OPEN => CircuitState::Open,
            HALF_OPEN => CircuitState::HalfOpen,
            _ => CircuitState::Closed,
        }
    }
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "Closed"),
            CircuitState::Open => write!(f, "Open"),
            CircuitState::HalfOpen => write!(f, "HalfOpen"),
        }
    }
}

/// State change performed by the current caller, if any.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    None,
    Opened,
    HalfOpened,
    Closed,
}

/// Result of asking the breaker for permission to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Admission {
    pub permitted: bool,
    pub transition: Transition,
}

impl Admission {
    fn permitted(transition: Transition) -> Self {
        Self {
            permitted: true,
            transition,
        }
    }

    fn prevented(transition: Transition) -> Self {
        Self {
            permitted: false,
            transition,
        }
    }
}

/// Ring of the most recent outcomes with running totals.
struct OutcomeWindow {
    slots: Box<[AtomicU8]>,
    cursor: AtomicUsize,
    successes: AtomicI64,
    failures: AtomicI64,
}

impl OutcomeWindow {
    fn new(size: u32) -> Self {
        let size = size.max(1) as usize;
        Self {
            slots: (0..size).map(|_| AtomicU8::new(SLOT_EMPTY)).collect(),
            cursor: AtomicUsize::new(0),
            successes: AtomicI64::new(0),
            failures: AtomicI64::new(0),
        }
    }

    fn capacity(&self) -> usize {
        self.slots.len()
    }

    fn record(&self, outcome: u8) {
        let index = self.cursor.fetch_add(1, Ordering::AcqRel) % self.slots.len();
        match self.slots[index].swap(outcome, Ordering::AcqRel) {
            SLOT_SUCCESS => {
                self.successes.fetch_sub(1, Ordering::AcqRel);
            }
            SLOT_FAILURE => {
                self.failures.fetch_sub(1, Ordering::AcqRel);
            }
            _ => {}
        }
        match outcome {
            SLOT_SUCCESS => self.successes.fetch_add(1, Ordering::AcqRel),
            _ => self.failures.fetch_add(1, Ordering::AcqRel),
        };
    }

    /// `(successes, failures)` currently in the window.
    fn counts(&self) -> (u64, u64) {
        let successes = self.successes.load(Ordering::Acquire).max(0) as u64;
        let failures = self.failures.load(Ordering::Acquire).max(0) as u64;
        (successes, failures)
    }
}

/// Snapshot of a breaker for inspection.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CircuitBreakerStats {
    pub state: CircuitState,
    pub window_successes: u64,
    pub window_failures: u64,
    pub half_open_successes: u32,
    pub opened_total: u64,
}

/// Per-command circuit breaker shared by every concurrent call.
pub struct CircuitBreaker {
    command: CommandId,
    status: AtomicU8,
    window: ArcSwap<OutcomeWindow>,
    /// Microseconds since `epoch` at which the circuit last opened
    opened_at: AtomicI64,
    epoch: Instant,
    remaining_probes: AtomicI64,
    half_open_successes: AtomicU32,
    opened_total: AtomicU64,
}

impl CircuitBreaker {
    pub fn new(command: CommandId) -> Self {
        info!(command = %command, "Creating circuit breaker");

        Self {
            command,
            status: AtomicU8::new(CLOSED),
            window: ArcSwap::from_pointee(OutcomeWindow::new(1)),
            opened_at: AtomicI64::new(NOT_OPENED),
            epoch: Instant::now(),
            remaining_probes: AtomicI64::new(0),
            half_open_successes: AtomicU32::new(0),
            opened_total: AtomicU64::new(0),
        }
    }

    pub fn command(&self) -> &CommandId {
        &self.command
    }

    pub fn state(&self) -> CircuitState {
        CircuitState::from_raw(self.status.load(Ordering::Acquire))
    }

    /// Whether calls are currently prevented, honouring the force flags.
    pub fn is_open(&self, config: &CircuitBreakerConfig) -> bool {
        if config.force_open {
            return true;
        }
        if config.force_closed {
            return false;
        }
        self.state() == CircuitState::Open
    }

    pub fn stats(&self) -> CircuitBreakerStats {
        let (window_successes, window_failures) = self.window.load().counts();
        CircuitBreakerStats {
            state: self.state(),
            window_successes,
            window_failures,
            half_open_successes: self.half_open_successes.load(Ordering::Acquire),
            opened_total: self.opened_total.load(Ordering::Acquire),
        }
    }

    /// Decides whether the next call may run.
    ///
    /// An open circuit whose delay has elapsed half-opens here; in the
    /// half-open state each admitted call consumes one probe slot.
    pub fn attempt_execution(&self, config: &CircuitBreakerConfig) -> Admission {
        if config.force_open {
            return Admission::prevented(Transition::None);
        }
        if config.force_closed {
            return Admission::permitted(Transition::None);
        }

        let mut transition = Transition::None;
        loop {
            match self.status.load(Ordering::Acquire) {
                CLOSED => return Admission::permitted(transition),
                OPEN => {
                    let opened_at = self.opened_at.load(Ordering::Acquire);
                    let delay = config.delay.as_micros() as i64;
                    if opened_at == NOT_OPENED || self.now_micros() <= opened_at + delay {
                        return Admission::prevented(transition);
                    }
                    if self
                        .status
                        .compare_exchange(OPEN, HALF_OPEN, Ordering::AcqRel, Ordering::Acquire)
                        .is_ok()
                    {
                        self.half_open_successes.store(0, Ordering::Release);
                        self.remaining_probes
                            .store(i64::from(config.success_threshold), Ordering::Release);
                        let _ = self.opened_at.compare_exchange(
                            opened_at,
                            NOT_OPENED,
                            Ordering::AcqRel,
                            Ordering::Acquire,
                        );
                        info!(command = %self.command, "Circuit breaker half-open");
                        transition = Transition::HalfOpened;
                    }
                }
                _ => {
                    return if self.claim_probe() {
                        debug!(command = %self.command, "Admitting half-open probe");
                        Admission::permitted(transition)
                    } else {
                        Admission::prevented(transition)
                    };
                }
            }
        }
    }

    fn claim_probe(&self) -> bool {
        self.remaining_probes
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |remaining| {
                (remaining > 0).then(|| remaining - 1)
            })
            .is_ok()
    }

    /// Records a successful call.
    pub fn mark_success(&self, config: &CircuitBreakerConfig) -> Transition {
        match self.status.load(Ordering::Acquire) {
            CLOSED => {
                self.window_for(config).record(SLOT_SUCCESS);
                Transition::None
            }
            HALF_OPEN => {
                let successes = self.half_open_successes.fetch_add(1, Ordering::AcqRel) + 1;
                if successes >= config.success_threshold
                    && self
                        .status
                        .compare_exchange(HALF_OPEN, CLOSED, Ordering::AcqRel, Ordering::Acquire)
                        .is_ok()
                {
                    self.clear(config);
                    info!(
                        command = %self.command,
                        successes,
                        "Circuit breaker closed after successful probes"
                    );
                    return Transition::Closed;
                }
                Transition::None
            }
            _ => Transition::None,
        }
    }

    /// Records a failed call, opening the circuit when the window breaches.
    pub fn mark_failure(&self, config: &CircuitBreakerConfig) -> Transition {
        match self.status.load(Ordering::Acquire) {
            CLOSED => {
                let window = self.window_for(config);
                window.record(SLOT_FAILURE);

                let (successes, failures) = window.counts();
                let total = successes + failures;
                if total < u64::from(config.request_volume_threshold) {
                    return Transition::None;
                }
                if (failures as f64) / (total as f64) < config.failure_ratio {
                    return Transition::None;
                }

                if self.trip(CLOSED, config) {
                    warn!(
                        command = %self.command,
                        failures,
                        total,
                        "Circuit breaker opened"
                    );
                    return Transition::Opened;
                }
                Transition::None
            }
            HALF_OPEN => self.mark_non_success(config),
            _ => Transition::None,
        }
    }

    /// Records a failed probe; the circuit re-opens immediately.
    pub fn mark_non_success(&self, config: &CircuitBreakerConfig) -> Transition {
        if self.trip(HALF_OPEN, config) {
            warn!(command = %self.command, "Circuit breaker re-opened by failed probe");
            return Transition::Opened;
        }
        Transition::None
    }

    /// Forces the breaker back to a fresh closed state.
    pub fn reset(&self, config: &CircuitBreakerConfig) {
        info!(command = %self.command, "Manually resetting circuit breaker");
        self.status.store(CLOSED, Ordering::Release);
        self.clear(config);
    }

    fn trip(&self, from: u8, config: &CircuitBreakerConfig) -> bool {
        if self
            .status
            .compare_exchange(from, OPEN, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        self.opened_at.store(self.now_micros(), Ordering::Release);
        self.remaining_probes.store(0, Ordering::Release);
        self.window
            .store(Arc::new(OutcomeWindow::new(config.request_volume_threshold)));
        self.opened_total.fetch_add(1, Ordering::AcqRel);
        true
    }

    fn clear(&self, config: &CircuitBreakerConfig) {
        self.window
            .store(Arc::new(OutcomeWindow::new(config.request_volume_threshold)));
        self.opened_at.store(NOT_OPENED, Ordering::Release);
        self.remaining_probes.store(0, Ordering::Release);
        self.half_open_successes.store(0, Ordering::Release);
    }

    /// The current window, rebuilt when the configured volume changed.
    fn window_for(&self, config: &CircuitBreakerConfig) -> Arc<OutcomeWindow> {
        let wanted = config.request_volume_threshold.max(1) as usize;
        let current = self.window.load_full();
        if current.capacity() == wanted {
            return current;
        }

        debug!(
            command = %self.command,
            from = current.capacity(),
            to = wanted,
            "Resizing circuit breaker window"
        );
        let fresh = Arc::new(OutcomeWindow::new(config.request_volume_threshold));
        let previous = self.window.compare_and_swap(&current, fresh.clone());
        if Arc::ptr_eq(&*previous, &current) {
            fresh
        } else {
            arc_swap::Guard::into_inner(previous)
        }
    }

    fn now_micros(&self) -> i64 {
        self.epoch.elapsed().as_micros() as i64
    }
}

impl fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("command", &self.command)
            .field("state", &self.state())
            .finish()
    }
}
