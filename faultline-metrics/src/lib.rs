//! Metrics and in-process statistics for faultline.
//!
//! - [`MetricsObserver`] publishes engine events through the `metrics`
//!   facade, one counter family per policy, labelled by `command`.
//! - [`RecordingObserver`] keeps per-command [`CommandStats`] in memory.
//! - [`init_prometheus`] installs the Prometheus exporter.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use faultline_engine::{CompositeObserver, FaultToleranceExecutor, TracingObserver};
//! use faultline_metrics::{init_prometheus, MetricsObserver, RecordingObserver};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! init_prometheus(9000)?;
//! let recording = Arc::new(RecordingObserver::new());
//! let executor = FaultToleranceExecutor::builder()
//!     .observer(Arc::new(
//!         CompositeObserver::new()
//!             .with(Arc::new(TracingObserver))
//!             .with(Arc::new(MetricsObserver))
//!             .with(recording.clone()),
//!     ))
//!     .build();
//! # Ok(())
//! # }
//! ```

pub mod exporter;
pub mod observer;
pub mod recording;

pub use exporter::{describe_metrics, init_prometheus, MetricsError};
pub use observer::MetricsObserver;
pub use recording::{CommandStats, RecordingObserver};
