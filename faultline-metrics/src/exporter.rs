use std::net::{Ipv4Addr, SocketAddr};
use std::sync::OnceLock;

use metrics::{describe_counter, describe_histogram, Unit};
use metrics_exporter_prometheus::PrometheusBuilder;
use tracing::info;

use crate::observer::*;

static EXPORTER_INSTALLED: OnceLock<SocketAddr> = OnceLock::new();

/// Errors that can occur while installing the exporter
#[derive(Debug, thiserror::Error)]
pub enum MetricsError {
    #[error("Failed to install metrics exporter: {0}")]
    Installation(String),
}

/// Installs the Prometheus exporter as the global recorder, serving
/// `/metrics` on `port`. Must run inside a Tokio runtime.
///
/// Subsequent calls return Ok without re-installing.
pub fn init_prometheus(port: u16) -> Result<(), MetricsError> {
    if EXPORTER_INSTALLED.get().is_some() {
        return Ok(());
    }

    let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, port));
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|e| MetricsError::Installation(e.to_string()))?;

    EXPORTER_INSTALLED
        .set(addr)
        .map_err(|_| MetricsError::Installation("Exporter already installed".to_string()))?;

    describe_metrics();
    info!(%addr, "Prometheus exporter listening");
    Ok(())
}

/// Registers descriptions for every fault-tolerance metric.
pub fn describe_metrics() {
    describe_counter!(INVOCATIONS_TOTAL, Unit::Count, "Guarded invocations started");
    describe_counter!(
        INVOCATIONS_FAILED_TOTAL,
        Unit::Count,
        "Guarded invocations that ended in an error"
    );
    describe_histogram!(
        INVOCATION_DURATION,
        Unit::Seconds,
        "Wall time of guarded invocations, retries and fallback included"
    );
    describe_counter!(RETRY_RETRIES_TOTAL, Unit::Count, "Retries scheduled");
    describe_counter!(
        RETRY_SUCCEEDED_NOT_RETRIED_TOTAL,
        Unit::Count,
        "Calls that succeeded on the first attempt"
    );
    describe_counter!(
        RETRY_SUCCEEDED_RETRIED_TOTAL,
        Unit::Count,
        "Calls that succeeded after retrying"
    );
    describe_counter!(RETRY_FAILED_TOTAL, Unit::Count, "Calls that failed after retrying");
    describe_counter!(TIMEOUT_TIMED_OUT_TOTAL, Unit::Count, "Attempts that timed out");
    describe_counter!(
        TIMEOUT_NOT_TIMED_OUT_TOTAL,
        Unit::Count,
        "Attempts that completed within their timeout"
    );
    describe_histogram!(
        TIMEOUT_EXECUTION_DURATION,
        Unit::Seconds,
        "Duration of attempts running under a timeout"
    );
    describe_counter!(
        CIRCUIT_SUCCEEDED_TOTAL,
        Unit::Count,
        "Attempts recorded as successes by the circuit breaker"
    );
    describe_counter!(
        CIRCUIT_FAILED_TOTAL,
        Unit::Count,
        "Attempts recorded as failures by the circuit breaker"
    );
    describe_counter!(
        CIRCUIT_PREVENTED_TOTAL,
        Unit::Count,
        "Attempts prevented by an open circuit"
    );
    describe_counter!(CIRCUIT_OPENED_TOTAL, Unit::Count, "Times the circuit opened");
    describe_counter!(BULKHEAD_ACCEPTED_TOTAL, Unit::Count, "Attempts admitted by the bulkhead");
    describe_counter!(BULKHEAD_REJECTED_TOTAL, Unit::Count, "Attempts rejected by the bulkhead");
    describe_counter!(FALLBACK_CALLS_TOTAL, Unit::Count, "Fallback invocations");
}
