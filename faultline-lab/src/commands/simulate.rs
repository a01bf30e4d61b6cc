use std::collections::BTreeMap;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{ensure, Context as _, Result};
use clap::Args;
use faultline_config::MetadataResolver;
use faultline_core::{CommandId, ExecutionMetadata, FallbackContext, OperationError};
use faultline_engine::{
    fallback_fn, CircuitState, CompositeObserver, FaultToleranceExecutor, Invocation,
    TracingObserver,
};
use faultline_metrics::{init_prometheus, CommandStats, MetricsObserver, RecordingObserver};
use futures::stream::{self, StreamExt};
use rand::Rng;
use serde::Serialize;
use tracing::{debug, info};

use super::{default_metadata, load_source, SIMULATED_COMMAND};
use crate::output;

#[derive(Debug, Args)]
pub struct SimulateArgs {
    /// Configuration file layered under FAULTLINE__* environment variables
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Number of calls to run
    #[arg(short = 'n', long, default_value_t = 100)]
    pub calls: usize,

    /// Probability that a single call fails
    #[arg(short, long, default_value_t = 0.3)]
    pub failure_rate: f64,

    /// Mean latency of the simulated dependency
    #[arg(short, long, default_value_t = 20)]
    pub latency_ms: u64,

    /// Calls in flight at once
    #[arg(long, default_value_t = 4)]
    pub concurrency: usize,

    /// Run the operation on its own task
    #[arg(long = "async")]
    pub asynchronous: bool,

    /// Print the report as JSON
    #[arg(long)]
    pub json: bool,

    /// Serve Prometheus metrics on this port until interrupted
    #[arg(long, value_name = "PORT")]
    pub prometheus: Option<u16>,
}

/// A dependency that fails at random and answers after a random delay.
#[derive(Debug, Clone, Copy)]
pub struct FlakyService {
    failure_rate: f64,
    latency: Duration,
}

impl FlakyService {
    pub fn new(failure_rate: f64, latency: Duration) -> Self {
        Self {
            failure_rate,
            latency,
        }
    }

    /// One call. Randomness is drawn before the future is built so the
    /// future stays `Send`.
    pub fn call(&self) -> impl Future<Output = Result<u64, OperationError>> + Send + 'static {
        let mut rng = rand::thread_rng();
        let failed = rng.gen_bool(self.failure_rate);
        let millis = self.latency.as_millis() as u64;
        let latency = Duration::from_millis(rng.gen_range(millis / 2..=millis + millis / 2));

        async move {
            tokio::time::sleep(latency).await;
            if failed {
                Err(OperationError::new("io.reset", "connection reset by simulated peer"))
            } else {
                Ok(latency.as_millis() as u64)
            }
        }
    }
}

/// Outcome of a simulation run.
#[derive(Debug, Serialize)]
pub struct SimulationReport {
    pub command: CommandId,
    pub metadata: ExecutionMetadata,
    pub circuit_state: Option<CircuitState>,
    pub stats: CommandStats,
    /// Final errors by kind
    pub errors: BTreeMap<String, u64>,
}

pub async fn execute(args: SimulateArgs) -> Result<()> {
    ensure!(
        (0.0..=1.0).contains(&args.failure_rate),
        "failure rate must be between 0 and 1, got {}",
        args.failure_rate
    );

    let source = load_source(args.config.as_deref())?;
    let command: CommandId = SIMULATED_COMMAND.parse()?;
    let metadata = MetadataResolver::new(&source)
        .resolve(&default_metadata(command, args.asynchronous))
        .context("Invalid configuration for the simulated command")?;

    if let Some(port) = args.prometheus {
        init_prometheus(port)?;
    }

    let service = FlakyService::new(args.failure_rate, Duration::from_millis(args.latency_ms));
    let report = run_simulation(metadata, service, args.calls, args.concurrency).await?;
    output::print_report(&report, args.json)?;

    if args.prometheus.is_some() {
        info!("Serving metrics until interrupted");
        tokio::signal::ctrl_c().await?;
    }
    Ok(())
}

/// Runs `calls` guarded calls against `service`, `concurrency` at a time.
pub async fn run_simulation(
    metadata: ExecutionMetadata,
    service: FlakyService,
    calls: usize,
    concurrency: usize,
) -> Result<SimulationReport> {
    let recording = Arc::new(RecordingObserver::new());
    let executor = FaultToleranceExecutor::builder()
        .observer(Arc::new(
            CompositeObserver::new()
                .with(Arc::new(TracingObserver))
                .with(Arc::new(MetricsObserver))
                .with(recording.clone()),
        ))
        .build();
    executor.register(&metadata)?;

    let invocation = Invocation::new(move || service.call()).with_fallback(fallback_fn(
        |context: FallbackContext| async move {
            debug!(cause = %context.failure.kind(), "Serving cached reading");
            Ok(0)
        },
    ));

    info!(
        command = %metadata.command,
        calls,
        concurrency,
        "Starting simulation"
    );
    let results: Vec<_> = stream::iter(0..calls)
        .map(|_| {
            let executor = executor.clone();
            let invocation = invocation.clone();
            let metadata = &metadata;
            async move { executor.execute(metadata, invocation).await }
        })
        .buffer_unordered(concurrency.max(1))
        .collect()
        .await;

    let mut errors = BTreeMap::new();
    for error in results.into_iter().filter_map(Result::err) {
        *errors.entry(error.kind().to_string()).or_insert(0) += 1;
    }

    Ok(SimulationReport {
        command: metadata.command.clone(),
        circuit_state: executor.registry().circuit_state(&metadata.command),
        stats: recording.stats(&metadata.command).unwrap_or_default(),
        metadata,
        errors,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn metadata() -> ExecutionMetadata {
        default_metadata(SIMULATED_COMMAND.parse().unwrap(), false)
    }

    #[test]
    fn test_default_metadata_is_valid() {
        assert!(metadata().check().is_ok());
        assert!(default_metadata(SIMULATED_COMMAND.parse().unwrap(), true)
            .check()
            .is_ok());
    }

    #[tokio::test]
    async fn test_reliable_service_never_needs_fallback() {
        let service = FlakyService::new(0.0, Duration::from_millis(2));
        let report = run_simulation(metadata(), service, 20, 4).await.unwrap();

        assert_eq!(report.stats.invocations, 20);
        assert_eq!(report.stats.succeeded, 20);
        assert_eq!(report.stats.fallback_invoked, 0);
        assert_eq!(report.circuit_state, Some(CircuitState::Closed));
        assert!(report.errors.is_empty());
    }

    #[tokio::test]
    async fn test_failing_service_is_served_by_fallback() {
        let service = FlakyService::new(1.0, Duration::from_millis(2));
        let report = run_simulation(metadata(), service, 5, 1).await.unwrap();

        assert_eq!(report.stats.fallback_succeeded, 5);
        assert_eq!(report.stats.failed, 0);
        assert!(report.stats.retries > 0);
        assert!(report.errors.is_empty());
    }
}
