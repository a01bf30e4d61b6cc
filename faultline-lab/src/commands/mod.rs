//! Lab subcommands

pub mod inspect;
pub mod simulate;

use std::path::Path;
use std::time::Duration;

use anyhow::{Context as _, Result};
use faultline_config::ConfigSource;
use faultline_core::{
    BulkheadConfig, CircuitBreakerConfig, CommandId, ErrorKind, ErrorKindSet, ExecutionMetadata,
    FallbackDefinition, RetryConfig,
};

/// Command every simulation runs under.
pub const SIMULATED_COMMAND: &str = "demo.simulated";

/// Programmatic policies of the lab commands, before configuration.
pub fn default_metadata(command: CommandId, asynchronous: bool) -> ExecutionMetadata {
    let metadata = ExecutionMetadata::new(command)
        .with_retry(
            RetryConfig::default()
                .with_max_retries(2)
                .with_delay(Duration::from_millis(25))
                .with_jitter(Duration::from_millis(10))
                .with_retry_on(ErrorKindSet::of(["io", ErrorKind::TIMEOUT])),
        )
        .with_circuit_breaker(
            CircuitBreakerConfig::default()
                .with_request_volume_threshold(10)
                .with_delay(Duration::from_secs(1)),
        )
        .with_bulkhead(BulkheadConfig::new(8))
        .with_timeout(Duration::from_millis(250))
        .with_fallback(FallbackDefinition::method("cached_reading"));

    if asynchronous {
        metadata.asynchronous()
    } else {
        metadata
    }
}

/// Configuration from `path` (if any) and `FAULTLINE__*` variables.
pub fn load_source(path: Option<&Path>) -> Result<ConfigSource> {
    let paths: Vec<&Path> = path.into_iter().collect();
    ConfigSource::load(&paths, Some(ConfigSource::ENV_PREFIX))
        .context("Failed to load configuration")
}
