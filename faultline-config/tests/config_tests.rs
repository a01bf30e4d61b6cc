use std::io::Write;
use std::time::Duration;

use faultline_config::*;
use faultline_core::*;
use faultline_engine::CommandRegistry;
use pretty_assertions::assert_eq;
use serial_test::serial;
use tempfile::NamedTempFile;

const CONFIG: &str = r#"
[fault-tolerance.config]
watch-enabled = true

[fault-tolerance.retry]
max-retries = 5
jitter = "0ms"

[fault-tolerance.inventory.circuit-breaker]
request-volume-threshold = 8
delay = "2s"

[fault-tolerance.inventory.reserve.circuit-breaker]
failure-ratio = 0.75

[fault-tolerance.inventory.reserve.bulkhead]
value = 3
waiting-task-queue = 6
"#;

fn config_file(contents: &str) -> NamedTempFile {
    let mut file = tempfile::Builder::new()
        .suffix(".toml")
        .tempfile()
        .unwrap();
    file.write_all(contents.as_bytes()).unwrap();
    file
}

fn reserve_defaults() -> ExecutionMetadata {
    ExecutionMetadata::new(CommandId::new("inventory", "reserve"))
        .with_retry(RetryConfig::default())
        .with_circuit_breaker(CircuitBreakerConfig::default())
        .with_bulkhead(BulkheadConfig::default())
}

#[test]
fn test_resolve_from_file_layers_scopes() {
    let file = config_file(CONFIG);
    let source = ConfigSource::load(&[file.path()], None).unwrap();

    let resolved = MetadataResolver::new(&source)
        .resolve(&reserve_defaults())
        .unwrap();

    let expected = reserve_defaults()
        .with_retry(
            RetryConfig::default()
                .with_max_retries(5)
                .with_jitter(Duration::ZERO),
        )
        .with_circuit_breaker(
            CircuitBreakerConfig::default()
                .with_request_volume_threshold(8)
                .with_delay(Duration::from_secs(2))
                .with_failure_ratio(0.75),
        )
        .with_bulkhead(BulkheadConfig::new(3).with_max_queue_size(6));
    assert_eq!(resolved, expected);
}

#[test]
fn test_missing_file_is_skipped() {
    let source = ConfigSource::load(&["does/not/exist.toml"], None).unwrap();
    let resolved = MetadataResolver::new(&source)
        .resolve(&reserve_defaults())
        .unwrap();
    assert_eq!(resolved, reserve_defaults());
}

#[test]
fn test_later_files_override_earlier_ones() {
    let base = config_file("[fault-tolerance.retry]\nmax-retries = 5\n");
    let local = config_file("[fault-tolerance.retry]\nmax-retries = 1\n");
    let source = ConfigSource::load(&[base.path(), local.path()], None).unwrap();

    let resolved = MetadataResolver::new(&source)
        .resolve(&reserve_defaults())
        .unwrap();
    assert_eq!(resolved.retry.unwrap().max_retries, 1);
}

#[test]
#[serial]
fn test_environment_overrides_file() {
    let file = config_file(CONFIG);
    std::env::set_var(
        "FAULTLINE__FAULT_TOLERANCE__INVENTORY__RESERVE__TIMEOUT__VALUE",
        "250ms",
    );
    std::env::set_var("FAULTLINE__FAULT_TOLERANCE__RETRY__MAX_RETRIES", "9");

    let source = ConfigSource::load(&[file.path()], Some(ConfigSource::ENV_PREFIX));

    std::env::remove_var("FAULTLINE__FAULT_TOLERANCE__INVENTORY__RESERVE__TIMEOUT__VALUE");
    std::env::remove_var("FAULTLINE__FAULT_TOLERANCE__RETRY__MAX_RETRIES");

    let source = source.unwrap();
    let defaults = reserve_defaults().with_timeout(Duration::from_secs(1));
    let resolved = MetadataResolver::new(&source).resolve(&defaults).unwrap();

    assert_eq!(resolved.timeout.unwrap().duration, Duration::from_millis(250));
    assert_eq!(resolved.retry.unwrap().max_retries, 9);
}

#[test]
fn test_apply_update_respects_more_specific_keys() {
    let source = ConfigSource::from_toml(CONFIG).unwrap();
    let settings = WatchSettings::from_source(&source).unwrap();
    let registry = CommandRegistry::new();

    let reserve = MetadataResolver::new(&source)
        .resolve(&reserve_defaults())
        .unwrap();
    let release = ExecutionMetadata::new(CommandId::new("inventory", "release"))
        .with_circuit_breaker(CircuitBreakerConfig::default());
    let charge = ExecutionMetadata::new(CommandId::new("billing", "charge"));
    for metadata in [&reserve, &release, &charge] {
        registry.get_or_register(metadata).unwrap();
    }

    let update = PropertyUpdate::parse("fault-tolerance.inventory.circuit-breaker.failure-ratio", "0.1")
        .unwrap();
    let updated = apply_update(&registry, &source, &settings, &update).unwrap();

    // reserve sets its own failure-ratio, charge has no breaker
    assert_eq!(updated, vec![release.command.clone()]);
    let ratio = |command: &CommandId| {
        registry
            .metadata(command)
            .unwrap()
            .circuit_breaker
            .as_ref()
            .unwrap()
            .failure_ratio
    };
    assert_eq!(ratio(&release.command), 0.1);
    assert_eq!(ratio(&reserve.command), 0.75);
}

#[test]
fn test_apply_update_rejects_immutable_property() {
    let source = ConfigSource::from_toml(CONFIG).unwrap();
    let settings = WatchSettings::from_source(&source).unwrap();
    let registry = CommandRegistry::new();
    registry.get_or_register(&reserve_defaults()).unwrap();

    let update =
        PropertyUpdate::parse("fault-tolerance.inventory.reserve.bulkhead.value", "20").unwrap();
    let result = apply_update(&registry, &source, &settings, &update);
    assert!(matches!(result, Err(ConfigError::Immutable { .. })));
}

#[test]
fn test_apply_update_ignored_when_watch_disabled() {
    let source = ConfigSource::from_toml("[fault-tolerance.retry]\nmax-retries = 1\n").unwrap();
    let settings = WatchSettings::from_source(&source).unwrap();
    let registry = CommandRegistry::new();
    registry.get_or_register(&reserve_defaults()).unwrap();

    let update = PropertyUpdate::parse("fault-tolerance.retry.max-retries", "0").unwrap();
    assert!(apply_update(&registry, &source, &settings, &update)
        .unwrap()
        .is_empty());
    assert_eq!(
        registry
            .metadata(&CommandId::new("inventory", "reserve"))
            .unwrap()
            .retry
            .as_ref()
            .unwrap()
            .max_retries,
        3
    );
}
