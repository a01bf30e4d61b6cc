//! Per-command state shared by every call to the same command.
//!
//! The registry owns one [`CommandEntry`] per [`CommandId`]: the current
//! metadata (swapped atomically on updates), the circuit breaker and the
//! bulkhead. Entries are created on first use and live as long as the
//! registry.

use std::sync::Arc;

use arc_swap::ArcSwap;
use dashmap::DashMap;
use faultline_core::{
    CommandId, ConfigError, ExecutionMetadata, PropertyKind, PropertyValue,
};
use tracing::info;

use crate::bulkhead::{Bulkhead, BulkheadMode, BulkheadStats};
use crate::circuit_breaker::{CircuitBreaker, CircuitBreakerStats, CircuitState};

pub struct CommandEntry {
    metadata: ArcSwap<ExecutionMetadata>,
    breaker: CircuitBreaker,
    bulkhead: Option<Bulkhead>,
}

impl CommandEntry {
    fn new(metadata: ExecutionMetadata) -> Self {
        let command = metadata.command.clone();
        let mode = if metadata.asynchronous {
            BulkheadMode::Queued
        } else {
            BulkheadMode::Semaphore
        };
        let bulkhead = metadata
            .bulkhead
            .clone()
            .map(|config| Bulkhead::new(command.clone(), config, mode));

        Self {
            metadata: ArcSwap::from_pointee(metadata),
            breaker: CircuitBreaker::new(command),
            bulkhead,
        }
    }

    /// Snapshot of the metadata in force right now.
    pub fn metadata(&self) -> Arc<ExecutionMetadata> {
        self.metadata.load_full()
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    pub fn bulkhead(&self) -> Option<&Bulkhead> {
        self.bulkhead.as_ref()
    }
}

#[derive(Default)]
pub struct CommandRegistry {
    entries: DashMap<CommandId, Arc<CommandEntry>>,
}

impl CommandRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the entry for `metadata.command`, registering it on first use.
    ///
    /// Once registered, the cached metadata wins over the value passed in;
    /// use [`update_property`](Self::update_property) to change it.
    pub fn get_or_register(
        &self,
        metadata: &ExecutionMetadata,
    ) -> Result<Arc<CommandEntry>, ConfigError> {
        if let Some(entry) = self.entries.get(&metadata.command) {
            return Ok(entry.clone());
        }

        metadata.check()?;
        let entry = self
            .entries
            .entry(metadata.command.clone())
            .or_insert_with(|| {
                info!(command = %metadata.command, "Registering guarded command");
                Arc::new(CommandEntry::new(metadata.clone()))
            })
            .clone();
        Ok(entry)
    }

    pub fn get(&self, command: &CommandId) -> Option<Arc<CommandEntry>> {
        self.entries.get(command).map(|entry| entry.clone())
    }

    pub fn metadata(&self, command: &CommandId) -> Option<Arc<ExecutionMetadata>> {
        self.get(command).map(|entry| entry.metadata())
    }

    pub fn commands(&self) -> Vec<CommandId> {
        let mut commands: Vec<_> = self.entries.iter().map(|e| e.key().clone()).collect();
        commands.sort();
        commands
    }

    pub fn circuit_state(&self, command: &CommandId) -> Option<CircuitState> {
        self.get(command).map(|entry| entry.breaker.state())
    }

    pub fn circuit_stats(&self, command: &CommandId) -> Option<CircuitBreakerStats> {
        self.get(command).map(|entry| entry.breaker.stats())
    }

    pub fn bulkhead_stats(&self, command: &CommandId) -> Option<BulkheadStats> {
        self.get(command)
            .and_then(|entry| entry.bulkhead.as_ref().map(Bulkhead::stats))
    }

    /// Replaces one property of a registered command.
    ///
    /// Calls already in progress keep the metadata they started with.
    pub fn update_property(
        &self,
        command: &CommandId,
        kind: PropertyKind,
        value: PropertyValue,
    ) -> Result<Arc<ExecutionMetadata>, ConfigError> {
        if !kind.is_runtime_updatable() {
            return Err(ConfigError::Immutable {
                command: command.clone(),
                property: kind,
            });
        }

        let entry = self
            .get(command)
            .ok_or_else(|| ConfigError::UnknownCommand(command.to_string()))?;

        loop {
            let current = entry.metadata.load_full();
            let next = Arc::new(current.with_property(kind, value)?);
            let previous = entry.metadata.compare_and_swap(&current, next.clone());
            if Arc::ptr_eq(&*previous, &current) {
                info!(
                    command = %command,
                    property = %kind,
                    value = %value,
                    "Updated command property"
                );
                return Ok(next);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use faultline_core::{BulkheadConfig, CircuitBreakerConfig, RetryConfig};
    use std::time::Duration;

    fn metadata() -> ExecutionMetadata {
        ExecutionMetadata::new(CommandId::new("orders", "create"))
            .with_circuit_breaker(CircuitBreakerConfig::default())
            .with_retry(RetryConfig::default())
            .with_bulkhead(BulkheadConfig::new(4))
    }

    #[test]
    fn test_registers_once() {
        let registry = CommandRegistry::new();
        let first = registry.get_or_register(&metadata()).unwrap();

        let changed = metadata().with_timeout(Duration::from_secs(3));
        let second = registry.get_or_register(&changed).unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert!(second.metadata().timeout.is_none());
        assert_eq!(registry.commands(), vec![CommandId::new("orders", "create")]);
    }

    #[test]
    fn test_invalid_metadata_is_not_registered() {
        let registry = CommandRegistry::new();
        let invalid = metadata()
            .with_circuit_breaker(CircuitBreakerConfig::default().with_failure_ratio(3.0));

        assert!(registry.get_or_register(&invalid).is_err());
        assert!(registry.commands().is_empty());
    }

    #[test]
    fn test_update_property_swaps_metadata() {
        let registry = CommandRegistry::new();
        let entry = registry.get_or_register(&metadata()).unwrap();
        let before = entry.metadata();

        registry
            .update_property(
                &before.command,
                PropertyKind::RetryMaxRetries,
                PropertyValue::Integer(7),
            )
            .unwrap();

        assert_eq!(before.retry.as_ref().unwrap().max_retries, 3);
        assert_eq!(entry.metadata().retry.as_ref().unwrap().max_retries, 7);
    }

    #[test]
    fn test_bulkhead_properties_are_immutable() {
        let registry = CommandRegistry::new();
        let entry = registry.get_or_register(&metadata()).unwrap();

        let result = registry.update_property(
            &entry.metadata().command,
            PropertyKind::BulkheadValue,
            PropertyValue::Integer(8),
        );
        assert!(matches!(result, Err(ConfigError::Immutable { .. })));
        assert_eq!(
            registry
                .bulkhead_stats(&CommandId::new("orders", "create"))
                .unwrap()
                .concurrent_executions,
            0
        );
    }

    #[test]
    fn test_update_unknown_command() {
        let registry = CommandRegistry::new();
        let result = registry.update_property(
            &CommandId::new("missing", "command"),
            PropertyKind::TimeoutValue,
            PropertyValue::Duration(Duration::from_secs(1)),
        );
        assert!(matches!(result, Err(ConfigError::UnknownCommand(_))));
    }
}
