//! Resolution of a command's metadata from defaults and configuration.
//!
//! Values are looked up per property, most specific key first:
//! command, then group, then global. A property is only overridden when its
//! policy is already present in the defaults; configuration never adds a
//! policy to a command.

use faultline_core::{CommandId, ConfigError, ExecutionMetadata, PropertyKind, PropertyValue};
use tracing::debug;

use crate::key::PropertyKey;
use crate::source::ConfigSource;

pub struct MetadataResolver<'a> {
    source: &'a ConfigSource,
}

impl<'a> MetadataResolver<'a> {
    pub fn new(source: &'a ConfigSource) -> Self {
        Self { source }
    }

    /// The most specific configured value of `kind` for `command`.
    pub fn lookup(
        &self,
        command: &CommandId,
        kind: PropertyKind,
    ) -> Result<Option<(PropertyKey, PropertyValue)>, ConfigError> {
        for key in PropertyKey::lookup_chain(command, kind) {
            if let Some(value) = self.source.get(&key)? {
                return Ok(Some((key, value)));
            }
        }
        Ok(None)
    }

    /// Applies configured overrides to `defaults` and validates the result.
    pub fn resolve(&self, defaults: &ExecutionMetadata) -> Result<ExecutionMetadata, ConfigError> {
        let mut metadata = defaults.clone();

        for kind in PropertyKind::ALL {
            if !metadata.configures(kind) {
                continue;
            }
            if let Some((key, value)) = self.lookup(&metadata.command, kind)? {
                debug!(
                    command = %metadata.command,
                    key = %key,
                    value = %value,
                    "Applying configured property"
                );
                metadata.set_property(kind, value)?;
            }
        }

        metadata.check()?;
        Ok(metadata)
    }
}
