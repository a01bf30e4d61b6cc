//! Live property updates.
//!
//! A watcher outside this crate notices that a key changed and hands the
//! key and its new raw value to [`apply_update`], which forwards it to every
//! registered command the key governs.

use faultline_core::{CommandId, ConfigError, PropertyKind, PropertyValue};
use faultline_engine::CommandRegistry;
use tracing::{debug, info};

use crate::key::{PropertyKey, Scope};
use crate::source::ConfigSource;

/// Which properties accept live updates.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WatchSettings {
    pub enabled: bool,
    /// Restricts watching to these properties, named either `delay` or
    /// `retry.delay`. `None` watches everything.
    pub properties: Option<Vec<String>>,
}

impl WatchSettings {
    pub const ENABLED_KEY: &'static str = "fault-tolerance.config.watch-enabled";
    pub const PROPERTIES_KEY: &'static str = "fault-tolerance.config.watch-properties";

    pub fn from_source(source: &ConfigSource) -> Result<Self, ConfigError> {
        let enabled = match source.get_raw(Self::ENABLED_KEY)? {
            Some(raw) => raw.trim().parse().map_err(|_| ConfigError::InvalidValue {
                key: Self::ENABLED_KEY.to_string(),
                value: raw.clone(),
            })?,
            None => false,
        };

        let properties = source.get_raw(Self::PROPERTIES_KEY)?.map(|raw| {
            raw.split(',')
                .map(str::trim)
                .filter(|p| !p.is_empty())
                .map(str::to_string)
                .collect()
        });

        Ok(Self {
            enabled,
            properties,
        })
    }

    pub fn is_watched(&self, kind: PropertyKind) -> bool {
        if !self.enabled {
            return false;
        }
        match &self.properties {
            None => true,
            Some(properties) => properties
                .iter()
                .any(|p| p == kind.name() || *p == kind.to_string()),
        }
    }
}

/// A changed key together with its new value.
#[derive(Debug, Clone, PartialEq)]
pub struct PropertyUpdate {
    pub key: PropertyKey,
    pub value: PropertyValue,
}

impl PropertyUpdate {
    pub fn parse(key: &str, raw: &str) -> Result<Self, ConfigError> {
        let key = PropertyKey::parse(key)?;
        let value = PropertyValue::parse(key.kind, raw)?;
        Ok(Self { key, value })
    }
}

/// Applies `update` to the registered commands it governs and returns them.
///
/// A command is skipped when a more specific key for the same property is
/// present in `source`, or when its metadata lacks the property's policy.
pub fn apply_update(
    registry: &CommandRegistry,
    source: &ConfigSource,
    settings: &WatchSettings,
    update: &PropertyUpdate,
) -> Result<Vec<CommandId>, ConfigError> {
    let kind = update.key.kind;
    if !settings.is_watched(kind) {
        debug!(key = %update.key, "Ignoring update of unwatched property");
        return Ok(Vec::new());
    }

    let mut updated = Vec::new();
    for command in registry.commands() {
        if !update.key.scope.applies_to(&command) || shadowed(source, &update.key, &command)? {
            continue;
        }

        match registry.update_property(&command, kind, update.value) {
            Ok(_) => updated.push(command),
            Err(ConfigError::PolicyNotConfigured { .. }) => {
                debug!(command = %command, property = %kind, "Policy not configured, skipping");
            }
            Err(e) => return Err(e),
        }
    }

    info!(
        key = %update.key,
        value = %update.value,
        commands = updated.len(),
        "Applied configuration update"
    );
    Ok(updated)
}

/// Whether a key more specific than `key` sets the same property for `command`.
fn shadowed(
    source: &ConfigSource,
    key: &PropertyKey,
    command: &CommandId,
) -> Result<bool, ConfigError> {
    let kind = key.kind;
    match key.scope {
        Scope::Command(_) => Ok(false),
        Scope::Group(_) => source.contains(&PropertyKey::command(command.clone(), kind)),
        Scope::Global => Ok(source.contains(&PropertyKey::command(command.clone(), kind))?
            || source.contains(&PropertyKey::group(command.group(), kind))?),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn settings(properties: Option<&[&str]>) -> WatchSettings {
        WatchSettings {
            enabled: true,
            properties: properties.map(|p| p.iter().map(|s| s.to_string()).collect()),
        }
    }

    #[test]
    fn test_watch_disabled_by_default() {
        let settings = WatchSettings::from_source(&ConfigSource::default()).unwrap();
        assert_eq!(settings, WatchSettings::default());
        assert!(!settings.is_watched(PropertyKind::RetryDelay));
    }

    #[test]
    fn test_watch_properties_filter() {
        let settings = settings(Some(&["max-retries", "circuit-breaker.delay"]));
        assert!(settings.is_watched(PropertyKind::RetryMaxRetries));
        assert!(settings.is_watched(PropertyKind::CircuitBreakerDelay));
        assert!(!settings.is_watched(PropertyKind::RetryDelay));
    }

    #[test]
    fn test_watch_settings_from_source() {
        let source = ConfigSource::from_toml(
            "[fault-tolerance.config]\nwatch-enabled = true\nwatch-properties = \"delay, force-open\"\n",
        )
        .unwrap();
        let settings = WatchSettings::from_source(&source).unwrap();

        assert!(settings.enabled);
        assert_eq!(
            settings.properties,
            Some(vec!["delay".to_string(), "force-open".to_string()])
        );
        assert!(settings.is_watched(PropertyKind::CircuitBreakerForceOpen));
        assert!(!settings.is_watched(PropertyKind::TimeoutValue));
    }

    #[test]
    fn test_parse_update() {
        let update =
            PropertyUpdate::parse("fault-tolerance.inventory.timeout.value", "750ms").unwrap();
        assert_eq!(update.key, PropertyKey::group("inventory", PropertyKind::TimeoutValue));
        assert_eq!(
            update.value,
            PropertyValue::Duration(std::time::Duration::from_millis(750))
        );

        assert!(PropertyUpdate::parse("fault-tolerance.timeout.value", "later").is_err());
    }
}
