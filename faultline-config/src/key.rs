//! Layout of fault-tolerance configuration keys.
//!
//! ```text
//! fault-tolerance.<policy>.<property>                     global
//! fault-tolerance.<group>.<policy>.<property>             group
//! fault-tolerance.<group>.<command>.<policy>.<property>   command
//! ```

use std::fmt;

use faultline_core::{CommandId, ConfigError, PropertyKind};

/// First segment of every key.
pub const ROOT: &str = "fault-tolerance";

/// Which commands a key applies to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Scope {
    Global,
    Group(String),
    Command(CommandId),
}

impl Scope {
    pub fn applies_to(&self, command: &CommandId) -> bool {
        match self {
            Scope::Global => true,
            Scope::Group(group) => command.group() == group,
            Scope::Command(id) => id == command,
        }
    }
}

/// A fully qualified property key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PropertyKey {
    pub scope: Scope,
    pub kind: PropertyKind,
}

impl PropertyKey {
    pub fn new(scope: Scope, kind: PropertyKind) -> Self {
        Self { scope, kind }
    }

    pub fn global(kind: PropertyKind) -> Self {
        Self::new(Scope::Global, kind)
    }

    pub fn group(group: impl Into<String>, kind: PropertyKind) -> Self {
        Self::new(Scope::Group(group.into()), kind)
    }

    pub fn command(command: CommandId, kind: PropertyKind) -> Self {
        Self::new(Scope::Command(command), kind)
    }

    /// Keys consulted for `command`, most specific first.
    pub fn lookup_chain(command: &CommandId, kind: PropertyKind) -> [PropertyKey; 3] {
        [
            Self::command(command.clone(), kind),
            Self::group(command.group(), kind),
            Self::global(kind),
        ]
    }

    /// Parses a dotted key. Policy and property segments may use `_` in
    /// place of `-`, as environment variables do.
    pub fn parse(key: &str) -> Result<Self, ConfigError> {
        let unknown = || ConfigError::UnknownProperty(key.to_string());

        let segments: Vec<&str> = key.split('.').collect();
        let (root, rest) = segments.split_first().ok_or_else(unknown)?;
        if root.replace('_', "-") != ROOT || rest.len() < 2 {
            return Err(unknown());
        }

        let (scope_segments, property) = rest.split_at(rest.len() - 2);
        let policy = property[0].replace('_', "-");
        let name = property[1].replace('_', "-");
        let kind = PropertyKind::from_key(&policy, &name).ok_or_else(unknown)?;

        let scope = match scope_segments {
            [] => Scope::Global,
            [group] if !group.is_empty() => Scope::Group(group.to_string()),
            [group, command] if !group.is_empty() && !command.is_empty() => {
                Scope::Command(CommandId::new(*group, *command))
            }
            _ => return Err(unknown()),
        };

        Ok(Self { scope, kind })
    }
}

impl fmt::Display for PropertyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.scope {
            Scope::Global => write!(f, "{ROOT}.{}", self.kind),
            Scope::Group(group) => write!(f, "{ROOT}.{group}.{}", self.kind),
            Scope::Command(command) => write!(f, "{ROOT}.{command}.{}", self.kind),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    #[rstest]
    #[case("fault-tolerance.retry.max-retries", PropertyKey::global(PropertyKind::RetryMaxRetries))]
    #[case(
        "fault-tolerance.inventory.bulkhead.waiting-task-queue",
        PropertyKey::group("inventory", PropertyKind::BulkheadWaitingTaskQueue)
    )]
    #[case(
        "fault-tolerance.inventory.reserve.circuit-breaker.failure-ratio",
        PropertyKey::command(
            CommandId::new("inventory", "reserve"),
            PropertyKind::CircuitBreakerFailureRatio
        )
    )]
    #[case(
        "fault_tolerance.inventory.reserve.circuit_breaker.force_open",
        PropertyKey::command(
            CommandId::new("inventory", "reserve"),
            PropertyKind::CircuitBreakerForceOpen
        )
    )]
    #[case("fault-tolerance.asynchronous.value", PropertyKey::global(PropertyKind::Asynchronous))]
    fn test_parse_key(#[case] raw: &str, #[case] expected: PropertyKey) {
        assert_eq!(PropertyKey::parse(raw).unwrap(), expected);
    }

    #[rstest]
    #[case("retry.max-retries")]
    #[case("fault-tolerance.retry")]
    #[case("fault-tolerance.retry.value")]
    #[case("fault-tolerance.config.watch-enabled")]
    #[case("fault-tolerance.a.b.c.retry.delay")]
    #[case("fault-tolerance..retry.delay")]
    fn test_parse_rejects_unknown_keys(#[case] raw: &str) {
        assert!(matches!(
            PropertyKey::parse(raw),
            Err(ConfigError::UnknownProperty(_))
        ));
    }

    #[test]
    fn test_display_round_trips() {
        let command = CommandId::new("inventory", "reserve");
        for key in PropertyKey::lookup_chain(&command, PropertyKind::TimeoutValue) {
            assert_eq!(PropertyKey::parse(&key.to_string()).unwrap(), key);
        }
        assert_eq!(
            PropertyKey::command(command, PropertyKind::TimeoutValue).to_string(),
            "fault-tolerance.inventory.reserve.timeout.value"
        );
    }

    #[test]
    fn test_scope_applies_to() {
        let command = CommandId::new("inventory", "reserve");
        assert!(Scope::Global.applies_to(&command));
        assert!(Scope::Group("inventory".into()).applies_to(&command));
        assert!(!Scope::Group("billing".into()).applies_to(&command));
        assert!(!Scope::Command(CommandId::new("inventory", "release")).applies_to(&command));
    }
}
