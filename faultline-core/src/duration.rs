//! Duration strings used throughout policy configuration.
//!
//! Durations are written as an integer followed by an optional unit:
//! `ns`, `ms`, `s` or `m`. A bare integer is read as milliseconds.
//!
//! ```
//! use faultline_core::duration::parse_duration;
//! use std::time::Duration;
//!
//! assert_eq!(parse_duration("250ms").unwrap(), Duration::from_millis(250));
//! assert_eq!(parse_duration("2s").unwrap(), Duration::from_secs(2));
//! assert_eq!(parse_duration("1500").unwrap(), Duration::from_millis(1500));
//! ```

use std::time::Duration;

use crate::error::ConfigError;

/// Parses a duration string such as `100ms`, `2s`, `1m` or `500ns`.
pub fn parse_duration(raw: &str) -> Result<Duration, ConfigError> {
    let trimmed = raw.trim();
    let split = trimmed
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(trimmed.len());
    let (digits, unit) = trimmed.split_at(split);

    let value: u64 = digits
        .parse()
        .map_err(|_| ConfigError::InvalidDuration(raw.to_string()))?;

    match unit.trim() {
        "" | "ms" => Ok(Duration::from_millis(value)),
        "ns" => Ok(Duration::from_nanos(value)),
        "s" => Ok(Duration::from_secs(value)),
        "m" => value
            .checked_mul(60)
            .map(Duration::from_secs)
            .ok_or_else(|| ConfigError::InvalidDuration(raw.to_string())),
        _ => Err(ConfigError::InvalidDuration(raw.to_string())),
    }
}

/// Formats a duration using the largest unit that represents it exactly.
pub fn format_duration(duration: Duration) -> String {
    let nanos = duration.as_nanos();
    if nanos == 0 {
        return "0ms".to_string();
    }
    if nanos % 60_000_000_000 == 0 {
        format!("{}m", nanos / 60_000_000_000)
    } else if nanos % 1_000_000_000 == 0 {
        format!("{}s", nanos / 1_000_000_000)
    } else if nanos % 1_000_000 == 0 {
        format!("{}ms", nanos / 1_000_000)
    } else {
        format!("{}ns", nanos)
    }
}

/// Serde adapter that writes durations as strings and accepts either a
/// duration string or an integer number of milliseconds.
pub mod serde_duration {
    use std::fmt;
    use std::time::Duration;

    use serde::de::{self, Visitor};
    use serde::{Deserializer, Serializer};

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&super::format_duration(*duration))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        deserializer.deserialize_any(DurationVisitor)
    }

    struct DurationVisitor;

    impl<'de> Visitor<'de> for DurationVisitor {
        type Value = Duration;

        fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
            f.write_str("a duration string like \"100ms\" or milliseconds as an integer")
        }

        fn visit_u64<E: de::Error>(self, v: u64) -> Result<Duration, E> {
            Ok(Duration::from_millis(v))
        }

        fn visit_i64<E: de::Error>(self, v: i64) -> Result<Duration, E> {
            u64::try_from(v)
                .map(Duration::from_millis)
                .map_err(|_| E::custom(format!("negative duration: {v}")))
        }

        fn visit_str<E: de::Error>(self, v: &str) -> Result<Duration, E> {
            super::parse_duration(v).map_err(E::custom)
        }
    }
}
