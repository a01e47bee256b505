//! Human readable durations for configuration files (`200ms`, `5s`, `1m 30s`).

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::time::Duration;

/// Deserialize a duration from a humantime string.
pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    let s: String = Deserialize::deserialize(deserializer)?;
    humantime::parse_duration(&s).map_err(|e| {
        serde::de::Error::custom(format!("invalid duration '{}': {}", s, e))
    })
}

/// Serialize a duration to a humantime string.
pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    humantime::format_duration(*duration)
        .to_string()
        .serialize(serializer)
}
