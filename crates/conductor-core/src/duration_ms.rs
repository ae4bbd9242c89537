//! Serde helpers that encode [`Duration`] values as integer milliseconds.
//!
//! Used with `#[serde(with = "conductor_core::duration_ms")]` so task and
//! workflow definitions stay readable in TOML and JSON.

use serde::{Deserialize, Deserializer, Serializer};
use std::time::Duration;

/// True if `value` survives the millisecond encoding unchanged, in JSON and
/// in TOML (whose integers are signed 64-bit).
pub fn is_whole_millis(value: &Duration) -> bool {
    value.subsec_nanos() % 1_000_000 == 0 && i64::try_from(value.as_millis()).is_ok()
}

/// Serialize a duration as whole milliseconds.
pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    let millis = u64::try_from(value.as_millis()).unwrap_or(u64::MAX);
    serializer.serialize_u64(millis)
}

/// Deserialize a duration from whole milliseconds.
pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
    let millis = u64::deserialize(deserializer)?;
    Ok(Duration::from_millis(millis))
}

/// Same encoding for optional durations.
pub mod option {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    /// Serialize an optional duration as milliseconds or `null`.
    pub fn serialize<S: Serializer>(
        value: &Option<Duration>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => super::serialize(d, serializer),
            None => serializer.serialize_none(),
        }
    }

    /// Deserialize an optional duration from milliseconds.
    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(deserializer)?.map(Duration::from_millis))
    }
}
