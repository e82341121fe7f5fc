//! Shared serialization/deserialization utilities for configuration
//!
//! This module provides common serde helpers used across configuration types.

/// Duration serialized as whole seconds (u64)
///
/// # Example
///
/// ```ignore
/// use std::time::Duration;
/// use serde::{Deserialize, Serialize};
///
/// #[derive(Serialize, Deserialize)]
/// struct Config {
///     #[serde(with = "bg_core::config::serde_utils::duration_secs")]
///     read_timeout: Duration,
/// }
/// ```
pub mod duration_secs {
    use serde::{self, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    /// Serialize a Duration as seconds (u64)
    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_secs())
    }

    /// Deserialize a Duration from seconds (u64)
    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}

/// Duration serialized as whole milliseconds (u64)
///
/// Periods inherited from agent-side settings are expressed in milliseconds.
pub mod duration_millis {
    use serde::{self, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};
    use std::time::Duration;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct TestConfig {
        #[serde(with = "duration_secs")]
        timeout: Duration,
    }

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct HeartbeatConfig {
        #[serde(with = "duration_millis")]
        period: Duration,
    }

    #[test]
    fn test_duration_secs_serialize() {
        let config = TestConfig {
            timeout: Duration::from_secs(30),
        };
        let json = serde_json::to_string(&config).unwrap();
        assert_eq!(json, r#"{"timeout":30}"#);
    }

    #[test]
    fn test_duration_secs_deserialize() {
        let json = r#"{"timeout":60}"#;
        let config: TestConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.timeout, Duration::from_secs(60));
    }

    #[test]
    fn test_duration_millis() {
        let config: HeartbeatConfig = serde_json::from_str(r#"{"period":1500}"#).unwrap();
        assert_eq!(config.period, Duration::from_millis(1500));
        assert_eq!(serde_json::to_string(&config).unwrap(), r#"{"period":1500}"#);
    }
}
