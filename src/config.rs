use crate::connection::ConnectionConfig;
use crate::core::{Result, StateError};
use crate::dispatch::DispatchSettings;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Longest allowed interval between background sweeps.
pub const MAX_SWEEP_INTERVAL: Duration = Duration::from_secs(300);

/// Engine-wide configuration
///
/// Durations are expressed in milliseconds when deserialized.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    /// Interval of the cache and persistence expiry sweep
    #[serde(with = "millis")]
    pub sweep_interval: Duration,

    /// Overall execution limit for one command
    #[serde(with = "millis")]
    pub dispatch_timeout: Duration,

    /// Expiry for entity types that declare no TTL of their own
    #[serde(with = "millis::option")]
    pub default_ttl: Option<Duration>,

    /// Upper bound on cached instances, trimmed least-recently-used first
    pub cache_capacity: Option<usize>,

    /// Events buffered per bus subscriber before it starts losing the oldest ones
    pub bus_capacity: usize,

    /// Fragments a single command may emit
    pub max_fragments_per_command: usize,

    pub connection: ConnectionConfig,
}

impl EngineConfig {
    pub fn new() -> Self {
        Self {
            sweep_interval: Duration::from_secs(60),
            dispatch_timeout: Duration::from_secs(3),
            default_ttl: None,
            cache_capacity: None,
            bus_capacity: 256,
            max_fragments_per_command: 64,
            connection: ConnectionConfig::default(),
        }
    }

    pub fn from_json_str(raw: &str) -> Result<Self> {
        let config: EngineConfig =
            serde_json::from_str(raw).map_err(|err| StateError::InvalidConfig(err.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Set sweep interval
    pub fn sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    /// Set dispatch timeout
    pub fn dispatch_timeout(mut self, timeout: Duration) -> Self {
        self.dispatch_timeout = timeout;
        self
    }

    pub fn default_ttl(mut self, ttl: Duration) -> Self {
        self.default_ttl = Some(ttl);
        self
    }

    pub fn cache_capacity(mut self, capacity: usize) -> Self {
        self.cache_capacity = Some(capacity);
        self
    }

    pub fn bus_capacity(mut self, capacity: usize) -> Self {
        self.bus_capacity = capacity;
        self
    }

    pub fn max_fragments_per_command(mut self, max: usize) -> Self {
        self.max_fragments_per_command = max;
        self
    }

    pub fn connection(mut self, connection: ConnectionConfig) -> Self {
        self.connection = connection;
        self
    }

    pub(crate) fn dispatch_settings(&self) -> DispatchSettings {
        DispatchSettings {
            timeout: self.dispatch_timeout,
            max_fragments: self.max_fragments_per_command,
            default_ttl: self.default_ttl,
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.sweep_interval.is_zero() || self.sweep_interval > MAX_SWEEP_INTERVAL {
            return Err(StateError::InvalidConfig(format!(
                "sweep_interval must be within (0, {}s]",
                MAX_SWEEP_INTERVAL.as_secs()
            )));
        }

        if self.dispatch_timeout.is_zero() {
            return Err(StateError::InvalidConfig(
                "dispatch_timeout must be > 0".to_string(),
            ));
        }

        if self.default_ttl.is_some_and(|ttl| ttl.is_zero()) {
            return Err(StateError::InvalidConfig(
                "default_ttl must be > 0 when set".to_string(),
            ));
        }

        if self.cache_capacity == Some(0) {
            return Err(StateError::InvalidConfig(
                "cache_capacity must be > 0 when set".to_string(),
            ));
        }

        if self.bus_capacity == 0 {
            return Err(StateError::InvalidConfig(
                "bus_capacity must be > 0".to_string(),
            ));
        }

        self.connection.validate()
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Serde adapter storing a `Duration` as whole milliseconds.
pub mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }

    pub mod option {
        use serde::{Deserialize, Deserializer, Serializer};
        use std::time::Duration;

        pub fn serialize<S: Serializer>(
            value: &Option<Duration>,
            serializer: S,
        ) -> Result<S::Ok, S::Error> {
            match value {
                Some(duration) => serializer.serialize_some(&(duration.as_millis() as u64)),
                None => serializer.serialize_none(),
            }
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(
            deserializer: D,
        ) -> Result<Option<Duration>, D::Error> {
            Option::<u64>::deserialize(deserializer).map(|ms| ms.map(Duration::from_millis))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = EngineConfig::default();
        assert_eq!(config.sweep_interval, Duration::from_secs(60));
        assert_eq!(config.dispatch_timeout, Duration::from_secs(3));
        assert_eq!(config.bus_capacity, 256);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_json_str() {
        let config = EngineConfig::from_json_str(
            r#"{"sweep_interval": 500, "default_ttl": 2000, "connection": {"max_connections": 5}}"#,
        )
        .unwrap();

        assert_eq!(config.sweep_interval, Duration::from_millis(500));
        assert_eq!(config.default_ttl, Some(Duration::from_secs(2)));
        assert_eq!(config.connection.max_connections, 5);
        assert_eq!(config.connection.max_missed_acks, 3);

        assert!(EngineConfig::from_json_str(r#"{"threads": 4}"#).is_err());
    }

    #[test]
    fn test_validate() {
        assert!(EngineConfig::new().sweep_interval(Duration::ZERO).validate().is_err());
        assert!(
            EngineConfig::new()
                .sweep_interval(Duration::from_secs(301))
                .validate()
                .is_err()
        );
        assert!(EngineConfig::new().cache_capacity(0).validate().is_err());
        assert!(EngineConfig::new().bus_capacity(0).validate().is_err());
        assert!(
            EngineConfig::new()
                .connection(ConnectionConfig::new().outbound_queue(0))
                .validate()
                .is_err()
        );
    }
}
