use crate::config::millis;
use crate::core::{Result, StateError};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Limits and timings for client event-stream connections
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ConnectionConfig {
    /// Interval between keep-alive frames
    #[serde(with = "millis")]
    pub heartbeat_interval: Duration,

    /// Close a connection after this long without a heartbeat acknowledgement
    #[serde(with = "millis")]
    pub idle_timeout: Duration,

    /// Consecutive unacknowledged heartbeats before the connection is force-closed
    pub max_missed_acks: u32,

    /// Frames buffered per connection before a write counts as failed
    pub outbound_queue: usize,

    /// Maximum number of open connections
    pub max_connections: usize,

    /// Maximum number of connections subscribed to one key
    pub max_subscribers_per_key: usize,

    /// Maximum number of keys one connection may subscribe to
    pub max_subscriptions_per_connection: usize,

    /// Forward diffs that carry neither changed fields nor fragments
    pub forward_empty_diffs: bool,
}

impl ConnectionConfig {
    pub fn new() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(15),
            idle_timeout: Duration::from_secs(60),
            max_missed_acks: 3,
            outbound_queue: 64,
            max_connections: 10_000,
            max_subscribers_per_key: 4_096,
            max_subscriptions_per_connection: 256,
            forward_empty_diffs: false,
        }
    }

    /// Set heartbeat interval
    pub fn heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    /// Set idle timeout
    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    pub fn max_missed_acks(mut self, max: u32) -> Self {
        self.max_missed_acks = max;
        self
    }

    pub fn outbound_queue(mut self, size: usize) -> Self {
        self.outbound_queue = size;
        self
    }

    /// Set maximum connections
    pub fn max_connections(mut self, max: usize) -> Self {
        self.max_connections = max;
        self
    }

    pub fn max_subscribers_per_key(mut self, max: usize) -> Self {
        self.max_subscribers_per_key = max;
        self
    }

    pub fn max_subscriptions_per_connection(mut self, max: usize) -> Self {
        self.max_subscriptions_per_connection = max;
        self
    }

    pub fn forward_empty_diffs(mut self, enabled: bool) -> Self {
        self.forward_empty_diffs = enabled;
        self
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.heartbeat_interval.is_zero() {
            return Err(invalid("heartbeat_interval must be > 0"));
        }

        if self.idle_timeout < self.heartbeat_interval {
            return Err(invalid("idle_timeout cannot be shorter than heartbeat_interval"));
        }

        if self.max_missed_acks == 0 {
            return Err(invalid("max_missed_acks must be > 0"));
        }

        if self.outbound_queue == 0 {
            return Err(invalid("outbound_queue must be > 0"));
        }

        if self.max_connections == 0 {
            return Err(invalid("max_connections must be > 0"));
        }

        if self.max_subscribers_per_key == 0 || self.max_subscriptions_per_connection == 0 {
            return Err(invalid("subscription limits must be > 0"));
        }

        Ok(())
    }
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self::new()
    }
}

fn invalid(message: &str) -> StateError {
    StateError::InvalidConfig(message.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_default_config() {
        let config = ConnectionConfig::default();
        assert_eq!(config.heartbeat_interval, Duration::from_secs(15));
        assert_eq!(config.idle_timeout, Duration::from_secs(60));
        assert_eq!(config.max_missed_acks, 3);
        assert!(!config.forward_empty_diffs);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_builder_pattern() {
        let config = ConnectionConfig::new()
            .heartbeat_interval(Duration::from_secs(5))
            .idle_timeout(Duration::from_secs(20))
            .max_connections(20)
            .forward_empty_diffs(true);

        assert_eq!(config.heartbeat_interval, Duration::from_secs(5));
        assert_eq!(config.max_connections, 20);
        assert!(config.forward_empty_diffs);
    }

    #[test]
    fn test_from_json_millis() {
        let config: ConnectionConfig = serde_json::from_value(json!({
            "heartbeat_interval": 250,
            "idle_timeout": 1000,
            "max_missed_acks": 2
        }))
        .unwrap();

        assert_eq!(config.heartbeat_interval, Duration::from_millis(250));
        assert_eq!(config.outbound_queue, 64);
        assert!(serde_json::from_value::<ConnectionConfig>(json!({"port": 1})).is_err());
    }

    #[test]
    fn test_validate() {
        assert!(ConnectionConfig::new().max_connections(0).validate().is_err());
        assert!(ConnectionConfig::new().max_missed_acks(0).validate().is_err());
        assert!(
            ConnectionConfig::new()
                .heartbeat_interval(Duration::from_secs(30))
                .idle_timeout(Duration::from_secs(10))
                .validate()
                .is_err()
        );
    }
}
