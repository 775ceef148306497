//! Messaging node configuration.

use crate::{ConfigError, NodeId};
use std::time::Duration;

/// Default pause between loop iterations and buffer flushes.
pub const DEFAULT_PAUSE_INTERVAL_MS: u64 = 5_000;

/// Delay before the first buffer flush after start.
pub const INITIAL_FLUSH_DELAY_MS: u64 = 500;

/// Configuration for one messaging node.
#[derive(Debug, Clone, PartialEq)]
pub struct MessagingConfig {
    /// Identity of this node; unique per process
    pub node_id: NodeId,
    /// Loop and flush cadence
    pub pause_interval: Duration,
    /// Claim every eligible envelope per cycle instead of only the oldest
    pub process_multiple: bool,
    /// Synthesize a "received" reply when a listener returns none
    pub auto_answer: bool,
}

impl Default for MessagingConfig {
    fn default() -> Self {
        Self {
            node_id: NodeId::generate(),
            pause_interval: Duration::from_millis(DEFAULT_PAUSE_INTERVAL_MS),
            process_multiple: false,
            auto_answer: false,
        }
    }
}

impl MessagingConfig {
    /// Load configuration from environment variables, falling back to
    /// defaults for anything unset or unparseable.
    ///
    /// - `DOVECOTE_NODE_ID`
    /// - `DOVECOTE_PAUSE_INTERVAL_MS`
    /// - `DOVECOTE_PROCESS_MULTIPLE`
    /// - `DOVECOTE_AUTO_ANSWER`
    pub fn from_env() -> Self {
        let node_id = std::env::var("DOVECOTE_NODE_ID")
            .ok()
            .and_then(|s| NodeId::new(s).ok())
            .unwrap_or_else(NodeId::generate);

        let pause_interval = Duration::from_millis(
            std::env::var("DOVECOTE_PAUSE_INTERVAL_MS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(DEFAULT_PAUSE_INTERVAL_MS),
        );

        let process_multiple = std::env::var("DOVECOTE_PROCESS_MULTIPLE")
            .ok()
            .map(|s| s.eq_ignore_ascii_case("true"))
            .unwrap_or(false);

        let auto_answer = std::env::var("DOVECOTE_AUTO_ANSWER")
            .ok()
            .map(|s| s.eq_ignore_ascii_case("true"))
            .unwrap_or(false);

        Self {
            node_id,
            pause_interval,
            process_multiple,
            auto_answer,
        }
    }

    /// Configuration tuned for tests: short pause, every envelope per cycle.
    pub fn for_testing() -> Self {
        Self {
            pause_interval: Duration::from_millis(20),
            process_multiple: true,
            ..Self::default()
        }
    }

    pub fn with_node_id(mut self, node_id: NodeId) -> Self {
        self.node_id = node_id;
        self
    }

    pub fn with_pause_interval(mut self, pause_interval: Duration) -> Self {
        self.pause_interval = pause_interval;
        self
    }

    pub fn with_process_multiple(mut self, process_multiple: bool) -> Self {
        self.process_multiple = process_multiple;
        self
    }

    pub fn with_auto_answer(mut self, auto_answer: bool) -> Self {
        self.auto_answer = auto_answer;
        self
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.pause_interval.is_zero() {
            return Err(ConfigError::InvalidValue {
                field: "pause_interval".to_string(),
                value: format!("{:?}", self.pause_interval),
                reason: "must be greater than zero".to_string(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = MessagingConfig::default();
        assert_eq!(
            config.pause_interval,
            Duration::from_millis(DEFAULT_PAUSE_INTERVAL_MS)
        );
        assert!(!config.process_multiple);
        assert!(!config.auto_answer);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_default_node_ids_differ() {
        assert_ne!(
            MessagingConfig::default().node_id,
            MessagingConfig::default().node_id
        );
    }

    #[test]
    fn test_builders() {
        let node = NodeId::new("node-a").expect("valid node id");
        let config = MessagingConfig::default()
            .with_node_id(node.clone())
            .with_pause_interval(Duration::from_millis(100))
            .with_process_multiple(true)
            .with_auto_answer(true);

        assert_eq!(config.node_id, node);
        assert_eq!(config.pause_interval, Duration::from_millis(100));
        assert!(config.process_multiple);
        assert!(config.auto_answer);
    }

    #[test]
    fn test_zero_pause_rejected() {
        let config = MessagingConfig::default().with_pause_interval(Duration::ZERO);
        match config.validate() {
            Err(ConfigError::InvalidValue { field, .. }) => assert_eq!(field, "pause_interval"),
            other => panic!("expected InvalidValue, got {:?}", other),
        }
    }

    #[test]
    fn test_from_env_defaults() {
        // Without environment variables set, should use defaults
        let config = MessagingConfig::from_env();
        assert!(config.validate().is_ok());
        assert!(!config.node_id.as_str().is_empty());
    }
}
