//! Bridge configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use glbridge_core::{ConfigError, Limits};

/// What happens to queued commands when a context is destroyed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TeardownPolicy {
    /// Resolve every not-yet-executed command with `ContextLost`.
    #[default]
    Cancel,
    /// Execute queued commands, then release the device.
    Drain,
}

/// Bridge configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BridgeConfig {
    /// Number of render threads; contexts are assigned round-robin.
    pub render_threads: usize,
    /// Thread name prefix, suffixed with the worker index.
    pub thread_name: String,
    pub teardown: TeardownPolicy,
    /// Buffered events per subscriber before lagging ones drop.
    pub event_capacity: usize,
    /// Minimum spacing of throttled events per (context, kind).
    pub event_min_interval_ms: u64,
    /// Deferred calls allowed in flight per context (0 = unbounded).
    pub max_pending_per_context: usize,
    /// Largest texture or read-back width/height.
    pub max_texture_size: u32,
    /// Largest allocation a single command may request.
    pub max_buffer_bytes: usize,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            render_threads: 1,
            thread_name: "glbridge-render".to_string(),
            teardown: TeardownPolicy::Cancel,
            event_capacity: 256,
            event_min_interval_ms: 16,
            max_pending_per_context: 0,
            max_texture_size: Limits::default().max_texture_size,
            max_buffer_bytes: Limits::default().max_buffer_bytes,
        }
    }
}

impl BridgeConfig {
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: BridgeConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.render_threads == 0 {
            return Err(ConfigError::Invalid("render_threads must be at least 1".into()));
        }
        if self.event_capacity == 0 {
            return Err(ConfigError::Invalid("event_capacity must be at least 1".into()));
        }
        if self.max_texture_size == 0 || self.max_buffer_bytes == 0 {
            return Err(ConfigError::Invalid("size limits must be non-zero".into()));
        }
        if self.thread_name.is_empty() {
            return Err(ConfigError::Invalid("thread_name must not be empty".into()));
        }
        Ok(())
    }

    pub fn event_min_interval(&self) -> Duration {
        Duration::from_millis(self.event_min_interval_ms)
    }

    pub fn limits(&self) -> Limits {
        Limits {
            max_texture_size: self.max_texture_size,
            max_buffer_bytes: self.max_buffer_bytes,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_from_empty_object() {
        let config = BridgeConfig::from_json("{}").unwrap();
        assert_eq!(config, BridgeConfig::default());
        assert_eq!(config.teardown, TeardownPolicy::Cancel);
        assert_eq!(config.event_min_interval(), Duration::from_millis(16));
    }

    #[test]
    fn test_overrides() {
        let config = BridgeConfig::from_json(
            r#"{"render_threads": 3, "teardown": "drain", "max_pending_per_context": 8}"#,
        )
        .unwrap();
        assert_eq!(config.render_threads, 3);
        assert_eq!(config.teardown, TeardownPolicy::Drain);
        assert_eq!(config.max_pending_per_context, 8);
    }

    #[test]
    fn test_rejects_unknown_fields_and_zero_threads() {
        assert!(matches!(
            BridgeConfig::from_json(r#"{"threads": 2}"#),
            Err(ConfigError::Parse(_))
        ));
        assert!(matches!(
            BridgeConfig::from_json(r#"{"render_threads": 0}"#),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            BridgeConfig::from_json(r#"{"max_buffer_bytes": 0}"#),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn test_limits_from_config() {
        let config = BridgeConfig::from_json(r#"{"max_texture_size": 512, "max_buffer_bytes": 4096}"#).unwrap();
        assert_eq!(config.limits(), Limits { max_texture_size: 512, max_buffer_bytes: 4096 });
        assert_eq!(BridgeConfig::default().limits(), Limits::default());
    }
}
