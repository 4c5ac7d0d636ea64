//! Runner configuration.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Configuration failure, fatal at construction time so misconfiguration is
/// caught at startup, not mid-run.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("heartbeat must be at least 1ms")]
    InvalidHeartbeat,

    #[error("maximum concurrency must be at least 1")]
    InvalidConcurrency,
}

/// Knobs for one runner instance. Deserializable so hosts can load it from
/// their configuration files.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerConfig {
    /// Polling interval of the control loop, in milliseconds. Must be ≥ 1.
    pub heartbeat_ms: u64,
    /// Upper bound on concurrently executing runs; also the maximum number
    /// of records dequeued per heartbeat pass.
    pub max_concurrency: usize,
    /// Directory holding the running-jobs ledger file.
    pub ledger_dir: PathBuf,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            heartbeat_ms: 1_000,
            max_concurrency: 4,
            ledger_dir: std::env::temp_dir(),
        }
    }
}

impl RunnerConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.heartbeat_ms == 0 {
            return Err(ConfigError::InvalidHeartbeat);
        }
        if self.max_concurrency == 0 {
            return Err(ConfigError::InvalidConcurrency);
        }
        Ok(())
    }

    pub fn heartbeat(&self) -> Duration {
        Duration::from_millis(self.heartbeat_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        assert_eq!(RunnerConfig::default().validate(), Ok(()));
    }

    #[test]
    fn zero_heartbeat_is_rejected() {
        let config = RunnerConfig {
            heartbeat_ms: 0,
            ..Default::default()
        };
        assert_eq!(config.validate(), Err(ConfigError::InvalidHeartbeat));
    }

    #[test]
    fn zero_concurrency_is_rejected() {
        let config = RunnerConfig {
            max_concurrency: 0,
            ..Default::default()
        };
        assert_eq!(config.validate(), Err(ConfigError::InvalidConcurrency));
    }

    #[test]
    fn partial_configuration_fills_defaults() {
        let config: RunnerConfig = serde_json::from_str(r#"{"heartbeat_ms": 250}"#).unwrap();
        assert_eq!(config.heartbeat(), Duration::from_millis(250));
        assert_eq!(config.max_concurrency, RunnerConfig::default().max_concurrency);
    }
}
