use std::time::Duration;

use config::ConfigError;
use serde::Deserialize;
use serde::Serialize;

use crate::constants::DEFAULT_CONSISTENCY_CHECK_INTERVAL_MS;
use crate::constants::DEFAULT_HEALTH_CHECK_BUFFER_SIZE;
use crate::constants::DEFAULT_SEED_TIMEOUT_MS;
use crate::Error;
use crate::Result;

/// Keyspace event watcher parameters
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct WatcherConfig {
    /// Poll interval used while waiting for keyspaces to become consistent
    #[serde(default = "default_consistency_check_interval_ms")]
    pub consistency_check_interval_ms: u64,

    /// Upper bound for the initial keyspace listing done at start
    #[serde(default = "default_seed_timeout_ms")]
    pub seed_timeout_ms: u64,

    /// Capacity of the fake health-check feed channel
    #[serde(default = "default_health_check_buffer_size")]
    pub health_check_buffer_size: usize,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            consistency_check_interval_ms: default_consistency_check_interval_ms(),
            seed_timeout_ms: default_seed_timeout_ms(),
            health_check_buffer_size: default_health_check_buffer_size(),
        }
    }
}

impl WatcherConfig {
    pub fn consistency_check_interval(&self) -> Duration {
        Duration::from_millis(self.consistency_check_interval_ms)
    }

    pub fn seed_timeout(&self) -> Duration {
        Duration::from_millis(self.seed_timeout_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.consistency_check_interval_ms == 0 {
            return Err(Error::Config(ConfigError::Message(
                "consistency_check_interval_ms cannot be 0".into(),
            )));
        }

        if self.seed_timeout_ms == 0 {
            return Err(Error::Config(ConfigError::Message("seed_timeout_ms cannot be 0".into())));
        }

        if self.health_check_buffer_size == 0 {
            return Err(Error::Config(ConfigError::Message(
                "health_check_buffer_size must be at least 1".into(),
            )));
        }

        Ok(())
    }
}

fn default_consistency_check_interval_ms() -> u64 {
    DEFAULT_CONSISTENCY_CHECK_INTERVAL_MS
}
fn default_seed_timeout_ms() -> u64 {
    DEFAULT_SEED_TIMEOUT_MS
}
fn default_health_check_buffer_size() -> usize {
    DEFAULT_HEALTH_CHECK_BUFFER_SIZE
}
