use std::time::Duration;

use config::ConfigError;
use serde::Deserialize;
use serde::Serialize;

use crate::constants::DEFAULT_LOCK_TIMEOUT_MS;
use crate::constants::DEFAULT_REMOTE_OPERATION_TIMEOUT_MS;
use crate::Error;
use crate::Result;

/// Timeouts applied to topology store calls
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct TopoConfig {
    /// Maximum time to wait when attempting to acquire a lock from the topology store
    #[serde(default = "default_lock_timeout_ms")]
    pub lock_timeout_ms: u64,

    /// Time to wait for a remote operation (store reads, lock release)
    #[serde(default = "default_remote_operation_timeout_ms")]
    pub remote_operation_timeout_ms: u64,

    /// Lease attached to locks taken in the in-memory store. 0 disables expiry.
    #[serde(default)]
    pub lock_ttl_ms: u64,
}

impl Default for TopoConfig {
    fn default() -> Self {
        Self {
            lock_timeout_ms: default_lock_timeout_ms(),
            remote_operation_timeout_ms: default_remote_operation_timeout_ms(),
            lock_ttl_ms: 0,
        }
    }
}

impl TopoConfig {
    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    pub fn remote_operation_timeout(&self) -> Duration {
        Duration::from_millis(self.remote_operation_timeout_ms)
    }

    pub fn lock_ttl(&self) -> Option<Duration> {
        (self.lock_ttl_ms > 0).then(|| Duration::from_millis(self.lock_ttl_ms))
    }

    pub fn validate(&self) -> Result<()> {
        if self.lock_timeout_ms == 0 {
            return Err(Error::Config(ConfigError::Message(
                "lock_timeout_ms must be greater than 0".into(),
            )));
        }

        if self.remote_operation_timeout_ms == 0 {
            return Err(Error::Config(ConfigError::Message(
                "remote_operation_timeout_ms must be greater than 0".into(),
            )));
        }

        if self.lock_ttl_ms > 0 && self.lock_ttl_ms < self.remote_operation_timeout_ms {
            return Err(Error::Config(ConfigError::Message(format!(
                "lock_ttl_ms ({}) must not be shorter than remote_operation_timeout_ms ({})",
                self.lock_ttl_ms, self.remote_operation_timeout_ms
            ))));
        }

        Ok(())
    }
}

fn default_lock_timeout_ms() -> u64 {
    DEFAULT_LOCK_TIMEOUT_MS
}
fn default_remote_operation_timeout_ms() -> u64 {
    DEFAULT_REMOTE_OPERATION_TIMEOUT_MS
}
