use serde::Deserialize;
use serde::Serialize;

use crate::Result;

/// Target discovery fan-out parameters
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct DiscoveryConfig {
    /// Maximum number of keyspaces probed at once. 0 probes all keyspaces concurrently.
    #[serde(default)]
    pub max_concurrency: usize,

    /// Whether a cached (possibly stale) keyspace list is acceptable
    #[serde(default = "default_stale_names_ok")]
    pub stale_names_ok: bool,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 0,
            stale_names_ok: default_stale_names_ok(),
        }
    }
}

impl DiscoveryConfig {
    pub fn concurrency_limit(&self) -> Option<usize> {
        (self.max_concurrency > 0).then_some(self.max_concurrency)
    }

    pub fn validate(&self) -> Result<()> {
        Ok(())
    }
}

fn default_stale_names_ok() -> bool {
    true
}
