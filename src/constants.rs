// -
// Topology paths

pub(crate) const KEYSPACES_PATH: &str = "keyspaces";
pub(crate) const SHARDS_PATH: &str = "shards";
pub(crate) const ROUTING_RULES_PATH: &str = "routing_rules";
pub(crate) const NAMED_LOCKS_PATH: &str = "internal/named_locks";
pub(crate) const SRV_KEYSPACE_FILE: &str = "SrvKeyspace";
pub(crate) const SRV_VSCHEMA_FILE: &str = "SrvVSchema";

// -
// Lock record

pub(crate) const LOCK_STATUS_RUNNING: &str = "Running";
pub(crate) const LOCK_STATUS_DONE: &str = "Done";
pub(crate) const LOCK_STATUS_ERROR_PREFIX: &str = "Error: ";
pub(crate) const UNKNOWN_IDENTITY: &str = "unknown";

// -
// Defaults (milliseconds)

pub(crate) const DEFAULT_LOCK_TIMEOUT_MS: u64 = 45_000;
pub(crate) const DEFAULT_REMOTE_OPERATION_TIMEOUT_MS: u64 = 15_000;
pub(crate) const DEFAULT_CONSISTENCY_CHECK_INTERVAL_MS: u64 = 100;
pub(crate) const DEFAULT_SEED_TIMEOUT_MS: u64 = 5_000;
pub(crate) const DEFAULT_HEALTH_CHECK_BUFFER_SIZE: usize = 1024;

/// Environment variable prefix for settings overrides
pub(crate) const ENV_PREFIX: &str = "TOPOWATCH";
