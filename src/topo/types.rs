use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::Deserialize;
use serde::Serialize;

use super::KeyRange;

/// Role of a tablet within its shard
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TabletType {
    #[default]
    Unknown,
    Primary,
    Replica,
    Rdonly,
    Spare,
    Backup,
    Restore,
    Drained,
}

impl TabletType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TabletType::Unknown => "unknown",
            TabletType::Primary => "primary",
            TabletType::Replica => "replica",
            TabletType::Rdonly => "rdonly",
            TabletType::Spare => "spare",
            TabletType::Backup => "backup",
            TabletType::Restore => "restore",
            TabletType::Drained => "drained",
        }
    }

    /// Types that take query traffic
    pub fn is_serving_type(&self) -> bool {
        matches!(self, TabletType::Primary | TabletType::Replica | TabletType::Rdonly)
    }
}

impl fmt::Display for TabletType {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown tablet type: {0}")]
pub struct UnknownTabletType(pub String);

impl FromStr for TabletType {
    type Err = UnknownTabletType;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "unknown" => Ok(TabletType::Unknown),
            // legacy name still found in older topologies
            "primary" | "master" => Ok(TabletType::Primary),
            "replica" => Ok(TabletType::Replica),
            "rdonly" | "batch" => Ok(TabletType::Rdonly),
            "spare" => Ok(TabletType::Spare),
            "backup" => Ok(TabletType::Backup),
            "restore" => Ok(TabletType::Restore),
            "drained" => Ok(TabletType::Drained),
            _ => Err(UnknownTabletType(s.to_string())),
        }
    }
}

/// Identity of a single tablet process
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct TabletAlias {
    pub cell: String,
    pub uid: u32,
}

impl TabletAlias {
    pub fn new(
        cell: impl Into<String>,
        uid: u32,
    ) -> Self {
        Self { cell: cell.into(), uid }
    }
}

impl fmt::Display for TabletAlias {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        write!(f, "{}-{:010}", self.cell, self.uid)
    }
}

/// A serving endpoint: (cell, keyspace, shard, tablet type)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct Target {
    pub cell: String,
    pub keyspace: String,
    pub shard: String,
    pub tablet_type: TabletType,
}

impl Target {
    pub fn new(
        cell: impl Into<String>,
        keyspace: impl Into<String>,
        shard: impl Into<String>,
        tablet_type: TabletType,
    ) -> Self {
        Self {
            cell: cell.into(),
            keyspace: keyspace.into(),
            shard: shard.into(),
            tablet_type,
        }
    }
}

impl fmt::Display for Target {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        write!(f, "{}.{}.{}", self.keyspace, self.shard, self.tablet_type)
    }
}

/// Reference to a shard inside a serving partition
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ShardReference {
    pub name: String,
    pub key_range: Option<KeyRange>,
}

impl ShardReference {
    /// Builds a reference whose key range is derived from the shard name.
    /// Names that are not ranges (e.g. `0`) carry no key range.
    pub fn from_name(name: impl Into<String>) -> Self {
        let name = name.into();
        let key_range = KeyRange::from_shard_name(&name).ok().flatten();
        Self { name, key_range }
    }
}

/// Per-shard query service override installed during migrations
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ShardTabletControl {
    pub name: String,
    pub key_range: Option<KeyRange>,
    pub query_service_disabled: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct KeyspacePartition {
    pub served_type: TabletType,
    pub shard_references: Vec<ShardReference>,
    #[serde(default)]
    pub shard_tablet_controls: Vec<ShardTabletControl>,
}

impl KeyspacePartition {
    pub fn new(
        served_type: TabletType,
        shards: &[&str],
    ) -> Self {
        Self {
            served_type,
            shard_references: shards.iter().map(|s| ShardReference::from_name(*s)).collect(),
            shard_tablet_controls: Vec::new(),
        }
    }

    pub fn contains_shard(
        &self,
        shard: &str,
    ) -> bool {
        self.shard_references.iter().any(|r| r.name == shard)
    }
}

/// Redirect of a tablet type to another keyspace (vertical split bookkeeping)
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ServedFrom {
    pub tablet_type: TabletType,
    pub keyspace: String,
}

/// Serving view of a keyspace in one cell
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SrvKeyspace {
    pub partitions: Vec<KeyspacePartition>,
    #[serde(default)]
    pub served_from: Vec<ServedFrom>,
}

impl SrvKeyspace {
    pub fn partition(
        &self,
        tablet_type: TabletType,
    ) -> Option<&KeyspacePartition> {
        self.partitions.iter().find(|p| p.served_type == tablet_type)
    }

    /// Shard names served for `tablet_type`, in partition order
    pub fn shard_names(
        &self,
        tablet_type: TabletType,
    ) -> Vec<&str> {
        self.partition(tablet_type)
            .map(|p| p.shard_references.iter().map(|r| r.name.as_str()).collect())
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct KeyspaceSchema {
    pub sharded: bool,
}

/// `from_table` is `table` or `keyspace.table`; every entry of `to_tables` is `keyspace.table`
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RoutingRule {
    pub from_table: String,
    pub to_tables: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ShardRoutingRule {
    pub from_keyspace: String,
    pub to_keyspace: String,
    pub shard: String,
}

/// Serving vschema of a cell
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SrvVSchema {
    pub keyspaces: BTreeMap<String, KeyspaceSchema>,
    #[serde(default)]
    pub routing_rules: Vec<RoutingRule>,
    #[serde(default)]
    pub shard_routing_rules: Vec<ShardRoutingRule>,
}
