use std::sync::Arc;

use rand::seq::SliceRandom;
use rand::Rng;

use crate::discovery::EventBroadcaster;
use crate::KeyspacePartition;
use crate::KeyspaceState;
use crate::ShardState;
use crate::SrvKeyspace;
use crate::TabletAlias;
use crate::TabletHealth;
use crate::TabletType;
use crate::Target;

pub(crate) const CELL: &str = "zone1";

/// Shard layouts that show up while splitting or merging
pub(crate) const SHARD_LAYOUTS: &[&[&str]] = &[
    &["-"],
    &["-", "-80", "80-"],
    &["-80", "80-"],
    &["-80", "80-", "-40", "40-80", "80-c0", "c0-"],
    &["-40", "40-80", "80-c0", "c0-"],
    &["0"],
];

pub(crate) fn primary_target(
    keyspace: &str,
    shard: &str,
) -> Target {
    Target::new(CELL, keyspace, shard, TabletType::Primary)
}

/// A primary shard; `reparented_at != 0` also records a primary tablet.
pub(crate) fn shard_state(
    keyspace: &str,
    shard: &str,
    serving: bool,
    reparented_at: i64,
) -> ShardState {
    let mut state = ShardState::new(primary_target(keyspace, shard));
    state.serving = serving;
    if reparented_at != 0 {
        state.externally_reparented = reparented_at;
        state.current_primary = Some(TabletAlias::new(CELL, 100));
    }
    state
}

pub(crate) fn keyspace_state(
    keyspace: &str,
    shards: Vec<ShardState>,
    consistent: bool,
) -> KeyspaceState {
    KeyspaceState::from_shards(CELL, keyspace, broadcaster(), shards, consistent)
}

pub(crate) fn broadcaster() -> Arc<EventBroadcaster> {
    Arc::new(EventBroadcaster::new())
}

/// Serving keyspace with identical primary and replica partitions
pub(crate) fn srv_keyspace(shards: &[&str]) -> SrvKeyspace {
    SrvKeyspace {
        partitions: vec![
            KeyspacePartition::new(TabletType::Primary, shards),
            KeyspacePartition::new(TabletType::Replica, shards),
        ],
        served_from: vec![],
    }
}

pub(crate) fn primary_health(
    keyspace: &str,
    shard: &str,
    uid: u32,
    serving: bool,
    term_start: i64,
) -> TabletHealth {
    TabletHealth {
        target: primary_target(keyspace, shard),
        tablet_alias: TabletAlias::new(CELL, uid),
        serving,
        primary_term_start_time: term_start,
    }
}

/// Random shard states over one of the known layouts
pub(crate) fn random_keyspace_state<R: Rng>(
    rng: &mut R,
    keyspace: &str,
) -> KeyspaceState {
    let layout = SHARD_LAYOUTS.choose(rng).copied().unwrap_or(&["-"]);
    let shards = layout
        .iter()
        .map(|shard| {
            let reparented_at = if rng.gen_bool(0.5) { rng.gen_range(1..1_000) } else { 0 };
            shard_state(keyspace, shard, rng.gen_bool(0.5), reparented_at)
        })
        .collect();
    keyspace_state(keyspace, shards, rng.gen_bool(0.2))
}
