use std::sync::Arc;
use std::time::Duration;

use topowatch::FakeHealthCheck;
use topowatch::KeyspaceEventWatcher;
use topowatch::KeyspacePartition;
use topowatch::MemoryTopo;
use topowatch::SrvKeyspace;
use topowatch::TabletAlias;
use topowatch::TabletHealth;
use topowatch::TabletType;
use topowatch::Target;
use topowatch::WatcherConfig;

pub const CELL: &str = "zone1";

// generous bound for state to settle on a loaded CI machine
pub const SETTLE_TIMEOUT: Duration = Duration::from_secs(10);

pub fn primary_only(shards: &[&str]) -> SrvKeyspace {
    SrvKeyspace {
        partitions: vec![
            KeyspacePartition::new(TabletType::Primary, shards),
            KeyspacePartition::new(TabletType::Replica, shards),
        ],
        served_from: vec![],
    }
}

pub fn primary(
    keyspace: &str,
    shard: &str,
) -> Target {
    Target::new(CELL, keyspace, shard, TabletType::Primary)
}

pub fn health(
    keyspace: &str,
    shard: &str,
    uid: u32,
    serving: bool,
    term_start: i64,
) -> TabletHealth {
    TabletHealth {
        target: primary(keyspace, shard),
        tablet_alias: TabletAlias::new(CELL, uid),
        serving,
        primary_term_start_time: term_start,
    }
}

pub struct Cluster {
    pub topo: MemoryTopo,
    pub hc: Arc<FakeHealthCheck>,
    pub watcher: Arc<KeyspaceEventWatcher>,
}

/// Starts a watcher over `keyspace` laid out as `shards`, with every primary serving.
pub async fn start_cluster(
    keyspace: &str,
    shards: &[&str],
) -> Cluster {
    let topo = MemoryTopo::new(&[CELL]);
    topo.update_srv_keyspace(CELL, keyspace, primary_only(shards)).unwrap();

    let config = WatcherConfig {
        consistency_check_interval_ms: 10,
        health_check_buffer_size: 128,
        ..WatcherConfig::default()
    };
    let hc = Arc::new(FakeHealthCheck::from_config(&config));
    let watcher = KeyspaceEventWatcher::new(Arc::new(topo.clone()), hc.clone(), CELL, config);
    watcher.start().await.unwrap();

    for (i, shard) in shards.iter().enumerate() {
        hc.publish(health(keyspace, shard, 100 + i as u32, true, 1)).await;
    }
    watcher
        .wait_for_consistent_keyspaces(&[keyspace.to_string()], SETTLE_TIMEOUT)
        .await
        .unwrap();

    Cluster { topo, hc, watcher }
}

pub async fn eventually(condition: impl Fn() -> bool) {
    let reached = tokio::time::timeout(SETTLE_TIMEOUT, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert!(reached.is_ok(), "condition not reached in time");
}
