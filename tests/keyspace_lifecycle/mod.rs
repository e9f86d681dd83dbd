use topowatch::TabletAlias;

use crate::common::*;

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_split_is_reported_as_resharding_until_cutover() {
    let cluster = start_cluster("ks1", &["-"]).await;
    let mut events = cluster.watcher.subscribe();

    // new shards come up while the source stops serving
    cluster.hc.publish(health("ks1", "-80", 200, true, 5)).await;
    cluster.hc.publish(health("ks1", "80-", 201, true, 5)).await;
    cluster.hc.publish(health("ks1", "-", 100, false, 1)).await;

    let watcher = cluster.watcher.clone();
    eventually(move || watcher.target_is_being_resharded(&primary("ks1", "-"))).await;
    assert!(cluster.watcher.primary_is_not_serving(&primary("ks1", "-")).is_none());

    cluster.topo.update_srv_keyspace(CELL, "ks1", primary_only(&["-80", "80-"])).unwrap();

    let event = tokio::time::timeout(SETTLE_TIMEOUT, events.recv())
        .await
        .unwrap()
        .expect("event after cutover");
    let shards: Vec<&str> = event.shards.iter().map(|s| s.target.shard.as_str()).collect();
    assert_eq!(event.keyspace, "ks1");
    assert_eq!(shards, vec!["-80", "80-"]);
    assert!(event.shards.iter().all(|s| s.serving));

    assert!(!cluster.watcher.target_is_being_resharded(&primary("ks1", "-")));
    assert_eq!(cluster.watcher.get_serving_keyspaces(), vec!["ks1".to_string()]);
    cluster.watcher.close();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_primary_failover_is_reported_as_primary_down() {
    let cluster = start_cluster("commerce", &["-"]).await;
    let mut events = cluster.watcher.subscribe();

    cluster.hc.publish(health("commerce", "-", 100, false, 1)).await;

    let watcher = cluster.watcher.clone();
    eventually(move || watcher.primary_is_not_serving(&primary("commerce", "-")).is_some()).await;
    let down = cluster
        .watcher
        .primary_is_not_serving(&primary("commerce", "-"))
        .unwrap();
    assert_eq!(down.primary, TabletAlias::new(CELL, 100));
    assert!(!cluster.watcher.target_is_being_resharded(&primary("commerce", "-")));

    // a newer term takes over
    cluster.hc.publish(health("commerce", "-", 101, true, 2)).await;

    let event = tokio::time::timeout(SETTLE_TIMEOUT, events.recv())
        .await
        .unwrap()
        .expect("event after failover");
    assert_eq!(event.shards.len(), 1);
    assert_eq!(event.shards[0].tablet, Some(TabletAlias::new(CELL, 101)));
    assert!(cluster.watcher.primary_is_not_serving(&primary("commerce", "-")).is_none());
    cluster.watcher.close();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_deleted_keyspace_stops_serving() {
    let cluster = start_cluster("ks1", &["-80", "80-"]).await;

    cluster.topo.delete_srv_keyspace(CELL, "ks1").unwrap();

    let watcher = cluster.watcher.clone();
    eventually(move || watcher.get_serving_keyspaces().is_empty()).await;
    cluster
        .watcher
        .wait_for_consistent_keyspaces(&["ks1".to_string()], SETTLE_TIMEOUT)
        .await
        .unwrap();
    assert_eq!(cluster.topo.keyspace_watch_count(CELL, "ks1"), 0);
    cluster.watcher.close();
}
