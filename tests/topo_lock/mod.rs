use std::sync::Arc;

use topowatch::LockResource;
use topowatch::MemoryTopo;
use topowatch::Settings;
use topowatch::TopoLocker;

use crate::common::CELL;

fn locker(lock_timeout_ms: u64) -> (MemoryTopo, TopoLocker) {
    let mut settings = Settings::default();
    settings.topo.lock_timeout_ms = lock_timeout_ms;
    let settings = settings.validate().unwrap();

    let topo = MemoryTopo::from_config(&[CELL], &settings.topo);
    let locker = TopoLocker::new(Arc::new(topo.clone()), &settings.topo);
    (topo, locker)
}

#[tokio::test]
async fn test_reshard_workflow_serializes_on_keyspace_lock() {
    let (topo, locker) = locker(5_000);
    let keyspace = LockResource::keyspace("ks1");

    let workflow = locker.begin();
    let guard = workflow.lock(&keyspace, "Reshard").await.unwrap();
    assert!(topo.lock_contents(&keyspace.path()).unwrap().contains("\"Action\": \"Reshard\""));

    let other = locker.begin();
    let contended = other.try_lock(&keyspace, "MoveTables").await.unwrap_err();
    assert!(contended.is_node_exists());

    let again = workflow.lock(&keyspace, "Reshard").await.unwrap_err();
    assert!(again.is_already_held());

    let mut result: topowatch::Result<()> = Ok(());
    guard.unlock(&mut result).await;
    assert!(result.is_ok());

    let guard = other.try_lock(&keyspace, "MoveTables").await.unwrap();
    let mut result: topowatch::Result<()> = Ok(());
    guard.unlock(&mut result).await;
    assert!(result.is_ok());
}

#[tokio::test]
async fn test_blocking_lock_times_out_while_held() {
    let (_topo, locker) = locker(200);
    let shard = LockResource::shard("ks1", "-80");

    let holder = locker.begin();
    let guard = holder.lock(&shard, "PlannedReparentShard").await.unwrap();

    let started = std::time::Instant::now();
    let err = locker.begin().lock(&shard, "EmergencyReparentShard").await.unwrap_err();
    assert!(err.is_deadline_exceeded());
    assert!(started.elapsed() < std::time::Duration::from_secs(5));

    guard.check().await.unwrap();
    let mut result: topowatch::Result<()> = Ok(());
    guard.unlock(&mut result).await;
    assert!(result.is_ok());
}
