use std::sync::Arc;
use std::time::Duration;

use tracing_test::traced_test;

use super::*;
use crate::Error;
use crate::LockError;
use crate::TopoConfig;
use crate::TopoError;

fn config(lock_timeout_ms: u64) -> TopoConfig {
    TopoConfig {
        lock_timeout_ms,
        remote_operation_timeout_ms: 1_000,
        lock_ttl_ms: 0,
    }
}

fn memory_locker(lock_timeout_ms: u64) -> (MemoryTopo, TopoLocker) {
    let topo = MemoryTopo::new(&["zone1"]);
    let locker = TopoLocker::new(Arc::new(topo.clone()), &config(lock_timeout_ms));
    (topo, locker)
}

#[test]
fn test_lock_record_json_uses_pascal_case() {
    let record = Lock::new("Reshard");
    let json = record.to_json().unwrap();

    assert!(json.contains("\"Action\": \"Reshard\""));
    assert!(json.contains("\"Status\": \"Running\""));
    assert!(json.contains("\"HostName\""));
    assert!(json.contains("\"UserName\""));
    // pretty printed
    assert!(json.contains('\n'));
    assert!(chrono::DateTime::parse_from_rfc3339(&record.time).is_ok());
}

#[test]
fn test_resource_paths_do_not_collide_across_kinds() {
    assert_eq!(LockResource::keyspace("ks1").path(), "keyspaces/ks1");
    assert_eq!(LockResource::shard("ks1", "-80").path(), "keyspaces/ks1/shards/-80");
    assert_eq!(LockResource::routing_rules("ks1").path(), "routing_rules/ks1");
    assert_eq!(LockResource::named("ks1").path(), "internal/named_locks/ks1");
    assert_eq!(LockResource::shard("ks1", "-80").resource_name(), "ks1/-80");
}

#[tokio::test]
async fn test_relock_in_same_scope_is_already_held() {
    let (_topo, locker) = memory_locker(3_000);
    let scope = locker.begin();
    let resource = LockResource::routing_rules("ks1");

    let guard = scope.lock(&resource, "first").await.unwrap();
    let err = scope.lock(&resource, "second").await.unwrap_err();
    assert!(err.is_already_held());
    assert!(err.to_string().contains("already held"));

    let mut result: crate::Result<()> = Ok(());
    guard.unlock(&mut result).await;
    assert!(result.is_ok());

    // free again once released
    let guard = scope.lock(&resource, "third").await.unwrap();
    let mut result: crate::Result<()> = Ok(());
    guard.unlock(&mut result).await;
    assert!(result.is_ok());
}

#[tokio::test(start_paused = true)]
async fn test_lock_held_by_other_scope_times_out() {
    let (_topo, locker) = memory_locker(3_000);
    let resource = LockResource::routing_rules("ks1");

    let holder = locker.begin();
    let guard = holder.lock(&resource, "hold").await.unwrap();

    let err = locker.begin().lock(&resource, "wait").await.unwrap_err();
    assert!(err.is_deadline_exceeded());
    assert!(err.to_string().contains("deadline exceeded"));

    let mut result: crate::Result<()> = Ok(());
    guard.unlock(&mut result).await;
    assert!(result.is_ok());
}

#[tokio::test]
async fn test_try_lock_reports_node_exists() {
    let (_topo, locker) = memory_locker(3_000);
    let resource = LockResource::keyspace("ks1");

    let guard = locker.begin().lock(&resource, "hold").await.unwrap();
    let err = locker.begin().try_lock(&resource, "probe").await.unwrap_err();
    assert!(err.is_node_exists());

    let mut result: crate::Result<()> = Ok(());
    guard.unlock(&mut result).await;
    assert!(locker.begin().try_lock(&resource, "probe").await.is_ok());
}

#[tokio::test]
async fn test_waiting_scope_acquires_after_release() {
    let (_topo, locker) = memory_locker(3_000);
    let resource = LockResource::shard("ks1", "-80");

    let guard = locker.begin().lock(&resource, "hold").await.unwrap();

    let waiter = {
        let locker = locker.clone();
        let resource = resource.clone();
        tokio::spawn(async move {
            let scope = locker.begin();
            let guard = scope.lock(&resource, "wait").await?;
            let mut result: crate::Result<()> = Ok(());
            guard.unlock(&mut result).await;
            result
        })
    };

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(!waiter.is_finished());

    let mut result: crate::Result<()> = Ok(());
    guard.unlock(&mut result).await;
    assert!(result.is_ok());

    let waited = tokio::time::timeout(Duration::from_secs(2), waiter).await.unwrap().unwrap();
    assert!(waited.is_ok());
}

#[tokio::test]
async fn test_store_holds_lock_record_while_locked() {
    let (topo, locker) = memory_locker(3_000);
    let resource = LockResource::keyspace("ks1");

    let scope = locker.begin();
    let guard = scope.lock(&resource, "Reshard").await.unwrap();

    let contents = topo.lock_contents("keyspaces/ks1").unwrap();
    let record: Lock = serde_json::from_str(&contents).unwrap();
    assert_eq!(record.action, "Reshard");
    assert_eq!(record.status, "Running");

    let held = scope.held_locks();
    assert_eq!(held.len(), 1);
    assert_eq!(held[0].0, resource);

    let mut result: crate::Result<()> = Ok(());
    guard.unlock(&mut result).await;
    assert!(topo.lock_contents("keyspaces/ks1").is_none());
    assert!(!scope.is_locked(&resource));
}

#[tokio::test]
async fn test_check_locked() {
    let (_topo, locker) = memory_locker(3_000);
    let scope = locker.begin();
    let resource = LockResource::keyspace("ks1");

    let err = scope.check_locked(&resource).await.unwrap_err();
    assert!(matches!(err, Error::Lock(LockError::NotLocked { .. })));

    let guard = scope.lock(&resource, "check").await.unwrap();
    assert!(scope.check_locked(&resource).await.is_ok());
    assert!(guard.check().await.is_ok());

    let mut result: crate::Result<()> = Ok(());
    guard.unlock(&mut result).await;
    assert!(scope.check_locked(&resource).await.is_err());
}

#[tokio::test(start_paused = true)]
async fn test_check_locked_detects_expired_lease() {
    let topo = MemoryTopo::with_lock_ttl(&["zone1"], Some(Duration::from_secs(10)));
    let locker = TopoLocker::new(Arc::new(topo.clone()), &config(3_000));
    let scope = locker.begin();
    let resource = LockResource::keyspace("ks1");

    let guard = scope.lock(&resource, "lease").await.unwrap();
    tokio::time::advance(Duration::from_secs(11)).await;

    let err = guard.check().await.unwrap_err();
    assert!(matches!(err, Error::Lock(LockError::LockLost { .. })));

    // someone else can take it over now
    assert!(locker.begin().try_lock(&resource, "takeover").await.is_ok());

    let mut result: crate::Result<()> = Ok(());
    guard.unlock(&mut result).await;
    assert!(result.is_err());
}

#[tokio::test]
async fn test_double_unlock_is_reported() {
    let (_topo, locker) = memory_locker(3_000);
    let scope = locker.begin();
    let resource = LockResource::named("migration");

    let guard = scope.lock(&resource, "once").await.unwrap();
    let mut result: crate::Result<()> = Ok(());
    guard.unlock(&mut result).await;
    assert!(result.is_ok());

    guard.unlock(&mut result).await;
    let err = result.unwrap_err();
    assert!(matches!(err, Error::Lock(LockError::DoubleUnlock { .. })));
    assert!(err.to_string().contains("multiple times"));
}

#[tokio::test]
async fn test_stale_guard_does_not_release_newer_lock() {
    let (topo, locker) = memory_locker(3_000);
    let scope = locker.begin();
    let resource = LockResource::named("migration");

    let first = scope.lock(&resource, "first").await.unwrap();
    let mut result: crate::Result<()> = Ok(());
    first.unlock(&mut result).await;

    let second = scope.lock(&resource, "second").await.unwrap();
    first.unlock(&mut result).await;
    assert!(result.is_err());

    assert!(scope.is_locked(&resource));
    assert!(topo.lock_contents("internal/named_locks/migration").is_some());

    let mut result: crate::Result<()> = Ok(());
    second.unlock(&mut result).await;
    assert!(result.is_ok());
}

#[tokio::test]
#[traced_test]
async fn test_double_unlock_keeps_caller_error() {
    let (_topo, locker) = memory_locker(3_000);
    let scope = locker.begin();
    let resource = LockResource::named("migration");

    let guard = scope.lock(&resource, "once").await.unwrap();
    let mut ok: crate::Result<()> = Ok(());
    guard.unlock(&mut ok).await;

    let mut result: crate::Result<()> = Err(TopoError::Unavailable("work failed".into()).into());
    guard.unlock(&mut result).await;
    assert!(matches!(result, Err(Error::Topo(TopoError::Unavailable(_)))));
    assert!(logs_contain("multiple times"));
}

fn failing_unlock_backend() -> MockLockBackend {
    let mut backend = MockLockBackend::new();
    backend.expect_lock().returning(|_, _| {
        let mut descriptor = MockLockDescriptor::new();
        descriptor
            .expect_unlock()
            .returning(|| Err(TopoError::Unavailable("store went away".into()).into()));
        Ok(Box::new(descriptor))
    });
    backend
}

#[tokio::test]
async fn test_unlock_failure_replaces_ok_result() {
    let locker = TopoLocker::new(Arc::new(failing_unlock_backend()), &config(3_000));
    let scope = locker.begin();

    let guard = scope.lock(&LockResource::keyspace("ks1"), "work").await.unwrap();
    let mut result: crate::Result<u32> = Ok(7);
    guard.unlock(&mut result).await;

    assert!(matches!(result, Err(Error::Topo(TopoError::Unavailable(_)))));
}

#[tokio::test]
#[traced_test]
async fn test_unlock_failure_does_not_mask_caller_error() {
    let locker = TopoLocker::new(Arc::new(failing_unlock_backend()), &config(3_000));
    let scope = locker.begin();

    let guard = scope.lock(&LockResource::keyspace("ks1"), "work").await.unwrap();
    let mut result: crate::Result<u32> = Err(TopoError::Interrupted("work cancelled".into()).into());
    guard.unlock(&mut result).await;

    let err = result.unwrap_err();
    assert!(err.to_string().contains("work cancelled"));
    assert!(logs_contain("store went away"));
}

#[tokio::test]
async fn test_lock_released_after_failed_work() {
    let mut backend = MockLockBackend::new();
    backend.expect_lock().returning(|_, contents| {
        let record: Lock = serde_json::from_str(contents).unwrap();
        assert_eq!(record.status, "Running");
        let mut descriptor = MockLockDescriptor::new();
        descriptor.expect_unlock().times(1).returning(|| Ok(()));
        Ok(Box::new(descriptor))
    });
    let locker = TopoLocker::new(Arc::new(backend), &config(3_000));
    let scope = locker.begin();
    let resource = LockResource::keyspace("ks1");

    let guard = scope.lock(&resource, "work").await.unwrap();
    let mut result: crate::Result<()> = Err(TopoError::Unavailable("boom".into()).into());
    guard.unlock(&mut result).await;

    assert!(!scope.is_locked(&resource));
}

#[tokio::test]
#[traced_test]
async fn test_dropped_guard_releases_in_background() {
    let (_topo, locker) = memory_locker(3_000);
    let resource = LockResource::keyspace("ks1");
    let scope = locker.begin();

    {
        let _guard = scope.lock(&resource, "forgotten").await.unwrap();
    }
    assert!(logs_contain("dropped without unlock"));

    // the background release wakes this waiter
    let other = locker.begin();
    let guard = tokio::time::timeout(Duration::from_secs(2), other.lock(&resource, "next"))
        .await
        .unwrap()
        .unwrap();
    assert!(!scope.is_locked(&resource));

    let mut result: crate::Result<()> = Ok(());
    guard.unlock(&mut result).await;
    assert!(result.is_ok());
}

async fn wait_until(condition: impl Fn() -> bool) {
    let reached = tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert!(reached.is_ok(), "condition not reached in time");
}

#[tokio::test]
async fn test_cancelled_unlock_still_releases() {
    let (topo, locker) = memory_locker(3_000);
    let scope = locker.begin();
    let held = LockResource::keyspace("a");
    let contended = LockResource::keyspace("b");

    let guard = scope.lock(&held, "work").await.unwrap();
    let other = locker.begin().lock(&contended, "hold").await.unwrap();

    // a sibling of the same scope waits on a lock held elsewhere
    let sibling = {
        let scope = scope.clone();
        let contended = contended.clone();
        tokio::spawn(async move { scope.lock(&contended, "wait").await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(!sibling.is_finished());

    // the unlock future is dropped right after its first poll
    let mut result: crate::Result<()> = Ok(());
    let _ = tokio::time::timeout(Duration::ZERO, guard.unlock(&mut result)).await;
    drop(guard);

    assert!(!scope.is_locked(&held));
    wait_until(|| topo.lock_contents("keyspaces/a").is_none()).await;

    let mut ok: crate::Result<()> = Ok(());
    other.unlock(&mut ok).await;
    let sibling_guard = sibling.await.unwrap().unwrap();
    sibling_guard.unlock(&mut ok).await;
    assert!(ok.is_ok());
}

#[tokio::test]
async fn test_pending_acquire_does_not_block_scope() {
    let (_topo, locker) = memory_locker(3_000);
    let scope = locker.begin();
    let contended = LockResource::shard("ks1", "-80");

    let other = locker.begin().lock(&contended, "hold").await.unwrap();
    let sibling = {
        let scope = scope.clone();
        let contended = contended.clone();
        tokio::spawn(async move { scope.lock(&contended, "wait").await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;

    // the in-flight acquire reserves its path only
    let err = scope.try_lock(&contended, "again").await.unwrap_err();
    assert!(err.is_already_held());
    assert!(!scope.is_locked(&contended));

    let free = tokio::time::timeout(Duration::from_millis(500), scope.lock(&LockResource::shard("ks1", "80-"), "free"))
        .await
        .unwrap()
        .unwrap();

    let mut result: crate::Result<()> = Ok(());
    free.unlock(&mut result).await;
    other.unlock(&mut result).await;
    let sibling_guard = sibling.await.unwrap().unwrap();
    sibling_guard.unlock(&mut result).await;
    assert!(result.is_ok());
}

#[tokio::test(start_paused = true)]
async fn test_timed_out_acquire_frees_reservation() {
    let (_topo, locker) = memory_locker(100);
    let resource = LockResource::keyspace("ks1");
    let holder = locker.begin().lock(&resource, "hold").await.unwrap();

    let scope = locker.begin();
    let err = scope.lock(&resource, "wait").await.unwrap_err();
    assert!(err.is_deadline_exceeded());

    let mut result: crate::Result<()> = Ok(());
    holder.unlock(&mut result).await;
    let guard = scope.lock(&resource, "retry").await.unwrap();
    guard.unlock(&mut result).await;
    assert!(result.is_ok());
}

#[tokio::test]
#[traced_test]
async fn test_double_unlock_is_logged_when_result_was_ok() {
    let (_topo, locker) = memory_locker(3_000);
    let scope = locker.begin();
    let resource = LockResource::named("migration");

    let guard = scope.lock(&resource, "once").await.unwrap();
    let mut result: crate::Result<()> = Ok(());
    guard.unlock(&mut result).await;
    assert!(!logs_contain("multiple times"));

    guard.unlock(&mut result).await;
    assert!(result.is_err());
    assert!(logs_contain("multiple times"));
}

#[tokio::test]
async fn test_guard_debug_names_resource() {
    let (_topo, locker) = memory_locker(3_000);
    let guard = locker.begin().lock(&LockResource::keyspace("ks1"), "debug").await.unwrap();

    let rendered = format!("{guard:?}");
    assert!(rendered.contains("ks1"));
    assert!(rendered.contains("released: false"));

    let mut result: crate::Result<()> = Ok(());
    guard.unlock(&mut result).await;
}
