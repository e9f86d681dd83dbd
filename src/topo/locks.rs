//! Named locks on topology resources.
//!
//! A [`LockScope`] tracks the locks taken by one logical operation. Locking a
//! resource the scope already holds fails instead of deadlocking on the store.
//! Every acquired lock must be released through [`TopoLockGuard::unlock`],
//! which folds release failures into the caller's own result.
//!
//! ```ignore
//! let scope = locker.begin();
//! let guard = scope.lock(&LockResource::keyspace("ks1"), "Reshard").await?;
//! let mut result = do_work(&scope).await;
//! guard.unlock(&mut result).await;
//! result?;
//! ```

use std::collections::HashMap;
use std::env;
use std::fmt;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use chrono::SecondsFormat;
use chrono::Utc;
use parking_lot::Mutex;
use serde::Deserialize;
use serde::Serialize;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::error;
use tracing::info;
use tracing::info_span;
use tracing::warn;
use tracing::Instrument;
use tracing::Span;

use super::LockBackend;
use super::LockDescriptor;
use crate::constants::KEYSPACES_PATH;
use crate::constants::LOCK_STATUS_DONE;
use crate::constants::LOCK_STATUS_ERROR_PREFIX;
use crate::constants::LOCK_STATUS_RUNNING;
use crate::constants::NAMED_LOCKS_PATH;
use crate::constants::ROUTING_RULES_PATH;
use crate::constants::SHARDS_PATH;
use crate::constants::UNKNOWN_IDENTITY;
use crate::utils::spawn_task;
use crate::utils::task_with_timeout;
use crate::LockError;
use crate::Result;
use crate::TopoConfig;
use crate::TopoError;

/// Payload written into the store alongside a lock
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Lock {
    pub action: String,
    pub host_name: String,
    pub user_name: String,
    /// RFC 3339, UTC
    pub time: String,
    pub status: String,
}

impl Lock {
    pub fn new(action: impl Into<String>) -> Self {
        Self {
            action: action.into(),
            host_name: identity_from_env("HOSTNAME"),
            user_name: identity_from_env("USER"),
            time: Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
            status: LOCK_STATUS_RUNNING.to_string(),
        }
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

fn identity_from_env(var: &str) -> String {
    env::var(var)
        .ok()
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| UNKNOWN_IDENTITY.to_string())
}

/// Lockable topology resource
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum LockResource {
    Keyspace(String),
    Shard { keyspace: String, shard: String },
    RoutingRules(String),
    Named(String),
}

impl LockResource {
    pub fn keyspace(keyspace: impl Into<String>) -> Self {
        LockResource::Keyspace(keyspace.into())
    }

    pub fn shard(
        keyspace: impl Into<String>,
        shard: impl Into<String>,
    ) -> Self {
        LockResource::Shard {
            keyspace: keyspace.into(),
            shard: shard.into(),
        }
    }

    pub fn routing_rules(name: impl Into<String>) -> Self {
        LockResource::RoutingRules(name.into())
    }

    pub fn named(name: impl Into<String>) -> Self {
        LockResource::Named(name.into())
    }

    pub fn kind(&self) -> &'static str {
        match self {
            LockResource::Keyspace(_) => "keyspace",
            LockResource::Shard { .. } => "shard",
            LockResource::RoutingRules(_) => "routing rules",
            LockResource::Named(_) => "named",
        }
    }

    pub fn resource_name(&self) -> String {
        match self {
            LockResource::Keyspace(name) | LockResource::RoutingRules(name) | LockResource::Named(name) => {
                name.clone()
            }
            LockResource::Shard { keyspace, shard } => format!("{keyspace}/{shard}"),
        }
    }

    /// Store path of the lock; unique across resource kinds
    pub fn path(&self) -> String {
        match self {
            LockResource::Keyspace(keyspace) => format!("{KEYSPACES_PATH}/{keyspace}"),
            LockResource::Shard { keyspace, shard } => {
                format!("{KEYSPACES_PATH}/{keyspace}/{SHARDS_PATH}/{shard}")
            }
            LockResource::RoutingRules(name) => format!("{ROUTING_RULES_PATH}/{name}"),
            LockResource::Named(name) => format!("{NAMED_LOCKS_PATH}/{name}"),
        }
    }
}

impl fmt::Display for LockResource {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        write!(f, "{} {}", self.kind(), self.resource_name())
    }
}

/// Entry point for lock scopes over one store
#[derive(Clone)]
pub struct TopoLocker {
    backend: Arc<dyn LockBackend>,
    lock_timeout: Duration,
    remote_operation_timeout: Duration,
}

impl TopoLocker {
    pub fn new(
        backend: Arc<dyn LockBackend>,
        config: &TopoConfig,
    ) -> Self {
        Self {
            backend,
            lock_timeout: config.lock_timeout(),
            remote_operation_timeout: config.remote_operation_timeout(),
        }
    }

    /// Starts a new logical operation with an empty set of held locks.
    pub fn begin(&self) -> LockScope {
        LockScope {
            locker: self.clone(),
            held: Arc::new(Mutex::new(HashMap::new())),
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }
}

struct HeldLock {
    id: u64,
    resource: LockResource,
    descriptor: Arc<dyn LockDescriptor>,
    record: Lock,
}

enum LockSlot {
    /// Path reserved while the store acquire is in flight
    Acquiring,
    Held(HeldLock),
}

/// Drops the reservation of a path unless the acquire completed.
struct Reservation<'a> {
    held: &'a Mutex<HashMap<String, LockSlot>>,
    path: &'a str,
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        let mut held = self.held.lock();
        if matches!(held.get(self.path), Some(LockSlot::Acquiring)) {
            held.remove(self.path);
        }
    }
}

/// Locks held by one logical operation, keyed by store path.
///
/// Clones share the same set.
#[derive(Clone)]
pub struct LockScope {
    locker: TopoLocker,
    held: Arc<Mutex<HashMap<String, LockSlot>>>,
    next_id: Arc<AtomicU64>,
}

impl LockScope {
    /// Waits (up to the configured lock timeout) for the store lock.
    pub async fn lock(
        &self,
        resource: &LockResource,
        action: &str,
    ) -> Result<TopoLockGuard> {
        self.internal_lock(resource, action, true).await
    }

    /// Fails with `NodeExists` when someone else holds the store lock.
    pub async fn try_lock(
        &self,
        resource: &LockResource,
        action: &str,
    ) -> Result<TopoLockGuard> {
        self.internal_lock(resource, action, false).await
    }

    /// Verifies this scope holds `resource` and the store still agrees.
    pub async fn check_locked(
        &self,
        resource: &LockResource,
    ) -> Result<()> {
        let descriptor = match self.held.lock().get(&resource.path()) {
            Some(LockSlot::Held(lock)) => lock.descriptor.clone(),
            _ => {
                return Err(LockError::NotLocked {
                    kind: resource.kind(),
                    resource: resource.resource_name(),
                }
                .into())
            }
        };

        task_with_timeout(
            &format!("check lock {}", resource.path()),
            self.locker.remote_operation_timeout,
            descriptor.check(),
        )
        .await
    }

    pub fn is_locked(
        &self,
        resource: &LockResource,
    ) -> bool {
        matches!(self.held.lock().get(&resource.path()), Some(LockSlot::Held(_)))
    }

    /// Records currently held by this scope
    pub fn held_locks(&self) -> Vec<(LockResource, Lock)> {
        self.held
            .lock()
            .values()
            .filter_map(|slot| match slot {
                LockSlot::Held(l) => Some((l.resource.clone(), l.record.clone())),
                LockSlot::Acquiring => None,
            })
            .collect()
    }

    async fn internal_lock(
        &self,
        resource: &LockResource,
        action: &str,
        blocking: bool,
    ) -> Result<TopoLockGuard> {
        let path = resource.path();
        {
            let mut held = self.held.lock();
            if held.contains_key(&path) {
                return Err(LockError::AlreadyHeld {
                    kind: resource.kind(),
                    resource: resource.resource_name(),
                }
                .into());
            }
            held.insert(path.clone(), LockSlot::Acquiring);
        }
        let reservation = Reservation {
            held: &self.held,
            path: &path,
        };

        info!("Locking {} for action {}", resource, action);
        let record = Lock::new(action);
        let contents = record.to_json()?;

        let span = info_span!("TopoServer.Lock", action = %action, path = %path);
        let backend = self.locker.backend.clone();
        let acquire = async {
            if blocking {
                backend.lock(&path, &contents).await
            } else {
                backend.try_lock(&path, &contents).await
            }
        };

        let lock_timeout = self.locker.lock_timeout;
        let descriptor = match timeout(lock_timeout, acquire).instrument(span.clone()).await {
            Ok(Ok(descriptor)) => descriptor,
            Ok(Err(e)) => {
                warn!("Failed to lock {}: {}", resource, e);
                return Err(e);
            }
            Err(_) => {
                warn!("Timed out locking {} after {:?}", resource, lock_timeout);
                return Err(TopoError::DeadlineExceeded {
                    operation: format!("lock {path}"),
                    timeout: lock_timeout,
                }
                .into());
            }
        };

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.held.lock().insert(
            path.clone(),
            LockSlot::Held(HeldLock {
                id,
                resource: resource.clone(),
                descriptor: Arc::from(descriptor),
                record,
            }),
        );
        drop(reservation);

        Ok(TopoLockGuard {
            scope: self.clone(),
            resource: resource.clone(),
            id,
            released: AtomicBool::new(false),
            span,
        })
    }

    /// Removes the lock from the scope and starts the store release.
    ///
    /// Nothing here awaits: once this returns the lock is gone from the scope
    /// and the store call runs on a detached task bounded by the remote
    /// operation timeout, whatever happens to the caller.
    fn start_release(
        &self,
        resource: &LockResource,
        id: u64,
        failure: Option<String>,
        parent: &Span,
    ) -> Result<JoinHandle<Result<()>>> {
        let handle = Handle::try_current()
            .map_err(|e| TopoError::Interrupted(format!("no runtime to release {resource}: {e}")))?;

        let path = resource.path();
        let mut lock = {
            let mut held = self.held.lock();
            match held.remove(&path) {
                Some(LockSlot::Held(lock)) if lock.id == id => lock,
                other => {
                    // put back a lock re-acquired (or being acquired) by a later guard
                    if let Some(slot) = other {
                        held.insert(path, slot);
                    }
                    return Err(LockError::DoubleUnlock {
                        kind: resource.kind(),
                        resource: resource.resource_name(),
                    }
                    .into());
                }
            }
        };

        lock.record.status = match failure {
            Some(msg) => format!("{LOCK_STATUS_ERROR_PREFIX}{msg}"),
            None => LOCK_STATUS_DONE.to_string(),
        };
        info!("Unlocking {} for action {} with status {}", resource, lock.record.action, lock.record.status);

        let deadline = self.locker.remote_operation_timeout;
        let descriptor = lock.descriptor;
        let span = info_span!(parent: parent, "TopoServer.Unlock", path = %path);
        Ok(handle.spawn(
            async move {
                task_with_timeout(&format!("unlock {path}"), deadline, descriptor.unlock()).await
            }
            .instrument(span),
        ))
    }
}

/// Proof of a held lock. Release it with [`TopoLockGuard::unlock`].
///
/// A guard dropped without unlocking releases the lock in the background and
/// logs a warning.
pub struct TopoLockGuard {
    scope: LockScope,
    resource: LockResource,
    id: u64,
    released: AtomicBool,
    span: Span,
}

impl fmt::Debug for TopoLockGuard {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.debug_struct("TopoLockGuard")
            .field("resource", &self.resource)
            .field("id", &self.id)
            .field("released", &self.released.load(Ordering::Acquire))
            .finish()
    }
}

impl TopoLockGuard {
    pub fn resource(&self) -> &LockResource {
        &self.resource
    }

    pub async fn check(&self) -> Result<()> {
        self.scope.check_locked(&self.resource).await
    }

    /// Releases the lock, recording the outcome of `result` in the lock status.
    ///
    /// A release failure replaces an `Ok` result. An existing error is never
    /// masked; the release failure is only logged in that case. Dropping the
    /// returned future does not stop the release.
    pub async fn unlock<T>(
        &self,
        result: &mut Result<T>,
    ) {
        let failure = result.as_ref().err().map(|e| e.to_string());
        let started = self.scope.start_release(&self.resource, self.id, failure, &self.span);
        self.released.store(true, Ordering::Release);

        let released = match started {
            Ok(task) => match task.await {
                Ok(released) => released,
                Err(e) => Err(TopoError::Interrupted(format!("unlock task failed: {e}")).into()),
            },
            Err(e) => Err(e),
        };

        let Err(e) = released else {
            return;
        };

        if matches!(e, crate::Error::Lock(LockError::DoubleUnlock { .. })) {
            error!("{}", e);
        } else if result.is_err() {
            warn!("Failed to unlock {} after error: {}", self.resource, e);
        }
        if result.is_ok() {
            *result = Err(e);
        }
    }
}

impl Drop for TopoLockGuard {
    fn drop(&mut self) {
        if self.released.load(Ordering::Acquire) {
            return;
        }

        warn!("Lock on {} dropped without unlock, releasing in background", self.resource);
        let failure = Some("lock guard dropped".to_string());
        let task = match self.scope.start_release(&self.resource, self.id, failure, &self.span) {
            Ok(task) => task,
            Err(e) => {
                error!("Cannot release {}: {}", self.resource, e);
                return;
            }
        };

        spawn_task(
            &format!("background unlock of {}", self.resource),
            async move {
                match task.await {
                    Ok(released) => released,
                    Err(e) => Err(TopoError::Interrupted(format!("unlock task failed: {e}")).into()),
                }
            },
            None,
        );
    }
}
