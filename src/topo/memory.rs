//! In-process topology store.
//!
//! Backs tests and single-process deployments. Watches are delivered
//! synchronously by the writer, so each watcher sees the changes of one node
//! in write order.

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::debug;
use tracing::trace;

use super::LockBackend;
use super::LockDescriptor;
use super::SrvKeyspace;
use super::SrvTopoServer;
use super::SrvVSchema;
use super::WatchCallback;
use super::WatchHandle;
use super::WatchSlot;
use super::WatchSubscription;
use crate::constants::KEYSPACES_PATH;
use crate::constants::SRV_KEYSPACE_FILE;
use crate::constants::SRV_VSCHEMA_FILE;
use crate::LockError;
use crate::Result;
use crate::TopoConfig;
use crate::TopoError;

#[derive(Clone)]
pub struct MemoryTopo {
    inner: Arc<MemoryTopoInner>,
}

struct MemoryTopoInner {
    cells: Mutex<BTreeMap<String, CellData>>,
    locks: Mutex<HashMap<String, LockEntry>>,
    lock_released: Notify,
    next_lock_id: AtomicU64,
    lock_ttl: Option<Duration>,
}

#[derive(Default)]
struct CellData {
    srv_keyspaces: BTreeMap<String, Arc<SrvKeyspace>>,
    srv_vschema: Option<Arc<SrvVSchema>>,
    keyspace_watches: HashMap<String, Vec<Arc<WatchSlot<SrvKeyspace>>>>,
    vschema_watches: Vec<Arc<WatchSlot<SrvVSchema>>>,
}

struct LockEntry {
    id: u64,
    contents: String,
    expires_at: Option<Instant>,
}

impl LockEntry {
    fn is_expired(
        &self,
        now: Instant,
    ) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

fn srv_keyspace_path(
    cell: &str,
    keyspace: &str,
) -> String {
    format!("{cell}/{KEYSPACES_PATH}/{keyspace}/{SRV_KEYSPACE_FILE}")
}

fn srv_vschema_path(cell: &str) -> String {
    format!("{cell}/{SRV_VSCHEMA_FILE}")
}

impl MemoryTopo {
    pub fn new(cells: &[&str]) -> Self {
        Self::with_lock_ttl(cells, None)
    }

    /// Store whose locks carry the lease configured by `lock_ttl_ms`
    pub fn from_config(
        cells: &[&str],
        config: &TopoConfig,
    ) -> Self {
        Self::with_lock_ttl(cells, config.lock_ttl())
    }

    /// Locks expire `ttl` after they were taken unless released earlier.
    pub fn with_lock_ttl(
        cells: &[&str],
        ttl: Option<Duration>,
    ) -> Self {
        let cells = cells.iter().map(|c| (c.to_string(), CellData::default())).collect();
        Self {
            inner: Arc::new(MemoryTopoInner {
                cells: Mutex::new(cells),
                locks: Mutex::new(HashMap::new()),
                lock_released: Notify::new(),
                next_lock_id: AtomicU64::new(1),
                lock_ttl: ttl,
            }),
        }
    }

    pub fn add_cell(
        &self,
        cell: &str,
    ) {
        self.inner.cells.lock().entry(cell.to_string()).or_default();
    }

    /// Replaces the serving view of `keyspace` and notifies its watchers.
    pub fn update_srv_keyspace(
        &self,
        cell: &str,
        keyspace: &str,
        srv_keyspace: SrvKeyspace,
    ) -> Result<()> {
        let mut cells = self.inner.cells.lock();
        let data = cells.get_mut(cell).ok_or_else(|| TopoError::NoNode { path: cell.to_string() })?;

        let value = Arc::new(srv_keyspace);
        data.srv_keyspaces.insert(keyspace.to_string(), value.clone());
        debug!("updated {}", srv_keyspace_path(cell, keyspace));

        if let Some(watches) = data.keyspace_watches.get_mut(keyspace) {
            watches.retain(|slot| slot.deliver(Ok(value.clone())));
        }
        Ok(())
    }

    /// Removes the serving view of `keyspace`; watchers receive `NoNode`.
    pub fn delete_srv_keyspace(
        &self,
        cell: &str,
        keyspace: &str,
    ) -> Result<()> {
        let path = srv_keyspace_path(cell, keyspace);
        let mut cells = self.inner.cells.lock();
        let data = cells.get_mut(cell).ok_or_else(|| TopoError::NoNode { path: cell.to_string() })?;

        if data.srv_keyspaces.remove(keyspace).is_none() {
            return Err(TopoError::NoNode { path }.into());
        }
        debug!("deleted {path}");

        if let Some(watches) = data.keyspace_watches.get_mut(keyspace) {
            watches.retain(|slot| slot.deliver(Err(TopoError::NoNode { path: path.clone() })));
        }
        Ok(())
    }

    pub fn update_srv_vschema(
        &self,
        cell: &str,
        vschema: SrvVSchema,
    ) -> Result<()> {
        let mut cells = self.inner.cells.lock();
        let data = cells.get_mut(cell).ok_or_else(|| TopoError::NoNode { path: cell.to_string() })?;

        let value = Arc::new(vschema);
        data.srv_vschema = Some(value.clone());
        data.vschema_watches.retain(|slot| slot.deliver(Ok(value.clone())));
        Ok(())
    }

    /// Pushes a transient store error to the watchers of `keyspace`.
    pub fn fail_srv_keyspace_watch(
        &self,
        cell: &str,
        keyspace: &str,
        error: TopoError,
    ) {
        let mut cells = self.inner.cells.lock();
        if let Some(watches) = cells.get_mut(cell).and_then(|d| d.keyspace_watches.get_mut(keyspace)) {
            watches.retain(|slot| slot.deliver(Err(error.clone())));
        }
    }

    /// Number of live watches on `keyspace`
    pub fn keyspace_watch_count(
        &self,
        cell: &str,
        keyspace: &str,
    ) -> usize {
        let cells = self.inner.cells.lock();
        cells
            .get(cell)
            .and_then(|d| d.keyspace_watches.get(keyspace))
            .map(|w| w.iter().filter(|s| s.is_active()).count())
            .unwrap_or(0)
    }

    /// Payload stored with the lock at `path`, if currently held
    pub fn lock_contents(
        &self,
        path: &str,
    ) -> Option<String> {
        let now = Instant::now();
        self.inner
            .locks
            .lock()
            .get(path)
            .filter(|entry| !entry.is_expired(now))
            .map(|entry| entry.contents.clone())
    }

    fn try_acquire(
        &self,
        path: &str,
        contents: &str,
    ) -> std::result::Result<MemoryLockDescriptor, Option<Instant>> {
        let now = Instant::now();
        let mut locks = self.inner.locks.lock();
        if let Some(entry) = locks.get(path) {
            if !entry.is_expired(now) {
                // tell the waiter when the current lease runs out
                return Err(entry.expires_at);
            }
            debug!("lock at {path} expired, taking it over");
        }

        let id = self.inner.next_lock_id.fetch_add(1, Ordering::Relaxed);
        locks.insert(
            path.to_string(),
            LockEntry {
                id,
                contents: contents.to_string(),
                expires_at: self.inner.lock_ttl.map(|ttl| now + ttl),
            },
        );
        trace!("lock {id} taken at {path}");

        Ok(MemoryLockDescriptor {
            inner: self.inner.clone(),
            path: path.to_string(),
            id,
        })
    }
}

#[async_trait::async_trait]
impl SrvTopoServer for MemoryTopo {
    async fn get_srv_keyspace_names(
        &self,
        cell: &str,
        _stale_ok: bool,
    ) -> Result<Vec<String>> {
        let cells = self.inner.cells.lock();
        let data = cells.get(cell).ok_or_else(|| TopoError::NoNode { path: cell.to_string() })?;
        Ok(data.srv_keyspaces.keys().cloned().collect())
    }

    async fn get_srv_keyspace(
        &self,
        cell: &str,
        keyspace: &str,
    ) -> Result<Arc<SrvKeyspace>> {
        let cells = self.inner.cells.lock();
        cells
            .get(cell)
            .and_then(|d| d.srv_keyspaces.get(keyspace))
            .cloned()
            .ok_or_else(|| {
                TopoError::NoNode {
                    path: srv_keyspace_path(cell, keyspace),
                }
                .into()
            })
    }

    fn watch_srv_keyspace(
        &self,
        cell: &str,
        keyspace: &str,
        callback: WatchCallback<SrvKeyspace>,
    ) -> WatchSubscription {
        let slot = WatchSlot::new(callback);
        let subscription = slot.subscription();

        let mut cells = self.inner.cells.lock();
        let data = cells.entry(cell.to_string()).or_default();
        let current = data.srv_keyspaces.get(keyspace).cloned().ok_or_else(|| TopoError::NoNode {
            path: srv_keyspace_path(cell, keyspace),
        });

        if slot.deliver(current) {
            data.keyspace_watches.entry(keyspace.to_string()).or_default().push(slot);
        }
        subscription
    }

    fn watch_srv_vschema(
        &self,
        cell: &str,
        callback: WatchCallback<SrvVSchema>,
    ) -> WatchSubscription {
        let slot = WatchSlot::new(callback);
        let subscription = slot.subscription();

        let mut cells = self.inner.cells.lock();
        let data = cells.entry(cell.to_string()).or_default();
        let current = data.srv_vschema.clone().ok_or_else(|| TopoError::NoNode {
            path: srv_vschema_path(cell),
        });

        if slot.deliver(current) {
            data.vschema_watches.push(slot);
        }
        subscription
    }
}

#[async_trait::async_trait]
impl LockBackend for MemoryTopo {
    async fn lock(
        &self,
        path: &str,
        contents: &str,
    ) -> Result<Box<dyn LockDescriptor>> {
        loop {
            let notified = self.inner.lock_released.notified();
            tokio::pin!(notified);
            // register before checking so a release in between is not missed
            notified.as_mut().enable();

            match self.try_acquire(path, contents) {
                Ok(descriptor) => return Ok(Box::new(descriptor)),
                Err(Some(expires_at)) => {
                    tokio::select! {
                        _ = &mut notified => {}
                        _ = tokio::time::sleep_until(expires_at) => {}
                    }
                }
                Err(None) => notified.await,
            }
        }
    }

    async fn try_lock(
        &self,
        path: &str,
        contents: &str,
    ) -> Result<Box<dyn LockDescriptor>> {
        match self.try_acquire(path, contents) {
            Ok(descriptor) => Ok(Box::new(descriptor)),
            Err(_) => Err(TopoError::NodeExists { path: path.to_string() }.into()),
        }
    }
}

struct MemoryLockDescriptor {
    inner: Arc<MemoryTopoInner>,
    path: String,
    id: u64,
}

#[async_trait::async_trait]
impl LockDescriptor for MemoryLockDescriptor {
    async fn check(&self) -> Result<()> {
        let locks = self.inner.locks.lock();
        match locks.get(&self.path) {
            Some(entry) if entry.id == self.id && !entry.is_expired(Instant::now()) => Ok(()),
            _ => Err(LockError::LockLost {
                path: self.path.clone(),
            }
            .into()),
        }
    }

    async fn unlock(&self) -> Result<()> {
        let released = {
            let mut locks = self.inner.locks.lock();
            match locks.get(&self.path) {
                Some(entry) if entry.id == self.id => {
                    locks.remove(&self.path);
                    true
                }
                _ => false,
            }
        };

        if !released {
            return Err(TopoError::NoNode {
                path: self.path.clone(),
            }
            .into());
        }

        trace!("lock {} released at {}", self.id, self.path);
        self.inner.lock_released.notify_waiters();
        Ok(())
    }
}
