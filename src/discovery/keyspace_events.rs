//! Keyspace event watcher.
//!
//! Tracks every keyspace of one cell through two feeds: topology watches on
//! the serving keyspace graph, and tablet health samples. Each keyspace runs
//! its own [`KeyspaceState`]; whenever one becomes consistent again an event
//! is broadcast to all subscribers.
//!
//! Routers query the watcher while a keyspace is inconsistent to tell a
//! resharding cut-over ([`KeyspaceEventWatcher::target_is_being_resharded`])
//! from a failed primary ([`KeyspaceEventWatcher::primary_is_not_serving`]).

use std::collections::BTreeMap;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwapOption;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Deserialize;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TryRecvError;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::instrument;
use tracing::warn;

use super::HealthCheck;
use super::KeyspaceState;
use super::MoveTablesState;
use super::PrimaryNotServing;
use super::TabletHealth;
use crate::utils::spawn_task;
use crate::utils::task_with_timeout;
use crate::Result;
use crate::SrvTopoServer;
use crate::SrvVSchema;
use crate::TabletAlias;
use crate::TabletType;
use crate::Target;
use crate::TopoError;
use crate::WatchSubscription;
use crate::WatcherConfig;

/// Serving state of one shard at the time of an event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardEvent {
    /// Primary tablet, when one was observed
    pub tablet: Option<TabletAlias>,
    pub target: Target,
    pub serving: bool,
}

/// Broadcast whenever a keyspace becomes consistent
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyspaceEvent {
    pub cell: String,
    pub keyspace: String,
    pub shards: Vec<ShardEvent>,
    pub move_tables_state: MoveTablesState,
}

pub type SubscriptionId = u64;

/// Receiving end of a subscription
#[derive(Debug)]
pub struct KeyspaceEventSubscription {
    id: SubscriptionId,
    receiver: mpsc::UnboundedReceiver<KeyspaceEvent>,
}

impl KeyspaceEventSubscription {
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    /// Next event; `None` once unsubscribed (after draining) or the watcher closed.
    pub async fn recv(&mut self) -> Option<KeyspaceEvent> {
        self.receiver.recv().await
    }

    /// `TryRecvError::Empty` while idle, `TryRecvError::Disconnected` once
    /// unsubscribed (after draining) or the watcher closed.
    pub fn try_recv(&mut self) -> std::result::Result<KeyspaceEvent, TryRecvError> {
        self.receiver.try_recv()
    }

    pub fn into_stream(self) -> UnboundedReceiverStream<KeyspaceEvent> {
        UnboundedReceiverStream::new(self.receiver)
    }
}

/// Fan-out of keyspace events.
///
/// Every subscriber owns an unbounded queue, so a broadcast never waits on a
/// slow reader. Senders live in one map guarded by a mutex; broadcasting and
/// unsubscribing serialize on it.
pub(crate) struct EventBroadcaster {
    subscribers: Mutex<BTreeMap<SubscriptionId, mpsc::UnboundedSender<KeyspaceEvent>>>,
    next_id: AtomicU64,
    closed: AtomicBool,
}

impl EventBroadcaster {
    pub(crate) fn new() -> Self {
        Self {
            subscribers: Mutex::new(BTreeMap::new()),
            next_id: AtomicU64::new(1),
            closed: AtomicBool::new(false),
        }
    }

    pub(crate) fn subscribe(&self) -> KeyspaceEventSubscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);

        let mut subscribers = self.subscribers.lock();
        // a closed broadcaster hands out streams that end immediately
        if !self.closed.load(Ordering::Acquire) {
            subscribers.insert(id, tx);
        }
        KeyspaceEventSubscription { id, receiver: rx }
    }

    pub(crate) fn unsubscribe(
        &self,
        id: SubscriptionId,
    ) -> bool {
        self.subscribers.lock().remove(&id).is_some()
    }

    pub(crate) fn broadcast(
        &self,
        event: KeyspaceEvent,
    ) {
        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|id, tx| {
            if tx.send(event.clone()).is_ok() {
                return true;
            }
            debug!("subscriber {} went away, dropping it", id);
            false
        });
    }

    pub(crate) fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }

    pub(crate) fn close(&self) {
        let mut subscribers = self.subscribers.lock();
        self.closed.store(true, Ordering::Release);
        subscribers.clear();
    }
}

/// Watches the keyspaces of one cell and classifies their outages
pub struct KeyspaceEventWatcher {
    cell: String,
    config: WatcherConfig,
    ts: Arc<dyn SrvTopoServer>,
    hc: Arc<dyn HealthCheck>,

    keyspaces: DashMap<String, Arc<KeyspaceState>>,
    broadcaster: Arc<EventBroadcaster>,
    vschema: ArcSwapOption<SrvVSchema>,
    vschema_watch: Mutex<Option<WatchSubscription>>,

    shutdown: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl KeyspaceEventWatcher {
    pub fn new(
        ts: Arc<dyn SrvTopoServer>,
        hc: Arc<dyn HealthCheck>,
        cell: impl Into<String>,
        config: WatcherConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            cell: cell.into(),
            config,
            ts,
            hc,
            keyspaces: DashMap::new(),
            broadcaster: Arc::new(EventBroadcaster::new()),
            vschema: ArcSwapOption::empty(),
            vschema_watch: Mutex::new(None),
            shutdown: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        })
    }

    pub fn cell(&self) -> &str {
        &self.cell
    }

    /// Starts the health consumer and the vschema watch, then seeds the
    /// keyspace set from the cell's serving graph.
    ///
    /// A seeding failure is returned, but the feeds keep running and
    /// keyspaces are still picked up as health samples arrive.
    #[instrument(skip(self), fields(cell = %self.cell))]
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        let receiver = self.hc.subscribe();
        let mut tasks = self.tasks.lock();
        spawn_task(
            "health consumer",
            self.clone().run_health_consumer(receiver),
            Some(&mut *tasks),
        );
        drop(tasks);

        let weak = Arc::downgrade(self);
        let subscription = self.ts.watch_srv_vschema(
            &self.cell,
            Box::new(move |update| match weak.upgrade() {
                Some(watcher) => watcher.on_srv_vschema(update),
                None => false,
            }),
        );
        *self.vschema_watch.lock() = Some(subscription);

        self.seed_keyspaces().await
    }

    async fn seed_keyspaces(&self) -> Result<()> {
        let names = task_with_timeout(
            &format!("get keyspace names in cell {}", self.cell),
            self.config.seed_timeout(),
            self.ts.get_srv_keyspace_names(&self.cell, true),
        )
        .await
        .inspect_err(|e| error!("unable to list keyspaces in cell {}: {}", self.cell, e))?;

        info!("seeding {} keyspace(s)", names.len());
        for keyspace in names {
            self.keyspace_state(&keyspace);
        }
        Ok(())
    }

    async fn run_health_consumer(
        self: Arc<Self>,
        mut receiver: mpsc::Receiver<TabletHealth>,
    ) -> Result<()> {
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    debug!("health consumer stopped");
                    return Ok(());
                }
                sample = receiver.recv() => {
                    let Some(health) = sample else {
                        warn!("health check feed closed");
                        return Err(TopoError::Interrupted("health check feed closed".into()).into());
                    };
                    self.process_health_check(&health);
                }
            }
        }
    }

    pub(crate) fn process_health_check(
        &self,
        health: &TabletHealth,
    ) {
        if let Some(kss) = self.keyspace_state(&health.target.keyspace) {
            kss.on_health_check(health);
        }
    }

    fn on_srv_vschema(
        &self,
        update: std::result::Result<Arc<SrvVSchema>, TopoError>,
    ) -> bool {
        match update {
            Ok(vschema) => {
                self.vschema.store(Some(vschema.clone()));
                for kss in self.tracked_keyspaces() {
                    kss.on_srv_vschema(&vschema);
                }
            }
            Err(e) if e.is_no_node() => debug!("no serving vschema in cell {} yet", self.cell),
            Err(e) => warn!("error watching vschema in cell {}: {}", self.cell, e),
        }
        !self.shutdown.is_cancelled()
    }

    fn tracked_keyspaces(&self) -> Vec<Arc<KeyspaceState>> {
        self.keyspaces.iter().map(|entry| entry.value().clone()).collect()
    }

    /// Looks up (or starts tracking) `keyspace`.
    ///
    /// Returns `None` for a keyspace whose serving graph was deleted; its entry
    /// is dropped so the next lookup starts from scratch.
    pub(crate) fn keyspace_state(
        &self,
        keyspace: &str,
    ) -> Option<Arc<KeyspaceState>> {
        let created = match self.keyspaces.entry(keyspace.to_string()) {
            Entry::Occupied(entry) => {
                if !entry.get().is_deleted() {
                    return Some(entry.get().clone());
                }
                let stale = entry.remove();
                stale.cancel_watch();
                return None;
            }
            Entry::Vacant(entry) => {
                if self.shutdown.is_cancelled() {
                    return None;
                }
                let kss = Arc::new(KeyspaceState::new(
                    self.cell.as_str(),
                    keyspace,
                    self.broadcaster.clone(),
                ));
                entry.insert(kss.clone());
                kss
            }
        };

        if let Some(vschema) = self.vschema.load_full() {
            created.on_srv_vschema(&vschema);
        }
        self.watch_keyspace(&created);
        Some(created)
    }

    fn watch_keyspace(
        &self,
        kss: &Arc<KeyspaceState>,
    ) {
        debug!(keyspace = kss.keyspace(), "watching keyspace");
        let weak = Arc::downgrade(kss);
        let subscription = self.ts.watch_srv_keyspace(
            &self.cell,
            kss.keyspace(),
            Box::new(move |update| match weak.upgrade() {
                Some(kss) => {
                    kss.on_srv_keyspace(update);
                    !kss.is_deleted()
                }
                None => false,
            }),
        );
        kss.set_watch(subscription);
    }

    pub fn subscribe(&self) -> KeyspaceEventSubscription {
        self.broadcaster.subscribe()
    }

    /// Safe to call while a broadcast is in progress.
    pub fn unsubscribe(
        &self,
        id: SubscriptionId,
    ) -> bool {
        self.broadcaster.unsubscribe(id)
    }

    pub fn subscriber_count(&self) -> usize {
        self.broadcaster.subscriber_count()
    }

    pub(crate) fn broadcast(
        &self,
        event: KeyspaceEvent,
    ) {
        self.broadcaster.broadcast(event);
    }

    /// True when `target` is a primary that stopped serving because an
    /// overlapping shard took its traffic (split or merge cut-over).
    pub fn target_is_being_resharded(
        &self,
        target: &Target,
    ) -> bool {
        if target.tablet_type != TabletType::Primary {
            return false;
        }
        self.keyspace_state(&target.keyspace)
            .is_some_and(|kss| kss.being_resharded(&target.shard))
    }

    /// Returns the last known primary when `target` is unavailable because
    /// that primary stopped serving.
    pub fn primary_is_not_serving(
        &self,
        target: &Target,
    ) -> Option<PrimaryNotServing> {
        if target.tablet_type != TabletType::Primary {
            return None;
        }
        self.keyspace_state(&target.keyspace)?
            .primary_not_serving(&target.shard)
    }

    /// Marks a known shard not serving. Returns false for unknown shards.
    pub fn mark_shard_not_serving(
        &self,
        target: &Target,
    ) -> bool {
        if target.tablet_type != TabletType::Primary {
            return false;
        }
        self.keyspace_state(&target.keyspace)
            .is_some_and(|kss| kss.mark_shard_not_serving(&target.shard))
    }

    /// Consistent keyspaces with at least one serving shard, sorted
    pub fn get_serving_keyspaces(&self) -> Vec<String> {
        let mut serving: Vec<String> = self
            .tracked_keyspaces()
            .into_iter()
            .filter(|kss| !kss.is_deleted() && kss.is_consistent() && kss.has_serving_shard())
            .map(|kss| kss.keyspace().to_string())
            .collect();
        serving.sort();
        serving
    }

    pub fn keyspace(
        &self,
        keyspace: &str,
    ) -> Option<Arc<KeyspaceState>> {
        self.keyspaces.get(keyspace).map(|entry| entry.value().clone())
    }

    /// Waits until every listed keyspace is consistent. Deleted keyspaces
    /// count as consistent.
    #[instrument(skip(self, keyspaces), fields(cell = %self.cell))]
    pub async fn wait_for_consistent_keyspaces(
        &self,
        keyspaces: &[String],
        wait: Duration,
    ) -> Result<()> {
        let deadline = Instant::now() + wait;
        let mut pending: Vec<String> = keyspaces.to_vec();
        pending.sort();
        pending.dedup();

        loop {
            pending.retain(|keyspace| {
                self.keyspace_state(keyspace)
                    .is_some_and(|kss| !kss.is_consistent())
            });
            if pending.is_empty() {
                return Ok(());
            }

            if Instant::now() >= deadline {
                for keyspace in &pending {
                    info!("keyspace {} didn't become consistent", keyspace);
                }
                return Err(TopoError::DeadlineExceeded {
                    operation: format!("wait for consistent keyspaces {}", pending.join(", ")),
                    timeout: wait,
                }
                .into());
            }

            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    return Err(TopoError::Interrupted("keyspace event watcher closed".into()).into());
                }
                _ = tokio::time::sleep(self.config.consistency_check_interval()) => {}
            }
        }
    }

    /// Stops every feed and watch. Subscriber streams end.
    pub fn close(&self) {
        info!("closing keyspace event watcher for cell {}", self.cell);
        self.shutdown.cancel();

        let vschema_watch = self.vschema_watch.lock().take();
        if let Some(mut subscription) = vschema_watch {
            subscription.cancel();
        }
        for kss in self.tracked_keyspaces() {
            kss.cancel_watch();
        }
        self.broadcaster.close();

        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }
}
