use std::collections::HashMap;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use serde::Deserialize;
use serde::Serialize;
use tracing::debug;
use tracing::info;
use tracing::warn;

use super::keyspace_events::EventBroadcaster;
use super::KeyspaceEvent;
use super::ShardEvent;
use super::TabletHealth;
use crate::KeyRange;
use crate::SrvKeyspace;
use crate::SrvVSchema;
use crate::TabletAlias;
use crate::TabletType;
use crate::Target;
use crate::TopoError;
use crate::WatchSubscription;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum MoveTablesKind {
    #[default]
    None,
    /// Whole tables move, routed through table routing rules
    Regular,
    /// Tables move shard by shard, routed through shard routing rules
    Partial,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum MoveTablesStatus {
    #[default]
    Unknown,
    NotSwitched,
    Switched,
}

/// MoveTables progress as seen from one keyspace
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct MoveTablesState {
    pub kind: MoveTablesKind,
    pub state: MoveTablesStatus,
}

impl MoveTablesState {
    /// Derives the state of `keyspace` from the routing rules of `vschema`.
    ///
    /// Only rules whose source side is `keyspace` count. The keyspace is
    /// switched once every such rule routes back into `keyspace` itself.
    pub fn from_vschema(
        keyspace: &str,
        vschema: &SrvVSchema,
    ) -> Self {
        let shard_rules: Vec<_> = vschema
            .shard_routing_rules
            .iter()
            .filter(|r| r.from_keyspace == keyspace)
            .collect();
        if !shard_rules.is_empty() {
            let switched = shard_rules.iter().all(|r| r.to_keyspace == keyspace);
            return Self::new(MoveTablesKind::Partial, switched);
        }

        let table_rules: Vec<_> = vschema
            .routing_rules
            .iter()
            .filter(|r| table_keyspace(&r.from_table) == Some(keyspace))
            .collect();
        if table_rules.is_empty() {
            return Self::default();
        }

        let switched = table_rules
            .iter()
            .all(|r| r.to_tables.iter().all(|t| table_keyspace(t) == Some(keyspace)));
        Self::new(MoveTablesKind::Regular, switched)
    }

    fn new(
        kind: MoveTablesKind,
        switched: bool,
    ) -> Self {
        let state = if switched {
            MoveTablesStatus::Switched
        } else {
            MoveTablesStatus::NotSwitched
        };
        Self { kind, state }
    }

    pub fn is_active(&self) -> bool {
        self.kind != MoveTablesKind::None
    }

    /// Traffic not switched yet
    pub fn in_flight(&self) -> bool {
        self.is_active() && self.state != MoveTablesStatus::Switched
    }
}

fn table_keyspace(table: &str) -> Option<&str> {
    table.split_once('.').map(|(keyspace, _)| keyspace)
}

/// Serving state of the primary of one shard
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardState {
    pub(crate) target: Target,
    pub(crate) serving: bool,
    pub(crate) current_primary: Option<TabletAlias>,
    /// Primary term start (unix seconds) of `current_primary`; 0 = never seen
    pub(crate) externally_reparented: i64,
    pub(crate) unavailable_since: Option<Instant>,
}

impl ShardState {
    pub fn new(target: Target) -> Self {
        Self {
            target,
            serving: false,
            current_primary: None,
            externally_reparented: 0,
            unavailable_since: None,
        }
    }

    pub fn target(&self) -> &Target {
        &self.target
    }

    pub fn is_serving(&self) -> bool {
        self.serving
    }

    pub fn current_primary(&self) -> Option<&TabletAlias> {
        self.current_primary.as_ref()
    }

    pub fn externally_reparented(&self) -> i64 {
        self.externally_reparented
    }

    pub fn unavailable_since(&self) -> Option<Instant> {
        self.unavailable_since
    }

    /// Returns whether the serving flag flipped.
    pub(crate) fn set_serving(
        &mut self,
        serving: bool,
    ) -> bool {
        if self.serving == serving {
            return false;
        }
        self.serving = serving;
        self.unavailable_since = if serving { None } else { Some(Instant::now()) };
        true
    }

    /// Records a reparent. Terms at or before the stored one are stale and ignored.
    pub(crate) fn record_reparent(
        &mut self,
        term_start: i64,
        primary: &TabletAlias,
    ) -> bool {
        if term_start == 0 || term_start <= self.externally_reparented {
            return false;
        }
        self.externally_reparented = term_start;
        self.current_primary = Some(primary.clone());
        true
    }
}

/// Why a primary target is unavailable
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrimaryNotServing {
    /// Last primary observed for the shard
    pub primary: TabletAlias,
    pub externally_reparented: i64,
}

#[derive(Default)]
struct KeyspaceStateInner {
    deleted: bool,
    consistent: bool,
    last_error: Option<TopoError>,
    last_keyspace: Option<Arc<SrvKeyspace>>,
    shards: HashMap<String, ShardState>,
    sharded: Option<bool>,
    move_tables_state: MoveTablesState,
}

/// Availability state machine of one keyspace in one cell
pub struct KeyspaceState {
    cell: String,
    keyspace: String,
    broadcaster: Arc<EventBroadcaster>,
    inner: Mutex<KeyspaceStateInner>,
    watch: Mutex<Option<WatchSubscription>>,
}

impl KeyspaceState {
    pub(crate) fn new(
        cell: impl Into<String>,
        keyspace: impl Into<String>,
        broadcaster: Arc<EventBroadcaster>,
    ) -> Self {
        Self {
            cell: cell.into(),
            keyspace: keyspace.into(),
            broadcaster,
            inner: Mutex::new(KeyspaceStateInner::default()),
            watch: Mutex::new(None),
        }
    }

    pub fn keyspace(&self) -> &str {
        &self.keyspace
    }

    pub fn cell(&self) -> &str {
        &self.cell
    }

    pub fn is_consistent(&self) -> bool {
        self.inner.lock().consistent
    }

    pub fn is_deleted(&self) -> bool {
        self.inner.lock().deleted
    }

    pub fn last_error(&self) -> Option<TopoError> {
        self.inner.lock().last_error.clone()
    }

    pub fn last_keyspace(&self) -> Option<Arc<SrvKeyspace>> {
        self.inner.lock().last_keyspace.clone()
    }

    pub fn move_tables_state(&self) -> MoveTablesState {
        self.inner.lock().move_tables_state
    }

    /// `None` until the vschema mentioned the keyspace
    pub fn is_sharded(&self) -> Option<bool> {
        self.inner.lock().sharded
    }

    pub fn shard(
        &self,
        shard: &str,
    ) -> Option<ShardState> {
        self.inner.lock().shards.get(shard).cloned()
    }

    /// Snapshot of every tracked shard, ordered by shard name
    pub fn shards(&self) -> Vec<ShardState> {
        let inner = self.inner.lock();
        let mut shards: Vec<_> = inner.shards.values().cloned().collect();
        shards.sort_by(|a, b| a.target.shard.cmp(&b.target.shard));
        shards
    }

    pub fn has_serving_shard(&self) -> bool {
        self.inner.lock().shards.values().any(|s| s.serving)
    }

    pub(crate) fn set_watch(
        &self,
        subscription: WatchSubscription,
    ) {
        *self.watch.lock() = Some(subscription);
    }

    /// Stops the topology watch; no callback runs once this returns.
    pub(crate) fn cancel_watch(&self) {
        let subscription = self.watch.lock().take();
        if let Some(mut subscription) = subscription {
            subscription.cancel();
        }
    }

    /// Applies a topology snapshot (or error) for this keyspace.
    ///
    /// Returns whether the effective state changed.
    pub(crate) fn on_srv_keyspace(
        &self,
        update: Result<Arc<SrvKeyspace>, TopoError>,
    ) -> bool {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;

        let snapshot = match update {
            Ok(snapshot) => snapshot,
            Err(e) if e.is_no_node() => {
                if inner.deleted {
                    return false;
                }
                info!(keyspace = %self.keyspace, cell = %self.cell, "keyspace deleted");
                inner.deleted = true;
                inner.consistent = false;
                inner.last_keyspace = Some(Arc::new(SrvKeyspace::default()));
                return true;
            }
            Err(e) => {
                warn!(keyspace = %self.keyspace, cell = %self.cell, "error watching keyspace: {}", e);
                let changed = inner.last_error.as_ref() != Some(&e);
                inner.last_error = Some(e);
                return changed;
            }
        };

        inner.last_error = None;
        if inner.last_keyspace.as_deref() == Some(snapshot.as_ref()) {
            return false;
        }

        let previous: HashSet<String> = inner
            .last_keyspace
            .as_ref()
            .map(|ks| ks.shard_names(TabletType::Primary).into_iter().map(str::to_string).collect())
            .unwrap_or_default();

        for name in snapshot.shard_names(TabletType::Primary) {
            if !inner.shards.contains_key(name) {
                debug!(keyspace = %self.keyspace, shard = name, "tracking new shard");
                let target = Target::new(self.cell.as_str(), self.keyspace.as_str(), name, TabletType::Primary);
                inner.shards.insert(name.to_string(), ShardState::new(target));
            }
        }
        for name in previous {
            if snapshot.partition(TabletType::Primary).is_some_and(|p| p.contains_shard(&name)) {
                continue;
            }
            // kept until the new layout is confirmed consistent
            debug!(keyspace = %self.keyspace, shard = %name, "shard left the primary partition");
        }

        inner.consistent = false;
        inner.last_keyspace = Some(snapshot);
        self.ensure_consistent_locked(inner);
        true
    }

    /// Applies the cell's serving vschema.
    pub(crate) fn on_srv_vschema(
        &self,
        vschema: &SrvVSchema,
    ) {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;

        inner.sharded = vschema.keyspaces.get(&self.keyspace).map(|ks| ks.sharded);

        let state = MoveTablesState::from_vschema(&self.keyspace, vschema);
        if state == inner.move_tables_state {
            return;
        }
        debug!(keyspace = %self.keyspace, ?state, "move tables state changed");
        inner.move_tables_state = state;
        if state.is_active() {
            inner.consistent = false;
        }
        self.ensure_consistent_locked(inner);
    }

    /// Applies one health sample. Only primary tablets matter.
    pub(crate) fn on_health_check(
        &self,
        health: &TabletHealth,
    ) {
        if health.target.tablet_type != TabletType::Primary {
            return;
        }

        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let shard = &health.target.shard;

        if !inner.shards.contains_key(shard) {
            // a shard we never heard of that is not serving tells us nothing
            if !health.serving {
                return;
            }
            inner.shards.insert(shard.clone(), ShardState::new(health.target.clone()));
        }
        let Some(state) = inner.shards.get_mut(shard) else {
            return;
        };

        let mut changed = false;
        if state.set_serving(health.serving) {
            debug!(shard_target = %health.target, serving = health.serving, "serving state changed");
            changed = true;
        }
        if state.record_reparent(health.primary_term_start_time, &health.tablet_alias) {
            info!(shard_target = %health.target, primary = %health.tablet_alias, "new primary observed");
            changed = true;
        }

        if changed {
            inner.consistent = false;
        }
        self.ensure_consistent_locked(inner);
    }

    /// Router feedback: the primary of `shard` refused traffic.
    pub(crate) fn mark_shard_not_serving(
        &self,
        shard: &str,
    ) -> bool {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let Some(state) = inner.shards.get_mut(shard) else {
            return false;
        };
        state.set_serving(false);
        inner.consistent = false;
        true
    }

    /// True when the shard is unavailable because a serving shard with an
    /// overlapping key range already took over its traffic.
    pub(crate) fn being_resharded(
        &self,
        shard: &str,
    ) -> bool {
        let inner = self.inner.lock();
        if inner.deleted || inner.consistent || inner.move_tables_state.is_active() {
            return false;
        }
        overlapping_shard_serving(&inner.shards, shard)
    }

    pub(crate) fn primary_not_serving(
        &self,
        shard: &str,
    ) -> Option<PrimaryNotServing> {
        let inner = self.inner.lock();
        if inner.deleted || inner.consistent {
            return None;
        }

        let state = inner.shards.get(shard)?;
        if state.serving || state.externally_reparented == 0 {
            return None;
        }
        let primary = state.current_primary.clone()?;

        if !inner.move_tables_state.is_active() && overlapping_shard_serving(&inner.shards, shard) {
            return None;
        }

        Some(PrimaryNotServing {
            primary,
            externally_reparented: state.externally_reparented,
        })
    }

    /// Re-checks whether the keyspace is whole again; broadcasts when it is.
    fn ensure_consistent_locked(
        &self,
        inner: &mut KeyspaceStateInner,
    ) {
        if inner.consistent {
            return;
        }

        if inner.move_tables_state.in_flight() {
            return;
        }

        let Some(primary) = inner.last_keyspace.as_ref().and_then(|ks| ks.partition(TabletType::Primary)) else {
            return;
        };
        if !primary.shard_tablet_controls.is_empty() {
            return;
        }

        let mut active = HashSet::with_capacity(primary.shard_references.len());
        for reference in &primary.shard_references {
            match inner.shards.get(&reference.name) {
                Some(state) if state.serving => {
                    active.insert(reference.name.clone());
                }
                _ => return,
            }
        }

        if inner.shards.iter().any(|(name, state)| state.serving && !active.contains(name)) {
            return;
        }

        inner.shards.retain(|name, state| {
            let keep = active.contains(name);
            if !keep {
                debug!(keyspace = %self.keyspace, shard = %name, serving = state.serving, "retiring shard");
            }
            keep
        });

        inner.consistent = true;
        info!(keyspace = %self.keyspace, cell = %self.cell, "keyspace is now consistent");

        let mut shards: Vec<ShardEvent> = inner
            .shards
            .values()
            .map(|s| ShardEvent {
                tablet: s.current_primary.clone(),
                target: s.target.clone(),
                serving: s.serving,
            })
            .collect();
        shards.sort_by(|a, b| a.target.shard.cmp(&b.target.shard));

        self.broadcaster.broadcast(KeyspaceEvent {
            cell: self.cell.clone(),
            keyspace: self.keyspace.clone(),
            shards,
            move_tables_state: inner.move_tables_state,
        });
    }
}

/// Any serving shard, other than `shard`, whose key range overlaps it.
/// Shard names that are not key ranges never overlap.
fn overlapping_shard_serving(
    shards: &HashMap<String, ShardState>,
    shard: &str,
) -> bool {
    let Ok(Some(range)) = KeyRange::from_shard_name(shard) else {
        return false;
    };

    shards.iter().any(|(name, state)| {
        name != shard
            && state.serving
            && matches!(KeyRange::from_shard_name(name), Ok(Some(other)) if range.intersects(&other))
    })
}

#[cfg(test)]
impl KeyspaceState {
    /// Builds a state with the given shards, bypassing the topology feed.
    pub(crate) fn from_shards(
        cell: &str,
        keyspace: &str,
        broadcaster: Arc<EventBroadcaster>,
        shards: Vec<ShardState>,
        consistent: bool,
    ) -> Self {
        let state = Self::new(cell, keyspace, broadcaster);
        {
            let mut inner = state.inner.lock();
            inner.consistent = consistent;
            for shard in shards {
                inner.shards.insert(shard.target.shard.clone(), shard);
            }
        }
        state
    }
}
