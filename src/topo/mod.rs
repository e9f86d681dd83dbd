//! Topology store model and access traits.
//!
//! The store itself is external. This module defines what the rest of the crate
//! needs from it: serving-graph reads and watches ([`SrvTopoServer`]) and
//! exclusive locks ([`LockBackend`]). [`MemoryTopo`] implements both in-process.

mod key_range;
mod locks;
mod memory;
mod types;
mod watch;

pub use key_range::*;
pub use locks::*;
pub use memory::*;
pub use types::*;
pub use watch::*;

#[cfg(test)]
mod locks_test;

use std::sync::Arc;

#[cfg(test)]
use mockall::automock;

use crate::Result;

/// Read and watch access to the serving graph of a cell
#[cfg_attr(test, automock)]
#[async_trait::async_trait]
pub trait SrvTopoServer: Send + Sync + 'static {
    /// Lists the keyspaces that have a serving view in `cell`.
    /// `stale_ok` allows answering from a cache.
    async fn get_srv_keyspace_names(
        &self,
        cell: &str,
        stale_ok: bool,
    ) -> Result<Vec<String>>;

    /// Fails with `TopoError::NoNode` when the keyspace has no serving view.
    async fn get_srv_keyspace(
        &self,
        cell: &str,
        keyspace: &str,
    ) -> Result<Arc<SrvKeyspace>>;

    /// Delivers the current value (or `NoNode`) and then every change, in order.
    fn watch_srv_keyspace(
        &self,
        cell: &str,
        keyspace: &str,
        callback: WatchCallback<SrvKeyspace>,
    ) -> WatchSubscription;

    fn watch_srv_vschema(
        &self,
        cell: &str,
        callback: WatchCallback<SrvVSchema>,
    ) -> WatchSubscription;
}

/// Exclusive locks on topology paths
#[cfg_attr(test, automock)]
#[async_trait::async_trait]
pub trait LockBackend: Send + Sync + 'static {
    /// Waits until the lock at `path` is free, then takes it.
    async fn lock(
        &self,
        path: &str,
        contents: &str,
    ) -> Result<Box<dyn LockDescriptor>>;

    /// Takes the lock at `path` or fails with `TopoError::NodeExists`.
    async fn try_lock(
        &self,
        path: &str,
        contents: &str,
    ) -> Result<Box<dyn LockDescriptor>>;
}

/// A lock held in the store
#[cfg_attr(test, automock)]
#[async_trait::async_trait]
pub trait LockDescriptor: Send + Sync {
    /// Fails when the store no longer holds the lock for us.
    async fn check(&self) -> Result<()>;

    async fn unlock(&self) -> Result<()>;
}
