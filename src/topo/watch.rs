//! Cancellable watch subscriptions handed out by topology stores.
//!
//! A store keeps one [`WatchSlot`] per registered callback and pushes every
//! change through [`WatchSlot::deliver`]. The caller owns the matching
//! [`WatchSubscription`]; cancelling it (or dropping it) stops deliveries.
//!
//! A callback returning `false` ends its own watch.

use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::TopoError;

/// Callback invoked with every new value (or store error) of a watched node.
/// Returning `false` stops the watch.
pub type WatchCallback<T> = Box<dyn FnMut(Result<Arc<T>, TopoError>) -> bool + Send + 'static>;

/// Store side of a subscription
pub trait WatchHandle: Send + Sync {
    /// Blocks until any in-flight delivery finished; no delivery starts afterwards.
    fn cancel(&self);

    /// Marks the watch cancelled without waiting for an in-flight delivery.
    fn cancel_nowait(&self);

    fn is_active(&self) -> bool;
}

/// Holds one registered callback
pub struct WatchSlot<T> {
    cancelled: AtomicBool,
    callback: Mutex<Option<WatchCallback<T>>>,
}

impl<T: Send + Sync + 'static> WatchSlot<T> {
    pub fn new(callback: WatchCallback<T>) -> Arc<Self> {
        Arc::new(Self {
            cancelled: AtomicBool::new(false),
            callback: Mutex::new(Some(callback)),
        })
    }

    /// Runs the callback with `update`.
    ///
    /// Returns `false` once the slot is finished, so stores can forget it.
    pub fn deliver(
        &self,
        update: Result<Arc<T>, TopoError>,
    ) -> bool {
        let mut guard = self.callback.lock();
        if self.cancelled.load(Ordering::Acquire) {
            *guard = None;
            return false;
        }

        let Some(callback) = guard.as_mut() else {
            return false;
        };

        let keep = callback(update);
        if !keep || self.cancelled.load(Ordering::Acquire) {
            self.cancelled.store(true, Ordering::Release);
            *guard = None;
            return false;
        }
        true
    }

    pub fn subscription(self: &Arc<Self>) -> WatchSubscription {
        WatchSubscription::new(self.clone())
    }
}

impl<T: Send + Sync + 'static> WatchHandle for WatchSlot<T> {
    fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
        // waits for a running callback to return
        self.callback.lock().take();
    }

    fn cancel_nowait(&self) {
        self.cancelled.store(true, Ordering::Release);
        if let Some(mut guard) = self.callback.try_lock() {
            guard.take();
        }
    }

    fn is_active(&self) -> bool {
        !self.cancelled.load(Ordering::Acquire)
    }
}

/// Caller side of a watch. Dropping it cancels the watch.
pub struct WatchSubscription {
    handle: Option<Arc<dyn WatchHandle>>,
}

impl WatchSubscription {
    pub fn new(handle: Arc<dyn WatchHandle>) -> Self {
        Self { handle: Some(handle) }
    }

    /// A subscription that was never registered
    pub fn inactive() -> Self {
        Self { handle: None }
    }

    /// Stops the watch. Once this returns the callback is not running and never runs again.
    pub fn cancel(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.cancel();
        }
    }

    pub fn is_active(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| h.is_active())
    }
}

impl Drop for WatchSubscription {
    fn drop(&mut self) {
        // may run from inside the callback itself, so never block here
        if let Some(handle) = self.handle.take() {
            handle.cancel_nowait();
        }
    }
}

impl std::fmt::Debug for WatchSubscription {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        f.debug_struct("WatchSubscription").field("active", &self.is_active()).finish()
    }
}
