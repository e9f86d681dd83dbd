use parking_lot::Mutex;
use serde::Deserialize;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::debug;

use crate::TabletAlias;
use crate::Target;
use crate::WatcherConfig;

/// One health sample of one tablet
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TabletHealth {
    pub target: Target,
    pub tablet_alias: TabletAlias,
    pub serving: bool,
    /// Unix seconds at which the tablet became primary; 0 when unknown
    pub primary_term_start_time: i64,
}

/// Source of tablet health samples
#[cfg_attr(test, mockall::automock)]
pub trait HealthCheck: Send + Sync + 'static {
    /// Registers a listener. Every sample produced after this call is
    /// delivered, in order. Dropping the receiver unsubscribes.
    fn subscribe(&self) -> mpsc::Receiver<TabletHealth>;
}

/// Health feed driven by hand. Used by tests and by embedders that already
/// have their own health checking.
pub struct FakeHealthCheck {
    buffer_size: usize,
    subscribers: Mutex<Vec<mpsc::Sender<TabletHealth>>>,
}

impl FakeHealthCheck {
    pub fn new(buffer_size: usize) -> Self {
        Self {
            buffer_size: buffer_size.max(1),
            subscribers: Mutex::new(Vec::new()),
        }
    }

    /// Feed sized by `health_check_buffer_size`
    pub fn from_config(config: &WatcherConfig) -> Self {
        Self::new(config.health_check_buffer_size)
    }

    /// Sends `health` to every live subscriber, waiting for buffer space.
    pub async fn publish(
        &self,
        health: TabletHealth,
    ) {
        let subscribers: Vec<_> = self.subscribers.lock().clone();
        let mut closed = false;
        for tx in &subscribers {
            if tx.send(health.clone()).await.is_err() {
                closed = true;
            }
        }

        if closed {
            debug!("pruning closed health subscribers");
            self.subscribers.lock().retain(|tx| !tx.is_closed());
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().iter().filter(|tx| !tx.is_closed()).count()
    }

    /// Ends every subscription; receivers see the end of the stream.
    pub fn close(&self) {
        self.subscribers.lock().clear();
    }
}

impl HealthCheck for FakeHealthCheck {
    fn subscribe(&self) -> mpsc::Receiver<TabletHealth> {
        let (tx, rx) = mpsc::channel(self.buffer_size);
        self.subscribers.lock().push(tx);
        rx
    }
}
