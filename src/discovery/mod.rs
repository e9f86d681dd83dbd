//! Keyspace availability tracking.
//!
//! [`KeyspaceEventWatcher`] combines the serving topology of a cell with
//! tablet health samples into one [`KeyspaceState`] per keyspace, and tells
//! routers whether an unavailable primary is being resharded or is down.
mod healthcheck;
mod keyspace_events;
mod keyspace_state;

pub use healthcheck::*;
pub use keyspace_events::*;
pub use keyspace_state::*;

pub(crate) use keyspace_events::EventBroadcaster;
