//! Keyspace topology watcher.
//!
//! Tracks the serving state of every shard in a cell, tells an in-flight
//! reshard apart from a primary outage, hands out exclusive locks on topology
//! resources and lists the serving targets of a cell.

mod config;
mod constants;
mod discovery;
mod errors;
mod srvtopo;
mod topo;
mod utils;

pub use self::config::*;
pub use discovery::*;
pub use errors::*;
pub use srvtopo::*;
pub use topo::*;

//-----------------------------------------------------------
// Test utils

#[cfg(test)]
pub mod test_utils;
