//! Serving-graph queries built on top of [`SrvTopoServer`](crate::SrvTopoServer).

mod discover;
pub use discover::*;
