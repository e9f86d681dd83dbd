//! Fixture builders shared by unit tests
mod fixtures;

pub use fixtures::*;
