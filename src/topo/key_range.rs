//! Key ranges addressed by shard names such as `-80`, `40-80` or `c0-`.
//!
//! Ranges are half-open: `[start, end)`. An empty bound is unbounded on that side,
//! so the shard named `-` covers the whole keyspace.

use std::fmt;

use serde::Deserialize;
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum KeyRangeError {
    #[error("shard {shard}: invalid hex bound {bound:?}")]
    InvalidHex { shard: String, bound: String },

    #[error("shard {0}: expected exactly one '-' separator")]
    Malformed(String),

    #[error("shard {0}: start must be lower than end")]
    OutOfOrder(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct KeyRange {
    pub start: Vec<u8>,
    pub end: Vec<u8>,
}

impl KeyRange {
    pub fn new(
        start: Vec<u8>,
        end: Vec<u8>,
    ) -> Self {
        Self { start, end }
    }

    pub fn full() -> Self {
        Self::default()
    }

    pub fn is_full(&self) -> bool {
        self.start.is_empty() && self.end.is_empty()
    }

    /// Parses a shard name. Returns `Ok(None)` for names without a `-`,
    /// which denote unsharded keyspaces (e.g. `0`).
    pub fn from_shard_name(shard: &str) -> Result<Option<Self>, KeyRangeError> {
        if !shard.contains('-') {
            return Ok(None);
        }

        let mut parts = shard.split('-');
        let (start, end) = match (parts.next(), parts.next(), parts.next()) {
            (Some(start), Some(end), None) => (start, end),
            _ => return Err(KeyRangeError::Malformed(shard.to_string())),
        };

        let decode = |bound: &str| {
            hex::decode(bound).map_err(|_| KeyRangeError::InvalidHex {
                shard: shard.to_string(),
                bound: bound.to_string(),
            })
        };
        let range = Self::new(decode(start)?, decode(end)?);

        if !range.start.is_empty() && !range.end.is_empty() && range.start >= range.end {
            return Err(KeyRangeError::OutOfOrder(shard.to_string()));
        }

        Ok(Some(range))
    }

    pub fn contains_key(
        &self,
        key: &[u8],
    ) -> bool {
        self.start.as_slice() <= key && (self.end.is_empty() || key < self.end.as_slice())
    }

    /// True when both ranges share at least one key.
    pub fn intersects(
        &self,
        other: &KeyRange,
    ) -> bool {
        (self.end.is_empty() || other.start < self.end) && (other.end.is_empty() || self.start < other.end)
    }
}

impl fmt::Display for KeyRange {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        write!(f, "{}-{}", hex::encode(&self.start), hex::encode(&self.end))
    }
}
