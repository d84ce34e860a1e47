//! Per-key timestamp fencing.
//!
//! Every key of a keyed component remembers the highest timestamp ever
//! accepted for it. A write whose timestamp is not strictly newer is
//! rejected, which makes replaying the same operation a no-op and makes
//! the outcome of two writes independent of their delivery order.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Logical write time attached to every mutation.
pub type Timestamp = u64;

/// Returns true when `incoming` may overwrite a value last written at `stored`.
pub fn is_newer(stored: Option<Timestamp>, incoming: Timestamp) -> bool {
    stored.map_or(true, |stored| incoming > stored)
}

/// Highest accepted timestamp per key.
///
/// Entries are never removed: a deleted key keeps its tombstone timestamp so
/// that a late insert or update older than the delete is still rejected.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimestampFence {
    stamps: HashMap<String, Timestamp>,
}

impl TimestampFence {
    /// Create an empty fence.
    pub fn new() -> Self {
        Self::default()
    }

    /// The stored timestamp for `key`, if any write was ever accepted.
    pub fn get(&self, key: &str) -> Option<Timestamp> {
        self.stamps.get(key).copied()
    }

    /// Check whether a write at `timestamp` passes the fence for `key`.
    pub fn accepts(&self, key: &str, timestamp: Timestamp) -> bool {
        is_newer(self.get(key), timestamp)
    }

    /// Record an accepted write.
    pub fn record(&mut self, key: &str, timestamp: Timestamp) {
        self.stamps.insert(key.to_owned(), timestamp);
    }

    /// Keep the greater of the stored and the incoming timestamp.
    ///
    /// Returns true if the stored timestamp moved forward.
    pub fn raise(&mut self, key: &str, timestamp: Timestamp) -> bool {
        if self.accepts(key, timestamp) {
            self.record(key, timestamp);
            true
        } else {
            false
        }
    }

    /// Number of keys with a recorded timestamp (tombstones included).
    pub fn len(&self) -> usize {
        self.stamps.len()
    }

    /// Check if no timestamp was ever recorded.
    pub fn is_empty(&self) -> bool {
        self.stamps.is_empty()
    }

    /// Iterate over all `(key, timestamp)` pairs.
    pub fn iter(&self) -> impl Iterator<Item = (&str, Timestamp)> {
        self.stamps.iter().map(|(k, t)| (k.as_str(), *t))
    }
}
