//! Vector clocks used to track causal history between clients
//!
//! Each entry maps a client identifier to the number of operations from that
//! client which the holder of the clock has observed. Entries are kept in a
//! `BTreeMap` so that serialisation order is stable, which keeps world-state
//! checksums identical across replicas.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Per-client logical counters describing a causal history
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VectorClock {
    entries: BTreeMap<String, u64>,
}

impl VectorClock {
    /// Creates an empty clock
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the counter recorded for a client, zero when unknown
    pub fn get(&self, client_id: &str) -> u64 {
        self.entries.get(client_id).copied().unwrap_or(0)
    }

    /// Sets a client's counter, overwriting whatever was there
    pub fn set(&mut self, client_id: impl Into<String>, counter: u64) {
        self.entries.insert(client_id.into(), counter);
    }

    /// Advances a client's counter by one and returns the new value
    pub fn increment(&mut self, client_id: &str) -> u64 {
        let counter = self.entries.entry(client_id.to_string()).or_insert(0);
        *counter += 1;
        *counter
    }

    /// Raises a single entry to `max(current, counter)`
    pub fn observe(&mut self, client_id: &str, counter: u64) {
        let entry = self.entries.entry(client_id.to_string()).or_insert(0);
        *entry = (*entry).max(counter);
    }

    /// Pointwise maximum with another clock
    pub fn merge(&mut self, other: &VectorClock) {
        for (client_id, &counter) in &other.entries {
            self.observe(client_id, counter);
        }
    }

    /// True when every entry of `self` is >= the matching entry of `other`
    pub fn dominates(&self, other: &VectorClock) -> bool {
        other
            .entries
            .iter()
            .all(|(client_id, &counter)| self.get(client_id) >= counter)
    }

    /// True when `self` causally precedes `other`
    ///
    /// Every entry of `self` must be <= the matching entry in `other`, and
    /// the two clocks must differ somewhere.
    pub fn happens_before(&self, other: &VectorClock) -> bool {
        other.dominates(self) && !self.dominates(other)
    }

    /// True when neither clock precedes the other and they are not equal
    pub fn concurrent_with(&self, other: &VectorClock) -> bool {
        !self.dominates(other) && !other.dominates(self)
    }

    /// Copy of this clock with `client_id`'s own entry reset to zero
    ///
    /// Used when registering a client: it starts caught up with everyone
    /// else while owning a fresh causal chain for its own operations.
    pub fn seeded_for(&self, client_id: &str) -> VectorClock {
        let mut seeded = self.clone();
        seeded.set(client_id, 0);
        seeded
    }

    /// Iterates over `(client_id, counter)` pairs in client-id order
    pub fn iter(&self) -> impl Iterator<Item = (&str, u64)> {
        self.entries.iter().map(|(id, counter)| (id.as_str(), *counter))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<S: Into<String>> FromIterator<(S, u64)> for VectorClock {
    fn from_iter<I: IntoIterator<Item = (S, u64)>>(iter: I) -> Self {
        Self {
            entries: iter.into_iter().map(|(id, c)| (id.into(), c)).collect(),
        }
    }
}

impl fmt::Display for VectorClock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{")?;
        for (i, (client_id, counter)) in self.entries.iter().enumerate() {
            if i > 0 {
                write!(f, ",")?;
            }
            write!(f, "{}:{}", client_id, counter)?;
        }
        write!(f, "}}")
    }
}
