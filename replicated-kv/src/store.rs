//! In-memory key-value state machine.
//!
//! Committed log entries are applied here. The store is owned by the node's
//! event loop, so it needs no interior locking.

use std::collections::BTreeMap;

use crate::log::LogEntry;

/// Key-value map every replica converges on by applying the log in order.
///
/// `BTreeMap` keeps iteration order deterministic, which makes status output
/// and test comparisons stable.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KvStore {
    data: BTreeMap<String, String>,
}

impl KvStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Applies a committed entry, overwriting any earlier value for the key.
    pub fn apply(&mut self, entry: &LogEntry) {
        self.data.insert(entry.key.clone(), entry.value.clone());
    }

    /// Returns `None` if the key has never been written.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.data.get(key).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Copy of every key-value pair.
    pub fn snapshot(&self) -> BTreeMap<String, String> {
        self.data.clone()
    }
}
