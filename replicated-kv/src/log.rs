//! The replicated write log.
//!
//! Each replica owns exactly one [`ReplicatedLog`]. Entries are only ever
//! appended at the next contiguous position; no existing position is
//! overwritten or truncated.

use serde::{Deserialize, Serialize};

use crate::types::LogIndex;

/// A single replicated write. Its position is implicit in the log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub key: String,
    pub value: String,
}

impl LogEntry {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }

    /// Length of the entry's JSON encoding, as carried inside an announcement.
    pub fn encoded_len(&self) -> usize {
        serde_json::to_vec(self).map_or(usize::MAX, |bytes| bytes.len())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplicatedLog {
    entries: Vec<LogEntry>,
}

impl ReplicatedLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Index of the newest entry, or [`NO_INDEX`](crate::types::NO_INDEX) while empty.
    pub fn last_index(&self) -> LogIndex {
        self.entries.len() as LogIndex - 1
    }

    /// Appends at the next position and returns that position.
    pub fn append(&mut self, entry: LogEntry) -> LogIndex {
        self.entries.push(entry);
        self.last_index()
    }

    pub fn get(&self, index: LogIndex) -> Option<&LogEntry> {
        if index < 0 {
            return None;
        }
        self.entries.get(index as usize)
    }

    /// The newest entry with its index, if any.
    pub fn last(&self) -> Option<(LogIndex, &LogEntry)> {
        self.entries.last().map(|entry| (self.last_index(), entry))
    }

    pub fn entries(&self) -> &[LogEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
