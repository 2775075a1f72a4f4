//! Connection registry
//!
//! Maps connection identity to its entry. Every operation runs under one
//! lock; `snapshot` copies the entries out so callers never hold the lock
//! across I/O.

use parking_lot::Mutex;
use std::collections::HashMap;

use super::connection::{ConnectionEntry, ConnectionId};

#[derive(Default)]
pub struct ConnectionRegistry {
    connections: Mutex<HashMap<ConnectionId, ConnectionEntry>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection, replacing any entry under the same identity
    ///
    /// Returns `true` if an entry was replaced.
    pub fn add(&self, id: ConnectionId, entry: ConnectionEntry) -> bool {
        self.connections.lock().insert(id, entry).is_some()
    }

    /// Remove a connection; no-op if absent
    pub fn remove(&self, id: &ConnectionId) -> Option<ConnectionEntry> {
        self.connections.lock().remove(id)
    }

    /// Independent copy of the current entries
    pub fn snapshot(&self) -> Vec<(ConnectionId, ConnectionEntry)> {
        self.connections
            .lock()
            .iter()
            .map(|(id, entry)| (*id, entry.clone()))
            .collect()
    }

    pub fn contains(&self, id: &ConnectionId) -> bool {
        self.connections.lock().contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.connections.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.lock().is_empty()
    }
}
