//! Endpoint-keyed registry of virtual connections

use std::collections::HashMap;

use bytes::Bytes;
use tokio::sync::mpsc;

use crate::wire::Endpoint;

/// Per-connection state held by the table: the delivery queue feeding the
/// endpoint's [`VirtualSocket`](super::VirtualSocket). Dropping the entry
/// drops the sender, which the socket observes as an orderly close.
#[derive(Debug, Clone)]
pub(crate) struct VirtualEntry {
    pub(crate) data_tx: mpsc::Sender<Bytes>,
}

/// Registry mapping a remote endpoint to its active virtual connection.
///
/// At most one active connection exists per endpoint; inserting over an
/// existing key replaces the stale entry (an incoming SYN is authoritative).
/// Lookup misses on PSH/FIN are a recoverable condition, never a crash.
#[derive(Debug, Default)]
pub struct EndpointTable {
    entries: HashMap<Endpoint, VirtualEntry>,
}

impl EndpointTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a connection, returning any displaced stale entry
    pub(crate) fn insert(
        &mut self,
        endpoint: Endpoint,
        entry: VirtualEntry,
    ) -> Option<VirtualEntry> {
        self.entries.insert(endpoint, entry)
    }

    pub(crate) fn get(&self, endpoint: &Endpoint) -> Option<&VirtualEntry> {
        self.entries.get(endpoint)
    }

    pub(crate) fn remove(&mut self, endpoint: &Endpoint) -> Option<VirtualEntry> {
        self.entries.remove(endpoint)
    }

    pub fn contains(&self, endpoint: &Endpoint) -> bool {
        self.entries.contains_key(endpoint)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
