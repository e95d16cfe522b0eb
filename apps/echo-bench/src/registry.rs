use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::Mutex;

use crate::connection::{Connection, ConnectionId, TransportKind};

pub type SharedConnection = Arc<dyn Connection>;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("connection {0} is already registered")]
    Duplicate(ConnectionId),
}

/// Aggregate occupancy of both transport subsets at one sampling instant.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub persistent_count: usize,
    pub persistent_buffered_bytes: usize,
    pub peer_count: usize,
    pub peer_buffered_bytes: usize,
}

impl StatsSnapshot {
    pub fn is_idle(&self) -> bool {
        self.persistent_count == 0 && self.peer_count == 0
    }
}

impl fmt::Display for StatsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "buffered ws({}): {}b, rtc({}): {}b",
            self.persistent_count,
            self.persistent_buffered_bytes,
            self.peer_count,
            self.peer_buffered_bytes
        )
    }
}

/// Live connections of both kinds.
///
/// Owned by the event loop. The persistent subset is a plain map; the peer
/// subset and its buffered-byte reads sit behind one mutex.
#[derive(Default)]
pub struct ConnectionRegistry {
    persistent: HashMap<ConnectionId, SharedConnection>,
    peers: Arc<Mutex<HashMap<ConnectionId, SharedConnection>>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add(&mut self, conn: SharedConnection) -> Result<(), RegistryError> {
        let id = conn.id();
        let mut peers = self.peers.lock().await;
        if self.persistent.contains_key(&id) || peers.contains_key(&id) {
            return Err(RegistryError::Duplicate(id));
        }
        match conn.kind() {
            TransportKind::Persistent => {
                self.persistent.insert(id, conn);
            }
            TransportKind::PeerToPeer => {
                peers.insert(id, conn);
            }
        }
        Ok(())
    }

    /// Removing an unknown id is a no-op.
    pub async fn remove(&mut self, id: ConnectionId) -> Option<SharedConnection> {
        if let Some(conn) = self.persistent.remove(&id) {
            return Some(conn);
        }
        self.peers.lock().await.remove(&id)
    }

    pub async fn get(&self, id: ConnectionId) -> Option<SharedConnection> {
        if let Some(conn) = self.persistent.get(&id) {
            return Some(conn.clone());
        }
        self.peers.lock().await.get(&id).cloned()
    }

    pub async fn for_each<F>(&self, kind: TransportKind, mut f: F)
    where
        F: FnMut(&SharedConnection),
    {
        match kind {
            TransportKind::Persistent => self.persistent.values().for_each(&mut f),
            TransportKind::PeerToPeer => self.peers.lock().await.values().for_each(&mut f),
        }
    }

    pub async fn len(&self) -> usize {
        self.persistent.len() + self.peers.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn snapshot(&self) -> StatsSnapshot {
        let mut snapshot = StatsSnapshot {
            persistent_count: self.persistent.len(),
            ..StatsSnapshot::default()
        };
        for conn in self.persistent.values() {
            snapshot.persistent_buffered_bytes += conn.buffered_bytes().await;
        }

        let peers = self.peers.lock().await;
        snapshot.peer_count = peers.len();
        for conn in peers.values() {
            snapshot.peer_buffered_bytes += conn.buffered_bytes().await;
        }
        snapshot
    }
}
