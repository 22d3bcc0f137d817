//! Registry of live connections using slab allocation.
//!
//! The accept loop never touches the set directly. It hands new connections
//! over a channel, and the owner drains them with [`ConnectionRegistry::admit`]
//! at the start of each tick, so the set needs no lock.

use crate::runtime::connection::Connection;
use slab::Slab;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{info, warn};

/// Sending side used by the accept loop.
pub type Admissions = mpsc::UnboundedSender<Arc<Connection>>;

pub struct ConnectionRegistry {
    connections: Slab<Arc<Connection>>,
    incoming: mpsc::UnboundedReceiver<Arc<Connection>>,
    max_connections: usize,
}

impl ConnectionRegistry {
    /// Create an empty registry and the channel that feeds it.
    pub fn new(max_connections: usize) -> (Self, Admissions) {
        let (tx, rx) = mpsc::unbounded_channel();
        let registry = Self {
            connections: Slab::with_capacity(max_connections.min(1024)),
            incoming: rx,
            max_connections,
        };
        (registry, tx)
    }

    /// Insert a connection.
    ///
    /// Returns `None` if the registry is at capacity.
    pub fn insert(&mut self, conn: Arc<Connection>) -> Option<usize> {
        if self.connections.len() >= self.max_connections {
            return None;
        }
        Some(self.connections.insert(conn))
    }

    /// Move connections handed over by the accept loop into the set.
    ///
    /// Connections arriving at capacity are closed. Returns how many were added.
    pub fn admit(&mut self) -> usize {
        let mut added = 0;
        while let Ok(conn) = self.incoming.try_recv() {
            let peer = conn.peer();
            match self.insert(Arc::clone(&conn)) {
                Some(conn_id) => {
                    info!(conn_id, peer = %peer, connections = self.len(), "New connection accepted");
                    added += 1;
                }
                None => {
                    warn!(peer = %peer, limit = self.max_connections, "Connection limit reached");
                    conn.close();
                }
            }
        }
        added
    }

    /// Remove every connection that is no longer open.
    ///
    /// Returns how many were removed.
    pub fn prune(&mut self) -> usize {
        let closed: Vec<usize> = self
            .connections
            .iter()
            .filter(|(_, conn)| !conn.is_open())
            .map(|(conn_id, _)| conn_id)
            .collect();

        for &conn_id in &closed {
            let conn = self.connections.remove(conn_id);
            info!(conn_id, peer = %conn.peer(), "Connection closed, removing");
        }
        closed.len()
    }

    /// Pair every live connection with its latest unconsumed line.
    pub fn snapshot(&self) -> Vec<(Option<String>, Arc<Connection>)> {
        self.connections
            .iter()
            .map(|(_, conn)| (conn.consume_line(), Arc::clone(conn)))
            .collect()
    }

    /// Send `bytes` to every connection.
    ///
    /// Returns true if at least one connection accepted a nonzero write.
    pub async fn broadcast(&self, bytes: &[u8]) -> bool {
        let mut delivered = false;
        for (_, conn) in self.connections.iter() {
            if conn.send(bytes).await != 0 {
                delivered = true;
            }
        }
        delivered
    }

    /// Number of live connections.
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }
}
