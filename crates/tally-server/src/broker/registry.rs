//! Connection registry: the only owner of live client connections.
//!
//! Every other component refers to a connection by its [`ConnectionId`].

use std::sync::Arc;

use dashmap::DashMap;
use tally_core::{ConnectionId, OutboundMessage};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::websocket::connection::ClientConnection;

/// Live connections keyed by id.
pub struct ConnectionRegistry {
    connections: DashMap<ConnectionId, Arc<ClientConnection>>,
    send_queue_capacity: usize,
}

impl ConnectionRegistry {
    /// Create an empty registry whose connections queue up to
    /// `send_queue_capacity` outbound messages each.
    pub fn new(send_queue_capacity: usize) -> Self {
        Self {
            connections: DashMap::new(),
            send_queue_capacity: send_queue_capacity.max(1),
        }
    }

    /// Register a new connection and queue its `connection_established`
    /// greeting. The receiver feeds the connection's writer task.
    pub fn accept(&self) -> (ConnectionId, mpsc::Receiver<Arc<str>>) {
        let id = ConnectionId::generate();
        let (tx, rx) = mpsc::channel(self.send_queue_capacity);
        let connection = Arc::new(ClientConnection::new(id.clone(), tx));

        match OutboundMessage::connection_established(&id).to_json() {
            Ok(json) => {
                let _ = connection.send(Arc::from(json));
            }
            Err(e) => warn!(conn_id = %id, error = %e, "failed to serialize greeting"),
        }

        let _ = self.connections.insert(id.clone(), connection);
        debug!(conn_id = %id, "connection registered");
        (id, rx)
    }

    /// Remove a connection. Returns `false` if it was not registered.
    pub fn remove(&self, id: &ConnectionId) -> bool {
        match self.connections.remove(id) {
            Some((_, connection)) => {
                connection.close();
                true
            }
            None => false,
        }
    }

    /// Queue a message for one connection.
    ///
    /// Returns `false` for unknown, closed or backed-up connections. Never
    /// waits on the client.
    pub fn send(&self, id: &ConnectionId, message: Arc<str>) -> bool {
        // Clone out of the map so no shard lock is held across the send.
        let Some(connection) = self.get(id) else {
            return false;
        };
        connection.send(message)
    }

    /// Serialize and queue a message for one connection.
    pub fn send_message(&self, id: &ConnectionId, message: &OutboundMessage) -> bool {
        match message.to_json() {
            Ok(json) => self.send(id, Arc::from(json)),
            Err(e) => {
                warn!(conn_id = %id, error = %e, "failed to serialize message");
                false
            }
        }
    }

    /// Look up a connection.
    pub fn get(&self, id: &ConnectionId) -> Option<Arc<ClientConnection>> {
        self.connections.get(id).map(|entry| Arc::clone(entry.value()))
    }

    /// Whether `id` is registered.
    pub fn contains(&self, id: &ConnectionId) -> bool {
        self.connections.contains_key(id)
    }

    /// Number of registered connections.
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    /// Whether no connections are registered.
    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Messages dropped across all registered connections.
    pub fn total_dropped(&self) -> u64 {
        self.connections.iter().map(|e| e.value().drop_count()).sum()
    }
}
