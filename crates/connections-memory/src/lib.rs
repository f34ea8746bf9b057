//! In-memory connection gateway for local development and tests.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod error;

pub use error::Error;

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use herald_connections::{ConnectionGateway, ConnectionHandle};
use parking_lot::RwLock;
use tokio::sync::mpsc;
use tracing::{debug, info};

/// Default number of undelivered events buffered per connection.
pub const DEFAULT_CONNECTION_BUFFER: usize = 64;

struct ConnectionEntry {
    tx: mpsc::Sender<Bytes>,
    groups: HashSet<String>,
}

#[derive(Default)]
struct GatewayState {
    connections: HashMap<ConnectionHandle, ConnectionEntry>,
    groups: HashMap<String, BTreeSet<ConnectionHandle>>,
}

impl GatewayState {
    fn remove(&mut self, handle: &ConnectionHandle) -> bool {
        let Some(entry) = self.connections.remove(handle) else {
            return false;
        };

        for group in entry.groups {
            if let Some(members) = self.groups.get_mut(&group) {
                members.remove(handle);
                if members.is_empty() {
                    self.groups.remove(&group);
                }
            }
        }

        true
    }
}

/// The client end of an in-memory connection.
pub struct ClientConnection {
    handle: ConnectionHandle,
    rx: mpsc::Receiver<Bytes>,
}

impl ClientConnection {
    /// The gateway handle of this connection.
    #[must_use]
    pub const fn handle(&self) -> ConnectionHandle {
        self.handle
    }

    /// Waits for the next pushed event. Returns `None` once the gateway drops
    /// the connection.
    pub async fn recv(&mut self) -> Option<Bytes> {
        self.rx.recv().await
    }

    /// Returns an already buffered event without waiting.
    pub fn try_recv(&mut self) -> Option<Bytes> {
        self.rx.try_recv().ok()
    }
}

/// In-memory connection gateway.
#[derive(Clone, Default)]
pub struct MemoryGateway {
    state: Arc<RwLock<GatewayState>>,
}

impl MemoryGateway {
    /// Creates a new, empty gateway.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a new connection with the default buffer size.
    #[must_use]
    pub fn connect(&self) -> ClientConnection {
        self.connect_with_buffer(DEFAULT_CONNECTION_BUFFER)
    }

    /// Registers a new connection buffering at most `buffer` undelivered events.
    #[must_use]
    pub fn connect_with_buffer(&self, buffer: usize) -> ClientConnection {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        let handle = ConnectionHandle::new();

        self.state.write().connections.insert(
            handle,
            ConnectionEntry {
                tx,
                groups: HashSet::new(),
            },
        );

        info!(connection = %handle, "Connection registered");

        ClientConnection { handle, rx }
    }

    /// Subscribes a connection to a group.
    ///
    /// # Errors
    ///
    /// Returns `Error::UnknownConnection` if the connection is not registered.
    pub fn subscribe(&self, handle: &ConnectionHandle, group_id: &str) -> Result<(), Error> {
        let mut state = self.state.write();

        let entry = state
            .connections
            .get_mut(handle)
            .ok_or(Error::UnknownConnection(*handle))?;
        entry.groups.insert(group_id.to_string());

        state
            .groups
            .entry(group_id.to_string())
            .or_default()
            .insert(*handle);

        debug!(connection = %handle, group_id, "Subscribed");
        Ok(())
    }

    /// Removes a connection's subscription to a group.
    pub fn unsubscribe(&self, handle: &ConnectionHandle, group_id: &str) {
        let mut state = self.state.write();

        if let Some(entry) = state.connections.get_mut(handle) {
            entry.groups.remove(group_id);
        }

        if let Some(members) = state.groups.get_mut(group_id) {
            members.remove(handle);
            if members.is_empty() {
                state.groups.remove(group_id);
            }
        }
    }

    /// Drops a connection and all of its subscriptions.
    pub fn disconnect(&self, handle: &ConnectionHandle) {
        if self.state.write().remove(handle) {
            info!(connection = %handle, "Connection removed");
        }
    }

    /// Number of registered connections.
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.state.read().connections.len()
    }
}

#[async_trait]
impl ConnectionGateway for MemoryGateway {
    type Error = Error;

    async fn subscribers_of(&self, group_id: &str) -> Result<Vec<ConnectionHandle>, Self::Error> {
        Ok(self
            .state
            .read()
            .groups
            .get(group_id)
            .map(|members| members.iter().copied().collect())
            .unwrap_or_default())
    }

    async fn push(&self, connection: &ConnectionHandle, payload: Bytes) -> Result<(), Self::Error> {
        let tx = self
            .state
            .read()
            .connections
            .get(connection)
            .map(|entry| entry.tx.clone())
            .ok_or(Error::UnknownConnection(*connection))?;

        if tx.send(payload).await.is_err() {
            // The client dropped its receiver; forget the connection.
            self.state.write().remove(connection);
            debug!(connection = %connection, "Pruned closed connection");
            return Err(Error::Closed(*connection));
        }

        Ok(())
    }
}
