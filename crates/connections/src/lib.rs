//! Abstract interface for the gateway that holds live client connections.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

use std::error::Error;
use std::fmt::{self, Debug, Display};

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Marker trait for `ConnectionGateway` errors
pub trait GatewayError: Debug + Error + Send + Sync + 'static {
    /// Whether the connection is gone for good, so retrying the push is pointless.
    fn is_disconnected(&self) -> bool;
}

/// Opaque handle to one live client connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConnectionHandle(Uuid);

impl ConnectionHandle {
    /// Creates a fresh, random handle.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// The underlying identifier.
    #[must_use]
    pub const fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for ConnectionHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for ConnectionHandle {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl Display for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0.simple())
    }
}

/// The client-facing connection gateway.
///
/// `subscribers_of` returns a snapshot: a connection may disconnect between
/// resolution and push, in which case `push` fails for that connection only.
#[async_trait]
pub trait ConnectionGateway: Send + Sync + 'static {
    /// The error type for gateway operations.
    type Error: GatewayError;

    /// Resolves the connections currently subscribed to `group_id`.
    async fn subscribers_of(&self, group_id: &str) -> Result<Vec<ConnectionHandle>, Self::Error>;

    /// Pushes an encoded event to one connection.
    async fn push(&self, connection: &ConnectionHandle, payload: Bytes) -> Result<(), Self::Error>;
}
