use herald_connections::{ConnectionHandle, GatewayError};
use thiserror::Error;

/// Errors that can occur when using the in-memory gateway.
#[derive(Clone, Debug, Error)]
pub enum Error {
    /// The connection is not registered with the gateway.
    #[error("connection {0} is not connected")]
    UnknownConnection(ConnectionHandle),

    /// The client side of the connection has gone away.
    #[error("connection {0} was closed by the client")]
    Closed(ConnectionHandle),
}

impl GatewayError for Error {
    fn is_disconnected(&self) -> bool {
        matches!(self, Self::UnknownConnection(_) | Self::Closed(_))
    }
}
