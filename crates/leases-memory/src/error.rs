use herald_leases::LeaseManagerError;
use thiserror::Error;

/// Errors that can occur when using the in-memory lease manager.
#[derive(Clone, Debug, Error)]
pub enum Error {
    /// A lease was requested with a zero TTL.
    #[error("lease ttl for '{0}' must be greater than zero")]
    ZeroTtl(String),
}

impl LeaseManagerError for Error {}
