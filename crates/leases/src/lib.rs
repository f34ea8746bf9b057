//! Abstract interface for time-bounded, exclusive leases over named resources.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

use std::error::Error;
use std::fmt::Debug;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

/// Marker trait for `LeaseManager` errors
pub trait LeaseManagerError: Debug + Error + Send + Sync + 'static {}

/// A granted lease.
///
/// A lease is only meaningful until `expires_at`. Holders must renew before
/// then and must stop acting on the resource as soon as a renewal is refused.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    /// The leased resource.
    pub resource: String,

    /// Identifier of the holder.
    pub holder: String,

    /// Fencing token. Strictly increases every time the resource changes hands.
    pub token: u64,

    /// Time-to-live the lease was granted with.
    pub ttl: Duration,

    /// Instant after which the lease is no longer valid.
    pub expires_at: Instant,
}

impl Lease {
    /// Whether the lease is still valid at `now`.
    #[must_use]
    pub fn is_valid_at(&self, now: Instant) -> bool {
        now < self.expires_at
    }

    /// Time left before expiry, zero if already expired.
    #[must_use]
    pub fn remaining(&self, now: Instant) -> Duration {
        self.expires_at.saturating_duration_since(now)
    }
}

/// Represents the current status of a lease.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LeaseStatus {
    /// No valid lease exists.
    Free,

    /// The lease is held by another holder, identified by the String.
    HeldByOther(String),

    /// The lease is held by the asking holder.
    HeldBySelf,
}

/// A lease manager with asynchronous operations.
///
/// Implementations must never grant two simultaneously valid leases for the
/// same resource.
#[async_trait]
pub trait LeaseManager: Send + Sync + 'static {
    /// The error type for lease operations.
    type Error: LeaseManagerError;

    /// Checks the status of a lease from the point of view of `holder`.
    async fn check(&self, resource: &str, holder: &str) -> Result<LeaseStatus, Self::Error>;

    /// Attempts to acquire a lease without waiting.
    ///
    /// Returns `Ok(None)` if another holder has a valid lease.
    async fn try_acquire(
        &self,
        resource: &str,
        holder: &str,
        ttl: Duration,
    ) -> Result<Option<Lease>, Self::Error>;

    /// Extends a lease by its original TTL.
    ///
    /// Returns `Ok(None)` if the lease already expired or is no longer held by
    /// the lease's holder.
    async fn renew(&self, lease: &Lease) -> Result<Option<Lease>, Self::Error>;

    /// Gives a lease up before expiry. Releasing a lease that is no longer held
    /// is a no-op.
    async fn release(&self, lease: &Lease) -> Result<(), Self::Error>;
}

/// A lease manager that can be narrowed to a sub-namespace.
pub trait ScopedLeaseManager
where
    Self: Clone + Send + Sync + 'static,
{
    /// The error type for the lease manager.
    type Error: LeaseManagerError;

    /// The scoped lease manager type.
    type Scoped: LeaseManager<Error = Self::Error>;

    /// Creates a scoped lease manager.
    fn scope<S>(&self, scope: S) -> Self::Scoped
    where
        S: AsRef<str> + Send;
}
