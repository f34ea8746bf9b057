//! In-memory (single node) implementation of leases for local development and tests.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod error;

pub use error::Error;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use herald_leases::{Lease, LeaseManager, LeaseStatus, ScopedLeaseManager};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info};

#[derive(Clone, Debug)]
struct LeaseRecord {
    holder: String,
    token: u64,
    expires_at: Instant,
}

#[derive(Debug, Default)]
struct LeaseTable {
    records: HashMap<String, LeaseRecord>,
    last_token: u64,
}

impl LeaseTable {
    fn live(&self, key: &str, now: Instant) -> Option<&LeaseRecord> {
        self.records.get(key).filter(|record| now < record.expires_at)
    }
}

/// In-memory lease manager.
///
/// Clones and scopes share one lease table, so every replica in a process
/// competes for the same leases.
#[derive(Clone, Debug, Default)]
pub struct MemoryLeaseManager {
    table: Arc<Mutex<LeaseTable>>,
    prefix: Option<String>,
}

impl MemoryLeaseManager {
    /// Creates a new instance of `MemoryLeaseManager`.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn get_key(&self, resource: &str) -> String {
        match &self.prefix {
            Some(prefix) => format!("{prefix}:{resource}"),
            None => resource.to_string(),
        }
    }

    /// Forces the lease on `resource` to lapse as if its holder stopped renewing.
    ///
    /// The next renewal by the former holder is refused.
    pub async fn expire(&self, resource: &str) {
        let key = self.get_key(resource);

        if self.table.lock().await.records.remove(&key).is_some() {
            info!(key = %key, "Lease forcibly expired");
        }
    }

    /// Revokes whatever lease `resource` has and grants it to `holder` at once.
    ///
    /// Simulates a takeover by another node: the previous holder's renewals
    /// are refused and `holder` gets a fresh fencing token.
    ///
    /// # Errors
    ///
    /// Returns `Error::ZeroTtl` if `ttl` is zero.
    pub async fn revoke(&self, resource: &str, holder: &str, ttl: Duration) -> Result<Lease, Error> {
        if ttl.is_zero() {
            return Err(Error::ZeroTtl(resource.to_string()));
        }

        let key = self.get_key(resource);
        let expires_at = Instant::now() + ttl;
        let mut table = self.table.lock().await;

        table.last_token += 1;
        let token = table.last_token;

        if let Some(previous) = table.records.insert(
            key.clone(),
            LeaseRecord {
                holder: holder.to_string(),
                token,
                expires_at,
            },
        ) {
            info!(key = %key, previous = %previous.holder, holder = %holder, token, "Lease revoked");
        }

        Ok(Lease {
            resource: resource.to_string(),
            holder: holder.to_string(),
            token,
            ttl,
            expires_at,
        })
    }

    /// Returns the holder and fencing token of the live lease on `resource`, if any.
    pub async fn holder(&self, resource: &str) -> Option<(String, u64)> {
        let key = self.get_key(resource);
        let table = self.table.lock().await;

        table
            .live(&key, Instant::now())
            .map(|record| (record.holder.clone(), record.token))
    }
}

#[async_trait]
impl LeaseManager for MemoryLeaseManager {
    type Error = Error;

    async fn check(&self, resource: &str, holder: &str) -> Result<LeaseStatus, Self::Error> {
        let key = self.get_key(resource);
        let table = self.table.lock().await;

        Ok(match table.live(&key, Instant::now()) {
            None => LeaseStatus::Free,
            Some(record) if record.holder == holder => LeaseStatus::HeldBySelf,
            Some(record) => LeaseStatus::HeldByOther(record.holder.clone()),
        })
    }

    async fn try_acquire(
        &self,
        resource: &str,
        holder: &str,
        ttl: Duration,
    ) -> Result<Option<Lease>, Self::Error> {
        if ttl.is_zero() {
            return Err(Error::ZeroTtl(resource.to_string()));
        }

        let key = self.get_key(resource);
        let now = Instant::now();
        let mut table = self.table.lock().await;

        if let Some(record) = table.live(&key, now) {
            debug!(key = %key, holder = %record.holder, "Lease held by another, denying");
            return Ok(None);
        }

        table.last_token += 1;
        let token = table.last_token;
        let expires_at = now + ttl;

        table.records.insert(
            key.clone(),
            LeaseRecord {
                holder: holder.to_string(),
                token,
                expires_at,
            },
        );

        info!(key = %key, holder = %holder, token, "Lease acquired");

        Ok(Some(Lease {
            resource: resource.to_string(),
            holder: holder.to_string(),
            token,
            ttl,
            expires_at,
        }))
    }

    async fn renew(&self, lease: &Lease) -> Result<Option<Lease>, Self::Error> {
        let key = self.get_key(&lease.resource);
        let now = Instant::now();
        let mut table = self.table.lock().await;

        let Some(record) = table.records.get_mut(&key) else {
            debug!(key = %key, token = lease.token, "Renewal refused, no lease on record");
            return Ok(None);
        };

        if record.token != lease.token || now >= record.expires_at {
            debug!(key = %key, token = lease.token, "Renewal refused, lease lapsed");
            return Ok(None);
        }

        record.expires_at = now + lease.ttl;

        Ok(Some(Lease {
            expires_at: record.expires_at,
            ..lease.clone()
        }))
    }

    async fn release(&self, lease: &Lease) -> Result<(), Self::Error> {
        let key = self.get_key(&lease.resource);
        let mut table = self.table.lock().await;

        if table
            .records
            .get(&key)
            .is_some_and(|record| record.token == lease.token)
        {
            table.records.remove(&key);
            info!(key = %key, token = lease.token, "Lease released");
        }

        Ok(())
    }
}

impl ScopedLeaseManager for MemoryLeaseManager {
    type Error = Error;
    type Scoped = Self;

    fn scope<S>(&self, scope: S) -> Self::Scoped
    where
        S: AsRef<str> + Send,
    {
        let prefix = match &self.prefix {
            Some(existing) => format!("{existing}:{}", scope.as_ref()),
            None => scope.as_ref().to_string(),
        };

        Self {
            table: self.table.clone(),
            prefix: Some(prefix),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use assert_matches::assert_matches;

    const TTL: Duration = Duration::from_secs(3);

    #[tokio::test(start_paused = true)]
    async fn test_acquire_and_release_lease() {
        let manager = MemoryLeaseManager::new();

        let lease = manager
            .try_acquire("partition-0", "worker-a", TTL)
            .await
            .unwrap()
            .expect("free lease should be granted");

        assert_eq!(
            manager.check("partition-0", "worker-a").await.unwrap(),
            LeaseStatus::HeldBySelf
        );
        assert_eq!(
            manager.check("partition-0", "worker-b").await.unwrap(),
            LeaseStatus::HeldByOther("worker-a".to_string())
        );

        manager.release(&lease).await.unwrap();

        assert_eq!(
            manager.check("partition-0", "worker-a").await.unwrap(),
            LeaseStatus::Free
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_holder_denied_until_expiry() {
        let manager = MemoryLeaseManager::new();

        let first = manager
            .try_acquire("partition-0", "worker-a", TTL)
            .await
            .unwrap()
            .unwrap();

        assert!(
            manager
                .try_acquire("partition-0", "worker-b", TTL)
                .await
                .unwrap()
                .is_none()
        );

        tokio::time::advance(TTL).await;

        let second = manager
            .try_acquire("partition-0", "worker-b", TTL)
            .await
            .unwrap()
            .expect("expired lease should be re-granted");

        assert!(second.token > first.token);
        assert!(manager.renew(&first).await.unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_renew_extends_expiry() {
        let manager = MemoryLeaseManager::new();
        let lease = manager
            .try_acquire("partition-0", "worker-a", TTL)
            .await
            .unwrap()
            .unwrap();

        tokio::time::advance(Duration::from_secs(2)).await;

        let renewed = manager.renew(&lease).await.unwrap().unwrap();
        assert_eq!(renewed.token, lease.token);
        assert!(renewed.expires_at > lease.expires_at);

        tokio::time::advance(Duration::from_secs(2)).await;

        // Past the original expiry but inside the renewed window.
        assert!(
            manager
                .try_acquire("partition-0", "worker-b", TTL)
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_expire_refuses_renewal() {
        let manager = MemoryLeaseManager::new();
        let lease = manager
            .try_acquire("partition-0", "worker-a", TTL)
            .await
            .unwrap()
            .unwrap();

        manager.expire("partition-0").await;

        assert!(manager.renew(&lease).await.unwrap().is_none());
        assert_eq!(manager.holder("partition-0").await, None);
    }

    #[tokio::test]
    async fn test_revoke_hands_lease_to_new_holder() {
        let manager = MemoryLeaseManager::new();
        let old = manager
            .try_acquire("partition-0", "worker-a", TTL)
            .await
            .unwrap()
            .unwrap();

        let new = manager
            .revoke("partition-0", "worker-b", TTL)
            .await
            .unwrap();

        assert!(new.token > old.token);
        assert!(manager.renew(&old).await.unwrap().is_none());
        assert_eq!(
            manager.holder("partition-0").await,
            Some(("worker-b".to_string(), new.token))
        );

        // The deposed holder's release leaves the new lease alone.
        manager.release(&old).await.unwrap();
        assert!(manager.renew(&new).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_stale_release_is_noop() {
        let manager = MemoryLeaseManager::new();
        let stale = manager
            .try_acquire("partition-0", "worker-a", TTL)
            .await
            .unwrap()
            .unwrap();

        manager.expire("partition-0").await;

        let current = manager
            .try_acquire("partition-0", "worker-b", TTL)
            .await
            .unwrap()
            .unwrap();

        manager.release(&stale).await.unwrap();

        assert_eq!(
            manager.holder("partition-0").await,
            Some(("worker-b".to_string(), current.token))
        );
    }

    #[tokio::test]
    async fn test_zero_ttl_rejected() {
        let manager = MemoryLeaseManager::new();

        assert_matches!(
            manager
                .try_acquire("partition-0", "worker-a", Duration::ZERO)
                .await,
            Err(Error::ZeroTtl(_))
        );
    }

    #[tokio::test]
    async fn test_scoped_lease_manager_shares_table() {
        let unscoped = MemoryLeaseManager::new();
        let scoped = unscoped.scope("ring");

        scoped
            .try_acquire("partition-0", "worker-a", TTL)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(
            unscoped.check("ring:partition-0", "worker-b").await.unwrap(),
            LeaseStatus::HeldByOther("worker-a".to_string())
        );
        assert_eq!(
            unscoped.check("partition-0", "worker-b").await.unwrap(),
            LeaseStatus::Free
        );

        let nested = scoped.scope("inner");
        nested
            .try_acquire("partition-0", "worker-c", TTL)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(
            unscoped.holder("ring:inner:partition-0").await.map(|(h, _)| h),
            Some("worker-c".to_string())
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_acquisition_grants_single_lease() {
        let manager = MemoryLeaseManager::new();

        for round in 0..20 {
            let resource = format!("partition-{round}");
            let attempts = (0..16).map(|_| {
                let manager = manager.clone();
                let resource = resource.clone();
                let holder = uuid::Uuid::new_v4().to_string();
                tokio::spawn(async move { manager.try_acquire(&resource, &holder, TTL).await })
            });

            let granted = futures::future::join_all(attempts)
                .await
                .into_iter()
                .map(|joined| joined.unwrap().unwrap())
                .filter(Option::is_some)
                .count();

            assert_eq!(granted, 1, "round {round} granted {granted} leases");
        }
    }
}
