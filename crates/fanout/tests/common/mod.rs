//! Shared harness for pipeline integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use herald_connections::{ConnectionGateway, ConnectionHandle, GatewayError};
use herald_connections_memory::{ClientConnection, MemoryGateway};
use herald_fanout::{DeliveryEnvelope, FanoutConfig, FanoutService, MemoryDeadLetterSink};
use herald_leases_memory::MemoryLeaseManager;
use herald_message_log_memory::MemoryMessageLog;

pub type TestService<G> =
    FanoutService<MemoryLeaseManager, G, MemoryMessageLog, MemoryDeadLetterSink>;

pub struct Harness<G: ConnectionGateway> {
    pub service: TestService<G>,
    pub leases: Arc<MemoryLeaseManager>,
    pub gateway: Arc<G>,
    pub log: Arc<MemoryMessageLog>,
    pub dead_letters: Arc<MemoryDeadLetterSink>,
}

pub fn config(partition_count: u32) -> FanoutConfig {
    FanoutConfig {
        partition_count,
        replicas_per_partition: 3,
        lease_ttl: Duration::from_secs(5),
        renew_interval: Duration::from_millis(1500),
        election_interval: Duration::from_millis(200),
        recovery_interval: Duration::from_millis(100),
        ..FanoutConfig::default()
    }
}

pub fn harness<G: ConnectionGateway>(config: FanoutConfig, gateway: G) -> Harness<G> {
    let leases = Arc::new(MemoryLeaseManager::new());
    let gateway = Arc::new(gateway);
    let log = Arc::new(MemoryMessageLog::new());
    let dead_letters = Arc::new(MemoryDeadLetterSink::new());

    let service = FanoutService::new(
        config,
        "node-a",
        leases.clone(),
        gateway.clone(),
        log.clone(),
        dead_letters.clone(),
    )
    .unwrap();

    Harness {
        service,
        leases,
        gateway,
        log,
        dead_letters,
    }
}

/// Polls `condition` until it holds, panicking after a minute of (possibly
/// paused) time.
pub async fn eventually(what: &str, mut condition: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(60);

    while !condition() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for {what}"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

pub async fn next_envelope(client: &mut ClientConnection) -> DeliveryEnvelope {
    let payload = tokio::time::timeout(Duration::from_secs(60), client.recv())
        .await
        .expect("no delivery within a minute")
        .expect("connection closed");

    DeliveryEnvelope::decode(&payload).unwrap()
}

#[derive(Debug, thiserror::Error)]
#[error("gateway unavailable")]
pub struct Unavailable;

impl GatewayError for Unavailable {
    fn is_disconnected(&self) -> bool {
        false
    }
}

/// A gateway whose first push never completes.
#[derive(Default)]
pub struct StallingGateway {
    pub inner: MemoryGateway,
    pub pushes: AtomicUsize,
}

#[async_trait]
impl ConnectionGateway for StallingGateway {
    type Error = herald_connections_memory::Error;

    async fn subscribers_of(&self, group_id: &str) -> Result<Vec<ConnectionHandle>, Self::Error> {
        self.inner.subscribers_of(group_id).await
    }

    async fn push(&self, connection: &ConnectionHandle, payload: Bytes) -> Result<(), Self::Error> {
        if self.pushes.fetch_add(1, Ordering::SeqCst) == 0 {
            std::future::pending::<()>().await;
        }

        self.inner.push(connection, payload).await
    }
}

/// A gateway that cannot resolve subscribers while `down` is set.
#[derive(Default)]
pub struct UnreachableGateway {
    pub inner: MemoryGateway,
    pub down: AtomicBool,
    pub lookups: AtomicUsize,
}

#[async_trait]
impl ConnectionGateway for UnreachableGateway {
    type Error = Unavailable;

    async fn subscribers_of(&self, group_id: &str) -> Result<Vec<ConnectionHandle>, Self::Error> {
        self.lookups.fetch_add(1, Ordering::SeqCst);

        if self.down.load(Ordering::SeqCst) {
            return Err(Unavailable);
        }

        Ok(self.inner.subscribers_of(group_id).await.unwrap_or_default())
    }

    async fn push(&self, connection: &ConnectionHandle, payload: Bytes) -> Result<(), Self::Error> {
        self.inner
            .push(connection, payload)
            .await
            .map_err(|_| Unavailable)
    }
}
