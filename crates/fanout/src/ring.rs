//! The replica set competing for one partition.

use std::sync::Arc;

use herald_connections::ConnectionGateway;
use herald_leases::LeaseManager;
use herald_message_log::MessageLog;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::dead_letter::DeadLetterSink;
use crate::error::Result;
use crate::task::PartitionId;
use crate::worker::{Worker, WorkerContext, WorkerState};

/// Replica workers for a single partition.
///
/// At most one member is leader at a time; the lease manager decides which.
pub struct WorkerGroup {
    partition: PartitionId,
    members: Vec<Member>,
}

struct Member {
    id: String,
    state: watch::Receiver<WorkerState>,
    handle: JoinHandle<Result<()>>,
}

impl WorkerGroup {
    /// Spawns `replicas` workers for `partition`, named after `node_id`.
    pub fn spawn<L, G, M, D>(
        node_id: &str,
        partition: PartitionId,
        replicas: usize,
        context: &Arc<WorkerContext<L, G, M, D>>,
        shutdown: &CancellationToken,
    ) -> Self
    where
        L: LeaseManager,
        G: ConnectionGateway,
        M: MessageLog,
        D: DeadLetterSink,
    {
        let members = (0..replicas)
            .map(|replica| {
                let worker = Worker::new(
                    format!("{node_id}-p{}-r{replica}", partition.0),
                    partition,
                    context.clone(),
                    shutdown.child_token(),
                );

                Member {
                    id: worker.id().to_string(),
                    state: worker.subscribe(),
                    handle: tokio::spawn(worker.run()),
                }
            })
            .collect();

        info!(%partition, replicas, "Worker group spawned");

        Self { partition, members }
    }

    /// The partition this group serves.
    #[must_use]
    pub const fn partition(&self) -> PartitionId {
        self.partition
    }

    /// Number of replicas.
    #[must_use]
    pub fn len(&self) -> usize {
        self.members.len()
    }

    /// Whether the group has no replicas.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Id of the replica currently leading, if any.
    #[must_use]
    pub fn leader(&self) -> Option<String> {
        self.members
            .iter()
            .find(|member| member.state.borrow().is_leader())
            .map(|member| member.id.clone())
    }

    /// Waits for every replica to stop.
    pub async fn join(self) {
        for member in self.members {
            match member.handle.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!(worker = %member.id, error = %e, "Worker failed"),
                Err(e) => error!(worker = %member.id, error = %e, "Worker task panicked"),
            }
        }
    }
}
