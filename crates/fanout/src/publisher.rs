//! Write-then-publish entry point.

use std::sync::Arc;

use herald_message_log::{MessageLog, NewMessage, Offset};
use serde::Serialize;
use tracing::{info, instrument, warn};

use crate::error::{Error, Result};
use crate::partitioner::Partitioner;
use crate::queue::PartitionQueue;
use crate::recovery::{Admission, Reconciler};
use crate::stats::FanoutStats;
use crate::task::{NewTask, PartitionId, PayloadRef, RoutingKey, TaskId};

/// Real-time status of a published message.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum FanoutStatus {
    /// Waiting in its partition lane.
    Queued(TaskId),

    /// Committed, but parked until its lane has room.
    Deferred,

    /// Committed, but the partition's lane and backlog are both full. The
    /// message stays in the log and is not fanned out in real time.
    Rejected,
}

/// Confirmation returned to the sender.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct PublishReceipt {
    /// Offset the message was committed at.
    pub offset: Offset,

    /// Partition responsible for fan-out.
    pub partition: PartitionId,

    /// Whether the message is already queued for fan-out.
    pub fanout: FanoutStatus,
}

/// Appends messages to the log and hands them to the partition queue.
pub struct Publisher<M: MessageLog> {
    log: Arc<M>,
    queue: Arc<PartitionQueue>,
    partitioner: Partitioner,
    reconciler: Arc<Reconciler<M>>,
    stats: Arc<FanoutStats>,
}

impl<M: MessageLog> Publisher<M> {
    /// Creates a publisher.
    pub const fn new(
        log: Arc<M>,
        queue: Arc<PartitionQueue>,
        partitioner: Partitioner,
        reconciler: Arc<Reconciler<M>>,
        stats: Arc<FanoutStats>,
    ) -> Self {
        Self {
            log,
            queue,
            partitioner,
            reconciler,
            stats,
        }
    }

    /// Commits `message` to the log, then queues it for fan-out.
    ///
    /// The send succeeds once the log append commits. A full lane defers
    /// fan-out, and a full backlog rejects it.
    ///
    /// # Errors
    ///
    /// Returns `Error::Log` if the append fails, in which case nothing is
    /// queued.
    #[instrument(skip(self, message), fields(group_id = %message.group_id))]
    pub async fn publish(&self, message: NewMessage) -> Result<PublishReceipt> {
        let group_id = message.group_id.clone();

        let offset = self
            .log
            .append(message)
            .await
            .map_err(|e| Error::Log(e.to_string()))?;

        let partition = self.partitioner.partition_of(&RoutingKey::from(group_id.as_str()));

        // Already known only if a replay raced this publish.
        let fanout = match self.reconciler.admit(&group_id, offset)? {
            Admission::Queued(task_id) | Admission::AlreadyQueued(task_id) => {
                FanoutStatus::Queued(task_id)
            }
            Admission::Deferred => {
                warn!(%offset, %partition, "Partition full, fan-out deferred");
                FanoutStatus::Deferred
            }
            Admission::AlreadyDeferred => FanoutStatus::Deferred,
            Admission::Rejected => FanoutStatus::Rejected,
        };

        info!(%offset, %partition, "Message published");

        Ok(PublishReceipt {
            offset,
            partition,
            fanout,
        })
    }

    /// Queues an already committed message without deferring.
    ///
    /// # Errors
    ///
    /// Returns `Error::EnqueueRejected` when the lane is full, leaving the
    /// retry to the caller.
    pub fn enqueue_committed(&self, group_id: &str, offset: Offset) -> Result<TaskId> {
        let routing_key = RoutingKey::from(group_id);
        let partition = self.partitioner.partition_of(&routing_key);

        let result = self.queue.enqueue(NewTask {
            partition,
            routing_key,
            payload: PayloadRef {
                group_id: group_id.to_string(),
                offset,
            },
        });

        match &result {
            Ok(_) => self.stats.add_enqueued(1),
            Err(Error::EnqueueRejected { .. }) => self.stats.add_rejected(1),
            Err(_) => {}
        }

        result
    }

    /// The partitioner in use.
    #[must_use]
    pub const fn partitioner(&self) -> &Partitioner {
        &self.partitioner
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use assert_matches::assert_matches;
    use herald_message_log_memory::MemoryMessageLog;

    fn publisher(
        capacity: usize,
    ) -> (
        Publisher<MemoryMessageLog>,
        Arc<MemoryMessageLog>,
        Arc<FanoutStats>,
    ) {
        let log = Arc::new(MemoryMessageLog::new());
        let queue = Arc::new(PartitionQueue::new(4, capacity, 3));
        let partitioner = Partitioner::new(4).unwrap();
        let stats = Arc::new(FanoutStats::default());
        let reconciler = Arc::new(Reconciler::new(
            log.clone(),
            queue.clone(),
            partitioner,
            stats.clone(),
            16,
            2,
        ));

        (
            Publisher::new(log.clone(), queue, partitioner, reconciler, stats.clone()),
            log,
            stats,
        )
    }

    #[tokio::test]
    async fn test_publish_commits_then_queues() {
        let (publisher, log, stats) = publisher(10);

        let receipt = publisher
            .publish(NewMessage::new("group-17", "alice", "hello"))
            .await
            .unwrap();

        assert_eq!(receipt.offset, Offset(1));
        assert_eq!(
            receipt.partition,
            publisher.partitioner().partition_of(&RoutingKey::from("group-17"))
        );
        assert_matches!(receipt.fanout, FanoutStatus::Queued(id) if id.partition == receipt.partition);
        assert!(log.get(receipt.offset).await.unwrap().is_some());
        assert_eq!(stats.snapshot().enqueued, 1);
    }

    #[tokio::test]
    async fn test_failed_append_queues_nothing() {
        let (publisher, log, stats) = publisher(10);
        log.set_read_only(true);

        let result = publisher
            .publish(NewMessage::new("group-17", "alice", "hello"))
            .await;

        assert_matches!(result, Err(Error::Log(_)));
        assert_eq!(stats.snapshot().enqueued, 0);
    }

    #[tokio::test]
    async fn test_full_lane_defers_but_send_succeeds() {
        let (publisher, _log, stats) = publisher(1);

        publisher
            .publish(NewMessage::new("group-17", "alice", "one"))
            .await
            .unwrap();
        let receipt = publisher
            .publish(NewMessage::new("group-17", "alice", "two"))
            .await
            .unwrap();

        assert_eq!(receipt.fanout, FanoutStatus::Deferred);
        assert_eq!(receipt.offset, Offset(2));

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.rejected, 1);
        assert_eq!(snapshot.deferred, 1);
    }

    #[tokio::test]
    async fn test_publish_past_backlog_is_rejected() {
        let (publisher, log, stats) = publisher(1);

        let mut receipts = Vec::new();
        for i in 0..500 {
            let receipt = publisher
                .publish(NewMessage::new("group-17", "alice", format!("m{i}")))
                .await
                .unwrap();
            receipts.push(receipt.fanout);
        }

        assert_matches!(receipts[0], FanoutStatus::Queued(_));
        assert_eq!(receipts[1..3], [FanoutStatus::Deferred; 2]);
        assert!(receipts[3..].iter().all(|s| *s == FanoutStatus::Rejected));

        // Every send committed, but only lane plus backlog is held in memory.
        assert_eq!(log.head().await.unwrap(), Offset(500));
        let snapshot = stats.snapshot();
        assert_eq!(snapshot.enqueued, 1);
        assert_eq!(snapshot.deferred, 2);
        assert_eq!(snapshot.rejected, 498);
    }

    #[tokio::test]
    async fn test_known_offset_reports_existing_task() {
        let (publisher, log, _stats) = publisher(10);
        let offset = log
            .append(NewMessage::new("group-17", "alice", "hello"))
            .await
            .unwrap();

        let task_id = publisher.enqueue_committed("group-17", offset).unwrap();

        assert_eq!(
            publisher.reconciler.admit("group-17", offset).unwrap(),
            Admission::AlreadyQueued(task_id)
        );
    }

    #[tokio::test]
    async fn test_enqueue_committed_exposes_rejection() {
        let (publisher, _log, _stats) = publisher(1);

        publisher.enqueue_committed("group-17", Offset(1)).unwrap();

        assert_matches!(
            publisher.enqueue_committed("group-17", Offset(2)),
            Err(Error::EnqueueRejected { capacity: 1, .. })
        );
    }
}
