//! Closes the gap between the message log and the partition queue.
//!
//! A message can be committed to the log without reaching the queue, either
//! because its lane was full or because the process died between the two
//! steps. Deferred offsets are retried on a timer, and a log scan from a known
//! offset re-enqueues anything missing. Both may deliver a message twice.
//!
//! Parked offsets are bounded per partition. Once a partition's backlog is
//! full, new messages are rejected and a log scan pauses until it drains.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use herald_message_log::{MessageLog, Offset};
use parking_lot::Mutex;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::error::{Error, Result};
use crate::partitioner::Partitioner;
use crate::queue::PartitionQueue;
use crate::stats::FanoutStats;
use crate::task::{NewTask, PartitionId, PayloadRef, RoutingKey, TaskId};

/// What happened to a committed message handed to the reconciler.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Admission {
    /// Enqueued under this id.
    Queued(TaskId),

    /// Parked until its lane has room.
    Deferred,

    /// Already in its lane under this id.
    AlreadyQueued(TaskId),

    /// Already parked.
    AlreadyDeferred,

    /// Lane and backlog are both full. The message is committed but will not
    /// be fanned out unless it is enqueued again.
    Rejected,
}

/// Re-enqueues committed messages that never reached the queue.
pub struct Reconciler<M: MessageLog> {
    log: Arc<M>,
    queue: Arc<PartitionQueue>,
    partitioner: Partitioner,
    stats: Arc<FanoutStats>,
    batch: usize,
    max_deferred: usize,
    deferred: Mutex<HashMap<PartitionId, BTreeSet<Offset>>>,
    pending_replay: Mutex<Option<Offset>>,
}

impl<M: MessageLog> Reconciler<M> {
    /// Creates a reconciler reading the log `batch` messages at a time and
    /// parking at most `max_deferred` offsets per partition.
    pub fn new(
        log: Arc<M>,
        queue: Arc<PartitionQueue>,
        partitioner: Partitioner,
        stats: Arc<FanoutStats>,
        batch: usize,
        max_deferred: usize,
    ) -> Self {
        Self {
            log,
            queue,
            partitioner,
            stats,
            batch: batch.max(1),
            max_deferred,
            deferred: Mutex::new(HashMap::new()),
            pending_replay: Mutex::new(None),
        }
    }

    /// Parks a committed offset for the next retry pass. Returns false, parking
    /// nothing, when the partition's backlog is full.
    #[must_use]
    pub fn defer(&self, partition: PartitionId, offset: Offset) -> bool {
        let mut deferred = self.deferred.lock();
        let offsets = deferred.entry(partition).or_default();

        if offsets.contains(&offset) {
            return true;
        }

        if offsets.len() >= self.max_deferred {
            if offsets.is_empty() {
                deferred.remove(&partition);
            }
            return false;
        }

        offsets.insert(offset);
        drop(deferred);

        self.stats.add_deferred(1);
        debug!(%partition, %offset, "Deferred enqueue");
        true
    }

    /// Whether `partition` has parked offsets. New messages for such a
    /// partition must queue behind them.
    #[must_use]
    pub fn has_deferred(&self, partition: PartitionId) -> bool {
        self.deferred
            .lock()
            .get(&partition)
            .is_some_and(|offsets| !offsets.is_empty())
    }

    /// Number of parked offsets across all partitions.
    #[must_use]
    pub fn deferred_len(&self) -> usize {
        self.deferred.lock().values().map(BTreeSet::len).sum()
    }

    /// Offset a paused log scan resumes after, if one is waiting for the
    /// backlog to drain.
    #[must_use]
    pub fn pending_replay(&self) -> Option<Offset> {
        *self.pending_replay.lock()
    }

    /// Enqueues a committed message unless its lane is full or it is already
    /// known. A full lane, or one with older parked offsets, parks it. When
    /// the backlog is full too, the message is rejected.
    ///
    /// # Errors
    ///
    /// Returns `Error::UnknownPartition` if the partitioner and the queue
    /// disagree on the partition count.
    pub fn admit(&self, group_id: &str, offset: Offset) -> Result<Admission> {
        let routing_key = RoutingKey::from(group_id);
        let partition = self.partitioner.partition_of(&routing_key);

        if let Some(task_id) = self.queue.task_for_offset(partition, offset)? {
            return Ok(Admission::AlreadyQueued(task_id));
        }
        if self.is_deferred(partition, offset) {
            return Ok(Admission::AlreadyDeferred);
        }

        if self.has_deferred(partition) {
            if self.defer(partition, offset) {
                return Ok(Admission::Deferred);
            }
            self.stats.add_rejected(1);
            warn!(%partition, %offset, max_deferred = self.max_deferred, "Backlog full, fan-out rejected");
            return Ok(Admission::Rejected);
        }

        match self.enqueue(partition, routing_key, group_id, offset) {
            Ok(task_id) => Ok(Admission::Queued(task_id)),
            Err(Error::EnqueueRejected { .. }) if self.defer(partition, offset) => {
                Ok(Admission::Deferred)
            }
            Err(Error::EnqueueRejected { .. }) => {
                warn!(%partition, %offset, max_deferred = self.max_deferred, "Backlog full, fan-out rejected");
                Ok(Admission::Rejected)
            }
            Err(e) => Err(e),
        }
    }

    fn is_deferred(&self, partition: PartitionId, offset: Offset) -> bool {
        self.deferred
            .lock()
            .get(&partition)
            .is_some_and(|offsets| offsets.contains(&offset))
    }

    fn enqueue(
        &self,
        partition: PartitionId,
        routing_key: RoutingKey,
        group_id: &str,
        offset: Offset,
    ) -> Result<TaskId> {
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

    /// Retries every parked offset in log order, stopping per partition at the
    /// first lane that is still full. Returns how many were enqueued.
    ///
    /// # Errors
    ///
    /// Returns `Error::Log` if the log cannot be read.
    #[instrument(skip(self))]
    pub async fn retry_deferred(&self) -> Result<usize> {
        let parked: Vec<(PartitionId, Vec<Offset>)> = self
            .deferred
            .lock()
            .iter()
            .map(|(partition, offsets)| (*partition, offsets.iter().copied().collect()))
            .collect();

        let mut recovered = 0;

        for (partition, offsets) in parked {
            for offset in offsets {
                let message = self
                    .log
                    .get(offset)
                    .await
                    .map_err(|e| Error::Log(e.to_string()))?;

                let Some(message) = message else {
                    warn!(%offset, "Deferred message missing from log, dropping");
                    self.forget(partition, offset);
                    continue;
                };

                if self.queue.contains_offset(partition, offset)? {
                    self.forget(partition, offset);
                    continue;
                }

                match self.enqueue(
                    partition,
                    RoutingKey::from(message.group_id.as_str()),
                    &message.group_id,
                    offset,
                ) {
                    Ok(_) => {
                        self.forget(partition, offset);
                        recovered += 1;
                    }
                    Err(Error::EnqueueRejected { .. }) => break,
                    Err(e) => return Err(e),
                }
            }
        }

        if recovered > 0 {
            self.stats.add_recovered(recovered as u64);
            info!(recovered, remaining = self.deferred_len(), "Recovered deferred messages");
        }

        Ok(recovered)
    }

    fn forget(&self, partition: PartitionId, offset: Offset) {
        let mut deferred = self.deferred.lock();

        if let Some(offsets) = deferred.get_mut(&partition) {
            offsets.remove(&offset);
            if offsets.is_empty() {
                deferred.remove(&partition);
            }
        }
    }

    /// Scans the log after `after` and admits every message not already
    /// queued or parked. Returns how many were enqueued.
    ///
    /// The scan pauses at the first message whose backlog is full. `run`
    /// resumes it from there once every parked offset has been enqueued.
    ///
    /// # Errors
    ///
    /// Returns `Error::Log` if the log cannot be read.
    #[instrument(skip(self))]
    pub async fn replay_from(&self, after: Offset) -> Result<usize> {
        let mut cursor = after;
        let mut enqueued = 0;

        'scan: loop {
            let messages = self
                .log
                .read_from(cursor, self.batch)
                .await
                .map_err(|e| Error::Log(e.to_string()))?;

            if messages.is_empty() {
                break;
            }

            for message in &messages {
                match self.admit(&message.group_id, message.offset)? {
                    Admission::Queued(_) => enqueued += 1,
                    Admission::Rejected => {
                        *self.pending_replay.lock() = Some(cursor);
                        warn!(%after, resume_after = %cursor, "Backlog full, log replay paused");
                        break 'scan;
                    }
                    _ => {}
                }
                cursor = message.offset;
            }
        }

        if enqueued > 0 {
            self.stats.add_recovered(enqueued as u64);
        }

        info!(%after, head = %cursor, enqueued, "Log replay finished");
        Ok(enqueued)
    }

    /// Retries parked offsets every `interval` until `shutdown` fires.
    pub async fn run(&self, interval: Duration, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                () = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }

            if self.deferred_len() > 0 {
                if let Err(e) = self.retry_deferred().await {
                    warn!(error = %e, "Deferred retry failed");
                }
            }

            if self.deferred_len() > 0 {
                continue;
            }

            let resume = self.pending_replay.lock().take();
            if let Some(after) = resume {
                if let Err(e) = self.replay_from(after).await {
                    warn!(error = %e, %after, "Resumed log replay failed");
                    self.pending_replay.lock().get_or_insert(after);
                }
            }
        }

        debug!("Reconciler stopped");
    }
}
