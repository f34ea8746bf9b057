//! Bounded, ordered, at-least-once delivery lanes, one per partition.
//!
//! A task stays in its lane until it is acknowledged or dead-lettered. Only
//! the head of a lane is ever claimed, so a lane has at most one task in
//! flight and tasks reach the dispatcher in enqueue order.

use std::collections::VecDeque;

use herald_message_log::Offset;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::task::{DeliveryTask, NewTask, PartitionId, TaskId, TaskStatus};

/// Result of a negative acknowledgement.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum NackOutcome {
    /// Back at the head of its lane, pending redelivery.
    Requeued(DeliveryTask),

    /// Attempts exhausted; removed from the lane.
    DeadLettered(DeliveryTask),
}

/// Result of claiming the head of a lane.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Claim {
    /// The task now in flight for the caller, if any.
    pub task: Option<DeliveryTask>,

    /// A task abandoned by an older lease that ran out of attempts while being
    /// reclaimed. The caller must hand it to the dead-letter sink.
    pub dead_lettered: Option<DeliveryTask>,
}

impl Claim {
    const fn is_empty(&self) -> bool {
        self.task.is_none() && self.dead_lettered.is_none()
    }
}

#[derive(Default)]
struct LaneState {
    tasks: VecDeque<DeliveryTask>,
    next_sequence: u64,
}

#[derive(Default)]
struct Lane {
    state: Mutex<LaneState>,
    notify: Notify,
}

/// The partition queue.
pub struct PartitionQueue {
    lanes: Vec<Lane>,
    capacity: usize,
    max_attempts: u32,
}

impl PartitionQueue {
    /// Creates `partition_count` empty lanes, each holding at most `capacity`
    /// unacknowledged tasks.
    #[must_use]
    pub fn new(partition_count: u32, capacity: usize, max_attempts: u32) -> Self {
        Self {
            lanes: (0..partition_count).map(|_| Lane::default()).collect(),
            capacity,
            max_attempts,
        }
    }

    /// Number of lanes.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn partition_count(&self) -> u32 {
        self.lanes.len() as u32
    }

    /// Per-lane capacity.
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    fn lane(&self, partition: PartitionId) -> Result<&Lane> {
        self.lanes
            .get(partition.0 as usize)
            .ok_or(Error::UnknownPartition(partition))
    }

    /// Appends a task to the tail of its lane.
    ///
    /// # Errors
    ///
    /// Returns `Error::EnqueueRejected` when the lane is full and
    /// `Error::UnknownPartition` for an out-of-range partition.
    pub fn enqueue(&self, task: NewTask) -> Result<TaskId> {
        let lane = self.lane(task.partition)?;

        let task_id = {
            let mut state = lane.state.lock();

            if state.tasks.len() >= self.capacity {
                debug!(partition = %task.partition, capacity = self.capacity, "Lane full, rejecting enqueue");
                return Err(Error::EnqueueRejected {
                    partition: task.partition,
                    capacity: self.capacity,
                });
            }

            state.next_sequence += 1;
            let task_id = TaskId {
                partition: task.partition,
                sequence: state.next_sequence,
            };

            state.tasks.push_back(DeliveryTask {
                task_id,
                routing_key: task.routing_key,
                payload: task.payload,
                enqueue_time: Instant::now(),
                attempt_count: 0,
                status: TaskStatus::Pending,
            });

            task_id
        };

        lane.notify.notify_waiters();
        Ok(task_id)
    }

    /// The head of a lane, without claiming it.
    ///
    /// # Errors
    ///
    /// Returns `Error::UnknownPartition` for an out-of-range partition.
    pub fn peek_next(&self, partition: PartitionId) -> Result<Option<DeliveryTask>> {
        Ok(self.lane(partition)?.state.lock().tasks.front().cloned())
    }

    /// Moves the head of a lane into flight under `lease_token`.
    ///
    /// A head left in flight by an older lease is nacked first, then claimed
    /// (or dead-lettered if that nack exhausted its attempts). A head already
    /// in flight under `lease_token` yields nothing.
    ///
    /// # Errors
    ///
    /// Returns `Error::UnknownPartition` for an out-of-range partition and
    /// `Error::LeaseLost` if the head is held under a newer lease.
    pub fn claim_next(&self, partition: PartitionId, lease_token: u64) -> Result<Claim> {
        let lane = self.lane(partition)?;
        let mut state = lane.state.lock();
        let mut claim = Claim::default();

        if let Some(head) = state.tasks.front_mut() {
            if let TaskStatus::InFlight { lease_token: held } = head.status {
                if held == lease_token {
                    return Ok(claim);
                }

                if held > lease_token {
                    return Err(Error::LeaseLost { partition });
                }

                warn!(task_id = %head.task_id, stale_token = held, lease_token, "Reclaiming task abandoned by previous leader");

                if let Some(NackOutcome::DeadLettered(task)) =
                    Self::nack_head(&mut state.tasks, self.max_attempts)
                {
                    claim.dead_lettered = Some(task);
                }
            }
        }

        if let Some(head) = state.tasks.front_mut() {
            head.status = TaskStatus::InFlight { lease_token };
            claim.task = Some(head.clone());
        }

        Ok(claim)
    }

    /// Waits until the head of a lane can be claimed under `lease_token`.
    ///
    /// # Errors
    ///
    /// Fails as [`Self::claim_next`] does.
    pub async fn next(&self, partition: PartitionId, lease_token: u64) -> Result<Claim> {
        let lane = self.lane(partition)?;

        loop {
            let notified = lane.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let claim = self.claim_next(partition, lease_token)?;
            if !claim.is_empty() {
                return Ok(claim);
            }

            notified.await;
        }
    }

    /// Acknowledges an in-flight task, removing it from its lane.
    ///
    /// # Errors
    ///
    /// Returns `Error::UnknownTask` if the task is not queued and
    /// `Error::NotInFlight` if it was never claimed.
    pub fn ack(&self, task_id: TaskId) -> Result<DeliveryTask> {
        self.ack_fenced(task_id, None)
    }

    /// Acknowledges a task only if it is still in flight under the lease token
    /// it was claimed with.
    ///
    /// # Errors
    ///
    /// Returns `Error::LeaseLost` if a newer lease has reclaimed the task, plus
    /// the errors of [`PartitionQueue::ack`].
    pub fn ack_claimed(&self, task: &DeliveryTask) -> Result<DeliveryTask> {
        self.ack_fenced(task.task_id, Self::claim_token(task))
    }

    /// Negatively acknowledges an in-flight task.
    ///
    /// The attempt count is incremented. Once it reaches `max_attempts` the task
    /// is removed and returned as dead-lettered; otherwise it goes back to the
    /// head of its lane so ordering is kept.
    ///
    /// # Errors
    ///
    /// Returns `Error::UnknownTask` if the task is not queued and
    /// `Error::NotInFlight` if it was never claimed.
    pub fn nack(&self, task_id: TaskId) -> Result<NackOutcome> {
        self.nack_fenced(task_id, None)
    }

    /// Negatively acknowledges a task only if it is still in flight under the
    /// lease token it was claimed with.
    ///
    /// # Errors
    ///
    /// Returns `Error::LeaseLost` if a newer lease has reclaimed the task, plus
    /// the errors of [`PartitionQueue::nack`].
    pub fn nack_claimed(&self, task: &DeliveryTask) -> Result<NackOutcome> {
        self.nack_fenced(task.task_id, Self::claim_token(task))
    }

    const fn claim_token(task: &DeliveryTask) -> Option<u64> {
        match task.status {
            TaskStatus::InFlight { lease_token } => Some(lease_token),
            _ => None,
        }
    }

    fn check_in_flight(task: &DeliveryTask, expected: Option<u64>) -> Result<()> {
        match (task.status, expected) {
            (TaskStatus::InFlight { lease_token }, Some(expected)) if lease_token != expected => {
                Err(Error::LeaseLost {
                    partition: task.task_id.partition,
                })
            }
            (TaskStatus::InFlight { .. }, _) => Ok(()),
            _ => Err(Error::NotInFlight(task.task_id)),
        }
    }

    fn ack_fenced(&self, task_id: TaskId, expected: Option<u64>) -> Result<DeliveryTask> {
        let lane = self.lane(task_id.partition)?;
        let mut state = lane.state.lock();

        let index = Self::position(&state.tasks, task_id)?;
        Self::check_in_flight(&state.tasks[index], expected)?;

        let mut task = state
            .tasks
            .remove(index)
            .ok_or(Error::UnknownTask(task_id))?;
        task.status = TaskStatus::Delivered;

        debug!(%task_id, "Task acknowledged");
        Ok(task)
    }

    fn nack_fenced(&self, task_id: TaskId, expected: Option<u64>) -> Result<NackOutcome> {
        let lane = self.lane(task_id.partition)?;

        let outcome = {
            let mut state = lane.state.lock();

            // Claims only ever take the head, so an in-flight task is always there.
            let index = Self::position(&state.tasks, task_id)?;
            Self::check_in_flight(&state.tasks[index], expected)?;
            if index != 0 {
                return Err(Error::NotInFlight(task_id));
            }

            Self::nack_head(&mut state.tasks, self.max_attempts)
                .ok_or(Error::UnknownTask(task_id))?
        };

        lane.notify.notify_waiters();
        Ok(outcome)
    }

    fn nack_head(tasks: &mut VecDeque<DeliveryTask>, max_attempts: u32) -> Option<NackOutcome> {
        let head = tasks.front_mut()?;
        head.attempt_count += 1;

        if head.attempt_count < max_attempts {
            head.status = TaskStatus::Pending;
            debug!(task_id = %head.task_id, attempts = head.attempt_count, "Task requeued");
            return Some(NackOutcome::Requeued(head.clone()));
        }

        let mut task = tasks.pop_front()?;
        task.status = TaskStatus::DeadLettered;
        warn!(task_id = %task.task_id, attempts = task.attempt_count, "Task dead-lettered");
        Some(NackOutcome::DeadLettered(task))
    }

    fn position(tasks: &VecDeque<DeliveryTask>, task_id: TaskId) -> Result<usize> {
        tasks
            .binary_search_by_key(&task_id.sequence, |task| task.task_id.sequence)
            .map_err(|_| Error::UnknownTask(task_id))
    }

    /// Unacknowledged tasks in a lane.
    ///
    /// # Errors
    ///
    /// Returns `Error::UnknownPartition` for an out-of-range partition.
    pub fn len(&self, partition: PartitionId) -> Result<usize> {
        Ok(self.lane(partition)?.state.lock().tasks.len())
    }

    /// Whether a lane is empty.
    ///
    /// # Errors
    ///
    /// Returns `Error::UnknownPartition` for an out-of-range partition.
    pub fn is_empty(&self, partition: PartitionId) -> Result<bool> {
        Ok(self.len(partition)? == 0)
    }

    /// Unacknowledged tasks across all lanes.
    #[must_use]
    pub fn total_len(&self) -> usize {
        self.lanes.iter().map(|lane| lane.state.lock().tasks.len()).sum()
    }

    /// Whether a lane already holds a task for the message at `offset`.
    ///
    /// # Errors
    ///
    /// Returns `Error::UnknownPartition` for an out-of-range partition.
    pub fn contains_offset(&self, partition: PartitionId, offset: Offset) -> Result<bool> {
        Ok(self.task_for_offset(partition, offset)?.is_some())
    }

    /// Id of the queued task carrying the message at `offset`, if any.
    ///
    /// # Errors
    ///
    /// Returns `Error::UnknownPartition` for an out-of-range partition.
    pub fn task_for_offset(&self, partition: PartitionId, offset: Offset) -> Result<Option<TaskId>> {
        Ok(self
            .lane(partition)?
            .state
            .lock()
            .tasks
            .iter()
            .find(|task| task.payload.offset == offset)
            .map(|task| task.task_id))
    }
}
