//! Delivery tasks and the identifiers they carry.

use std::fmt::{self, Display};

use herald_message_log::Offset;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

/// Index of a partition in `[0, partition_count)`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PartitionId(pub u32);

impl PartitionId {
    /// Name of the lease guarding this partition.
    #[must_use]
    pub fn lease_resource(self) -> String {
        format!("partition-{}", self.0)
    }
}

impl Display for PartitionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Opaque key used only to choose a partition. Usually a group or user id.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RoutingKey(String);

impl RoutingKey {
    /// Creates a routing key.
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// The key as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for RoutingKey {
    fn from(key: &str) -> Self {
        Self::new(key)
    }
}

impl From<String> for RoutingKey {
    fn from(key: String) -> Self {
        Self(key)
    }
}

impl Display for RoutingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Task identifier. Ordered by sequence within a partition.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TaskId {
    /// The partition the task lives on.
    pub partition: PartitionId,

    /// Position in the partition's enqueue order.
    pub sequence: u64,
}

impl Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.partition, self.sequence)
    }
}

/// Where the message to deliver lives in the durable log.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PayloadRef {
    /// Group whose subscribers receive the message.
    pub group_id: String,

    /// Committed log offset of the message.
    pub offset: Offset,
}

/// Lifecycle of a delivery task.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskStatus {
    /// Waiting in the queue.
    Pending,

    /// Claimed by the leader holding the lease with this fencing token.
    InFlight {
        /// Fencing token of the claiming lease.
        lease_token: u64,
    },

    /// Acknowledged and removed from the queue.
    Delivered,

    /// Attempts exhausted; handed to the dead-letter sink.
    DeadLettered,
}

/// A unit of fan-out work for one committed message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeliveryTask {
    /// Assigned by the queue on enqueue.
    pub task_id: TaskId,

    /// Key the partition was derived from.
    pub routing_key: RoutingKey,

    /// Reference to the committed message.
    pub payload: PayloadRef,

    /// When the task entered the queue.
    pub enqueue_time: Instant,

    /// Number of failed attempts so far.
    pub attempt_count: u32,

    /// Current status.
    pub status: TaskStatus,
}

impl DeliveryTask {
    /// The partition the task belongs to.
    #[must_use]
    pub const fn partition_id(&self) -> PartitionId {
        self.task_id.partition
    }
}

/// A task waiting to be assigned an id by the queue.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NewTask {
    /// Destination partition.
    pub partition: PartitionId,

    /// Key the partition was derived from.
    pub routing_key: RoutingKey,

    /// Reference to the committed message.
    pub payload: PayloadRef,
}
