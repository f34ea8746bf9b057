//! Error types for the fan-out pipeline

use thiserror::Error;

use crate::task::{PartitionId, TaskId};

/// Result type for fan-out operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised by the fan-out pipeline.
#[derive(Debug, Error)]
pub enum Error {
    /// The partition already holds `capacity` unacknowledged tasks.
    #[error("partition {partition} is at capacity ({capacity} tasks), enqueue rejected")]
    EnqueueRejected {
        /// The full partition.
        partition: PartitionId,
        /// Configured capacity.
        capacity: usize,
    },

    /// The worker no longer holds the partition's lease.
    #[error("lease for partition {partition} was lost")]
    LeaseLost {
        /// The partition whose lease was lost.
        partition: PartitionId,
    },

    /// A push to one connection failed. Never fails the task.
    #[error("push to {connection} failed: {reason}")]
    PushFailed {
        /// The connection the push targeted.
        connection: String,
        /// Why the push failed.
        reason: String,
    },

    /// Attempts were exhausted and the task went to the dead-letter sink.
    #[error("task {task_id} dead-lettered after {attempts} attempts")]
    DeadLettered {
        /// The dead-lettered task.
        task_id: TaskId,
        /// Attempts made.
        attempts: u32,
    },

    /// The partition id is outside the configured range.
    #[error("partition {0} does not exist")]
    UnknownPartition(PartitionId),

    /// The task is not in the queue.
    #[error("task {0} is not queued")]
    UnknownTask(TaskId),

    /// The task exists but has not been claimed.
    #[error("task {0} is not in flight")]
    NotInFlight(TaskId),

    /// The message referenced by a task is missing from the log.
    #[error("message at offset {0} is missing from the log")]
    MissingMessage(herald_message_log::Offset),

    /// Invalid configuration.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// The message log failed.
    #[error("message log error: {0}")]
    Log(String),

    /// The connection gateway failed.
    #[error("connection gateway error: {0}")]
    Gateway(String),

    /// The lease manager failed.
    #[error("lease manager error: {0}")]
    Leases(String),

    /// The dead-letter sink failed.
    #[error("dead-letter sink error: {0}")]
    DeadLetterSink(String),

    /// Envelope encoding failed.
    #[error("envelope encoding error: {0}")]
    Encode(#[from] serde_json::Error),
}
