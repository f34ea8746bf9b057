//! Real-time fan-out of committed chat messages to connected subscribers.
//!
//! A committed message is routed to a partition by its group id and queued on
//! that partition's lane. Each partition is served by a group of replica
//! workers; the one holding the partition lease drains the lane in order and
//! pushes every message to the group's live connections. Delivery is
//! at-least-once, and tasks that keep failing are dead-lettered.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

/// Pipeline configuration
pub mod config;

/// Dead-letter sinks
pub mod dead_letter;

/// Subscriber resolution and pushes
pub mod dispatcher;

/// Error types
pub mod error;

/// Routing keys to partitions
pub mod partitioner;

/// Write-then-publish entry point
pub mod publisher;

/// Per-partition delivery lanes
pub mod queue;

/// Log/queue reconciliation
pub mod recovery;

/// Replica groups
pub mod ring;

/// Pipeline lifecycle
pub mod service;

/// Pipeline counters
pub mod stats;

/// Delivery task types
pub mod task;

/// Leader-elected partition workers
pub mod worker;

pub use {
    config::FanoutConfig,
    dead_letter::{DeadLetter, DeadLetterSink, LoggingDeadLetterSink, MemoryDeadLetterSink},
    dispatcher::{DeliveryEnvelope, DispatchReport, Dispatcher},
    error::{Error, Result},
    partitioner::{Partitioner, partition_of},
    publisher::{FanoutStatus, PublishReceipt, Publisher},
    queue::{Claim, NackOutcome, PartitionQueue},
    recovery::{Admission, Reconciler},
    ring::WorkerGroup,
    service::FanoutService,
    stats::{FanoutStats, StatsSnapshot},
    task::{DeliveryTask, NewTask, PartitionId, PayloadRef, RoutingKey, TaskId, TaskStatus},
    worker::{Worker, WorkerContext, WorkerState, WorkerTiming},
};
