//! Operator-visible sink for tasks that ran out of attempts.

use std::convert::Infallible;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::error;

use crate::task::DeliveryTask;

/// A dead-lettered task and why it was given up on.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeadLetter {
    /// The task, with status `DeadLettered`.
    pub task: DeliveryTask,

    /// Description of the last failure.
    pub reason: String,
}

/// Receives dead-lettered tasks. Nothing in the pipeline consumes them again.
#[async_trait]
pub trait DeadLetterSink: Send + Sync + 'static {
    /// The error type for the sink.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Records a task that will not be retried.
    async fn record(&self, task: DeliveryTask, reason: String) -> Result<(), Self::Error>;
}

/// Sink that reports dead letters through `tracing` at error level.
#[derive(Clone, Copy, Debug, Default)]
pub struct LoggingDeadLetterSink;

#[async_trait]
impl DeadLetterSink for LoggingDeadLetterSink {
    type Error = Infallible;

    async fn record(&self, task: DeliveryTask, reason: String) -> Result<(), Self::Error> {
        error!(
            task_id = %task.task_id,
            routing_key = %task.routing_key,
            group_id = %task.payload.group_id,
            offset = %task.payload.offset,
            attempts = task.attempt_count,
            %reason,
            "Delivery task dead-lettered"
        );
        Ok(())
    }
}

/// Sink that keeps dead letters in memory for inspection.
#[derive(Clone, Debug, Default)]
pub struct MemoryDeadLetterSink {
    letters: Arc<Mutex<Vec<DeadLetter>>>,
}

impl MemoryDeadLetterSink {
    /// Creates an empty sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Dead letters recorded so far, oldest first.
    #[must_use]
    pub fn letters(&self) -> Vec<DeadLetter> {
        self.letters.lock().clone()
    }

    /// Number of dead letters recorded.
    #[must_use]
    pub fn len(&self) -> usize {
        self.letters.lock().len()
    }

    /// Whether nothing was dead-lettered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.letters.lock().is_empty()
    }
}

#[async_trait]
impl DeadLetterSink for MemoryDeadLetterSink {
    type Error = Infallible;

    async fn record(&self, task: DeliveryTask, reason: String) -> Result<(), Self::Error> {
        self.letters.lock().push(DeadLetter { task, reason });
        Ok(())
    }
}
