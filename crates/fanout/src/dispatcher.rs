//! Pushes a claimed task's message to every live subscriber of its group.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use herald_connections::{ConnectionGateway, ConnectionHandle, GatewayError};
use herald_message_log::{MessageLog, Offset, StoredMessage};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};

use crate::error::{Error, Result};
use crate::stats::FanoutStats;
use crate::task::{DeliveryTask, TaskId};

const PUSH_RETRY_BASE_DELAY: Duration = Duration::from_millis(25);

/// The event pushed to client connections.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryEnvelope {
    /// Task that carried the message.
    pub task_id: TaskId,

    /// Committed log offset, usable as a catch-up cursor by clients.
    pub offset: Offset,

    /// Group the message was sent to.
    pub group_id: String,

    /// Sender of the message.
    pub sender_id: String,

    /// Message body.
    pub body: String,

    /// Commit time.
    pub sent_at: DateTime<Utc>,

    /// Failed attempts before this one. Non-zero means a possible duplicate.
    pub attempt: u32,
}

impl DeliveryEnvelope {
    fn new(task: &DeliveryTask, message: StoredMessage) -> Self {
        Self {
            task_id: task.task_id,
            offset: message.offset,
            group_id: message.group_id,
            sender_id: message.sender_id,
            body: String::from_utf8_lossy(&message.body).into_owned(),
            sent_at: message.sent_at,
            attempt: task.attempt_count,
        }
    }

    /// Decodes an envelope as received by a client.
    ///
    /// # Errors
    ///
    /// Returns `Error::Encode` if the bytes are not an envelope.
    pub fn decode(payload: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(payload)?)
    }
}

/// Outcome of fanning one task out.
#[derive(Debug, Default)]
pub struct DispatchReport {
    /// Connections resolved for the group.
    pub attempted: usize,

    /// Connections that accepted the push.
    pub delivered: usize,

    /// Connections that did not, with the `PushFailed` error for each.
    pub failed: Vec<(ConnectionHandle, Error)>,
}

impl DispatchReport {
    /// Whether the group had no live subscribers.
    #[must_use]
    pub const fn no_subscribers(&self) -> bool {
        self.attempted == 0
    }
}

/// Resolves subscribers through the gateway and pushes to each of them.
pub struct Dispatcher<G, M>
where
    G: ConnectionGateway,
    M: MessageLog,
{
    gateway: Arc<G>,
    log: Arc<M>,
    push_timeout: Duration,
    push_retries: u32,
    stats: Arc<FanoutStats>,
}

impl<G, M> Dispatcher<G, M>
where
    G: ConnectionGateway,
    M: MessageLog,
{
    /// Creates a dispatcher.
    pub const fn new(
        gateway: Arc<G>,
        log: Arc<M>,
        push_timeout: Duration,
        push_retries: u32,
        stats: Arc<FanoutStats>,
    ) -> Self {
        Self {
            gateway,
            log,
            push_timeout,
            push_retries,
            stats,
        }
    }

    /// Fans one task out.
    ///
    /// Per-connection failures are collected in the report and never fail the
    /// task. An empty subscriber set yields an empty report.
    ///
    /// # Errors
    ///
    /// Fails when the message cannot be read from the log or the subscriber
    /// set cannot be resolved. Both are task-level transient failures.
    #[instrument(skip(self, task), fields(task_id = %task.task_id, group_id = %task.payload.group_id))]
    pub async fn dispatch(&self, task: &DeliveryTask) -> Result<DispatchReport> {
        let offset = task.payload.offset;

        let message = self
            .log
            .get(offset)
            .await
            .map_err(|e| Error::Log(e.to_string()))?
            .ok_or(Error::MissingMessage(offset))?;

        let subscribers = self
            .gateway
            .subscribers_of(&task.payload.group_id)
            .await
            .map_err(|e| Error::Gateway(e.to_string()))?;

        if subscribers.is_empty() {
            debug!("No live subscribers, nothing to push");
            return Ok(DispatchReport::default());
        }

        let payload = Bytes::from(serde_json::to_vec(&DeliveryEnvelope::new(task, message))?);

        let results = futures::future::join_all(
            subscribers
                .iter()
                .map(|connection| self.push_with_retry(connection, payload.clone())),
        )
        .await;

        let mut report = DispatchReport {
            attempted: subscribers.len(),
            ..DispatchReport::default()
        };

        for (connection, result) in subscribers.into_iter().zip(results) {
            match result {
                Ok(()) => report.delivered += 1,
                Err(e) => report.failed.push((connection, e)),
            }
        }

        self.stats.add_pushes_delivered(report.delivered as u64);
        self.stats.add_pushes_failed(report.failed.len() as u64);

        debug!(
            attempted = report.attempted,
            delivered = report.delivered,
            failed = report.failed.len(),
            "Fan-out complete"
        );

        Ok(report)
    }

    async fn push_with_retry(&self, connection: &ConnectionHandle, payload: Bytes) -> Result<()> {
        let mut delay = PUSH_RETRY_BASE_DELAY;
        let mut attempt = 0;

        loop {
            let pushed = tokio::time::timeout(
                self.push_timeout,
                self.gateway.push(connection, payload.clone()),
            )
            .await;

            let reason = match pushed {
                Ok(Ok(())) => return Ok(()),
                Ok(Err(e)) if e.is_disconnected() => {
                    debug!(%connection, error = %e, "Connection gone, not retrying push");
                    return Err(Error::PushFailed {
                        connection: connection.to_string(),
                        reason: e.to_string(),
                    });
                }
                Ok(Err(e)) => e.to_string(),
                Err(_) => format!("timed out after {:?}", self.push_timeout),
            };

            if attempt >= self.push_retries {
                warn!(%connection, attempts = attempt + 1, %reason, "Push failed");
                return Err(Error::PushFailed {
                    connection: connection.to_string(),
                    reason,
                });
            }

            attempt += 1;
            debug!(%connection, attempt, %reason, delay = ?delay, "Push failed, retrying");
            tokio::time::sleep(delay).await;

            // Exponential backoff with jitter
            delay = delay.mul_f64(fastrand::f64().mul_add(0.1, 2.0));
        }
    }
}
