//! A replica worker competing for one partition's lease.
//!
//! ```text
//! Follower --(election timer)--> Candidate --(lease granted)--> Leader
//!    ^                               |                            |
//!    +-------(lease denied)----------+                            |
//!    +-------------------(lease lost: nack in-flight task)--------+
//! ```
//!
//! Only the leader drains the partition. Losing the lease cancels the
//! in-flight dispatch by dropping its future and nacks the task.

use std::sync::Arc;
use std::time::Duration;

use herald_connections::ConnectionGateway;
use herald_leases::{Lease, LeaseManager};
use herald_message_log::MessageLog;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::dead_letter::DeadLetterSink;
use crate::dispatcher::Dispatcher;
use crate::error::{Error, Result};
use crate::queue::{NackOutcome, PartitionQueue};
use crate::stats::FanoutStats;
use crate::task::{DeliveryTask, PartitionId};

const RETRY_BASE_DELAY: Duration = Duration::from_millis(50);

/// Observable state of a worker.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WorkerState {
    /// Waiting for the next election attempt.
    Follower,

    /// Asking the lease manager for the partition lease.
    Candidate,

    /// Holding the lease and draining the partition.
    Leader {
        /// Fencing token of the held lease.
        lease_token: u64,
    },

    /// Shut down.
    Stopped,
}

impl WorkerState {
    /// Whether this is the leader state.
    #[must_use]
    pub const fn is_leader(&self) -> bool {
        matches!(self, Self::Leader { .. })
    }
}

/// Lease and retry timings.
#[derive(Clone, Copy, Debug)]
pub struct WorkerTiming {
    /// TTL requested for each lease.
    pub lease_ttl: Duration,

    /// Interval between renewals.
    pub renew_interval: Duration,

    /// Base wait between election attempts.
    pub election_interval: Duration,
}

/// Components shared by every worker of one pipeline.
pub struct WorkerContext<L, G, M, D>
where
    L: LeaseManager,
    G: ConnectionGateway,
    M: MessageLog,
    D: DeadLetterSink,
{
    /// Leader election.
    pub leases: Arc<L>,

    /// Delivery lanes.
    pub queue: Arc<PartitionQueue>,

    /// Fan-out.
    pub dispatcher: Arc<Dispatcher<G, M>>,

    /// Where exhausted tasks go.
    pub dead_letters: Arc<D>,

    /// Counters.
    pub stats: Arc<FanoutStats>,

    /// Timings.
    pub timing: WorkerTiming,
}

enum LeadershipEnd {
    LeaseLost,
    Shutdown,
}

enum TaskEnd {
    Done,
    Aborted,
}

/// One replica worker.
pub struct Worker<L, G, M, D>
where
    L: LeaseManager,
    G: ConnectionGateway,
    M: MessageLog,
    D: DeadLetterSink,
{
    id: String,
    partition: PartitionId,
    context: Arc<WorkerContext<L, G, M, D>>,
    state: watch::Sender<WorkerState>,
    shutdown: CancellationToken,
}

impl<L, G, M, D> Worker<L, G, M, D>
where
    L: LeaseManager,
    G: ConnectionGateway,
    M: MessageLog,
    D: DeadLetterSink,
{
    /// Creates a worker in the follower state.
    pub fn new(
        id: impl Into<String>,
        partition: PartitionId,
        context: Arc<WorkerContext<L, G, M, D>>,
        shutdown: CancellationToken,
    ) -> Self {
        let (state, _) = watch::channel(WorkerState::Follower);

        Self {
            id: id.into(),
            partition,
            context,
            state,
            shutdown,
        }
    }

    /// Worker identifier, used as the lease holder name.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Subscribes to state transitions.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<WorkerState> {
        self.state.subscribe()
    }

    fn set_state(&self, state: WorkerState) {
        self.state.send_replace(state);
    }

    /// Runs the election loop until shutdown.
    ///
    /// # Errors
    ///
    /// Only fails on errors that make the partition unusable, such as a
    /// partition id the queue does not know.
    #[instrument(skip(self), fields(worker = %self.id, partition = %self.partition))]
    pub async fn run(self) -> Result<()> {
        info!("Worker started");
        let resource = self.partition.lease_resource();

        let result = loop {
            self.set_state(WorkerState::Follower);

            if self.pause(self.election_delay()).await {
                break Ok(());
            }

            self.set_state(WorkerState::Candidate);

            let lease = match self
                .context
                .leases
                .try_acquire(&resource, &self.id, self.context.timing.lease_ttl)
                .await
            {
                Ok(Some(lease)) => lease,
                Ok(None) => {
                    debug!("Lease held elsewhere, staying follower");
                    continue;
                }
                Err(e) => {
                    warn!(error = %e, "Lease acquisition failed");
                    continue;
                }
            };

            self.context.stats.add_leases_acquired(1);
            info!(lease_token = lease.token, "Elected leader");
            self.set_state(WorkerState::Leader {
                lease_token: lease.token,
            });

            match self.lead(lease).await {
                Ok(LeadershipEnd::LeaseLost) => {
                    self.context.stats.add_leases_lost(1);
                    warn!("Lease lost, stepping down");
                }
                Ok(LeadershipEnd::Shutdown) => break Ok(()),
                Err(e) => break Err(e),
            }
        };

        if let Err(e) = &result {
            error!(error = %e, "Worker stopped on error");
        }

        self.set_state(WorkerState::Stopped);
        info!("Worker stopped");
        result
    }

    /// Sleeps unless shutdown comes first. Returns whether shutdown was requested.
    async fn pause(&self, delay: Duration) -> bool {
        tokio::select! {
            () = self.shutdown.cancelled() => true,
            () = tokio::time::sleep(delay) => false,
        }
    }

    fn election_delay(&self) -> Duration {
        // 75% to 125% of the interval so replicas do not poll in lockstep.
        self.context
            .timing
            .election_interval
            .mul_f64(fastrand::f64().mul_add(0.5, 0.75))
    }

    async fn lead(&self, lease: Lease) -> Result<LeadershipEnd> {
        let lease_token = lease.token;
        let lost = CancellationToken::new();
        let (lease_tx, lease_rx) = watch::channel(lease.clone());

        let renewal = tokio::spawn(renew_lease(
            self.context.leases.clone(),
            lease,
            self.context.timing.renew_interval,
            lost.clone(),
            lease_tx,
        ));

        let end = self.drain(lease_token, &lost).await;

        lost.cancel();
        renewal.abort();

        if matches!(end, Ok(LeadershipEnd::Shutdown) | Err(_)) {
            let lease = lease_rx.borrow().clone();
            if let Err(e) = self.context.leases.release(&lease).await {
                warn!(error = %e, "Failed to release lease");
            }
        }

        end
    }

    async fn drain(&self, lease_token: u64, lost: &CancellationToken) -> Result<LeadershipEnd> {
        let queue = &self.context.queue;

        loop {
            let claim = tokio::select! {
                biased;
                () = lost.cancelled() => return Ok(LeadershipEnd::LeaseLost),
                () = self.shutdown.cancelled() => return Ok(LeadershipEnd::Shutdown),
                claim = queue.next(self.partition, lease_token) => match claim {
                    Ok(claim) => claim,
                    Err(Error::LeaseLost { .. }) => return Ok(LeadershipEnd::LeaseLost),
                    Err(e) => return Err(e),
                },
            };

            if let Some(task) = claim.dead_lettered {
                self.context.stats.add_dead_lettered(1);
                self.dead_letter(task, "abandoned in flight by a previous leader".to_string())
                    .await;
            }

            let Some(task) = claim.task else {
                continue;
            };

            match self.process(task, lost).await {
                TaskEnd::Done => {}
                TaskEnd::Aborted => return Ok(LeadershipEnd::LeaseLost),
            }
        }
    }

    #[instrument(skip(self, task, lost), fields(task_id = %task.task_id, attempt = task.attempt_count))]
    async fn process(&self, task: DeliveryTask, lost: &CancellationToken) -> TaskEnd {
        let dispatched = tokio::select! {
            biased;
            () = lost.cancelled() => None,
            report = self.context.dispatcher.dispatch(&task) => Some(report),
        };

        match dispatched {
            None => {
                warn!("Lease lost mid-delivery, aborting pushes");
                self.nack(&task, "lease lost during delivery".to_string())
                    .await;
                TaskEnd::Aborted
            }
            Some(Ok(_)) if lost.is_cancelled() => {
                warn!("Lease lost as delivery finished, not acknowledging");
                self.nack(&task, "lease lost before acknowledgement".to_string())
                    .await;
                TaskEnd::Aborted
            }
            Some(Ok(report)) => match self.context.queue.ack_claimed(&task) {
                Ok(_) => {
                    self.context.stats.add_acked(1);
                    debug!(
                        delivered = report.delivered,
                        failed = report.failed.len(),
                        "Task acknowledged"
                    );
                    TaskEnd::Done
                }
                Err(Error::LeaseLost { .. }) => {
                    warn!("Task reclaimed by a newer leader, stepping down");
                    TaskEnd::Aborted
                }
                Err(e) => {
                    warn!(error = %e, "Acknowledgement refused");
                    TaskEnd::Done
                }
            },
            Some(Err(e)) => {
                warn!(error = %e, "Delivery attempt failed");
                let attempts = task.attempt_count + 1;
                self.nack(&task, e.to_string()).await;

                // Back off before the task comes round again.
                let delay = RETRY_BASE_DELAY
                    .saturating_mul(1 << attempts.min(8))
                    .min(self.context.timing.renew_interval);
                tokio::select! {
                    () = lost.cancelled() => TaskEnd::Aborted,
                    () = tokio::time::sleep(delay) => TaskEnd::Done,
                }
            }
        }
    }

    async fn nack(&self, task: &DeliveryTask, reason: String) {
        match self.context.queue.nack_claimed(task) {
            Ok(NackOutcome::Requeued(task)) => {
                self.context.stats.add_nacked(1);
                debug!(task_id = %task.task_id, attempts = task.attempt_count, "Task requeued");
            }
            Ok(NackOutcome::DeadLettered(task)) => {
                self.context.stats.add_nacked(1);
                self.context.stats.add_dead_lettered(1);
                self.dead_letter(task, reason).await;
            }
            Err(Error::LeaseLost { .. }) => {
                debug!(task_id = %task.task_id, "Task already reclaimed by a newer leader");
            }
            Err(e) => warn!(task_id = %task.task_id, error = %e, "Nack refused"),
        }
    }

    async fn dead_letter(&self, task: DeliveryTask, reason: String) {
        let task_id = task.task_id;
        if let Err(e) = self.context.dead_letters.record(task, reason).await {
            error!(%task_id, error = %e, "Failed to record dead letter");
        }
    }
}

/// Renews `lease` every `interval` until it is refused, lapses, or `lost` is
/// cancelled. Cancels `lost` when the lease can no longer be trusted.
async fn renew_lease<L>(
    leases: Arc<L>,
    mut lease: Lease,
    interval: Duration,
    lost: CancellationToken,
    latest: watch::Sender<Lease>,
) where
    L: LeaseManager,
{
    loop {
        let wake = (Instant::now() + interval).min(lease.expires_at);

        tokio::select! {
            () = lost.cancelled() => return,
            () = tokio::time::sleep_until(wake) => {}
        }

        if !lease.is_valid_at(Instant::now()) {
            warn!(resource = %lease.resource, token = lease.token, "Lease expired before renewal");
            lost.cancel();
            return;
        }

        match tokio::time::timeout_at(lease.expires_at, leases.renew(&lease)).await {
            Ok(Ok(Some(renewed))) => {
                lease = renewed;
                latest.send_replace(lease.clone());
            }
            Ok(Ok(None)) => {
                warn!(resource = %lease.resource, token = lease.token, "Lease renewal refused");
                lost.cancel();
                return;
            }
            Ok(Err(e)) => {
                // Keep trying until the lease actually lapses.
                warn!(resource = %lease.resource, error = %e, "Lease renewal failed");
            }
            Err(_) => {
                warn!(resource = %lease.resource, token = lease.token, "Lease expired during renewal");
                lost.cancel();
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use herald_connections_memory::MemoryGateway;
    use herald_leases_memory::MemoryLeaseManager;
    use herald_message_log::NewMessage;
    use herald_message_log_memory::MemoryMessageLog;
    use tracing_test::traced_test;

    use crate::dead_letter::MemoryDeadLetterSink;
    use crate::task::{NewTask, PayloadRef, RoutingKey};

    const P0: PartitionId = PartitionId(0);

    type TestContext =
        WorkerContext<MemoryLeaseManager, MemoryGateway, MemoryMessageLog, MemoryDeadLetterSink>;

    fn context(
        leases: &Arc<MemoryLeaseManager>,
        log: &Arc<MemoryMessageLog>,
    ) -> Arc<TestContext> {
        let stats = Arc::new(FanoutStats::default());

        Arc::new(WorkerContext {
            leases: leases.clone(),
            queue: Arc::new(PartitionQueue::new(1, 10, 3)),
            dispatcher: Arc::new(Dispatcher::new(
                Arc::new(MemoryGateway::new()),
                log.clone(),
                Duration::from_secs(1),
                0,
                stats.clone(),
            )),
            dead_letters: Arc::new(MemoryDeadLetterSink::new()),
            stats,
            timing: WorkerTiming {
                lease_ttl: Duration::from_secs(5),
                renew_interval: Duration::from_millis(1500),
                election_interval: Duration::from_millis(100),
            },
        })
    }

    async fn wait_for(state: &mut watch::Receiver<WorkerState>, wanted: fn(&WorkerState) -> bool) {
        tokio::time::timeout(Duration::from_secs(30), state.wait_for(wanted))
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    #[traced_test]
    async fn test_worker_leads_drains_and_releases_on_shutdown() {
        let leases = Arc::new(MemoryLeaseManager::new());
        let log = Arc::new(MemoryMessageLog::new());
        let context = context(&leases, &log);
        let shutdown = CancellationToken::new();

        let offset = log
            .append(NewMessage::new("group-1", "alice", "hi"))
            .await
            .unwrap();
        context
            .queue
            .enqueue(NewTask {
                partition: P0,
                routing_key: RoutingKey::from("group-1"),
                payload: PayloadRef {
                    group_id: "group-1".to_string(),
                    offset,
                },
            })
            .unwrap();

        let worker = Worker::new("worker-a", P0, context.clone(), shutdown.clone());
        let mut state = worker.subscribe();
        let handle = tokio::spawn(worker.run());

        wait_for(&mut state, WorkerState::is_leader).await;

        let (holder, _) = leases.holder(&P0.lease_resource()).await.unwrap();
        assert_eq!(holder, "worker-a");

        tokio::time::timeout(Duration::from_secs(30), async {
            while !context.queue.is_empty(P0).unwrap() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(context.stats.snapshot().acked, 1);

        shutdown.cancel();
        handle.await.unwrap().unwrap();

        assert_eq!(*state.borrow(), WorkerState::Stopped);
        assert!(leases.holder(&P0.lease_resource()).await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_worker_stays_follower_while_lease_held_elsewhere() {
        let leases = Arc::new(MemoryLeaseManager::new());
        let log = Arc::new(MemoryMessageLog::new());
        let context = context(&leases, &log);
        let shutdown = CancellationToken::new();

        leases
            .try_acquire(&P0.lease_resource(), "someone-else", Duration::from_secs(60))
            .await
            .unwrap()
            .unwrap();

        let worker = Worker::new("worker-a", P0, context.clone(), shutdown.clone());
        let state = worker.subscribe();
        let handle = tokio::spawn(worker.run());

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert!(!state.borrow().is_leader());

        // The foreign lease lapses and the worker takes over.
        tokio::time::sleep(Duration::from_secs(31)).await;
        assert!(state.borrow().is_leader());
        assert_eq!(context.stats.snapshot().leases_acquired, 1);

        shutdown.cancel();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_refused_renewal_demotes_leader() {
        let leases = Arc::new(MemoryLeaseManager::new());
        let log = Arc::new(MemoryMessageLog::new());
        let context = context(&leases, &log);
        let shutdown = CancellationToken::new();

        let worker = Worker::new("worker-a", P0, context.clone(), shutdown.clone());
        let mut state = worker.subscribe();
        let handle = tokio::spawn(worker.run());

        wait_for(&mut state, WorkerState::is_leader).await;
        let WorkerState::Leader { lease_token: first } = *state.borrow() else {
            unreachable!()
        };

        leases.expire(&P0.lease_resource()).await;

        tokio::time::timeout(
            Duration::from_secs(30),
            state.wait_for(|s| matches!(s, WorkerState::Leader { lease_token } if *lease_token > first)),
        )
        .await
        .unwrap()
        .unwrap();
        assert_eq!(context.stats.snapshot().leases_lost, 1);

        shutdown.cancel();
        handle.await.unwrap().unwrap();
    }
}
