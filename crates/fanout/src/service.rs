//! Boots and stops a complete fan-out pipeline.

use std::collections::BTreeMap;
use std::sync::Arc;

use herald_connections::ConnectionGateway;
use herald_leases::LeaseManager;
use herald_message_log::{MessageLog, Offset};
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument};

use crate::config::FanoutConfig;
use crate::dead_letter::DeadLetterSink;
use crate::dispatcher::Dispatcher;
use crate::error::Result;
use crate::partitioner::Partitioner;
use crate::publisher::Publisher;
use crate::queue::PartitionQueue;
use crate::recovery::Reconciler;
use crate::ring::WorkerGroup;
use crate::stats::{FanoutStats, StatsSnapshot};
use crate::task::PartitionId;
use crate::worker::{WorkerContext, WorkerTiming};

#[derive(Default)]
struct Running {
    groups: Vec<WorkerGroup>,
    reconciler: Option<JoinHandle<()>>,
}

/// A fan-out pipeline: one worker group per partition plus the publisher and
/// reconciler feeding them.
pub struct FanoutService<L, G, M, D>
where
    L: LeaseManager,
    G: ConnectionGateway,
    M: MessageLog,
    D: DeadLetterSink,
{
    config: FanoutConfig,
    node_id: String,
    context: Arc<WorkerContext<L, G, M, D>>,
    publisher: Arc<Publisher<M>>,
    reconciler: Arc<Reconciler<M>>,
    running: Mutex<Running>,
    shutdown: CancellationToken,
}

impl<L, G, M, D> FanoutService<L, G, M, D>
where
    L: LeaseManager,
    G: ConnectionGateway,
    M: MessageLog,
    D: DeadLetterSink,
{
    /// Wires a pipeline from its collaborators. Nothing runs until
    /// [`Self::start`].
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidConfig` if `config` does not validate.
    pub fn new(
        config: FanoutConfig,
        node_id: impl Into<String>,
        leases: Arc<L>,
        gateway: Arc<G>,
        log: Arc<M>,
        dead_letters: Arc<D>,
    ) -> Result<Self> {
        config.validate()?;

        let partitioner = Partitioner::new(config.partition_count)?;
        let stats = Arc::new(FanoutStats::default());
        let queue = Arc::new(PartitionQueue::new(
            config.partition_count,
            config.queue_capacity,
            config.max_attempts,
        ));

        let dispatcher = Arc::new(Dispatcher::new(
            gateway,
            log.clone(),
            config.push_timeout,
            config.push_retries,
            stats.clone(),
        ));

        let reconciler = Arc::new(Reconciler::new(
            log.clone(),
            queue.clone(),
            partitioner,
            stats.clone(),
            config.recovery_batch,
            config.max_deferred,
        ));

        let publisher = Arc::new(Publisher::new(
            log,
            queue.clone(),
            partitioner,
            reconciler.clone(),
            stats.clone(),
        ));

        let context = Arc::new(WorkerContext {
            leases,
            queue,
            dispatcher,
            dead_letters,
            stats,
            timing: WorkerTiming {
                lease_ttl: config.lease_ttl,
                renew_interval: config.renew_interval,
                election_interval: config.election_interval,
            },
        });

        Ok(Self {
            config,
            node_id: node_id.into(),
            context,
            publisher,
            reconciler,
            running: Mutex::new(Running::default()),
            shutdown: CancellationToken::new(),
        })
    }

    /// Spawns the worker groups and the reconciler. Calling it again is a no-op.
    pub fn start(&self) {
        let mut running = self.running.lock();
        if !running.groups.is_empty() {
            return;
        }

        running.groups = (0..self.config.partition_count)
            .map(|partition| {
                WorkerGroup::spawn(
                    &self.node_id,
                    PartitionId(partition),
                    self.config.replicas_per_partition,
                    &self.context,
                    &self.shutdown,
                )
            })
            .collect();

        let reconciler = self.reconciler.clone();
        let interval = self.config.recovery_interval;
        let shutdown = self.shutdown.child_token();
        running.reconciler = Some(tokio::spawn(async move {
            reconciler.run(interval, shutdown).await;
        }));

        info!(
            node_id = %self.node_id,
            partitions = self.config.partition_count,
            replicas = self.config.replicas_per_partition,
            "Fan-out service started"
        );
    }

    /// Re-enqueues committed messages after `offset` that are not queued.
    /// Run once at startup with the last offset known to be fanned out.
    ///
    /// # Errors
    ///
    /// Returns `Error::Log` if the log cannot be read.
    #[instrument(skip(self))]
    pub async fn recover_from(&self, offset: Offset) -> Result<usize> {
        self.reconciler.replay_from(offset).await
    }

    /// Signals every worker to finish its current task and stop.
    pub fn shutdown(&self) {
        info!("Fan-out service shutting down");
        self.shutdown.cancel();
    }

    /// Waits for every worker and the reconciler to stop.
    pub async fn wait(&self) {
        let running = std::mem::take(&mut *self.running.lock());

        for group in running.groups {
            group.join().await;
        }

        if let Some(reconciler) = running.reconciler {
            if let Err(e) = reconciler.await {
                error!(error = %e, "Reconciler task panicked");
            }
        }

        info!("Fan-out service stopped");
    }

    /// The publisher feeding this pipeline.
    #[must_use]
    pub fn publisher(&self) -> Arc<Publisher<M>> {
        self.publisher.clone()
    }

    /// The partition queue.
    #[must_use]
    pub fn queue(&self) -> Arc<PartitionQueue> {
        self.context.queue.clone()
    }

    /// Current counter values.
    #[must_use]
    pub fn stats(&self) -> StatsSnapshot {
        self.context.stats.snapshot()
    }

    /// Current leader of every partition, `None` while an election is open.
    #[must_use]
    pub fn leaders(&self) -> BTreeMap<PartitionId, Option<String>> {
        self.running
            .lock()
            .groups
            .iter()
            .map(|group| (group.partition(), group.leader()))
            .collect()
    }

    /// The configuration this pipeline was built from.
    #[must_use]
    pub const fn config(&self) -> &FanoutConfig {
        &self.config
    }
}
