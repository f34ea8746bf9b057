//! CLI binary to run a fan-out pipeline locally against in-memory collaborators.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use clap::Parser;
use herald_connections_memory::{ClientConnection, MemoryGateway};
use herald_fanout::{
    DeliveryEnvelope, FanoutConfig, FanoutService, FanoutStatus, LoggingDeadLetterSink,
    StatsSnapshot,
};
use herald_leases_memory::MemoryLeaseManager;
use herald_message_log::{NewMessage, Offset};
use herald_message_log_memory::MemoryMessageLog;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

/// CLI-specific error type
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Pipeline error
    #[error(transparent)]
    Fanout(#[from] herald_fanout::Error),

    /// Summary serialization error
    #[error("failed to encode summary: {0}")]
    Json(#[from] serde_json::Error),

    /// Configuration serialization error
    #[error("failed to encode configuration: {0}")]
    Toml(#[from] toml::ser::Error),
}

#[derive(Clone, Debug, Parser)]
#[command(version, about, long_about = None)]
struct Args {
    /// TOML configuration file
    #[arg(long, env = "HERALD_CONFIG")]
    config: Option<PathBuf>,

    /// Overrides the configured partition count
    #[arg(long, env = "HERALD_PARTITIONS")]
    partitions: Option<u32>,

    /// Overrides the configured replicas per partition
    #[arg(long, env = "HERALD_REPLICAS")]
    replicas: Option<usize>,

    /// Node identifier used in worker names
    #[arg(long, default_value = "herald-local", env = "HERALD_NODE_ID")]
    node_id: String,

    /// Number of simulated groups
    #[arg(long, default_value_t = 4, env = "HERALD_GROUPS")]
    groups: usize,

    /// Simulated connections subscribed to each group
    #[arg(long, default_value_t = 2, env = "HERALD_SUBSCRIBERS")]
    subscribers: usize,

    /// Messages to publish, spread round-robin over the groups
    #[arg(long, default_value_t = 20, env = "HERALD_MESSAGES")]
    messages: u64,

    /// Replay the log after this offset before starting the workers
    #[arg(long, env = "HERALD_REPLAY_FROM")]
    replay_from: Option<u64>,

    /// Keep running for this long after publishing, e.g. "30s"
    #[arg(long, value_parser = humantime::parse_duration, env = "HERALD_RUN_FOR")]
    run_for: Option<Duration>,

    /// Print the effective configuration as TOML and exit
    #[arg(long)]
    print_config: bool,
}

#[derive(Serialize)]
struct Summary {
    stats: StatsSnapshot,
    leaders: BTreeMap<String, Option<String>>,
    received: u64,
}

type LocalService =
    FanoutService<MemoryLeaseManager, MemoryGateway, MemoryMessageLog, LoggingDeadLetterSink>;

fn load_config(args: &Args) -> Result<FanoutConfig, Error> {
    let mut config = match &args.config {
        Some(path) => FanoutConfig::load(path)?,
        None => FanoutConfig::default(),
    };

    if let Some(partitions) = args.partitions {
        config.partition_count = partitions;
    }
    if let Some(replicas) = args.replicas {
        config.replicas_per_partition = replicas;
    }

    config.validate()?;
    Ok(config)
}

/// Connects `count` clients to `group_id` and counts what they receive.
fn spawn_subscribers(
    gateway: &MemoryGateway,
    group_id: &str,
    count: usize,
    received: &Arc<AtomicU64>,
) {
    for _ in 0..count {
        let client = gateway.connect();
        if let Err(e) = gateway.subscribe(&client.handle(), group_id) {
            warn!(error = %e, group_id, "Subscription failed");
            continue;
        }

        tokio::spawn(read_deliveries(client, received.clone()));
    }
}

async fn read_deliveries(mut client: ClientConnection, received: Arc<AtomicU64>) {
    while let Some(payload) = client.recv().await {
        match DeliveryEnvelope::decode(&payload) {
            Ok(envelope) => {
                received.fetch_add(1, Ordering::Relaxed);
                debug!(
                    connection = %client.handle(),
                    task_id = %envelope.task_id,
                    offset = %envelope.offset,
                    attempt = envelope.attempt,
                    "Delivered"
                );
            }
            Err(e) => warn!(connection = %client.handle(), error = %e, "Undecodable delivery"),
        }
    }
}

/// Publishes `messages` and returns how many were accepted for fan-out.
async fn publish_all(service: &LocalService, groups: usize, messages: u64) -> Result<u64, Error> {
    let publisher = service.publisher();
    let groups = groups.max(1) as u64;
    let mut accepted = 0;

    for i in 0..messages {
        let group_id = format!("group-{}", i % groups);
        let receipt = publisher
            .publish(NewMessage::new(
                group_id,
                format!("user-{}", i % 7),
                format!("message {i}"),
            ))
            .await?;

        debug!(offset = %receipt.offset, partition = %receipt.partition, fanout = ?receipt.fanout, "Published");
        if receipt.fanout != FanoutStatus::Rejected {
            accepted += 1;
        }
    }

    info!(messages, accepted, "Publishing finished");
    Ok(accepted)
}

/// Waits until every published task is settled, the run time elapses or a
/// shutdown is requested.
async fn wait_for_settle(
    service: &LocalService,
    messages: u64,
    run_for: Option<Duration>,
    shutdown: &CancellationToken,
) {
    let settle = async {
        loop {
            let stats = service.stats();
            if stats.acked + stats.dead_lettered >= messages {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        info!("All published messages settled");

        if let Some(run_for) = run_for {
            tokio::time::sleep(run_for).await;
        }
    };

    tokio::select! {
        () = settle => {}
        () = shutdown.cancelled() => {}
    }
}

#[cfg(unix)]
async fn shutdown_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    match (
        signal(SignalKind::terminate()),
        signal(SignalKind::interrupt()),
    ) {
        (Ok(mut sigterm), Ok(mut sigint)) => {
            tokio::select! {
                _ = sigterm.recv() => info!("Received SIGTERM"),
                _ = sigint.recv() => info!("Received SIGINT"),
            }
        }
        _ => {
            warn!("Signal handlers unavailable, falling back to ctrl-c");
            let _ = tokio::signal::ctrl_c().await;
            info!("Received interrupt signal");
        }
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("Received interrupt signal");
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let config = load_config(&args)?;

    if args.print_config {
        print!("{}", toml::to_string_pretty(&config)?);
        return Ok(());
    }

    let shutdown_token = CancellationToken::new();

    let signal_shutdown_token = shutdown_token.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("Shutting down");
        signal_shutdown_token.cancel();
    });

    let gateway = MemoryGateway::new();
    let log = Arc::new(MemoryMessageLog::new());
    let service = LocalService::new(
        config,
        args.node_id.clone(),
        Arc::new(MemoryLeaseManager::new()),
        Arc::new(gateway.clone()),
        log,
        Arc::new(LoggingDeadLetterSink),
    )?;

    let received = Arc::new(AtomicU64::new(0));
    for group in 0..args.groups.max(1) {
        spawn_subscribers(&gateway, &format!("group-{group}"), args.subscribers, &received);
    }

    if let Some(offset) = args.replay_from {
        let replayed = service.recover_from(Offset(offset)).await?;
        info!(replayed, "Replayed committed messages");
    }

    service.start();

    let accepted = tokio::select! {
        result = publish_all(&service, args.groups, args.messages) => result?,
        () = shutdown_token.cancelled() => 0,
    };

    wait_for_settle(&service, accepted, args.run_for, &shutdown_token).await;

    let leaders = service
        .leaders()
        .into_iter()
        .map(|(partition, leader)| (partition.to_string(), leader))
        .collect();

    service.shutdown();
    service.wait().await;

    let summary = Summary {
        stats: service.stats(),
        leaders,
        received: received.load(Ordering::Relaxed),
    };
    println!("{}", serde_json::to_string_pretty(&summary)?);

    Ok(())
}
