//! Lease loss, redelivery and dead-lettering.

mod common;

use std::sync::atomic::Ordering;
use std::time::Duration;

use herald_fanout::{PartitionId, TaskStatus};
use herald_message_log::NewMessage;
use tracing_test::traced_test;

use common::{StallingGateway, UnreachableGateway, config, eventually, harness, next_envelope};

const P0: PartitionId = PartitionId(0);

#[tokio::test(start_paused = true)]
#[traced_test]
async fn test_lease_expiry_mid_task_redelivers_once() {
    let mut config = config(1);
    config.replicas_per_partition = 2;
    config.push_timeout = Duration::from_secs(600);
    config.push_retries = 0;
    let h = harness(config, StallingGateway::default());

    let mut client = h.gateway.inner.connect();
    h.gateway.inner.subscribe(&client.handle(), "group-17").unwrap();

    h.service.start();
    h.service
        .publisher()
        .publish(NewMessage::new("group-17", "carol", "hello"))
        .await
        .unwrap();

    eventually("first push in flight", || {
        h.gateway.pushes.load(Ordering::SeqCst) == 1
    })
    .await;

    // In flight and not acknowledged while the push hangs.
    let head = h.service.queue().peek_next(P0).unwrap().unwrap();
    let (_, first_token) = h.leases.holder(&P0.lease_resource()).await.unwrap();
    assert_eq!(
        head.status,
        TaskStatus::InFlight {
            lease_token: first_token
        }
    );
    assert_eq!(h.service.stats().acked, 0);

    h.leases.expire(&P0.lease_resource()).await;

    let envelope = next_envelope(&mut client).await;
    assert_eq!(envelope.body, "hello");
    assert_eq!(envelope.attempt, 1);

    eventually("redelivery acked", || h.service.stats().acked == 1).await;

    let (_, second_token) = h.leases.holder(&P0.lease_resource()).await.unwrap();
    assert!(second_token > first_token);
    assert!(h.service.queue().is_empty(P0).unwrap());
    assert_eq!(h.gateway.pushes.load(Ordering::SeqCst), 2);

    // The old leader steps down at its next renewal at the latest.
    eventually("old leader stepped down", || h.service.stats().leases_lost == 1).await;

    // Exactly one delivery reached the client.
    tokio::time::sleep(Duration::from_secs(10)).await;
    assert!(client.try_recv().is_none());

    h.service.shutdown();
    h.service.wait().await;

    assert!(h.dead_letters.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_task_dead_lettered_at_max_attempts() {
    let mut config = config(1);
    config.max_attempts = 3;
    let h = harness(config, UnreachableGateway::default());
    h.gateway.down.store(true, Ordering::SeqCst);

    let mut client = h.gateway.inner.connect();
    h.gateway.inner.subscribe(&client.handle(), "group-17").unwrap();

    h.service.start();
    let publisher = h.service.publisher();
    publisher
        .publish(NewMessage::new("group-17", "carol", "doomed"))
        .await
        .unwrap();

    eventually("dead letter recorded", || h.dead_letters.len() == 1).await;

    let letters = h.dead_letters.letters();
    assert_eq!(letters[0].task.attempt_count, 3);
    assert!(letters[0].reason.contains("gateway unavailable"));
    assert_eq!(h.gateway.lookups.load(Ordering::SeqCst), 3);
    assert!(h.service.queue().is_empty(P0).unwrap());

    let stats = h.service.stats();
    assert_eq!(stats.nacked, 3);
    assert_eq!(stats.dead_lettered, 1);
    assert_eq!(stats.acked, 0);

    // Exhaustion is terminal for that task only.
    h.gateway.down.store(false, Ordering::SeqCst);
    publisher
        .publish(NewMessage::new("group-17", "carol", "fine"))
        .await
        .unwrap();

    assert_eq!(next_envelope(&mut client).await.body, "fine");

    h.service.shutdown();
    h.service.wait().await;
}

#[tokio::test(start_paused = true)]
async fn test_transient_failure_retried_until_success() {
    let h = harness(config(1), UnreachableGateway::default());
    h.gateway.down.store(true, Ordering::SeqCst);

    let mut client = h.gateway.inner.connect();
    h.gateway.inner.subscribe(&client.handle(), "group-17").unwrap();

    h.service.start();
    h.service
        .publisher()
        .publish(NewMessage::new("group-17", "carol", "eventually"))
        .await
        .unwrap();

    eventually("two failed lookups", || {
        h.gateway.lookups.load(Ordering::SeqCst) >= 2
    })
    .await;
    h.gateway.down.store(false, Ordering::SeqCst);

    let envelope = next_envelope(&mut client).await;
    assert_eq!(envelope.body, "eventually");
    assert!(envelope.attempt >= 2);
    assert!(h.dead_letters.is_empty());

    h.service.shutdown();
    h.service.wait().await;
}
