//! Pipeline counters.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Monotonic counters shared by every component of one pipeline.
#[derive(Debug, Default)]
pub struct FanoutStats {
    enqueued: AtomicU64,
    rejected: AtomicU64,
    deferred: AtomicU64,
    recovered: AtomicU64,
    acked: AtomicU64,
    nacked: AtomicU64,
    dead_lettered: AtomicU64,
    pushes_delivered: AtomicU64,
    pushes_failed: AtomicU64,
    leases_acquired: AtomicU64,
    leases_lost: AtomicU64,
}

/// Point-in-time copy of [`FanoutStats`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    /// Tasks accepted by the queue.
    pub enqueued: u64,
    /// Enqueues refused for back-pressure.
    pub rejected: u64,
    /// Committed messages handed to the reconciler after a rejection.
    pub deferred: u64,
    /// Messages enqueued by the reconciler.
    pub recovered: u64,
    /// Tasks acknowledged.
    pub acked: u64,
    /// Tasks negatively acknowledged.
    pub nacked: u64,
    /// Tasks dead-lettered.
    pub dead_lettered: u64,
    /// Successful pushes to connections.
    pub pushes_delivered: u64,
    /// Pushes abandoned after retries.
    pub pushes_failed: u64,
    /// Leases won by workers.
    pub leases_acquired: u64,
    /// Leaderships ended by lease loss.
    pub leases_lost: u64,
}

macro_rules! counters {
    ($($field:ident => $incr:ident),* $(,)?) => {
        impl FanoutStats {
            $(
                pub(crate) fn $incr(&self, n: u64) {
                    self.$field.fetch_add(n, Ordering::Relaxed);
                }
            )*

            /// Reads every counter.
            #[must_use]
            pub fn snapshot(&self) -> StatsSnapshot {
                StatsSnapshot {
                    $($field: self.$field.load(Ordering::Relaxed),)*
                }
            }
        }
    };
}

counters! {
    enqueued => add_enqueued,
    rejected => add_rejected,
    deferred => add_deferred,
    recovered => add_recovered,
    acked => add_acked,
    nacked => add_nacked,
    dead_lettered => add_dead_lettered,
    pushes_delivered => add_pushes_delivered,
    pushes_failed => add_pushes_failed,
    leases_acquired => add_leases_acquired,
    leases_lost => add_leases_lost,
}
