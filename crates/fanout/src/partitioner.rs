//! Routing keys to partitions.
//!
//! Keys are hashed with xxHash64 (seed 0, stable across processes and
//! releases) and placed with Jump Consistent Hash, so growing from `n` to `n + 1`
//! partitions moves only about `1 / (n + 1)` of the keys.

use twox_hash::XxHash64;

use crate::error::{Error, Result};
use crate::task::{PartitionId, RoutingKey};

const HASH_SEED: u64 = 0;

/// Maps `routing_key` to a partition in `[0, partition_count)`.
///
/// # Panics
///
/// Panics if `partition_count` is zero. Configuration validation rules that out
/// before a `Partitioner` exists.
#[must_use]
pub fn partition_of(routing_key: &RoutingKey, partition_count: u32) -> PartitionId {
    assert!(partition_count > 0, "partition_count must be > 0");

    let hash = XxHash64::oneshot(HASH_SEED, routing_key.as_str().as_bytes());
    PartitionId(jump_hash(hash, partition_count))
}

/// Jump Consistent Hash (Lamping & Veach).
#[allow(
    clippy::cast_possible_truncation,
    clippy::cast_possible_wrap,
    clippy::cast_precision_loss,
    clippy::cast_sign_loss
)]
fn jump_hash(mut key: u64, buckets: u32) -> u32 {
    let mut b: i64 = -1;
    let mut j: i64 = 0;

    while j < i64::from(buckets) {
        b = j;
        key = key.wrapping_mul(2_862_933_555_777_941_757).wrapping_add(1);
        j = ((b + 1) as f64 * ((1_i64 << 31) as f64 / ((key >> 33) + 1) as f64)) as i64;
    }

    b as u32
}

/// A partition count pinned to an epoch.
///
/// The mapping only changes through [`Partitioner::rebalance`], which bumps the
/// epoch so stale mappings can be told apart.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Partitioner {
    partition_count: u32,
    epoch: u64,
}

impl Partitioner {
    /// Creates a partitioner at epoch 0.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidConfig` if `partition_count` is zero.
    pub fn new(partition_count: u32) -> Result<Self> {
        if partition_count == 0 {
            return Err(Error::InvalidConfig(
                "partition_count must be at least 1".to_string(),
            ));
        }

        Ok(Self {
            partition_count,
            epoch: 0,
        })
    }

    /// Number of partitions.
    #[must_use]
    pub const fn partition_count(&self) -> u32 {
        self.partition_count
    }

    /// Mapping epoch.
    #[must_use]
    pub const fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Partition for `routing_key` under this epoch.
    #[must_use]
    pub fn partition_of(&self, routing_key: &RoutingKey) -> PartitionId {
        partition_of(routing_key, self.partition_count)
    }

    /// All partitions in ascending order.
    pub fn partitions(&self) -> impl Iterator<Item = PartitionId> + use<> {
        (0..self.partition_count).map(PartitionId)
    }

    /// Produces the partitioner for a new partition count under the next epoch.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidConfig` if `partition_count` is zero.
    pub fn rebalance(&self, partition_count: u32) -> Result<Self> {
        let mut next = Self::new(partition_count)?;
        next.epoch = self.epoch + 1;
        Ok(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use proptest::prelude::*;

    #[test]
    fn test_group_17_is_pinned() {
        let key = RoutingKey::from("group-17");
        let first = partition_of(&key, 4);

        for _ in 0..100 {
            assert_eq!(partition_of(&key, 4), first);
        }
        assert!(first.0 < 4);
    }

    #[test]
    fn test_single_partition_takes_everything() {
        for i in 0..100 {
            assert_eq!(
                partition_of(&RoutingKey::new(format!("group-{i}")), 1),
                PartitionId(0)
            );
        }
    }

    #[test]
    fn test_keys_spread_over_partitions() {
        let mut counts = [0_u32; 8];
        for i in 0..8000 {
            counts[partition_of(&RoutingKey::new(format!("user-{i}")), 8).0 as usize] += 1;
        }

        for count in counts {
            assert!((700..1300).contains(&count), "skewed distribution: {counts:?}");
        }
    }

    #[test]
    fn test_rebalance_bumps_epoch() {
        let partitioner = Partitioner::new(4).unwrap();
        let grown = partitioner.rebalance(5).unwrap();

        assert_eq!(grown.epoch(), 1);
        assert_eq!(grown.partition_count(), 5);
        assert!(partitioner.rebalance(0).is_err());
        assert!(Partitioner::new(0).is_err());
        assert_eq!(
            grown.partitions().collect::<Vec<_>>(),
            (0..5).map(PartitionId).collect::<Vec<_>>()
        );
    }

    proptest! {
        #[test]
        fn prop_partition_is_deterministic_and_in_range(key in ".*", count in 1_u32..1024) {
            let key = RoutingKey::new(key);
            let first = partition_of(&key, count);

            prop_assert!(first.0 < count);
            prop_assert_eq!(first, partition_of(&key, count));
        }

        #[test]
        fn prop_growing_moves_keys_only_to_new_partition(key in ".*", count in 1_u32..512) {
            let key = RoutingKey::new(key);
            let before = partition_of(&key, count);
            let after = partition_of(&key, count + 1);

            prop_assert!(after == before || after == PartitionId(count));
        }
    }
}
