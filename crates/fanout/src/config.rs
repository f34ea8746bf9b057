//! Fan-out pipeline configuration

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Fan-out pipeline configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FanoutConfig {
    /// Number of partitions. Changing it remaps routing keys.
    pub partition_count: u32,

    /// Lease time-to-live for partition leadership
    #[serde(with = "humantime_serde")]
    pub lease_ttl: Duration,

    /// Interval between lease renewals, must be shorter than `lease_ttl`
    #[serde(with = "humantime_serde")]
    pub renew_interval: Duration,

    /// How long a follower waits between election attempts
    #[serde(with = "humantime_serde")]
    pub election_interval: Duration,

    /// Failed attempts after which a task is dead-lettered
    pub max_attempts: u32,

    /// Maximum unacknowledged tasks per partition
    pub queue_capacity: usize,

    /// Committed messages parked per partition while its lane is full.
    /// Past this, fan-out is rejected until the backlog drains.
    pub max_deferred: usize,

    /// Worker replicas competing for each partition's lease
    pub replicas_per_partition: usize,

    /// Upper bound on a single push to one connection
    #[serde(with = "humantime_serde")]
    pub push_timeout: Duration,

    /// Extra push attempts per connection before giving up on it
    pub push_retries: u32,

    /// How often deferred messages are re-enqueued
    #[serde(with = "humantime_serde")]
    pub recovery_interval: Duration,

    /// Messages read per log scan during replay
    pub recovery_batch: usize,
}

impl Default for FanoutConfig {
    fn default() -> Self {
        Self {
            partition_count: 16,
            lease_ttl: Duration::from_secs(5),
            renew_interval: Duration::from_millis(1500),
            election_interval: Duration::from_millis(500),
            max_attempts: 5,
            queue_capacity: 1024,
            max_deferred: 1024,
            replicas_per_partition: 3,
            push_timeout: Duration::from_secs(2),
            push_retries: 2,
            recovery_interval: Duration::from_secs(1),
            recovery_batch: 256,
        }
    }
}

impl FanoutConfig {
    /// Parses a TOML document and validates it. Missing keys take defaults.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidConfig` if the document does not parse or fails validation.
    pub fn from_toml_str(document: &str) -> Result<Self> {
        let config: Self =
            toml::from_str(document).map_err(|e| Error::InvalidConfig(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Loads and validates a TOML configuration file.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidConfig` if the file cannot be read, parsed or validated.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let document = std::fs::read_to_string(path)
            .map_err(|e| Error::InvalidConfig(format!("{}: {e}", path.display())))?;
        Self::from_toml_str(&document)
    }

    /// Checks the bounds every component relies on.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidConfig` naming the first offending option.
    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: &str| Err(Error::InvalidConfig(msg.to_string()));

        if self.partition_count == 0 {
            return invalid("partition_count must be at least 1");
        }
        if self.max_attempts == 0 {
            return invalid("max_attempts must be at least 1");
        }
        if self.queue_capacity == 0 {
            return invalid("queue_capacity must be at least 1");
        }
        if self.replicas_per_partition == 0 {
            return invalid("replicas_per_partition must be at least 1");
        }
        if self.lease_ttl.is_zero() {
            return invalid("lease_ttl must be greater than zero");
        }
        if self.renew_interval.is_zero() || self.renew_interval >= self.lease_ttl {
            return invalid("renew_interval must be greater than zero and shorter than lease_ttl");
        }
        if self.election_interval.is_zero() {
            return invalid("election_interval must be greater than zero");
        }
        if self.push_timeout.is_zero() {
            return invalid("push_timeout must be greater than zero");
        }
        if self.recovery_interval.is_zero() {
            return invalid("recovery_interval must be greater than zero");
        }
        if self.recovery_batch == 0 {
            return invalid("recovery_batch must be at least 1");
        }

        Ok(())
    }
}
