//! Replication configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use sdb_wal::WalConfig;

/// Configuration for a [`LogReplicator`](crate::LogReplicator) and its
/// shippers.
///
/// These knobs bound replication latency (how long a caught-up shipper
/// sleeps before re-checking), retry pressure on a failing follower, and
/// the batch size a lagging follower catches up with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicationConfig {
    /// Log store configuration.
    pub wal: WalConfig,

    /// How long a caught-up sync thread waits before re-checking the tail.
    ///
    /// [`notify()`](crate::LogReplicator::notify) wakes it early; this is
    /// the upper bound on wake latency.
    pub poll_interval: Duration,

    /// Backoff after a transport failure or rejection.
    pub retry_backoff: Duration,

    /// Request timeout for the TCP client.
    pub request_timeout: Duration,

    /// Maximum entries per shipped batch.
    pub max_batch_entries: usize,

    /// Maximum bytes per shipped batch (soft limit; always ships at least
    /// one entry).
    pub max_batch_bytes: u64,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self::development()
    }
}

impl ReplicationConfig {
    /// Configuration for production use.
    pub fn production() -> Self {
        Self {
            wal: WalConfig::production(),
            poll_interval: Duration::from_millis(100),
            retry_backoff: Duration::from_millis(500),
            request_timeout: Duration::from_secs(5),
            max_batch_entries: 1000,
            max_batch_bytes: 4 * 1024 * 1024,
        }
    }

    /// Configuration for development/testing: short waits so tests converge
    /// quickly.
    pub fn development() -> Self {
        Self {
            wal: WalConfig::development(),
            poll_interval: Duration::from_millis(20),
            retry_backoff: Duration::from_millis(50),
            request_timeout: Duration::from_secs(1),
            max_batch_entries: 256,
            max_batch_bytes: 1024 * 1024,
        }
    }
}
