//! # sdb-replication: Log-shipping replication for `StrataDB`
//!
//! This crate implements the primary-secondary replication core: a leader
//! durably sequences writes into the append-only log and fans them out to
//! follower replicas over RPC; followers ingest batches in strict offset
//! order, apply them to their table, and acknowledge.
//!
//! ## Architecture
//!
//! ```text
//! Write
//!   │
//!   ▼
//! ┌──────────────────┐  append + apply   ┌───────────┐
//! │  LogReplicator   │──────────────────▶│  MemTable │
//! │  (leader)        │                   └───────────┘
//! └───────┬──────────┘
//!         │ one sync thread per follower
//!         ▼
//! ┌──────────────────┐  AppendEntries    ┌──────────────────┐
//! │  ReplicateNode   │──────────────────▶│  LogReplicator   │
//! │  (shipper)       │◀──────────────────│  (follower)      │
//! └──────────────────┘   ack/next_offset └───────┬──────────┘
//!                                                │ append + apply
//!                                                ▼
//!                                          ┌───────────┐
//!                                          │  MemTable │
//!                                          └───────────┘
//! ```
//!
//! ## Guarantees
//!
//! - Append order equals offset order (single critical section on the
//!   leader's write path)
//! - A follower receives and applies entries in strictly increasing,
//!   gap-free offset order; a gap is rejected and the leader resyncs from
//!   the offset the follower reports
//! - Application to the table happens only after the durable append, never
//!   before, never speculatively
//! - A follower acknowledges offset `n` only once every entry `<= n` is
//!   durably stored and applied
//!
//! ## Key Components
//!
//! - [`LogReplicator`]: owns the log store and either the follower ingest
//!   path or the leader's replica registry - the role is fixed at
//!   construction
//! - [`ReplicateNode`]: per-follower background shipper
//! - [`ReplicaClient`] / [`ReplicaServer`]: the RPC seam - blocking framed
//!   TCP, or in-process for tests and single-process deployments

mod config;
mod framing;
mod message;
mod node;
mod replicator;
mod server;
mod transport;

#[cfg(test)]
mod tests;

pub use config::ReplicationConfig;
pub use framing::{FrameDecoder, FrameEncoder, FramingError, HEADER_SIZE};
pub use message::{
    AppendEntriesRequest, AppendEntriesResponse, ResponseCode, WireMessage,
};
pub use node::ReplicateNode;
pub use replicator::{LogReplicator, ReplicaProgress, ReplicatorRole};
pub use server::ReplicaServer;
pub use transport::{
    AppendEntriesService, LocalReplicaClient, ReplicaClient, TcpReplicaClient, TransportError,
};

use sdb_wal::WalError;

/// Errors surfaced by the replicator itself.
///
/// Transport failures do not appear here: they are retried with backoff by
/// the owning [`ReplicateNode`] and never block the leader's local writes.
#[derive(Debug, thiserror::Error)]
pub enum ReplicationError {
    /// The durable log rejected or failed the write.
    #[error("log error: {0}")]
    Wal(#[from] WalError),

    /// A role-specific operation was invoked on the wrong role.
    #[error("operation requires the {expected} role")]
    WrongRole { expected: ReplicatorRole },

    /// The endpoint is already registered as a replica.
    #[error("replica endpoint already registered: {endpoint}")]
    DuplicateEndpoint { endpoint: String },

    /// The endpoint is not registered as a replica.
    #[error("unknown replica endpoint: {endpoint}")]
    UnknownEndpoint { endpoint: String },

    /// The replicator has been stopped.
    #[error("replicator is stopped")]
    Stopped,
}

/// Result type for replication operations.
pub type ReplicationResult<T> = Result<T, ReplicationError>;
