//! The log replicator: durable sequencing plus fan-out (leader) or ordered
//! ingestion (follower).
//!
//! The role is fixed when the replicator is constructed and drives which
//! operations are available; role-specific state lives in a tagged variant
//! so the shared paths (log, table, tail tracking) stay branch-free.

use std::collections::HashMap;
use std::fmt::Display;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use bytes::Bytes;
use tracing::{debug, error, info, warn};

use sdb_table::MemTable;
use sdb_types::{LogOffset, Term, Timestamp};
use sdb_wal::{LogStore, WalError};

use crate::config::ReplicationConfig;
use crate::message::{AppendEntriesRequest, AppendEntriesResponse, ResponseCode};
use crate::node::ReplicateNode;
use crate::transport::{AppendEntriesService, ReplicaClient, TcpReplicaClient};
use crate::{ReplicationError, ReplicationResult};

// ============================================================================
// Role
// ============================================================================

/// Which side of the protocol a replicator instance plays.
///
/// Fixed for the lifetime of the instance; promotion means constructing a
/// new replicator over the same log directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplicatorRole {
    Leader,
    Follower,
}

impl Display for ReplicatorRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReplicatorRole::Leader => write!(f, "leader"),
            ReplicatorRole::Follower => write!(f, "follower"),
        }
    }
}

// ============================================================================
// Shared sync state
// ============================================================================

/// Tail/stop state shared between the replicator and its sync threads.
#[derive(Debug)]
pub(crate) struct SyncShared {
    pub(crate) state: Mutex<TailState>,
    pub(crate) tail_changed: Condvar,
}

#[derive(Debug)]
pub(crate) struct TailState {
    /// The log's next offset; entries below it are available for shipping.
    pub(crate) tail: LogOffset,
    pub(crate) stopped: bool,
}

/// Wakes threads blocked in [`LogReplicator::wait_replicated`].
#[derive(Debug, Default)]
pub(crate) struct AckSignal {
    pub(crate) lock: Mutex<()>,
    pub(crate) cond: Condvar,
}

// ============================================================================
// Role-specific state
// ============================================================================

/// Leader-only state: identity, epoch, and the follower registry.
struct LeaderState {
    id: String,
    term: Term,
    nodes: Mutex<HashMap<String, ReplicateNode>>,
    /// Watermarks of followers that were removed; a re-added endpoint
    /// resumes from its last known offset instead of offset zero.
    retired: Mutex<HashMap<String, LogOffset>>,
    acks: Arc<AckSignal>,
}

/// Follower-only state: the highest leader term accepted so far.
struct FollowerState {
    term: AtomicU64,
}

enum RoleState {
    Leader(LeaderState),
    Follower(FollowerState),
}

// ============================================================================
// Replica progress (admin surface)
// ============================================================================

/// Per-follower replication progress, as reported to operator tooling.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicaProgress {
    pub endpoint: String,
    /// Highest offset the follower has acknowledged, if any.
    pub acked_offset: Option<LogOffset>,
    /// Entries the follower is behind the leader's tail.
    pub lag: u64,
}

// ============================================================================
// Log Replicator
// ============================================================================

/// Mediates all writes into the durable log and fans them out (leader) or
/// ingests a leader's stream in order (follower).
///
/// # Failure semantics
///
/// A local durable-append failure is fatal to that write: the entry is
/// applied to the table only after the append succeeds, so there is no
/// partial state to undo. Follower gaps and transport failures are
/// recoverable and never block the leader's local writes.
pub struct LogReplicator {
    log: Arc<LogStore>,
    table: Arc<MemTable>,
    config: ReplicationConfig,
    shared: Arc<SyncShared>,
    role: RoleState,
}

impl LogReplicator {
    /// Opens a leader over `path`, recovering any existing log, and starts
    /// a sync thread for each configured follower endpoint.
    ///
    /// `id` is the identity stamped into shipped requests (normally the
    /// leader's own endpoint); `term` is the epoch assigned by whatever
    /// placed this leader (not elected here).
    ///
    /// # Errors
    ///
    /// Fails if the log directory is inaccessible or recovery detects
    /// corruption it cannot skip past.
    pub fn leader(
        path: impl Into<PathBuf>,
        id: impl Into<String>,
        term: Term,
        endpoints: &[String],
        table: Arc<MemTable>,
        config: ReplicationConfig,
    ) -> ReplicationResult<Self> {
        let (log, shared) = Self::open_log(path, &table, &config)?;
        let replicator = Self {
            log,
            table,
            config,
            shared,
            role: RoleState::Leader(LeaderState {
                id: id.into(),
                term,
                nodes: Mutex::new(HashMap::new()),
                retired: Mutex::new(HashMap::new()),
                acks: Arc::new(AckSignal::default()),
            }),
        };
        for endpoint in endpoints {
            replicator.add_replicate_node(endpoint.clone())?;
        }
        Ok(replicator)
    }

    /// Opens a follower over `path`, recovering any existing log.
    pub fn follower(
        path: impl Into<PathBuf>,
        table: Arc<MemTable>,
        config: ReplicationConfig,
    ) -> ReplicationResult<Self> {
        let (log, shared) = Self::open_log(path, &table, &config)?;
        Ok(Self {
            log,
            table,
            config,
            shared,
            role: RoleState::Follower(FollowerState {
                term: AtomicU64::new(Term::ZERO.as_u64()),
            }),
        })
    }

    /// Opens the log store and replays recovered entries into the table.
    fn open_log(
        path: impl Into<PathBuf>,
        table: &Arc<MemTable>,
        config: &ReplicationConfig,
    ) -> ReplicationResult<(Arc<LogStore>, Arc<SyncShared>)> {
        let log = Arc::new(LogStore::open(path, config.wal)?);

        let mut replayed = 0u64;
        for entry in log.iter() {
            let entry = entry?;
            table.apply(entry.key(), entry.value(), entry.ts());
            replayed += 1;
        }
        if replayed > 0 {
            info!(entries = replayed, "replayed recovered log into table");
        }

        let shared = Arc::new(SyncShared {
            state: Mutex::new(TailState {
                tail: log.next_offset(),
                stopped: false,
            }),
            tail_changed: Condvar::new(),
        });
        Ok((log, shared))
    }

    /// Returns this replicator's role.
    pub fn role(&self) -> ReplicatorRole {
        match &self.role {
            RoleState::Leader(_) => ReplicatorRole::Leader,
            RoleState::Follower(_) => ReplicatorRole::Follower,
        }
    }

    /// Returns the table this replicator applies entries to.
    pub fn table(&self) -> &Arc<MemTable> {
        &self.table
    }

    /// The offset the next appended entry will receive.
    pub fn next_offset(&self) -> LogOffset {
        self.log.next_offset()
    }

    /// The offset of the most recently appended entry, if any.
    pub fn last_offset(&self) -> Option<LogOffset> {
        self.log.last_offset()
    }

    // ------------------------------------------------------------------
    // Leader operations
    // ------------------------------------------------------------------

    /// Appends one write: assigns the next offset, stores it durably,
    /// applies it to the table, and makes it available for follower sync.
    ///
    /// Local durability only - replication to followers is asynchronous.
    /// Use [`wait_replicated`](Self::wait_replicated) when follower
    /// durability must gate the caller's own acknowledgment.
    pub fn append_entry(
        &self,
        key: Bytes,
        value: Bytes,
        ts: Timestamp,
    ) -> ReplicationResult<LogOffset> {
        let leader = self.as_leader()?;
        if self.is_stopped() {
            return Err(ReplicationError::Stopped);
        }

        let entry = self.log.append(leader.term, key, value, ts)?;
        // Apply strictly after the durable append.
        self.table.apply(entry.key(), entry.value(), entry.ts());
        self.publish_tail();
        Ok(entry.offset())
    }

    /// Registers a new follower and starts shipping to it.
    ///
    /// A brand-new endpoint starts from offset zero; an endpoint that was
    /// previously removed resumes from its last acknowledged offset.
    ///
    /// # Errors
    ///
    /// [`ReplicationError::DuplicateEndpoint`] if already registered.
    pub fn add_replicate_node(&self, endpoint: String) -> ReplicationResult<()> {
        let client = Arc::new(TcpReplicaClient::new(
            endpoint.clone(),
            self.config.request_timeout,
        ));
        self.add_replicate_node_with_client(endpoint, client)
    }

    /// Like [`add_replicate_node`](Self::add_replicate_node) with a caller
    /// supplied RPC stub (in-process followers, test doubles).
    pub fn add_replicate_node_with_client(
        &self,
        endpoint: String,
        client: Arc<dyn ReplicaClient>,
    ) -> ReplicationResult<()> {
        let leader = self.as_leader()?;
        if self.is_stopped() {
            return Err(ReplicationError::Stopped);
        }

        let mut nodes = leader.nodes.lock().expect("replica registry lock poisoned");
        if nodes.contains_key(&endpoint) {
            return Err(ReplicationError::DuplicateEndpoint { endpoint });
        }

        let start_offset = leader
            .retired
            .lock()
            .expect("retired registry lock poisoned")
            .remove(&endpoint)
            .unwrap_or(LogOffset::ZERO);

        let node = ReplicateNode::start(
            endpoint.clone(),
            client,
            Arc::clone(&self.log),
            Arc::clone(&self.shared),
            Arc::clone(&leader.acks),
            self.config,
            leader.term,
            leader.id.clone(),
            start_offset,
        );
        info!(endpoint = %endpoint, from = %start_offset, "replica added");
        nodes.insert(endpoint, node);
        Ok(())
    }

    /// Stops shipping to `endpoint` and drops it from the registry,
    /// remembering its watermark in case it is re-added.
    pub fn remove_replicate_node(&self, endpoint: &str) -> ReplicationResult<()> {
        let leader = self.as_leader()?;

        let node = leader
            .nodes
            .lock()
            .expect("replica registry lock poisoned")
            .remove(endpoint);
        let Some(mut node) = node else {
            return Err(ReplicationError::UnknownEndpoint {
                endpoint: endpoint.to_string(),
            });
        };
        node.stop();
        leader
            .retired
            .lock()
            .expect("retired registry lock poisoned")
            .insert(endpoint.to_string(), node.synced_offset());
        info!(endpoint = %endpoint, "replica removed");
        Ok(())
    }

    /// Per-follower progress, for operator tooling.
    pub fn replica_status(&self) -> ReplicationResult<Vec<ReplicaProgress>> {
        let leader = self.as_leader()?;
        let tail = self.log.next_offset();

        let nodes = leader.nodes.lock().expect("replica registry lock poisoned");
        let mut status: Vec<ReplicaProgress> = nodes
            .values()
            .map(|node| {
                let next = node.synced_offset();
                ReplicaProgress {
                    endpoint: node.endpoint().to_string(),
                    acked_offset: (next > LogOffset::ZERO)
                        .then(|| LogOffset::new(next.as_u64() - 1)),
                    lag: next.distance_to(tail),
                }
            })
            .collect();
        status.sort_by(|a, b| a.endpoint.cmp(&b.endpoint));
        Ok(status)
    }

    /// Blocks until every registered follower has acknowledged `offset`,
    /// or `timeout` elapses. Returns whether the offset is fully
    /// replicated.
    ///
    /// This is the synchronous-acknowledgment surface: a caller that must
    /// not ack its own client before follower durability calls this after
    /// [`append_entry`](Self::append_entry). With no followers registered
    /// it returns `true` immediately.
    pub fn wait_replicated(
        &self,
        offset: LogOffset,
        timeout: Duration,
    ) -> ReplicationResult<bool> {
        let leader = self.as_leader()?;
        let deadline = Instant::now() + timeout;

        loop {
            if self.min_synced(leader) > offset.as_u64() {
                return Ok(true);
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(false);
            }
            // The ack lock is never held across the registry lookup above,
            // so a notify can slip between the check and the wait; the tick
            // bound keeps that window from turning into a stall.
            let wait = (deadline - now).min(self.config.poll_interval);
            let guard = leader.acks.lock.lock().expect("ack lock poisoned");
            let _ = leader
                .acks
                .cond
                .wait_timeout(guard, wait)
                .expect("ack lock poisoned");
        }
    }

    /// The smallest follower watermark (next offset needed); `u64::MAX`
    /// with no followers.
    fn min_synced(&self, leader: &LeaderState) -> u64 {
        leader
            .nodes
            .lock()
            .expect("replica registry lock poisoned")
            .values()
            .map(|node| node.synced_offset().as_u64())
            .min()
            .unwrap_or(u64::MAX)
    }

    // ------------------------------------------------------------------
    // Follower operations
    // ------------------------------------------------------------------

    /// Ingests a batch shipped by the leader.
    ///
    /// The batch must be contiguous with the local log tail; otherwise it
    /// is rejected with the offset this follower needs next, and nothing
    /// is stored or applied. Entries are applied to the table only after
    /// the whole batch is durable.
    pub fn append_entries(&self, request: &AppendEntriesRequest) -> AppendEntriesResponse {
        let RoleState::Follower(follower) = &self.role else {
            warn!(leader = %request.leader, "append_entries on a non-follower");
            return AppendEntriesResponse::rejected(
                ResponseCode::NotFollower,
                self.log.next_offset(),
            );
        };

        if !self.accept_term(follower, request.term) {
            warn!(
                leader = %request.leader,
                term = %request.term,
                "rejecting stale leader"
            );
            return AppendEntriesResponse::rejected(
                ResponseCode::StaleLeader,
                self.log.next_offset(),
            );
        }

        let tail = self.log.next_offset();
        if request.starting_offset != tail {
            debug!(
                leader = %request.leader,
                sent = %request.starting_offset,
                need = %tail,
                "rejecting gapped batch"
            );
            return AppendEntriesResponse::rejected(ResponseCode::OffsetGap, tail);
        }

        match self.log.append_batch(&request.entries) {
            Ok(()) => {
                // Apply in order, strictly after the durable append.
                for entry in &request.entries {
                    self.table.apply(entry.key(), entry.value(), entry.ts());
                }
                let new_tail = self.log.next_offset();
                self.publish_tail();
                debug!(
                    leader = %request.leader,
                    count = request.entries.len(),
                    tail = %new_tail,
                    "batch stored and applied"
                );
                AppendEntriesResponse::accepted(new_tail)
            }
            Err(WalError::OffsetGap { expected, .. }) => {
                AppendEntriesResponse::rejected(ResponseCode::OffsetGap, expected)
            }
            Err(e) => {
                error!(error = %e, "durable append failed");
                AppendEntriesResponse::rejected(ResponseCode::Storage, self.log.next_offset())
            }
        }
    }

    /// Records the request term if it is at least as fresh as any accepted
    /// so far. Returns false for a stale leader.
    fn accept_term(&self, follower: &FollowerState, term: Term) -> bool {
        let requested = term.as_u64();
        let mut current = follower.term.load(Ordering::Acquire);
        loop {
            if requested < current {
                return false;
            }
            match follower.term.compare_exchange(
                current,
                requested,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    // ------------------------------------------------------------------
    // Shared operations
    // ------------------------------------------------------------------

    /// Wakes all sync threads so they check for new entries immediately
    /// instead of waiting for their next poll tick. Call after a burst of
    /// appends to minimize replication latency.
    pub fn notify(&self) {
        let _state = self.shared.state.lock().expect("sync state lock poisoned");
        self.shared.tail_changed.notify_all();
    }

    /// Stops all sync threads, waits for them to finish their in-flight
    /// round trips, and closes the log store. Idempotent.
    pub fn stop(&self) -> ReplicationResult<()> {
        {
            let mut state = self.shared.state.lock().expect("sync state lock poisoned");
            if state.stopped {
                return Ok(());
            }
            state.stopped = true;
            self.shared.tail_changed.notify_all();
        }

        if let RoleState::Leader(leader) = &self.role {
            let mut nodes = leader.nodes.lock().expect("replica registry lock poisoned");
            for (_, mut node) in nodes.drain() {
                node.stop();
            }
            let _guard = leader.acks.lock.lock().expect("ack lock poisoned");
            leader.acks.cond.notify_all();
        }

        self.log.close()?;
        info!(role = %self.role(), "replicator stopped");
        Ok(())
    }

    fn publish_tail(&self) {
        let mut state = self.shared.state.lock().expect("sync state lock poisoned");
        state.tail = self.log.next_offset();
    }

    fn is_stopped(&self) -> bool {
        self.shared
            .state
            .lock()
            .expect("sync state lock poisoned")
            .stopped
    }

    fn as_leader(&self) -> ReplicationResult<&LeaderState> {
        match &self.role {
            RoleState::Leader(leader) => Ok(leader),
            RoleState::Follower(_) => Err(ReplicationError::WrongRole {
                expected: ReplicatorRole::Leader,
            }),
        }
    }
}

impl AppendEntriesService for LogReplicator {
    fn append_entries(&self, request: &AppendEntriesRequest) -> AppendEntriesResponse {
        LogReplicator::append_entries(self, request)
    }
}

impl Drop for LogReplicator {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            warn!(error = %e, "stop during drop failed");
        }
    }
}

impl std::fmt::Debug for LogReplicator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogReplicator")
            .field("role", &self.role())
            .field("next_offset", &self.log.next_offset())
            .finish()
    }
}
