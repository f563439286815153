//! Per-follower sync state and its background shipper thread.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use tracing::{debug, trace, warn};

use sdb_types::{LogOffset, Term};
use sdb_wal::LogStore;

use crate::config::ReplicationConfig;
use crate::message::{AppendEntriesRequest, ResponseCode};
use crate::replicator::{AckSignal, SyncShared};
use crate::transport::ReplicaClient;

/// Leader-side handle for one follower: its sync watermark, its RPC stub,
/// and the background thread that ships entries to it.
///
/// # Ownership
///
/// Owned exclusively by the leader's replica registry. The watermark is
/// advanced only by the node's own thread; `running` is also cleared by
/// `stop()` from the registry's thread, which is why both are atomics.
#[derive(Debug)]
pub struct ReplicateNode {
    endpoint: String,
    /// Next offset the follower needs (everything below is acknowledged).
    synced: Arc<AtomicU64>,
    running: Arc<AtomicBool>,
    shared: Arc<SyncShared>,
    handle: Option<JoinHandle<()>>,
}

impl ReplicateNode {
    /// Creates the node and starts its sync thread at `start_offset`.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn start(
        endpoint: String,
        client: Arc<dyn ReplicaClient>,
        log: Arc<LogStore>,
        shared: Arc<SyncShared>,
        acks: Arc<AckSignal>,
        config: ReplicationConfig,
        term: Term,
        leader_id: String,
        start_offset: LogOffset,
    ) -> Self {
        let synced = Arc::new(AtomicU64::new(start_offset.as_u64()));
        let running = Arc::new(AtomicBool::new(true));

        let worker = SyncWorker {
            endpoint: endpoint.clone(),
            leader_id,
            term,
            client,
            log,
            shared: Arc::clone(&shared),
            acks,
            config,
            synced: Arc::clone(&synced),
            running: Arc::clone(&running),
        };
        let handle = std::thread::Builder::new()
            .name(format!("replicate-{endpoint}"))
            .spawn(move || worker.run())
            .expect("failed to spawn sync thread");

        Self {
            endpoint,
            synced,
            running,
            shared,
            handle: Some(handle),
        }
    }

    /// The follower endpoint this node ships to.
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// The next offset the follower needs; everything below it has been
    /// acknowledged, durably stored and applied by the follower.
    pub fn synced_offset(&self) -> LogOffset {
        LogOffset::new(self.synced.load(Ordering::Acquire))
    }

    /// Signals the sync thread to exit and joins it.
    ///
    /// The watermark is only ever advanced after a successful, applied RPC
    /// round trip, so stopping loses no acknowledged progress.
    pub(crate) fn stop(&mut self) {
        self.running.store(false, Ordering::Release);
        {
            let _state = self.shared.state.lock().expect("sync state lock poisoned");
            self.shared.tail_changed.notify_all();
        }
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!(endpoint = %self.endpoint, "sync thread panicked");
            }
        }
    }
}

impl Drop for ReplicateNode {
    fn drop(&mut self) {
        self.stop();
    }
}

// ============================================================================
// Sync worker
// ============================================================================

/// The state moved onto a node's sync thread.
struct SyncWorker {
    endpoint: String,
    leader_id: String,
    term: Term,
    client: Arc<dyn ReplicaClient>,
    log: Arc<LogStore>,
    shared: Arc<SyncShared>,
    acks: Arc<AckSignal>,
    config: ReplicationConfig,
    synced: Arc<AtomicU64>,
    running: Arc<AtomicBool>,
}

impl SyncWorker {
    /// The sync loop: park until there is work, ship one batch, repeat.
    ///
    /// Entries are always shipped in strictly increasing offset order; the
    /// watermark moves forward only on an accepted batch, or to exactly the
    /// offset the follower reports on a gap rejection.
    fn run(self) {
        debug!(endpoint = %self.endpoint, "sync thread started");
        loop {
            if !self.wait_for_work() {
                break;
            }
            if !self.ship_batch() {
                if !self.backoff() {
                    break;
                }
            }
        }
        debug!(
            endpoint = %self.endpoint,
            synced = self.synced.load(Ordering::Acquire),
            "sync thread exiting"
        );
    }

    /// Parks until the tail is past the watermark. Returns false on stop.
    fn wait_for_work(&self) -> bool {
        let mut state = self.shared.state.lock().expect("sync state lock poisoned");
        loop {
            if state.stopped || !self.running.load(Ordering::Acquire) {
                return false;
            }
            if state.tail.as_u64() > self.synced.load(Ordering::Acquire) {
                return true;
            }
            let (guard, _timed_out) = self
                .shared
                .tail_changed
                .wait_timeout(state, self.config.poll_interval)
                .expect("sync state lock poisoned");
            state = guard;
        }
    }

    /// Ships the next batch. Returns false if the caller should back off.
    fn ship_batch(&self) -> bool {
        let from = LogOffset::new(self.synced.load(Ordering::Acquire));
        let entries = match self.log.entries_from(
            from,
            self.config.max_batch_entries,
            self.config.max_batch_bytes,
        ) {
            Ok(entries) => entries,
            Err(e) => {
                warn!(endpoint = %self.endpoint, error = %e, "failed to read batch from log");
                return false;
            }
        };
        if entries.is_empty() {
            return true;
        }

        let count = entries.len();
        let request = AppendEntriesRequest::new(self.leader_id.clone(), self.term, from, entries);

        match self.client.append_entries(&request) {
            Ok(response) if response.accepted => {
                trace!(
                    endpoint = %self.endpoint,
                    from = %from,
                    count,
                    acked = %response.next_offset,
                    "batch acknowledged"
                );
                self.advance(response.next_offset);
                true
            }
            Ok(response) => match response.code {
                ResponseCode::OffsetGap => {
                    // Resync from exactly where the follower says it is -
                    // never from an offset that could skip entries.
                    warn!(
                        endpoint = %self.endpoint,
                        sent = %from,
                        needs = %response.next_offset,
                        "follower reported gap, resyncing"
                    );
                    self.synced
                        .store(response.next_offset.as_u64(), Ordering::Release);
                    true
                }
                code => {
                    warn!(endpoint = %self.endpoint, ?code, "batch rejected");
                    false
                }
            },
            Err(e) => {
                debug!(endpoint = %self.endpoint, error = %e, "ship failed, will retry");
                false
            }
        }
    }

    /// Advances the watermark and wakes durability waiters.
    fn advance(&self, next_offset: LogOffset) {
        self.synced.store(next_offset.as_u64(), Ordering::Release);
        let _guard = self.acks.lock.lock().expect("ack lock poisoned");
        self.acks.cond.notify_all();
    }

    /// Sleeps out the retry backoff. Returns false on stop.
    fn backoff(&self) -> bool {
        let state = self.shared.state.lock().expect("sync state lock poisoned");
        if state.stopped || !self.running.load(Ordering::Acquire) {
            return false;
        }
        let (state, _timed_out) = self
            .shared
            .tail_changed
            .wait_timeout(state, self.config.retry_backoff)
            .expect("sync state lock poisoned");
        !state.stopped && self.running.load(Ordering::Acquire)
    }
}
