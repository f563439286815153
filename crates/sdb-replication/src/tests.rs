use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tempfile::TempDir;

use sdb_table::MemTable;
use sdb_types::{LogOffset, Term, Timestamp};
use sdb_wal::LogEntry;

use crate::{
    AppendEntriesRequest, AppendEntriesResponse, LocalReplicaClient, LogReplicator,
    ReplicaClient, ReplicaServer, ReplicationConfig, ReplicationError, ReplicatorRole,
    ResponseCode, TransportError,
};

const SYNC_WAIT: Duration = Duration::from_secs(5);

fn leader_on(dir: &TempDir, table: Arc<MemTable>) -> LogReplicator {
    LogReplicator::leader(
        dir.path(),
        "127.0.0.1:18527",
        Term::new(1),
        &[],
        table,
        ReplicationConfig::development(),
    )
    .expect("leader init")
}

fn follower_on(dir: &TempDir, table: Arc<MemTable>) -> Arc<LogReplicator> {
    Arc::new(
        LogReplicator::follower(dir.path(), table, ReplicationConfig::development())
            .expect("follower init"),
    )
}

/// The four writes every convergence test uses: one key, descending
/// timestamps, values "value1".."value4".
fn append_four(leader: &LogReplicator) -> LogOffset {
    let mut last = None;
    for (i, ts) in [9527i64, 9526, 9525, 9524].iter().enumerate() {
        let offset = leader
            .append_entry(
                Bytes::from("test_pk"),
                Bytes::from(format!("value{}", i + 1)),
                Timestamp::new(*ts),
            )
            .expect("append");
        last = Some(offset);
    }
    last.expect("appended four entries")
}

fn assert_four_values(table: &MemTable) {
    let mut it = table.iter(&Bytes::from("test_pk"));
    it.seek(Timestamp::new(9527));
    for (ts, value) in [
        (9527, "value1"),
        (9526, "value2"),
        (9525, "value3"),
        (9524, "value4"),
    ] {
        assert!(it.valid());
        assert_eq!(it.ts(), Timestamp::new(ts));
        assert_eq!(it.value(), &Bytes::from(value));
        it.next();
    }
    assert!(!it.valid());
}

fn entry(offset: u64, term: u64, value: &str, ts: i64) -> LogEntry {
    LogEntry::new(
        LogOffset::new(offset),
        Term::new(term),
        Bytes::from("test_pk"),
        Bytes::from(value.to_string()),
        Timestamp::new(ts),
    )
}

/// A stub for a follower that is down: every call fails.
#[derive(Debug)]
struct DownClient;

impl ReplicaClient for DownClient {
    fn append_entries(
        &self,
        _request: &AppendEntriesRequest,
    ) -> Result<AppendEntriesResponse, TransportError> {
        Err(TransportError::Disconnected)
    }

    fn endpoint(&self) -> &str {
        "down:0"
    }
}

// ============================================================================
// Construction and roles
// ============================================================================

#[test]
fn leader_initializes_over_fresh_directory() {
    let dir = TempDir::new().expect("tempdir");
    let leader = leader_on(&dir, Arc::new(MemTable::new("test")));

    assert_eq!(leader.role(), ReplicatorRole::Leader);
    assert_eq!(leader.next_offset(), LogOffset::ZERO);
    leader.stop().expect("stop");
}

#[test]
fn append_assigns_contiguous_offsets() {
    let dir = TempDir::new().expect("tempdir");
    let leader = leader_on(&dir, Arc::new(MemTable::new("test")));

    for i in 0..10u64 {
        let offset = leader
            .append_entry(
                Bytes::from("test_pk"),
                Bytes::from(format!("v{i}")),
                Timestamp::new(i as i64),
            )
            .expect("append");
        assert_eq!(offset, LogOffset::new(i));
    }
    assert_eq!(leader.last_offset(), Some(LogOffset::new(9)));
    leader.stop().expect("stop");
}

#[test]
fn leader_applies_locally_without_followers() {
    let dir = TempDir::new().expect("tempdir");
    let table = Arc::new(MemTable::new("test"));
    let leader = leader_on(&dir, Arc::clone(&table));

    append_four(&leader);
    assert_four_values(&table);
    leader.stop().expect("stop");
}

#[test]
fn role_gates_operations() {
    let leader_dir = TempDir::new().expect("tempdir");
    let follower_dir = TempDir::new().expect("tempdir");

    let leader = leader_on(&leader_dir, Arc::new(MemTable::new("test")));
    let follower = follower_on(&follower_dir, Arc::new(MemTable::new("test")));

    // Follower refuses leader-only operations.
    assert!(matches!(
        follower.append_entry(Bytes::from("k"), Bytes::from("v"), Timestamp::new(1)),
        Err(ReplicationError::WrongRole { .. })
    ));
    assert!(matches!(
        follower.add_replicate_node("127.0.0.1:1".to_string()),
        Err(ReplicationError::WrongRole { .. })
    ));
    assert!(matches!(
        follower.replica_status(),
        Err(ReplicationError::WrongRole { .. })
    ));

    // Leader refuses the follower ingest path.
    let request = AppendEntriesRequest::new("x", Term::new(1), LogOffset::ZERO, vec![]);
    let response = leader.append_entries(&request);
    assert!(!response.accepted);
    assert_eq!(response.code, ResponseCode::NotFollower);

    leader.stop().expect("stop");
    follower.stop().expect("stop");
}

// ============================================================================
// Follower ingest path
// ============================================================================

#[test]
fn follower_accepts_contiguous_batches() {
    let dir = TempDir::new().expect("tempdir");
    let table = Arc::new(MemTable::new("test"));
    let follower = follower_on(&dir, Arc::clone(&table));

    let batch = vec![
        entry(0, 1, "value1", 9527),
        entry(1, 1, "value2", 9526),
    ];
    let request = AppendEntriesRequest::new("leader", Term::new(1), LogOffset::ZERO, batch);
    let response = follower.append_entries(&request);

    assert!(response.accepted);
    assert_eq!(response.code, ResponseCode::Ok);
    assert_eq!(response.next_offset, LogOffset::new(2));
    assert_eq!(table.get(&Bytes::from("test_pk"), Timestamp::new(9526)), Some(Bytes::from("value2")));

    follower.stop().expect("stop");
}

#[test]
fn follower_rejects_gap_and_reports_needed_offset() {
    let dir = TempDir::new().expect("tempdir");
    let table = Arc::new(MemTable::new("test"));
    let follower = follower_on(&dir, Arc::clone(&table));

    // Skips offsets 0..5: rejected, nothing stored or applied.
    let gapped = AppendEntriesRequest::new(
        "leader",
        Term::new(1),
        LogOffset::new(5),
        vec![entry(5, 1, "value6", 1)],
    );
    let response = follower.append_entries(&gapped);
    assert!(!response.accepted);
    assert_eq!(response.code, ResponseCode::OffsetGap);
    assert_eq!(response.next_offset, LogOffset::ZERO);
    assert!(table.is_empty());
    assert_eq!(follower.next_offset(), LogOffset::ZERO);

    follower.stop().expect("stop");
}

#[test]
fn duplicate_delivery_reports_current_watermark() {
    let dir = TempDir::new().expect("tempdir");
    let follower = follower_on(&dir, Arc::new(MemTable::new("test")));

    let batch = vec![entry(0, 1, "value1", 9527)];
    let request = AppendEntriesRequest::new("leader", Term::new(1), LogOffset::ZERO, batch);
    assert!(follower.append_entries(&request).accepted);

    // Redelivery of an already stored batch is a gap from the follower's
    // point of view; the reported offset realigns the leader.
    let response = follower.append_entries(&request);
    assert!(!response.accepted);
    assert_eq!(response.code, ResponseCode::OffsetGap);
    assert_eq!(response.next_offset, LogOffset::new(1));

    follower.stop().expect("stop");
}

#[test]
fn follower_rejects_stale_leader_term() {
    let dir = TempDir::new().expect("tempdir");
    let follower = follower_on(&dir, Arc::new(MemTable::new("test")));

    let fresh = AppendEntriesRequest::new("a", Term::new(5), LogOffset::ZERO, vec![]);
    assert!(follower.append_entries(&fresh).accepted);

    let stale = AppendEntriesRequest::new(
        "b",
        Term::new(3),
        LogOffset::ZERO,
        vec![entry(0, 3, "old", 1)],
    );
    let response = follower.append_entries(&stale);
    assert!(!response.accepted);
    assert_eq!(response.code, ResponseCode::StaleLeader);
    assert_eq!(follower.next_offset(), LogOffset::ZERO);

    follower.stop().expect("stop");
}

#[test]
fn empty_batch_at_tail_is_a_noop_ack() {
    let dir = TempDir::new().expect("tempdir");
    let follower = follower_on(&dir, Arc::new(MemTable::new("test")));

    let request = AppendEntriesRequest::new("leader", Term::new(1), LogOffset::ZERO, vec![]);
    let response = follower.append_entries(&request);
    assert!(response.accepted);
    assert_eq!(response.next_offset, LogOffset::ZERO);

    follower.stop().expect("stop");
}

// ============================================================================
// Leader/follower convergence
// ============================================================================

#[test]
fn follower_added_after_appends_converges() {
    let leader_dir = TempDir::new().expect("tempdir");
    let follower_dir = TempDir::new().expect("tempdir");

    let leader_table = Arc::new(MemTable::new("test"));
    let follower_table = Arc::new(MemTable::new("test"));

    let leader = leader_on(&leader_dir, Arc::clone(&leader_table));
    let follower = follower_on(&follower_dir, Arc::clone(&follower_table));

    let last = append_four(&leader);
    leader.notify();

    leader
        .add_replicate_node_with_client(
            "local:1".to_string(),
            Arc::new(LocalReplicaClient::new("local:1", Arc::clone(&follower) as _)),
        )
        .expect("add replica");

    assert!(leader.wait_replicated(last, SYNC_WAIT).expect("wait"));

    // The follower's table answers exactly like the leader's.
    assert_four_values(&leader_table);
    assert_four_values(&follower_table);
    assert_eq!(follower.next_offset(), LogOffset::new(4));

    let status = leader.replica_status().expect("status");
    assert_eq!(status.len(), 1);
    assert_eq!(status[0].acked_offset, Some(LogOffset::new(3)));
    assert_eq!(status[0].lag, 0);

    leader.stop().expect("stop");
    follower.stop().expect("stop");
}

#[test]
fn follower_added_before_appends_converges() {
    let leader_dir = TempDir::new().expect("tempdir");
    let follower_dir = TempDir::new().expect("tempdir");

    let follower_table = Arc::new(MemTable::new("test"));
    let leader = leader_on(&leader_dir, Arc::new(MemTable::new("test")));
    let follower = follower_on(&follower_dir, Arc::clone(&follower_table));

    leader
        .add_replicate_node_with_client(
            "local:1".to_string(),
            Arc::new(LocalReplicaClient::new("local:1", Arc::clone(&follower) as _)),
        )
        .expect("add replica");

    let last = append_four(&leader);
    leader.notify();

    assert!(leader.wait_replicated(last, SYNC_WAIT).expect("wait"));
    assert_four_values(&follower_table);

    leader.stop().expect("stop");
    follower.stop().expect("stop");
}

#[test]
fn two_followers_converge_independently() {
    let leader_dir = TempDir::new().expect("tempdir");
    let dir_a = TempDir::new().expect("tempdir");
    let dir_b = TempDir::new().expect("tempdir");

    let table_a = Arc::new(MemTable::new("test"));
    let table_b = Arc::new(MemTable::new("test"));

    let leader = leader_on(&leader_dir, Arc::new(MemTable::new("test")));
    let follower_a = follower_on(&dir_a, Arc::clone(&table_a));
    let follower_b = follower_on(&dir_b, Arc::clone(&table_b));

    leader
        .add_replicate_node_with_client(
            "local:a".to_string(),
            Arc::new(LocalReplicaClient::new("local:a", Arc::clone(&follower_a) as _)),
        )
        .expect("add replica a");

    let last = append_four(&leader);
    leader.notify();

    leader
        .add_replicate_node_with_client(
            "local:b".to_string(),
            Arc::new(LocalReplicaClient::new("local:b", Arc::clone(&follower_b) as _)),
        )
        .expect("add replica b");

    assert!(leader.wait_replicated(last, SYNC_WAIT).expect("wait"));
    assert_four_values(&table_a);
    assert_four_values(&table_b);

    leader.stop().expect("stop");
    follower_a.stop().expect("stop");
    follower_b.stop().expect("stop");
}

#[test]
fn removed_follower_resumes_from_its_watermark() {
    let leader_dir = TempDir::new().expect("tempdir");
    let follower_dir = TempDir::new().expect("tempdir");

    let follower_table = Arc::new(MemTable::new("test"));
    let leader = leader_on(&leader_dir, Arc::new(MemTable::new("test")));
    let follower = follower_on(&follower_dir, Arc::clone(&follower_table));
    let client = || Arc::new(LocalReplicaClient::new("local:1", Arc::clone(&follower) as _));

    leader
        .add_replicate_node_with_client("local:1".to_string(), client())
        .expect("add replica");

    let first = leader
        .append_entry(Bytes::from("test_pk"), Bytes::from("value1"), Timestamp::new(9527))
        .expect("append");
    assert!(leader.wait_replicated(first, SYNC_WAIT).expect("wait"));

    leader.remove_replicate_node("local:1").expect("remove");
    assert!(leader.replica_status().expect("status").is_empty());

    // Re-adding resumes from the retained watermark, not offset zero.
    leader
        .add_replicate_node_with_client("local:1".to_string(), client())
        .expect("re-add replica");
    let status = leader.replica_status().expect("status");
    assert_eq!(status[0].acked_offset, Some(LogOffset::ZERO));
    assert_eq!(status[0].lag, 0);

    let second = leader
        .append_entry(Bytes::from("test_pk"), Bytes::from("value2"), Timestamp::new(9526))
        .expect("append");
    leader.notify();
    assert!(leader.wait_replicated(second, SYNC_WAIT).expect("wait"));
    assert_eq!(
        follower_table.get(&Bytes::from("test_pk"), Timestamp::new(9526)),
        Some(Bytes::from("value2"))
    );

    leader.stop().expect("stop");
    follower.stop().expect("stop");
}

#[test]
fn duplicate_endpoint_is_rejected() {
    let dir = TempDir::new().expect("tempdir");
    let follower_dir = TempDir::new().expect("tempdir");
    let leader = leader_on(&dir, Arc::new(MemTable::new("test")));
    let follower = follower_on(&follower_dir, Arc::new(MemTable::new("test")));

    let client = Arc::new(LocalReplicaClient::new("local:1", Arc::clone(&follower) as _));
    leader
        .add_replicate_node_with_client("local:1".to_string(), Arc::clone(&client) as _)
        .expect("add replica");

    assert!(matches!(
        leader.add_replicate_node_with_client("local:1".to_string(), client),
        Err(ReplicationError::DuplicateEndpoint { .. })
    ));
    assert!(matches!(
        leader.remove_replicate_node("local:2"),
        Err(ReplicationError::UnknownEndpoint { .. })
    ));

    leader.stop().expect("stop");
    follower.stop().expect("stop");
}

// ============================================================================
// Durability semantics
// ============================================================================

#[test]
fn wait_replicated_is_trivially_true_without_followers() {
    let dir = TempDir::new().expect("tempdir");
    let leader = leader_on(&dir, Arc::new(MemTable::new("test")));

    let offset = leader
        .append_entry(Bytes::from("k"), Bytes::from("v"), Timestamp::new(1))
        .expect("append");
    assert!(leader
        .wait_replicated(offset, Duration::from_millis(10))
        .expect("wait"));

    leader.stop().expect("stop");
}

#[test]
fn wait_replicated_times_out_on_a_down_follower() {
    let dir = TempDir::new().expect("tempdir");
    let leader = leader_on(&dir, Arc::new(MemTable::new("test")));

    leader
        .add_replicate_node_with_client("down:0".to_string(), Arc::new(DownClient))
        .expect("add replica");

    let offset = leader
        .append_entry(Bytes::from("k"), Bytes::from("v"), Timestamp::new(1))
        .expect("append");
    leader.notify();

    assert!(!leader
        .wait_replicated(offset, Duration::from_millis(200))
        .expect("wait"));

    // The leader's local write is unaffected by the down follower.
    assert_eq!(leader.last_offset(), Some(offset));

    leader.stop().expect("stop");
}

#[test]
fn recovery_replays_log_into_table() {
    let dir = TempDir::new().expect("tempdir");
    {
        let leader = leader_on(&dir, Arc::new(MemTable::new("test")));
        append_four(&leader);
        leader.stop().expect("stop");
    }

    // A restart over the same directory rebuilds exactly the applied state.
    let table = Arc::new(MemTable::new("test"));
    let leader = leader_on(&dir, Arc::clone(&table));

    assert_eq!(leader.next_offset(), LogOffset::new(4));
    assert_four_values(&table);

    // Re-running recovery (idempotent re-apply) did not duplicate versions:
    // the iterator sees exactly four.
    let offset = leader
        .append_entry(Bytes::from("test_pk"), Bytes::from("value5"), Timestamp::new(9523))
        .expect("append after recovery");
    assert_eq!(offset, LogOffset::new(4));

    leader.stop().expect("stop");
}

#[test]
fn stop_is_idempotent_and_final() {
    let dir = TempDir::new().expect("tempdir");
    let leader = leader_on(&dir, Arc::new(MemTable::new("test")));

    leader.stop().expect("stop");
    leader.stop().expect("second stop");

    assert!(matches!(
        leader.append_entry(Bytes::from("k"), Bytes::from("v"), Timestamp::new(1)),
        Err(ReplicationError::Stopped)
    ));
}

// ============================================================================
// Over real TCP
// ============================================================================

#[test]
fn leader_and_follower_over_tcp() {
    let leader_dir = TempDir::new().expect("tempdir");
    let follower_dir = TempDir::new().expect("tempdir");

    let follower_table = Arc::new(MemTable::new("test"));
    let follower = follower_on(&follower_dir, Arc::clone(&follower_table));

    let mut server = ReplicaServer::bind(
        "127.0.0.1:0".parse().expect("addr"),
        Arc::clone(&follower) as _,
    )
    .expect("bind");
    let endpoint = server.local_addr().to_string();

    let leader = leader_on(&leader_dir, Arc::new(MemTable::new("test")));
    let last = append_four(&leader);
    leader.notify();

    leader.add_replicate_node(endpoint).expect("add replica");

    assert!(leader.wait_replicated(last, SYNC_WAIT).expect("wait"));
    assert_four_values(&follower_table);
    assert_eq!(follower.next_offset(), LogOffset::new(4));

    leader.stop().expect("stop");
    server.shutdown();
    follower.stop().expect("stop");
}
