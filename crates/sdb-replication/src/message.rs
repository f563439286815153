//! Replication protocol messages.
//!
//! The log-shipping protocol has one exchange: the leader ships a batch of
//! contiguous entries ([`AppendEntriesRequest`]) and the follower answers
//! with an acknowledgment or a rejection ([`AppendEntriesResponse`]).
//! Both directions travel inside the [`WireMessage`] envelope so a framed
//! connection can carry either.

use serde::{Deserialize, Serialize};

use sdb_types::{LogOffset, Term};
use sdb_wal::LogEntry;

// ============================================================================
// AppendEntries
// ============================================================================

/// Leader → Follower: append this batch of contiguous entries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppendEntriesRequest {
    /// Identity of the sending leader (its endpoint).
    pub leader: String,

    /// The leader's current term. A follower that has accepted a higher
    /// term rejects the request as stale.
    pub term: Term,

    /// Offset of the first entry in the batch. Must equal the follower's
    /// log tail, or the follower rejects with the offset it needs.
    pub starting_offset: LogOffset,

    /// The entries, in strictly increasing, gap-free offset order.
    pub entries: Vec<LogEntry>,
}

impl AppendEntriesRequest {
    /// Creates a new request.
    ///
    /// Debug builds assert that the batch really is contiguous and starts
    /// at `starting_offset`; shipping out-of-order batches is a leader bug,
    /// not a protocol state.
    pub fn new(
        leader: impl Into<String>,
        term: Term,
        starting_offset: LogOffset,
        entries: Vec<LogEntry>,
    ) -> Self {
        debug_assert!(
            entries
                .iter()
                .enumerate()
                .all(|(i, e)| e.offset() == starting_offset + i as u64),
            "batch must be contiguous from starting_offset"
        );
        Self {
            leader: leader.into(),
            term,
            starting_offset,
            entries,
        }
    }
}

/// Why a follower answered the way it did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResponseCode {
    /// Batch stored and applied.
    Ok,
    /// The batch does not start at the follower's tail; resend from
    /// `next_offset`.
    OffsetGap,
    /// The request's term is older than one the follower has accepted.
    StaleLeader,
    /// The follower failed to durably store the batch.
    Storage,
    /// The receiver is not a follower.
    NotFollower,
}

/// Follower → Leader: acknowledgment or rejection of a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppendEntriesResponse {
    /// True if the batch was durably stored and applied.
    pub accepted: bool,

    /// Detail for rejections; [`ResponseCode::Ok`] when accepted.
    pub code: ResponseCode,

    /// The offset the follower needs next. This is the acknowledgment
    /// watermark: everything below it is durably stored and applied.
    /// On rejection it tells the leader where to resync from.
    pub next_offset: LogOffset,
}

impl AppendEntriesResponse {
    /// An accepting response with the follower's new watermark.
    pub fn accepted(next_offset: LogOffset) -> Self {
        Self {
            accepted: true,
            code: ResponseCode::Ok,
            next_offset,
        }
    }

    /// A rejecting response carrying the offset the follower needs.
    pub fn rejected(code: ResponseCode, next_offset: LogOffset) -> Self {
        debug_assert!(code != ResponseCode::Ok, "rejection needs a reason");
        Self {
            accepted: false,
            code,
            next_offset,
        }
    }
}

// ============================================================================
// Wire envelope
// ============================================================================

/// Everything that can travel over a framed replication connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum WireMessage {
    AppendEntriesRequest(AppendEntriesRequest),
    AppendEntriesResponse(AppendEntriesResponse),
}

impl WireMessage {
    /// Returns a human-readable name for the message type.
    pub fn name(&self) -> &'static str {
        match self {
            WireMessage::AppendEntriesRequest(_) => "AppendEntriesRequest",
            WireMessage::AppendEntriesResponse(_) => "AppendEntriesResponse",
        }
    }
}
