//! # sdb-types: Core types for `StrataDB`
//!
//! This crate contains the shared identifier types used across the
//! `StrataDB` system:
//! - [`LogOffset`] - Position of an entry in the replicated log
//! - [`Term`] - Leader epoch tag carried by every log entry
//! - [`Timestamp`] - Application-supplied event time of a write

use std::fmt::Display;
use std::ops::{Add, AddAssign};

use serde::{Deserialize, Serialize};

// ============================================================================
// Log Offset - Copy (8-byte value)
// ============================================================================

/// Position of an entry in the replicated log.
///
/// Offsets are zero-indexed, assigned sequentially by the leader, and are
/// gap-free within a replicator instance: the entry after offset `n` always
/// has offset `n + 1`.
///
/// # Invariants
///
/// - Offsets only increase; an offset is never reassigned
/// - A follower acknowledges offset `n` only after durably storing and
///   applying every entry with offset `<= n`
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct LogOffset(u64);

impl LogOffset {
    /// The first offset in any log.
    pub const ZERO: LogOffset = LogOffset(0);

    /// Creates a new log offset.
    pub fn new(offset: u64) -> Self {
        Self(offset)
    }

    /// Returns the offset as a `u64`.
    pub fn as_u64(&self) -> u64 {
        self.0
    }

    /// Returns the offset as a `usize` for indexing.
    pub fn as_usize(&self) -> usize {
        self.0 as usize
    }

    /// Returns the next offset (incremented by 1).
    pub fn next(&self) -> Self {
        LogOffset(self.0.saturating_add(1))
    }

    /// Returns the number of entries between `self` and `other`.
    ///
    /// Returns 0 if `other <= self`. Used for replication lag reporting.
    pub fn distance_to(&self, other: LogOffset) -> u64 {
        other.0.saturating_sub(self.0)
    }
}

impl Display for LogOffset {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Add<u64> for LogOffset {
    type Output = LogOffset;

    fn add(self, rhs: u64) -> Self::Output {
        LogOffset(self.0.saturating_add(rhs))
    }
}

impl AddAssign<u64> for LogOffset {
    fn add_assign(&mut self, rhs: u64) {
        self.0 = self.0.saturating_add(rhs);
    }
}

impl From<u64> for LogOffset {
    fn from(offset: u64) -> Self {
        Self(offset)
    }
}

impl From<LogOffset> for u64 {
    fn from(offset: LogOffset) -> Self {
        offset.0
    }
}

// ============================================================================
// Term - Copy (8-byte value)
// ============================================================================

/// Leader epoch tag.
///
/// Every log entry carries the term of the leader that appended it. The
/// protocol here is single-leader log shipping - there is no election - so
/// the term's job is to let a follower detect and reject a stale leader:
/// a request carrying a term lower than the highest term the follower has
/// already accepted is refused.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct Term(u64);

impl Term {
    /// The initial term.
    pub const ZERO: Term = Term(0);

    /// Creates a new term.
    pub fn new(term: u64) -> Self {
        Self(term)
    }

    /// Returns the term as a `u64`.
    pub fn as_u64(&self) -> u64 {
        self.0
    }

    /// Returns the next term (incremented by 1).
    pub fn next(&self) -> Self {
        Term(self.0.saturating_add(1))
    }
}

impl Display for Term {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "t{}", self.0)
    }
}

impl From<u64> for Term {
    fn from(term: u64) -> Self {
        Self(term)
    }
}

impl From<Term> for u64 {
    fn from(term: Term) -> Self {
        term.0
    }
}

// ============================================================================
// Timestamp - Copy (8-byte value)
// ============================================================================

/// Application-supplied event time of a write.
///
/// The table orders the versions of a key by timestamp, newest first.
/// Timestamps are opaque to the replication core: they are carried through
/// the log and handed to the table, never compared against wall clocks.
///
/// Uses `i64` internally (signed 64-bit for compatibility with various
/// upstream systems).
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct Timestamp(i64);

impl Timestamp {
    /// Creates a new timestamp.
    pub fn new(ts: i64) -> Self {
        Self(ts)
    }

    /// Returns the timestamp as an `i64`.
    pub fn as_i64(&self) -> i64 {
        self.0
    }
}

impl Display for Timestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for Timestamp {
    fn from(ts: i64) -> Self {
        Self(ts)
    }
}

impl From<Timestamp> for i64 {
    fn from(ts: Timestamp) -> Self {
        ts.0
    }
}

#[cfg(test)]
mod tests;
