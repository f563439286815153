//! # sdb-table: In-memory table for `StrataDB`
//!
//! The [`MemTable`] is the collaborator the replicator applies decoded log
//! entries to. It keeps, per key, the versions of that key ordered by
//! timestamp, and exposes a newest-first iterator for point and range
//! reads.
//!
//! The replication core depends only on two things here:
//!
//! - [`MemTable::apply`] tolerates idempotent re-application (recovery
//!   replays the log through the same path)
//! - [`TableIter`] honors the seek/valid/next contract
//!
//! The production storage engine's segment/skip-list layout is out of scope;
//! this table is the reference implementation of the contract.

use std::collections::BTreeMap;
use std::sync::RwLock;

use bytes::Bytes;
use tracing::trace;

use sdb_schema::{TableColumn, TableIndex};
use sdb_types::Timestamp;

/// An in-memory, multi-version table keyed by (key, timestamp).
///
/// # Concurrency
///
/// The version map sits behind an `RwLock`; iterators copy the requested
/// key's version list out under the read lock, so a reader never holds the
/// lock while scanning and writers are never blocked by a slow scan.
#[derive(Debug)]
pub struct MemTable {
    name: String,
    columns: TableColumn,
    index: TableIndex,
    /// key -> (ts -> value), versions ascending by ts internally.
    data: RwLock<BTreeMap<Bytes, BTreeMap<i64, Bytes>>>,
}

impl MemTable {
    /// Creates an empty table with no schema attached.
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_columns(name, TableColumn::new())
    }

    /// Creates an empty table with the given column registry.
    pub fn with_columns(name: impl Into<String>, columns: TableColumn) -> Self {
        Self {
            name: name.into(),
            columns,
            index: TableIndex::new(),
            data: RwLock::new(BTreeMap::new()),
        }
    }

    /// Returns the table name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the column registry.
    pub fn columns(&self) -> &TableColumn {
        &self.columns
    }

    /// Returns the live index set.
    pub fn index(&self) -> &TableIndex {
        &self.index
    }

    /// Applies one write to the table.
    ///
    /// Returns `true` if the table changed, `false` for an idempotent
    /// re-application (same key, timestamp and value) - recovery replays
    /// the log through this path and must be a no-op for entries already
    /// present.
    pub fn apply(&self, key: &Bytes, value: &Bytes, ts: Timestamp) -> bool {
        let mut data = self.data.write().expect("table lock poisoned");
        let versions = data.entry(key.clone()).or_default();
        let unchanged = versions.get(&ts.as_i64()).is_some_and(|v| v == value);
        if unchanged {
            trace!(table = %self.name, ts = %ts, "idempotent re-apply ignored");
            return false;
        }
        versions.insert(ts.as_i64(), value.clone());
        true
    }

    /// Returns the value of `key` at exactly timestamp `ts`.
    pub fn get(&self, key: &Bytes, ts: Timestamp) -> Option<Bytes> {
        let data = self.data.read().expect("table lock poisoned");
        data.get(key).and_then(|v| v.get(&ts.as_i64()).cloned())
    }

    /// Returns a newest-first iterator over the versions of `key`.
    ///
    /// The iterator operates on a snapshot of the key's versions taken at
    /// creation time.
    pub fn iter(&self, key: &Bytes) -> TableIter {
        let data = self.data.read().expect("table lock poisoned");
        let versions = data
            .get(key)
            .map(|versions| {
                versions
                    .iter()
                    .rev()
                    .map(|(&ts, value)| (Timestamp::new(ts), value.clone()))
                    .collect()
            })
            .unwrap_or_default();
        TableIter { versions, pos: 0 }
    }

    /// Returns the number of distinct keys.
    pub fn key_count(&self) -> usize {
        self.data.read().expect("table lock poisoned").len()
    }

    /// Returns true if the table holds no data.
    pub fn is_empty(&self) -> bool {
        self.data.read().expect("table lock poisoned").is_empty()
    }
}

// ============================================================================
// Iterator
// ============================================================================

/// Newest-first iterator over one key's versions.
///
/// Freshly created iterators are positioned at the newest version. `seek`
/// repositions to the newest version at or before a timestamp.
#[derive(Debug)]
pub struct TableIter {
    /// Versions in descending timestamp order.
    versions: Vec<(Timestamp, Bytes)>,
    pos: usize,
}

impl TableIter {
    /// Positions the iterator at the newest version with `ts' <= ts`.
    pub fn seek(&mut self, ts: Timestamp) {
        self.pos = self.versions.partition_point(|(t, _)| *t > ts);
    }

    /// Returns true if the iterator points at a version.
    pub fn valid(&self) -> bool {
        self.pos < self.versions.len()
    }

    /// Advances to the next-older version.
    pub fn next(&mut self) {
        if self.valid() {
            self.pos += 1;
        }
    }

    /// Returns the timestamp of the current version.
    ///
    /// # Panics
    ///
    /// Panics if the iterator is not [`valid`](Self::valid).
    pub fn ts(&self) -> Timestamp {
        self.versions[self.pos].0
    }

    /// Returns the value of the current version.
    ///
    /// # Panics
    ///
    /// Panics if the iterator is not [`valid`](Self::valid).
    pub fn value(&self) -> &Bytes {
        &self.versions[self.pos].1
    }
}
