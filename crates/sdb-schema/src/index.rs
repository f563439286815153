//! Index definitions and the live per-table index set.
//!
//! [`TableIndex`] is the read-mostly structure the query path consults on
//! every lookup, while index creation mutates it at runtime. Readers must
//! never block and never observe a half-applied update, so every mutation
//! builds a fresh [`IndexSnapshot`] and publishes it with one atomic pointer
//! swap. Writers are serialized by a mutex; readers are wait-free.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::{ColumnDef, SchemaError};

/// Maximum number of indexes a single table may carry.
pub const MAX_INDEX_NUM: usize = 16;

// ============================================================================
// Index Status / Type - Copy (small enums)
// ============================================================================

/// Lifecycle status of an index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum IndexStatus {
    /// Fully built and queryable.
    #[default]
    Ready,
    /// Being backfilled; not yet queryable.
    Waiting,
    /// Being dropped.
    Deleting,
}

/// Kind of an index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum IndexType {
    /// The distinguished index that uniquely identifies a row.
    PrimaryKey,
    /// Like `PrimaryKey`, but the engine generates the key value.
    AutoGen,
    /// An ordinary secondary index.
    #[default]
    Normal,
}

// ============================================================================
// Index Definition - immutable once constructed
// ============================================================================

/// Describes one index: its identity, kind, and composite column list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexDef {
    name: String,
    id: u32,
    status: IndexStatus,
    index_type: IndexType,
    columns: Vec<ColumnDef>,
}

impl IndexDef {
    /// Creates a new index definition with status [`IndexStatus::Ready`].
    pub fn new(
        name: impl Into<String>,
        id: u32,
        index_type: IndexType,
        columns: Vec<ColumnDef>,
    ) -> Self {
        Self {
            name: name.into(),
            id,
            status: IndexStatus::Ready,
            index_type,
            columns,
        }
    }

    /// Sets the lifecycle status (builder style).
    pub fn with_status(mut self, status: IndexStatus) -> Self {
        self.status = status;
        self
    }

    /// Returns the index name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the index id.
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Returns the lifecycle status.
    pub fn status(&self) -> IndexStatus {
        self.status
    }

    /// Returns the index kind.
    pub fn index_type(&self) -> IndexType {
        self.index_type
    }

    /// Returns the constituent columns in definition order.
    pub fn columns(&self) -> &[ColumnDef] {
        &self.columns
    }

    /// Returns true if this index designates the primary key.
    pub fn is_primary(&self) -> bool {
        matches!(self.index_type, IndexType::PrimaryKey | IndexType::AutoGen)
    }

    /// Returns the combine name: constituent column names joined by `_`,
    /// in definition order.
    pub fn combine_name(&self) -> String {
        let mut combine = String::new();
        for (i, col) in self.columns.iter().enumerate() {
            if i > 0 {
                combine.push('_');
            }
            combine.push_str(col.name());
        }
        combine
    }
}

// ============================================================================
// Index Snapshot - one immutable version of the whole index set
// ============================================================================

/// One consistent version of the four index views.
///
/// Snapshots are immutable; [`TableIndex`] replaces the whole snapshot on
/// every mutation so the views can never disagree with each other.
#[derive(Debug, Default)]
struct IndexSnapshot {
    /// All indexes in creation order.
    indexes: Vec<Arc<IndexDef>>,
    /// The PrimaryKey/AutoGen index, if one has been added (last one wins).
    pk_index: Option<Arc<IndexDef>>,
    /// Combine name -> index.
    combine_names: HashMap<String, Arc<IndexDef>>,
    /// Flat list of every column name across all indexes (duplicates kept).
    col_names: Vec<String>,
}

// ============================================================================
// Table Index
// ============================================================================

/// The full index set of a table.
///
/// # Concurrency
///
/// Readers load the current snapshot once per operation and run against it
/// without locking - they are wait-free and never observe a torn update.
/// Writers take the mutation mutex, copy the current snapshot, apply their
/// change, and publish the result with a single atomic swap.
#[derive(Debug, Default)]
pub struct TableIndex {
    snapshot: ArcSwap<IndexSnapshot>,
    write_lock: Mutex<()>,
}

impl TableIndex {
    /// Creates an empty index set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an index, publishing all four views in one atomic step.
    ///
    /// If the new index is typed PrimaryKey or AutoGen it becomes the
    /// designated primary-key index, replacing any previous designation.
    ///
    /// # Errors
    ///
    /// [`SchemaError::IndexCapacity`] when the table already carries
    /// [`MAX_INDEX_NUM`] indexes; nothing is mutated.
    pub fn add_index(&self, index_def: IndexDef) -> Result<(), SchemaError> {
        let _guard = self.write_lock.lock().expect("index write lock poisoned");

        let old = self.snapshot.load();
        if old.indexes.len() >= MAX_INDEX_NUM {
            return Err(SchemaError::IndexCapacity { max: MAX_INDEX_NUM });
        }

        let index_def = Arc::new(index_def);

        let mut indexes = old.indexes.clone();
        indexes.push(Arc::clone(&index_def));

        let pk_index = if index_def.is_primary() {
            if let Some(prev) = &old.pk_index {
                warn!(
                    previous = prev.name(),
                    new = index_def.name(),
                    "primary-key designation replaced"
                );
            }
            Some(Arc::clone(&index_def))
        } else {
            old.pk_index.clone()
        };

        let mut combine_names = old.combine_names.clone();
        combine_names.insert(index_def.combine_name(), Arc::clone(&index_def));

        let mut col_names = old.col_names.clone();
        for col in index_def.columns() {
            col_names.push(col.name().to_string());
        }

        self.snapshot.store(Arc::new(IndexSnapshot {
            indexes,
            pk_index,
            combine_names,
            col_names,
        }));
        Ok(())
    }

    /// Returns the index at creation position `idx`.
    pub fn get_index(&self, idx: usize) -> Option<Arc<IndexDef>> {
        self.snapshot.load().indexes.get(idx).cloned()
    }

    /// Returns the index with the given name.
    pub fn get_index_by_name(&self, name: &str) -> Option<Arc<IndexDef>> {
        self.snapshot
            .load()
            .indexes
            .iter()
            .find(|index| index.name() == name)
            .cloned()
    }

    /// Returns all indexes in creation order.
    pub fn get_all_index(&self) -> Vec<Arc<IndexDef>> {
        self.snapshot.load().indexes.clone()
    }

    /// Returns the index whose combine name equals `combine_name`.
    ///
    /// The combine name is the index's column names joined by `_` in
    /// definition order; see [`IndexDef::combine_name`].
    pub fn get_index_by_combine_name(&self, combine_name: &str) -> Option<Arc<IndexDef>> {
        self.snapshot.load().combine_names.get(combine_name).cloned()
    }

    /// Returns true if any index contains a column with this name.
    pub fn find_col_name(&self, name: &str) -> bool {
        self.snapshot.load().col_names.iter().any(|n| n == name)
    }

    /// Returns the designated primary-key index, if any.
    pub fn get_pk_index(&self) -> Option<Arc<IndexDef>> {
        self.snapshot.load().pk_index.clone()
    }

    /// Returns true if the primary-key index is engine-generated.
    ///
    /// # Errors
    ///
    /// [`SchemaError::NoPrimaryKey`] when no PrimaryKey/AutoGen index has
    /// been added yet. Callers must establish a primary key before asking.
    pub fn has_auto_gen(&self) -> Result<bool, SchemaError> {
        match self.snapshot.load().pk_index.as_ref() {
            Some(pk) => Ok(pk.index_type() == IndexType::AutoGen),
            None => Err(SchemaError::NoPrimaryKey),
        }
    }

    /// Discards all index metadata, atomically replacing every view with an
    /// empty one. Used before reloading schema from its persisted form.
    pub fn reset(&self) {
        let _guard = self.write_lock.lock().expect("index write lock poisoned");
        self.snapshot.store(Arc::new(IndexSnapshot::default()));
    }

    /// Returns the number of indexes.
    pub fn len(&self) -> usize {
        self.snapshot.load().indexes.len()
    }

    /// Returns true if no indexes are defined.
    pub fn is_empty(&self) -> bool {
        self.snapshot.load().indexes.is_empty()
    }
}
