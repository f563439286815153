//! Column definitions and the per-table column registry.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::SchemaError;

// ============================================================================
// Data Type - Copy (small enum)
// ============================================================================

/// Type of a data column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DataType {
    Bool,
    SmallInt,
    Int,
    BigInt,
    Float,
    Double,
    Varchar,
    String,
    Date,
    Timestamp,
    /// Large-object type; blob columns are tracked separately by the
    /// registry so the storage layer can route them to out-of-line storage.
    Blob,
}

// ============================================================================
// Column Definition - immutable after construction
// ============================================================================

/// Immutable description of one data column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnDef {
    name: String,
    id: u32,
    data_type: DataType,
}

impl ColumnDef {
    /// Creates a new column definition.
    pub fn new(name: impl Into<String>, id: u32, data_type: DataType) -> Self {
        Self {
            name: name.into(),
            id,
            data_type,
        }
    }

    /// Returns the column name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the column id.
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Returns the column's data type.
    pub fn data_type(&self) -> DataType {
        self.data_type
    }

    /// Returns true if this is a large-object column.
    pub fn is_blob(&self) -> bool {
        self.data_type == DataType::Blob
    }
}

// ============================================================================
// Table Column Registry
// ============================================================================

/// Ordered collection of a table's columns with name lookup.
///
/// Insertion order is schema order. The registry is built once, before the
/// first concurrent read, and not mutated afterwards - unlike
/// [`TableIndex`](crate::TableIndex), which is mutated live.
///
/// # Invariants
///
/// - Every column in the ordered sequence appears exactly once in the name
///   map under its name
/// - `blob_idxs` holds the ids of exactly the columns whose type is
///   [`DataType::Blob`], in schema order
#[derive(Debug, Clone, Default)]
pub struct TableColumn {
    columns: Vec<Arc<ColumnDef>>,
    column_map: HashMap<String, Arc<ColumnDef>>,
    blob_idxs: Vec<u32>,
}

impl TableColumn {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a column at the end of the schema order.
    ///
    /// # Errors
    ///
    /// [`SchemaError::DuplicateColumn`] if a column with this name already
    /// exists; the registry is left unchanged.
    pub fn add_column(&mut self, column_def: ColumnDef) -> Result<(), SchemaError> {
        if self.column_map.contains_key(column_def.name()) {
            return Err(SchemaError::DuplicateColumn {
                name: column_def.name().to_string(),
            });
        }
        let column_def = Arc::new(column_def);
        if column_def.is_blob() {
            self.blob_idxs.push(column_def.id());
        }
        self.column_map
            .insert(column_def.name().to_string(), Arc::clone(&column_def));
        self.columns.push(column_def);
        Ok(())
    }

    /// Returns the column at schema position `idx`.
    pub fn get_column(&self, idx: usize) -> Option<Arc<ColumnDef>> {
        self.columns.get(idx).cloned()
    }

    /// Returns the column with the given name.
    pub fn get_column_by_name(&self, name: &str) -> Option<Arc<ColumnDef>> {
        self.column_map.get(name).cloned()
    }

    /// Returns all columns in schema order.
    pub fn get_all_column(&self) -> &[Arc<ColumnDef>] {
        &self.columns
    }

    /// Returns the ids of all blob-typed columns.
    pub fn blob_idxs(&self) -> &[u32] {
        &self.blob_idxs
    }

    /// Returns the number of registered columns.
    pub fn len(&self) -> usize {
        self.columns.len()
    }

    /// Returns true if no columns are registered.
    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }
}
