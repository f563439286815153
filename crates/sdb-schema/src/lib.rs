//! # sdb-schema: Table schema and index metadata for `StrataDB`
//!
//! This crate models a table's column and index metadata:
//!
//! - [`ColumnDef`] / [`TableColumn`]: the immutable-after-build column
//!   registry (built once at table creation, then read concurrently)
//! - [`IndexDef`] / [`TableIndex`]: the live index set, mutated at runtime
//!   while readers concurrently scan
//!
//! # Concurrency
//!
//! `TableIndex` readers never block and never see a torn update. All four
//! internal views (index list, primary-key designation, combine-name map,
//! flat column-name list) live in one immutable snapshot behind an atomic
//! pointer. Writers build a new snapshot and swap it in; a reader that
//! loaded the old snapshot finishes its operation against a fully
//! consistent old view.

mod column;
mod error;
mod index;

#[cfg(test)]
mod tests;

pub use column::{ColumnDef, DataType, TableColumn};
pub use error::SchemaError;
pub use index::{IndexDef, IndexStatus, IndexType, TableIndex, MAX_INDEX_NUM};

/// Result type for schema operations.
pub type SchemaResult<T> = Result<T, SchemaError>;
