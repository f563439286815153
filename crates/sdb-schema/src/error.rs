//! Error types for schema operations.

/// Errors that can occur while building or mutating table schema metadata.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum SchemaError {
    /// The table already carries the maximum number of indexes.
    #[error("index capacity reached: table already has {max} indexes")]
    IndexCapacity { max: usize },

    /// A query that requires a primary-key index ran before one was added.
    #[error("no primary-key index defined")]
    NoPrimaryKey,

    /// A column with this name is already registered.
    #[error("duplicate column name: {name}")]
    DuplicateColumn { name: String },
}
