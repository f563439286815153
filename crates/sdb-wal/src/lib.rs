//! # sdb-wal: Append-only segment log for `StrataDB`
//!
//! This crate implements the durable write-ahead log the replicator ships
//! from. Entries are stored in segment files with a simple binary format
//! that includes checksums for integrity verification.
//!
//! # Record Format
//!
//! Each entry is stored as:
//! ```text
//! [offset:u64][term:u64][ts:i64][key_len:u32][key][value_len:u32][value][crc32:u32]
//!     8B          8B       8B        4B       var       4B         var      4B
//! ```
//!
//! - **offset**: The logical position of this entry in the log
//! - **term**: The epoch of the leader that appended it
//! - **ts**: Application-supplied event time
//! - **crc32**: Checksum of everything before it, for corruption detection
//!
//! All integers are little-endian.
//!
//! # File Layout
//!
//! ```text
//! {dir}/
//!   segment_00000000000000000000.log      <- base offset 0
//!   segment_00000000000000000000.log.idx  <- byte-position index
//!   segment_00000000000000004096.log      <- next segment
//!   ...
//! ```
//!
//! A segment's filename carries the offset of its first entry. Segments are
//! rotated when they reach the configured size threshold; recovery scans
//! them in filename order, verifies every checksum, and truncates a torn
//! trailing write.
//!
//! # Example
//!
//! ```ignore
//! use sdb_wal::{LogStore, WalConfig};
//! use sdb_types::{Term, Timestamp};
//! use bytes::Bytes;
//!
//! let log = LogStore::open("/data/stratadb/wal", WalConfig::default())?;
//! let entry = log.append(
//!     Term::ZERO,
//!     Bytes::from("user#42"),
//!     Bytes::from("payload"),
//!     Timestamp::new(9527),
//! )?;
//! assert_eq!(entry.offset().as_u64(), 0);
//! ```

mod entry;
mod error;
mod index;
mod log;


pub use entry::LogEntry;
pub use error::WalError;
pub use index::SegmentIndex;
pub use log::{LogIter, LogStore, WalConfig};

/// Result type for log operations.
pub type WalResult<T> = Result<T, WalError>;
