//! Error types for log operations.

use std::io;

use sdb_types::LogOffset;

/// Errors that can occur during log operations.
#[derive(thiserror::Error, Debug)]
pub enum WalError {
    /// Filesystem I/O error.
    #[error("filesystem error: {0}")]
    Io(#[from] io::Error),

    /// The data was truncated (not enough bytes for a record).
    #[error("unexpected end of file")]
    UnexpectedEof,

    /// CRC mismatch - the record data is corrupted.
    #[error("corrupted record at offset {offset}: CRC mismatch")]
    CorruptedRecord { offset: LogOffset },

    /// A segment contains an entry whose offset breaks the sequence.
    ///
    /// On the append path this is the follower-side gap rejection; during
    /// recovery it means the log is damaged beyond a torn tail.
    #[error("offset gap: expected {expected}, got {got}")]
    OffsetGap { expected: LogOffset, got: LogOffset },

    /// A non-final segment ends mid-record; truncation only repairs the tail.
    #[error("segment {segment} is corrupt: {detail}")]
    CorruptSegment { segment: String, detail: String },

    /// The log store has been stopped; no further appends are accepted.
    #[error("log store is closed")]
    Closed,

    /// Index file has invalid magic bytes.
    #[error("invalid index magic bytes")]
    InvalidIndexMagic,

    /// Index file has unsupported version.
    #[error("unsupported index version: {0}")]
    UnsupportedIndexVersion(u8),

    /// Index file checksum mismatch.
    #[error("index checksum mismatch: expected {expected:#010x}, got {actual:#010x}")]
    IndexChecksumMismatch { expected: u32, actual: u32 },

    /// Index file is truncated.
    #[error("truncated index file: expected {expected} bytes, got {actual}")]
    IndexTruncated { expected: usize, actual: usize },
}
