//! Byte-position index for O(1) seeks within a segment.
//!
//! The [`SegmentIndex`] maps an entry's position *relative to its segment's
//! base offset* to the byte position where its record starts, so an iterator
//! can seek without scanning the segment from the top.
//!
//! # File Format
//!
//! The index is persisted alongside the segment file:
//! ```text
//! segment_00000000000000000000.log      <- append-only entries
//! segment_00000000000000000000.log.idx  <- this index
//! ```
//!
//! Binary format:
//! ```text
//! ┌─────────────────────────────────────────────────┐
//! │  Offset  │  Size  │  Description                │
//! ├─────────────────────────────────────────────────┤
//! │  0       │  4     │  Magic bytes: "SWIX"        │
//! │  4       │  1     │  Version: 0x01              │
//! │  5       │  3     │  Reserved (zero padding)    │
//! │  8       │  8     │  Entry count (u64 LE)       │
//! │  16      │  8*N   │  Positions array [u64; N]   │
//! │  16+8*N  │  4     │  CRC32 of bytes 0..(16+8*N) │
//! └─────────────────────────────────────────────────┘
//! ```
//!
//! If the index file is missing or corrupted it is rebuilt by scanning the
//! segment; a bad index is never an unrecoverable condition.

use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::Path;

use crate::WalError;

/// Magic bytes identifying a valid segment index file.
const MAGIC: &[u8; 4] = b"SWIX";

/// Current index file format version.
const VERSION: u8 = 0x01;

/// Reserved bytes for future use.
const RESERVED: [u8; 3] = [0u8; 3];

const COUNT_SIZE: usize = 8;
const POSITION_SIZE: usize = 8;
const CRC_SIZE: usize = 4;

/// Header size: magic(4) + version(1) + reserved(3) + count(8) = 16 bytes.
const HEADER_SIZE: usize = 4 + 1 + 3 + COUNT_SIZE;

/// Maps relative entry position → physical byte position within a segment.
///
/// # Invariants
///
/// - `positions.len()` equals the number of records in the segment
/// - `positions[i]` is the byte position where record `i` starts
/// - Positions are strictly increasing (append-only segment)
#[derive(Default, Debug, Clone, PartialEq, Eq)]
pub struct SegmentIndex {
    positions: Vec<u64>,
}

impl SegmentIndex {
    /// Creates an empty index.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an index from existing positions (load or rebuild path).
    pub fn from_positions(positions: Vec<u64>) -> Self {
        debug_assert!(
            positions.windows(2).all(|w| w[0] < w[1]),
            "positions must be strictly increasing"
        );
        Self { positions }
    }

    /// Records the byte position of a newly appended record.
    pub fn append(&mut self, byte_position: u64) {
        debug_assert!(
            self.positions.last().is_none_or(|&last| byte_position > last),
            "byte_position {byte_position} must be greater than last position {:?}",
            self.positions.last()
        );
        self.positions.push(byte_position);
    }

    /// Looks up the byte position of the record at relative position `rel`.
    ///
    /// Returns `None` if `rel` is beyond the indexed records.
    #[must_use]
    pub fn lookup(&self, rel: u64) -> Option<u64> {
        self.positions.get(rel as usize).copied()
    }

    /// Returns the number of indexed records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.positions.len()
    }

    /// Returns `true` if the index contains no records.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }

    /// Persists the index to disk with a trailing CRC32.
    pub fn save(&self, path: &Path) -> Result<(), WalError> {
        let total_size = HEADER_SIZE + self.positions.len() * POSITION_SIZE + CRC_SIZE;
        let mut buf: Vec<u8> = Vec::with_capacity(total_size);

        buf.extend_from_slice(MAGIC);
        buf.extend_from_slice(&[VERSION]);
        buf.extend_from_slice(&RESERVED);
        buf.extend_from_slice(&(self.positions.len() as u64).to_le_bytes());

        for pos in &self.positions {
            buf.extend_from_slice(&pos.to_le_bytes());
        }

        let checksum = crc32fast::hash(&buf);
        buf.extend_from_slice(&checksum.to_le_bytes());

        debug_assert_eq!(buf.len(), total_size, "buffer size mismatch");

        let file = File::create(path)?;
        let mut writer = BufWriter::new(file);
        writer.write_all(&buf)?;
        writer.flush()?;

        Ok(())
    }

    /// Loads an index from disk, validating magic, version and checksum.
    ///
    /// # Errors
    ///
    /// Any validation failure is an error; callers treat it as a signal to
    /// rebuild from the segment, not as a fatal condition.
    pub fn load(path: &Path) -> Result<Self, WalError> {
        let data = fs::read(path)?;

        if data.len() < HEADER_SIZE + CRC_SIZE {
            return Err(WalError::IndexTruncated {
                expected: HEADER_SIZE + CRC_SIZE,
                actual: data.len(),
            });
        }

        let magic: [u8; 4] = data[0..4]
            .try_into()
            .expect("slice length equals magic size after bounds check");
        if &magic != MAGIC {
            return Err(WalError::InvalidIndexMagic);
        }

        let version = data[4];
        if version != VERSION {
            return Err(WalError::UnsupportedIndexVersion(version));
        }

        let count_bytes: [u8; COUNT_SIZE] = data[8..8 + COUNT_SIZE]
            .try_into()
            .expect("slice length equals count size after bounds check");
        let count = u64::from_le_bytes(count_bytes) as usize;

        let expected_size = HEADER_SIZE + count * POSITION_SIZE + CRC_SIZE;
        if data.len() < expected_size {
            return Err(WalError::IndexTruncated {
                expected: expected_size,
                actual: data.len(),
            });
        }

        let crc_start = HEADER_SIZE + count * POSITION_SIZE;
        let stored_crc_bytes: [u8; CRC_SIZE] = data[crc_start..crc_start + CRC_SIZE]
            .try_into()
            .expect("slice length equals CRC size after bounds check");
        let stored_crc = u32::from_le_bytes(stored_crc_bytes);
        let computed_crc = crc32fast::hash(&data[0..crc_start]);

        if stored_crc != computed_crc {
            return Err(WalError::IndexChecksumMismatch {
                expected: stored_crc,
                actual: computed_crc,
            });
        }

        let mut positions = Vec::with_capacity(count);
        for i in 0..count {
            let start = HEADER_SIZE + i * POSITION_SIZE;
            let pos_bytes: [u8; POSITION_SIZE] = data[start..start + POSITION_SIZE]
                .try_into()
                .expect("slice length equals position size after bounds check");
            positions.push(u64::from_le_bytes(pos_bytes));
        }

        Ok(Self { positions })
    }
}
