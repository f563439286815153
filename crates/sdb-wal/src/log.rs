//! Append-only log store over rotated segment files.
//!
//! The [`LogStore`] owns a directory of segment files and guarantees:
//!
//! - offsets are assigned and appended under a single critical section, so
//!   append order equals offset order
//! - an entry is never mutated after append
//! - recovery replays exactly what was durably written, truncating at most
//!   a torn trailing record
//!
//! Readers never take the writer lock for longer than a snapshot of the
//! segment list; segment files only grow, so reading them concurrently with
//! the writer is safe.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use sdb_types::{LogOffset, Term, Timestamp};

use crate::{LogEntry, SegmentIndex, WalError, WalResult};

const SEGMENT_PREFIX: &str = "segment_";
const SEGMENT_SUFFIX: &str = ".log";

// ============================================================================
// Configuration
// ============================================================================

/// Configuration for the log store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WalConfig {
    /// Size threshold at which the active segment is sealed and a new one
    /// started.
    pub max_segment_bytes: u64,

    /// Whether to fsync after every append call.
    ///
    /// Durability of acknowledged entries requires this; tests that only
    /// exercise ordering can turn it off.
    pub sync_on_append: bool,
}

impl Default for WalConfig {
    fn default() -> Self {
        Self {
            max_segment_bytes: 64 * 1024 * 1024,
            sync_on_append: true,
        }
    }
}

impl WalConfig {
    /// Configuration for production use.
    pub fn production() -> Self {
        Self {
            max_segment_bytes: 128 * 1024 * 1024,
            sync_on_append: true,
        }
    }

    /// Configuration for development/testing: small segments (to exercise
    /// rotation) and no per-append fsync.
    pub fn development() -> Self {
        Self {
            max_segment_bytes: 4 * 1024,
            sync_on_append: false,
        }
    }
}

// ============================================================================
// Segment bookkeeping
// ============================================================================

/// A segment's identity: its first offset and its path.
#[derive(Debug, Clone)]
struct SegmentMeta {
    base: LogOffset,
    path: PathBuf,
}

/// The segment currently open for appends.
#[derive(Debug)]
struct ActiveSegment {
    file: File,
    base: LogOffset,
    path: PathBuf,
    index: SegmentIndex,
    bytes: u64,
}

/// Writer-side state, guarded by the store's mutex.
#[derive(Debug)]
struct Writer {
    /// Sealed segments in ascending base order (active segment excluded).
    sealed: Vec<SegmentMeta>,
    active: ActiveSegment,
    next_offset: LogOffset,
    closed: bool,
}

fn segment_file_name(base: LogOffset) -> String {
    format!("{SEGMENT_PREFIX}{:020}{SEGMENT_SUFFIX}", base.as_u64())
}

fn index_path(segment_path: &Path) -> PathBuf {
    let mut path = segment_path.to_path_buf();
    path.set_extension("log.idx");
    path
}

fn parse_segment_base(file_name: &str) -> Option<LogOffset> {
    let digits = file_name
        .strip_prefix(SEGMENT_PREFIX)?
        .strip_suffix(SEGMENT_SUFFIX)?;
    digits.parse::<u64>().ok().map(LogOffset::new)
}

fn open_for_append(path: &Path) -> WalResult<File> {
    Ok(OpenOptions::new().create(true).append(true).open(path)?)
}

// ============================================================================
// Log Store
// ============================================================================

/// Durable, append-only, sequential store of log entries.
///
/// # Invariants
///
/// - Offsets are strictly increasing with no gaps
/// - Entries are applied downstream only after they are durable here
/// - At most one writer at a time (mutex-guarded offset assignment + append)
#[derive(Debug)]
pub struct LogStore {
    dir: PathBuf,
    config: WalConfig,
    inner: Mutex<Writer>,
}

impl LogStore {
    /// Opens (or creates) the log store at `dir` and recovers existing
    /// segments.
    ///
    /// Recovery scans segments in filename order, verifies every record
    /// checksum and offset contiguity, rebuilds missing or stale segment
    /// indexes, and truncates a torn trailing record in the final segment.
    ///
    /// # Errors
    ///
    /// - [`WalError::Io`] if the directory is inaccessible
    /// - [`WalError::CorruptSegment`] / [`WalError::CorruptedRecord`] on
    ///   damage recovery cannot skip past
    pub fn open(dir: impl Into<PathBuf>, config: WalConfig) -> WalResult<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;

        let mut segments: Vec<SegmentMeta> = Vec::new();
        for dir_entry in fs::read_dir(&dir)? {
            let dir_entry = dir_entry?;
            let name = dir_entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if let Some(base) = parse_segment_base(name) {
                segments.push(SegmentMeta {
                    base,
                    path: dir_entry.path(),
                });
            }
        }
        segments.sort_by_key(|s| s.base);

        let mut expected = LogOffset::ZERO;
        let mut last_index = SegmentIndex::new();
        let segment_count = segments.len();

        for (i, meta) in segments.iter().enumerate() {
            if meta.base != expected {
                return Err(WalError::OffsetGap {
                    expected,
                    got: meta.base,
                });
            }
            let is_last = i + 1 == segment_count;
            let (next, index) = Self::recover_segment(meta, expected, is_last)?;
            expected = next;
            if is_last {
                last_index = index;
            }
        }

        let (sealed, active) = match segments.pop() {
            Some(last) => {
                let file = open_for_append(&last.path)?;
                let bytes = file.metadata()?.len();
                (
                    segments,
                    ActiveSegment {
                        file,
                        base: last.base,
                        path: last.path,
                        index: last_index,
                        bytes,
                    },
                )
            }
            None => (Vec::new(), Self::create_segment(&dir, LogOffset::ZERO)?),
        };

        debug!(dir = %dir.display(), next_offset = %expected, "log store opened");

        Ok(Self {
            dir,
            config,
            inner: Mutex::new(Writer {
                sealed,
                active,
                next_offset: expected,
                closed: false,
            }),
        })
    }

    /// Scans one segment during recovery, returning the next expected offset
    /// and the rebuilt index.
    fn recover_segment(
        meta: &SegmentMeta,
        mut expected: LogOffset,
        is_last: bool,
    ) -> WalResult<(LogOffset, SegmentIndex)> {
        let data: Bytes = fs::read(&meta.path)?.into();
        let mut index = SegmentIndex::new();
        let mut pos = 0usize;

        while pos < data.len() {
            match LogEntry::from_bytes(&data.slice(pos..)) {
                Ok((entry, consumed)) => {
                    if entry.offset() != expected {
                        return Err(WalError::OffsetGap {
                            expected,
                            got: entry.offset(),
                        });
                    }
                    index.append(pos as u64);
                    pos += consumed;
                    expected = expected.next();
                }
                Err(WalError::UnexpectedEof) if is_last => {
                    warn!(
                        segment = %meta.path.display(),
                        valid_bytes = pos,
                        torn_bytes = data.len() - pos,
                        "truncating torn record at log tail"
                    );
                    let file = OpenOptions::new().write(true).open(&meta.path)?;
                    file.set_len(pos as u64)?;
                    file.sync_all()?;
                    break;
                }
                Err(WalError::UnexpectedEof) => {
                    return Err(WalError::CorruptSegment {
                        segment: meta.path.display().to_string(),
                        detail: "truncated record before final segment".to_string(),
                    });
                }
                Err(e) => return Err(e),
            }
        }

        // Keep the sidecar index in sync with what the scan established.
        let idx_path = index_path(&meta.path);
        match SegmentIndex::load(&idx_path) {
            Ok(on_disk) if on_disk == index => {}
            _ => index.save(&idx_path)?,
        }

        Ok((expected, index))
    }

    fn create_segment(dir: &Path, base: LogOffset) -> WalResult<ActiveSegment> {
        let path = dir.join(segment_file_name(base));
        let file = open_for_append(&path)?;
        Ok(ActiveSegment {
            file,
            base,
            path,
            index: SegmentIndex::new(),
            bytes: 0,
        })
    }

    /// Appends a new entry as leader: assigns the next offset and writes it
    /// durably.
    ///
    /// Returns the entry (with its assigned offset) on success. On failure
    /// nothing downstream may apply the write.
    pub fn append(
        &self,
        term: Term,
        key: Bytes,
        value: Bytes,
        ts: Timestamp,
    ) -> WalResult<LogEntry> {
        let mut writer = self.lock_writer();
        if writer.closed {
            return Err(WalError::Closed);
        }

        let entry = LogEntry::new(writer.next_offset, term, key, value, ts);
        self.write_record(&mut writer, &entry)?;
        writer.next_offset = writer.next_offset.next();
        self.finish_append(&mut writer)?;
        Ok(entry)
    }

    /// Appends an entry that already carries its offset (follower path).
    ///
    /// # Errors
    ///
    /// [`WalError::OffsetGap`] if the entry is not contiguous with the tail;
    /// the caller reports its expected offset back to the leader.
    pub fn append_entry(&self, entry: &LogEntry) -> WalResult<()> {
        let mut writer = self.lock_writer();
        if writer.closed {
            return Err(WalError::Closed);
        }
        if entry.offset() != writer.next_offset {
            return Err(WalError::OffsetGap {
                expected: writer.next_offset,
                got: entry.offset(),
            });
        }
        self.write_record(&mut writer, entry)?;
        writer.next_offset = writer.next_offset.next();
        self.finish_append(&mut writer)
    }

    /// Appends a contiguous batch of entries with a single fsync.
    ///
    /// Validates contiguity of the whole batch before writing anything, so
    /// a gapped batch leaves the log untouched.
    pub fn append_batch(&self, entries: &[LogEntry]) -> WalResult<()> {
        let mut writer = self.lock_writer();
        if writer.closed {
            return Err(WalError::Closed);
        }

        let mut expected = writer.next_offset;
        for entry in entries {
            if entry.offset() != expected {
                return Err(WalError::OffsetGap {
                    expected,
                    got: entry.offset(),
                });
            }
            expected = expected.next();
        }

        for entry in entries {
            self.write_record(&mut writer, entry)?;
            writer.next_offset = writer.next_offset.next();
        }
        self.finish_append(&mut writer)
    }

    fn write_record(&self, writer: &mut Writer, entry: &LogEntry) -> WalResult<()> {
        if writer.active.bytes >= self.config.max_segment_bytes && !writer.active.index.is_empty()
        {
            self.rotate(writer)?;
        }

        let record = entry.to_bytes();
        writer.active.index.append(writer.active.bytes);
        writer.active.file.write_all(&record)?;
        writer.active.bytes += record.len() as u64;
        Ok(())
    }

    /// Seals the active segment and starts a new one at the current tail.
    fn rotate(&self, writer: &mut Writer) -> WalResult<()> {
        writer.active.index.save(&index_path(&writer.active.path))?;
        writer.active.file.sync_all()?;

        let sealed = SegmentMeta {
            base: writer.active.base,
            path: writer.active.path.clone(),
        };
        debug!(
            segment = %sealed.path.display(),
            entries = writer.active.index.len(),
            bytes = writer.active.bytes,
            "sealing segment"
        );
        let next = Self::create_segment(&self.dir, writer.next_offset)?;
        writer.sealed.push(sealed);
        writer.active = next;
        Ok(())
    }

    fn finish_append(&self, writer: &mut Writer) -> WalResult<()> {
        writer.active.index.save(&index_path(&writer.active.path))?;
        if self.config.sync_on_append {
            writer.active.file.sync_data()?;
        }
        Ok(())
    }

    /// Flushes the active segment and its index to disk.
    pub fn sync(&self) -> WalResult<()> {
        let writer = self.lock_writer();
        writer.active.index.save(&index_path(&writer.active.path))?;
        writer.active.file.sync_all()?;
        Ok(())
    }

    /// Marks the store closed and flushes. Idempotent; subsequent appends
    /// fail with [`WalError::Closed`].
    pub fn close(&self) -> WalResult<()> {
        let mut writer = self.lock_writer();
        if writer.closed {
            return Ok(());
        }
        writer.closed = true;
        writer.active.index.save(&index_path(&writer.active.path))?;
        writer.active.file.sync_all()?;
        Ok(())
    }

    /// The offset the next appended entry will receive.
    pub fn next_offset(&self) -> LogOffset {
        self.lock_writer().next_offset
    }

    /// The offset of the most recently appended entry, or `None` if empty.
    pub fn last_offset(&self) -> Option<LogOffset> {
        let next = self.lock_writer().next_offset;
        (next > LogOffset::ZERO).then(|| LogOffset::new(next.as_u64() - 1))
    }

    /// Returns an iterator positioned before the first entry.
    pub fn iter(&self) -> LogIter {
        let writer = self.lock_writer();
        let mut segments: Vec<SegmentMeta> = writer.sealed.clone();
        segments.push(SegmentMeta {
            base: writer.active.base,
            path: writer.active.path.clone(),
        });
        LogIter {
            segments,
            tail: writer.next_offset,
            loaded: None,
            data: Bytes::new(),
            pos: 0,
            next: LogOffset::ZERO,
        }
    }

    /// Reads a bounded batch of entries starting at `from`.
    ///
    /// This is the read the shipper uses: at most `max_entries` entries and
    /// roughly `max_bytes` of payload, stopping early at the log tail.
    pub fn entries_from(
        &self,
        from: LogOffset,
        max_entries: usize,
        max_bytes: u64,
    ) -> WalResult<Vec<LogEntry>> {
        let mut iter = self.iter();
        if !iter.seek(from)? {
            return Ok(Vec::new());
        }

        let mut out = Vec::new();
        let mut bytes: u64 = 0;
        while out.len() < max_entries && bytes < max_bytes {
            match iter.next_entry() {
                Some(Ok(entry)) => {
                    bytes += entry.encoded_len() as u64;
                    out.push(entry);
                }
                Some(Err(e)) => return Err(e),
                None => break,
            }
        }
        Ok(out)
    }

    fn lock_writer(&self) -> std::sync::MutexGuard<'_, Writer> {
        self.inner.lock().expect("log writer lock poisoned")
    }
}

// ============================================================================
// Iterator
// ============================================================================

/// Forward iterator over the log, bounded by the tail at creation time.
///
/// The iterator works on a snapshot of the segment list; entries appended
/// after `iter()` was called are not visited. Segment files are read whole
/// (they are bounded by the rotation threshold) and decoded incrementally.
#[derive(Debug)]
pub struct LogIter {
    segments: Vec<SegmentMeta>,
    tail: LogOffset,
    /// Index into `segments` of the currently loaded file, if any.
    loaded: Option<usize>,
    data: Bytes,
    pos: usize,
    next: LogOffset,
}

impl LogIter {
    /// Positions the iterator at `offset`.
    ///
    /// Returns `false` (leaving the iterator exhausted) if `offset` is at or
    /// past the tail.
    pub fn seek(&mut self, offset: LogOffset) -> WalResult<bool> {
        if offset >= self.tail {
            self.next = self.tail;
            return Ok(false);
        }
        self.position_at(offset)?;
        self.next = offset;
        Ok(true)
    }

    /// Returns the next entry, or `None` when the snapshot tail is reached.
    pub fn next_entry(&mut self) -> Option<WalResult<LogEntry>> {
        if self.next >= self.tail {
            return None;
        }

        let seg = self.segment_for(self.next);
        if self.loaded != Some(seg) {
            if let Err(e) = self.position_at(self.next) {
                return Some(Err(e));
            }
        }

        match LogEntry::from_bytes(&self.data.slice(self.pos..)) {
            Ok((entry, consumed)) => {
                debug_assert_eq!(entry.offset(), self.next, "log iterator out of step");
                self.pos += consumed;
                self.next = self.next.next();
                Some(Ok(entry))
            }
            Err(e) => Some(Err(e)),
        }
    }

    /// Index of the segment containing `offset` in the snapshot.
    fn segment_for(&self, offset: LogOffset) -> usize {
        // First segment base is always 0, so the partition point is >= 1.
        self.segments.partition_point(|s| s.base <= offset) - 1
    }

    /// Loads the segment containing `offset` and sets the byte cursor to it.
    fn position_at(&mut self, offset: LogOffset) -> WalResult<()> {
        let seg = self.segment_for(offset);
        let base = self.segments[seg].base;
        let path = self.segments[seg].path.clone();

        let data: Bytes = fs::read(&path)?.into();
        let rel = offset.as_u64() - base.as_u64();

        let indexed = SegmentIndex::load(&index_path(&path))
            .ok()
            .and_then(|ix| ix.lookup(rel));

        let pos = match indexed {
            Some(p) => p as usize,
            None => {
                // Stale or missing index: walk from the segment head.
                let mut pos = 0usize;
                let mut cur = base;
                while cur < offset {
                    let (_, consumed) = LogEntry::from_bytes(&data.slice(pos..))?;
                    pos += consumed;
                    cur = cur.next();
                }
                pos
            }
        };

        self.loaded = Some(seg);
        self.data = data;
        self.pos = pos;
        Ok(())
    }
}

impl Iterator for LogIter {
    type Item = WalResult<LogEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_entry()
    }
}
