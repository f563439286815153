//! Log entry type and its on-disk record codec.
//!
//! Entries are immutable once appended. The same type travels over the wire
//! to followers (serde) and onto disk (the hand-rolled CRC-checked codec
//! below); the two representations are independent.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use sdb_types::{LogOffset, Term, Timestamp};

use crate::WalError;

/// Fixed-size prefix: offset(8) + term(8) + ts(8) + key_len(4).
const HEADER_SIZE: usize = 28;

/// Size of the trailing CRC32.
const CRC_SIZE: usize = 4;

/// A single entry in the replicated log.
///
/// # Invariants
///
/// - `offset` is unique and sequential within a log
/// - An entry is never mutated after it has been appended
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    offset: LogOffset,
    term: Term,
    key: Bytes,
    value: Bytes,
    ts: Timestamp,
}

impl LogEntry {
    /// Creates a new log entry.
    pub fn new(offset: LogOffset, term: Term, key: Bytes, value: Bytes, ts: Timestamp) -> Self {
        Self {
            offset,
            term,
            key,
            value,
            ts,
        }
    }

    /// Returns the entry's position in the log.
    pub fn offset(&self) -> LogOffset {
        self.offset
    }

    /// Returns the term of the leader that appended this entry.
    pub fn term(&self) -> Term {
        self.term
    }

    /// Returns the entry's key.
    pub fn key(&self) -> &Bytes {
        &self.key
    }

    /// Returns the entry's value.
    pub fn value(&self) -> &Bytes {
        &self.value
    }

    /// Returns the entry's event timestamp.
    pub fn ts(&self) -> Timestamp {
        self.ts
    }

    /// Serializes the entry to its on-disk record form.
    ///
    /// Format: `[offset:u64][term:u64][ts:i64][key_len:u32][key]`
    /// `[value_len:u32][value][crc32:u32]`, all integers little-endian.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf =
            Vec::with_capacity(HEADER_SIZE + self.key.len() + 4 + self.value.len() + CRC_SIZE);

        buf.extend_from_slice(&self.offset.as_u64().to_le_bytes());
        buf.extend_from_slice(&self.term.as_u64().to_le_bytes());
        buf.extend_from_slice(&self.ts.as_i64().to_le_bytes());

        buf.extend_from_slice(&(self.key.len() as u32).to_le_bytes());
        buf.extend_from_slice(&self.key);

        buf.extend_from_slice(&(self.value.len() as u32).to_le_bytes());
        buf.extend_from_slice(&self.value);

        // crc (4 bytes) - checksum of everything above
        let crc = crc32fast::hash(&buf);
        buf.extend_from_slice(&crc.to_le_bytes());

        buf
    }

    /// Deserializes an entry from the head of `data`.
    ///
    /// Returns the parsed entry and the number of bytes consumed.
    /// Key and value are zero-copy slices via [`Bytes::slice`].
    ///
    /// # Errors
    ///
    /// - [`WalError::UnexpectedEof`] if the data is truncated
    /// - [`WalError::CorruptedRecord`] if the CRC doesn't match
    pub fn from_bytes(data: &Bytes) -> Result<(Self, usize), WalError> {
        if data.len() < HEADER_SIZE {
            return Err(WalError::UnexpectedEof);
        }

        let offset = LogOffset::new(u64::from_le_bytes(data[0..8].try_into().unwrap()));
        let term = Term::new(u64::from_le_bytes(data[8..16].try_into().unwrap()));
        let ts = Timestamp::new(i64::from_le_bytes(data[16..24].try_into().unwrap()));
        let key_len = u32::from_le_bytes(data[24..28].try_into().unwrap()) as usize;

        let value_len_start = HEADER_SIZE + key_len;
        if data.len() < value_len_start + 4 {
            return Err(WalError::UnexpectedEof);
        }

        let value_len =
            u32::from_le_bytes(data[value_len_start..value_len_start + 4].try_into().unwrap())
                as usize;

        let value_start = value_len_start + 4;
        let total_size = value_start + value_len + CRC_SIZE;
        if data.len() < total_size {
            return Err(WalError::UnexpectedEof);
        }

        let key = data.slice(HEADER_SIZE..HEADER_SIZE + key_len);
        let value = data.slice(value_start..value_start + value_len);

        let crc_start = value_start + value_len;
        let stored_crc = u32::from_le_bytes(data[crc_start..total_size].try_into().unwrap());
        let computed_crc = crc32fast::hash(&data[0..crc_start]);

        if stored_crc != computed_crc {
            return Err(WalError::CorruptedRecord { offset });
        }

        Ok((
            LogEntry {
                offset,
                term,
                key,
                value,
                ts,
            },
            total_size,
        ))
    }

    /// Returns the serialized size of this entry in bytes.
    pub fn encoded_len(&self) -> usize {
        HEADER_SIZE + self.key.len() + 4 + self.value.len() + CRC_SIZE
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> LogEntry {
        LogEntry::new(
            LogOffset::new(7),
            Term::new(1),
            Bytes::from("test_pk"),
            Bytes::from("value1"),
            Timestamp::new(9527),
        )
    }

    #[test]
    fn roundtrip() {
        let entry = sample();
        let bytes: Bytes = entry.to_bytes().into();

        let (decoded, consumed) = LogEntry::from_bytes(&bytes).expect("decode");
        assert_eq!(decoded, entry);
        assert_eq!(consumed, bytes.len());
        assert_eq!(consumed, entry.encoded_len());
    }

    #[test]
    fn truncated_data_is_eof() {
        let entry = sample();
        let bytes = entry.to_bytes();

        for cut in [0, 10, HEADER_SIZE, bytes.len() - 1] {
            let partial: Bytes = bytes[..cut].to_vec().into();
            assert!(matches!(
                LogEntry::from_bytes(&partial),
                Err(WalError::UnexpectedEof)
            ));
        }
    }

    #[test]
    fn corrupted_payload_fails_crc() {
        let entry = sample();
        let mut bytes = entry.to_bytes();
        bytes[HEADER_SIZE] ^= 0xff; // flip a key byte

        let data: Bytes = bytes.into();
        assert!(matches!(
            LogEntry::from_bytes(&data),
            Err(WalError::CorruptedRecord { .. })
        ));
    }

    #[test]
    fn empty_key_and_value() {
        let entry = LogEntry::new(
            LogOffset::ZERO,
            Term::ZERO,
            Bytes::new(),
            Bytes::new(),
            Timestamp::new(0),
        );
        let bytes: Bytes = entry.to_bytes().into();
        let (decoded, _) = LogEntry::from_bytes(&bytes).expect("decode");
        assert_eq!(decoded, entry);
    }
}
