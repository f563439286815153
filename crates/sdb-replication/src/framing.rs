//! Length-prefixed message framing for replication connections.
//!
//! Each message is framed as:
//!
//! ```text
//! ┌──────────────┬──────────────┬──────────────────────────────────┐
//! │   Length     │   Checksum   │            Payload               │
//! │   (4 bytes)  │   (4 bytes)  │         (variable)               │
//! └──────────────┴──────────────┴──────────────────────────────────┘
//! ```
//!
//! - **Length**: Big-endian u32 of payload size (excludes header)
//! - **Checksum**: CRC32 of the payload for corruption detection
//! - **Payload**: bincode-serialized [`WireMessage`](crate::WireMessage)
//!
//! The decoder parses incrementally, so it works for both the blocking
//! client and the non-blocking server.

use std::io;

use serde::de::DeserializeOwned;
use serde::Serialize;

/// Size of the frame header in bytes (length + checksum).
pub const HEADER_SIZE: usize = 8;

/// Default maximum message size (16 MiB).
pub const DEFAULT_MAX_MESSAGE_SIZE: u32 = 16 * 1024 * 1024;

/// Minimum valid message size (empty message is invalid).
const MIN_MESSAGE_SIZE: u32 = 1;

// ============================================================================
// Errors
// ============================================================================

/// Errors that can occur during message framing.
#[derive(Debug, thiserror::Error)]
pub enum FramingError {
    /// I/O error during read or write.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Message exceeds maximum allowed size.
    #[error("message too large: {size} bytes (max {max})")]
    MessageTooLarge { size: u32, max: u32 },

    /// Message checksum doesn't match.
    #[error("checksum mismatch: expected {expected:#x}, got {actual:#x}")]
    ChecksumMismatch { expected: u32, actual: u32 },

    /// Failed to deserialize message.
    #[error("deserialization failed: {0}")]
    Deserialize(String),

    /// Failed to serialize message.
    #[error("serialization failed: {0}")]
    Serialize(String),
}

impl FramingError {
    /// Returns true if this error indicates the connection should be closed.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            FramingError::ChecksumMismatch { .. }
                | FramingError::MessageTooLarge { .. }
                | FramingError::Deserialize(_)
        )
    }
}

// ============================================================================
// Encoder
// ============================================================================

/// Encodes messages into framed bytes.
#[derive(Debug, Clone)]
pub struct FrameEncoder {
    max_size: u32,
}

impl Default for FrameEncoder {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameEncoder {
    /// Creates a new encoder with default settings.
    pub fn new() -> Self {
        Self {
            max_size: DEFAULT_MAX_MESSAGE_SIZE,
        }
    }

    /// Creates an encoder with a custom maximum message size.
    pub fn with_max_size(max_size: u32) -> Self {
        debug_assert!(max_size >= MIN_MESSAGE_SIZE, "max_size must be positive");
        Self { max_size }
    }

    /// Encodes a message into a byte buffer, including the header.
    pub fn encode<T: Serialize>(&self, message: &T) -> Result<Vec<u8>, FramingError> {
        let payload =
            bincode::serialize(message).map_err(|e| FramingError::Serialize(e.to_string()))?;

        let payload_len = payload.len();
        if payload_len > self.max_size as usize {
            return Err(FramingError::MessageTooLarge {
                size: payload_len as u32,
                max: self.max_size,
            });
        }

        let checksum = crc32fast::hash(&payload);

        let mut frame = Vec::with_capacity(HEADER_SIZE + payload_len);
        frame.extend_from_slice(&(payload_len as u32).to_be_bytes());
        frame.extend_from_slice(&checksum.to_be_bytes());
        frame.extend_from_slice(&payload);

        debug_assert_eq!(frame.len(), HEADER_SIZE + payload_len);

        Ok(frame)
    }
}

// ============================================================================
// Decoder
// ============================================================================

/// State of the frame decoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DecoderState {
    /// Waiting for the header.
    ReadingHeader,
    /// Reading the payload (have header, waiting for body).
    ReadingPayload { length: u32, checksum: u32 },
}

/// Decodes length-prefixed frames into messages.
///
/// The decoder maintains internal state to handle partial reads. Call
/// `decode()` repeatedly as data becomes available.
#[derive(Debug)]
pub struct FrameDecoder {
    max_size: u32,
    buffer: Vec<u8>,
    state: DecoderState,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameDecoder {
    /// Creates a new decoder with default settings.
    pub fn new() -> Self {
        Self {
            max_size: DEFAULT_MAX_MESSAGE_SIZE,
            buffer: Vec::with_capacity(4096),
            state: DecoderState::ReadingHeader,
        }
    }

    /// Appends data to the internal buffer.
    pub fn extend(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Returns the number of bytes in the buffer.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Attempts to decode a message from the internal buffer.
    ///
    /// Returns:
    /// - `Ok(Some(message))` if a complete message was decoded
    /// - `Ok(None)` if more data is needed
    /// - `Err(_)` if the frame is invalid
    ///
    /// On success, the consumed bytes are removed from the buffer.
    pub fn decode<T: DeserializeOwned>(&mut self) -> Result<Option<T>, FramingError> {
        loop {
            match self.state {
                DecoderState::ReadingHeader => {
                    if self.buffer.len() < HEADER_SIZE {
                        return Ok(None);
                    }

                    let length = u32::from_be_bytes(
                        self.buffer[0..4].try_into().expect("4-byte slice"),
                    );
                    let checksum = u32::from_be_bytes(
                        self.buffer[4..8].try_into().expect("4-byte slice"),
                    );

                    if length > self.max_size {
                        return Err(FramingError::MessageTooLarge {
                            size: length,
                            max: self.max_size,
                        });
                    }
                    if length < MIN_MESSAGE_SIZE {
                        return Err(FramingError::Deserialize(
                            "empty message is invalid".to_string(),
                        ));
                    }

                    self.state = DecoderState::ReadingPayload { length, checksum };
                }

                DecoderState::ReadingPayload { length, checksum } => {
                    let total_needed = HEADER_SIZE + length as usize;
                    if self.buffer.len() < total_needed {
                        return Ok(None);
                    }

                    let payload = &self.buffer[HEADER_SIZE..total_needed];

                    let actual_checksum = crc32fast::hash(payload);
                    if actual_checksum != checksum {
                        return Err(FramingError::ChecksumMismatch {
                            expected: checksum,
                            actual: actual_checksum,
                        });
                    }

                    let message: T = bincode::deserialize(payload)
                        .map_err(|e| FramingError::Deserialize(e.to_string()))?;

                    self.buffer.drain(..total_needed);
                    self.state = DecoderState::ReadingHeader;

                    return Ok(Some(message));
                }
            }
        }
    }

    /// Resets the decoder state, discarding any buffered data.
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.state = DecoderState::ReadingHeader;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{AppendEntriesResponse, ResponseCode, WireMessage};
    use sdb_types::LogOffset;

    fn test_message() -> WireMessage {
        WireMessage::AppendEntriesResponse(AppendEntriesResponse::accepted(LogOffset::new(9)))
    }

    #[test]
    fn encode_decode_roundtrip() {
        let encoder = FrameEncoder::new();
        let mut decoder = FrameDecoder::new();

        let original = test_message();
        let encoded = encoder.encode(&original).expect("encode");
        assert!(encoded.len() > HEADER_SIZE);

        decoder.extend(&encoded);
        let decoded: WireMessage = decoder.decode().expect("decode").expect("complete message");
        assert_eq!(decoded, original);
    }

    #[test]
    fn decode_incremental() {
        let encoder = FrameEncoder::new();
        let mut decoder = FrameDecoder::new();

        let encoded = encoder.encode(&test_message()).expect("encode");

        for (i, &byte) in encoded.iter().enumerate() {
            decoder.extend(&[byte]);
            let result: Option<WireMessage> = decoder.decode().expect("decode");
            if i < encoded.len() - 1 {
                assert!(result.is_none(), "should not decode until complete");
            } else {
                assert!(result.is_some(), "should decode when complete");
            }
        }
    }

    #[test]
    fn decode_multiple_messages() {
        let encoder = FrameEncoder::new();
        let mut decoder = FrameDecoder::new();

        let messages: Vec<WireMessage> = (0..5)
            .map(|i| {
                WireMessage::AppendEntriesResponse(AppendEntriesResponse::rejected(
                    ResponseCode::OffsetGap,
                    LogOffset::new(i),
                ))
            })
            .collect();

        let mut all = Vec::new();
        for msg in &messages {
            all.extend(encoder.encode(msg).expect("encode"));
        }
        decoder.extend(&all);

        for original in &messages {
            let decoded: WireMessage = decoder.decode().expect("decode").expect("message");
            assert_eq!(&decoded, original);
        }
        assert!(decoder.decode::<WireMessage>().expect("decode").is_none());
    }

    #[test]
    fn checksum_mismatch_is_fatal() {
        let encoder = FrameEncoder::new();
        let mut decoder = FrameDecoder::new();

        let mut encoded = encoder.encode(&test_message()).expect("encode");
        let last = encoded.len() - 1;
        encoded[last] ^= 0xff;

        decoder.extend(&encoded);
        let result = decoder.decode::<WireMessage>();
        match result {
            Err(e @ FramingError::ChecksumMismatch { .. }) => assert!(e.is_fatal()),
            other => panic!("expected checksum mismatch, got {other:?}"),
        }
    }

    #[test]
    fn oversized_frame_is_rejected() {
        let encoder = FrameEncoder::with_max_size(4);
        let result = encoder.encode(&test_message());
        assert!(matches!(result, Err(FramingError::MessageTooLarge { .. })));
    }

    #[test]
    fn decoder_reset() {
        let encoder = FrameEncoder::new();
        let mut decoder = FrameDecoder::new();

        let encoded = encoder.encode(&test_message()).expect("encode");

        decoder.extend(&encoded[..HEADER_SIZE + 1]);
        assert!(decoder.decode::<WireMessage>().expect("decode").is_none());
        assert!(decoder.buffered() > 0);

        decoder.reset();
        assert_eq!(decoder.buffered(), 0);

        decoder.extend(&encoded);
        assert!(decoder.decode::<WireMessage>().expect("decode").is_some());
    }
}
