//! Binary frame codec for a single event.
//!
//! Frame layout (all integers little-endian):
//!
//! ```text
//! offset  size  field
//!      0     8  sequence
//!      8     8  timestamp (ms since Unix epoch)
//!     16     1  operation tag
//!     17     2  table-name length
//!     19     2  key length
//!     21     4  payload length
//!     25     *  table name (utf-8), key, payload
//!      *     4  CRC-32 of every preceding byte of the frame
//! ```

use thiserror::Error;

use crate::{
    event::Event,
    types::{Operation, Sequence},
};

/// Size of the fixed frame header.
pub const FRAME_HEADER_LEN: usize = 25;
/// Size of the checksum trailer.
pub const FRAME_TRAILER_LEN: usize = 4;
/// Smallest possible frame (empty table, key and payload).
pub const MIN_FRAME_LEN: usize = FRAME_HEADER_LEN + FRAME_TRAILER_LEN;

/// Reason a frame could not be encoded or decoded.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    /// A length field points past the available bytes.
    #[error("frame truncated: needs {needed} bytes, {available} available")]
    Truncated {
        /// Bytes the frame declares.
        needed: usize,
        /// Bytes actually present.
        available: usize,
    },
    /// Stored trailer does not match the recomputed checksum.
    #[error("checksum mismatch: stored {stored:#010x}, computed {computed:#010x}")]
    ChecksumMismatch {
        /// Checksum read from the trailer.
        stored: u32,
        /// Checksum over the bytes actually read.
        computed: u32,
    },
    /// Operation tag byte is not a known [`Operation`].
    #[error("unknown operation tag {0}")]
    UnknownOperation(u8),
    /// Table name bytes are not valid utf-8.
    #[error("table name is not valid utf-8")]
    InvalidTableName,
    /// A variable field does not fit its length prefix.
    #[error("{field} is {len} bytes, limit is {limit}")]
    FieldTooLong {
        /// Field name.
        field: &'static str,
        /// Actual length.
        len: usize,
        /// Maximum encodable length.
        limit: usize,
    },
    /// A frame is valid on its own but breaks the gapless sequence order.
    #[error("sequence gap: expected {expected}, found {found}")]
    SequenceGap {
        /// Sequence the log expected next.
        expected: Sequence,
        /// Sequence stored in the frame.
        found: Sequence,
    },
}

/// Fixed header fields of a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Event sequence.
    pub sequence: Sequence,
    /// Event timestamp.
    pub timestamp_ms: u64,
    /// Raw operation tag.
    pub op_tag: u8,
    /// Table-name length.
    pub table_len: u16,
    /// Key length.
    pub key_len: u16,
    /// Payload length.
    pub payload_len: u32,
}

impl FrameHeader {
    /// Parses the fixed header from the front of `buf`.
    pub fn parse(buf: &[u8]) -> Result<Self, FrameError> {
        if buf.len() < FRAME_HEADER_LEN {
            return Err(FrameError::Truncated {
                needed: FRAME_HEADER_LEN,
                available: buf.len(),
            });
        }
        Ok(Self {
            sequence: le_u64(buf, 0),
            timestamp_ms: le_u64(buf, 8),
            op_tag: buf[16],
            table_len: le_u16(buf, 17),
            key_len: le_u16(buf, 19),
            payload_len: le_u32(buf, 21),
        })
    }

    /// Total frame size declared by this header, trailer included.
    pub fn frame_len(&self) -> usize {
        FRAME_HEADER_LEN
            + usize::from(self.table_len)
            + usize::from(self.key_len)
            + self.payload_len as usize
            + FRAME_TRAILER_LEN
    }
}

/// A successfully decoded frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedFrame {
    /// The event carried by the frame.
    pub event: Event,
    /// Verified checksum trailer.
    pub checksum: u32,
    /// Number of bytes the frame occupies.
    pub len: usize,
}

/// Encodes `event` into a self-contained frame.
pub fn encode(event: &Event) -> Result<Vec<u8>, FrameError> {
    let table_len = checked_len("table name", event.table.len(), u16::MAX as usize)?;
    let key_len = checked_len("key", event.key.len(), u16::MAX as usize)?;
    let payload_len = checked_len("payload", event.payload.len(), u32::MAX as usize)?;

    let body_len = FRAME_HEADER_LEN + table_len + key_len + payload_len;
    let mut buf = Vec::with_capacity(body_len + FRAME_TRAILER_LEN);
    buf.extend_from_slice(&event.sequence.to_le_bytes());
    buf.extend_from_slice(&event.timestamp_ms.to_le_bytes());
    buf.push(event.operation.tag());
    buf.extend_from_slice(&(table_len as u16).to_le_bytes());
    buf.extend_from_slice(&(key_len as u16).to_le_bytes());
    buf.extend_from_slice(&(payload_len as u32).to_le_bytes());
    buf.extend_from_slice(event.table.as_bytes());
    buf.extend_from_slice(&event.key);
    buf.extend_from_slice(&event.payload);

    let checksum = crc32fast::hash(&buf);
    buf.extend_from_slice(&checksum.to_le_bytes());
    Ok(buf)
}

/// Decodes the frame at the front of `buf`. Trailing bytes after the frame are ignored.
pub fn decode(buf: &[u8]) -> Result<DecodedFrame, FrameError> {
    let header = FrameHeader::parse(buf)?;
    let len = header.frame_len();
    if buf.len() < len {
        return Err(FrameError::Truncated {
            needed: len,
            available: buf.len(),
        });
    }

    let body_end = len - FRAME_TRAILER_LEN;
    let stored = le_u32(buf, body_end);
    let computed = crc32fast::hash(&buf[..body_end]);
    if stored != computed {
        return Err(FrameError::ChecksumMismatch { stored, computed });
    }

    let operation = Operation::from_tag(header.op_tag).ok_or(FrameError::UnknownOperation(header.op_tag))?;

    let table_end = FRAME_HEADER_LEN + usize::from(header.table_len);
    let key_end = table_end + usize::from(header.key_len);
    let table = std::str::from_utf8(&buf[FRAME_HEADER_LEN..table_end])
        .map_err(|_| FrameError::InvalidTableName)?
        .to_owned();

    Ok(DecodedFrame {
        event: Event {
            sequence: header.sequence,
            timestamp_ms: header.timestamp_ms,
            table,
            key: buf[table_end..key_end].to_vec(),
            operation,
            payload: buf[key_end..body_end].to_vec(),
        },
        checksum: stored,
        len,
    })
}

fn checked_len(field: &'static str, len: usize, limit: usize) -> Result<usize, FrameError> {
    if len > limit {
        return Err(FrameError::FieldTooLong { field, len, limit });
    }
    Ok(len)
}

fn le_u16(buf: &[u8], at: usize) -> u16 {
    let mut b = [0u8; 2];
    b.copy_from_slice(&buf[at..at + 2]);
    u16::from_le_bytes(b)
}

fn le_u32(buf: &[u8], at: usize) -> u32 {
    let mut b = [0u8; 4];
    b.copy_from_slice(&buf[at..at + 4]);
    u32::from_le_bytes(b)
}

fn le_u64(buf: &[u8], at: usize) -> u64 {
    let mut b = [0u8; 8];
    b.copy_from_slice(&buf[at..at + 8]);
    u64::from_le_bytes(b)
}
