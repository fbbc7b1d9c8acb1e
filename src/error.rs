//! Crate-wide error type.

use thiserror::Error;

use crate::{codec::FrameError, persist::PersistError, types::Sequence};

/// Every failure surfaced by the engine.
#[derive(Debug, Error)]
pub enum Error {
    /// Committed data failed integrity checks. Never repaired automatically.
    #[error("corrupt frame at offset {offset}: {source}")]
    CorruptFrame {
        /// Byte offset of the frame in the log file.
        offset: u64,
        /// What was wrong with it.
        source: FrameError,
    },
    /// A read asked for bytes beyond the committed end of the log.
    #[error("unexpected end of log at offset {offset}")]
    UnexpectedEndOfLog {
        /// Requested offset.
        offset: u64,
    },
    /// The sequence is outside the range held by the log.
    #[error("sequence {0} not found")]
    SequenceNotFound(Sequence),
    /// A time bound could not be resolved to a sequence.
    #[error("invalid time bound: {0}")]
    InvalidTimeBound(String),
    /// The log file header is missing, foreign, or of an unsupported version.
    #[error("invalid log header: {0}")]
    InvalidHeader(String),
    /// An event could not be framed.
    #[error("cannot encode event: {0}")]
    Encode(FrameError),
    /// Underlying file I/O failure.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// Snapshot persistence failure.
    #[error("persistence error: {0}")]
    Persist(#[from] PersistError),
    /// Payload is not a valid JSON document.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    /// The runtime task has stopped.
    #[error("engine runtime closed")]
    Closed,
}

impl Error {
    /// True for errors that mean committed data is damaged.
    pub fn is_integrity(&self) -> bool {
        matches!(self, Self::CorruptFrame { .. })
    }
}

/// Result alias with [`Error`].
pub type Result<T> = std::result::Result<T, Error>;
