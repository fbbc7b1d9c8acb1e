//! Runtime event stream payloads.

use crate::types::{Operation, Sequence};

/// Events emitted from the single-writer runtime loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
    /// An event was durably appended.
    Appended {
        /// Assigned sequence.
        sequence: Sequence,
        /// Affected table.
        table: String,
        /// Mutation kind.
        operation: Operation,
    },
    /// A table snapshot was stored.
    CheckpointWritten {
        /// Snapshotted table.
        table: String,
        /// Sequence the snapshot reflects.
        sequence: Sequence,
    },
    /// Recovery ran on request.
    Recovered {
        /// Last valid sequence after recovery.
        last_sequence: Sequence,
        /// Bytes cut from a torn tail, if any.
        truncated_bytes: Option<u64>,
    },
}
