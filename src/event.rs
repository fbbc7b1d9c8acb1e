//! Event model: drafts submitted by callers, committed events, and materialized rows.

use serde::{Deserialize, Serialize};

use crate::types::{Operation, RowKey, Sequence, TimestampMs};

/// Immutable, committed mutation read back from the log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    /// Sequence assigned by the log at append time.
    pub sequence: Sequence,
    /// Wall-clock time recorded at append time.
    pub timestamp_ms: TimestampMs,
    /// Logical table name.
    pub table: String,
    /// Primary-key bytes; empty for [`Operation::DropTable`].
    pub key: Vec<u8>,
    /// Mutation kind.
    pub operation: Operation,
    /// Full post-operation row state; empty for tombstones.
    pub payload: Vec<u8>,
}

impl Event {
    /// Identity of the affected row.
    pub fn row_key(&self) -> RowKey {
        RowKey::new(self.table.clone(), &self.key)
    }

    /// Parses the payload as a JSON document.
    pub fn document(&self) -> serde_json::Result<serde_json::Value> {
        serde_json::from_slice(&self.payload)
    }
}

/// Mutation submitted for append; sequence and timestamp are assigned by the log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventDraft {
    /// Logical table name.
    pub table: String,
    /// Primary-key bytes.
    pub key: Vec<u8>,
    /// Mutation kind.
    pub operation: Operation,
    /// Full post-operation row state.
    pub payload: Vec<u8>,
}

impl EventDraft {
    /// Insert with raw payload bytes.
    pub fn insert(table: impl Into<String>, key: impl AsRef<[u8]>, payload: impl Into<Vec<u8>>) -> Self {
        Self::new(table, key, Operation::Insert, payload.into())
    }

    /// Update with raw payload bytes.
    pub fn update(table: impl Into<String>, key: impl AsRef<[u8]>, payload: impl Into<Vec<u8>>) -> Self {
        Self::new(table, key, Operation::Update, payload.into())
    }

    /// Soft delete of one key.
    pub fn soft_delete(table: impl Into<String>, key: impl AsRef<[u8]>) -> Self {
        Self::new(table, key, Operation::SoftDelete, Vec::new())
    }

    /// Drop of a whole table.
    pub fn drop_table(table: impl Into<String>) -> Self {
        Self::new(table, b"", Operation::DropTable, Vec::new())
    }

    /// Insert whose payload is a serialized JSON document.
    pub fn insert_json(
        table: impl Into<String>,
        key: impl AsRef<[u8]>,
        doc: &serde_json::Value,
    ) -> serde_json::Result<Self> {
        Ok(Self::insert(table, key, serde_json::to_vec(doc)?))
    }

    /// Update whose payload is a serialized JSON document.
    pub fn update_json(
        table: impl Into<String>,
        key: impl AsRef<[u8]>,
        doc: &serde_json::Value,
    ) -> serde_json::Result<Self> {
        Ok(Self::update(table, key, serde_json::to_vec(doc)?))
    }

    fn new(table: impl Into<String>, key: impl AsRef<[u8]>, operation: Operation, payload: Vec<u8>) -> Self {
        // Tombstones never carry data.
        let payload = if operation.is_tombstone() { Vec::new() } else { payload };
        Self {
            table: table.into(),
            key: key.as_ref().to_vec(),
            operation,
            payload,
        }
    }
}

/// Row state reconstructed at some sequence bound.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Row {
    /// Logical table name.
    pub table: String,
    /// Primary-key bytes.
    pub key: Vec<u8>,
    /// Sequence of the last event that affected this row at the bound.
    pub sequence: Sequence,
    /// Timestamp of that event.
    pub timestamp_ms: TimestampMs,
    /// Last written payload. For deleted rows this is the pre-delete state.
    pub payload: Vec<u8>,
    /// True when the row is hidden by a soft delete or table drop.
    pub deleted: bool,
}

impl Row {
    /// Parses the payload as a JSON document.
    pub fn document(&self) -> serde_json::Result<serde_json::Value> {
        serde_json::from_slice(&self.payload)
    }
}
