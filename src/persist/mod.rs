/// SQLite-backed snapshot store.
pub mod sqlite;

use serde::{Deserialize, Serialize};

use crate::{
    event::Row,
    types::{Sequence, TimestampMs},
};

/// Failure while reading or writing derived snapshots.
#[derive(Debug, thiserror::Error)]
pub enum PersistError {
    /// SQLite failure.
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    /// Envelope (de)serialization failure.
    #[error("serde: {0}")]
    Serde(#[from] serde_json::Error),
    /// Anything else, e.g. an unsupported format version.
    #[error("{0}")]
    Message(String),
}

/// Result alias with [`PersistError`].
pub type PersistResult<T> = Result<T, PersistError>;

/// Every known key of a table at one sequence, deleted rows included.
///
/// Derived from the log; safe to drop at any time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSnapshot {
    /// Table name.
    pub table: String,
    /// Sequence the snapshot reflects.
    pub sequence: Sequence,
    /// Wall-clock time the snapshot was taken.
    pub created_at_ms: TimestampMs,
    /// Rows ordered by key.
    pub rows: Vec<Row>,
}

/// Storage for table snapshots used to accelerate historical table reads.
pub trait SnapshotStore: Send {
    /// Persists a snapshot, replacing one with the same table and sequence.
    fn write_snapshot(&mut self, snapshot: &TableSnapshot) -> PersistResult<()>;
    /// Newest snapshot of `table` taken at or before `sequence`.
    fn latest_at_or_before(&self, table: &str, sequence: Sequence) -> PersistResult<Option<TableSnapshot>>;
    /// Sequences of all snapshots of `table`, ascending.
    fn list(&self, table: &str) -> PersistResult<Vec<Sequence>>;
    /// Deletes snapshots of `table` older than `sequence`; returns how many.
    fn prune_before(&mut self, _table: &str, _sequence: Sequence) -> PersistResult<usize> {
        Ok(0)
    }
}
