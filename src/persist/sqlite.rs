//! SQLite-backed table snapshot store.

use std::path::Path;

use rusqlite::{Connection, OptionalExtension, params};
use serde::{Deserialize, Serialize};

use crate::types::Sequence;

use super::{PersistError, PersistResult, SnapshotStore, TableSnapshot};

const SNAPSHOT_FORMAT_VERSION: u16 = 1;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS snapshots (
    table_name    TEXT    NOT NULL,
    seq           INTEGER NOT NULL,
    created_at_ms INTEGER NOT NULL,
    row_count     INTEGER NOT NULL,
    payload       BLOB    NOT NULL,
    PRIMARY KEY (table_name, seq)
);
";

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SnapshotEnvelope {
    format_version: u16,
    snapshot: TableSnapshot,
}

/// SQLite implementation of [`crate::persist::SnapshotStore`].
pub struct SqliteSnapshotStore {
    conn: Connection,
}

impl SqliteSnapshotStore {
    /// Opens or creates a snapshot database at `path`.
    ///
    /// Enables WAL mode and sets `synchronous=NORMAL`.
    pub fn open(path: impl AsRef<Path>) -> PersistResult<Self> {
        let conn = Connection::open(path)?;
        Self::init_connection(conn)
    }

    /// Opens an in-memory snapshot database.
    pub fn open_in_memory() -> PersistResult<Self> {
        let conn = Connection::open_in_memory()?;
        Self::init_connection(conn)
    }

    fn init_connection(conn: Connection) -> PersistResult<Self> {
        conn.execute_batch(SCHEMA)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        Ok(Self { conn })
    }
}

impl SnapshotStore for SqliteSnapshotStore {
    fn write_snapshot(&mut self, snapshot: &TableSnapshot) -> PersistResult<()> {
        let env = SnapshotEnvelope {
            format_version: SNAPSHOT_FORMAT_VERSION,
            snapshot: snapshot.clone(),
        };
        let payload = serde_json::to_vec(&env)?;
        self.conn.execute(
            "INSERT OR REPLACE INTO snapshots(table_name, seq, created_at_ms, row_count, payload)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                snapshot.table,
                snapshot.sequence as i64,
                snapshot.created_at_ms as i64,
                snapshot.rows.len() as i64,
                payload,
            ],
        )?;
        Ok(())
    }

    fn latest_at_or_before(&self, table: &str, sequence: Sequence) -> PersistResult<Option<TableSnapshot>> {
        let payload: Option<Vec<u8>> = self
            .conn
            .query_row(
                "SELECT payload FROM snapshots WHERE table_name = ?1 AND seq <= ?2
                 ORDER BY seq DESC LIMIT 1",
                params![table, sequence as i64],
                |row| row.get(0),
            )
            .optional()?;

        let Some(payload) = payload else {
            return Ok(None);
        };

        let env: SnapshotEnvelope = serde_json::from_slice(&payload)?;
        if env.format_version != SNAPSHOT_FORMAT_VERSION {
            return Err(PersistError::Message(format!(
                "unsupported snapshot format version: {}",
                env.format_version
            )));
        }
        Ok(Some(env.snapshot))
    }

    fn list(&self, table: &str) -> PersistResult<Vec<Sequence>> {
        let mut stmt = self
            .conn
            .prepare("SELECT seq FROM snapshots WHERE table_name = ?1 ORDER BY seq ASC")?;
        let rows = stmt.query_map(params![table], |row| row.get::<_, i64>(0))?;

        let mut out = Vec::new();
        for row in rows {
            out.push(row? as Sequence);
        }
        Ok(out)
    }

    fn prune_before(&mut self, table: &str, sequence: Sequence) -> PersistResult<usize> {
        let count = self.conn.execute(
            "DELETE FROM snapshots WHERE table_name = ?1 AND seq < ?2",
            params![table, sequence as i64],
        )?;
        Ok(count)
    }
}
