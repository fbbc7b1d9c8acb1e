//! Shared primitive IDs and the operation tag enum.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Monotonic event sequence number. The first event of a log is `1`.
pub type Sequence = u64;
/// Wall-clock milliseconds since the Unix epoch.
pub type TimestampMs = u64;

/// Kind of mutation recorded by an event.
///
/// There is no physical delete: [`Operation::SoftDelete`] only hides a key
/// and [`Operation::DropTable`] hides every key written before it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Operation {
    /// First write of a row.
    Insert,
    /// Whole-row replacement.
    Update,
    /// Visibility tombstone; the payload is empty.
    SoftDelete,
    /// Tombstone for every row of the table; key and payload are empty.
    DropTable,
}

impl Operation {
    /// On-disk tag byte.
    pub const fn tag(self) -> u8 {
        match self {
            Self::Insert => 1,
            Self::Update => 2,
            Self::SoftDelete => 3,
            Self::DropTable => 4,
        }
    }

    /// Parses an on-disk tag byte.
    pub const fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            1 => Some(Self::Insert),
            2 => Some(Self::Update),
            3 => Some(Self::SoftDelete),
            4 => Some(Self::DropTable),
            _ => None,
        }
    }

    /// True for operations that make rows invisible.
    pub const fn is_tombstone(self) -> bool {
        matches!(self, Self::SoftDelete | Self::DropTable)
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Insert => "insert",
            Self::Update => "update",
            Self::SoftDelete => "soft_delete",
            Self::DropTable => "drop_table",
        };
        f.write_str(name)
    }
}

/// Identity of a row: table name plus opaque primary-key bytes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RowKey {
    /// Logical table name.
    pub table: String,
    /// Primary-key bytes.
    pub key: Vec<u8>,
}

impl RowKey {
    /// Builds a row key from anything byte-like.
    pub fn new(table: impl Into<String>, key: impl AsRef<[u8]>) -> Self {
        Self {
            table: table.into(),
            key: key.as_ref().to_vec(),
        }
    }
}
