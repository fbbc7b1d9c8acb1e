use std::collections::BTreeMap;

use hashbrown::HashMap;
use tracing::warn;

use crate::{
    error::{Error, Result},
    event::Event,
    log::{EventLog, ScanIter},
    types::{Operation, Sequence, TimestampMs},
};

/// Position of a row in the row arena.
pub type RowId = u32;
/// Position of a table in the table arena.
pub type TableId = u32;

/// Where an event lives and what it touched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexEntry {
    /// Frame offset in the log file.
    pub offset: u64,
    /// Timestamp stored in the frame.
    pub timestamp_ms: TimestampMs,
    /// Operation stored in the frame.
    pub operation: Operation,
    /// Affected table.
    pub table: TableId,
    /// Affected row; `None` for table drops.
    pub row: Option<RowId>,
}

#[derive(Debug, Clone)]
struct RowSlot {
    key: Vec<u8>,
    history: Vec<Sequence>,
}

#[derive(Debug, Clone, Default)]
struct TableSlot {
    name: String,
    keys: BTreeMap<Vec<u8>, RowId>,
    history: Vec<Sequence>,
    drops: Vec<Sequence>,
}

/// Derived, rebuildable lookup structure over the log.
///
/// Everything is keyed by integer sequence or arena position; nothing points
/// into log buffers. Entry `i` describes sequence `i + 1`.
#[derive(Debug, Clone, Default)]
pub struct SequenceIndex {
    entries: Vec<IndexEntry>,
    running_max_ts: Vec<TimestampMs>,
    rows: Vec<RowSlot>,
    tables: Vec<TableSlot>,
    table_ids: HashMap<String, TableId>,
    clock_skew: bool,
}

impl SequenceIndex {
    /// Empty index for an empty log.
    pub fn new() -> Self {
        Self::default()
    }

    /// Full rebuild by scanning `log` once.
    pub fn build(log: &EventLog) -> Result<Self> {
        Self::from_scan(log.scan(1))
    }

    /// Rebuild from a scan that starts at sequence 1.
    pub fn from_scan(mut scan: ScanIter) -> Result<Self> {
        let mut index = Self::new();
        while let Some(next) = scan.next_with_offset() {
            let (offset, frame) = next?;
            index.record(&frame.event, offset);
        }
        Ok(index)
    }

    /// Adds the next committed event.
    pub fn record(&mut self, event: &Event, offset: u64) {
        debug_assert_eq!(event.sequence, self.last_sequence() + 1, "index fed out of order");

        let table = self.table_id(&event.table);
        let row = match event.operation {
            Operation::DropTable => None,
            _ => Some(self.row_id(table, &event.key)),
        };

        let seq = event.sequence;
        let slot = &mut self.tables[table as usize];
        slot.history.push(seq);
        match row {
            Some(row) => self.rows[row as usize].history.push(seq),
            None => slot.drops.push(seq),
        }

        let prev_max = self.running_max_ts.last().copied().unwrap_or(0);
        if event.timestamp_ms < prev_max && !self.clock_skew {
            warn!(
                sequence = seq,
                timestamp_ms = event.timestamp_ms,
                previous_max_ms = prev_max,
                "event timestamp went backwards; timestamp bounds are approximate"
            );
            self.clock_skew = true;
        }
        self.running_max_ts.push(prev_max.max(event.timestamp_ms));
        self.entries.push(IndexEntry {
            offset,
            timestamp_ms: event.timestamp_ms,
            operation: event.operation,
            table,
            row,
        });
    }

    /// Highest indexed sequence, `0` when empty.
    pub fn last_sequence(&self) -> Sequence {
        self.entries.len() as Sequence
    }

    /// Number of indexed events.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when nothing is indexed.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entry for `sequence`, if indexed.
    pub fn entry(&self, sequence: Sequence) -> Option<&IndexEntry> {
        let pos = usize::try_from(sequence.checked_sub(1)?).ok()?;
        self.entries.get(pos)
    }

    /// Exact offset lookup.
    pub fn offset_for(&self, sequence: Sequence) -> Result<u64> {
        self.entry(sequence)
            .map(|e| e.offset)
            .ok_or(Error::SequenceNotFound(sequence))
    }

    /// Timestamp of the first event.
    pub fn first_timestamp(&self) -> Option<TimestampMs> {
        self.entries.first().map(|e| e.timestamp_ms)
    }

    /// True once any event carried an earlier timestamp than one before it.
    pub fn has_clock_skew(&self) -> bool {
        self.clock_skew
    }

    /// Last sequence `S` such that no event at or before `S` is stamped after `timestamp_ms`.
    ///
    /// Binary search over the running maximum of timestamps in sequence order.
    /// Equal to [`SequenceIndex::sequence_at_or_before_exact`] unless the clock
    /// went backwards, in which case it can stop early at the skewed event.
    pub fn sequence_at_or_before(&self, timestamp_ms: TimestampMs) -> Option<Sequence> {
        let n = self.running_max_ts.partition_point(|max| *max <= timestamp_ms);
        (n > 0).then_some(n as Sequence)
    }

    /// Largest sequence whose own timestamp is `<= timestamp_ms`. Linear.
    pub fn sequence_at_or_before_exact(&self, timestamp_ms: TimestampMs) -> Option<Sequence> {
        self.entries
            .iter()
            .rposition(|e| e.timestamp_ms <= timestamp_ms)
            .map(|pos| pos as Sequence + 1)
    }

    /// Every sequence that touched `(table, key)`, ascending. Table drops are not included.
    pub fn key_history(&self, table: &str, key: &[u8]) -> &[Sequence] {
        self.row_slot(table, key).map_or(&[][..], |slot| slot.history.as_slice())
    }

    /// Last event for `(table, key)` at or before `bound`.
    pub fn last_for_key_at_or_before(&self, table: &str, key: &[u8], bound: Sequence) -> Option<Sequence> {
        last_at_or_before(self.key_history(table, key), bound)
    }

    /// Last drop of `table` at or before `bound`.
    pub fn last_drop_at_or_before(&self, table: &str, bound: Sequence) -> Option<Sequence> {
        let slot = self.table_slot(table)?;
        last_at_or_before(&slot.drops, bound)
    }

    /// Sequences touching `table` in the half-open range `(after, upto]`.
    pub fn table_events_between(&self, table: &str, after: Sequence, upto: Sequence) -> &[Sequence] {
        let Some(slot) = self.table_slot(table) else {
            return &[];
        };
        let start = slot.history.partition_point(|s| *s <= after);
        let end = slot.history.partition_point(|s| *s <= upto);
        &slot.history[start..end.max(start)]
    }

    /// Keys ever written in `table`, in byte order.
    pub fn keys<'a>(&'a self, table: &str) -> impl Iterator<Item = &'a [u8]> + use<'a> {
        self.table_slot(table)
            .into_iter()
            .flat_map(|slot| slot.keys.keys().map(Vec::as_slice))
    }

    /// Keys of `table` that start with `prefix`, in byte order.
    pub fn keys_with_prefix<'a>(&'a self, table: &str, prefix: &'a [u8]) -> impl Iterator<Item = &'a [u8]> + use<'a> {
        self.table_slot(table).into_iter().flat_map(move |slot| {
            slot.keys
                .range(prefix.to_vec()..)
                .map(|(k, _)| k.as_slice())
                .take_while(move |k| k.starts_with(prefix))
        })
    }

    /// Key touched by the event at `sequence`; `None` for drops and unknown sequences.
    pub fn key_of(&self, sequence: Sequence) -> Option<&[u8]> {
        let row = self.entry(sequence)?.row?;
        Some(&self.rows[row as usize].key)
    }

    /// Table names in first-seen order.
    pub fn tables(&self) -> impl Iterator<Item = &str> {
        self.tables.iter().map(|t| t.name.as_str())
    }

    fn table_slot(&self, table: &str) -> Option<&TableSlot> {
        let id = *self.table_ids.get(table)?;
        self.tables.get(id as usize)
    }

    fn row_slot(&self, table: &str, key: &[u8]) -> Option<&RowSlot> {
        let row = *self.table_slot(table)?.keys.get(key)?;
        self.rows.get(row as usize)
    }

    fn table_id(&mut self, name: &str) -> TableId {
        if let Some(id) = self.table_ids.get(name) {
            return *id;
        }
        let id = self.tables.len() as TableId;
        self.tables.push(TableSlot {
            name: name.to_owned(),
            ..TableSlot::default()
        });
        self.table_ids.insert(name.to_owned(), id);
        id
    }

    fn row_id(&mut self, table: TableId, key: &[u8]) -> RowId {
        if let Some(id) = self.tables[table as usize].keys.get(key) {
            return *id;
        }
        let id = self.rows.len() as RowId;
        self.rows.push(RowSlot {
            key: key.to_vec(),
            history: Vec::new(),
        });
        self.tables[table as usize].keys.insert(key.to_vec(), id);
        id
    }
}

fn last_at_or_before(sorted: &[Sequence], bound: Sequence) -> Option<Sequence> {
    let n = sorted.partition_point(|s| *s <= bound);
    n.checked_sub(1).map(|i| sorted[i])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ev(sequence: Sequence, ts: TimestampMs, table: &str, key: &str, operation: Operation) -> Event {
        Event {
            sequence,
            timestamp_ms: ts,
            table: table.to_string(),
            key: key.as_bytes().to_vec(),
            operation,
            payload: Vec::new(),
        }
    }

    fn index_of(events: &[Event]) -> SequenceIndex {
        let mut index = SequenceIndex::new();
        for (i, e) in events.iter().enumerate() {
            index.record(e, 16 + i as u64 * 100);
        }
        index
    }

    #[test]
    fn key_history_is_ascending_per_key() {
        let index = index_of(&[
            ev(1, 10, "users", "u1", Operation::Insert),
            ev(2, 20, "users", "u2", Operation::Insert),
            ev(3, 30, "users", "u1", Operation::Update),
            ev(4, 40, "orders", "u1", Operation::Insert),
        ]);
        assert_eq!(index.key_history("users", b"u1"), &[1, 3]);
        assert_eq!(index.key_history("orders", b"u1"), &[4]);
        assert!(index.key_history("users", b"nope").is_empty());
        assert_eq!(index.last_for_key_at_or_before("users", b"u1", 2), Some(1));
        assert_eq!(index.offset_for(3).unwrap(), 216);
        assert!(matches!(index.offset_for(5), Err(Error::SequenceNotFound(5))));
        assert!(matches!(index.offset_for(0), Err(Error::SequenceNotFound(0))));
    }

    #[test]
    fn timestamp_lookup_with_and_without_skew() {
        let index = index_of(&[
            ev(1, 100, "t", "a", Operation::Insert),
            ev(2, 200, "t", "a", Operation::Update),
            ev(3, 150, "t", "a", Operation::Update),
            ev(4, 300, "t", "a", Operation::Update),
        ]);
        assert!(index.has_clock_skew());
        assert_eq!(index.sequence_at_or_before(99), None);
        assert_eq!(index.sequence_at_or_before(100), Some(1));
        // Sequence 3 is stamped 150, but sequence 2 before it is stamped 200.
        assert_eq!(index.sequence_at_or_before(160), Some(1));
        assert_eq!(index.sequence_at_or_before_exact(160), Some(3));
        assert_eq!(index.sequence_at_or_before(250), Some(3));
        assert_eq!(index.sequence_at_or_before(1_000), Some(4));
    }

    #[test]
    fn prefix_keys_and_table_ranges() {
        let index = index_of(&[
            ev(1, 1, "t", "apple", Operation::Insert),
            ev(2, 2, "t", "apricot", Operation::Insert),
            ev(3, 3, "t", "banana", Operation::Insert),
            ev(4, 4, "t", "", Operation::DropTable),
            ev(5, 5, "u", "apple", Operation::Insert),
        ]);
        let keys: Vec<&[u8]> = index.keys_with_prefix("t", b"ap").collect();
        assert_eq!(keys, vec![&b"apple"[..], &b"apricot"[..]]);
        assert_eq!(index.table_events_between("t", 1, 4), &[2, 3, 4]);
        assert_eq!(index.last_drop_at_or_before("t", 3), None);
        assert_eq!(index.last_drop_at_or_before("t", 9), Some(4));
        assert_eq!(index.key_of(4), None);
        assert_eq!(index.tables().collect::<Vec<_>>(), vec!["t", "u"]);
    }
}
