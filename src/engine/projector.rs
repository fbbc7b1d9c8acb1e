use std::collections::{BTreeMap, BTreeSet};

use hashbrown::HashMap;

use crate::{
    core::indices::SequenceIndex,
    error::Result,
    event::{Event, Row},
    persist::TableSnapshot,
    types::{Operation, Sequence, TimestampMs},
};

use super::traits::EventSource;

/// Cached state of one key at the projector's current sequence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LiveRow {
    /// Last event that affected the row, tombstones and drops included.
    pub sequence: Sequence,
    /// Timestamp of that event.
    pub timestamp_ms: TimestampMs,
    /// Last non-tombstone payload; `None` if the key was only ever deleted.
    pub payload: Option<Vec<u8>>,
    /// Hidden by a soft delete or table drop.
    pub deleted: bool,
}

/// A key whose cached state disagrees with a replay of the log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProjectionMismatch {
    /// Table name.
    pub table: String,
    /// Primary key.
    pub key: Vec<u8>,
    /// What the live projection holds.
    pub live: Option<Row>,
    /// What replaying the log produces.
    pub replayed: Option<Row>,
}

/// Where a planned row's payload comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PayloadRef {
    /// Already in memory, from the live cache or a snapshot.
    Inline(Vec<u8>),
    /// Payload of the frame for `sequence`.
    Frame {
        /// Sequence of the frame holding the payload.
        sequence: Sequence,
        /// Byte offset of that frame.
        offset: u64,
    },
}

/// A row resolved from in-memory state whose payload may still be on disk.
///
/// Planning touches only the index, the live cache and snapshot rows, so it
/// can run under a short lock; [`PlannedRow::fetch`] does the file I/O after.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedRow {
    /// Table name.
    pub table: String,
    /// Primary key.
    pub key: Vec<u8>,
    /// Last event that affected the row, tombstones and drops included.
    pub sequence: Sequence,
    /// Timestamp of that event.
    pub timestamp_ms: TimestampMs,
    /// Hidden by a soft delete or table drop.
    pub deleted: bool,
    /// Where to get the payload.
    pub payload: PayloadRef,
}

impl PlannedRow {
    /// Reads the payload if it is still in the log and returns the finished row.
    pub fn fetch<S: EventSource + ?Sized>(self, source: &S) -> Result<Row> {
        let payload = match self.payload {
            PayloadRef::Inline(bytes) => bytes,
            PayloadRef::Frame { sequence, offset } => source.event_at(sequence, offset)?.payload,
        };
        Ok(Row {
            table: self.table,
            key: self.key,
            sequence: self.sequence,
            timestamp_ms: self.timestamp_ms,
            payload,
            deleted: self.deleted,
        })
    }
}

impl From<Row> for PlannedRow {
    fn from(row: Row) -> Self {
        Self {
            table: row.table,
            key: row.key,
            sequence: row.sequence,
            timestamp_ms: row.timestamp_ms,
            deleted: row.deleted,
            payload: PayloadRef::Inline(row.payload),
        }
    }
}

/// Fetches every planned row, keeping their order.
pub fn fetch_all<S: EventSource + ?Sized>(plan: Vec<PlannedRow>, source: &S) -> Result<Vec<Row>> {
    plan.into_iter().map(|row| row.fetch(source)).collect()
}

/// Materializes rows at a sequence bound and keeps a live projection of the
/// latest state, updated once per applied event.
#[derive(Debug, Clone, Default)]
pub struct TableProjector {
    live: HashMap<String, BTreeMap<Vec<u8>, LiveRow>>,
    applied_through: Sequence,
}

impl TableProjector {
    /// Empty projector for an empty log.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a projector by applying events in order, starting at sequence 1.
    pub fn from_events(events: impl IntoIterator<Item = Result<Event>>) -> Result<Self> {
        let mut projector = Self::new();
        for event in events {
            projector.apply(&event?);
        }
        Ok(projector)
    }

    /// Highest sequence folded into the live projection.
    pub fn applied_through(&self) -> Sequence {
        self.applied_through
    }

    /// Folds one committed event into the live projection.
    pub fn apply(&mut self, event: &Event) {
        debug_assert_eq!(event.sequence, self.applied_through + 1, "projector fed out of order");
        self.applied_through = event.sequence;

        let rows = self.live.entry_ref(event.table.as_str()).or_default();
        match event.operation {
            Operation::Insert | Operation::Update => {
                rows.insert(
                    event.key.clone(),
                    LiveRow {
                        sequence: event.sequence,
                        timestamp_ms: event.timestamp_ms,
                        payload: Some(event.payload.clone()),
                        deleted: false,
                    },
                );
            }
            Operation::SoftDelete => {
                let row = rows.entry(event.key.clone()).or_insert(LiveRow {
                    sequence: event.sequence,
                    timestamp_ms: event.timestamp_ms,
                    payload: None,
                    deleted: true,
                });
                row.sequence = event.sequence;
                row.timestamp_ms = event.timestamp_ms;
                row.deleted = true;
            }
            Operation::DropTable => {
                for row in rows.values_mut() {
                    row.sequence = event.sequence;
                    row.timestamp_ms = event.timestamp_ms;
                    row.deleted = true;
                }
            }
        }
    }

    /// Live state of one key.
    pub fn live_row(&self, table: &str, key: &[u8]) -> Option<&LiveRow> {
        self.live.get(table)?.get(key)
    }

    /// State of `(table, key)` using only events with `sequence <= bound`.
    ///
    /// Bounds at or past the live sequence are answered from the cache
    /// without touching the log.
    pub fn state_as_of<S: EventSource + ?Sized>(
        &self,
        index: &SequenceIndex,
        source: &S,
        table: &str,
        key: &[u8],
        bound: Sequence,
        include_deleted: bool,
    ) -> Result<Option<Row>> {
        self.plan_state(index, table, key, bound, include_deleted)
            .map(|planned| planned.fetch(source))
            .transpose()
    }

    /// Like [`TableProjector::state_as_of`], stopping before any log read.
    pub fn plan_state(
        &self,
        index: &SequenceIndex,
        table: &str,
        key: &[u8],
        bound: Sequence,
        include_deleted: bool,
    ) -> Option<PlannedRow> {
        if bound >= self.applied_through {
            return self
                .live_row(table, key)
                .and_then(|live| to_row(table, key, live, include_deleted))
                .map(PlannedRow::from);
        }
        Self::plan_replay(index, table, key, bound, include_deleted)
    }

    /// Resolves a row from the index and log alone, ignoring the live cache.
    pub fn replay_row<S: EventSource + ?Sized>(
        index: &SequenceIndex,
        source: &S,
        table: &str,
        key: &[u8],
        bound: Sequence,
        include_deleted: bool,
    ) -> Result<Option<Row>> {
        Self::plan_replay(index, table, key, bound, include_deleted)
            .map(|planned| planned.fetch(source))
            .transpose()
    }

    /// Row metadata from the index alone; the payload is left in the log.
    pub fn plan_replay(
        index: &SequenceIndex,
        table: &str,
        key: &[u8],
        bound: Sequence,
        include_deleted: bool,
    ) -> Option<PlannedRow> {
        let history = index.key_history(table, key);
        let n = history.partition_point(|s| *s <= bound);
        let last = history[..n].last().copied()?;
        let entry = index.entry(last)?;

        let dropped = index
            .last_drop_at_or_before(table, bound)
            .filter(|d| *d > last)
            .and_then(|d| index.entry(d).map(|e| (d, e.timestamp_ms)));
        let (sequence, timestamp_ms, deleted) = match dropped {
            Some((d, ts)) => (d, ts, true),
            None => (last, entry.timestamp_ms, entry.operation.is_tombstone()),
        };
        if deleted && !include_deleted {
            return None;
        }

        // Walk back past tombstones to the last written payload.
        let (with_payload, offset) = history[..n].iter().rev().find_map(|s| {
            index
                .entry(*s)
                .filter(|e| !e.operation.is_tombstone())
                .map(|e| (*s, e.offset))
        })?;

        Some(PlannedRow {
            table: table.to_owned(),
            key: key.to_vec(),
            sequence,
            timestamp_ms,
            deleted,
            payload: PayloadRef::Frame {
                sequence: with_payload,
                offset,
            },
        })
    }

    /// Every row of `table` at `bound`, ordered by key.
    ///
    /// Live bounds come straight from the cache. Historical bounds start from
    /// `base` when it is a snapshot of this table at or before `bound`, and
    /// re-resolve only the keys touched after it.
    pub fn table_as_of<S: EventSource + ?Sized>(
        &self,
        index: &SequenceIndex,
        source: &S,
        table: &str,
        bound: Sequence,
        include_deleted: bool,
        base: Option<&TableSnapshot>,
    ) -> Result<Vec<Row>> {
        fetch_all(self.plan_table(index, table, bound, include_deleted, base), source)
    }

    /// Like [`TableProjector::table_as_of`], stopping before any log read.
    pub fn plan_table(
        &self,
        index: &SequenceIndex,
        table: &str,
        bound: Sequence,
        include_deleted: bool,
        base: Option<&TableSnapshot>,
    ) -> Vec<PlannedRow> {
        if bound >= self.applied_through {
            return self
                .live_rows(table, include_deleted)
                .into_iter()
                .map(PlannedRow::from)
                .collect();
        }

        let usable_base = base.filter(|snap| {
            snap.table == table
                && snap.sequence <= bound
                && index
                    .last_drop_at_or_before(table, bound)
                    .is_none_or(|d| d <= snap.sequence)
        });

        let Some(snap) = usable_base else {
            return index
                .keys(table)
                .filter_map(|key| Self::plan_replay(index, table, key, bound, include_deleted))
                .collect();
        };

        let mut rows: BTreeMap<Vec<u8>, PlannedRow> = snap
            .rows
            .iter()
            .map(|row| (row.key.clone(), PlannedRow::from(row.clone())))
            .collect();
        let touched: BTreeSet<&[u8]> = index
            .table_events_between(table, snap.sequence, bound)
            .iter()
            .filter_map(|s| index.key_of(*s))
            .collect();
        for key in touched {
            match Self::plan_replay(index, table, key, bound, true) {
                Some(row) => rows.insert(key.to_vec(), row),
                None => rows.remove(key),
            };
        }

        rows.into_values()
            .filter(|row| include_deleted || !row.deleted)
            .collect()
    }

    /// Live rows of `table`, ordered by key.
    pub fn live_rows(&self, table: &str, include_deleted: bool) -> Vec<Row> {
        self.live
            .get(table)
            .into_iter()
            .flat_map(|rows| rows.iter())
            .filter_map(|(key, live)| to_row(table, key, live, include_deleted))
            .collect()
    }

    /// Snapshot of the live state of `table`, deleted rows included.
    pub fn snapshot(&self, table: &str, created_at_ms: TimestampMs) -> TableSnapshot {
        TableSnapshot {
            table: table.to_owned(),
            sequence: self.applied_through,
            created_at_ms,
            rows: self.live_rows(table, true),
        }
    }

    /// True once any event for `table` has been applied.
    pub fn has_table(&self, table: &str) -> bool {
        self.live.contains_key(table)
    }

    /// Tables present in the live projection, sorted.
    pub fn tables(&self) -> Vec<String> {
        let mut names: Vec<String> = self.live.keys().cloned().collect();
        names.sort();
        names
    }

    /// Compares every cached key with a replay from the log at the live sequence.
    pub fn verify<S: EventSource + ?Sized>(
        &self,
        index: &SequenceIndex,
        source: &S,
    ) -> Result<Vec<ProjectionMismatch>> {
        let mut mismatches = Vec::new();
        let bound = self.applied_through;
        for table in index.tables() {
            for key in index.keys(table) {
                let live = self
                    .live_row(table, key)
                    .and_then(|row| to_row(table, key, row, true));
                let replayed = Self::replay_row(index, source, table, key, bound, true)?;
                if live != replayed {
                    mismatches.push(ProjectionMismatch {
                        table: table.to_owned(),
                        key: key.to_vec(),
                        live,
                        replayed,
                    });
                }
            }
        }
        Ok(mismatches)
    }
}

fn to_row(table: &str, key: &[u8], live: &LiveRow, include_deleted: bool) -> Option<Row> {
    if live.deleted && !include_deleted {
        return None;
    }
    let payload = live.payload.clone()?;
    Some(Row {
        table: table.to_owned(),
        key: key.to_vec(),
        sequence: live.sequence,
        timestamp_ms: live.timestamp_ms,
        payload,
        deleted: live.deleted,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ev(sequence: Sequence, key: &str, operation: Operation, payload: &str) -> Event {
        Event {
            sequence,
            timestamp_ms: sequence * 10,
            table: "users".to_string(),
            key: key.as_bytes().to_vec(),
            operation,
            payload: payload.as_bytes().to_vec(),
        }
    }

    fn fixture(events: &[Event]) -> (SequenceIndex, TableProjector) {
        let mut index = SequenceIndex::new();
        let mut projector = TableProjector::new();
        for (i, e) in events.iter().enumerate() {
            index.record(e, i as u64);
            projector.apply(e);
        }
        (index, projector)
    }

    #[test]
    fn drop_hides_older_rows_but_not_newer_ones() {
        let events = vec![
            ev(1, "a", Operation::Insert, "A1"),
            ev(2, "b", Operation::Insert, "B1"),
            ev(3, "", Operation::DropTable, ""),
            ev(4, "b", Operation::Insert, "B2"),
        ];
        let (index, projector) = fixture(&events);

        assert!(projector.state_as_of(&index, &events, "users", b"a", 4, false).unwrap().is_none());
        let a = projector.state_as_of(&index, &events, "users", b"a", 4, true).unwrap().unwrap();
        assert!(a.deleted);
        assert_eq!(a.sequence, 3);
        assert_eq!(a.payload, b"A1");

        let b = projector.state_as_of(&index, &events, "users", b"b", 4, false).unwrap().unwrap();
        assert_eq!(b.payload, b"B2");
        let old_b = projector.state_as_of(&index, &events, "users", b"b", 2, false).unwrap().unwrap();
        assert_eq!(old_b.payload, b"B1");

        assert!(projector.verify(&index, &events).unwrap().is_empty());
    }

    #[test]
    fn plans_point_at_the_payload_frame_without_reading_it() {
        let events = vec![
            ev(1, "a", Operation::Insert, "A1"),
            ev(2, "a", Operation::SoftDelete, ""),
            ev(3, "a", Operation::Insert, "A2"),
        ];
        let (index, projector) = fixture(&events);

        let deleted = projector.plan_state(&index, "users", b"a", 2, true).unwrap();
        assert!(deleted.deleted);
        assert_eq!(deleted.sequence, 2);
        // Fixture offsets are positions, so sequence 1 sits at offset 0.
        assert_eq!(deleted.payload, PayloadRef::Frame { sequence: 1, offset: 0 });

        let live = projector.plan_state(&index, "users", b"a", 3, false).unwrap();
        assert_eq!(live.payload, PayloadRef::Inline(b"A2".to_vec()));

        let row = deleted.fetch(&events).unwrap();
        assert_eq!(row.payload, b"A1");
    }

    #[test]
    fn delete_of_unknown_key_has_no_row() {
        let events = vec![ev(1, "ghost", Operation::SoftDelete, "")];
        let (index, projector) = fixture(&events);
        assert!(projector.state_as_of(&index, &events, "users", b"ghost", 1, true).unwrap().is_none());
        assert!(TableProjector::replay_row(&index, &events, "users", b"ghost", 1, true).unwrap().is_none());
    }

    #[test]
    fn snapshot_base_matches_full_replay() {
        let mut events = vec![
            ev(1, "a", Operation::Insert, "A1"),
            ev(2, "b", Operation::Insert, "B1"),
            ev(3, "c", Operation::Insert, "C1"),
        ];
        let (_, at_three) = fixture(&events);
        let snap = at_three.snapshot("users", 0);

        events.push(ev(4, "a", Operation::Update, "A2"));
        events.push(ev(5, "c", Operation::SoftDelete, ""));
        events.push(ev(6, "d", Operation::Insert, "D1"));
        events.push(ev(7, "b", Operation::Update, "B2"));
        let (index, projector) = fixture(&events);

        for include_deleted in [false, true] {
            let with_base = projector
                .table_as_of(&index, &events, "users", 6, include_deleted, Some(&snap))
                .unwrap();
            let without = projector
                .table_as_of(&index, &events, "users", 6, include_deleted, None)
                .unwrap();
            assert_eq!(with_base, without);
        }
        let keys: Vec<Vec<u8>> = projector
            .table_as_of(&index, &events, "users", 6, false, Some(&snap))
            .unwrap()
            .into_iter()
            .map(|r| r.key)
            .collect();
        assert_eq!(keys, vec![b"a".to_vec(), b"b".to_vec(), b"d".to_vec()]);
    }
}
