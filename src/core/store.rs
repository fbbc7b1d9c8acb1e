use std::path::Path;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::{
    clock::{Clock, SystemClock},
    config::EngineConfig,
    engine::{
        projector::{ProjectionMismatch, TableProjector},
        resolver::{Query, QueryResolver, QueryResult, TimeBound, snapshot_base},
        traits::EventSource,
    },
    error::{Error, Result},
    event::{Event, EventDraft, Row},
    log::{EventLog, LOG_HEADER_LEN, LogReader, RecoveryReport, ScanIter},
    persist::{SnapshotStore, TableSnapshot},
    types::{Sequence, TimestampMs},
};

use super::indices::SequenceIndex;

#[derive(Debug, Default)]
struct Derived {
    index: SequenceIndex,
    projector: TableProjector,
}

impl Derived {
    fn rebuild(mut scan: ScanIter) -> Result<Self> {
        let mut derived = Self::default();
        while let Some(next) = scan.next_with_offset() {
            let (offset, frame) = next?;
            derived.index.record(&frame.event, offset);
            derived.projector.apply(&frame.event);
        }
        Ok(derived)
    }
}

/// The embedded engine: one log file, its index, and the live projection.
///
/// `Store` is `Send + Sync`. Appends are serialized by the writer lock. Reads
/// hold the derived-state lock only while they plan against the index and
/// the live cache; frame reads and snapshot lookups run after it is released.
/// Reads therefore run concurrently with each other, and an append waits
/// only for in-memory planning, never for a reader's file I/O.
pub struct Store {
    writer: Mutex<EventLog>,
    reader: Arc<LogReader>,
    derived: RwLock<Derived>,
    snapshots: Option<Mutex<Box<dyn SnapshotStore>>>,
    clock: Arc<dyn Clock>,
    config: EngineConfig,
    opened_with: RecoveryReport,
}

impl Store {
    /// Opens or creates the log at `path`, recovering a torn tail.
    pub fn open(path: impl AsRef<Path>, config: EngineConfig) -> Result<Self> {
        Self::open_with_clock(path, config, Arc::new(SystemClock))
    }

    /// Like [`Store::open`] with a custom append clock.
    pub fn open_with_clock(path: impl AsRef<Path>, config: EngineConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        let (log, report) = EventLog::open(path, config.clone(), Arc::clone(&clock))?;
        let reader = Arc::clone(log.reader());
        let derived = Derived::rebuild(log.scan(1))?;
        debug!(
            last_sequence = derived.index.last_sequence(),
            tables = derived.projector.tables().len(),
            "derived state built"
        );
        Ok(Self {
            writer: Mutex::new(log),
            reader,
            derived: RwLock::new(derived),
            snapshots: None,
            clock,
            config,
            opened_with: report,
        })
    }

    /// Attaches a snapshot store used by checkpoints and historical table reads.
    pub fn with_snapshots(mut self, snapshots: Box<dyn SnapshotStore>) -> Self {
        self.snapshots = Some(Mutex::new(snapshots));
        self
    }

    /// Recovery outcome from [`Store::open`].
    pub fn opened_with(&self) -> &RecoveryReport {
        &self.opened_with
    }

    /// Engine options in effect.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// True when a snapshot store is attached.
    pub fn has_snapshots(&self) -> bool {
        self.snapshots.is_some()
    }

    /// Durably appends one event and returns its sequence.
    pub fn append(&self, draft: EventDraft) -> Result<Sequence> {
        self.append_event(draft).map(|event| event.sequence)
    }

    /// Durably appends one event and returns it as committed.
    pub fn append_event(&self, draft: EventDraft) -> Result<Event> {
        let mut writer = self.writer.lock();
        let appended = writer.append(draft)?;
        let mut derived = self.derived.write();
        derived.index.record(&appended.event, appended.offset);
        derived.projector.apply(&appended.event);
        Ok(appended.event)
    }

    /// Appends an insert.
    pub fn insert(&self, table: &str, key: impl AsRef<[u8]>, payload: impl Into<Vec<u8>>) -> Result<Sequence> {
        self.append(EventDraft::insert(table, key, payload))
    }

    /// Appends an update.
    pub fn update(&self, table: &str, key: impl AsRef<[u8]>, payload: impl Into<Vec<u8>>) -> Result<Sequence> {
        self.append(EventDraft::update(table, key, payload))
    }

    /// Appends a soft delete.
    pub fn soft_delete(&self, table: &str, key: impl AsRef<[u8]>) -> Result<Sequence> {
        self.append(EventDraft::soft_delete(table, key))
    }

    /// Appends a table drop.
    pub fn drop_table(&self, table: &str) -> Result<Sequence> {
        self.append(EventDraft::drop_table(table))
    }

    /// Appends an insert of a JSON document.
    pub fn insert_json(&self, table: &str, key: impl AsRef<[u8]>, doc: &serde_json::Value) -> Result<Sequence> {
        self.append(EventDraft::insert_json(table, key, doc)?)
    }

    /// Appends an update with a JSON document.
    pub fn update_json(&self, table: &str, key: impl AsRef<[u8]>, doc: &serde_json::Value) -> Result<Sequence> {
        self.append(EventDraft::update_json(table, key, doc)?)
    }

    /// Decodes the frame at a byte offset.
    pub fn read_at(&self, offset: u64) -> Result<Event> {
        self.reader.read_at(offset).map(|frame| frame.event)
    }

    /// Events with `sequence >= from`, bounded by the log length now.
    ///
    /// Starts at the indexed offset of `from`, so the scan does not re-read
    /// earlier frames. Frames are still checksummed as they are read.
    pub fn scan(&self, from: Sequence) -> ScanIter {
        let derived = self.derived.read();
        let from = from.max(1);
        let (offset, start) = match derived.index.offset_for(from) {
            Ok(offset) => (offset, from),
            // Past the end: resume after the last indexed frame.
            Err(_) => {
                let last = derived.index.last_sequence();
                derived
                    .index
                    .offset_for(last)
                    .map_or((LOG_HEADER_LEN as u64, 1), |offset| (offset, last))
            }
        };
        self.reader.scan(offset, start, from)
    }

    /// Re-validates the log, cuts a torn tail, and rebuilds derived state.
    ///
    /// Also clears a writer poisoned by a failed append.
    pub fn recover(&self) -> Result<RecoveryReport> {
        let mut writer = self.writer.lock();
        let report = writer.recover()?;
        let rebuilt = Derived::rebuild(writer.scan(1))?;
        *self.derived.write() = rebuilt;
        info!(last_sequence = report.last_sequence, "store recovered");
        Ok(report)
    }

    /// Runs a time-travel query.
    pub fn query(&self, query: &Query) -> Result<QueryResult> {
        let (sequence, ready) = {
            let derived = self.derived.read();
            let resolver = self.resolver(&derived);
            let sequence = resolver.resolve_bound(query.bound)?;
            let ready = (self.snapshots.is_none() || !resolver.wants_snapshot(query, sequence))
                .then(|| resolver.plan(query, sequence, None));
            (sequence, ready)
        };

        let plan = match ready {
            Some(plan) => plan,
            None => {
                // Looked up with the derived state unlocked.
                let base = self
                    .snapshots
                    .as_ref()
                    .and_then(|snapshots| snapshot_base(&**snapshots.lock(), &query.table, sequence));
                let derived = self.derived.read();
                check_bound(&derived.index, sequence)?;
                self.resolver(&derived).plan(query, sequence, base.as_ref())
            }
        };
        plan.fetch(&*self.reader)
    }

    /// State of one key using only events with `sequence <= bound`.
    pub fn state_as_of(
        &self,
        table: &str,
        key: impl AsRef<[u8]>,
        bound: Sequence,
        include_deleted: bool,
    ) -> Result<Option<Row>> {
        let planned = {
            let derived = self.derived.read();
            check_bound(&derived.index, bound)?;
            derived
                .projector
                .plan_state(&derived.index, table, key.as_ref(), bound, include_deleted)
        };
        planned.map(|row| row.fetch(&*self.reader)).transpose()
    }

    /// Every row of `table` at `bound`, ordered by key.
    pub fn table_as_of(&self, table: &str, bound: Sequence, include_deleted: bool) -> Result<Vec<Row>> {
        let query = Query::table(table)
            .as_of(TimeBound::Sequence(bound))
            .include_deleted(include_deleted);
        self.query(&query).map(|result| result.rows)
    }

    /// Every event that touched `(table, key)`, ascending. Drops are not included.
    pub fn history(&self, table: &str, key: impl AsRef<[u8]>) -> Result<Vec<Event>> {
        let located: Vec<(Sequence, u64)> = {
            let derived = self.derived.read();
            derived
                .index
                .key_history(table, key.as_ref())
                .iter()
                .map(|seq| derived.index.offset_for(*seq).map(|offset| (*seq, offset)))
                .collect::<Result<_>>()?
        };
        located
            .into_iter()
            .map(|(seq, offset)| self.reader.event_at(seq, offset))
            .collect()
    }

    /// Sequences that touched `(table, key)`, ascending.
    pub fn key_history(&self, table: &str, key: impl AsRef<[u8]>) -> Vec<Sequence> {
        self.derived.read().index.key_history(table, key.as_ref()).to_vec()
    }

    /// Table names seen in the log, sorted.
    pub fn tables(&self) -> Vec<String> {
        let derived = self.derived.read();
        let mut names: Vec<String> = derived.index.tables().map(str::to_owned).collect();
        names.sort();
        names
    }

    /// Sequence of the last committed event, `0` for an empty log.
    pub fn latest_sequence(&self) -> Sequence {
        self.derived.read().index.last_sequence()
    }

    /// Timestamp of the first event.
    pub fn first_timestamp(&self) -> Option<TimestampMs> {
        self.derived.read().index.first_timestamp()
    }

    /// Byte offset of the frame for `sequence`.
    pub fn offset_for(&self, sequence: Sequence) -> Result<u64> {
        self.derived.read().index.offset_for(sequence)
    }

    /// Writes a snapshot of the live state of `table`.
    ///
    /// Returns the snapshot's sequence, or `None` without a snapshot store
    /// and for a table the log never wrote.
    pub fn checkpoint(&self, table: &str) -> Result<Option<Sequence>> {
        let Some(snapshots) = &self.snapshots else {
            return Ok(None);
        };
        let snapshot = {
            let derived = self.derived.read();
            if !derived.projector.has_table(table) {
                return Ok(None);
            }
            derived.projector.snapshot(table, self.clock.now_ms())
        };
        let sequence = snapshot.sequence;
        snapshots.lock().write_snapshot(&snapshot)?;
        debug!(table, sequence, rows = snapshot.rows.len(), "checkpoint written");
        Ok(Some(sequence))
    }

    /// Checkpoints every table; returns what was written.
    pub fn checkpoint_all(&self) -> Result<Vec<(String, Sequence)>> {
        let Some(snapshots) = &self.snapshots else {
            return Ok(Vec::new());
        };
        let taken: Vec<TableSnapshot> = {
            let derived = self.derived.read();
            let now = self.clock.now_ms();
            derived
                .projector
                .tables()
                .iter()
                .map(|table| derived.projector.snapshot(table, now))
                .collect()
        };

        let mut store = snapshots.lock();
        let mut written = Vec::with_capacity(taken.len());
        for snapshot in taken {
            store.write_snapshot(&snapshot)?;
            debug!(table = %snapshot.table, sequence = snapshot.sequence, rows = snapshot.rows.len(), "checkpoint written");
            written.push((snapshot.table, snapshot.sequence));
        }
        Ok(written)
    }

    /// Sequences of stored snapshots of `table`.
    pub fn snapshots(&self, table: &str) -> Result<Vec<Sequence>> {
        match &self.snapshots {
            Some(snapshots) => Ok(snapshots.lock().list(table)?),
            None => Ok(Vec::new()),
        }
    }

    /// Deletes snapshots of `table` older than `sequence`. The log is untouched.
    pub fn prune_snapshots(&self, table: &str, sequence: Sequence) -> Result<usize> {
        match &self.snapshots {
            Some(snapshots) => Ok(snapshots.lock().prune_before(table, sequence)?),
            None => Ok(0),
        }
    }

    /// Rebuilds index and projection from the log and compares them with the
    /// live state. Returns every key that disagrees; empty when consistent.
    ///
    /// Appends wait until the comparison is done.
    pub fn verify_projection(&self) -> Result<Vec<ProjectionMismatch>> {
        let writer = self.writer.lock();
        let fresh = Derived::rebuild(writer.scan(1))?;
        let derived = self.derived.read();

        let mut mismatches = derived.projector.verify(&fresh.index, &*self.reader)?;
        // Keys cached live that the log never wrote.
        for table in derived.projector.tables() {
            for row in derived.projector.live_rows(&table, true) {
                if fresh.index.key_history(&table, &row.key).is_empty() {
                    mismatches.push(ProjectionMismatch {
                        table: table.clone(),
                        key: row.key.clone(),
                        live: Some(row),
                        replayed: None,
                    });
                }
            }
        }
        if fresh.index.last_sequence() != derived.index.last_sequence() {
            warn!(
                live = derived.index.last_sequence(),
                rebuilt = fresh.index.last_sequence(),
                "live index length differs from the log"
            );
        }
        if !mismatches.is_empty() {
            warn!(count = mismatches.len(), "live projection disagrees with the log");
        }
        Ok(mismatches)
    }

    /// Discards derived state and rebuilds it from the log.
    pub fn rebuild_index(&self) -> Result<Sequence> {
        let writer = self.writer.lock();
        let rebuilt = Derived::rebuild(writer.scan(1))?;
        let last = rebuilt.index.last_sequence();
        *self.derived.write() = rebuilt;
        info!(last_sequence = last, "derived state rebuilt");
        Ok(last)
    }

    fn resolver<'a>(&self, derived: &'a Derived) -> QueryResolver<'a> {
        QueryResolver::new(&derived.index, &derived.projector).exact_timestamps(self.config.exact_timestamps)
    }
}

fn check_bound(index: &SequenceIndex, bound: Sequence) -> Result<()> {
    if bound > index.last_sequence() {
        return Err(Error::SequenceNotFound(bound));
    }
    Ok(())
}
