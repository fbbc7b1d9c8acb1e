use std::sync::Arc;

use tempfile::TempDir;

use chronolog::{
    clock::ManualClock,
    config::EngineConfig,
    core::{
        indices::SequenceIndex,
        store::Store,
    },
    engine::projector::TableProjector,
    event::{EventDraft, Row},
    log::{EventLog, LogReader},
};

fn drafts() -> Vec<EventDraft> {
    vec![
        EventDraft::insert("users", "a", "A1"),
        EventDraft::insert("users", "b", "B1"),
        EventDraft::insert("orders", "o1", "O1"),
        EventDraft::update("users", "a", "A2"),
        EventDraft::soft_delete("users", "b"),
        EventDraft::soft_delete("users", "ghost"),
        EventDraft::drop_table("orders"),
        EventDraft::insert("orders", "o2", "O2"),
        EventDraft::insert("users", "b", "B2"),
    ]
}

fn full_replay(store: &Store, table: &str, bound: u64) -> Vec<Row> {
    let index = SequenceIndex::from_scan(store.scan(1)).expect("index");
    let source = ReplaySource(store);
    let mut rows = Vec::new();
    for key in index.keys(table) {
        if let Some(row) = TableProjector::replay_row(&index, &source, table, key, bound, true).expect("replay") {
            rows.push(row);
        }
    }
    rows
}

// Reads through the store's public offset lookup, ignoring the planned offset.
struct ReplaySource<'a>(&'a Store);

impl chronolog::engine::traits::EventSource for ReplaySource<'_> {
    fn event_at(&self, sequence: u64, _offset: u64) -> chronolog::Result<chronolog::event::Event> {
        let offset = self.0.offset_for(sequence)?;
        self.0.read_at(offset)
    }
}

#[test]
fn live_projection_matches_full_replay_at_every_step() {
    let tmp = TempDir::new().expect("tmp");
    let clock = Arc::new(ManualClock::new(100));
    let store = Store::open_with_clock(tmp.path().join("events.log"), EngineConfig::default(), clock.clone())
        .expect("open");

    for draft in drafts() {
        let seq = store.append(draft).expect("append");
        clock.advance(1);
        for table in ["users", "orders"] {
            let live = store.table_as_of(table, seq, true).expect("live");
            assert_eq!(live, full_replay(&store, table, seq), "table {table} at {seq}");
        }
        assert!(store.verify_projection().expect("verify").is_empty());
    }

    let users: Vec<(Vec<u8>, bool)> = store
        .table_as_of("users", store.latest_sequence(), true)
        .unwrap()
        .into_iter()
        .map(|r| (r.key, r.deleted))
        .collect();
    assert_eq!(users, vec![(b"a".to_vec(), false), (b"b".to_vec(), false)]);

    let orders: Vec<Vec<u8>> = store
        .table_as_of("orders", store.latest_sequence(), false)
        .unwrap()
        .into_iter()
        .map(|r| r.key)
        .collect();
    assert_eq!(orders, vec![b"o2".to_vec()]);
}

#[test]
fn historical_reads_agree_with_replay_after_the_fact() {
    let tmp = TempDir::new().expect("tmp");
    let store = Store::open(tmp.path().join("events.log"), EngineConfig::default()).expect("open");
    for draft in drafts() {
        store.append(draft).unwrap();
    }

    for bound in 0..=store.latest_sequence() {
        for table in ["users", "orders"] {
            assert_eq!(
                store.table_as_of(table, bound, true).unwrap(),
                full_replay(&store, table, bound),
                "table {table} at {bound}"
            );
        }
    }
}

#[test]
fn rebuild_index_from_log_matches_live_state() {
    let tmp = TempDir::new().expect("tmp");
    let path = tmp.path().join("events.log");
    let store = Store::open(&path, EngineConfig::default()).expect("open");
    for draft in drafts() {
        store.append(draft).unwrap();
    }
    let before = store.table_as_of("users", store.latest_sequence(), true).unwrap();

    assert_eq!(store.rebuild_index().unwrap(), 9);
    assert_eq!(store.table_as_of("users", 9, true).unwrap(), before);
    assert!(store.verify_projection().unwrap().is_empty());
}

#[test]
fn event_log_index_and_projector_compose_without_store() {
    let tmp = TempDir::new().expect("tmp");
    let clock = Arc::new(ManualClock::new(5));
    let (mut log, report) =
        EventLog::open(tmp.path().join("raw.log"), EngineConfig::default(), clock).expect("open log");
    assert_eq!(report.last_sequence, 0);

    for draft in drafts() {
        log.append(draft).unwrap();
    }
    assert_eq!(log.last_sequence(), 9);

    let index = SequenceIndex::build(&log).expect("index");
    let projector = TableProjector::from_events(log.scan(1)).expect("projector");
    let source: &LogReader = log.reader();

    assert_eq!(index.key_history("users", b"b"), &[2, 5, 9]);
    assert!(projector.verify(&index, source).unwrap().is_empty());

    let b_at_5 = projector
        .state_as_of(&index, source, "users", b"b", 5, true)
        .unwrap()
        .expect("deleted row");
    assert!(b_at_5.deleted);
    assert_eq!(b_at_5.payload, b"B1");
}
