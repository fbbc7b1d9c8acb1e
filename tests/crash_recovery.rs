use std::fs::OpenOptions;
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use tempfile::TempDir;

use chronolog::{
    codec::{FRAME_HEADER_LEN, FrameError},
    config::EngineConfig,
    core::store::Store,
    error::Error,
    log::LOG_HEADER_LEN,
};

fn log_path(tmp: &TempDir) -> PathBuf {
    tmp.path().join("events.log")
}

fn seeded(path: &Path, n: u64) -> Vec<u64> {
    let store = Store::open(path, EngineConfig::default()).expect("open");
    let mut offsets = Vec::new();
    for i in 0..n {
        let seq = store.insert("users", format!("u{i}"), format!("payload-{i}")).expect("insert");
        offsets.push(store.offset_for(seq).expect("offset"));
    }
    offsets
}

fn flip_byte(path: &Path, at: u64) {
    let mut file = OpenOptions::new().read(true).write(true).open(path).expect("open raw");
    let mut byte = [0u8; 1];
    file.seek(SeekFrom::Start(at)).unwrap();
    std::io::Read::read_exact(&mut file, &mut byte).unwrap();
    file.seek(SeekFrom::Start(at)).unwrap();
    file.write_all(&[byte[0] ^ 0xFF]).unwrap();
    file.sync_all().unwrap();
}

fn file_len(path: &Path) -> u64 {
    std::fs::metadata(path).expect("metadata").len()
}

// Payload starts after the fixed header, table "users" (5) and a 2-byte key.
fn payload_offset(frame_offset: u64) -> u64 {
    frame_offset + FRAME_HEADER_LEN as u64 + 5 + 2
}

#[test]
fn truncated_checksum_is_recovered_away() {
    let tmp = TempDir::new().expect("tmp");
    let path = log_path(&tmp);
    seeded(&path, 3);

    let full = file_len(&path);
    let file = OpenOptions::new().write(true).open(&path).unwrap();
    file.set_len(full - 2).unwrap();
    drop(file);

    let store = Store::open(&path, EngineConfig::default()).expect("reopen");
    let report = store.opened_with();
    assert_eq!(report.last_sequence, 2);
    let tail = report.truncated.as_ref().expect("truncated tail");
    assert!(matches!(tail.reason, FrameError::Truncated { .. }));
    assert_eq!(tail.offset + tail.discarded_bytes, full - 2);

    let seqs: Vec<u64> = store.scan(1).map(|e| e.unwrap().sequence).collect();
    assert_eq!(seqs, vec![1, 2]);
    assert!(store.state_as_of("users", "u2", 2, true).unwrap().is_none());

    // The discarded sequence is assigned again; it was never acknowledged.
    assert_eq!(store.insert("users", "u9", "again").unwrap(), 3);
    assert_eq!(file_len(&path), store.offset_for(3).unwrap() + (FRAME_HEADER_LEN + 5 + 2 + 5 + 4) as u64);
}

#[test]
fn partial_frame_header_is_recovered_away() {
    let tmp = TempDir::new().expect("tmp");
    let path = log_path(&tmp);
    let offsets = seeded(&path, 2);

    let file = OpenOptions::new().write(true).open(&path).unwrap();
    file.set_len(offsets[1] + 10).unwrap();
    drop(file);

    let store = Store::open(&path, EngineConfig::default()).expect("reopen");
    assert_eq!(store.opened_with().last_sequence, 1);
    assert_eq!(file_len(&path), offsets[1]);
}

#[test]
fn zero_filled_tail_is_recovered_away() {
    let tmp = TempDir::new().expect("tmp");
    let path = log_path(&tmp);
    seeded(&path, 2);
    let before = file_len(&path);

    let file = OpenOptions::new().write(true).open(&path).unwrap();
    file.set_len(before + 4096).unwrap();
    drop(file);

    let store = Store::open(&path, EngineConfig::default()).expect("reopen");
    let report = store.opened_with();
    assert_eq!(report.last_sequence, 2);
    assert_eq!(report.truncated.as_ref().unwrap().discarded_bytes, 4096);
    assert_eq!(file_len(&path), before);
}

#[test]
fn corrupt_committed_frame_fails_reads_and_reopen() {
    let tmp = TempDir::new().expect("tmp");
    let path = log_path(&tmp);
    let store = Store::open(&path, EngineConfig::default()).expect("open");
    for i in 0..3 {
        store.insert("users", format!("u{i}"), format!("payload-{i}")).unwrap();
    }
    let offset = store.offset_for(2).unwrap();
    flip_byte(&path, payload_offset(offset));

    let err = store.read_at(offset).unwrap_err();
    assert!(matches!(
        err,
        Error::CorruptFrame { source: FrameError::ChecksumMismatch { .. }, .. }
    ));
    assert!(err.is_integrity());

    let scanned: Vec<_> = store.scan(1).collect();
    assert_eq!(scanned.len(), 2);
    assert!(scanned[0].is_ok());
    assert!(matches!(scanned[1], Err(Error::CorruptFrame { offset: o, .. }) if o == offset));

    // History reads go to disk and must not hand back the damaged payload.
    assert!(store.history("users", "u1").is_err());
    drop(store);

    let reopened = Store::open(&path, EngineConfig::default());
    assert!(matches!(reopened, Err(Error::CorruptFrame { offset: o, .. }) if o == offset));
    // Nothing was repaired.
    assert!(file_len(&path) > offset);
}

#[test]
fn damaged_final_frame_is_treated_as_torn() {
    let tmp = TempDir::new().expect("tmp");
    let path = log_path(&tmp);
    let offsets = seeded(&path, 3);
    flip_byte(&path, payload_offset(offsets[2]));

    let store = Store::open(&path, EngineConfig::default()).expect("reopen");
    let tail = store.opened_with().truncated.clone().expect("tail");
    assert!(matches!(tail.reason, FrameError::ChecksumMismatch { .. }));
    assert_eq!(store.latest_sequence(), 2);
}

#[test]
fn damaged_length_field_mid_log_is_fatal() {
    let tmp = TempDir::new().expect("tmp");
    let path = log_path(&tmp);
    let offsets = seeded(&path, 3);
    // Most significant byte of the payload length (header bytes 21..25).
    flip_byte(&path, offsets[1] + 24);

    let reopened = Store::open(&path, EngineConfig::default());
    assert!(matches!(reopened, Err(Error::CorruptFrame { offset, .. }) if offset == offsets[1]));
}

#[test]
fn damaged_length_before_large_frames_is_fatal() {
    let tmp = TempDir::new().expect("tmp");
    let path = log_path(&tmp);
    let offsets = {
        let store = Store::open(&path, EngineConfig::default()).expect("open");
        let mut offsets = Vec::new();
        for (key, size) in [("u0", 200_000), ("u1", 150_000), ("u2", 16)] {
            let seq = store.insert("users", key, vec![b'x'; size]).expect("insert");
            offsets.push(store.offset_for(seq).expect("offset"));
        }
        offsets
    };
    // Frame 2 starts several read chunks past frame 1 and is itself larger than one chunk.
    flip_byte(&path, offsets[0] + 24);

    let reopened = Store::open(&path, EngineConfig::default());
    assert!(matches!(reopened, Err(Error::CorruptFrame { offset, .. }) if offset == offsets[0]));
}

#[test]
fn large_torn_final_frame_is_recovered_away() {
    let tmp = TempDir::new().expect("tmp");
    let path = log_path(&tmp);
    seeded(&path, 2);
    {
        let store = Store::open(&path, EngineConfig::default()).expect("open");
        store.insert("users", "big", vec![b'x'; 300_000]).expect("insert");
    }

    let full = file_len(&path);
    let file = OpenOptions::new().write(true).open(&path).unwrap();
    file.set_len(full - 100_000).unwrap();
    drop(file);

    let store = Store::open(&path, EngineConfig::default()).expect("reopen");
    let tail = store.opened_with().truncated.clone().expect("tail");
    assert!(matches!(tail.reason, FrameError::Truncated { .. }));
    assert_eq!(store.latest_sequence(), 2);
}

#[test]
fn foreign_file_is_rejected() {
    let tmp = TempDir::new().expect("tmp");
    let path = log_path(&tmp);
    std::fs::write(&path, b"definitely not an event log file").unwrap();

    assert!(matches!(
        Store::open(&path, EngineConfig::default()),
        Err(Error::InvalidHeader(_))
    ));
}

#[test]
fn torn_file_header_is_rewritten() {
    let tmp = TempDir::new().expect("tmp");
    let path = log_path(&tmp);
    std::fs::write(&path, b"CHLG\x01").unwrap();

    let store = Store::open(&path, EngineConfig::default()).expect("open");
    assert_eq!(store.latest_sequence(), 0);
    assert_eq!(file_len(&path), LOG_HEADER_LEN as u64);
    assert_eq!(store.insert("t", "k", "v").unwrap(), 1);
}

#[test]
fn reads_past_the_end_are_rejected() {
    let tmp = TempDir::new().expect("tmp");
    let path = log_path(&tmp);
    seeded(&path, 1);
    let store = Store::open(&path, EngineConfig::default()).unwrap();

    let end = file_len(&path);
    assert!(matches!(store.read_at(end), Err(Error::UnexpectedEndOfLog { .. })));
    assert!(matches!(store.read_at(0), Err(Error::UnexpectedEndOfLog { .. })));
    assert!(matches!(store.offset_for(2), Err(Error::SequenceNotFound(2))));
}

#[test]
fn recover_on_a_healthy_log_is_a_no_op() {
    let tmp = TempDir::new().expect("tmp");
    let path = log_path(&tmp);
    let store = Store::open(&path, EngineConfig::default()).unwrap();
    store.insert("t", "a", "1").unwrap();
    store.insert("t", "b", "2").unwrap();

    let report = store.recover().unwrap();
    assert_eq!(report.last_sequence, 2);
    assert!(report.truncated.is_none());
    assert_eq!(store.insert("t", "c", "3").unwrap(), 3);
    assert_eq!(store.table_as_of("t", 3, false).unwrap().len(), 3);
}
