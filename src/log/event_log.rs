//! Append-only event log: the single writer, file growth, and crash recovery.

use std::fs::{File, OpenOptions};
use std::io::{self, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{error, info, trace};

use crate::{
    clock::Clock,
    codec::{self, DecodedFrame, FRAME_HEADER_LEN, FRAME_TRAILER_LEN, FrameError, FrameHeader, MIN_FRAME_LEN},
    config::{EngineConfig, SyncMode},
    error::{Error, Result},
    event::{Event, EventDraft},
    types::{Operation, Sequence},
};

use super::{
    header::{LOG_HEADER_LEN, LogHeader},
    reader::{LogReader, ScanIter, read_exact_at},
};

const ZERO_PROBE_CHUNK: usize = 64 * 1024;
const FOLLOW_SCAN_CHUNK: usize = 64 * 1024;

/// Incomplete final frame discarded during recovery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TruncatedTail {
    /// Offset the log was truncated to.
    pub offset: u64,
    /// Bytes removed from the end of the file.
    pub discarded_bytes: u64,
    /// Why the tail was not a valid frame.
    pub reason: FrameError,
}

/// Outcome of a recovery pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Sequence of the last valid frame, `0` for an empty log.
    pub last_sequence: Sequence,
    /// Number of valid frames.
    pub frames: u64,
    /// Committed length of the log file after recovery.
    pub log_len: u64,
    /// Present when a torn tail was cut off.
    pub truncated: Option<TruncatedTail>,
}

/// An event as it landed in the log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppendedEvent {
    /// The committed event.
    pub event: Event,
    /// File offset of its frame.
    pub offset: u64,
    /// Frame size in bytes.
    pub len: u64,
}

enum Probe {
    Valid(DecodedFrame),
    Torn(FrameError),
}

/// Owner of the log file and its write cursor.
///
/// Appends need `&mut self`; callers that share an `EventLog` must serialize
/// them, which is what [`crate::core::store::Store`] does.
pub struct EventLog {
    path: PathBuf,
    file: File,
    reader: Arc<LogReader>,
    len: u64,
    next_sequence: Sequence,
    clock: Arc<dyn Clock>,
    config: EngineConfig,
    poisoned: bool,
}

impl std::fmt::Debug for EventLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventLog")
            .field("path", &self.path)
            .field("len", &self.len)
            .field("next_sequence", &self.next_sequence)
            .field("poisoned", &self.poisoned)
            .finish()
    }
}

impl EventLog {
    /// Opens or creates the log at `path` and runs [`EventLog::recover`].
    pub fn open(
        path: impl AsRef<Path>,
        config: EngineConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<(Self, RecoveryReport)> {
        let path = path.as_ref().to_path_buf();
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;

        let file_len = file.metadata()?.len();
        if file_len < LOG_HEADER_LEN as u64 {
            let mut partial = vec![0u8; file_len as usize];
            read_exact_at(&file, &mut partial, 0)?;
            if !LogHeader::is_torn_prefix(&partial) {
                return Err(Error::InvalidHeader(format!("file is only {file_len} bytes")));
            }
            if file_len > 0 {
                info!(path = %path.display(), file_len, "rewriting torn log header");
            }
            file.set_len(0)?;
            file.seek(SeekFrom::Start(0))?;
            file.write_all(&LogHeader::default().to_bytes())?;
            file.sync_all()?;
        } else {
            let mut bytes = [0u8; LOG_HEADER_LEN];
            read_exact_at(&file, &mut bytes, 0)?;
            LogHeader::parse(&bytes)?;
        }

        let reader = Arc::new(LogReader::open(&path, LOG_HEADER_LEN as u64)?);
        let mut log = Self {
            path,
            file,
            reader,
            len: LOG_HEADER_LEN as u64,
            next_sequence: 1,
            clock,
            config,
            poisoned: false,
        };
        let report = log.recover()?;
        info!(
            path = %log.path.display(),
            last_sequence = report.last_sequence,
            frames = report.frames,
            log_len = report.log_len,
            "event log opened"
        );
        Ok((log, report))
    }

    /// Validates every frame and cuts off a torn final frame.
    ///
    /// A frame that cannot be fully read before end of file, or whose checksum
    /// fails while it ends exactly at end of file, or that is followed only by
    /// zero bytes, is a torn tail and is truncated. Any other damage is
    /// committed data gone bad and fails with [`Error::CorruptFrame`].
    pub fn recover(&mut self) -> Result<RecoveryReport> {
        let file_len = self.file.metadata()?.len();
        let mut offset = LOG_HEADER_LEN as u64;
        let mut expected: Sequence = 1;
        let mut truncated = None;

        while offset < file_len {
            match self.probe_frame(offset, file_len, expected)? {
                Probe::Valid(frame) => {
                    if frame.event.sequence != expected {
                        let source = FrameError::SequenceGap {
                            expected,
                            found: frame.event.sequence,
                        };
                        error!(offset, %source, "log integrity failure");
                        return Err(Error::CorruptFrame { offset, source });
                    }
                    offset += frame.len as u64;
                    expected += 1;
                }
                Probe::Torn(reason) => {
                    truncated = Some(TruncatedTail {
                        offset,
                        discarded_bytes: file_len - offset,
                        reason,
                    });
                    break;
                }
            }
        }

        if let Some(tail) = &truncated {
            self.file.set_len(tail.offset)?;
            self.file.sync_all()?;
            info!(
                offset = tail.offset,
                discarded_bytes = tail.discarded_bytes,
                reason = %tail.reason,
                last_sequence = expected - 1,
                "truncated torn tail"
            );
        }

        self.len = offset;
        self.next_sequence = expected;
        self.poisoned = false;
        self.reader.publish(offset);

        Ok(RecoveryReport {
            last_sequence: expected - 1,
            frames: expected - 1,
            log_len: offset,
            truncated,
        })
    }

    /// Assigns the next sequence, writes the frame, and syncs it.
    ///
    /// When this returns `Ok` the event survives a restart. A failed write or
    /// sync poisons the writer; the log must be reopened, which lets recovery
    /// decide whether the frame made it to disk.
    pub fn append(&mut self, draft: EventDraft) -> Result<AppendedEvent> {
        if self.poisoned {
            return Err(Error::Io(io::Error::other(
                "event log writer is poisoned by an earlier failed write",
            )));
        }
        let limit = self.config.max_payload_bytes as usize;
        if draft.payload.len() > limit {
            return Err(Error::Encode(FrameError::FieldTooLong {
                field: "payload",
                len: draft.payload.len(),
                limit,
            }));
        }

        let operation = draft.operation;
        let event = Event {
            sequence: self.next_sequence,
            timestamp_ms: self.clock.now_ms(),
            table: draft.table,
            key: if operation == Operation::DropTable { Vec::new() } else { draft.key },
            operation,
            payload: if operation.is_tombstone() { Vec::new() } else { draft.payload },
        };
        let frame = codec::encode(&event).map_err(Error::Encode)?;

        let offset = self.len;
        if let Err(err) = self.write_durably(offset, &frame) {
            self.poisoned = true;
            // Best effort; recovery on reopen is the real cleanup.
            let _ = self.file.set_len(offset);
            error!(offset, sequence = event.sequence, %err, "append failed, writer poisoned");
            return Err(Error::Io(err));
        }

        let len = frame.len() as u64;
        self.len += len;
        self.next_sequence += 1;
        self.reader.publish(self.len);
        trace!(
            sequence = event.sequence,
            table = %event.table,
            operation = %event.operation,
            offset,
            "appended"
        );
        Ok(AppendedEvent { event, offset, len })
    }

    /// Decodes the frame at `offset`.
    pub fn read_at(&self, offset: u64) -> Result<Event> {
        self.reader.read_at(offset).map(|frame| frame.event)
    }

    /// Scans from the first frame, yielding events with `sequence >= from_sequence`.
    pub fn scan(&self, from_sequence: Sequence) -> ScanIter {
        self.reader.scan(LOG_HEADER_LEN as u64, 1, from_sequence)
    }

    /// Shared read handle.
    pub fn reader(&self) -> &Arc<LogReader> {
        &self.reader
    }

    /// Sequence of the last committed event, `0` when empty.
    pub fn last_sequence(&self) -> Sequence {
        self.next_sequence - 1
    }

    /// Committed file length.
    pub fn len(&self) -> u64 {
        self.len
    }

    /// True when no event has been committed.
    pub fn is_empty(&self) -> bool {
        self.next_sequence == 1
    }

    /// True after a failed write until the next successful recovery.
    pub fn is_poisoned(&self) -> bool {
        self.poisoned
    }

    /// Path of the log file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn write_durably(&mut self, offset: u64, frame: &[u8]) -> io::Result<()> {
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(frame)?;
        match self.config.sync_mode {
            SyncMode::Data => self.file.sync_data(),
            SyncMode::Full => self.file.sync_all(),
        }
    }

    fn probe_frame(&self, offset: u64, file_len: u64, expected: Sequence) -> Result<Probe> {
        let remaining = file_len - offset;
        if remaining < FRAME_HEADER_LEN as u64 {
            return Ok(Probe::Torn(FrameError::Truncated {
                needed: FRAME_HEADER_LEN,
                available: remaining as usize,
            }));
        }

        let mut head = [0u8; FRAME_HEADER_LEN];
        read_exact_at(&self.file, &mut head, offset)?;
        let header = FrameHeader::parse(&head).map_err(|source| Error::CorruptFrame { offset, source })?;
        let len = header.frame_len();
        if len as u64 > remaining {
            let reason = FrameError::Truncated {
                needed: len,
                available: remaining as usize,
            };
            // A torn write carries its own sequence and nothing valid after it.
            let torn = if header.sequence == expected {
                !self.frame_follows(offset, file_len, expected + 1)?
            } else {
                self.rest_is_zeroed(offset, file_len)?
            };
            if !torn {
                error!(offset, %reason, "log integrity failure");
                return Err(Error::CorruptFrame { offset, source: reason });
            }
            return Ok(Probe::Torn(reason));
        }

        let mut buf = vec![0u8; len];
        read_exact_at(&self.file, &mut buf, offset)?;
        match codec::decode(&buf) {
            Ok(frame) => Ok(Probe::Valid(frame)),
            Err(reason @ FrameError::ChecksumMismatch { .. }) if offset + len as u64 == file_len => {
                Ok(Probe::Torn(reason))
            }
            Err(reason) if self.rest_is_zeroed(offset, file_len)? => Ok(Probe::Torn(reason)),
            Err(source) => {
                error!(offset, %source, "log integrity failure");
                Err(Error::CorruptFrame { offset, source })
            }
        }
    }

    // Looks for an intact frame carrying `sequence` anywhere after `offset`.
    // Reads in fixed chunks; consecutive chunks overlap so a sequence field
    // split across a chunk boundary is still seen.
    fn frame_follows(&self, offset: u64, file_len: u64, sequence: Sequence) -> Result<bool> {
        let needle = sequence.to_le_bytes();
        let overlap = needle.len() - 1;
        let mut chunk = vec![0u8; FOLLOW_SCAN_CHUNK];
        let mut pos = offset + 1;
        while pos + MIN_FRAME_LEN as u64 <= file_len {
            let n = ((file_len - pos) as usize).min(FOLLOW_SCAN_CHUNK);
            read_exact_at(&self.file, &mut chunk[..n], pos)?;
            for (at, window) in chunk[..n].windows(needle.len()).enumerate() {
                if window == needle && self.intact_frame_at(pos + at as u64, file_len, sequence)? {
                    return Ok(true);
                }
            }
            if pos + n as u64 >= file_len {
                break;
            }
            pos += (n - overlap) as u64;
        }
        Ok(false)
    }

    // Checksums the candidate incrementally; memory stays bounded by the
    // chunk size whatever length the candidate header claims.
    fn intact_frame_at(&self, pos: u64, file_len: u64, sequence: Sequence) -> Result<bool> {
        if file_len - pos < MIN_FRAME_LEN as u64 {
            return Ok(false);
        }
        let mut head = [0u8; FRAME_HEADER_LEN];
        read_exact_at(&self.file, &mut head, pos)?;
        let Ok(header) = FrameHeader::parse(&head) else {
            return Ok(false);
        };
        let len = header.frame_len() as u64;
        if header.sequence != sequence || Operation::from_tag(header.op_tag).is_none() || pos + len > file_len {
            return Ok(false);
        }

        let body_end = pos + len - FRAME_TRAILER_LEN as u64;
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&head);
        let mut buf = vec![0u8; FOLLOW_SCAN_CHUNK];
        let mut at = pos + FRAME_HEADER_LEN as u64;
        while at < body_end {
            let n = ((body_end - at) as usize).min(FOLLOW_SCAN_CHUNK);
            read_exact_at(&self.file, &mut buf[..n], at)?;
            hasher.update(&buf[..n]);
            at += n as u64;
        }
        let mut trailer = [0u8; FRAME_TRAILER_LEN];
        read_exact_at(&self.file, &mut trailer, body_end)?;
        Ok(u32::from_le_bytes(trailer) == hasher.finalize())
    }

    // Preallocated or zero-extended space after a crash reads as all zeros.
    fn rest_is_zeroed(&self, offset: u64, file_len: u64) -> Result<bool> {
        let mut pos = offset;
        let mut chunk = vec![0u8; ZERO_PROBE_CHUNK];
        while pos < file_len {
            let n = ((file_len - pos) as usize).min(ZERO_PROBE_CHUNK);
            read_exact_at(&self.file, &mut chunk[..n], pos)?;
            if chunk[..n].iter().any(|b| *b != 0) {
                return Ok(false);
            }
            pos += n as u64;
        }
        Ok(true)
    }
}
