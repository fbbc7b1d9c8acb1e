//! Shared read side of the log: positional frame reads and sequential scans.

use std::fs::File;
use std::io;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::{
    codec::{self, DecodedFrame, FRAME_HEADER_LEN, FrameError, FrameHeader},
    error::{Error, Result},
    event::Event,
    types::Sequence,
};

use super::header::LOG_HEADER_LEN;

/// Read handle over the committed prefix of a log file.
///
/// Readers never look past `committed_len`, which the writer only advances
/// after a whole frame, trailer included, has been synced.
#[derive(Debug)]
pub struct LogReader {
    file: File,
    committed_len: AtomicU64,
}

impl LogReader {
    pub(crate) fn open(path: &Path, committed_len: u64) -> Result<Self> {
        Ok(Self {
            file: File::open(path)?,
            committed_len: AtomicU64::new(committed_len),
        })
    }

    /// Byte length of the committed log, header included.
    pub fn committed_len(&self) -> u64 {
        self.committed_len.load(Ordering::Acquire)
    }

    pub(crate) fn publish(&self, len: u64) {
        self.committed_len.store(len, Ordering::Release);
    }

    /// Decodes the frame starting at `offset`.
    pub fn read_at(&self, offset: u64) -> Result<DecodedFrame> {
        let committed = self.committed_len();
        if offset < LOG_HEADER_LEN as u64 || offset.saturating_add(FRAME_HEADER_LEN as u64) > committed {
            return Err(Error::UnexpectedEndOfLog { offset });
        }

        let mut head = [0u8; FRAME_HEADER_LEN];
        read_exact_at(&self.file, &mut head, offset).map_err(|e| eof_to_end_of_log(e, offset))?;
        let header = FrameHeader::parse(&head).map_err(|source| Error::CorruptFrame { offset, source })?;

        let len = header.frame_len();
        let available = (committed - offset) as usize;
        if len > available {
            // A committed header that points past the committed end is damaged data.
            return Err(Error::CorruptFrame {
                offset,
                source: FrameError::Truncated { needed: len, available },
            });
        }

        let mut buf = vec![0u8; len];
        buf[..FRAME_HEADER_LEN].copy_from_slice(&head);
        read_exact_at(&self.file, &mut buf[FRAME_HEADER_LEN..], offset + FRAME_HEADER_LEN as u64)
            .map_err(|e| eof_to_end_of_log(e, offset))?;
        codec::decode(&buf).map_err(|source| Error::CorruptFrame { offset, source })
    }

    /// Scans events with `sequence >= from_sequence`, starting at `start_offset`.
    ///
    /// `start_offset` must be the offset of a frame whose sequence is
    /// `start_sequence`; use [`LOG_HEADER_LEN`] and `1` to scan from the beginning.
    /// The scan stops at the committed length observed now.
    pub fn scan(
        self: &Arc<Self>,
        start_offset: u64,
        start_sequence: Sequence,
        from_sequence: Sequence,
    ) -> ScanIter {
        ScanIter {
            reader: Arc::clone(self),
            offset: start_offset,
            end: self.committed_len(),
            expected: start_sequence,
            from_sequence,
            failed: false,
        }
    }
}

/// Lazy, finite iterator over committed events in sequence order.
///
/// Yields at most one error, after which it is exhausted.
#[derive(Debug)]
pub struct ScanIter {
    reader: Arc<LogReader>,
    offset: u64,
    end: u64,
    expected: Sequence,
    from_sequence: Sequence,
    failed: bool,
}

impl ScanIter {
    /// Offset of the next frame to be read.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    fn next_frame(&mut self) -> Result<Option<(u64, DecodedFrame)>> {
        if self.offset >= self.end {
            return Ok(None);
        }
        let offset = self.offset;
        let frame = self.reader.read_at(offset)?;
        if frame.event.sequence != self.expected {
            return Err(Error::CorruptFrame {
                offset,
                source: FrameError::SequenceGap {
                    expected: self.expected,
                    found: frame.event.sequence,
                },
            });
        }
        self.offset += frame.len as u64;
        self.expected += 1;
        Ok(Some((offset, frame)))
    }

    /// Like [`Iterator::next`] but also returns the frame offset and size.
    pub fn next_with_offset(&mut self) -> Option<Result<(u64, DecodedFrame)>> {
        if self.failed {
            return None;
        }
        loop {
            match self.next_frame() {
                Ok(Some((offset, frame))) => {
                    if frame.event.sequence < self.from_sequence {
                        continue;
                    }
                    return Some(Ok((offset, frame)));
                }
                Ok(None) => return None,
                Err(err) => {
                    self.failed = true;
                    return Some(Err(err));
                }
            }
        }
    }
}

impl Iterator for ScanIter {
    type Item = Result<Event>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_with_offset().map(|res| res.map(|(_, frame)| frame.event))
    }
}

fn eof_to_end_of_log(err: io::Error, offset: u64) -> Error {
    if err.kind() == io::ErrorKind::UnexpectedEof {
        Error::UnexpectedEndOfLog { offset }
    } else {
        Error::Io(err)
    }
}

#[cfg(unix)]
pub(crate) fn read_exact_at(file: &File, buf: &mut [u8], offset: u64) -> io::Result<()> {
    use std::os::unix::fs::FileExt;
    file.read_exact_at(buf, offset)
}

#[cfg(windows)]
pub(crate) fn read_exact_at(file: &File, mut buf: &mut [u8], mut offset: u64) -> io::Result<()> {
    use std::os::windows::fs::FileExt;
    while !buf.is_empty() {
        match file.seek_read(buf, offset) {
            Ok(0) => return Err(io::Error::from(io::ErrorKind::UnexpectedEof)),
            Ok(n) => {
                let rest = buf;
                buf = &mut rest[n..];
                offset += n as u64;
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}
