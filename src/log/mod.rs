//! Durable append-only log of framed events.

/// Writer, recovery, and append outcomes.
pub mod event_log;
/// File header with magic and format version.
pub mod header;
/// Positional reads and scans over the committed prefix.
pub mod reader;

pub use event_log::{AppendedEvent, EventLog, RecoveryReport, TruncatedTail};
pub use header::{LOG_FORMAT_VERSION, LOG_HEADER_LEN, LogHeader};
pub use reader::{LogReader, ScanIter};
