//! Time-travel query resolution: normalize a time bound to a sequence, then
//! hand the work to the projector.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDateTime};
use tracing::warn;

use crate::{
    core::indices::SequenceIndex,
    error::{Error, Result},
    event::Row,
    persist::{SnapshotStore, TableSnapshot},
    types::{Sequence, TimestampMs},
};

use super::{
    projector::{PlannedRow, TableProjector, fetch_all},
    traits::EventSource,
};

const NAIVE_FORMATS: [&str; 2] = ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"];

/// Point in the log a query reads as of.
///
/// Sequence bounds are exact. Timestamp bounds are best effort: event
/// timestamps come from the wall clock and may go backwards, while sequence
/// order is always authoritative.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TimeBound {
    /// Current state.
    #[default]
    Latest,
    /// Every event with `sequence <= N`. `0` is the empty state.
    Sequence(Sequence),
    /// Every event up to the last one stamped at or before this time.
    Timestamp(TimestampMs),
}

impl fmt::Display for TimeBound {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Latest => f.write_str("latest"),
            Self::Sequence(seq) => write!(f, "@seq:{seq}"),
            Self::Timestamp(ts) => write!(f, "@ts:{ts}"),
        }
    }
}

/// Accepts `@seq:N`, `@ts:MILLIS`, `latest`, `now`, RFC 3339 date-times, and
/// offset-less `YYYY-MM-DD HH:MM:SS[.fff]` (or with `T`) read as UTC.
impl FromStr for TimeBound {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        if s.eq_ignore_ascii_case("latest") || s.eq_ignore_ascii_case("now") {
            return Ok(Self::Latest);
        }
        if let Some(n) = s.strip_prefix("@seq:") {
            return n
                .trim()
                .parse()
                .map(Self::Sequence)
                .map_err(|_| Error::InvalidTimeBound(format!("bad sequence in {s:?}")));
        }
        if let Some(ms) = s.strip_prefix("@ts:") {
            return ms
                .trim()
                .parse()
                .map(Self::Timestamp)
                .map_err(|_| Error::InvalidTimeBound(format!("bad millisecond timestamp in {s:?}")));
        }

        let millis = match DateTime::parse_from_rfc3339(s) {
            Ok(dt) => dt.timestamp_millis(),
            Err(_) => NAIVE_FORMATS
                .iter()
                .find_map(|fmt| NaiveDateTime::parse_from_str(s, fmt).ok())
                .map(|naive| naive.and_utc().timestamp_millis())
                .ok_or_else(|| Error::InvalidTimeBound(format!("unrecognized time bound {s:?}")))?,
        };
        TimestampMs::try_from(millis)
            .map(Self::Timestamp)
            .map_err(|_| Error::InvalidTimeBound(format!("{s:?} is before the Unix epoch")))
    }
}

/// Which keys a query returns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyFilter {
    /// One key.
    Key(Vec<u8>),
    /// Any of these keys.
    Keys(BTreeSet<Vec<u8>>),
    /// Keys starting with these bytes.
    Prefix(Vec<u8>),
}

/// A time-travel read of one table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Query {
    /// Table name.
    pub table: String,
    /// `None` reads the whole table.
    pub key_filter: Option<KeyFilter>,
    /// Point in the log to read as of.
    pub bound: TimeBound,
    /// Return soft-deleted and dropped rows tagged as deleted.
    pub include_deleted: bool,
}

impl Query {
    /// Whole-table query at the latest state.
    pub fn table(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            key_filter: None,
            bound: TimeBound::Latest,
            include_deleted: false,
        }
    }

    /// Restricts to one key.
    pub fn key(mut self, key: impl AsRef<[u8]>) -> Self {
        self.key_filter = Some(KeyFilter::Key(key.as_ref().to_vec()));
        self
    }

    /// Restricts to a set of keys.
    pub fn keys<K: AsRef<[u8]>>(mut self, keys: impl IntoIterator<Item = K>) -> Self {
        let keys = keys.into_iter().map(|k| k.as_ref().to_vec()).collect();
        self.key_filter = Some(KeyFilter::Keys(keys));
        self
    }

    /// Restricts to keys with a byte prefix.
    pub fn prefix(mut self, prefix: impl AsRef<[u8]>) -> Self {
        self.key_filter = Some(KeyFilter::Prefix(prefix.as_ref().to_vec()));
        self
    }

    /// Sets the time bound.
    pub fn as_of(mut self, bound: TimeBound) -> Self {
        self.bound = bound;
        self
    }

    /// Includes deleted rows.
    pub fn include_deleted(mut self, include: bool) -> Self {
        self.include_deleted = include;
        self
    }
}

/// Rows of a query and the sequence they were resolved at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryResult {
    /// Sequence the time bound normalized to.
    pub sequence: Sequence,
    /// Matching rows ordered by key bytes.
    pub rows: Vec<Row>,
}

/// A query resolved against in-memory state, payloads not yet read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryPlan {
    /// Sequence the time bound normalized to.
    pub sequence: Sequence,
    /// Planned rows ordered by key bytes.
    pub rows: Vec<PlannedRow>,
}

impl QueryPlan {
    /// Reads outstanding payloads from `source`.
    pub fn fetch<S: EventSource + ?Sized>(self, source: &S) -> Result<QueryResult> {
        Ok(QueryResult {
            sequence: self.sequence,
            rows: fetch_all(self.rows, source)?,
        })
    }
}

/// Coordination layer over the index and projector. Holds no state.
///
/// Work is split so callers can hold their lock on the derived state only
/// while planning: [`QueryResolver::resolve_bound`] and
/// [`QueryResolver::plan`] touch memory only, and the returned
/// [`QueryPlan`] reads the log afterwards.
pub struct QueryResolver<'a> {
    index: &'a SequenceIndex,
    projector: &'a TableProjector,
    exact_timestamps: bool,
}

impl<'a> QueryResolver<'a> {
    /// Borrows the derived state.
    pub fn new(index: &'a SequenceIndex, projector: &'a TableProjector) -> Self {
        Self {
            index,
            projector,
            exact_timestamps: false,
        }
    }

    /// Resolves timestamps by linear scan when the index has seen clock skew.
    pub fn exact_timestamps(mut self, exact: bool) -> Self {
        self.exact_timestamps = exact;
        self
    }

    /// Normalizes `bound` to a sequence number.
    ///
    /// Fails with [`Error::SequenceNotFound`] for sequences past the end of
    /// the log and with [`Error::InvalidTimeBound`] for timestamps before the
    /// first event.
    pub fn resolve_bound(&self, bound: TimeBound) -> Result<Sequence> {
        let last = self.index.last_sequence();
        match bound {
            TimeBound::Latest => Ok(last),
            TimeBound::Sequence(seq) if seq > last => Err(Error::SequenceNotFound(seq)),
            TimeBound::Sequence(seq) => Ok(seq),
            TimeBound::Timestamp(ts) => {
                let found = if self.exact_timestamps && self.index.has_clock_skew() {
                    self.index.sequence_at_or_before_exact(ts)
                } else {
                    self.index.sequence_at_or_before(ts)
                };
                found.ok_or_else(|| match self.index.first_timestamp() {
                    Some(first) => {
                        Error::InvalidTimeBound(format!("@ts:{ts} is before the first event (@ts:{first})"))
                    }
                    None => Error::InvalidTimeBound(format!("@ts:{ts}: the log is empty")),
                })
            }
        }
    }

    /// True when `query` at `sequence` rebuilds a whole table from history,
    /// the only case a snapshot base can shorten.
    pub fn wants_snapshot(&self, query: &Query, sequence: Sequence) -> bool {
        query.key_filter.is_none() && sequence < self.projector.applied_through()
    }

    /// Plans `query` at an already resolved `sequence`.
    ///
    /// `base` seeds historical table reads; it is ignored when unusable.
    pub fn plan(&self, query: &Query, sequence: Sequence, base: Option<&TableSnapshot>) -> QueryPlan {
        let table = query.table.as_str();
        let include_deleted = query.include_deleted;
        let row = |key: &[u8]| {
            self.projector
                .plan_state(self.index, table, key, sequence, include_deleted)
        };

        let rows = match &query.key_filter {
            None => self
                .projector
                .plan_table(self.index, table, sequence, include_deleted, base),
            Some(KeyFilter::Key(key)) => row(key.as_slice()).into_iter().collect(),
            Some(KeyFilter::Keys(keys)) => keys.iter().filter_map(|key| row(key.as_slice())).collect(),
            Some(KeyFilter::Prefix(prefix)) => self
                .index
                .keys_with_prefix(table, prefix)
                .filter_map(|key| row(key))
                .collect(),
        };

        QueryPlan { sequence, rows }
    }

    /// Runs `query` in one step with full replay for historical table reads.
    pub fn query<S: EventSource + ?Sized>(&self, query: &Query, source: &S) -> Result<QueryResult> {
        let sequence = self.resolve_bound(query.bound)?;
        self.plan(query, sequence, None).fetch(source)
    }
}

/// Newest snapshot of `table` at or before `sequence`.
///
/// Snapshots are derived data: a failed lookup is logged and the read falls
/// back to full replay.
pub fn snapshot_base(store: &dyn SnapshotStore, table: &str, sequence: Sequence) -> Option<TableSnapshot> {
    match store.latest_at_or_before(table, sequence) {
        Ok(found) => found,
        Err(err) => {
            warn!(table, sequence, %err, "snapshot lookup failed, replaying from the log");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_time_bound_expressions() {
        assert_eq!("@seq:42".parse::<TimeBound>().unwrap(), TimeBound::Sequence(42));
        assert_eq!(" latest ".parse::<TimeBound>().unwrap(), TimeBound::Latest);
        assert_eq!("NOW".parse::<TimeBound>().unwrap(), TimeBound::Latest);
        assert_eq!("@ts:1500".parse::<TimeBound>().unwrap(), TimeBound::Timestamp(1500));
        assert_eq!(
            "1970-01-01T00:00:01.250Z".parse::<TimeBound>().unwrap(),
            TimeBound::Timestamp(1250)
        );
        assert_eq!(
            "1970-01-01T01:00:02+01:00".parse::<TimeBound>().unwrap(),
            TimeBound::Timestamp(2000)
        );
        assert_eq!(
            "1970-01-01 00:00:03".parse::<TimeBound>().unwrap(),
            TimeBound::Timestamp(3000)
        );
        assert_eq!(
            "1970-01-01T00:00:03.5".parse::<TimeBound>().unwrap(),
            TimeBound::Timestamp(3500)
        );
    }

    #[test]
    fn rejects_malformed_and_pre_epoch_bounds() {
        for bad in ["@seq:", "@seq:-1", "@ts:abc", "yesterday", "1969-12-31T23:59:59Z"] {
            assert!(
                matches!(bad.parse::<TimeBound>(), Err(Error::InvalidTimeBound(_))),
                "{bad} should not parse"
            );
        }
    }

    #[test]
    fn display_round_trips_through_parse() {
        for bound in [TimeBound::Latest, TimeBound::Sequence(7), TimeBound::Timestamp(99)] {
            assert_eq!(bound.to_string().parse::<TimeBound>().unwrap(), bound);
        }
    }
}
