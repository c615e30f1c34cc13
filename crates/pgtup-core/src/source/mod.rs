//! Snapshot sources.
//!
//! A source produces the current cumulative tuple counters for every visible
//! database. Two implementations:
//! - [`PostgresSource`] — `pg_stat_database` over a blocking `postgres` client
//! - [`MockSource`] — scripted in-memory snapshots for tests

pub mod mock;
mod pg_database;

pub use mock::MockSource;
pub use pg_database::{PostgresSource, format_postgres_error};

use thiserror::Error;

/// One row of `pg_stat_database`: cumulative counters of a single database.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TupleCounters {
    pub datid: i64,
    pub datname: String,
    pub tup_inserted: u64,
    pub tup_updated: u64,
}

impl TupleCounters {
    pub fn new(datid: i64, datname: impl Into<String>, tup_inserted: u64, tup_updated: u64) -> Self {
        Self {
            datid,
            datname: datname.into(),
            tup_inserted,
            tup_updated,
        }
    }
}

/// Error type for snapshot collection.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SourceError {
    /// The connection to the monitored server could not be established.
    #[error("PostgreSQL connection failed: {0}")]
    ConnectionFailure(String),
    /// The snapshot query failed as a whole (transport, query or timeout).
    #[error("PostgreSQL query failed: {0}")]
    SourceUnavailable(String),
    /// A single row could not be decoded into [`TupleCounters`].
    #[error("cannot decode row (datid={datid:?}): {reason}")]
    RowDecode { datid: Option<i64>, reason: String },
}

/// Rows of one snapshot. Undecodable rows are kept as errors so the caller
/// can skip them without losing the rest of the snapshot.
pub type SnapshotRows = Vec<Result<TupleCounters, SourceError>>;

/// Source of cumulative per-database counters.
///
/// Implementations may block on I/O; the driver calls them off the async runtime.
pub trait SnapshotSource {
    /// Returns the current counters of every visible database.
    fn fetch_snapshot(&mut self) -> Result<SnapshotRows, SourceError>;
}

impl<S: SnapshotSource + ?Sized> SnapshotSource for Box<S> {
    fn fetch_snapshot(&mut self) -> Result<SnapshotRows, SourceError> {
        (**self).fetch_snapshot()
    }
}
