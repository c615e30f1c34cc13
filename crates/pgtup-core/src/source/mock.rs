//! In-memory snapshot source for testing the tracker and driver without a
//! running PostgreSQL server.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use super::{SnapshotRows, SnapshotSource, SourceError, TupleCounters};

/// Scripted snapshot source.
///
/// Each fetch pops the next scripted result. Once the script is exhausted the
/// last successful snapshot is repeated, like a server with no new activity.
#[derive(Debug, Clone, Default)]
pub struct MockSource {
    script: VecDeque<Result<SnapshotRows, SourceError>>,
    last: SnapshotRows,
    fetches: Arc<AtomicUsize>,
}

impl MockSource {
    /// Creates an empty mock source.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a snapshot where every row decodes successfully.
    pub fn push_snapshot(&mut self, rows: impl IntoIterator<Item = TupleCounters>) -> &mut Self {
        self.script
            .push_back(Ok(rows.into_iter().map(Ok).collect()));
        self
    }

    /// Appends a snapshot that may contain undecodable rows.
    pub fn push_rows(&mut self, rows: SnapshotRows) -> &mut Self {
        self.script.push_back(Ok(rows));
        self
    }

    /// Appends a failed fetch.
    pub fn push_error(&mut self, error: SourceError) -> &mut Self {
        self.script.push_back(Err(error));
        self
    }

    /// Shared counter of fetch calls, readable after the source is moved
    /// into a driver.
    pub fn fetch_counter(&self) -> Arc<AtomicUsize> {
        self.fetches.clone()
    }

    /// Cumulative series for a single database: one snapshot per value pair.
    pub fn series(datid: i64, datname: &str, values: &[(u64, u64)]) -> Self {
        let mut source = Self::new();
        for &(inserted, updated) in values {
            source.push_snapshot([TupleCounters::new(datid, datname, inserted, updated)]);
        }
        source
    }
}

impl SnapshotSource for MockSource {
    fn fetch_snapshot(&mut self) -> Result<SnapshotRows, SourceError> {
        self.fetches.fetch_add(1, Ordering::Relaxed);
        match self.script.pop_front() {
            Some(Ok(rows)) => {
                self.last = rows.clone();
                Ok(rows)
            }
            Some(Err(e)) => Err(e),
            None => Ok(self.last.clone()),
        }
    }
}
