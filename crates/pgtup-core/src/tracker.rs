//! Cumulative counter → per-interval delta translation.
//!
//! `pg_stat_database` counters only grow, until someone calls
//! `pg_stat_reset()` (or the server crashes) and they restart from zero.
//! The tracker remembers the last cumulative value per database and metric
//! and turns every new observation into a non-negative delta:
//!
//! ```text
//! previous = last seen value (0 if never seen)
//! delta    = current - previous   if current >= previous
//!          = current              otherwise (reset: count since the reset)
//! ```
//!
//! The reset branch overstates the interval when the reset happened mid-way
//! through it. Published totals depend on this exact rule.

use std::collections::HashMap;

use crate::publisher::MetricSink;
use crate::source::TupleCounters;

/// Tracked counter of a database.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MetricKind {
    Inserted,
    Updated,
}

impl MetricKind {
    pub const ALL: [MetricKind; 2] = [MetricKind::Inserted, MetricKind::Updated];

    /// Metric name stem, without prefix or `_total` suffix.
    pub fn name(self) -> &'static str {
        match self {
            MetricKind::Inserted => "tup_inserted",
            MetricKind::Updated => "tup_updated",
        }
    }

    pub(crate) fn counter_help(self) -> &'static str {
        match self {
            MetricKind::Inserted => "Number of rows inserted by queries in this database",
            MetricKind::Updated => "Number of rows updated by queries in this database",
        }
    }

    pub(crate) fn gauge_help(self) -> &'static str {
        match self {
            MetricKind::Inserted => "Rows inserted in this database during the last sampling interval",
            MetricKind::Updated => "Rows updated in this database during the last sampling interval",
        }
    }

    /// Cumulative value of this metric in a snapshot row.
    pub fn value(self, row: &TupleCounters) -> u64 {
        match self {
            MetricKind::Inserted => row.tup_inserted,
            MetricKind::Updated => row.tup_updated,
        }
    }
}

/// Delta between two cumulative observations, treating a drop as a reset.
pub fn reset_aware_delta(current: u64, previous: u64) -> u64 {
    if current < previous {
        current
    } else {
        current - previous
    }
}

/// Deltas shipped for one database in one tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EntityDelta {
    pub inserted: u64,
    pub updated: u64,
}

impl EntityDelta {
    pub fn get(&self, kind: MetricKind) -> u64 {
        match kind {
            MetricKind::Inserted => self.inserted,
            MetricKind::Updated => self.updated,
        }
    }

    fn set(&mut self, kind: MetricKind, value: u64) {
        match kind {
            MetricKind::Inserted => self.inserted = value,
            MetricKind::Updated => self.updated = value,
        }
    }
}

/// Last observed cumulative values, keyed by `(datid, kind)`.
///
/// Owned by the driver; the scrape path never sees it. Databases that vanish
/// from the snapshot keep their entry until they come back.
#[derive(Debug, Default)]
pub struct DeltaTracker {
    observed: HashMap<(i64, MetricKind), u64>,
}

impl DeltaTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Applies one snapshot row: computes the deltas of every metric kind,
    /// stores the new cumulative values and publishes counter and gauge.
    ///
    /// Deltas are computed for all kinds before anything is stored, so the
    /// row is applied as a unit.
    pub fn observe(&mut self, row: &TupleCounters, sink: &dyn MetricSink) -> EntityDelta {
        let mut delta = EntityDelta::default();
        for kind in MetricKind::ALL {
            let previous = self.last_seen(row.datid, kind).unwrap_or(0);
            delta.set(kind, reset_aware_delta(kind.value(row), previous));
        }

        for kind in MetricKind::ALL {
            self.observed.insert((row.datid, kind), kind.value(row));
            let value = delta.get(kind);
            sink.add_counter(kind, row.datid, &row.datname, value);
            sink.set_gauge(kind, row.datid, &row.datname, value);
        }

        delta
    }

    /// Last cumulative value seen for a database, if any.
    pub fn last_seen(&self, datid: i64, kind: MetricKind) -> Option<u64> {
        self.observed.get(&(datid, kind)).copied()
    }

    /// Number of tracked databases.
    pub fn tracked_entities(&self) -> usize {
        self.observed.len() / MetricKind::ALL.len()
    }
}
