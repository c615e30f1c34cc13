//! pgtup-core — sampling and delta translation for the pgtup metrics agent.
//!
//! Provides:
//! - `source` — snapshot sources (`pg_stat_database`, in-memory mock)
//! - `tracker` — cumulative → per-interval delta translation with reset detection
//! - `publisher` — Prometheus counters/gauges and text exposition
//! - `driver` — the periodic sampling loop tying the three together

pub mod driver;
pub mod publisher;
pub mod source;
pub mod tracker;

pub use driver::{Driver, TickReport};
pub use publisher::{MetricSink, PublishError, Publisher};
pub use source::{SnapshotSource, SourceError, TupleCounters};
pub use tracker::{DeltaTracker, MetricKind};

/// Agent version: crate version plus short git SHA.
pub const VERSION: &str = concat!(env!("CARGO_PKG_VERSION"), " (", env!("PGTUP_GIT_SHA"), ")");
