//! Prometheus publication of tuple counters.
//!
//! Per metric kind the publisher owns two families, labeled by
//! `datid` and `datname`:
//! - `<prefix>_tup_<kind>_total` — monotonic sum of shipped deltas
//! - `<prefix>_tup_<kind>` — delta of the most recent sampling interval
//!
//! Metric vectors synchronize internally (atomics), so the driver writes and
//! any number of scrapes read concurrently through a shared reference.

use prometheus::core::Collector;
use prometheus::proto::Metric;
use prometheus::{Encoder, IntCounter, IntCounterVec, IntGaugeVec, Opts, Registry, TextEncoder};
use thiserror::Error;

use crate::tracker::MetricKind;

const ENTITY_LABELS: [&str; 2] = ["datid", "datname"];

/// Destination of tracker output.
pub trait MetricSink {
    /// Adds `delta` to the monotonic counter of a database.
    fn add_counter(&self, kind: MetricKind, datid: i64, datname: &str, delta: u64);

    /// Sets the last-interval gauge of a database.
    fn set_gauge(&self, kind: MetricKind, datid: i64, datname: &str, value: u64);
}

/// Error type for metric registration and exposition.
#[derive(Debug, Error)]
pub enum PublishError {
    #[error("invalid metric prefix {0:?}")]
    InvalidPrefix(String),
    #[error("metrics registry error: {0}")]
    Registry(#[from] prometheus::Error),
    #[error("metrics output is not valid UTF-8: {0}")]
    Encoding(#[from] std::string::FromUtf8Error),
}

/// Failure classes counted by `<prefix>_agent_errors_total`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentErrorKind {
    SourceUnavailable,
    RowDecode,
    Timeout,
}

impl AgentErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            AgentErrorKind::SourceUnavailable => "source_unavailable",
            AgentErrorKind::RowDecode => "row_decode",
            AgentErrorKind::Timeout => "timeout",
        }
    }
}

struct KindMetrics {
    total: IntCounterVec,
    last: IntGaugeVec,
}

impl KindMetrics {
    fn register(registry: &Registry, kind: MetricKind) -> Result<Self, PublishError> {
        let total = IntCounterVec::new(
            Opts::new(format!("{}_total", kind.name()), kind.counter_help()),
            &ENTITY_LABELS,
        )?;
        let last = IntGaugeVec::new(Opts::new(kind.name(), kind.gauge_help()), &ENTITY_LABELS)?;
        registry.register(Box::new(total.clone()))?;
        registry.register(Box::new(last.clone()))?;
        Ok(Self { total, last })
    }
}

/// Prometheus registry holding every metric the agent exposes.
pub struct Publisher {
    registry: Registry,
    inserted: KindMetrics,
    updated: KindMetrics,
    ticks_total: IntCounter,
    errors_total: IntCounterVec,
}

impl Publisher {
    /// Creates the registry with all metric names prefixed by `prefix`.
    pub fn new(prefix: &str) -> Result<Self, PublishError> {
        if !is_valid_prefix(prefix) {
            return Err(PublishError::InvalidPrefix(prefix.to_string()));
        }
        let registry = Registry::new_custom(Some(prefix.to_string()), None)?;

        let inserted = KindMetrics::register(&registry, MetricKind::Inserted)?;
        let updated = KindMetrics::register(&registry, MetricKind::Updated)?;

        let ticks_total = IntCounter::new(
            "agent_ticks_total",
            "Sampling ticks that fetched a snapshot successfully",
        )?;
        registry.register(Box::new(ticks_total.clone()))?;

        let errors_total = IntCounterVec::new(
            Opts::new("agent_errors_total", "Sampling failures by kind"),
            &["kind"],
        )?;
        registry.register(Box::new(errors_total.clone()))?;

        Ok(Self {
            registry,
            inserted,
            updated,
            ticks_total,
            errors_total,
        })
    }

    fn metrics(&self, kind: MetricKind) -> &KindMetrics {
        match kind {
            MetricKind::Inserted => &self.inserted,
            MetricKind::Updated => &self.updated,
        }
    }

    pub fn record_tick(&self) {
        self.ticks_total.inc();
    }

    pub fn record_error(&self, kind: AgentErrorKind) {
        self.errors_total.with_label_values(&[kind.as_str()]).inc();
    }

    /// Renders every metric in the Prometheus text exposition format.
    pub fn render(&self) -> Result<String, PublishError> {
        let families = self.registry.gather();
        let mut buf = Vec::new();
        TextEncoder::new().encode(&families, &mut buf)?;
        Ok(String::from_utf8(buf)?)
    }

    /// Content type matching [`Publisher::render`].
    pub fn content_type(&self) -> &'static str {
        prometheus::TEXT_FORMAT
    }

    /// Current counter total of a database; `None` if never published.
    pub fn counter_value(&self, kind: MetricKind, datid: i64) -> Option<u64> {
        find_series(&self.metrics(kind).total, datid).map(|m| m.get_counter().get_value() as u64)
    }

    /// Current gauge value of a database; `None` if never published.
    pub fn gauge_value(&self, kind: MetricKind, datid: i64) -> Option<u64> {
        find_series(&self.metrics(kind).last, datid).map(|m| m.get_gauge().get_value() as u64)
    }
}

impl MetricSink for Publisher {
    fn add_counter(&self, kind: MetricKind, datid: i64, datname: &str, delta: u64) {
        let datid = datid.to_string();
        self.metrics(kind)
            .total
            .with_label_values(&[datid.as_str(), datname])
            .inc_by(delta);
    }

    fn set_gauge(&self, kind: MetricKind, datid: i64, datname: &str, value: u64) {
        let datid = datid.to_string();
        self.metrics(kind)
            .last
            .with_label_values(&[datid.as_str(), datname])
            .set(i64::try_from(value).unwrap_or(i64::MAX));
    }
}

/// Looks a series up without creating it (unlike `get_metric_with_label_values`).
fn find_series(collector: &dyn Collector, datid: i64) -> Option<Metric> {
    let datid = datid.to_string();
    collector
        .collect()
        .into_iter()
        .flat_map(|family| family.get_metric().to_vec())
        .find(|metric| {
            metric
                .get_label()
                .iter()
                .any(|label| label.get_name() == "datid" && label.get_value() == datid)
        })
}

fn is_valid_prefix(prefix: &str) -> bool {
    let mut chars = prefix.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' || c == ':' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == ':')
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::TupleCounters;
    use crate::tracker::DeltaTracker;

    #[test]
    fn renders_prefixed_metric_names() {
        let publisher = Publisher::new("pg").unwrap();
        publisher.add_counter(MetricKind::Inserted, 16384, "app", 100);
        publisher.set_gauge(MetricKind::Inserted, 16384, "app", 100);
        publisher.add_counter(MetricKind::Updated, 16384, "app", 3);
        publisher.set_gauge(MetricKind::Updated, 16384, "app", 3);

        let text = publisher.render().unwrap();
        assert!(text.contains("# TYPE pg_tup_inserted_total counter"), "{text}");
        assert!(text.contains("# TYPE pg_tup_inserted gauge"), "{text}");
        assert!(text.contains("# TYPE pg_tup_updated_total counter"), "{text}");
        assert!(text.contains("# TYPE pg_tup_updated gauge"), "{text}");
        assert!(text.contains(r#"pg_tup_inserted_total{datid="16384",datname="app"} 100"#), "{text}");
        assert!(text.contains(r#"pg_tup_updated{datid="16384",datname="app"} 3"#), "{text}");
    }

    #[test]
    fn custom_prefix_is_applied() {
        let publisher = Publisher::new("db_agent").unwrap();
        publisher.add_counter(MetricKind::Updated, 1, "x", 1);
        let text = publisher.render().unwrap();
        assert!(text.contains("db_agent_tup_updated_total"), "{text}");
    }

    #[test]
    fn rejects_invalid_prefix() {
        assert!(matches!(Publisher::new(""), Err(PublishError::InvalidPrefix(_))));
        assert!(matches!(Publisher::new("9pg"), Err(PublishError::InvalidPrefix(_))));
        assert!(matches!(Publisher::new("pg-prod"), Err(PublishError::InvalidPrefix(_))));
    }

    #[test]
    fn value_lookup_does_not_create_series() {
        let publisher = Publisher::new("pg").unwrap();
        assert_eq!(publisher.counter_value(MetricKind::Inserted, 1), None);
        assert_eq!(publisher.gauge_value(MetricKind::Inserted, 1), None);
        assert!(!publisher.render().unwrap().contains("datid=\"1\""));
    }

    #[test]
    fn tracker_output_through_publisher() {
        let publisher = Publisher::new("pg").unwrap();
        let mut tracker = DeltaTracker::new();
        for v in [100, 150, 30, 80] {
            tracker.observe(&TupleCounters::new(7, "app", v, 0), &publisher);
        }
        assert_eq!(publisher.counter_value(MetricKind::Inserted, 7), Some(230));
        assert_eq!(publisher.gauge_value(MetricKind::Inserted, 7), Some(50));
        assert_eq!(publisher.counter_value(MetricKind::Updated, 7), Some(0));
        assert_eq!(publisher.gauge_value(MetricKind::Updated, 7), Some(0));
    }

    #[test]
    fn agent_counters_are_exposed() {
        let publisher = Publisher::new("pg").unwrap();
        publisher.record_tick();
        publisher.record_error(AgentErrorKind::Timeout);
        let text = publisher.render().unwrap();
        assert!(text.contains("pg_agent_ticks_total 1"), "{text}");
        assert!(text.contains(r#"pg_agent_errors_total{kind="timeout"} 1"#), "{text}");
    }
}
