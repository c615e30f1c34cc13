//! Periodic sampling loop.
//!
//! The driver owns the tracker state and is its only writer. Every tick it
//! sleeps for the interval, fetches a snapshot on the blocking pool, and
//! feeds each row through the tracker into the publisher. Ticks never
//! overlap: a tick completes before the next sleep starts.
//!
//! The fetch is bounded by `fetch_timeout` (never longer than the interval).
//! A timed-out fetch keeps running on its blocking thread until the database
//! gives up; while it holds the source, later ticks fail fast instead of
//! queueing behind it.

use std::sync::{Arc, Mutex, TryLockError};
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::publisher::{AgentErrorKind, Publisher};
use crate::source::{SnapshotRows, SnapshotSource, SourceError};
use crate::tracker::DeltaTracker;

type SharedSource = Arc<Mutex<Box<dyn SnapshotSource + Send>>>;

/// Outcome of a successful tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    /// Rows applied to the tracker.
    pub applied: usize,
    /// Undecodable rows skipped.
    pub skipped: usize,
}

/// Sampling loop: snapshot source → delta tracker → publisher.
pub struct Driver {
    source: SharedSource,
    tracker: DeltaTracker,
    publisher: Arc<Publisher>,
    interval: Duration,
    fetch_timeout: Duration,
}

impl Driver {
    /// Creates a driver sampling every `interval`. The fetch timeout defaults
    /// to the interval.
    pub fn new(
        source: impl SnapshotSource + Send + 'static,
        publisher: Arc<Publisher>,
        interval: Duration,
    ) -> Self {
        let source: Box<dyn SnapshotSource + Send> = Box::new(source);
        Self {
            source: Arc::new(Mutex::new(source)),
            tracker: DeltaTracker::new(),
            publisher,
            interval,
            fetch_timeout: interval,
        }
    }

    /// Sets the fetch timeout. Zero or anything above the interval falls
    /// back to the interval.
    pub fn with_fetch_timeout(mut self, timeout: Duration) -> Self {
        self.fetch_timeout = if timeout.is_zero() || timeout > self.interval {
            self.interval
        } else {
            timeout
        };
        self
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn fetch_timeout(&self) -> Duration {
        self.fetch_timeout
    }

    pub fn tracker(&self) -> &DeltaTracker {
        &self.tracker
    }

    /// Runs until `cancel` fires. Both the sleep and an in-flight fetch
    /// observe cancellation.
    pub async fn run(mut self, cancel: CancellationToken) {
        info!(
            interval_ms = self.interval.as_millis() as u64,
            fetch_timeout_ms = self.fetch_timeout.as_millis() as u64,
            "sampling loop started"
        );
        let mut tick_count: u64 = 0;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.interval) => {}
            }

            let t0 = Instant::now();
            let Some(result) = self.tick(&cancel).await else {
                break;
            };
            let elapsed = t0.elapsed();

            match result {
                Ok(report) => {
                    tick_count += 1;
                    if tick_count == 1 {
                        info!(
                            duration_ms = elapsed.as_millis() as u64,
                            databases = report.applied,
                            skipped = report.skipped,
                            "first snapshot applied"
                        );
                    } else {
                        debug!(
                            duration_ms = elapsed.as_millis() as u64,
                            databases = report.applied,
                            skipped = report.skipped,
                            tick_count,
                            "tick completed"
                        );
                    }
                }
                Err(e) => {
                    warn!(error = %e, "snapshot fetch failed, keeping last published values");
                }
            }

            if elapsed > self.interval / 2 {
                warn!(
                    duration_ms = elapsed.as_millis() as u64,
                    interval_ms = self.interval.as_millis() as u64,
                    "tick exceeded 50% of interval"
                );
            }
        }

        info!(ticks = tick_count, "sampling loop stopped");
    }

    /// Runs one tick without sleeping. Returns `None` if cancelled during
    /// the fetch; a failed fetch leaves tracker and publisher untouched.
    pub async fn tick(
        &mut self,
        cancel: &CancellationToken,
    ) -> Option<Result<TickReport, SourceError>> {
        let rows = match self.fetch(cancel).await? {
            Ok(rows) => rows,
            Err(e) => return Some(Err(e)),
        };
        Some(Ok(self.apply(rows)))
    }

    async fn fetch(
        &self,
        cancel: &CancellationToken,
    ) -> Option<Result<SnapshotRows, SourceError>> {
        let source = self.source.clone();
        let task = tokio::task::spawn_blocking(move || {
            let mut source = match source.try_lock() {
                Ok(guard) => guard,
                Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
                Err(TryLockError::WouldBlock) => {
                    return Err(SourceError::SourceUnavailable(
                        "previous fetch still in progress".to_string(),
                    ));
                }
            };
            source.fetch_snapshot()
        });

        let result = tokio::select! {
            _ = cancel.cancelled() => return None,
            res = tokio::time::timeout(self.fetch_timeout, task) => res,
        };

        let outcome = match result {
            Ok(Ok(fetched)) => fetched,
            Ok(Err(join_err)) => Err(SourceError::SourceUnavailable(format!(
                "fetch task failed: {join_err}"
            ))),
            Err(_) => {
                self.publisher.record_error(AgentErrorKind::Timeout);
                return Some(Err(SourceError::SourceUnavailable(format!(
                    "fetch timed out after {} ms",
                    self.fetch_timeout.as_millis()
                ))));
            }
        };

        if outcome.is_err() {
            self.publisher.record_error(AgentErrorKind::SourceUnavailable);
        }
        Some(outcome)
    }

    /// Undecodable rows are skipped; the rest of the snapshot is applied.
    fn apply(&mut self, rows: SnapshotRows) -> TickReport {
        let mut report = TickReport::default();
        for row in rows {
            match row {
                Ok(counters) => {
                    self.tracker.observe(&counters, self.publisher.as_ref());
                    report.applied += 1;
                }
                Err(e) => {
                    warn!(error = %e, "skipping undecodable pg_stat_database row");
                    self.publisher.record_error(AgentErrorKind::RowDecode);
                    report.skipped += 1;
                }
            }
        }
        self.publisher.record_tick();
        report
    }
}
