//! # Dispatcher
//!
//! Consumes batches from the handoff queue one at a time:
//!
//! 1. every record is shape-checked and routed; malformed records and
//!    tables without a handler are skipped and reported
//! 2. every routed record is submitted to the broker, awaiting acceptance
//! 3. only once the whole batch is accepted is its position saved
//!
//! A submission or checkpoint failure ends the dispatcher with an error and
//! leaves the previous checkpoint in place, so a restart replays the batch.

use crate::broker::{Job, SharedTaskBroker};
use crate::checkpoint::SharedPositionStore;
use crate::error::Result;
use crate::event::{Batch, ChangeRecord};
use crate::events::ProgressNotifier;
use crate::queue::BatchReceiver;
use crate::registry::Route;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Dispatcher counters
#[derive(Debug, Default)]
pub struct DispatcherStats {
    batches: AtomicU64,
    records: AtomicU64,
    skipped: AtomicU64,
    failures: AtomicU64,
}

impl DispatcherStats {
    pub fn snapshot(&self) -> DispatcherStatsSnapshot {
        DispatcherStatsSnapshot {
            batches: self.batches.load(Ordering::Relaxed),
            records: self.records.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`DispatcherStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatcherStatsSnapshot {
    /// Batches fully submitted and checkpointed
    pub batches: u64,
    /// Records accepted by the broker
    pub records: u64,
    /// Records dropped as malformed or unregistered
    pub skipped: u64,
    /// Fatal submission / checkpoint failures
    pub failures: u64,
}

pub struct Dispatcher {
    broker: SharedTaskBroker,
    store: SharedPositionStore,
    notifier: ProgressNotifier,
    stats: Arc<DispatcherStats>,
}

impl Dispatcher {
    pub fn new(
        broker: SharedTaskBroker,
        store: SharedPositionStore,
        notifier: ProgressNotifier,
    ) -> Self {
        Self {
            broker,
            store,
            notifier,
            stats: Arc::new(DispatcherStats::default()),
        }
    }

    pub fn stats(&self) -> Arc<DispatcherStats> {
        self.stats.clone()
    }

    /// Drain `queue` until every sender is gone. Once `close` turns true the
    /// queue stops accepting batches and what is already buffered is
    /// flushed.
    pub async fn run(&self, mut queue: BatchReceiver, mut close: watch::Receiver<bool>) -> Result<()> {
        let mut closed = *close.borrow();
        if closed {
            queue.close();
        }

        loop {
            let batch = if closed {
                queue.recv().await
            } else {
                tokio::select! {
                    batch = queue.recv() => batch,
                    changed = close.changed() => {
                        if changed.is_err() || *close.borrow() {
                            debug!("Closing handoff queue, {} batches buffered", queue.len());
                            queue.close();
                            closed = true;
                        }
                        continue;
                    }
                }
            };

            let Some(batch) = batch else {
                break;
            };
            self.dispatch(batch).await?;
        }

        info!("Dispatcher drained");
        Ok(())
    }

    /// Submit every record of `batch`, then checkpoint its position.
    pub async fn dispatch(&self, batch: Batch) -> Result<()> {
        let position = batch.position.clone();
        let total = batch.len();
        let mut submitted = 0;

        for record in batch.records {
            if let Some(job) = self.job_for(&record)? {
                let job_id = job.id;
                if let Err(e) = self.broker.submit(job).await {
                    self.stats.failures.fetch_add(1, Ordering::Relaxed);
                    error!(
                        category = ?e.category(),
                        "Submitting job {} for {} {} at {} failed: {}",
                        job_id, record.table, record.action, position, e
                    );
                    self.notifier
                        .error(&format!("submission failed at {}: {}", position, e));
                    return Err(e);
                }
                self.stats.records.fetch_add(1, Ordering::Relaxed);
                submitted += 1;
            }
        }

        if let Err(e) = self.store.save(&position).await {
            self.stats.failures.fetch_add(1, Ordering::Relaxed);
            error!(category = ?e.category(), "Saving checkpoint {} failed: {}", position, e);
            self.notifier
                .error(&format!("checkpoint failed at {}: {}", position, e));
            return Err(e);
        }

        self.stats.batches.fetch_add(1, Ordering::Relaxed);
        debug!(
            "Batch at {} dispatched ({} of {} records submitted)",
            position, submitted, total
        );
        self.notifier.batch_dispatched(&position, submitted);
        self.notifier.checkpoint_saved(&position);
        Ok(())
    }

    /// `None` when the record is skipped.
    fn job_for(&self, record: &ChangeRecord) -> Result<Option<Job>> {
        if let Err(e) = record.validate_shape() {
            self.skip(record, &e.to_string());
            return Ok(None);
        }

        match Route::of(record) {
            Route::Known { table, .. } => Ok(Some(Job::new(table.job_kind(), record)?)),
            Route::Unregistered(table) => {
                self.skip(record, &format!("no handler registered for table '{}'", table));
                Ok(None)
            }
        }
    }

    fn skip(&self, record: &ChangeRecord, reason: &str) {
        self.stats.skipped.fetch_add(1, Ordering::Relaxed);
        warn!(
            "Skipping {} on '{}' at {}: {}",
            record.action, record.table, record.position, reason
        );
        self.notifier
            .record_skipped(&record.table, &record.position, reason);
    }
}
