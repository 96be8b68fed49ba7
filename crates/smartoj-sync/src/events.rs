//! # Progress events
//!
//! Structured lifecycle and progress events for the sync pipeline.
//!
//! Every event is fanned out over a broadcast channel (so operators and
//! tests can subscribe) and also logged at a level derived from its
//! severity.
//!
//! ```rust,ignore
//! let notifier = ProgressNotifier::new("smartoj-sync");
//! let mut rx = notifier.subscribe();
//! notifier.checkpoint_saved(&position);
//! let event = rx.recv().await?;
//! ```

use crate::event::BinlogPosition;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Progress event kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProgressKind {
    /// Pipeline lifecycle state changed
    StateChanged,
    /// Reader thread connected and streaming
    ReaderStarted,
    /// Reader thread exited
    ReaderStopped,
    /// Every record of a batch was accepted by the broker
    BatchDispatched,
    /// A record was skipped (unregistered table, malformed shape)
    RecordSkipped,
    /// Binlog position persisted
    CheckpointSaved,
    /// Fatal error
    Error,
}

/// Event severity level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// Informational
    #[default]
    Info,
    /// May require attention
    Warning,
    /// Requires immediate attention
    Error,
}

/// A progress event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressEvent {
    /// Unique event ID
    pub id: String,
    /// Event kind
    pub kind: ProgressKind,
    /// Pipeline name
    pub pipeline: String,
    /// Severity level
    pub severity: Severity,
    /// Human-readable message
    pub message: String,
    /// Binlog position the event refers to
    #[serde(skip_serializing_if = "Option::is_none")]
    pub position: Option<BinlogPosition>,
    /// Table the event refers to
    #[serde(skip_serializing_if = "Option::is_none")]
    pub table: Option<String>,
    /// Timestamp (epoch millis)
    pub timestamp: i64,
}

impl ProgressEvent {
    /// Create a new event.
    pub fn new(kind: ProgressKind, pipeline: &str, message: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            kind,
            pipeline: pipeline.to_string(),
            severity: Severity::Info,
            message: message.into(),
            position: None,
            table: None,
            timestamp: chrono::Utc::now().timestamp_millis(),
        }
    }

    /// Set severity.
    pub fn with_severity(mut self, severity: Severity) -> Self {
        self.severity = severity;
        self
    }

    /// Set position.
    pub fn with_position(mut self, position: &BinlogPosition) -> Self {
        self.position = Some(position.clone());
        self
    }

    /// Set table.
    pub fn with_table(mut self, table: &str) -> Self {
        self.table = Some(table.to_string());
        self
    }
}

/// Event counters.
#[derive(Debug, Default)]
pub struct ProgressStats {
    total_sent: AtomicU64,
    errors: AtomicU64,
    dropped: AtomicU64,
}

impl ProgressStats {
    fn record(&self, event: &ProgressEvent, dropped: bool) {
        self.total_sent.fetch_add(1, Ordering::Relaxed);
        if event.severity == Severity::Error {
            self.errors.fetch_add(1, Ordering::Relaxed);
        }
        if dropped {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Get total sent.
    pub fn total_sent(&self) -> u64 {
        self.total_sent.load(Ordering::Relaxed)
    }

    /// Get error event count.
    pub fn errors(&self) -> u64 {
        self.errors.load(Ordering::Relaxed)
    }

    /// Get count of events nobody was subscribed to.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Broadcast channel for progress events.
#[derive(Clone)]
pub struct ProgressNotifier {
    sender: broadcast::Sender<ProgressEvent>,
    stats: Arc<ProgressStats>,
    pipeline: String,
}

impl ProgressNotifier {
    /// Create a new notifier.
    pub fn new(pipeline: &str) -> Self {
        Self::with_capacity(pipeline, 256)
    }

    /// Create a new notifier with custom buffer size.
    pub fn with_capacity(pipeline: &str, capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            stats: Arc::new(ProgressStats::default()),
            pipeline: pipeline.to_string(),
        }
    }

    /// Get statistics.
    pub fn stats(&self) -> &Arc<ProgressStats> {
        &self.stats
    }

    /// Subscribe to events.
    pub fn subscribe(&self) -> broadcast::Receiver<ProgressEvent> {
        self.sender.subscribe()
    }

    /// Send an event.
    pub fn notify(&self, event: ProgressEvent) {
        match event.severity {
            Severity::Error => error!(
                event_id = %event.id,
                kind = ?event.kind,
                pipeline = %event.pipeline,
                "{}",
                event.message
            ),
            Severity::Warning => warn!(
                event_id = %event.id,
                kind = ?event.kind,
                pipeline = %event.pipeline,
                "{}",
                event.message
            ),
            Severity::Info => info!(
                event_id = %event.id,
                kind = ?event.kind,
                pipeline = %event.pipeline,
                "{}",
                event.message
            ),
        }

        let id = event.id.clone();
        let dropped = self.sender.send(event.clone()).is_err();
        self.stats.record(&event, dropped);
        if dropped {
            debug!("Progress event dropped (no subscribers): {}", id);
        }
    }

    fn event(&self, kind: ProgressKind, message: impl Into<String>) -> ProgressEvent {
        ProgressEvent::new(kind, &self.pipeline, message)
    }

    /// Pipeline state transition.
    pub fn state_changed(&self, from: &str, to: &str) {
        self.notify(self.event(
            ProgressKind::StateChanged,
            format!("Pipeline state {} -> {}", from, to),
        ));
    }

    /// Reader streaming from a position.
    pub fn reader_started(&self, position: &BinlogPosition) {
        self.notify(
            self.event(
                ProgressKind::ReaderStarted,
                format!("Reader streaming from {}", position),
            )
            .with_position(position),
        );
    }

    /// Reader exited; `clean` is false when it died on an error.
    pub fn reader_stopped(&self, reason: &str, clean: bool) {
        let severity = if clean {
            Severity::Info
        } else {
            Severity::Warning
        };
        self.notify(
            self.event(
                ProgressKind::ReaderStopped,
                format!("Reader stopped: {}", reason),
            )
            .with_severity(severity),
        );
    }

    /// Batch fully accepted by the broker.
    pub fn batch_dispatched(&self, position: &BinlogPosition, records: usize) {
        self.notify(
            self.event(
                ProgressKind::BatchDispatched,
                format!("Dispatched {} record(s) at {}", records, position),
            )
            .with_position(position),
        );
    }

    /// Record skipped without failing the batch.
    pub fn record_skipped(&self, table: &str, position: &BinlogPosition, reason: &str) {
        self.notify(
            self.event(
                ProgressKind::RecordSkipped,
                format!("Skipped record from {}: {}", table, reason),
            )
            .with_severity(Severity::Warning)
            .with_table(table)
            .with_position(position),
        );
    }

    /// Checkpoint persisted.
    pub fn checkpoint_saved(&self, position: &BinlogPosition) {
        self.notify(
            self.event(
                ProgressKind::CheckpointSaved,
                format!("Checkpoint saved at {}", position),
            )
            .with_position(position),
        );
    }

    /// Fatal error.
    pub fn error(&self, message: &str) {
        self.notify(
            self.event(ProgressKind::Error, message)
                .with_severity(Severity::Error),
        );
    }
}
