//! Shared fixtures for the integration tests
//!
//! Everything runs against the in-memory collaborators, so no MySQL or
//! Elasticsearch is needed.

#![allow(dead_code)]

use async_trait::async_trait;
use smartoj_sync::{
    broker::{Job, TaskBroker},
    directory::MemoryDirectory,
    event::{Batch, BinlogPosition, ChangeRecord, Row, Scalar},
    handlers::{HandlerOutcome, HandlerRegistry},
    index::{IndexDocument, MemoryIndex},
    notification_store::MemoryNotificationStore,
    registry::Route,
    Result, SyncError,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Once};

static INIT: Once = Once::new();

pub fn init_test_logging() {
    INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::from_default_env()
                    .add_directive("smartoj_sync=debug".parse().unwrap()),
            )
            .with_test_writer()
            .try_init()
            .ok();
    });
}

// ============================================================================
// Rows and records
// ============================================================================

pub const BINLOG: &str = "binlog.000001";

pub fn pos(offset: u64) -> BinlogPosition {
    BinlogPosition::new(BINLOG, offset)
}

pub fn question_row(id: i64, title: &str, deleted: bool) -> Row {
    Row::new()
        .with("id", id)
        .with("title", title)
        .with("description", format!("description of {}", title))
        .with("difficulty", "easy")
        .with("submission_quantity", 0i64)
        .with("pass_quantity", 0i64)
        .with("is_deleted", Scalar::Int(i64::from(deleted)))
}

pub fn link_row(id: i64, question_id: i64, tag_id: i64) -> Row {
    Row::new()
        .with("id", id)
        .with("question_id", question_id)
        .with("tag_id", tag_id)
}

pub fn tag_row(id: i64, name: &str) -> Row {
    Row::new().with("id", id).with("name", name)
}

pub fn comment_row(id: i64, user_id: i64, to_comment_id: Option<i64>, content: &str) -> Row {
    Row::new()
        .with("id", id)
        .with("question_id", 42i64)
        .with("user_id", user_id)
        .with("content", content)
        .with("to_comment_id", to_comment_id.map_or(Scalar::Null, Scalar::Int))
        .with("is_deleted", Scalar::Int(0))
}

pub fn insert_question(id: i64, title: &str, offset: u64) -> ChangeRecord {
    ChangeRecord::insert("question", question_row(id, title, false), pos(offset))
}

pub fn retitle_question(id: i64, from: &str, to: &str, offset: u64) -> ChangeRecord {
    ChangeRecord::update(
        "question",
        question_row(id, from, false),
        question_row(id, to, false),
        pos(offset),
    )
}

pub fn delete_question(id: i64, title: &str, offset: u64) -> ChangeRecord {
    ChangeRecord::delete("question", question_row(id, title, false), pos(offset))
}

pub fn insert_link(id: i64, question_id: i64, tag_id: i64, offset: u64) -> ChangeRecord {
    ChangeRecord::insert("question_tag", link_row(id, question_id, tag_id), pos(offset))
}

pub fn delete_link(id: i64, question_id: i64, tag_id: i64, offset: u64) -> ChangeRecord {
    ChangeRecord::delete("question_tag", link_row(id, question_id, tag_id), pos(offset))
}

pub fn rename_tag(id: i64, from: &str, to: &str, offset: u64) -> ChangeRecord {
    ChangeRecord::update("tag", tag_row(id, from), tag_row(id, to), pos(offset))
}

pub fn insert_comment(
    id: i64,
    user_id: i64,
    to_comment_id: Option<i64>,
    content: &str,
    offset: u64,
) -> ChangeRecord {
    ChangeRecord::insert(
        "comment",
        comment_row(id, user_id, to_comment_id, content),
        pos(offset),
    )
}

/// One batch per distinct offset, in order.
pub fn batches(records: Vec<ChangeRecord>) -> Vec<Batch> {
    let mut out: Vec<Batch> = Vec::new();
    for record in records {
        match out.last_mut() {
            Some(batch) if batch.position == record.position => batch.records.push(record),
            _ => {
                let position = record.position.clone();
                out.push(Batch::new(vec![record], position));
            }
        }
    }
    out
}

// ============================================================================
// Harness
// ============================================================================

/// Handlers wired to in-memory collaborators.
pub struct Harness {
    pub index: Arc<MemoryIndex>,
    pub directory: Arc<MemoryDirectory>,
    pub notifications: Arc<MemoryNotificationStore>,
    pub handlers: HandlerRegistry,
}

impl Harness {
    pub fn new() -> Self {
        let index = Arc::new(MemoryIndex::new());
        let directory = Arc::new(MemoryDirectory::new());
        let notifications = Arc::new(MemoryNotificationStore::new());
        let handlers = HandlerRegistry::new(index.clone(), directory.clone(), notifications.clone());
        Self {
            index,
            directory,
            notifications,
            handlers,
        }
    }

    /// Tags 7 "array" and 8 "dp", user 5 "alice" owning comment 1, user 9 "bob".
    pub fn seeded() -> Self {
        let harness = Self::new();
        harness.directory.set_tag(7, "array");
        harness.directory.set_tag(8, "dp");
        harness.directory.set_user(5, "alice");
        harness.directory.set_user(9, "bob");
        harness.directory.set_comment(1, 5);
        harness
    }

    /// Run `record` through its handler, as a broker worker would.
    pub async fn apply(&self, record: &ChangeRecord) -> Result<HandlerOutcome> {
        let kind = Route::of(record)
            .job_kind()
            .ok_or_else(|| SyncError::shape(format!("no handler for '{}'", record.table)))?;
        self.handlers.handle(&Job::new(kind, record)?).await
    }

    pub async fn apply_all(&self, records: &[ChangeRecord]) -> Result<()> {
        for record in records {
            self.apply(record).await?;
        }
        Ok(())
    }

    pub fn documents(&self) -> Vec<IndexDocument> {
        self.index.documents()
    }

    pub fn document(&self, id: i64) -> Option<IndexDocument> {
        self.documents().into_iter().find(|d| d.id == id)
    }

    pub fn inline_broker(&self) -> Arc<InlineBroker> {
        Arc::new(InlineBroker::new(self.handlers.clone()))
    }
}

/// Runs each job to completion inside `submit`, optionally refusing every
/// submission from the `reject_from`-th on (0-based).
pub struct InlineBroker {
    handlers: HandlerRegistry,
    reject_from: Option<usize>,
    submitted: AtomicUsize,
}

impl InlineBroker {
    pub fn new(handlers: HandlerRegistry) -> Self {
        Self {
            handlers,
            reject_from: None,
            submitted: AtomicUsize::new(0),
        }
    }

    pub fn rejecting_from(mut self, n: usize) -> Self {
        self.reject_from = Some(n);
        self
    }

    pub fn accepted(&self) -> usize {
        self.submitted.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TaskBroker for InlineBroker {
    async fn submit(&self, job: Job) -> Result<()> {
        if self.reject_from.is_some_and(|n| self.accepted() >= n) {
            return Err(SyncError::broker("ingest refused the job"));
        }
        self.handlers.handle(&job).await?;
        self.submitted.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn shutdown(&self) -> Result<()> {
        Ok(())
    }
}
