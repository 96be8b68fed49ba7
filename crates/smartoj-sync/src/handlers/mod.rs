//! # Task handlers
//!
//! Broker-invoked appliers, one per [`JobKind`]. Each handler must converge
//! to the same external state however many times a job runs, because the
//! pipeline only promises at-least-once delivery.
//!
//! | Job                 | Source table   | Effect                                   |
//! |---------------------|----------------|------------------------------------------|
//! | `sync-question`     | `question`     | upsert / partial update / delete document |
//! | `sync-question-tag` | `question_tag` | scripted add / remove of one tag          |
//! | `rename-tag`        | `tag`          | bulk rename across every document         |
//! | `notify-reply`      | `comment`      | one reply notification                    |

mod question;
mod question_tag;
mod reply;
mod tag_rename;

use crate::broker::Job;
use crate::directory::SharedDirectory;
use crate::error::{Result, SyncError};
use crate::index::SharedSearchIndex;
use crate::notification_store::SharedNotificationStore;
use crate::registry::{JobKind, KnownTable};
use std::fmt;
use tracing::debug;

/// What a handler did with a job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandlerOutcome {
    /// The external state now reflects the record
    Applied,
    /// Nothing to do for this record
    Skipped(String),
}

impl HandlerOutcome {
    pub(crate) fn skipped(reason: impl Into<String>) -> Self {
        HandlerOutcome::Skipped(reason.into())
    }
}

impl fmt::Display for HandlerOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HandlerOutcome::Applied => f.write_str("applied"),
            HandlerOutcome::Skipped(reason) => write!(f, "skipped: {}", reason),
        }
    }
}

/// Collaborators every handler draws from.
#[derive(Clone)]
pub struct HandlerRegistry {
    index: SharedSearchIndex,
    directory: SharedDirectory,
    notifications: SharedNotificationStore,
}

impl HandlerRegistry {
    pub fn new(
        index: SharedSearchIndex,
        directory: SharedDirectory,
        notifications: SharedNotificationStore,
    ) -> Self {
        Self {
            index,
            directory,
            notifications,
        }
    }

    /// Run the handler registered for `job.name`.
    pub async fn handle(&self, job: &Job) -> Result<HandlerOutcome> {
        let record = job.record()?;
        let expected = table_of(job.name);
        if record.table != expected.name() {
            return Err(SyncError::shape(format!(
                "{} job carries a '{}' record",
                job.name, record.table
            )));
        }
        record.validate_shape()?;

        let outcome = match job.name {
            JobKind::SyncQuestion => {
                question::apply(self.index.as_ref(), self.directory.as_ref(), &record).await?
            }
            JobKind::SyncQuestionTag => {
                question_tag::apply(self.index.as_ref(), self.directory.as_ref(), &record).await?
            }
            JobKind::RenameTag => tag_rename::apply(self.index.as_ref(), &record).await?,
            JobKind::NotifyReply => {
                reply::apply(self.directory.as_ref(), self.notifications.as_ref(), &record).await?
            }
        };

        debug!(
            "Job {} ({} {} at {}): {}",
            job.id, job.name, record.action, record.position, outcome
        );
        Ok(outcome)
    }
}

fn table_of(kind: JobKind) -> KnownTable {
    match kind {
        JobKind::SyncQuestion => KnownTable::Question,
        JobKind::SyncQuestionTag => KnownTable::QuestionTag,
        JobKind::RenameTag => KnownTable::Tag,
        JobKind::NotifyReply => KnownTable::Comment,
    }
}
