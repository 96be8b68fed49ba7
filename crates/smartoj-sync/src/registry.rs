//! # Table registry
//!
//! Closed mapping from source tables to the job each of their records
//! becomes. Adding a table means adding a [`KnownTable`] variant, and the
//! compiler then points at every match that has to learn about it.

use crate::event::{Action, ChangeRecord};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Tables with a handler behind them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KnownTable {
    /// Primary entity, projected into the search index
    Question,
    /// question ↔ tag junction
    QuestionTag,
    /// Tag definitions (display names)
    Tag,
    /// Comments; replies turn into notifications
    Comment,
}

impl KnownTable {
    pub const ALL: [KnownTable; 4] = [
        KnownTable::Question,
        KnownTable::QuestionTag,
        KnownTable::Tag,
        KnownTable::Comment,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            KnownTable::Question => "question",
            KnownTable::QuestionTag => "question_tag",
            KnownTable::Tag => "tag",
            KnownTable::Comment => "comment",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.name() == name)
    }

    /// The job every record of this table is submitted as.
    pub fn job_kind(&self) -> JobKind {
        match self {
            KnownTable::Question => JobKind::SyncQuestion,
            KnownTable::QuestionTag => JobKind::SyncQuestionTag,
            KnownTable::Tag => JobKind::RenameTag,
            KnownTable::Comment => JobKind::NotifyReply,
        }
    }
}

impl fmt::Display for KnownTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Registered task names understood by the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum JobKind {
    SyncQuestion,
    SyncQuestionTag,
    RenameTag,
    NotifyReply,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::SyncQuestion => "sync-question",
            JobKind::SyncQuestionTag => "sync-question-tag",
            JobKind::RenameTag => "rename-tag",
            JobKind::NotifyReply => "notify-reply",
        }
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Routing decision for a change record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    /// Table has a handler
    Known { table: KnownTable, action: Action },
    /// Table made it through the allow-list but nothing handles it
    Unregistered(String),
}

impl Route {
    pub fn of(record: &ChangeRecord) -> Self {
        match KnownTable::from_name(&record.table) {
            Some(table) => Route::Known {
                table,
                action: record.action,
            },
            None => Route::Unregistered(record.table.clone()),
        }
    }

    pub fn job_kind(&self) -> Option<JobKind> {
        match self {
            Route::Known { table, .. } => Some(table.job_kind()),
            Route::Unregistered(_) => None,
        }
    }
}
