//! Notification side-channel
//!
//! Notifications are rows of the application's `message` table. Creation is
//! idempotent per source event: a reply carries the id of the comment that
//! caused it (`message.source_comment_id`), and at most one notification of a
//! kind exists per source comment. Two replies with the same text are two
//! notifications; the same reply replayed is one. Records without a source
//! fall back to matching sender, recipient, kind, title and content.

use crate::error::Result;
use async_trait::async_trait;
use mysql_async::prelude::Queryable;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Column limits of the `message` table.
pub const MAX_TITLE_CHARS: usize = 50;
pub const MAX_CONTENT_CHARS: usize = 255;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationKind {
    Reply,
    System,
}

impl NotificationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationKind::Reply => "reply",
            NotificationKind::System => "system",
        }
    }
}

impl fmt::Display for NotificationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationRecord {
    /// Comment that caused the notification; the dedupe key when set.
    pub source_comment_id: Option<i64>,
    /// `None` for system messages
    pub sender_id: Option<i64>,
    pub recipient_id: i64,
    pub title: String,
    pub content: String,
    pub kind: NotificationKind,
}

impl NotificationRecord {
    /// Reply notification, with title and content cut to the column limits.
    pub fn reply(
        comment_id: i64,
        sender_id: i64,
        recipient_id: i64,
        title: &str,
        content: &str,
    ) -> Self {
        Self {
            source_comment_id: Some(comment_id),
            sender_id: Some(sender_id),
            recipient_id,
            title: truncate_chars(title, MAX_TITLE_CHARS),
            content: truncate_chars(content, MAX_CONTENT_CHARS),
            kind: NotificationKind::Reply,
        }
    }

    /// Whether `other` stands for the same notification.
    pub fn is_duplicate_of(&self, other: &NotificationRecord) -> bool {
        if self.kind != other.kind {
            return false;
        }
        match (self.source_comment_id, other.source_comment_id) {
            (Some(a), Some(b)) => a == b,
            (None, None) => {
                self.sender_id == other.sender_id
                    && self.recipient_id == other.recipient_id
                    && self.title == other.title
                    && self.content == other.content
            }
            _ => false,
        }
    }
}

fn truncate_chars(s: &str, max: usize) -> String {
    match s.char_indices().nth(max) {
        Some((idx, _)) => s[..idx].to_string(),
        None => s.to_string(),
    }
}

#[async_trait]
pub trait NotificationStore: Send + Sync {
    /// Store the notification; `false` when it already exists.
    async fn create(&self, record: &NotificationRecord) -> Result<bool>;
}

/// Shared notification store
pub type SharedNotificationStore = Arc<dyn NotificationStore>;

/// `message` table over a `mysql_async` pool.
pub struct MySqlNotificationStore {
    pool: mysql_async::Pool,
}

impl MySqlNotificationStore {
    pub fn new(pool: mysql_async::Pool) -> Self {
        Self { pool }
    }
}

const INSERT_BY_SOURCE: &str = r#"
    INSERT INTO message
        (title, content, type, recipient_id, sender_id, source_comment_id, is_deleted, is_read)
    SELECT ?, ?, ?, ?, ?, ?, 0, 0
    FROM DUAL
    WHERE NOT EXISTS (
        SELECT 1 FROM message WHERE type = ? AND source_comment_id = ?
    )
"#;

const INSERT_BY_CONTENT: &str = r#"
    INSERT INTO message
        (title, content, type, recipient_id, sender_id, source_comment_id, is_deleted, is_read)
    SELECT ?, ?, ?, ?, ?, NULL, 0, 0
    FROM DUAL
    WHERE NOT EXISTS (
        SELECT 1 FROM message
        WHERE source_comment_id IS NULL AND recipient_id = ? AND sender_id <=> ?
          AND type = ? AND title = ? AND content = ?
    )
"#;

#[async_trait]
impl NotificationStore for MySqlNotificationStore {
    async fn create(&self, record: &NotificationRecord) -> Result<bool> {
        let mut conn = self.pool.get_conn().await?;
        let kind = record.kind.as_str();
        match record.source_comment_id {
            Some(source) => {
                conn.exec_drop(
                    INSERT_BY_SOURCE,
                    (
                        &record.title,
                        &record.content,
                        kind,
                        record.recipient_id,
                        record.sender_id,
                        source,
                        kind,
                        source,
                    ),
                )
                .await?
            }
            None => {
                conn.exec_drop(
                    INSERT_BY_CONTENT,
                    (
                        &record.title,
                        &record.content,
                        kind,
                        record.recipient_id,
                        record.sender_id,
                        record.recipient_id,
                        record.sender_id,
                        kind,
                        &record.title,
                        &record.content,
                    ),
                )
                .await?
            }
        }
        Ok(conn.affected_rows() > 0)
    }
}

/// In-memory store for tests.
#[derive(Debug, Default)]
pub struct MemoryNotificationStore {
    records: Mutex<Vec<NotificationRecord>>,
}

impl MemoryNotificationStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<NotificationRecord> {
        self.records.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }
}

#[async_trait]
impl NotificationStore for MemoryNotificationStore {
    async fn create(&self, record: &NotificationRecord) -> Result<bool> {
        let mut records = self.records.lock();
        if records.iter().any(|r| r.is_duplicate_of(record)) {
            return Ok(false);
        }
        records.push(record.clone());
        Ok(true)
    }
}
