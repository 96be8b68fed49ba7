//! Read-side lookups the handlers need beyond the change record itself:
//! tag names, a question's current tag set, comment authors and user
//! handles.

use crate::error::Result;
use async_trait::async_trait;
use mysql_async::prelude::Queryable;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

#[async_trait]
pub trait Directory: Send + Sync {
    /// Display name of a tag definition.
    async fn tag_name(&self, tag_id: i64) -> Result<Option<String>>;

    /// Names of the tags currently linked to a question, in link order.
    async fn question_tags(&self, question_id: i64) -> Result<Vec<String>>;

    /// Author (user id) of a comment.
    async fn comment_author(&self, comment_id: i64) -> Result<Option<i64>>;

    /// Public handle of a user.
    async fn user_name(&self, user_id: i64) -> Result<Option<String>>;
}

/// Shared directory
pub type SharedDirectory = Arc<dyn Directory>;

/// Lookups against the application database.
pub struct MySqlDirectory {
    pool: mysql_async::Pool,
}

impl MySqlDirectory {
    pub fn new(pool: mysql_async::Pool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl Directory for MySqlDirectory {
    async fn tag_name(&self, tag_id: i64) -> Result<Option<String>> {
        let mut conn = self.pool.get_conn().await?;
        Ok(conn
            .exec_first("SELECT name FROM tag WHERE id = ?", (tag_id,))
            .await?)
    }

    async fn question_tags(&self, question_id: i64) -> Result<Vec<String>> {
        let mut conn = self.pool.get_conn().await?;
        Ok(conn
            .exec(
                r#"
                SELECT t.name
                FROM question_tag qt
                JOIN tag t ON t.id = qt.tag_id
                WHERE qt.question_id = ?
                ORDER BY qt.id
                "#,
                (question_id,),
            )
            .await?)
    }

    async fn comment_author(&self, comment_id: i64) -> Result<Option<i64>> {
        let mut conn = self.pool.get_conn().await?;
        Ok(conn
            .exec_first("SELECT user_id FROM comment WHERE id = ?", (comment_id,))
            .await?)
    }

    async fn user_name(&self, user_id: i64) -> Result<Option<String>> {
        let mut conn = self.pool.get_conn().await?;
        Ok(conn
            .exec_first("SELECT user_id FROM `user` WHERE id = ?", (user_id,))
            .await?)
    }
}

/// In-memory directory for tests.
#[derive(Debug, Default)]
pub struct MemoryDirectory {
    tags: RwLock<HashMap<i64, String>>,
    links: RwLock<Vec<(i64, i64)>>,
    comments: RwLock<HashMap<i64, i64>>,
    users: RwLock<HashMap<i64, String>>,
}

impl MemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_tag(&self, tag_id: i64, name: &str) {
        self.tags.write().insert(tag_id, name.to_string());
    }

    pub fn link(&self, question_id: i64, tag_id: i64) {
        let mut links = self.links.write();
        if !links.contains(&(question_id, tag_id)) {
            links.push((question_id, tag_id));
        }
    }

    pub fn unlink(&self, question_id: i64, tag_id: i64) {
        self.links.write().retain(|l| *l != (question_id, tag_id));
    }

    pub fn set_comment(&self, comment_id: i64, author_id: i64) {
        self.comments.write().insert(comment_id, author_id);
    }

    pub fn set_user(&self, user_id: i64, name: &str) {
        self.users.write().insert(user_id, name.to_string());
    }
}

#[async_trait]
impl Directory for MemoryDirectory {
    async fn tag_name(&self, tag_id: i64) -> Result<Option<String>> {
        Ok(self.tags.read().get(&tag_id).cloned())
    }

    async fn question_tags(&self, question_id: i64) -> Result<Vec<String>> {
        let tags = self.tags.read();
        Ok(self
            .links
            .read()
            .iter()
            .filter(|(q, _)| *q == question_id)
            .filter_map(|(_, t)| tags.get(t).cloned())
            .collect())
    }

    async fn comment_author(&self, comment_id: i64) -> Result<Option<i64>> {
        Ok(self.comments.read().get(&comment_id).copied())
    }

    async fn user_name(&self, user_id: i64) -> Result<Option<String>> {
        Ok(self.users.read().get(&user_id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_directory_question_tags() {
        let dir = MemoryDirectory::new();
        dir.set_tag(7, "array");
        dir.set_tag(8, "dp");
        dir.link(42, 8);
        dir.link(42, 7);
        dir.link(42, 7);
        dir.link(43, 7);

        assert_eq!(dir.question_tags(42).await.unwrap(), vec!["dp", "array"]);
        dir.unlink(42, 8);
        assert_eq!(dir.question_tags(42).await.unwrap(), vec!["array"]);
        assert!(dir.question_tags(1).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_memory_directory_lookups() {
        let dir = MemoryDirectory::new();
        dir.set_comment(100, 5);
        dir.set_user(5, "alice");
        assert_eq!(dir.comment_author(100).await.unwrap(), Some(5));
        assert_eq!(dir.comment_author(101).await.unwrap(), None);
        assert_eq!(dir.user_name(5).await.unwrap().as_deref(), Some("alice"));
        assert_eq!(dir.tag_name(1).await.unwrap(), None);
    }
}
