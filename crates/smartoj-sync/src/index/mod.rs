//! Search index projection of questions
//!
//! One [`IndexDocument`] per live question row, keyed by the question id.
//! The question handler owns every field except `tags`; the tag handlers
//! own `tags` and only ever touch it through [`SearchIndex::add_tag`],
//! [`SearchIndex::remove_tag`] and [`SearchIndex::rename_tag`], which are
//! idempotent so a replayed job converges to the same document.

pub mod elasticsearch;
pub mod memory;

pub use elasticsearch::ElasticsearchIndex;
pub use memory::MemoryIndex;

use crate::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Fields of a question row projected into the index, besides `id`.
pub const PROJECTED_FIELDS: [&str; 5] = [
    "title",
    "description",
    "difficulty",
    "submission_quantity",
    "pass_quantity",
];

/// Indexed question document.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexDocument {
    pub id: i64,
    pub title: String,
    pub description: String,
    pub difficulty: String,
    pub submission_quantity: i64,
    pub pass_quantity: i64,
    pub tags: Vec<String>,
}

impl IndexDocument {
    /// A document with no tags yet.
    pub fn new(id: i64) -> Self {
        Self {
            id,
            ..Self::default()
        }
    }
}

/// Document store the handlers write to.
#[async_trait]
pub trait SearchIndex: Send + Sync {
    /// Create or fully replace a document.
    async fn upsert_document(&self, doc: &IndexDocument) -> Result<()>;

    /// Overwrite the given fields, creating the document (with no tags) when
    /// it does not exist. Never touches `tags`.
    async fn update_fields(
        &self,
        id: i64,
        fields: serde_json::Map<String, serde_json::Value>,
    ) -> Result<()>;

    /// Remove a document; `false` when it was already gone.
    async fn delete_document(&self, id: i64) -> Result<bool>;

    /// Append `tag` unless already present. Fails when the document does
    /// not exist yet, so the job is retried after the question lands.
    async fn add_tag(&self, id: i64, tag: &str) -> Result<bool>;

    /// Remove every occurrence of `tag`; a missing document is a no-op.
    async fn remove_tag(&self, id: i64, tag: &str) -> Result<bool>;

    /// Replace `before` with `after` in every document's tags, in place and
    /// without introducing duplicates. Returns the number of documents
    /// rewritten.
    async fn rename_tag(&self, before: &str, after: &str) -> Result<u64>;

    async fn get_document(&self, id: i64) -> Result<Option<IndexDocument>>;
}

/// Shared search index
pub type SharedSearchIndex = Arc<dyn SearchIndex>;

/// Rewrite a tag list the way `rename_tag` does. Returns `None` when
/// `before` does not occur.
pub(crate) fn renamed_tags(tags: &[String], before: &str, after: &str) -> Option<Vec<String>> {
    if !tags.iter().any(|t| t == before) {
        return None;
    }
    let mut out: Vec<String> = Vec::with_capacity(tags.len());
    for tag in tags {
        let value = if tag == before { after } else { tag.as_str() };
        if !out.iter().any(|t| t == value) {
            out.push(value.to_string());
        }
    }
    Some(out)
}
