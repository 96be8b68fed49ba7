//! In-memory search index with the same semantics as the Elasticsearch one.

use super::{renamed_tags, IndexDocument, SearchIndex};
use crate::error::{Result, SyncError};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};

#[derive(Debug, Default)]
pub struct MemoryIndex {
    docs: Mutex<BTreeMap<i64, IndexDocument>>,
    unavailable: AtomicBool,
}

impl MemoryIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of every stored document, ordered by id.
    pub fn documents(&self) -> Vec<IndexDocument> {
        self.docs.lock().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.docs.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.docs.lock().is_empty()
    }

    /// Make every call fail with a retriable error until reset.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::Relaxed);
    }

    fn check_available(&self) -> Result<()> {
        if self.unavailable.load(Ordering::Relaxed) {
            return Err(SyncError::index("503 Service Unavailable"));
        }
        Ok(())
    }
}

#[async_trait]
impl SearchIndex for MemoryIndex {
    async fn upsert_document(&self, doc: &IndexDocument) -> Result<()> {
        self.check_available()?;
        self.docs.lock().insert(doc.id, doc.clone());
        Ok(())
    }

    async fn update_fields(
        &self,
        id: i64,
        fields: serde_json::Map<String, serde_json::Value>,
    ) -> Result<()> {
        self.check_available()?;
        let mut docs = self.docs.lock();
        let current = docs.get(&id).cloned().unwrap_or_else(|| IndexDocument::new(id));

        let mut value = serde_json::to_value(&current)?;
        if let Some(object) = value.as_object_mut() {
            for (field, field_value) in fields {
                if field != "tags" && field != "id" {
                    object.insert(field, field_value);
                }
            }
        }
        let updated: IndexDocument = serde_json::from_value(value)?;
        docs.insert(id, updated);
        Ok(())
    }

    async fn delete_document(&self, id: i64) -> Result<bool> {
        self.check_available()?;
        Ok(self.docs.lock().remove(&id).is_some())
    }

    async fn add_tag(&self, id: i64, tag: &str) -> Result<bool> {
        self.check_available()?;
        let mut docs = self.docs.lock();
        let doc = docs
            .get_mut(&id)
            .ok_or_else(|| SyncError::index(format!("document {} not found", id)))?;
        if doc.tags.iter().any(|t| t == tag) {
            return Ok(false);
        }
        doc.tags.push(tag.to_string());
        Ok(true)
    }

    async fn remove_tag(&self, id: i64, tag: &str) -> Result<bool> {
        self.check_available()?;
        let mut docs = self.docs.lock();
        let Some(doc) = docs.get_mut(&id) else {
            return Ok(false);
        };
        let before = doc.tags.len();
        doc.tags.retain(|t| t != tag);
        Ok(doc.tags.len() != before)
    }

    async fn rename_tag(&self, before: &str, after: &str) -> Result<u64> {
        self.check_available()?;
        let mut updated = 0;
        for doc in self.docs.lock().values_mut() {
            if let Some(tags) = renamed_tags(&doc.tags, before, after) {
                doc.tags = tags;
                updated += 1;
            }
        }
        Ok(updated)
    }

    async fn get_document(&self, id: i64) -> Result<Option<IndexDocument>> {
        self.check_available()?;
        Ok(self.docs.lock().get(&id).cloned())
    }
}
