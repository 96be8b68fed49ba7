//! `tag` renames → every document carrying the old name.
//!
//! Only renames propagate. Inserting a tag definition links it to nothing,
//! and deleting one leaves existing links alone, so both are skipped.

use super::HandlerOutcome;
use crate::error::Result;
use crate::event::{Action, ChangeRecord};
use crate::index::SearchIndex;
use tracing::info;

pub(super) async fn apply(index: &dyn SearchIndex, record: &ChangeRecord) -> Result<HandlerOutcome> {
    if record.action != Action::Update {
        return Ok(HandlerOutcome::skipped(format!(
            "tag {} is not propagated",
            record.action
        )));
    }

    let before = record.require_before()?.opt_str("name").unwrap_or_default();
    let after = record.require_after()?.opt_str("name").unwrap_or_default();
    if before == after {
        return Ok(HandlerOutcome::skipped("tag name unchanged"));
    }
    if before.is_empty() || after.is_empty() {
        return Ok(HandlerOutcome::skipped("tag name missing"));
    }

    let updated = index.rename_tag(before, after).await?;
    info!("Renamed tag '{}' -> '{}' in {} documents", before, after, updated);
    Ok(HandlerOutcome::Applied)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{BinlogPosition, Row};
    use crate::index::{IndexDocument, MemoryIndex};

    fn tag(name: &str) -> Row {
        Row::new().with("id", 7i64).with("name", name).with("score", 0i64)
    }

    fn pos() -> BinlogPosition {
        BinlogPosition::new("binlog.000002", 120)
    }

    #[tokio::test]
    async fn test_rename_rewrites_documents() {
        let index = MemoryIndex::new();
        let mut doc = IndexDocument::new(42);
        doc.tags = vec!["array".into(), "dp".into()];
        index.upsert_document(&doc).await.unwrap();

        let record = ChangeRecord::update("tag", tag("array"), tag("arrays"), pos());
        assert_eq!(apply(&index, &record).await.unwrap(), HandlerOutcome::Applied);
        assert_eq!(apply(&index, &record).await.unwrap(), HandlerOutcome::Applied);
        assert_eq!(
            index.get_document(42).await.unwrap().unwrap().tags,
            vec!["arrays", "dp"]
        );
    }

    #[tokio::test]
    async fn test_non_rename_changes_are_skipped() {
        let index = MemoryIndex::new();
        let score_only = ChangeRecord::update(
            "tag",
            tag("array"),
            tag("array").with("score", 5i64),
            pos(),
        );
        assert!(matches!(
            apply(&index, &score_only).await.unwrap(),
            HandlerOutcome::Skipped(_)
        ));

        for record in [
            ChangeRecord::insert("tag", tag("graph"), pos()),
            ChangeRecord::delete("tag", tag("graph"), pos()),
        ] {
            assert!(matches!(
                apply(&index, &record).await.unwrap(),
                HandlerOutcome::Skipped(_)
            ));
        }
    }
}
