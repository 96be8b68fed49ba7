//! `question` rows → index documents.
//!
//! Soft deletes (`is_deleted` flipping to true) remove the document; an
//! undelete rebuilds it, including the tags, from the current links.

use super::HandlerOutcome;
use crate::directory::Directory;
use crate::error::Result;
use crate::event::{Action, ChangeRecord, Row, Scalar};
use crate::index::{IndexDocument, SearchIndex, PROJECTED_FIELDS};
use serde_json::{Map, Value};

pub(super) async fn apply(
    index: &dyn SearchIndex,
    directory: &dyn Directory,
    record: &ChangeRecord,
) -> Result<HandlerOutcome> {
    match record.action {
        Action::Insert => {
            let after = record.require_after()?;
            let id = after.require_i64("id")?;
            if is_deleted(after) {
                return Ok(HandlerOutcome::skipped(format!(
                    "question {} inserted as deleted",
                    id
                )));
            }
            index.upsert_document(&document(id, after)).await?;
            Ok(HandlerOutcome::Applied)
        }
        Action::Update => {
            let before = record.require_before()?;
            let after = record.require_after()?;
            let id = after.require_i64("id")?;

            match (is_deleted(before), is_deleted(after)) {
                (false, true) => {
                    index.delete_document(id).await?;
                    Ok(HandlerOutcome::Applied)
                }
                (true, true) => Ok(HandlerOutcome::skipped(format!(
                    "question {} is deleted",
                    id
                ))),
                (true, false) => {
                    let mut doc = document(id, after);
                    doc.tags = directory.question_tags(id).await?;
                    index.upsert_document(&doc).await?;
                    Ok(HandlerOutcome::Applied)
                }
                (false, false) => {
                    index.update_fields(id, projected_fields(after)).await?;
                    Ok(HandlerOutcome::Applied)
                }
            }
        }
        Action::Delete => {
            let id = record.require_before()?.require_i64("id")?;
            index.delete_document(id).await?;
            Ok(HandlerOutcome::Applied)
        }
    }
}

fn is_deleted(row: &Row) -> bool {
    row.get("is_deleted")
        .and_then(Scalar::as_bool)
        .unwrap_or(false)
}

fn text(row: &Row, field: &str) -> String {
    match row.get(field) {
        Some(Scalar::Text(s)) => s.clone(),
        Some(Scalar::Null) | None => String::new(),
        Some(other) => other.to_json().to_string(),
    }
}

/// Full document with no tags.
fn document(id: i64, row: &Row) -> IndexDocument {
    IndexDocument {
        id,
        title: text(row, "title"),
        description: text(row, "description"),
        difficulty: text(row, "difficulty"),
        submission_quantity: row.opt_i64("submission_quantity").unwrap_or(0),
        pass_quantity: row.opt_i64("pass_quantity").unwrap_or(0),
        tags: Vec::new(),
    }
}

/// Projected fields present in the row image.
fn projected_fields(row: &Row) -> Map<String, Value> {
    let doc = document(0, row);
    let mut fields = Map::new();
    for field in PROJECTED_FIELDS {
        if !row.contains(field) {
            continue;
        }
        let value = match field {
            "title" => Value::from(doc.title.clone()),
            "description" => Value::from(doc.description.clone()),
            "difficulty" => Value::from(doc.difficulty.clone()),
            "submission_quantity" => Value::from(doc.submission_quantity),
            _ => Value::from(doc.pass_quantity),
        };
        fields.insert(field.to_string(), value);
    }
    fields
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::MemoryDirectory;
    use crate::event::BinlogPosition;
    use crate::index::MemoryIndex;

    fn pos() -> BinlogPosition {
        BinlogPosition::new("binlog.000001", 400)
    }

    fn question(id: i64, title: &str, deleted: bool) -> Row {
        Row::new()
            .with("id", id)
            .with("title", title)
            .with("description", "Find two numbers")
            .with("difficulty", "easy")
            .with("score", 10i64)
            .with("submission_quantity", 3i64)
            .with("pass_quantity", 1i64)
            .with("is_deleted", Scalar::Int(i64::from(deleted)))
            .with("publisher_id", 1i64)
    }

    #[tokio::test]
    async fn test_insert_creates_untagged_document() {
        let index = MemoryIndex::new();
        let dir = MemoryDirectory::new();
        let record = ChangeRecord::insert("question", question(42, "Two Sum", false), pos());

        assert_eq!(
            apply(&index, &dir, &record).await.unwrap(),
            HandlerOutcome::Applied
        );
        let doc = index.get_document(42).await.unwrap().unwrap();
        assert_eq!(doc.title, "Two Sum");
        assert_eq!(doc.difficulty, "easy");
        assert_eq!(doc.submission_quantity, 3);
        assert!(doc.tags.is_empty());
    }

    #[tokio::test]
    async fn test_insert_of_deleted_row_is_skipped() {
        let index = MemoryIndex::new();
        let dir = MemoryDirectory::new();
        let record = ChangeRecord::insert("question", question(1, "x", true), pos());
        assert!(matches!(
            apply(&index, &dir, &record).await.unwrap(),
            HandlerOutcome::Skipped(_)
        ));
        assert!(index.is_empty());
    }

    #[tokio::test]
    async fn test_update_keeps_tags() {
        let index = MemoryIndex::new();
        let dir = MemoryDirectory::new();
        apply(
            &index,
            &dir,
            &ChangeRecord::insert("question", question(42, "Two Sum", false), pos()),
        )
        .await
        .unwrap();
        index.add_tag(42, "array").await.unwrap();

        let record = ChangeRecord::update(
            "question",
            question(42, "Two Sum", false),
            question(42, "Two Sum (easy)", false),
            pos(),
        );
        apply(&index, &dir, &record).await.unwrap();
        apply(&index, &dir, &record).await.unwrap();

        let doc = index.get_document(42).await.unwrap().unwrap();
        assert_eq!(doc.title, "Two Sum (easy)");
        assert_eq!(doc.tags, vec!["array"]);
    }

    #[tokio::test]
    async fn test_soft_delete_and_restore() {
        let index = MemoryIndex::new();
        let dir = MemoryDirectory::new();
        dir.set_tag(7, "array");
        dir.link(42, 7);

        apply(
            &index,
            &dir,
            &ChangeRecord::insert("question", question(42, "Two Sum", false), pos()),
        )
        .await
        .unwrap();
        index.add_tag(42, "array").await.unwrap();

        let delete = ChangeRecord::update(
            "question",
            question(42, "Two Sum", false),
            question(42, "Two Sum", true),
            pos(),
        );
        apply(&index, &dir, &delete).await.unwrap();
        assert!(index.get_document(42).await.unwrap().is_none());

        let restore = ChangeRecord::update(
            "question",
            question(42, "Two Sum", true),
            question(42, "Two Sum", false),
            pos(),
        );
        apply(&index, &dir, &restore).await.unwrap();
        let doc = index.get_document(42).await.unwrap().unwrap();
        assert_eq!(doc.tags, vec!["array"]);
    }

    #[tokio::test]
    async fn test_update_while_deleted_is_skipped() {
        let index = MemoryIndex::new();
        let dir = MemoryDirectory::new();
        let record = ChangeRecord::update(
            "question",
            question(5, "a", true),
            question(5, "b", true),
            pos(),
        );
        assert!(matches!(
            apply(&index, &dir, &record).await.unwrap(),
            HandlerOutcome::Skipped(_)
        ));
        assert!(index.is_empty());
    }

    #[tokio::test]
    async fn test_hard_delete_tolerates_absence() {
        let index = MemoryIndex::new();
        let dir = MemoryDirectory::new();
        let record = ChangeRecord::delete("question", question(42, "Two Sum", false), pos());
        assert_eq!(
            apply(&index, &dir, &record).await.unwrap(),
            HandlerOutcome::Applied
        );
        assert_eq!(
            apply(&index, &dir, &record).await.unwrap(),
            HandlerOutcome::Applied
        );
    }

    #[test]
    fn test_projected_fields_only_present_columns() {
        let row = Row::new().with("id", 1i64).with("title", "t").with("score", 5i64);
        let fields = projected_fields(&row);
        assert_eq!(fields.len(), 1);
        assert_eq!(fields["title"], "t");
    }

    #[test]
    fn test_numeric_difficulty_becomes_text() {
        let row = Row::new().with("id", 1i64).with("difficulty", 3i64);
        assert_eq!(document(1, &row).difficulty, "3");
    }
}
