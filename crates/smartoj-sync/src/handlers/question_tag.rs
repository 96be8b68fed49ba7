//! `question_tag` links → the `tags` array of a document.

use super::HandlerOutcome;
use crate::directory::Directory;
use crate::error::Result;
use crate::event::{Action, ChangeRecord, Row};
use crate::index::SearchIndex;

/// A `(question_id, tag_id)` link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Link {
    question_id: i64,
    tag_id: i64,
}

impl Link {
    fn from_row(row: &Row) -> Result<Self> {
        Ok(Self {
            question_id: row.require_i64("question_id")?,
            tag_id: row.require_i64("tag_id")?,
        })
    }
}

pub(super) async fn apply(
    index: &dyn SearchIndex,
    directory: &dyn Directory,
    record: &ChangeRecord,
) -> Result<HandlerOutcome> {
    match record.action {
        Action::Insert => add(index, directory, Link::from_row(record.require_after()?)?).await,
        Action::Delete => {
            remove(index, directory, Link::from_row(record.require_before()?)?).await
        }
        Action::Update => {
            let old = Link::from_row(record.require_before()?)?;
            let new = Link::from_row(record.require_after()?)?;
            if old == new {
                return Ok(HandlerOutcome::skipped("link unchanged"));
            }
            remove(index, directory, old).await?;
            add(index, directory, new).await
        }
    }
}

async fn add(index: &dyn SearchIndex, directory: &dyn Directory, link: Link) -> Result<HandlerOutcome> {
    let Some(name) = directory.tag_name(link.tag_id).await? else {
        return Ok(HandlerOutcome::skipped(format!("tag {} not found", link.tag_id)));
    };
    index.add_tag(link.question_id, &name).await?;
    Ok(HandlerOutcome::Applied)
}

async fn remove(
    index: &dyn SearchIndex,
    directory: &dyn Directory,
    link: Link,
) -> Result<HandlerOutcome> {
    let Some(name) = directory.tag_name(link.tag_id).await? else {
        return Ok(HandlerOutcome::skipped(format!("tag {} not found", link.tag_id)));
    };
    index.remove_tag(link.question_id, &name).await?;
    Ok(HandlerOutcome::Applied)
}
