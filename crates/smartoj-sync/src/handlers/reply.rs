//! `comment` inserts that answer another comment → a reply notification
//! for the author of the comment being answered.

use super::HandlerOutcome;
use crate::directory::Directory;
use crate::error::Result;
use crate::event::{Action, ChangeRecord, Scalar};
use crate::notification_store::{NotificationRecord, NotificationStore};

const REPLY_TITLE: &str = "New reply";

pub(super) async fn apply(
    directory: &dyn Directory,
    store: &dyn NotificationStore,
    record: &ChangeRecord,
) -> Result<HandlerOutcome> {
    if record.action != Action::Insert {
        return Ok(HandlerOutcome::skipped(format!(
            "comment {} does not notify",
            record.action
        )));
    }

    let comment = record.require_after()?;
    let Some(parent_id) = comment.opt_i64("to_comment_id") else {
        return Ok(HandlerOutcome::skipped("root comment"));
    };
    if comment
        .get("is_deleted")
        .and_then(Scalar::as_bool)
        .unwrap_or(false)
    {
        return Ok(HandlerOutcome::skipped("comment is deleted"));
    }

    let comment_id = comment.require_i64("id")?;
    let sender_id = comment.require_i64("user_id")?;
    let Some(recipient_id) = directory.comment_author(parent_id).await? else {
        return Ok(HandlerOutcome::skipped(format!(
            "parent comment {} not found",
            parent_id
        )));
    };
    if recipient_id == sender_id {
        return Ok(HandlerOutcome::skipped("self reply"));
    }

    let sender_name = directory
        .user_name(sender_id)
        .await?
        .unwrap_or_else(|| format!("user {}", sender_id));
    let content = format!(
        "{} replied to your comment: {}",
        sender_name,
        comment.opt_str("content").unwrap_or_default()
    );

    let notification =
        NotificationRecord::reply(comment_id, sender_id, recipient_id, REPLY_TITLE, &content);
    if !store.create(&notification).await? {
        return Ok(HandlerOutcome::skipped("notification already exists"));
    }
    Ok(HandlerOutcome::Applied)
}
