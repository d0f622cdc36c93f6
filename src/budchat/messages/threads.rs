//! Reply threading.
//!
//! Parents are looked up by identity in the in-memory feed with a linear scan,
//! one level deep. A parent that is not in the feed yields no preview.

use serde::{Deserialize, Serialize};

use crate::budchat::messages::types::Message;

/// What a reply shows of its parent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplyPreview {
    pub author_name: String,
    pub content: String,
}

pub fn parent_of<'a>(messages: &'a [Message], message: &Message) -> Option<&'a Message> {
    let parent_id = message.parent_id.as_ref()?;
    messages.iter().find(|candidate| &candidate.id == parent_id)
}

pub fn reply_preview(messages: &[Message], message: &Message) -> Option<ReplyPreview> {
    parent_of(messages, message).map(|parent| ReplyPreview {
        author_name: parent.author_name.clone(),
        content: parent.content.clone(),
    })
}
