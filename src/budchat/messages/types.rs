use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::budchat::profiles::{Profile, UNKNOWN_USER};
use crate::types::{MessageId, UserId, deserialize_present};

/// A message as held in the in-memory feed, ready for rendering.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,

    pub content: String,

    /// Author identity. `None` for rows whose author reference is gone.
    pub author_id: Option<UserId>,

    /// Resolved display name, `Unknown User` when the author could not be resolved.
    pub author_name: String,

    pub author_avatar: Option<String>,

    /// Assigned by the persistence layer, never changed afterwards.
    pub created_at: DateTime<Utc>,

    /// Present only after an edit.
    pub updated_at: Option<DateTime<Utc>>,

    /// Message this one replies to.
    pub parent_id: Option<MessageId>,
}

impl Message {
    pub fn is_authored_by(&self, user: &UserId) -> bool {
        self.author_id.as_ref() == Some(user)
    }

    pub fn is_edited(&self) -> bool {
        self.updated_at.is_some()
    }

    pub fn is_reply(&self) -> bool {
        self.parent_id.is_some()
    }

    pub(crate) fn set_author(&mut self, profile: &Profile) {
        self.author_name = profile.display_name().to_string();
        self.author_avatar = profile.avatar_url.clone();
    }
}

/// Author columns joined onto a message row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct AuthorJoin {
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub avatar_url: Option<String>,
}

/// A persisted message row, as returned by the snapshot read and carried by Insert events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageRow {
    pub id: MessageId,
    pub content: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub user_id: Option<UserId>,
    #[serde(default)]
    pub parent_message_id: Option<MessageId>,
    /// Present on snapshot rows only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profiles: Option<AuthorJoin>,
}

impl MessageRow {
    /// Builds a feed message from a row and its separately resolved author.
    pub fn into_message(self, author: Option<&Profile>) -> Message {
        let (author_name, author_avatar) = match author {
            Some(profile) => (profile.display_name().to_string(), profile.avatar_url.clone()),
            None => (UNKNOWN_USER.to_string(), None),
        };

        Message {
            id: self.id,
            content: self.content,
            author_id: self.user_id,
            author_name,
            author_avatar,
            created_at: self.created_at,
            updated_at: self.updated_at,
            parent_id: self.parent_message_id,
        }
    }

    /// Builds a feed message from the author columns joined onto the row.
    pub fn into_joined_message(mut self) -> Message {
        let join = self.profiles.take().unwrap_or_default();
        let author_name = match join.username {
            Some(name) if !name.trim().is_empty() => name,
            _ => UNKNOWN_USER.to_string(),
        };

        Message {
            id: self.id,
            content: self.content,
            author_id: self.user_id,
            author_name,
            author_avatar: join.avatar_url,
            created_at: self.created_at,
            updated_at: self.updated_at,
            parent_id: self.parent_message_id,
        }
    }

    /// The profile implied by the join, when the join resolved.
    pub fn joined_profile(&self) -> Option<Profile> {
        let user_id = self.user_id.clone()?;
        let join = self.profiles.as_ref()?;
        let username = join.username.clone()?;
        Some(Profile {
            id: user_id,
            username: Some(username),
            avatar_url: join.avatar_url.clone(),
            status: None,
            personal_message: None,
        })
    }
}

/// Fields an Update event may carry. Absent fields are left untouched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessagePatch {
    pub id: MessageId,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default, deserialize_with = "deserialize_present")]
    pub updated_at: Option<Option<DateTime<Utc>>>,
    #[serde(default, deserialize_with = "deserialize_present")]
    pub parent_message_id: Option<Option<MessageId>>,
}

impl MessagePatch {
    pub fn content(id: MessageId, content: impl Into<String>, updated_at: DateTime<Utc>) -> Self {
        Self {
            id,
            content: Some(content.into()),
            updated_at: Some(Some(updated_at)),
            parent_message_id: None,
        }
    }
}

impl From<MessageRow> for MessagePatch {
    fn from(row: MessageRow) -> Self {
        Self {
            id: row.id,
            content: Some(row.content),
            updated_at: Some(row.updated_at),
            parent_message_id: Some(row.parent_message_id),
        }
    }
}

/// A change notification delivered by the change stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordChange {
    MessageInserted(MessageRow),
    MessageUpdated(MessagePatch),
    MessageDeleted { id: MessageId },
    ProfileUpdated(Profile),
}

impl RecordChange {
    pub fn kind(&self) -> &'static str {
        match self {
            RecordChange::MessageInserted(_) => "insert",
            RecordChange::MessageUpdated(_) => "update",
            RecordChange::MessageDeleted { .. } => "delete",
            RecordChange::ProfileUpdated(_) => "profile_update",
        }
    }
}
