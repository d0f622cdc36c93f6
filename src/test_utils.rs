//! Shared fixtures for unit tests.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use tokio::sync::watch;

use crate::budchat::messages::{Message, MessageRow};
use crate::budchat::presence::RosterEntry;
use crate::budchat::profiles::Profile;
use crate::types::{MessageId, UserId};

pub fn base_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 1, 1, 10, 0, 0).unwrap()
}

/// A message by `user` created `offset_secs` after [`base_time`]. The author
/// name is the user id and the content is `message <id>`.
pub fn message_at(id: &str, user: &str, offset_secs: i64) -> Message {
    Message {
        id: MessageId::new(id),
        content: format!("message {id}"),
        author_id: Some(UserId::new(user)),
        author_name: user.to_string(),
        author_avatar: None,
        created_at: base_time() + chrono::Duration::seconds(offset_secs),
        updated_at: None,
        parent_id: None,
    }
}

/// A persisted row without the author join.
pub fn row_at(id: &str, user: Option<&str>, offset_secs: i64) -> MessageRow {
    MessageRow {
        id: MessageId::new(id),
        content: format!("message {id}"),
        created_at: base_time() + chrono::Duration::seconds(offset_secs),
        updated_at: None,
        user_id: user.map(UserId::new),
        parent_message_id: None,
        profiles: None,
    }
}

pub fn profile(id: &str, username: &str) -> Profile {
    Profile::new(UserId::new(id), username)
}

pub async fn wait_for_roster<F>(roster: &mut watch::Receiver<Arc<Vec<RosterEntry>>>, predicate: F)
where
    F: Fn(&[RosterEntry]) -> bool,
{
    tokio::time::timeout(Duration::from_secs(2), roster.wait_for(|entries| predicate(entries)))
        .await
        .expect("timed out waiting for roster")
        .expect("roster stream closed");
}
