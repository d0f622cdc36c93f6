//! Change-event reducer
//!
//! Applying a change is split in two stages. [`resolve_change`] performs the only
//! suspension point (the author lookup for Inserts); [`MessageLog::apply`] is a
//! pure, synchronous state transition. The session applies resolved changes in
//! arrival order.

use std::sync::Arc;

use crate::budchat::capabilities::MessageStore;
use crate::budchat::messages::types::{Message, MessagePatch, RecordChange};
use crate::budchat::profiles::{Profile, ProfileStore, UNKNOWN_USER};
use crate::types::MessageId;

/// A change whose secondary lookups have completed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolvedChange {
    Insert(Message),
    Update(MessagePatch),
    Delete(MessageId),
    AuthorRefreshed(Profile),
}

/// Outcome of applying one change to the log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Applied {
    /// A new message was added.
    Inserted(Message),
    /// An Insert for an id already present was merged in place.
    Duplicate(Message),
    Updated(Message),
    Deleted(Message),
    /// Author display fields were rewritten on `messages` messages.
    AuthorRefreshed { profile: Profile, messages: usize },
    /// Update or Delete for an id not in the log.
    Ignored(MessageId),
}

impl Applied {
    /// Whether the visible feed changed.
    pub fn changed_feed(&self) -> bool {
        match self {
            Applied::Ignored(_) => false,
            Applied::AuthorRefreshed { messages, .. } => *messages > 0,
            _ => true,
        }
    }
}

/// The ordered in-memory message collection, sorted by `created_at` ascending.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageLog {
    messages: Vec<Message>,
}

impl MessageLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a log from snapshot messages. Ties keep their snapshot order.
    pub fn from_messages(mut messages: Vec<Message>) -> Self {
        messages.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Self { messages }
    }

    pub fn as_slice(&self) -> &[Message] {
        &self.messages
    }

    pub fn iter(&self) -> impl Iterator<Item = &Message> {
        self.messages.iter()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn get(&self, id: &MessageId) -> Option<&Message> {
        self.messages.iter().find(|message| &message.id == id)
    }

    fn position(&self, id: &MessageId) -> Option<usize> {
        self.messages.iter().position(|message| &message.id == id)
    }

    /// An immutable copy for the view layer.
    pub fn snapshot(&self) -> Arc<Vec<Message>> {
        Arc::new(self.messages.clone())
    }

    pub fn is_sorted(&self) -> bool {
        self.messages
            .windows(2)
            .all(|pair| pair[0].created_at <= pair[1].created_at)
    }

    pub fn apply(&mut self, change: ResolvedChange) -> Applied {
        match change {
            ResolvedChange::Insert(message) => self.insert(message),
            ResolvedChange::Update(patch) => self.update(patch),
            ResolvedChange::Delete(id) => self.delete(&id),
            ResolvedChange::AuthorRefreshed(profile) => self.refresh_author(profile),
        }
    }

    fn insert(&mut self, message: Message) -> Applied {
        if let Some(index) = self.position(&message.id) {
            tracing::debug!(
                target: "budchat::messages::reducer::insert",
                "Insert for existing message {}, merging in place",
                message.id
            );
            let existing = &mut self.messages[index];
            existing.content = message.content;
            existing.updated_at = message.updated_at;
            existing.parent_id = message.parent_id;
            if existing.author_id.is_none() {
                existing.author_id = message.author_id;
            }
            if message.author_name != UNKNOWN_USER {
                existing.author_name = message.author_name;
                existing.author_avatar = message.author_avatar;
            }
            return Applied::Duplicate(existing.clone());
        }

        let in_order = self
            .messages
            .last()
            .is_none_or(|tail| tail.created_at <= message.created_at);

        if in_order {
            self.messages.push(message.clone());
        } else {
            tracing::warn!(
                target: "budchat::messages::reducer::insert",
                "Message {} is older than the feed tail, placing it by timestamp",
                message.id
            );
            let index = self
                .messages
                .partition_point(|existing| existing.created_at <= message.created_at);
            self.messages.insert(index, message.clone());
        }

        Applied::Inserted(message)
    }

    fn update(&mut self, patch: MessagePatch) -> Applied {
        let Some(index) = self.position(&patch.id) else {
            tracing::debug!(
                target: "budchat::messages::reducer::update",
                "Update for unknown message {}, ignoring",
                patch.id
            );
            return Applied::Ignored(patch.id);
        };

        let message = &mut self.messages[index];
        if let Some(content) = patch.content {
            message.content = content;
        }
        if let Some(updated_at) = patch.updated_at {
            message.updated_at = updated_at;
        }
        if let Some(parent_id) = patch.parent_message_id {
            message.parent_id = parent_id;
        }

        Applied::Updated(message.clone())
    }

    fn delete(&mut self, id: &MessageId) -> Applied {
        match self.position(id) {
            Some(index) => Applied::Deleted(self.messages.remove(index)),
            None => {
                tracing::debug!(
                    target: "budchat::messages::reducer::delete",
                    "Delete for unknown message {}, ignoring",
                    id
                );
                Applied::Ignored(id.clone())
            }
        }
    }

    fn refresh_author(&mut self, profile: Profile) -> Applied {
        let mut touched = 0;
        for message in self
            .messages
            .iter_mut()
            .filter(|message| message.author_id.as_ref() == Some(&profile.id))
        {
            message.set_author(&profile);
            touched += 1;
        }

        Applied::AuthorRefreshed {
            profile,
            messages: touched,
        }
    }
}

/// Performs the secondary lookups a change needs before it can be applied.
///
/// Inserts resolve their author through the profile store; a miss substitutes
/// the sentinel author. Profile updates pass through untouched; the store is
/// refreshed by [`settle`] when the change reaches its turn.
pub async fn resolve_change(
    change: RecordChange,
    store: &dyn MessageStore,
    profiles: &ProfileStore,
) -> ResolvedChange {
    match change {
        RecordChange::MessageInserted(row) => {
            let author = match &row.user_id {
                Some(user_id) => Some(profiles.resolve(store, user_id).await),
                None => None,
            };
            ResolvedChange::Insert(row.into_message(author.as_ref()))
        }
        RecordChange::MessageUpdated(patch) => ResolvedChange::Update(patch),
        RecordChange::MessageDeleted { id } => ResolvedChange::Delete(id),
        RecordChange::ProfileUpdated(profile) => ResolvedChange::AuthorRefreshed(profile),
    }
}

/// Brings a resolved change up to date with the profile store at apply time.
///
/// Profile updates land in the store here, in arrival order. Inserts whose
/// author is cached take the cached profile, so a lookup that finished before
/// an earlier profile update was applied cannot reintroduce a stale name.
pub fn settle(change: ResolvedChange, profiles: &ProfileStore) -> ResolvedChange {
    match change {
        ResolvedChange::AuthorRefreshed(profile) => {
            ResolvedChange::AuthorRefreshed(profiles.refresh(profile))
        }
        ResolvedChange::Insert(mut message) => {
            if let Some(author) = message.author_id.as_ref().and_then(|id| profiles.get(id)) {
                message.set_author(&author);
            }
            ResolvedChange::Insert(message)
        }
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, TimeZone, Utc};

    use super::*;
    use crate::budchat::adapters::memory::InMemoryBackend;
    use crate::budchat::messages::types::MessageRow;
    use crate::test_utils::*;
    use crate::types::UserId;

    #[test]
    fn test_insert_appends_at_tail() {
        let mut log = MessageLog::from_messages(vec![message_at("m1", "u1", 0)]);
        let applied = log.apply(ResolvedChange::Insert(message_at("m2", "u2", 5)));

        assert!(matches!(applied, Applied::Inserted(ref m) if m.id.as_str() == "m2"));
        assert_eq!(ids(&log), vec!["m1", "m2"]);
    }

    #[test]
    fn test_insert_then_delete_restores_original() {
        let original =
            MessageLog::from_messages(vec![message_at("m1", "u1", 0), message_at("m2", "u1", 1)]);
        let mut log = original.clone();

        log.apply(ResolvedChange::Insert(message_at("m3", "u2", 2)));
        log.apply(ResolvedChange::Delete(MessageId::new("m3")));

        assert_eq!(log, original);
    }

    #[test]
    fn test_update_for_absent_id_is_noop() {
        let original = MessageLog::from_messages(vec![message_at("m1", "u1", 0)]);
        let mut log = original.clone();

        let applied = log.apply(ResolvedChange::Update(MessagePatch::content(
            MessageId::new("missing"),
            "edited",
            Utc::now(),
        )));

        assert_eq!(applied, Applied::Ignored(MessageId::new("missing")));
        assert!(!applied.changed_feed());
        assert_eq!(log, original);
    }

    #[test]
    fn test_delete_for_absent_id_is_noop() {
        let original = MessageLog::from_messages(vec![message_at("m1", "u1", 0)]);
        let mut log = original.clone();
        let applied = log.apply(ResolvedChange::Delete(MessageId::new("missing")));
        assert!(matches!(applied, Applied::Ignored(_)));
        assert_eq!(log, original);
    }

    #[test]
    fn test_update_merges_content_and_updated_at() {
        let created = Utc.with_ymd_and_hms(2025, 1, 1, 10, 0, 0).unwrap();
        let edited_at = created + Duration::minutes(5);
        let mut original = message_at("m1", "u1", 0);
        original.created_at = created;
        let mut log = MessageLog::from_messages(vec![original.clone(), message_at("m2", "u2", 60)]);

        log.apply(ResolvedChange::Update(MessagePatch::content(
            MessageId::new("m1"),
            "edited",
            edited_at,
        )));

        let updated = log.get(&MessageId::new("m1")).unwrap();
        assert_eq!(updated.content, "edited");
        assert_eq!(updated.updated_at, Some(edited_at));
        assert_eq!(updated.created_at, created);
        assert_eq!(updated.author_id, original.author_id);
        assert_eq!(updated.author_name, original.author_name);
        assert_eq!(ids(&log), vec!["m1", "m2"]);
    }

    #[test]
    fn test_update_can_clear_parent() {
        let mut reply = message_at("m2", "u1", 1);
        reply.parent_id = Some(MessageId::new("m1"));
        let mut log = MessageLog::from_messages(vec![message_at("m1", "u1", 0), reply]);

        log.apply(ResolvedChange::Update(MessagePatch {
            id: MessageId::new("m2"),
            content: None,
            updated_at: None,
            parent_message_id: Some(None),
        }));

        let updated = log.get(&MessageId::new("m2")).unwrap();
        assert!(updated.parent_id.is_none());
        assert!(updated.updated_at.is_none());
    }

    #[test]
    fn test_duplicate_insert_is_idempotent() {
        let mut log = MessageLog::from_messages(vec![message_at("m1", "u1", 0)]);
        let applied = log.apply(ResolvedChange::Insert(message_at("m1", "u1", 0)));

        assert!(matches!(applied, Applied::Duplicate(_)));
        assert_eq!(log.len(), 1);
    }

    #[test]
    fn test_late_insert_keeps_log_sorted() {
        let mut log =
            MessageLog::from_messages(vec![message_at("m1", "u1", 0), message_at("m3", "u1", 10)]);
        log.apply(ResolvedChange::Insert(message_at("m2", "u1", 5)));
        log.apply(ResolvedChange::Insert(message_at("m4", "u1", 10)));

        assert!(log.is_sorted());
        assert_eq!(ids(&log), vec!["m1", "m2", "m3", "m4"]);
    }

    #[test]
    fn test_sequence_of_inserts_stays_sorted() {
        let mut log = MessageLog::new();
        for (i, offset) in [3, 1, 4, 1, 5, 9, 2, 6].into_iter().enumerate() {
            log.apply(ResolvedChange::Insert(message_at(&format!("m{i}"), "u1", offset)));
            assert!(log.is_sorted());
        }
        assert_eq!(log.len(), 8);
    }

    #[test]
    fn test_from_messages_sorts_stably() {
        let log = MessageLog::from_messages(vec![
            message_at("b", "u1", 5),
            message_at("a", "u1", 0),
            message_at("c", "u1", 5),
        ]);
        assert_eq!(ids(&log), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_author_refresh_rewrites_display_fields() {
        let mut log = MessageLog::from_messages(vec![
            message_at("m1", "u1", 0),
            message_at("m2", "u2", 1),
            message_at("m3", "u1", 2),
        ]);
        let mut renamed = profile("u1", "ada lovelace");
        renamed.avatar_url = Some("https://example.com/a.svg".to_string());

        let applied = log.apply(ResolvedChange::AuthorRefreshed(renamed));

        assert!(matches!(applied, Applied::AuthorRefreshed { messages: 2, .. }));
        let names: Vec<_> = log.iter().map(|m| m.author_name.as_str()).collect();
        assert_eq!(names, vec!["ada lovelace", "u2", "ada lovelace"]);
        assert_eq!(
            log.get(&MessageId::new("m3")).unwrap().author_avatar.as_deref(),
            Some("https://example.com/a.svg")
        );
    }

    #[tokio::test]
    async fn test_resolve_insert_uses_profile_lookup() {
        let backend = InMemoryBackend::new();
        backend.add_profile(profile("u1", "ada"));
        let profiles = ProfileStore::new();

        let resolved = resolve_change(
            RecordChange::MessageInserted(row("m1", "u1", "hi")),
            &backend,
            &profiles,
        )
        .await;

        match resolved {
            ResolvedChange::Insert(message) => {
                assert_eq!(message.author_name, "ada");
                assert_eq!(message.content, "hi");
            }
            other => panic!("expected insert, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_resolve_insert_with_missing_author_uses_sentinel() {
        let backend = InMemoryBackend::new();
        let profiles = ProfileStore::new();

        let resolved = resolve_change(
            RecordChange::MessageInserted(row("m1", "ghost", "boo")),
            &backend,
            &profiles,
        )
        .await;

        let ResolvedChange::Insert(message) = resolved else {
            panic!("expected insert");
        };
        assert_eq!(message.author_name, UNKNOWN_USER);
        assert_eq!(message.author_id, Some(UserId::new("ghost")));
    }

    #[tokio::test]
    async fn test_resolve_author_less_insert_skips_lookup() {
        let backend = InMemoryBackend::new();
        let profiles = ProfileStore::new();
        let mut orphan = row("m1", "u1", "hi");
        orphan.user_id = None;

        let resolved =
            resolve_change(RecordChange::MessageInserted(orphan), &backend, &profiles).await;

        assert!(matches!(resolved, ResolvedChange::Insert(ref m) if m.author_name == UNKNOWN_USER));
        assert_eq!(backend.profile_lookups(), 0);
    }

    #[tokio::test]
    async fn test_profile_update_refreshes_store_when_settled() {
        let backend = InMemoryBackend::new();
        let profiles = ProfileStore::new();
        profiles.upsert(profile("u1", "old"));

        let resolved = resolve_change(
            RecordChange::ProfileUpdated(profile("u1", "new")),
            &backend,
            &profiles,
        )
        .await;

        assert!(matches!(resolved, ResolvedChange::AuthorRefreshed(_)));
        assert_eq!(
            profiles.get(&UserId::new("u1")).unwrap().display_name(),
            "old"
        );

        settle(resolved, &profiles);
        assert_eq!(
            profiles.get(&UserId::new("u1")).unwrap().display_name(),
            "new"
        );
    }

    #[test]
    fn test_settle_insert_takes_cached_author() {
        let profiles = ProfileStore::new();
        profiles.upsert(profile("u1", "new"));
        let mut stale = message_at("m1", "u1", 0);
        stale.author_name = "old".to_string();

        let settled = settle(ResolvedChange::Insert(stale), &profiles);

        assert!(matches!(settled, ResolvedChange::Insert(ref m) if m.author_name == "new"));
    }

    #[test]
    fn test_settle_leaves_uncached_author_alone() {
        let profiles = ProfileStore::new();
        let mut orphan = message_at("m1", "u1", 0);
        orphan.author_name = UNKNOWN_USER.to_string();

        let settled = settle(ResolvedChange::Insert(orphan), &profiles);

        assert!(matches!(settled, ResolvedChange::Insert(ref m) if m.author_name == UNKNOWN_USER));
    }

    #[test]
    fn test_duplicate_insert_with_sentinel_keeps_author() {
        let mut log = MessageLog::from_messages(vec![message_at("m1", "u1", 0)]);
        let known = log.get(&MessageId::new("m1")).unwrap().author_name.clone();
        let mut echo = message_at("m1", "u1", 0);
        echo.author_name = UNKNOWN_USER.to_string();
        echo.author_avatar = None;
        echo.content = "edited".to_string();

        let applied = log.apply(ResolvedChange::Insert(echo));

        let merged = match applied {
            Applied::Duplicate(merged) => merged,
            other => panic!("expected duplicate, got {other:?}"),
        };
        assert_eq!(merged.author_name, known);
        assert_eq!(merged.content, "edited");
    }

    fn row(id: &str, user: &str, content: &str) -> MessageRow {
        MessageRow {
            id: MessageId::new(id),
            content: content.to_string(),
            created_at: Utc::now(),
            updated_at: None,
            user_id: Some(UserId::new(user)),
            parent_message_id: None,
            profiles: None,
        }
    }

    fn ids(log: &MessageLog) -> Vec<&str> {
        log.iter().map(|m| m.id.as_str()).collect()
    }
}
