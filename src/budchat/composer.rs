//! Mutation gateway and the composer's local UI state.
//!
//! Nothing here touches the message log. Submits, edits and deletes go to the
//! persistence capability and the visible feed changes only when the matching
//! change event comes back through the reducer.

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::watch;

use crate::budchat::backend::Backend;
use crate::budchat::capabilities::NewMessage;
use crate::budchat::error::{Result, ValidationError, WriteError};
use crate::budchat::messages::Message;
use crate::types::{MessageId, UserId};

/// Ephemeral composer state. Never persisted.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ComposerState {
    pub draft: String,
    /// At most one message being replied to.
    pub reply_target: Option<MessageId>,
    /// At most one message being edited, with its working text.
    pub edit_target: Option<MessageId>,
    pub edit_draft: String,
}

pub struct Composer {
    backend: Backend,
    local_user: Option<UserId>,
    feed: watch::Receiver<Arc<Vec<Message>>>,
    state: ComposerState,
}

impl Composer {
    pub fn new(
        backend: Backend,
        local_user: Option<UserId>,
        feed: watch::Receiver<Arc<Vec<Message>>>,
    ) -> Self {
        Self {
            backend,
            local_user,
            feed,
            state: ComposerState::default(),
        }
    }

    pub fn state(&self) -> &ComposerState {
        &self.state
    }

    pub fn draft(&self) -> &str {
        &self.state.draft
    }

    pub fn set_draft(&mut self, text: impl Into<String>) {
        self.state.draft = text.into();
    }

    pub fn reply_target(&self) -> Option<&MessageId> {
        self.state.reply_target.as_ref()
    }

    pub fn edit_target(&self) -> Option<&MessageId> {
        self.state.edit_target.as_ref()
    }

    pub fn set_edit_draft(&mut self, text: impl Into<String>) {
        self.state.edit_draft = text.into();
    }

    /// Marks a message as the reply target. The draft is left alone.
    pub fn select_reply_target(&mut self, id: &MessageId) -> std::result::Result<(), ValidationError> {
        self.find(id)?;
        self.state.reply_target = Some(id.clone());
        Ok(())
    }

    pub fn cancel_reply(&mut self) {
        self.state.reply_target = None;
    }

    /// Opens an edit of one of the local user's messages, seeding the edit
    /// draft with its current content.
    pub fn begin_edit(&mut self, id: &MessageId) -> std::result::Result<(), ValidationError> {
        let message = self.find_authored(id)?;
        self.state.edit_draft = message.content;
        self.state.edit_target = Some(id.clone());
        Ok(())
    }

    pub fn cancel_edit(&mut self) {
        self.state.edit_target = None;
        self.state.edit_draft.clear();
    }

    /// Submits the draft, as a reply when a reply target is selected.
    ///
    /// Validation and readiness are checked before any write. The draft and
    /// reply target are cleared only once the write succeeds.
    pub async fn submit(&mut self) -> Result<()> {
        let content = self.state.draft.trim();
        if content.is_empty() {
            return Err(ValidationError::EmptyContent.into());
        }
        let author = self.identity()?.clone();
        let capabilities = self.backend.capabilities()?;

        let message = NewMessage {
            content: content.to_string(),
            author,
            parent: self.state.reply_target.clone(),
        };

        capabilities
            .store
            .submit_message(message)
            .await
            .map_err(WriteError)?;

        tracing::debug!(
            target: "budchat::composer::submit",
            "Message submitted{}",
            if self.state.reply_target.is_some() { " as reply" } else { "" }
        );
        self.state.draft.clear();
        self.state.reply_target = None;
        Ok(())
    }

    /// Submits the open edit.
    pub async fn submit_edit(&mut self) -> Result<()> {
        let Some(id) = self.state.edit_target.clone() else {
            return Err(ValidationError::UnknownMessage("no message is being edited".to_string()).into());
        };
        let content = self.state.edit_draft.clone();
        self.edit(&id, &content).await?;
        self.cancel_edit();
        Ok(())
    }

    /// Replaces the content of one of the local user's messages and stamps `updated_at`.
    pub async fn edit(&self, id: &MessageId, content: &str) -> Result<()> {
        let content = content.trim();
        if content.is_empty() {
            return Err(ValidationError::EmptyContent.into());
        }
        self.find_authored(id)?;
        let capabilities = self.backend.capabilities()?;

        capabilities
            .store
            .update_message(id, content, Utc::now())
            .await
            .map_err(WriteError)?;

        tracing::debug!(target: "budchat::composer::edit", "Edited message {}", id);
        Ok(())
    }

    /// Removes one of the local user's messages at the persistence layer.
    pub async fn delete(&mut self, id: &MessageId) -> Result<()> {
        self.find_authored(id)?;
        let capabilities = self.backend.capabilities()?;

        capabilities
            .store
            .delete_message(id)
            .await
            .map_err(WriteError)?;

        tracing::debug!(target: "budchat::composer::delete", "Deleted message {}", id);
        if self.state.reply_target.as_ref() == Some(id) {
            self.state.reply_target = None;
        }
        if self.state.edit_target.as_ref() == Some(id) {
            self.cancel_edit();
        }
        Ok(())
    }

    fn identity(&self) -> std::result::Result<&UserId, ValidationError> {
        self.local_user.as_ref().ok_or(ValidationError::MissingIdentity)
    }

    fn find(&self, id: &MessageId) -> std::result::Result<Message, ValidationError> {
        self.feed
            .borrow()
            .iter()
            .find(|message| &message.id == id)
            .cloned()
            .ok_or_else(|| ValidationError::UnknownMessage(id.to_string()))
    }

    fn find_authored(&self, id: &MessageId) -> std::result::Result<Message, ValidationError> {
        let user = self.identity()?;
        let message = self.find(id)?;
        if !message.is_authored_by(user) {
            return Err(ValidationError::NotAuthor);
        }
        Ok(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::budchat::adapters::memory::InMemoryBackend;
    use crate::budchat::capabilities::StoreError;
    use crate::budchat::error::BudChatError;
    use crate::test_utils::*;

    fn composer_for(
        memory: &InMemoryBackend,
        user: Option<&str>,
        feed: Vec<Message>,
    ) -> (Composer, watch::Sender<Arc<Vec<Message>>>) {
        let (feed_tx, feed_rx) = watch::channel(Arc::new(feed));
        let composer = Composer::new(
            Backend::ready(memory.capabilities()),
            user.map(UserId::new),
            feed_rx,
        );
        (composer, feed_tx)
    }

    #[tokio::test]
    async fn test_whitespace_submit_is_rejected_without_write() {
        let memory = InMemoryBackend::new();
        let (mut composer, _feed) = composer_for(&memory, Some("u1"), vec![]);
        composer.set_draft("   \n\t ");

        let err = composer.submit().await.unwrap_err();

        assert!(matches!(err, BudChatError::Validation(ValidationError::EmptyContent)));
        assert!(memory.submitted().is_empty());
        assert_eq!(composer.draft(), "   \n\t ");
    }

    #[tokio::test]
    async fn test_submit_requires_identity() {
        let memory = InMemoryBackend::new();
        let (mut composer, _feed) = composer_for(&memory, None, vec![]);
        composer.set_draft("hello");

        let err = composer.submit().await.unwrap_err();
        assert!(matches!(err, BudChatError::Validation(ValidationError::MissingIdentity)));
        assert!(memory.submitted().is_empty());
    }

    #[tokio::test]
    async fn test_submit_requires_ready_backend() {
        let (_tx, feed_rx) = watch::channel(Arc::new(Vec::new()));
        let mut composer = Composer::new(Backend::new(), Some(UserId::new("u1")), feed_rx);
        composer.set_draft("hello");

        let err = composer.submit().await.unwrap_err();
        assert!(matches!(err, BudChatError::BackendUnavailable(_)));
        assert_eq!(composer.draft(), "hello");
    }

    #[tokio::test]
    async fn test_submit_reply_trims_and_clears_state() {
        let memory = InMemoryBackend::new();
        let (mut composer, _feed) =
            composer_for(&memory, Some("u1"), vec![message_at("m1", "u2", 0)]);

        composer.select_reply_target(&MessageId::new("m1")).unwrap();
        composer.set_draft("  thanks!  ");
        composer.submit().await.unwrap();

        let submitted = memory.submitted();
        assert_eq!(submitted.len(), 1);
        assert_eq!(submitted[0].content, "thanks!");
        assert_eq!(submitted[0].author, UserId::new("u1"));
        assert_eq!(submitted[0].parent, Some(MessageId::new("m1")));
        assert!(composer.draft().is_empty());
        assert!(composer.reply_target().is_none());
    }

    #[tokio::test]
    async fn test_failed_write_keeps_draft_and_reply_target() {
        let memory = InMemoryBackend::new();
        memory.fail_writes(StoreError::Rejected {
            status: 403,
            body: "row-level security".to_string(),
        });
        let (mut composer, _feed) =
            composer_for(&memory, Some("u1"), vec![message_at("m1", "u2", 0)]);
        composer.select_reply_target(&MessageId::new("m1")).unwrap();
        composer.set_draft("retry me");

        let err = composer.submit().await.unwrap_err();

        assert!(matches!(err, BudChatError::Write(_)));
        assert!(err.is_retryable());
        assert_eq!(composer.draft(), "retry me");
        assert_eq!(composer.reply_target(), Some(&MessageId::new("m1")));
    }

    #[test]
    fn test_cancel_reply_keeps_draft() {
        let memory = InMemoryBackend::new();
        let (mut composer, _feed) =
            composer_for(&memory, Some("u1"), vec![message_at("m1", "u2", 0)]);
        composer.set_draft("half written");
        composer.select_reply_target(&MessageId::new("m1")).unwrap();

        composer.cancel_reply();

        assert!(composer.reply_target().is_none());
        assert_eq!(composer.draft(), "half written");
    }

    #[test]
    fn test_reply_target_must_be_in_feed() {
        let memory = InMemoryBackend::new();
        let (mut composer, _feed) = composer_for(&memory, Some("u1"), vec![]);
        assert_eq!(
            composer.select_reply_target(&MessageId::new("gone")),
            Err(ValidationError::UnknownMessage("gone".to_string()))
        );
    }

    #[tokio::test]
    async fn test_edit_and_delete_require_authorship() {
        let memory = InMemoryBackend::new();
        let (mut composer, _feed) =
            composer_for(&memory, Some("u1"), vec![message_at("m1", "u2", 0)]);

        let err = composer.edit(&MessageId::new("m1"), "mine now").await.unwrap_err();
        assert!(matches!(err, BudChatError::Validation(ValidationError::NotAuthor)));

        let err = composer.delete(&MessageId::new("m1")).await.unwrap_err();
        assert!(matches!(err, BudChatError::Validation(ValidationError::NotAuthor)));

        assert!(memory.updates().is_empty());
        assert!(memory.deletions().is_empty());
    }

    #[tokio::test]
    async fn test_edit_flow_writes_content_and_stamp() {
        let memory = InMemoryBackend::new();
        let (mut composer, _feed) =
            composer_for(&memory, Some("u1"), vec![message_at("m1", "u1", 0)]);

        composer.begin_edit(&MessageId::new("m1")).unwrap();
        assert_eq!(composer.state().edit_draft, "message m1");
        composer.set_edit_draft("edited");
        composer.submit_edit().await.unwrap();

        let updates = memory.updates();
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].0, MessageId::new("m1"));
        assert_eq!(updates[0].1, "edited");
        assert!(composer.edit_target().is_none());
    }

    #[tokio::test]
    async fn test_delete_goes_to_store_only() {
        let memory = InMemoryBackend::new();
        let feed = vec![message_at("m1", "u1", 0)];
        let (mut composer, feed_tx) = composer_for(&memory, Some("u1"), feed);

        composer.delete(&MessageId::new("m1")).await.unwrap();

        assert_eq!(memory.deletions(), vec![MessageId::new("m1")]);
        // The feed only changes when the Delete event round-trips.
        assert_eq!(feed_tx.borrow().len(), 1);
    }
}
