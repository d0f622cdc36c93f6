//! View stream manager for a single mounted chat view.
//!
//! Keeps the latest feed/roster/status snapshots in `watch` channels and fans
//! out update events over a `broadcast` channel. Publishing with no subscribers
//! is a no-op apart from replacing the stored snapshot.

use std::sync::Arc;

use tokio::sync::{broadcast, watch};

use super::types::{SessionStatus, Toast, UpdateTrigger, ViewSubscription, ViewUpdate};
use crate::budchat::messages::Message;
use crate::budchat::presence::RosterEntry;

const BUFFER_SIZE: usize = 100;

#[derive(Debug, Clone)]
pub struct ViewStreams {
    messages: watch::Sender<Arc<Vec<Message>>>,
    roster: watch::Sender<Arc<Vec<RosterEntry>>>,
    status: watch::Sender<SessionStatus>,
    updates: broadcast::Sender<ViewUpdate>,
}

impl ViewStreams {
    pub fn new() -> Self {
        Self {
            messages: watch::Sender::new(Arc::new(Vec::new())),
            roster: watch::Sender::new(Arc::new(Vec::new())),
            status: watch::Sender::new(SessionStatus::Loading),
            updates: broadcast::channel(BUFFER_SIZE).0,
        }
    }

    pub fn subscribe(&self) -> ViewSubscription {
        ViewSubscription {
            messages: self.messages.subscribe(),
            roster: self.roster.subscribe(),
            status: self.status.subscribe(),
            updates: self.updates.subscribe(),
        }
    }

    pub fn messages(&self) -> Arc<Vec<Message>> {
        self.messages.borrow().clone()
    }

    pub fn roster(&self) -> Arc<Vec<RosterEntry>> {
        self.roster.borrow().clone()
    }

    pub fn status(&self) -> SessionStatus {
        self.status.borrow().clone()
    }

    pub fn publish_feed(
        &self,
        snapshot: Arc<Vec<Message>>,
        trigger: UpdateTrigger,
        message: Option<Message>,
    ) {
        self.messages.send_replace(snapshot);
        self.emit(ViewUpdate::Feed { trigger, message });
    }

    pub fn publish_roster(&self, snapshot: Arc<Vec<RosterEntry>>) {
        self.roster.send_replace(snapshot);
        self.emit(ViewUpdate::Roster);
    }

    pub fn presence_unavailable(&self, reason: impl Into<String>) {
        self.emit(ViewUpdate::PresenceUnavailable {
            reason: reason.into(),
        });
    }

    pub fn toast(&self, toast: Toast) {
        self.emit(ViewUpdate::Toast(toast));
    }

    pub fn set_status(&self, status: SessionStatus) {
        if *self.status.borrow() == status {
            return;
        }
        self.status.send_replace(status.clone());
        self.emit(ViewUpdate::Status(status));
    }

    fn emit(&self, update: ViewUpdate) {
        // Err only means nobody is listening right now.
        let _ = self.updates.send(update);
    }
}

impl Default for ViewStreams {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::*;

    #[test]
    fn test_new_streams_start_empty_and_loading() {
        let streams = ViewStreams::new();
        assert!(streams.messages().is_empty());
        assert!(streams.roster().is_empty());
        assert_eq!(streams.status(), SessionStatus::Loading);
    }

    #[tokio::test]
    async fn test_publish_feed_delivers_snapshot_and_event() {
        let streams = ViewStreams::new();
        let mut view = streams.subscribe();

        let message = message_at("m1", "u1", 0);
        streams.publish_feed(
            Arc::new(vec![message.clone()]),
            UpdateTrigger::NewMessage,
            Some(message.clone()),
        );

        let received = view.updates.try_recv().expect("should receive update");
        assert_eq!(
            received,
            ViewUpdate::Feed {
                trigger: UpdateTrigger::NewMessage,
                message: Some(message),
            }
        );
        assert!(view.messages.has_changed().unwrap());
        assert_eq!(view.messages.borrow_and_update().len(), 1);
    }

    #[test]
    fn test_publish_without_subscribers_keeps_snapshot() {
        let streams = ViewStreams::new();
        streams.publish_feed(
            Arc::new(vec![message_at("m1", "u1", 0)]),
            UpdateTrigger::SnapshotLoaded,
            None,
        );
        assert_eq!(streams.messages().len(), 1);
    }

    #[test]
    fn test_set_status_deduplicates() {
        let streams = ViewStreams::new();
        let mut view = streams.subscribe();

        streams.set_status(SessionStatus::Live);
        streams.set_status(SessionStatus::Live);

        assert_eq!(
            view.updates.try_recv().unwrap(),
            ViewUpdate::Status(SessionStatus::Live)
        );
        assert!(view.updates.try_recv().is_err());
    }

    #[test]
    fn test_snapshots_are_immutable_copies() {
        let streams = ViewStreams::new();
        let first = Arc::new(vec![message_at("m1", "u1", 0)]);
        streams.publish_feed(first.clone(), UpdateTrigger::SnapshotLoaded, None);
        let held = streams.messages();

        streams.publish_feed(Arc::new(Vec::new()), UpdateTrigger::MessageDeleted, None);

        assert_eq!(held.len(), 1);
        assert!(streams.messages().is_empty());
    }
}
