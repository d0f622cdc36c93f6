//! Capabilities consumed by the sync engine.
//!
//! Persistence, the change stream, the presence channel and the platform
//! notification surface are external collaborators. The engine only sees the
//! traits below; concrete transports live in [`crate::budchat::adapters`].

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

use crate::budchat::error::SubscriptionError;
use crate::budchat::messages::{MessageRow, RecordChange};
use crate::budchat::profiles::Profile;
use crate::types::{MessageId, UserId};

/// Errors reported by the persistence capability.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("Record not found")]
    NotFound,

    #[error("Request failed: {0}")]
    Request(String),

    #[error("Rejected with status {status}: {body}")]
    Rejected { status: u16, body: String },

    #[error("Failed to decode response: {0}")]
    Decode(String),
}

/// A message as handed to the persistence layer. Id and timestamps are assigned there.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewMessage {
    pub content: String,
    #[serde(rename = "user_id")]
    pub author: UserId,
    #[serde(rename = "parent_message_id")]
    pub parent: Option<MessageId>,
}

#[async_trait]
pub trait MessageStore: Send + Sync {
    /// All messages joined with author name and avatar, oldest first.
    async fn fetch_message_snapshot(&self) -> Result<Vec<MessageRow>, StoreError>;

    async fn fetch_profile(&self, id: &UserId) -> Result<Profile, StoreError>;

    /// All member profiles ordered by display name.
    async fn fetch_roster(&self) -> Result<Vec<Profile>, StoreError>;

    async fn submit_message(&self, message: NewMessage) -> Result<(), StoreError>;

    async fn update_message(
        &self,
        id: &MessageId,
        content: &str,
        updated_at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    async fn delete_message(&self, id: &MessageId) -> Result<(), StoreError>;

    async fn update_personal_message(&self, id: &UserId, message: &str)
        -> Result<(), StoreError>;

    async fn update_avatar(&self, id: &UserId, avatar_url: &str) -> Result<(), StoreError>;
}

/// Cancels a live subscription. Dropping it has the same effect as calling
/// [`Unsubscribe::unsubscribe`].
#[derive(Debug)]
pub struct Unsubscribe(Option<oneshot::Sender<()>>);

impl Unsubscribe {
    pub fn unsubscribe(mut self) {
        if let Some(cancel) = self.0.take() {
            let _ = cancel.send(());
        }
    }
}

/// Receiving side of a live subscription.
#[derive(Debug)]
pub struct Subscription<T> {
    pub events: mpsc::Receiver<T>,
    pub unsubscribe: Unsubscribe,
}

/// Transport side of a live subscription.
///
/// `cancelled` resolves once the consumer unsubscribes or drops its handle.
#[derive(Debug)]
pub struct SubscriptionFeed<T> {
    pub sender: mpsc::Sender<T>,
    pub cancelled: oneshot::Receiver<()>,
}

pub fn subscription_channel<T>(buffer: usize) -> (SubscriptionFeed<T>, Subscription<T>) {
    let (sender, events) = mpsc::channel(buffer);
    let (cancel, cancelled) = oneshot::channel();
    (
        SubscriptionFeed { sender, cancelled },
        Subscription {
            events,
            unsubscribe: Unsubscribe(Some(cancel)),
        },
    )
}

#[async_trait]
pub trait ChangeFeed: Send + Sync {
    /// Insert/Update/Delete notifications for messages, and profile updates,
    /// in commit order.
    async fn subscribe_to_changes(&self) -> Result<Subscription<RecordChange>, SubscriptionError>;
}

/// Metadata a member tracked when joining the room.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct PresenceMeta {
    #[serde(default)]
    pub online_at: Option<DateTime<Utc>>,
}

/// The channel's current membership view. Presence in the map means online.
pub type PresenceState = HashMap<UserId, Vec<PresenceMeta>>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PresenceSignal {
    /// The join was confirmed.
    Subscribed,
    /// Authoritative membership after any join or leave.
    Sync(PresenceState),
    /// The transport went away.
    Closed(Option<SubscriptionError>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PresenceCommand {
    Announce { online_at: DateTime<Utc> },
    Leave,
}

/// Consumer side of a joined presence room.
#[derive(Debug)]
pub struct PresenceHandle {
    signals: mpsc::Receiver<PresenceSignal>,
    commands: mpsc::Sender<PresenceCommand>,
}

impl PresenceHandle {
    pub async fn recv(&mut self) -> Option<PresenceSignal> {
        self.signals.recv().await
    }

    pub async fn announce(&self, online_at: DateTime<Utc>) -> Result<(), SubscriptionError> {
        self.commands
            .send(PresenceCommand::Announce { online_at })
            .await
            .map_err(|_| SubscriptionError::Closed)
    }

    /// Leaves the room without waiting. Dropping the handle also leaves.
    pub fn leave(&self) {
        let _ = self.commands.try_send(PresenceCommand::Leave);
    }

    /// A detached way to leave, for owners that hand the handle to a task.
    pub fn leaver(&self) -> PresenceLeaver {
        PresenceLeaver(self.commands.clone())
    }
}

#[derive(Debug, Clone)]
pub struct PresenceLeaver(mpsc::Sender<PresenceCommand>);

impl PresenceLeaver {
    pub fn leave(&self) {
        let _ = self.0.try_send(PresenceCommand::Leave);
    }
}

/// Transport side of a joined presence room.
#[derive(Debug)]
pub struct PresenceEndpoint {
    pub signals: mpsc::Sender<PresenceSignal>,
    pub commands: mpsc::Receiver<PresenceCommand>,
}

pub fn presence_channel(buffer: usize) -> (PresenceEndpoint, PresenceHandle) {
    let (signal_tx, signal_rx) = mpsc::channel(buffer);
    let (command_tx, command_rx) = mpsc::channel(buffer);
    (
        PresenceEndpoint {
            signals: signal_tx,
            commands: command_rx,
        },
        PresenceHandle {
            signals: signal_rx,
            commands: command_tx,
        },
    )
}

#[async_trait]
pub trait PresenceService: Send + Sync {
    /// Opens the shared room `room_key`, tracking the local member under its own identity.
    async fn join_presence_room(
        &self,
        room_key: &str,
        local_identity: &UserId,
    ) -> Result<PresenceHandle, SubscriptionError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Permission {
    Granted,
    Denied,
}

#[async_trait]
pub trait NotificationPlatform: Send + Sync {
    async fn request_notification_permission(&self) -> Permission;

    async fn show_system_notification(&self, title: &str, body: &str) -> anyhow::Result<()>;
}

/// Platform without system notifications. Permission is always denied.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopNotifier;

#[async_trait]
impl NotificationPlatform for NoopNotifier {
    async fn request_notification_permission(&self) -> Permission {
        Permission::Denied
    }

    async fn show_system_notification(&self, _title: &str, _body: &str) -> anyhow::Result<()> {
        Ok(())
    }
}
