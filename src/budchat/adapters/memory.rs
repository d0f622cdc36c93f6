//! In-process backend.
//!
//! Implements every capability against shared in-memory tables. Writes are
//! echoed to live change feeds the way the hosted backend echoes committed rows,
//! and presence rooms share one membership map. Used for embedding without a
//! server and as the fake in tests.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::budchat::backend::Capabilities;
use crate::budchat::capabilities::{
    ChangeFeed, MessageStore, NewMessage, NoopNotifier, NotificationPlatform, Permission,
    PresenceCommand, PresenceEndpoint, PresenceHandle, PresenceMeta, PresenceService,
    PresenceSignal, PresenceState, StoreError, Subscription, presence_channel,
    subscription_channel,
};
use crate::budchat::error::SubscriptionError;
use crate::budchat::messages::{AuthorJoin, MessagePatch, MessageRow, RecordChange};
use crate::budchat::profiles::Profile;
use crate::types::{MessageId, UserId};

const FEED_BUFFER: usize = 64;

#[derive(Default)]
struct Tables {
    profiles: HashMap<UserId, Profile>,
    messages: Vec<MessageRow>,

    snapshot_error: Option<StoreError>,
    write_error: Option<StoreError>,
    subscription_error: Option<SubscriptionError>,
    presence_error: Option<SubscriptionError>,
    profile_delays: HashMap<UserId, Duration>,

    profile_lookups: usize,
    submitted: Vec<NewMessage>,
    updates: Vec<(MessageId, String, DateTime<Utc>)>,
    deletions: Vec<MessageId>,

    feeds: Vec<mpsc::Sender<RecordChange>>,
    members: PresenceState,
    rooms: Vec<mpsc::Sender<PresenceSignal>>,
}

#[derive(Clone, Default)]
pub struct InMemoryBackend {
    tables: Arc<Mutex<Tables>>,
}

impl InMemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// The capability bundle, with system notifications disabled.
    pub fn capabilities(&self) -> Capabilities {
        self.capabilities_with_notifier(Arc::new(NoopNotifier))
    }

    pub fn capabilities_with_notifier(
        &self,
        notifier: Arc<dyn NotificationPlatform>,
    ) -> Capabilities {
        Capabilities {
            store: Arc::new(self.clone()),
            changes: Arc::new(self.clone()),
            presence: Arc::new(self.clone()),
            notifier,
        }
    }

    fn tables(&self) -> MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn add_profile(&self, profile: Profile) {
        self.tables().profiles.insert(profile.id.clone(), profile);
    }

    pub fn profile(&self, id: &UserId) -> Option<Profile> {
        self.tables().profiles.get(id).cloned()
    }

    /// Stores a row as-is, without echoing it to change feeds.
    pub fn seed_message(&self, row: MessageRow) {
        self.tables().messages.push(row);
    }

    pub fn fail_snapshot(&self, error: StoreError) {
        self.tables().snapshot_error = Some(error);
    }

    pub fn fail_writes(&self, error: StoreError) {
        self.tables().write_error = Some(error);
    }

    pub fn fail_subscriptions(&self, error: SubscriptionError) {
        self.tables().subscription_error = Some(error);
    }

    pub fn fail_presence(&self, error: SubscriptionError) {
        self.tables().presence_error = Some(error);
    }

    /// Makes profile lookups for `id` take `delay`.
    pub fn delay_profile(&self, id: &UserId, delay: Duration) {
        self.tables().profile_delays.insert(id.clone(), delay);
    }

    pub fn profile_lookups(&self) -> usize {
        self.tables().profile_lookups
    }

    pub fn submitted(&self) -> Vec<NewMessage> {
        self.tables().submitted.clone()
    }

    pub fn updates(&self) -> Vec<(MessageId, String, DateTime<Utc>)> {
        self.tables().updates.clone()
    }

    pub fn deletions(&self) -> Vec<MessageId> {
        self.tables().deletions.clone()
    }

    /// Number of change feeds still attached.
    pub fn live_feeds(&self) -> usize {
        self.tables().feeds.len()
    }

    /// Number of presence rooms still joined.
    pub fn joined_rooms(&self) -> usize {
        self.tables().rooms.len()
    }

    pub fn online_members(&self) -> HashSet<UserId> {
        self.tables().members.keys().cloned().collect()
    }

    /// Delivers a change to every attached feed, in call order.
    pub async fn emit(&self, change: RecordChange) {
        let feeds = self.tables().feeds.clone();
        for feed in feeds {
            if feed.send(change.clone()).await.is_err() {
                tracing::debug!(
                    target: "budchat::adapters::memory::emit",
                    "Dropping change for a closed feed"
                );
            }
        }
    }

    /// Marks a remote member online and syncs every room.
    pub async fn presence_join(&self, id: &UserId) {
        self.tables().members.insert(
            id.clone(),
            vec![PresenceMeta {
                online_at: Some(Utc::now()),
            }],
        );
        self.sync_rooms().await;
    }

    pub async fn presence_leave(&self, id: &UserId) {
        self.tables().members.remove(id);
        self.sync_rooms().await;
    }

    async fn sync_rooms(&self) {
        let (members, rooms) = {
            let tables = self.tables();
            (tables.members.clone(), tables.rooms.clone())
        };
        for room in rooms {
            let _ = room.send(PresenceSignal::Sync(members.clone())).await;
        }
    }

    fn check_write(&self) -> Result<(), StoreError> {
        match &self.tables().write_error {
            Some(error) => Err(error.clone()),
            None => Ok(()),
        }
    }

    async fn run_room(self, local: UserId, endpoint: PresenceEndpoint) {
        let PresenceEndpoint {
            signals,
            mut commands,
        } = endpoint;

        self.tables().rooms.push(signals.clone());
        let _ = signals.send(PresenceSignal::Subscribed).await;
        let members = self.tables().members.clone();
        let _ = signals.send(PresenceSignal::Sync(members)).await;

        while let Some(command) = commands.recv().await {
            match command {
                PresenceCommand::Announce { online_at } => {
                    self.tables().members.insert(
                        local.clone(),
                        vec![PresenceMeta {
                            online_at: Some(online_at),
                        }],
                    );
                    self.sync_rooms().await;
                }
                PresenceCommand::Leave => break,
            }
        }

        {
            let mut tables = self.tables();
            tables.rooms.retain(|room| !room.same_channel(&signals));
            tables.members.remove(&local);
        }
        self.sync_rooms().await;
        tracing::debug!(
            target: "budchat::adapters::memory::run_room",
            "{} left the presence room",
            local
        );
    }
}

#[async_trait]
impl MessageStore for InMemoryBackend {
    async fn fetch_message_snapshot(&self) -> Result<Vec<MessageRow>, StoreError> {
        let tables = self.tables();
        if let Some(error) = &tables.snapshot_error {
            return Err(error.clone());
        }

        let mut rows: Vec<MessageRow> = tables
            .messages
            .iter()
            .cloned()
            .map(|mut row| {
                row.profiles = row
                    .user_id
                    .as_ref()
                    .and_then(|id| tables.profiles.get(id))
                    .map(|profile| AuthorJoin {
                        username: profile.username.clone(),
                        avatar_url: profile.avatar_url.clone(),
                    });
                row
            })
            .collect();
        rows.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(rows)
    }

    async fn fetch_profile(&self, id: &UserId) -> Result<Profile, StoreError> {
        let delay = {
            let mut tables = self.tables();
            tables.profile_lookups += 1;
            tables.profile_delays.get(id).copied()
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.tables()
            .profiles
            .get(id)
            .cloned()
            .ok_or(StoreError::NotFound)
    }

    async fn fetch_roster(&self) -> Result<Vec<Profile>, StoreError> {
        let mut profiles: Vec<Profile> = self.tables().profiles.values().cloned().collect();
        profiles.sort_by(|a, b| a.display_name().cmp(b.display_name()));
        Ok(profiles)
    }

    async fn submit_message(&self, message: NewMessage) -> Result<(), StoreError> {
        self.check_write()?;
        let row = {
            let mut tables = self.tables();
            let row = MessageRow {
                id: MessageId::new(Uuid::new_v4().to_string()),
                content: message.content.clone(),
                created_at: Utc::now(),
                updated_at: None,
                user_id: Some(message.author.clone()),
                parent_message_id: message.parent.clone(),
                profiles: None,
            };
            tables.messages.push(row.clone());
            tables.submitted.push(message);
            row
        };
        self.emit(RecordChange::MessageInserted(row)).await;
        Ok(())
    }

    async fn update_message(
        &self,
        id: &MessageId,
        content: &str,
        updated_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.check_write()?;
        let found = {
            let mut tables = self.tables();
            tables
                .updates
                .push((id.clone(), content.to_string(), updated_at));
            match tables.messages.iter_mut().find(|row| &row.id == id) {
                Some(row) => {
                    row.content = content.to_string();
                    row.updated_at = Some(updated_at);
                    true
                }
                None => false,
            }
        };
        if found {
            self.emit(RecordChange::MessageUpdated(MessagePatch::content(
                id.clone(),
                content,
                updated_at,
            )))
            .await;
        }
        Ok(())
    }

    async fn delete_message(&self, id: &MessageId) -> Result<(), StoreError> {
        self.check_write()?;
        let found = {
            let mut tables = self.tables();
            tables.deletions.push(id.clone());
            let before = tables.messages.len();
            tables.messages.retain(|row| &row.id != id);
            tables.messages.len() != before
        };
        if found {
            self.emit(RecordChange::MessageDeleted { id: id.clone() })
                .await;
        }
        Ok(())
    }

    async fn update_personal_message(
        &self,
        id: &UserId,
        message: &str,
    ) -> Result<(), StoreError> {
        self.check_write()?;
        let profile = {
            let mut tables = self.tables();
            let profile = tables.profiles.get_mut(id).ok_or(StoreError::NotFound)?;
            profile.personal_message = Some(message.to_string());
            profile.clone()
        };
        self.emit(RecordChange::ProfileUpdated(profile)).await;
        Ok(())
    }

    async fn update_avatar(&self, id: &UserId, avatar_url: &str) -> Result<(), StoreError> {
        self.check_write()?;
        let profile = {
            let mut tables = self.tables();
            let profile = tables.profiles.get_mut(id).ok_or(StoreError::NotFound)?;
            profile.avatar_url = Some(avatar_url.to_string());
            profile.clone()
        };
        self.emit(RecordChange::ProfileUpdated(profile)).await;
        Ok(())
    }
}

#[async_trait]
impl ChangeFeed for InMemoryBackend {
    async fn subscribe_to_changes(&self) -> Result<Subscription<RecordChange>, SubscriptionError> {
        if let Some(error) = self.tables().subscription_error.clone() {
            return Err(error);
        }

        let (feed, subscription) = subscription_channel(FEED_BUFFER);
        let sender = feed.sender.clone();
        self.tables().feeds.push(feed.sender);

        let backend = self.clone();
        tokio::spawn(async move {
            let _ = feed.cancelled.await;
            backend
                .tables()
                .feeds
                .retain(|feed| !feed.same_channel(&sender));
        });

        Ok(subscription)
    }
}

#[async_trait]
impl PresenceService for InMemoryBackend {
    async fn join_presence_room(
        &self,
        room_key: &str,
        local_identity: &UserId,
    ) -> Result<PresenceHandle, SubscriptionError> {
        if let Some(error) = self.tables().presence_error.clone() {
            return Err(error);
        }

        tracing::debug!(
            target: "budchat::adapters::memory::join_presence_room",
            "{} joining room {}",
            local_identity,
            room_key
        );
        let (endpoint, handle) = presence_channel(FEED_BUFFER);
        tokio::spawn(self.clone().run_room(local_identity.clone(), endpoint));
        Ok(handle)
    }
}

/// Notification platform that records what it was asked to show.
#[derive(Debug)]
pub struct RecordingNotifier {
    permission: Permission,
    requests: AtomicUsize,
    shown: Mutex<Vec<(String, String)>>,
}

impl RecordingNotifier {
    pub fn new(permission: Permission) -> Self {
        Self {
            permission,
            requests: AtomicUsize::new(0),
            shown: Mutex::new(Vec::new()),
        }
    }

    pub fn permission_requests(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }

    pub fn shown(&self) -> Vec<(String, String)> {
        self.shown
            .lock()
            .map(|shown| shown.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl NotificationPlatform for RecordingNotifier {
    async fn request_notification_permission(&self) -> Permission {
        self.requests.fetch_add(1, Ordering::SeqCst);
        self.permission
    }

    async fn show_system_notification(&self, title: &str, body: &str) -> anyhow::Result<()> {
        self.shown
            .lock()
            .map_err(|_| anyhow::anyhow!("notification log poisoned"))?
            .push((title.to_string(), body.to_string()));
        Ok(())
    }
}
