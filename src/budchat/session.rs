//! Chat session: one mounted chat view.
//!
//! Mounting waits for the backend, loads the snapshot, and only then attaches
//! the change feed, so no event can reference rows that are not loaded yet.
//! The message log lives inside the reducer task and the roster inside the
//! roster task; the view only ever sees immutable snapshots.

use std::sync::Arc;

use futures::StreamExt;
use futures::stream::FuturesOrdered;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use crate::budchat::BudChat;
use crate::budchat::backend::{Backend, Capabilities};
use crate::budchat::capabilities::{MessageStore, PresenceLeaver, Unsubscribe};
use crate::budchat::composer::Composer;
use crate::budchat::error::{Result, SubscriptionError, ValidationError, WriteError};
use crate::budchat::message_streaming::{SessionStatus, UpdateTrigger, ViewStreams, ViewSubscription};
use crate::budchat::messages::{
    Applied, Message, MessageLog, RecordChange, ReplyPreview, ResolvedChange, load_snapshot,
    reply_preview, resolve_change, settle,
};
use crate::budchat::notifications::NotificationDispatcher;
use crate::budchat::presence::{Roster, RosterCommand, RosterEntry, RosterTask};
use crate::budchat::profiles::{Profile, ProfileStore, ensure_avatar};
use crate::types::UserId;

const ROSTER_COMMAND_BUFFER: usize = 16;

/// Flipped once when the session is torn down. Work that completes after
/// that must not touch session state.
#[derive(Debug, Clone)]
struct Lifetime {
    alive: Arc<watch::Sender<bool>>,
}

impl Lifetime {
    fn new() -> Self {
        Self {
            alive: Arc::new(watch::Sender::new(true)),
        }
    }

    fn is_alive(&self) -> bool {
        *self.alive.borrow()
    }

    fn end(&self) {
        self.alive.send_replace(false);
    }

    async fn ended(&self) {
        let mut rx = self.alive.subscribe();
        let _ = rx.wait_for(|alive| !*alive).await;
    }
}

/// Everything the reducer task needs besides the log itself.
struct ReducerContext {
    store: Arc<dyn MessageStore>,
    profiles: Arc<ProfileStore>,
    streams: ViewStreams,
    dispatcher: NotificationDispatcher,
    roster: mpsc::Sender<RosterCommand>,
    lifetime: Lifetime,
}

pub struct ChatSession {
    local_user: Option<UserId>,
    capabilities: Capabilities,
    profiles: Arc<ProfileStore>,
    streams: ViewStreams,
    composer: Composer,
    lifetime: Lifetime,
    status_preview_len: usize,

    changes: Option<Unsubscribe>,
    presence: Option<PresenceLeaver>,
    roster_commands: mpsc::Sender<RosterCommand>,
    roster_shutdown: Option<oneshot::Sender<()>>,
    tasks: Vec<JoinHandle<()>>,
}

impl ChatSession {
    /// Mounts a chat view for `local_user`.
    ///
    /// A snapshot failure is returned as a load error. A change feed
    /// that cannot be attached leaves the session static; presence that cannot
    /// be attached leaves the roster on persisted status. Neither is an error.
    pub async fn mount(budchat: &BudChat, local_user: Option<UserId>) -> Result<Self> {
        Self::mount_with(
            budchat.backend(),
            budchat.profiles().clone(),
            local_user,
            MountOptions {
                presence_room: budchat.config.presence_room.clone(),
                status_preview_len: budchat.config.status_preview_len,
                notifications: budchat.config.notifications,
            },
        )
        .await
    }

    async fn mount_with(
        backend: &Backend,
        profiles: Arc<ProfileStore>,
        local_user: Option<UserId>,
        options: MountOptions,
    ) -> Result<Self> {
        let capabilities = backend.wait_ready().await?;
        let streams = ViewStreams::new();
        let lifetime = Lifetime::new();

        tracing::info!(
            target: "budchat::session::mount",
            "Mounting chat session for {}",
            local_user.as_ref().map_or("anonymous", UserId::as_str)
        );

        let log = match load_snapshot(capabilities.store.as_ref(), &profiles).await {
            Ok(log) => log,
            Err(e) => {
                tracing::error!(
                    target: "budchat::session::mount",
                    "Snapshot load failed: {}",
                    e
                );
                streams.set_status(SessionStatus::LoadFailed {
                    reason: e.to_string(),
                });
                return Err(e.into());
            }
        };
        streams.publish_feed(log.snapshot(), UpdateTrigger::SnapshotLoaded, None);

        let mut tasks = Vec::new();

        // Roster first, so profile updates from the feed have somewhere to go.
        let (roster_commands, roster_rx) = mpsc::channel(ROSTER_COMMAND_BUFFER);
        let (roster_shutdown, shutdown_rx) = oneshot::channel();
        let roster = Self::load_roster(capabilities.store.as_ref(), &profiles).await;
        let joined = match &local_user {
            Some(user) => {
                capabilities
                    .presence
                    .join_presence_room(&options.presence_room, user)
                    .await
            }
            None => Err(SubscriptionError::Connect("no signed-in user".to_string())),
        };
        let presence = joined.as_ref().ok().map(|handle| handle.leaver());
        let roster_task = RosterTask::new(
            local_user.clone().unwrap_or_else(|| UserId::new("")),
            roster,
            joined,
            roster_rx,
            shutdown_rx,
            streams.clone(),
        );
        tasks.push(tokio::spawn(roster_task.run()));

        let changes = match capabilities.changes.subscribe_to_changes().await {
            Ok(subscription) => {
                let dispatcher = NotificationDispatcher::new(
                    local_user.clone(),
                    capabilities.notifier.clone(),
                    options.notifications,
                    streams.clone(),
                )
                .await;
                let context = ReducerContext {
                    store: capabilities.store.clone(),
                    profiles: profiles.clone(),
                    streams: streams.clone(),
                    dispatcher,
                    roster: roster_commands.clone(),
                    lifetime: lifetime.clone(),
                };
                tasks.push(tokio::spawn(run_reducer(subscription.events, log, context)));
                streams.set_status(SessionStatus::Live);
                Some(subscription.unsubscribe)
            }
            Err(e) => {
                tracing::error!(
                    target: "budchat::session::mount",
                    "Change feed unavailable, session is static: {}",
                    e
                );
                streams.set_status(SessionStatus::Static {
                    reason: e.to_string(),
                });
                None
            }
        };

        if let Some(user) = &local_user {
            let store = capabilities.store.clone();
            let profiles = profiles.clone();
            let user = user.clone();
            tasks.push(tokio::spawn(async move {
                ensure_avatar(store.as_ref(), &profiles, &user).await;
            }));
        }

        let composer = Composer::new(
            backend.clone(),
            local_user.clone(),
            streams.subscribe().messages,
        );

        Ok(Self {
            local_user,
            capabilities,
            profiles,
            streams,
            composer,
            lifetime,
            status_preview_len: options.status_preview_len,
            changes,
            presence,
            roster_commands,
            roster_shutdown: Some(roster_shutdown),
            tasks,
        })
    }

    async fn load_roster(store: &dyn MessageStore, profiles: &ProfileStore) -> Roster {
        match store.fetch_roster().await {
            Ok(members) => {
                for member in &members {
                    profiles.upsert(member.clone());
                }
                Roster::from_profiles(members)
            }
            Err(e) => {
                tracing::warn!(
                    target: "budchat::session::load_roster",
                    "Failed to load roster: {}",
                    e
                );
                Roster::default()
            }
        }
    }

    pub fn local_user(&self) -> Option<&UserId> {
        self.local_user.as_ref()
    }

    pub fn subscribe(&self) -> ViewSubscription {
        self.streams.subscribe()
    }

    pub fn messages(&self) -> Arc<Vec<Message>> {
        self.streams.messages()
    }

    pub fn roster(&self) -> Arc<Vec<RosterEntry>> {
        self.streams.roster()
    }

    pub fn status(&self) -> SessionStatus {
        self.streams.status()
    }

    pub fn profiles(&self) -> &Arc<ProfileStore> {
        &self.profiles
    }

    pub fn composer(&mut self) -> &mut Composer {
        &mut self.composer
    }

    /// Parent preview for a reply, from the current feed.
    pub fn reply_preview(&self, message: &Message) -> Option<ReplyPreview> {
        reply_preview(&self.streams.messages(), message)
    }

    /// A roster member's personal message as shown in the roster.
    pub fn status_preview(&self, entry: &RosterEntry) -> Option<String> {
        entry.personal_message_preview(self.status_preview_len)
    }

    /// Changes a member's personal message. Only the member may change their own.
    ///
    /// On success the roster is re-read; live statuses carry over from the last sync.
    pub async fn set_personal_message(&self, user: &UserId, message: &str) -> Result<()> {
        let local = self
            .local_user
            .as_ref()
            .ok_or(ValidationError::MissingIdentity)?;
        if local != user {
            return Err(ValidationError::NotProfileOwner.into());
        }

        self.capabilities
            .store
            .update_personal_message(user, message)
            .await
            .map_err(WriteError)?;

        tracing::debug!(
            target: "budchat::session::set_personal_message",
            "Personal message updated for {}",
            user
        );

        match self.capabilities.store.fetch_roster().await {
            Ok(members) => {
                if self
                    .roster_commands
                    .send(RosterCommand::ReplaceProfiles(members))
                    .await
                    .is_err()
                {
                    tracing::debug!(
                        target: "budchat::session::set_personal_message",
                        "Roster task already stopped"
                    );
                }
            }
            Err(e) => {
                tracing::warn!(
                    target: "budchat::session::set_personal_message",
                    "Failed to refresh roster after personal message update: {}",
                    e
                );
            }
        }
        Ok(())
    }

    /// Tears the view down. Subscriptions are cancelled before this returns.
    pub fn unmount(mut self) {
        self.detach();
    }

    fn detach(&mut self) {
        if !self.lifetime.is_alive() {
            return;
        }
        self.lifetime.end();

        if let Some(changes) = self.changes.take() {
            changes.unsubscribe();
        }
        if let Some(presence) = self.presence.take() {
            presence.leave();
        }
        if let Some(shutdown) = self.roster_shutdown.take() {
            let _ = shutdown.send(());
        }
        self.streams.set_status(SessionStatus::Detached);

        tracing::info!(
            target: "budchat::session::detach",
            "Chat session detached ({} background tasks winding down)",
            self.tasks.iter().filter(|task| !task.is_finished()).count()
        );
    }
}

impl Drop for ChatSession {
    fn drop(&mut self) {
        self.detach();
    }
}

impl std::fmt::Debug for ChatSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChatSession")
            .field("local_user", &self.local_user)
            .field("status", &self.streams.status())
            .field("alive", &self.lifetime.is_alive())
            .finish()
    }
}

struct MountOptions {
    presence_room: String,
    status_preview_len: usize,
    notifications: bool,
}

/// Pulls change events, resolves them concurrently, and applies them to the
/// log strictly in arrival order.
async fn run_reducer(
    mut events: mpsc::Receiver<RecordChange>,
    mut log: MessageLog,
    context: ReducerContext,
) {
    let mut pending = FuturesOrdered::new();
    let mut feed_open = true;

    loop {
        if !feed_open && pending.is_empty() {
            break;
        }

        tokio::select! {
            _ = context.lifetime.ended() => break,
            event = events.recv(), if feed_open => match event {
                Some(change) => {
                    tracing::debug!(
                        target: "budchat::session::run_reducer",
                        "Received {} event",
                        change.kind()
                    );
                    let store = context.store.clone();
                    let profiles = context.profiles.clone();
                    pending.push_back(async move {
                        resolve_change(change, store.as_ref(), &profiles).await
                    });
                }
                None => feed_open = false,
            },
            Some(resolved) = pending.next() => {
                if !context.lifetime.is_alive() {
                    break;
                }
                admit(&mut log, resolved, &context).await;
            }
        }
    }

    if context.lifetime.is_alive() {
        tracing::warn!(
            target: "budchat::session::run_reducer",
            "Change feed closed, session is now static"
        );
        context.streams.set_status(SessionStatus::Static {
            reason: "change feed closed".to_string(),
        });
    } else {
        tracing::debug!(
            target: "budchat::session::run_reducer",
            "Reducer stopped with {} lookups discarded",
            pending.len()
        );
    }
}

async fn admit(
    log: &mut MessageLog,
    resolved: ResolvedChange,
    context: &ReducerContext,
) {
    let applied = log.apply(settle(resolved, &context.profiles));
    if !applied.changed_feed() {
        if let Applied::AuthorRefreshed { profile, .. } = applied {
            refresh_roster(context, profile).await;
        }
        return;
    }

    let snapshot = log.snapshot();
    match applied {
        Applied::Inserted(message) => {
            context
                .streams
                .publish_feed(snapshot, UpdateTrigger::NewMessage, Some(message.clone()));
            context.dispatcher.dispatch(&message).await;
        }
        Applied::Duplicate(message) | Applied::Updated(message) => {
            context
                .streams
                .publish_feed(snapshot, UpdateTrigger::MessageEdited, Some(message));
        }
        Applied::Deleted(message) => {
            context
                .streams
                .publish_feed(snapshot, UpdateTrigger::MessageDeleted, Some(message));
        }
        Applied::AuthorRefreshed { profile, messages } => {
            tracing::debug!(
                target: "budchat::session::admit",
                "Refreshed author fields on {} messages for {}",
                messages,
                profile.id
            );
            context
                .streams
                .publish_feed(snapshot, UpdateTrigger::AuthorRefreshed, None);
            refresh_roster(context, profile).await;
        }
        Applied::Ignored(_) => {}
    }
}

async fn refresh_roster(context: &ReducerContext, profile: Profile) {
    let id = profile.id.clone();
    if context
        .roster
        .send(RosterCommand::RefreshProfile(profile))
        .await
        .is_err()
    {
        tracing::warn!(
            target: "budchat::session::admit",
            "Roster task stopped, dropping profile refresh for {}",
            id
        );
    }
}
