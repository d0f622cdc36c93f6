//! Presence tracking
//!
//! [`PresenceTracker`] is the per-connection state machine:
//!
//! ```text
//! Unattached -> Subscribing -> Subscribed -> Synced -> Detached
//!                    \______________\___________\-> Degraded
//! ```
//!
//! Every sync signal carries the channel's full membership view and the roster
//! is recomputed from it wholesale. [`RosterTask`] owns the roster and the
//! presence handle and is the only writer of roster liveness.

use std::collections::HashSet;

use chrono::Utc;
use tokio::sync::{mpsc, oneshot};

use super::roster::Roster;
use crate::budchat::capabilities::{PresenceHandle, PresenceSignal};
use crate::budchat::error::SubscriptionError;
use crate::budchat::message_streaming::ViewStreams;
use crate::budchat::profiles::Profile;
use crate::types::UserId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresencePhase {
    Unattached,
    Subscribing,
    Subscribed,
    Synced,
    Detached,
    /// Live presence unavailable; statuses come from the persisted column.
    Degraded,
}

/// What the owner of the presence handle must do after a signal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrackerAction {
    /// Announce local liveness with the current timestamp.
    Announce,
    /// Publish the roster.
    RosterChanged,
    /// Nothing to do.
    Idle,
}

#[derive(Debug)]
pub struct PresenceTracker {
    local: UserId,
    phase: PresencePhase,
    online: Option<HashSet<UserId>>,
}

impl PresenceTracker {
    pub fn new(local: UserId) -> Self {
        Self {
            local,
            phase: PresencePhase::Unattached,
            online: None,
        }
    }

    pub fn local(&self) -> &UserId {
        &self.local
    }

    pub fn phase(&self) -> PresencePhase {
        self.phase
    }

    /// The last authoritative membership set, if a sync has been seen.
    pub fn online(&self) -> Option<&HashSet<UserId>> {
        self.online.as_ref()
    }

    pub fn begin_subscribe(&mut self) {
        if self.phase == PresencePhase::Unattached {
            self.phase = PresencePhase::Subscribing;
        }
    }

    pub fn handle_signal(&mut self, signal: PresenceSignal, roster: &mut Roster) -> TrackerAction {
        if matches!(self.phase, PresencePhase::Detached | PresencePhase::Degraded) {
            return TrackerAction::Idle;
        }

        match signal {
            PresenceSignal::Subscribed => {
                self.phase = PresencePhase::Subscribed;
                TrackerAction::Announce
            }
            PresenceSignal::Sync(state) => {
                let online: HashSet<UserId> = state.into_keys().collect();
                let changed = roster.apply_membership(&online);
                let first_sync = self.online.is_none();
                self.online = Some(online);
                self.phase = PresencePhase::Synced;
                if changed || first_sync {
                    TrackerAction::RosterChanged
                } else {
                    TrackerAction::Idle
                }
            }
            PresenceSignal::Closed(_) => {
                self.degrade(roster);
                TrackerAction::RosterChanged
            }
        }
    }

    /// Falls back to persisted statuses.
    pub fn degrade(&mut self, roster: &mut Roster) {
        self.phase = PresencePhase::Degraded;
        self.online = None;
        let profiles = roster.entries().iter().map(|e| e.profile.clone()).collect();
        roster.replace_profiles(profiles, None);
    }

    pub fn detach(&mut self) {
        self.phase = PresencePhase::Detached;
        self.online = None;
    }
}

/// Requests from the session to the roster owner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RosterCommand {
    /// A fresh roster read; live statuses are re-derived from the last sync.
    ReplaceProfiles(Vec<Profile>),
    /// A profile-update event for one member.
    RefreshProfile(Profile),
}

/// Owns the roster for one mounted view and drives it from presence signals
/// and session commands.
pub struct RosterTask {
    tracker: PresenceTracker,
    roster: Roster,
    handle: Option<PresenceHandle>,
    commands: mpsc::Receiver<RosterCommand>,
    shutdown: oneshot::Receiver<()>,
    streams: ViewStreams,
}

impl RosterTask {
    /// `handle` is `None` when joining the presence room failed; the roster
    /// then runs degraded and only reacts to commands.
    pub fn new(
        local: UserId,
        roster: Roster,
        handle: Result<PresenceHandle, SubscriptionError>,
        commands: mpsc::Receiver<RosterCommand>,
        shutdown: oneshot::Receiver<()>,
        streams: ViewStreams,
    ) -> Self {
        let mut tracker = PresenceTracker::new(local);
        tracker.begin_subscribe();
        let mut roster = roster;

        let handle = match handle {
            Ok(handle) => Some(handle),
            Err(e) => {
                tracing::error!(
                    target: "budchat::presence::tracker::new",
                    "Presence unavailable, rendering roster from persisted status: {}",
                    e
                );
                tracker.degrade(&mut roster);
                streams.presence_unavailable(e.to_string());
                None
            }
        };

        streams.publish_roster(roster.snapshot());

        Self {
            tracker,
            roster,
            handle,
            commands,
            shutdown,
            streams,
        }
    }

    pub fn phase(&self) -> PresencePhase {
        self.tracker.phase()
    }

    pub async fn run(mut self) {
        tracing::debug!(
            target: "budchat::presence::tracker::run",
            "Starting roster task for {}",
            self.tracker.local()
        );

        loop {
            tokio::select! {
                _ = &mut self.shutdown => {
                    if let Some(handle) = self.handle.take() {
                        handle.leave();
                    }
                    self.tracker.detach();
                    tracing::debug!(
                        target: "budchat::presence::tracker::run",
                        "Roster task detached"
                    );
                    break;
                }
                signal = next_signal(&mut self.handle) => {
                    match signal {
                        Some(signal) => self.on_signal(signal).await,
                        None => {
                            tracing::warn!(
                                target: "budchat::presence::tracker::run",
                                "Presence channel closed, falling back to persisted status"
                            );
                            self.handle = None;
                            self.tracker.degrade(&mut self.roster);
                            self.streams.presence_unavailable("presence channel closed");
                            self.streams.publish_roster(self.roster.snapshot());
                        }
                    }
                }
                command = self.commands.recv() => {
                    match command {
                        Some(command) => self.on_command(command),
                        None => break,
                    }
                }
            }
        }
    }

    async fn on_signal(&mut self, signal: PresenceSignal) {
        if let PresenceSignal::Closed(reason) = &signal {
            let reason = reason
                .as_ref()
                .map(|e| e.to_string())
                .unwrap_or_else(|| "presence channel closed".to_string());
            self.streams.presence_unavailable(reason);
            self.handle = None;
        }

        match self.tracker.handle_signal(signal, &mut self.roster) {
            TrackerAction::Announce => {
                let Some(handle) = &self.handle else { return };
                if let Err(e) = handle.announce(Utc::now()).await {
                    tracing::warn!(
                        target: "budchat::presence::tracker::on_signal",
                        "Failed to announce presence: {}",
                        e
                    );
                }
            }
            TrackerAction::RosterChanged => {
                tracing::debug!(
                    target: "budchat::presence::tracker::on_signal",
                    "Roster recomputed, {} online",
                    self.tracker.online().map_or(0, HashSet::len)
                );
                self.streams.publish_roster(self.roster.snapshot());
            }
            TrackerAction::Idle => {}
        }
    }

    fn on_command(&mut self, command: RosterCommand) {
        match command {
            RosterCommand::ReplaceProfiles(profiles) => {
                self.roster
                    .replace_profiles(profiles, self.tracker.online());
            }
            RosterCommand::RefreshProfile(profile) => {
                if !self.roster.refresh_profile(profile) {
                    return;
                }
            }
        }
        self.streams.publish_roster(self.roster.snapshot());
    }
}

async fn next_signal(handle: &mut Option<PresenceHandle>) -> Option<PresenceSignal> {
    match handle {
        Some(handle) => handle.recv().await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::time::Duration;

    use super::*;
    use crate::budchat::capabilities::{PresenceCommand, PresenceMeta, PresenceState, presence_channel};
    use crate::budchat::presence::OnlineStatus;
    use crate::test_utils::*;

    fn state(ids: &[&str]) -> PresenceState {
        ids.iter()
            .map(|id| (UserId::new(*id), vec![PresenceMeta::default()]))
            .collect::<HashMap<_, _>>()
    }

    fn roster_abc() -> Roster {
        Roster::from_profiles(vec![profile("A", "a"), profile("B", "b"), profile("C", "c")])
    }

    #[test]
    fn test_state_machine_transitions() {
        let mut roster = roster_abc();
        let mut tracker = PresenceTracker::new(UserId::new("A"));
        assert_eq!(tracker.phase(), PresencePhase::Unattached);

        tracker.begin_subscribe();
        assert_eq!(tracker.phase(), PresencePhase::Subscribing);

        let action = tracker.handle_signal(PresenceSignal::Subscribed, &mut roster);
        assert_eq!(action, TrackerAction::Announce);
        assert_eq!(tracker.phase(), PresencePhase::Subscribed);

        let action = tracker.handle_signal(PresenceSignal::Sync(state(&["A", "C"])), &mut roster);
        assert_eq!(action, TrackerAction::RosterChanged);
        assert_eq!(tracker.phase(), PresencePhase::Synced);

        tracker.detach();
        assert_eq!(tracker.phase(), PresencePhase::Detached);
        let action = tracker.handle_signal(PresenceSignal::Sync(state(&["B"])), &mut roster);
        assert_eq!(action, TrackerAction::Idle);
    }

    #[test]
    fn test_sync_yields_exact_statuses() {
        let mut roster = roster_abc();
        let mut tracker = PresenceTracker::new(UserId::new("A"));
        tracker.begin_subscribe();

        tracker.handle_signal(PresenceSignal::Sync(state(&["A", "C"])), &mut roster);
        let status = |id: &str| roster.get(&UserId::new(id)).unwrap().status;
        assert_eq!(status("A"), OnlineStatus::Online);
        assert_eq!(status("B"), OnlineStatus::Offline);
        assert_eq!(status("C"), OnlineStatus::Online);

        tracker.handle_signal(PresenceSignal::Sync(state(&["A"])), &mut roster);
        let status = |id: &str| roster.get(&UserId::new(id)).unwrap().status;
        assert_eq!(status("C"), OnlineStatus::Offline);
    }

    #[test]
    fn test_identical_sync_is_idle() {
        let mut roster = roster_abc();
        let mut tracker = PresenceTracker::new(UserId::new("A"));
        tracker.handle_signal(PresenceSignal::Sync(state(&["A"])), &mut roster);
        let action = tracker.handle_signal(PresenceSignal::Sync(state(&["A"])), &mut roster);
        assert_eq!(action, TrackerAction::Idle);
    }

    #[test]
    fn test_closed_degrades_to_persisted_status() {
        let mut persisted = profile("B", "b");
        persisted.status = Some("online".to_string());
        let mut roster = Roster::from_profiles(vec![profile("A", "a"), persisted]);
        let mut tracker = PresenceTracker::new(UserId::new("A"));

        tracker.handle_signal(PresenceSignal::Sync(state(&["A"])), &mut roster);
        tracker.handle_signal(PresenceSignal::Closed(None), &mut roster);

        assert_eq!(tracker.phase(), PresencePhase::Degraded);
        assert!(tracker.online().is_none());
        assert_eq!(roster.get(&UserId::new("A")).unwrap().status, OnlineStatus::Offline);
        assert_eq!(roster.get(&UserId::new("B")).unwrap().status, OnlineStatus::Online);
    }

    #[tokio::test]
    async fn test_roster_task_announces_and_syncs() {
        let (mut endpoint, handle) = presence_channel(8);
        let (command_tx, command_rx) = mpsc::channel(8);
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let streams = ViewStreams::new();
        let mut view = streams.subscribe();

        let task = RosterTask::new(
            UserId::new("A"),
            roster_abc(),
            Ok(handle),
            command_rx,
            shutdown_rx,
            streams.clone(),
        );
        let join = tokio::spawn(task.run());

        endpoint.signals.send(PresenceSignal::Subscribed).await.unwrap();
        let command = tokio::time::timeout(Duration::from_secs(1), endpoint.commands.recv())
            .await
            .unwrap();
        assert!(matches!(command, Some(PresenceCommand::Announce { .. })));

        endpoint
            .signals
            .send(PresenceSignal::Sync(state(&["A", "C"])))
            .await
            .unwrap();
        wait_for_roster(&mut view.roster, |entries| {
            entries.iter().filter(|e| e.status.is_online()).count() == 2
        })
        .await;

        command_tx
            .send(RosterCommand::ReplaceProfiles(vec![
                profile("A", "a"),
                profile("D", "d"),
            ]))
            .await
            .unwrap();
        wait_for_roster(&mut view.roster, |entries| entries.len() == 2).await;
        let roster = streams.roster();
        assert!(roster[0].status.is_online());
        assert!(!roster[1].status.is_online());

        shutdown_tx.send(()).unwrap();
        join.await.unwrap();
        assert_eq!(endpoint.commands.recv().await, Some(PresenceCommand::Leave));
    }

    #[tokio::test]
    async fn test_roster_task_degrades_when_join_fails() {
        let (_command_tx, command_rx) = mpsc::channel(8);
        let (_shutdown_tx, shutdown_rx) = oneshot::channel();
        let streams = ViewStreams::new();
        let mut view = streams.subscribe();

        let task = RosterTask::new(
            UserId::new("A"),
            roster_abc(),
            Err(SubscriptionError::Connect("refused".to_string())),
            command_rx,
            shutdown_rx,
            streams.clone(),
        );

        assert_eq!(task.phase(), PresencePhase::Degraded);
        assert_eq!(streams.roster().len(), 3);
        assert!(matches!(
            view.updates.try_recv().unwrap(),
            crate::budchat::message_streaming::ViewUpdate::PresenceUnavailable { .. }
        ));
    }
}
