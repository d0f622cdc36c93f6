//! Types for pushing view updates.
//!
//! The engine never lets the view read mutable state: every admitted change
//! produces a fresh immutable snapshot plus an event describing what triggered it.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, watch};

use crate::budchat::messages::Message;
use crate::budchat::presence::RosterEntry;
use crate::types::MessageId;

/// What triggered a view update.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum UpdateTrigger {
    /// The feed was replaced by a freshly loaded snapshot.
    SnapshotLoaded,

    /// A new message was admitted.
    NewMessage,

    /// An existing message changed (edit or duplicate Insert merged in place).
    MessageEdited,

    /// A message was removed.
    MessageDeleted,

    /// Author display fields changed after a profile update.
    AuthorRefreshed,
}

/// In-app alert raised for a message from someone else.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Toast {
    pub message_id: MessageId,
    pub title: String,
    pub body: String,
}

/// Liveness of the session as shown by the view.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionStatus {
    /// Snapshot in flight. The view shows a spinner.
    Loading,

    /// Change stream attached.
    Live,

    /// The change stream could not be attached or was lost; the feed no longer updates.
    Static { reason: String },

    /// Snapshot failed. No partial render.
    LoadFailed { reason: String },

    /// The session was unmounted.
    Detached,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ViewUpdate {
    Feed {
        trigger: UpdateTrigger,
        /// The affected message in its current state (the removed one for deletes).
        message: Option<Message>,
    },
    /// Roster entries or their online status changed.
    Roster,
    /// Live presence could not be attached; statuses fall back to persisted values.
    PresenceUnavailable { reason: String },
    Toast(Toast),
    Status(SessionStatus),
}

/// Handles a view needs to render and redraw.
///
/// The `watch` receivers always hold the latest immutable snapshot; `updates`
/// tells the view why it changed.
pub struct ViewSubscription {
    pub messages: watch::Receiver<Arc<Vec<Message>>>,
    pub roster: watch::Receiver<Arc<Vec<RosterEntry>>>,
    pub status: watch::Receiver<SessionStatus>,
    pub updates: broadcast::Receiver<ViewUpdate>,
}
