//! Notification dispatcher.

use std::sync::Arc;

use crate::budchat::capabilities::{NotificationPlatform, Permission};
use crate::budchat::message_streaming::{Toast, ViewStreams};
use crate::budchat::messages::Message;
use crate::types::UserId;

/// What was raised for an admitted message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    /// Own message, or notifications disabled.
    Suppressed,
    InApp,
    InAppAndSystem,
}

pub struct NotificationDispatcher {
    local_user: Option<UserId>,
    notifier: Arc<dyn NotificationPlatform>,
    permission: Permission,
    enabled: bool,
    streams: ViewStreams,
}

impl NotificationDispatcher {
    /// Asks the platform for permission once; the answer holds for the session.
    pub async fn new(
        local_user: Option<UserId>,
        notifier: Arc<dyn NotificationPlatform>,
        enabled: bool,
        streams: ViewStreams,
    ) -> Self {
        let permission = if enabled {
            notifier.request_notification_permission().await
        } else {
            Permission::Denied
        };
        tracing::debug!(
            target: "budchat::notifications::new",
            "System notification permission: {:?}",
            permission
        );

        Self {
            local_user,
            notifier,
            permission,
            enabled,
            streams,
        }
    }

    pub fn permission(&self) -> Permission {
        self.permission
    }

    /// Called for every newly admitted Insert.
    pub async fn dispatch(&self, message: &Message) -> Dispatch {
        if !self.enabled {
            return Dispatch::Suppressed;
        }
        if let Some(local) = &self.local_user {
            if message.is_authored_by(local) {
                return Dispatch::Suppressed;
            }
        }

        let toast = Toast {
            message_id: message.id.clone(),
            title: format!("New message from {}", message.author_name),
            body: message.content.clone(),
        };
        self.streams.toast(toast.clone());

        if self.permission != Permission::Granted {
            return Dispatch::InApp;
        }

        match self
            .notifier
            .show_system_notification(&toast.title, &toast.body)
            .await
        {
            Ok(()) => Dispatch::InAppAndSystem,
            Err(e) => {
                tracing::warn!(
                    target: "budchat::notifications::dispatch",
                    "System notification failed: {}",
                    e
                );
                Dispatch::InApp
            }
        }
    }
}
