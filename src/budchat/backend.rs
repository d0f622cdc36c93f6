//! Backend readiness.
//!
//! The capability bundle is built once and handed to every consumer through a
//! [`Backend`] handle. Consumers never see a half-built client: the handle is
//! either not ready, ready with all capabilities, or failed with a reason.

use std::fmt;
use std::sync::Arc;

use tokio::sync::watch;

use crate::budchat::capabilities::{ChangeFeed, MessageStore, NotificationPlatform, PresenceService};
use crate::budchat::error::{BudChatError, Result};

/// Everything the engine consumes from the outside world.
#[derive(Clone)]
pub struct Capabilities {
    pub store: Arc<dyn MessageStore>,
    pub changes: Arc<dyn ChangeFeed>,
    pub presence: Arc<dyn PresenceService>,
    pub notifier: Arc<dyn NotificationPlatform>,
}

impl fmt::Debug for Capabilities {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Capabilities").finish_non_exhaustive()
    }
}

#[derive(Debug, Clone)]
pub enum Readiness {
    NotReady,
    Ready(Capabilities),
    Failed(String),
}

impl Readiness {
    pub fn is_ready(&self) -> bool {
        matches!(self, Readiness::Ready(_))
    }
}

/// Shared handle to the process's capability bundle.
#[derive(Debug, Clone)]
pub struct Backend {
    state: Arc<watch::Sender<Readiness>>,
}

impl Backend {
    pub fn new() -> Self {
        Self {
            state: Arc::new(watch::Sender::new(Readiness::NotReady)),
        }
    }

    pub fn ready(capabilities: Capabilities) -> Self {
        let backend = Self::new();
        backend.mark_ready(capabilities);
        backend
    }

    pub fn mark_ready(&self, capabilities: Capabilities) {
        tracing::info!(target: "budchat::backend::mark_ready", "Backend ready");
        self.state.send_replace(Readiness::Ready(capabilities));
    }

    pub fn mark_failed(&self, reason: impl Into<String>) {
        let reason = reason.into();
        tracing::error!(
            target: "budchat::backend::mark_failed",
            "Backend initialization failed: {}",
            reason
        );
        self.state.send_replace(Readiness::Failed(reason));
    }

    pub fn readiness(&self) -> Readiness {
        self.state.borrow().clone()
    }

    pub fn is_ready(&self) -> bool {
        self.state.borrow().is_ready()
    }

    /// The capabilities, without waiting.
    pub fn capabilities(&self) -> Result<Capabilities> {
        match &*self.state.borrow() {
            Readiness::Ready(capabilities) => Ok(capabilities.clone()),
            Readiness::NotReady => Err(BudChatError::BackendUnavailable(
                "backend is still initializing".to_string(),
            )),
            Readiness::Failed(reason) => Err(BudChatError::BackendUnavailable(reason.clone())),
        }
    }

    /// Waits until initialization settles, then returns the capabilities or the failure.
    pub async fn wait_ready(&self) -> Result<Capabilities> {
        let mut rx = self.state.subscribe();
        let settled = rx
            .wait_for(|state| !matches!(state, Readiness::NotReady))
            .await
            .map_err(|_| BudChatError::BackendUnavailable("backend dropped".to_string()))?
            .clone();

        match settled {
            Readiness::Ready(capabilities) => Ok(capabilities),
            Readiness::Failed(reason) => Err(BudChatError::BackendUnavailable(reason)),
            Readiness::NotReady => Err(BudChatError::BackendUnavailable(
                "backend is still initializing".to_string(),
            )),
        }
    }
}

impl Default for Backend {
    fn default() -> Self {
        Self::new()
    }
}
