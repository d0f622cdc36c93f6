use once_cell::sync::OnceCell;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{filter::EnvFilter, fmt::Layer, prelude::*, registry::Registry};

use std::sync::Mutex;

mod budchat;
#[cfg(test)]
mod test_utils;
mod types;

pub use crate::budchat::adapters::memory::InMemoryBackend;
pub use crate::budchat::adapters::realtime::RealtimeClient;
pub use crate::budchat::adapters::rest::RestStore;
pub use crate::budchat::backend::{Backend, Capabilities, Readiness};
pub use crate::budchat::capabilities::{
    ChangeFeed, MessageStore, NewMessage, NoopNotifier, NotificationPlatform, Permission,
    PresenceHandle, PresenceService, PresenceSignal, StoreError, Subscription, Unsubscribe,
};
pub use crate::budchat::composer::{Composer, ComposerState};
pub use crate::budchat::error::{
    BudChatError, LoadError, Result, SubscriptionError, ValidationError, WriteError,
};
pub use crate::budchat::message_streaming::{
    SessionStatus, Toast, UpdateTrigger, ViewSubscription, ViewUpdate,
};
pub use crate::budchat::messages::{Message, MessagePatch, MessageRow, RecordChange, ReplyPreview};
pub use crate::budchat::notifications::{Dispatch, NotificationDispatcher};
pub use crate::budchat::presence::{OnlineStatus, PresencePhase, RosterEntry};
pub use crate::budchat::profiles::{Profile, ProfileStore, UNKNOWN_USER};
pub use crate::budchat::session::ChatSession;
pub use crate::budchat::{BackendConfig, BudChat, BudChatConfig};
pub use crate::types::{MessageId, UserId};

static TRACING_GUARDS: OnceCell<Mutex<Option<(WorkerGuard, WorkerGuard)>>> = OnceCell::new();
static TRACING_INIT: OnceCell<()> = OnceCell::new();

/// Installs stdout and daily-rolling file logging. Only the first call has an effect.
pub fn init_tracing(logs_dir: &std::path::Path) {
    TRACING_INIT.get_or_init(|| {
        let file_appender = match tracing_appender::rolling::RollingFileAppender::builder()
            .rotation(tracing_appender::rolling::Rotation::DAILY)
            .filename_prefix("budchat")
            .filename_suffix("log")
            .build(logs_dir)
        {
            Ok(appender) => appender,
            Err(e) => {
                eprintln!("Failed to create log file appender in {:?}: {}", logs_dir, e);
                return;
            }
        };

        let (non_blocking_file, file_guard) = tracing_appender::non_blocking(file_appender);
        let (non_blocking_stdout, stdout_guard) = tracing_appender::non_blocking(std::io::stdout());

        TRACING_GUARDS
            .set(Mutex::new(Some((file_guard, stdout_guard))))
            .ok();

        let stdout_layer = Layer::new()
            .with_writer(non_blocking_stdout)
            .with_ansi(true)
            .with_target(true);

        let file_layer = Layer::new()
            .with_writer(non_blocking_file)
            .with_ansi(false)
            .with_target(true);

        // A test harness or embedding app may already own the global subscriber.
        let _ = Registry::default()
            .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
            .with(stdout_layer)
            .with(file_layer)
            .try_init();
    });
}
