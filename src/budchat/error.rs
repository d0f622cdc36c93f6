use thiserror::Error;

use crate::budchat::capabilities::StoreError;

pub type Result<T> = core::result::Result<T, BudChatError>;

/// The initial snapshot could not be read. Blocking for the view that mounted it.
#[derive(Error, Debug)]
pub enum LoadError {
    #[error("Failed to fetch message snapshot: {0}")]
    Fetch(#[source] StoreError),

    #[error("Chat session was unmounted before the snapshot finished loading")]
    Cancelled,
}

/// A live subscription could not be attached or broke while attached.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SubscriptionError {
    #[error("Failed to connect to realtime transport: {0}")]
    Connect(String),

    #[error("Channel join rejected for topic {topic}: {reason}")]
    JoinRejected { topic: String, reason: String },

    #[error("Realtime channel closed")]
    Closed,

    #[error("Realtime protocol error: {0}")]
    Protocol(String),
}

/// Rejected before any write was attempted.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Message cannot be empty")]
    EmptyContent,

    #[error("No signed-in user")]
    MissingIdentity,

    #[error("Only the author can modify this message")]
    NotAuthor,

    #[error("Message {0} is not in the local feed")]
    UnknownMessage(String),

    #[error("Only the profile owner can change the personal message")]
    NotProfileOwner,
}

/// The persistence capability refused a submit, edit or delete.
#[derive(Error, Debug)]
#[error("Write rejected: {0}")]
pub struct WriteError(#[from] pub StoreError);

#[derive(Error, Debug)]
pub enum BudChatError {
    #[error("Filesystem error: {0}")]
    Filesystem(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Backend is not available: {0}")]
    BackendUnavailable(String),

    #[error("Load error: {0}")]
    Load(#[from] LoadError),

    #[error("Subscription error: {0}")]
    Subscription(#[from] SubscriptionError),

    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("{0}")]
    Write(#[from] WriteError),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Other error: {0}")]
    Other(#[from] anyhow::Error),
}

impl BudChatError {
    /// Validation and write failures are recoverable per operation; the draft is kept.
    pub fn is_retryable(&self) -> bool {
        matches!(self, BudChatError::Validation(_) | BudChatError::Write(_))
    }
}
