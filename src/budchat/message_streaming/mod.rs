//! View Streaming Module
//!
//! Pushes immutable snapshots of the feed and roster to the rendering layer as
//! changes are admitted, so views redraw from messages instead of polling state.

mod manager;
mod types;

pub use manager::ViewStreams;
pub use types::{SessionStatus, Toast, UpdateTrigger, ViewSubscription, ViewUpdate};
