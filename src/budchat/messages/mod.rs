//! Message feed
//!
//! Builds the ordered in-memory feed from a snapshot and keeps it current by
//! reducing change-stream events into it.

pub mod reducer;
pub mod snapshot;
pub mod threads;
mod types;

pub use reducer::{Applied, MessageLog, ResolvedChange, resolve_change, settle};
pub use snapshot::load_snapshot;
pub use threads::{ReplyPreview, parent_of, reply_preview};
pub use types::{AuthorJoin, Message, MessagePatch, MessageRow, RecordChange};
