use crate::budchat::capabilities::MessageStore;
use crate::budchat::error::LoadError;
use crate::budchat::messages::reducer::MessageLog;
use crate::budchat::profiles::ProfileStore;

/// Reads the full message history in one call and builds the initial log.
///
/// Rows whose author join failed are mapped to the sentinel author. Every
/// author that did resolve is seeded into `profiles` so later Inserts by the
/// same author skip the secondary lookup. Nothing is merged into existing
/// state: the caller replaces its log with the result wholesale.
pub async fn load_snapshot(
    store: &dyn MessageStore,
    profiles: &ProfileStore,
) -> Result<MessageLog, LoadError> {
    let rows = store.fetch_message_snapshot().await.map_err(|e| {
        tracing::error!(
            target: "budchat::messages::snapshot::load_snapshot",
            "Failed to fetch message snapshot: {}",
            e
        );
        LoadError::Fetch(e)
    })?;

    let mut messages = Vec::with_capacity(rows.len());
    for row in rows {
        if let Some(profile) = row.joined_profile() {
            profiles.upsert(profile);
        }
        messages.push(row.into_joined_message());
    }

    let log = MessageLog::from_messages(messages);

    tracing::debug!(
        target: "budchat::messages::snapshot::load_snapshot",
        "Loaded {} messages, {} known authors",
        log.len(),
        profiles.len()
    );

    Ok(log)
}
