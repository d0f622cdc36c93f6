//! Member profiles and the identity-indexed profile store.

use std::sync::Arc;

use dashmap::DashMap;
use rand::Rng;
use rand::distr::Alphanumeric;
use serde::{Deserialize, Serialize};

use crate::budchat::capabilities::{MessageStore, StoreError};
use crate::types::UserId;

/// Display name used whenever an author cannot be resolved.
pub const UNKNOWN_USER: &str = "Unknown User";

const AVATAR_BASE_URL: &str = "https://api.dicebear.com/9.x/notionists-neutral/svg";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Profile {
    pub id: UserId,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub avatar_url: Option<String>,
    /// Persisted status column. Only consulted when live presence is unavailable.
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub personal_message: Option<String>,
}

impl Profile {
    pub fn new(id: UserId, username: impl Into<String>) -> Self {
        Self {
            id,
            username: Some(username.into()),
            avatar_url: None,
            status: None,
            personal_message: None,
        }
    }

    /// Placeholder for an author whose profile is missing or deleted.
    pub fn sentinel(id: UserId) -> Self {
        Self {
            id,
            username: None,
            avatar_url: None,
            status: None,
            personal_message: None,
        }
    }

    pub fn display_name(&self) -> &str {
        match self.username.as_deref() {
            Some(name) if !name.trim().is_empty() => name,
            _ => UNKNOWN_USER,
        }
    }

    pub fn has_avatar(&self) -> bool {
        self.avatar_url.as_deref().is_some_and(|url| !url.is_empty())
    }
}

/// Identity-indexed profile cache owned by the engine.
///
/// Entries are filled by snapshot joins and by lookups, and refreshed only by
/// explicit invalidation on profile-update events.
#[derive(Debug, Default)]
pub struct ProfileStore {
    profiles: DashMap<UserId, Profile>,
}

impl ProfileStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: &UserId) -> Option<Profile> {
        self.profiles.get(id).map(|entry| entry.value().clone())
    }

    pub fn upsert(&self, profile: Profile) {
        self.profiles.insert(profile.id.clone(), profile);
    }

    pub fn invalidate(&self, id: &UserId) -> Option<Profile> {
        self.profiles.remove(id).map(|(_, profile)| profile)
    }

    pub fn len(&self) -> usize {
        self.profiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.profiles.is_empty()
    }

    /// Resolves an author, hitting the persistence layer only on a cache miss.
    ///
    /// A missing profile or a failed lookup yields the sentinel, which is not cached
    /// so the author can still resolve once the profile exists.
    pub async fn resolve(&self, store: &dyn MessageStore, id: &UserId) -> Profile {
        if let Some(profile) = self.get(id) {
            return profile;
        }

        match store.fetch_profile(id).await {
            Ok(profile) => self
                .profiles
                .entry(id.clone())
                .or_insert(profile)
                .value()
                .clone(),
            Err(StoreError::NotFound) => {
                tracing::warn!(
                    target: "budchat::profiles::resolve",
                    "Profile {} not found, using sentinel author",
                    id
                );
                Profile::sentinel(id.clone())
            }
            Err(e) => {
                tracing::warn!(
                    target: "budchat::profiles::resolve",
                    "Profile lookup for {} failed, using sentinel author: {}",
                    id,
                    e
                );
                Profile::sentinel(id.clone())
            }
        }
    }

    /// Replaces the cached entry with `incoming` in one step.
    pub fn refresh(&self, incoming: Profile) -> Profile {
        self.upsert(incoming.clone());
        incoming
    }
}

/// Generates a random avatar URL for a member who has none.
pub fn random_avatar_url() -> String {
    let seed: String = rand::rng()
        .sample_iter(&Alphanumeric)
        .take(8)
        .map(|c| char::from(c).to_ascii_lowercase())
        .collect();
    format!("{AVATAR_BASE_URL}?seed={seed}")
}

/// Assigns a generated avatar to `user` when the stored profile has none.
///
/// Returns the assigned URL, or `None` when nothing was written. Never fails:
/// lookup and write problems are logged.
pub async fn ensure_avatar(
    store: &dyn MessageStore,
    profiles: &Arc<ProfileStore>,
    user: &UserId,
) -> Option<String> {
    let profile = match store.fetch_profile(user).await {
        Ok(profile) => profile,
        Err(e) => {
            tracing::warn!(
                target: "budchat::profiles::ensure_avatar",
                "Could not read profile {} before avatar assignment: {}",
                user,
                e
            );
            return None;
        }
    };

    if profile.has_avatar() {
        tracing::debug!(
            target: "budchat::profiles::ensure_avatar",
            "Profile {} already has an avatar",
            user
        );
        return None;
    }

    let avatar_url = random_avatar_url();
    match store.update_avatar(user, &avatar_url).await {
        Ok(()) => {
            profiles.refresh(Profile {
                avatar_url: Some(avatar_url.clone()),
                ..profile
            });
            tracing::info!(
                target: "budchat::profiles::ensure_avatar",
                "Assigned avatar to profile {}",
                user
            );
            Some(avatar_url)
        }
        Err(e) => {
            tracing::warn!(
                target: "budchat::profiles::ensure_avatar",
                "Failed to assign avatar to profile {}: {}",
                user,
                e
            );
            None
        }
    }
}
