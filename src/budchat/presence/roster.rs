use std::collections::HashSet;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::budchat::profiles::Profile;
use crate::types::UserId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OnlineStatus {
    Online,
    Offline,
}

impl OnlineStatus {
    /// Reads the persisted status column. Anything other than `online` is offline.
    pub fn from_persisted(status: Option<&str>) -> Self {
        match status {
            Some(status) if status.eq_ignore_ascii_case("online") => OnlineStatus::Online,
            _ => OnlineStatus::Offline,
        }
    }

    pub fn is_online(self) -> bool {
        self == OnlineStatus::Online
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RosterEntry {
    pub profile: Profile,
    pub status: OnlineStatus,
}

impl RosterEntry {
    pub fn id(&self) -> &UserId {
        &self.profile.id
    }

    pub fn display_name(&self) -> &str {
        self.profile.display_name()
    }

    /// Personal status message cut to `max_chars` characters, with `...` appended
    /// when it was longer. `None` when the member has no message.
    pub fn personal_message_preview(&self, max_chars: usize) -> Option<String> {
        let message = self.profile.personal_message.as_deref()?;
        if message.is_empty() {
            return None;
        }
        if message.chars().count() > max_chars {
            let truncated: String = message.chars().take(max_chars).collect();
            Some(format!("{truncated}..."))
        } else {
            Some(message.to_string())
        }
    }
}

/// Member list with derived online/offline status, ordered by display name.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Roster {
    entries: Vec<RosterEntry>,
}

impl Roster {
    /// Builds the roster with statuses taken from the persisted column.
    pub fn from_profiles(mut profiles: Vec<Profile>) -> Self {
        profiles.sort_by(|a, b| a.display_name().cmp(b.display_name()));
        let entries = profiles
            .into_iter()
            .map(|profile| RosterEntry {
                status: OnlineStatus::from_persisted(profile.status.as_deref()),
                profile,
            })
            .collect();
        Self { entries }
    }

    pub fn entries(&self) -> &[RosterEntry] {
        &self.entries
    }

    pub fn get(&self, id: &UserId) -> Option<&RosterEntry> {
        self.entries.iter().find(|entry| entry.id() == id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn snapshot(&self) -> Arc<Vec<RosterEntry>> {
        Arc::new(self.entries.clone())
    }

    /// Re-derives every entry's status from the authoritative online set.
    /// Returns whether any status changed.
    pub fn apply_membership(&mut self, online: &HashSet<UserId>) -> bool {
        let mut changed = false;
        for entry in &mut self.entries {
            let status = if online.contains(entry.id()) {
                OnlineStatus::Online
            } else {
                OnlineStatus::Offline
            };
            changed |= entry.status != status;
            entry.status = status;
        }
        changed
    }

    /// Replaces the member list, keeping live statuses when a membership set is known.
    pub fn replace_profiles(&mut self, profiles: Vec<Profile>, online: Option<&HashSet<UserId>>) {
        *self = Self::from_profiles(profiles);
        if let Some(online) = online {
            self.apply_membership(online);
        }
    }

    /// Updates one member's profile fields in place. Returns false for unknown members.
    pub fn refresh_profile(&mut self, profile: Profile) -> bool {
        let Some(entry) = self.entries.iter_mut().find(|entry| entry.id() == &profile.id) else {
            return false;
        };
        let renamed = entry.profile.display_name() != profile.display_name();
        entry.profile = profile;
        if renamed {
            self.entries
                .sort_by(|a, b| a.display_name().cmp(b.display_name()));
        }
        true
    }
}
