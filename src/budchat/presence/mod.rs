//! Member roster and live online/offline tracking.

mod roster;
mod tracker;

pub use roster::{OnlineStatus, Roster, RosterEntry};
pub use tracker::{PresencePhase, PresenceTracker, RosterCommand, RosterTask, TrackerAction};
