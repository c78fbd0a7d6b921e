//! Presence tracking for Courier.
//!
//! Presence is a derived value: a user is online exactly when their channel
//! set in the registry is non-empty. The tracker consumes transitions
//! produced by registry mutations and turns each into exactly one
//! `PresenceChanged` broadcast event. Nothing else mutates presence state.

use crate::event::{ServerEvent, UserId};
use crate::registry::PresenceTransition;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Online/last-seen status for a single user.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceState {
    /// Whether the user has at least one open channel.
    pub online: bool,
    /// When the user last went offline, ms since epoch. `None` until the
    /// user has disconnected at least once.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_seen: Option<u64>,
}

/// Tracks presence for all users seen by this process.
#[derive(Debug, Default)]
pub struct PresenceTracker {
    states: DashMap<UserId, PresenceState>,
}

impl PresenceTracker {
    /// Create an empty tracker.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply a registry transition and produce the broadcast event for it.
    ///
    /// `OFFLINE -> ONLINE` on the first connection, `ONLINE -> OFFLINE` on
    /// the last removal. The offline transition carries the last-seen stamp
    /// from the triggering disconnect, not the broadcast time.
    pub fn apply(&self, user_id: UserId, transition: PresenceTransition) -> ServerEvent {
        let mut state = self.states.entry(user_id).or_default();
        match transition {
            PresenceTransition::WentOnline => {
                state.online = true;
                debug!(user = user_id, "Presence: online");
            }
            PresenceTransition::WentOffline { last_seen } => {
                state.online = false;
                state.last_seen = Some(last_seen);
                debug!(user = user_id, last_seen, "Presence: offline");
            }
        }

        ServerEvent::PresenceChanged {
            user_id,
            online: state.online,
            last_seen: state.last_seen,
        }
    }

    /// The current presence of a user. Users never seen are offline with no
    /// last-seen stamp.
    #[must_use]
    pub fn get(&self, user_id: UserId) -> PresenceState {
        self.states
            .get(&user_id)
            .map(|s| s.clone())
            .unwrap_or_default()
    }

    /// Snapshot of every tracked user's presence.
    #[must_use]
    pub fn snapshot(&self) -> Vec<(UserId, PresenceState)> {
        self.states
            .iter()
            .map(|e| (*e.key(), e.value().clone()))
            .collect()
    }
}
