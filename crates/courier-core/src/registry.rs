//! Connection registry for Courier.
//!
//! Maps each online user to the set of currently open delivery channels.
//! A user may hold any number of concurrent connections (multi-device);
//! presence transitions are derived from the first channel appearing and
//! the last one disappearing, decided under the per-user map lock so a
//! register/unregister race can never disagree with the channel set.

use crate::event::{now_millis, ServerEvent, UserId};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;

/// A process-unique connection identifier.
pub type ConnectionId = u64;

/// Default outbound buffer per channel.
const DEFAULT_CHANNEL_CAPACITY: usize = 256;

/// One live delivery path to a connected client instance.
#[derive(Debug, Clone)]
pub struct Channel {
    /// Process-unique connection id.
    pub connection_id: ConnectionId,
    /// Owning user.
    pub user_id: UserId,
    /// When the connection was opened, ms since epoch.
    pub opened_at: u64,
    /// Outbound push sender; the transport layer drains the receiver.
    pub tx: mpsc::Sender<Arc<ServerEvent>>,
}

/// A presence transition produced by a registry mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresenceTransition {
    /// First connection for the user appeared.
    WentOnline,
    /// Last connection for the user disappeared; stamped at removal time.
    WentOffline { last_seen: u64 },
}

#[derive(Debug)]
struct UserEntry {
    username: String,
    channels: HashMap<ConnectionId, Channel>,
}

/// Registry statistics snapshot.
#[derive(Debug, Clone)]
pub struct RegistryStats {
    /// Number of users with at least one open channel.
    pub user_count: usize,
    /// Total open channels.
    pub connection_count: usize,
}

/// The connection registry.
///
/// All mutation for a given user happens under that user's map entry lock,
/// which is held only for the in-memory update. No lock here ever spans a
/// persistence or network call.
#[derive(Debug, Default)]
pub struct Registry {
    users: DashMap<UserId, UserEntry>,
    owners: DashMap<ConnectionId, UserId>,
    next_connection_id: AtomicU64,
}

impl Registry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The default outbound buffer size for a new channel.
    #[must_use]
    pub fn default_capacity() -> usize {
        DEFAULT_CHANNEL_CAPACITY
    }

    /// Register a new connection for an authenticated user.
    ///
    /// Never fails. Returns the new connection id and, if this is the
    /// user's first channel, the `WentOnline` transition.
    pub fn register(
        &self,
        user_id: UserId,
        username: &str,
        tx: mpsc::Sender<Arc<ServerEvent>>,
    ) -> (ConnectionId, Option<PresenceTransition>) {
        let connection_id = self.next_connection_id.fetch_add(1, Ordering::Relaxed);
        let channel = Channel {
            connection_id,
            user_id,
            opened_at: now_millis(),
            tx,
        };

        let mut entry = self.users.entry(user_id).or_insert_with(|| UserEntry {
            username: username.to_string(),
            channels: HashMap::new(),
        });
        let was_offline = entry.channels.is_empty();
        entry.channels.insert(connection_id, channel);
        let channel_count = entry.channels.len();
        drop(entry);

        self.owners.insert(connection_id, user_id);

        debug!(
            user = user_id,
            connection = connection_id,
            channels = channel_count,
            "Connection registered"
        );

        let transition = was_offline.then_some(PresenceTransition::WentOnline);
        (connection_id, transition)
    }

    /// Remove a connection.
    ///
    /// Unknown ids are a silent no-op (duplicate disconnect events are
    /// expected). Returns the owning user and, if this was the user's last
    /// channel, the `WentOffline` transition with last-seen stamped now.
    pub fn unregister(
        &self,
        connection_id: ConnectionId,
    ) -> Option<(UserId, Option<PresenceTransition>)> {
        let (_, user_id) = self.owners.remove(&connection_id)?;

        let mut transition = None;
        if let Entry::Occupied(mut entry) = self.users.entry(user_id) {
            let removed = entry.get_mut().channels.remove(&connection_id).is_some();
            if removed && entry.get().channels.is_empty() {
                entry.remove();
                transition = Some(PresenceTransition::WentOffline {
                    last_seen: now_millis(),
                });
            }
        }

        debug!(
            user = user_id,
            connection = connection_id,
            went_offline = transition.is_some(),
            "Connection unregistered"
        );

        Some((user_id, transition))
    }

    /// The current channel set for a user.
    ///
    /// An empty set means the user is offline; callers must not treat that
    /// as an error.
    #[must_use]
    pub fn channels_for(&self, user_id: UserId) -> Vec<Channel> {
        self.users
            .get(&user_id)
            .map(|e| e.channels.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Every open channel across all users, for global broadcasts.
    #[must_use]
    pub fn all_channels(&self) -> Vec<Channel> {
        self.users
            .iter()
            .flat_map(|e| e.channels.values().cloned().collect::<Vec<_>>())
            .collect()
    }

    /// The user owning a connection, if it is still registered.
    #[must_use]
    pub fn owner_of(&self, connection_id: ConnectionId) -> Option<UserId> {
        self.owners.get(&connection_id).map(|u| *u)
    }

    /// The username recorded for an online user.
    #[must_use]
    pub fn username_of(&self, user_id: UserId) -> Option<String> {
        self.users.get(&user_id).map(|e| e.username.clone())
    }

    /// Whether the user currently has any open channel.
    #[must_use]
    pub fn is_online(&self, user_id: UserId) -> bool {
        self.users
            .get(&user_id)
            .map(|e| !e.channels.is_empty())
            .unwrap_or(false)
    }

    /// Registry statistics.
    #[must_use]
    pub fn stats(&self) -> RegistryStats {
        RegistryStats {
            user_count: self.users.len(),
            connection_count: self.owners.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn push_channel() -> mpsc::Sender<Arc<ServerEvent>> {
        let (tx, rx) = mpsc::channel(8);
        std::mem::forget(rx);
        tx
    }

    #[test]
    fn test_register_first_connection_goes_online() {
        let registry = Registry::new();

        let (conn, transition) = registry.register(1, "alice", push_channel());
        assert_eq!(transition, Some(PresenceTransition::WentOnline));
        assert!(registry.is_online(1));
        assert_eq!(registry.owner_of(conn), Some(1));
        assert_eq!(registry.channels_for(1).len(), 1);
    }

    #[test]
    fn test_second_connection_no_transition() {
        let registry = Registry::new();

        let (_c1, t1) = registry.register(1, "alice", push_channel());
        let (_c2, t2) = registry.register(1, "alice", push_channel());
        assert_eq!(t1, Some(PresenceTransition::WentOnline));
        assert_eq!(t2, None);
        assert_eq!(registry.channels_for(1).len(), 2);
    }

    #[test]
    fn test_unregister_last_connection_goes_offline() {
        let registry = Registry::new();

        let (c1, _) = registry.register(1, "alice", push_channel());
        let (c2, _) = registry.register(1, "alice", push_channel());

        let (user, t) = registry.unregister(c1).unwrap();
        assert_eq!(user, 1);
        assert_eq!(t, None);
        assert!(registry.is_online(1));

        let (_, t) = registry.unregister(c2).unwrap();
        assert!(matches!(t, Some(PresenceTransition::WentOffline { .. })));
        assert!(!registry.is_online(1));
        assert!(registry.channels_for(1).is_empty());
    }

    #[test]
    fn test_duplicate_unregister_is_noop() {
        let registry = Registry::new();

        let (conn, _) = registry.register(1, "alice", push_channel());
        assert!(registry.unregister(conn).is_some());
        assert!(registry.unregister(conn).is_none());
        assert!(registry.unregister(9999).is_none());
    }

    #[test]
    fn test_stats() {
        let registry = Registry::new();

        registry.register(1, "alice", push_channel());
        registry.register(1, "alice", push_channel());
        registry.register(2, "bob", push_channel());

        let stats = registry.stats();
        assert_eq!(stats.user_count, 2);
        assert_eq!(stats.connection_count, 3);
    }

    #[tokio::test]
    async fn test_concurrent_register_unregister_keeps_invariant() {
        let registry = Arc::new(Registry::new());

        let mut handles = Vec::new();
        for _ in 0..8 {
            let registry = Arc::clone(&registry);
            handles.push(tokio::spawn(async move {
                for _ in 0..100 {
                    let (conn, _) = registry.register(1, "alice", push_channel());
                    tokio::task::yield_now().await;
                    registry.unregister(conn);
                }
            }));
        }
        for h in handles {
            h.await.unwrap();
        }

        // online iff the channel set is non-empty, and both must agree
        assert_eq!(registry.is_online(1), !registry.channels_for(1).is_empty());
        assert!(!registry.is_online(1));
        assert_eq!(registry.stats().connection_count, 0);
    }
}
