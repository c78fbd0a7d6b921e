//! In-memory gateway implementations.
//!
//! `MemoryStore` backs both collaborator traits for the bundled server
//! binary and for tests. It keeps a user table with login tokens, group
//! membership, and a message store with a reply index keyed by parent
//! message id. A production deployment would put a real database behind
//! [`PersistenceGateway`] instead.

use crate::event::{now_millis, GroupId, MessageId, NewMessage, StoredMessage, UserId};
use crate::gateway::{AuthError, GatewayError, IdentityResolver, PersistenceGateway, UserProfile};
use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicI64, Ordering};

#[derive(Debug, Clone)]
struct UserRecord {
    id: UserId,
    username: String,
}

#[derive(Debug, Default)]
struct GroupRecord {
    name: String,
    members: HashSet<UserId>,
}

/// An in-memory user/group/message store.
#[derive(Debug, Default)]
pub struct MemoryStore {
    users: DashMap<UserId, UserRecord>,
    tokens: DashMap<String, UserId>,
    groups: DashMap<GroupId, GroupRecord>,
    messages: DashMap<MessageId, StoredMessage>,
    /// Reply index: parent message id to child message ids.
    replies: DashMap<MessageId, Vec<MessageId>>,
    next_user_id: AtomicI64,
    next_group_id: AtomicI64,
    next_message_id: AtomicI64,
}

impl MemoryStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a user with a login token. Returns the new user id.
    pub fn add_user(&self, username: &str, token: &str) -> UserId {
        let id = self.next_user_id.fetch_add(1, Ordering::Relaxed) + 1;
        self.users.insert(
            id,
            UserRecord {
                id,
                username: username.to_string(),
            },
        );
        self.tokens.insert(token.to_string(), id);
        id
    }

    /// Create a group with an initial member set. Returns the new group id.
    pub fn create_group(&self, name: &str, members: &[UserId]) -> GroupId {
        let id = self.next_group_id.fetch_add(1, Ordering::Relaxed) + 1;
        self.groups.insert(
            id,
            GroupRecord {
                name: name.to_string(),
                members: members.iter().copied().collect(),
            },
        );
        id
    }

    /// Add a member to a group. Returns `false` if the group is unknown.
    pub fn add_member(&self, group_id: GroupId, user_id: UserId) -> bool {
        match self.groups.get_mut(&group_id) {
            Some(mut group) => {
                group.members.insert(user_id);
                true
            }
            None => false,
        }
    }

    /// Remove a member from a group. Returns `false` if nothing changed.
    pub fn remove_member(&self, group_id: GroupId, user_id: UserId) -> bool {
        self.groups
            .get_mut(&group_id)
            .map(|mut g| g.members.remove(&user_id))
            .unwrap_or(false)
    }

    /// A group's display name.
    #[must_use]
    pub fn group_name(&self, group_id: GroupId) -> Option<String> {
        self.groups.get(&group_id).map(|g| g.name.clone())
    }

    /// Look up a stored message by id.
    #[must_use]
    pub fn message(&self, id: MessageId) -> Option<StoredMessage> {
        self.messages.get(&id).map(|m| m.clone())
    }

    /// Number of messages stored.
    #[must_use]
    pub fn message_count(&self) -> usize {
        self.messages.len()
    }

    /// The direct-message history between two users, oldest first.
    #[must_use]
    pub fn messages_with(&self, user: UserId, peer: UserId) -> Vec<StoredMessage> {
        use crate::event::ConversationTarget::Peer;
        let mut history: Vec<StoredMessage> = self
            .messages
            .iter()
            .filter(|m| {
                (m.sender == user && m.target == Peer(peer))
                    || (m.sender == peer && m.target == Peer(user))
            })
            .map(|m| m.clone())
            .collect();
        history.sort_by_key(|m| (m.timestamp, m.id));
        history
    }

    /// All replies to a message, oldest first.
    #[must_use]
    pub fn replies_to(&self, parent: MessageId) -> Vec<StoredMessage> {
        let mut children: Vec<StoredMessage> = self
            .replies
            .get(&parent)
            .map(|ids| ids.iter().filter_map(|id| self.message(*id)).collect())
            .unwrap_or_default();
        children.sort_by_key(|m| (m.timestamp, m.id));
        children
    }
}

#[async_trait]
impl IdentityResolver for MemoryStore {
    async fn authenticate(&self, token: &str) -> Result<UserProfile, AuthError> {
        let user_id = self
            .tokens
            .get(token)
            .map(|id| *id)
            .ok_or(AuthError::InvalidCredentials)?;
        let record = self
            .users
            .get(&user_id)
            .ok_or(AuthError::InvalidCredentials)?;
        Ok(UserProfile {
            id: record.id,
            username: record.username.clone(),
        })
    }
}

#[async_trait]
impl PersistenceGateway for MemoryStore {
    async fn save_message(&self, draft: NewMessage) -> Result<StoredMessage, GatewayError> {
        let id = self.next_message_id.fetch_add(1, Ordering::Relaxed) + 1;
        let stored = StoredMessage {
            id,
            sender: draft.sender,
            target: draft.target,
            content: draft.content,
            kind: draft.kind,
            file_url: draft.file_url,
            reply_to: draft.reply_to,
            reactions: HashMap::new(),
            is_read: false,
            timestamp: now_millis(),
        };

        if let Some(parent) = stored.reply_to {
            self.replies.entry(parent).or_default().push(id);
        }
        self.messages.insert(id, stored.clone());
        Ok(stored)
    }

    async fn group_members(&self, group_id: GroupId) -> Result<Vec<UserId>, GatewayError> {
        self.groups
            .get(&group_id)
            .map(|g| g.members.iter().copied().collect())
            .ok_or(GatewayError::NotFound)
    }

    async fn peer_exists(&self, user_id: UserId) -> Result<bool, GatewayError> {
        Ok(self.users.contains_key(&user_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{ConversationTarget, MessageKind};

    fn draft(sender: UserId, peer: UserId, content: &str) -> NewMessage {
        NewMessage {
            sender,
            target: ConversationTarget::Peer(peer),
            content: content.to_string(),
            kind: MessageKind::Text,
            file_url: None,
            reply_to: None,
        }
    }

    #[tokio::test]
    async fn test_authenticate() {
        let store = MemoryStore::new();
        let alice = store.add_user("alice", "secret");

        let profile = store.authenticate("secret").await.unwrap();
        assert_eq!(profile.id, alice);
        assert_eq!(profile.username, "alice");

        assert!(matches!(
            store.authenticate("wrong").await,
            Err(AuthError::InvalidCredentials)
        ));
    }

    #[tokio::test]
    async fn test_save_assigns_sequential_ids() {
        let store = MemoryStore::new();
        store.add_user("alice", "a");
        store.add_user("bob", "b");

        let m1 = store.save_message(draft(1, 2, "first")).await.unwrap();
        let m2 = store.save_message(draft(1, 2, "second")).await.unwrap();
        assert!(m2.id > m1.id);
        assert!(m2.timestamp >= m1.timestamp);
        assert_eq!(store.message_count(), 2);
    }

    #[tokio::test]
    async fn test_history_is_both_directions_oldest_first() {
        let store = MemoryStore::new();
        store.add_user("alice", "a");
        store.add_user("bob", "b");
        store.add_user("carol", "c");

        store.save_message(draft(1, 2, "hi bob")).await.unwrap();
        store.save_message(draft(2, 1, "hi alice")).await.unwrap();
        store.save_message(draft(1, 3, "hi carol")).await.unwrap();

        let history = store.messages_with(1, 2);
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].content, "hi bob");
        assert_eq!(history[1].content, "hi alice");
    }

    #[tokio::test]
    async fn test_reply_index() {
        let store = MemoryStore::new();
        store.add_user("alice", "a");
        store.add_user("bob", "b");

        let parent = store.save_message(draft(1, 2, "question")).await.unwrap();
        let mut reply = draft(2, 1, "answer");
        reply.reply_to = Some(parent.id);
        let child = store.save_message(reply).await.unwrap();

        let replies = store.replies_to(parent.id);
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].id, child.id);
        assert!(store.replies_to(child.id).is_empty());
    }

    #[tokio::test]
    async fn test_group_membership() {
        let store = MemoryStore::new();
        let a = store.add_user("alice", "a");
        let b = store.add_user("bob", "b");
        let group = store.create_group("team", &[a]);

        assert!(store.add_member(group, b));
        let mut members = store.group_members(group).await.unwrap();
        members.sort_unstable();
        assert_eq!(members, vec![a, b]);

        assert!(store.remove_member(group, a));
        assert_eq!(store.group_members(group).await.unwrap(), vec![b]);

        assert!(matches!(
            store.group_members(404).await,
            Err(GatewayError::NotFound)
        ));
    }
}
