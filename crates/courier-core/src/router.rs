//! Conversation routing for Courier.
//!
//! Resolves a conversation target into the set of user ids that must
//! receive an event. Group membership is read from the persistence gateway
//! on every call; membership can change between messages, so nothing here
//! is cached.

use crate::event::{ConversationTarget, UserId};
use crate::gateway::{GatewayError, PersistenceGateway};
use std::collections::HashSet;
use std::sync::Arc;
use thiserror::Error;
use tracing::trace;

/// Routing errors.
#[derive(Debug, Error)]
pub enum RouteError {
    /// The peer or group does not exist. Callers must reject the event
    /// before persistence.
    #[error("unknown target: {0:?}")]
    UnknownTarget(ConversationTarget),

    /// The gateway could not be read.
    #[error("gateway failure: {0}")]
    Gateway(#[from] GatewayError),
}

/// Resolves conversation targets against the persistence gateway.
pub struct ConversationRouter {
    gateway: Arc<dyn PersistenceGateway>,
}

impl ConversationRouter {
    /// Create a router over a persistence gateway.
    #[must_use]
    pub fn new(gateway: Arc<dyn PersistenceGateway>) -> Self {
        Self { gateway }
    }

    /// Resolve a target to the recipient user set.
    ///
    /// A direct target resolves to `{peer}`; the sender's confirmation copy
    /// is a dispatch policy, not part of resolution. A group resolves to its
    /// live member set; a group with zero members resolves to the empty set,
    /// which is not an error.
    ///
    /// # Errors
    ///
    /// Returns [`RouteError::UnknownTarget`] if the peer or group does not
    /// exist.
    pub async fn resolve(
        &self,
        target: ConversationTarget,
    ) -> Result<HashSet<UserId>, RouteError> {
        match target {
            ConversationTarget::Peer(peer) => {
                if self.gateway.peer_exists(peer).await? {
                    trace!(peer, "Resolved direct target");
                    Ok(HashSet::from([peer]))
                } else {
                    Err(RouteError::UnknownTarget(target))
                }
            }
            ConversationTarget::Group(group_id) => {
                let members = match self.gateway.group_members(group_id).await {
                    Ok(members) => members,
                    Err(GatewayError::NotFound) => {
                        return Err(RouteError::UnknownTarget(target))
                    }
                    Err(e) => return Err(RouteError::Gateway(e)),
                };
                trace!(group = group_id, members = members.len(), "Resolved group target");
                Ok(members.into_iter().collect())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStore;

    fn store() -> Arc<MemoryStore> {
        let store = MemoryStore::new();
        store.add_user("alice", "tok-a");
        store.add_user("bob", "tok-b");
        store.add_user("carol", "tok-c");
        Arc::new(store)
    }

    #[tokio::test]
    async fn test_resolve_peer() {
        let store = store();
        let router = ConversationRouter::new(store);

        let targets = router.resolve(ConversationTarget::Peer(2)).await.unwrap();
        assert_eq!(targets, HashSet::from([2]));
    }

    #[tokio::test]
    async fn test_resolve_unknown_peer() {
        let router = ConversationRouter::new(store());

        let err = router
            .resolve(ConversationTarget::Peer(999))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            RouteError::UnknownTarget(ConversationTarget::Peer(999))
        ));
    }

    #[tokio::test]
    async fn test_resolve_group_members() {
        let store = store();
        let group = store.create_group("team", &[1, 2, 3]);
        let router = ConversationRouter::new(store);

        let targets = router
            .resolve(ConversationTarget::Group(group))
            .await
            .unwrap();
        assert_eq!(targets, HashSet::from([1, 2, 3]));
    }

    #[tokio::test]
    async fn test_resolve_empty_group_is_empty_not_error() {
        let store = store();
        let group = store.create_group("ghost-town", &[]);
        let router = ConversationRouter::new(store);

        let targets = router
            .resolve(ConversationTarget::Group(group))
            .await
            .unwrap();
        assert!(targets.is_empty());
    }

    #[tokio::test]
    async fn test_resolve_unknown_group() {
        let router = ConversationRouter::new(store());

        let err = router
            .resolve(ConversationTarget::Group(404))
            .await
            .unwrap_err();
        assert!(matches!(err, RouteError::UnknownTarget(_)));
    }

    #[tokio::test]
    async fn test_membership_read_per_call() {
        let store = store();
        let group = store.create_group("team", &[1, 2]);
        let router = ConversationRouter::new(Arc::clone(&store) as Arc<dyn PersistenceGateway>);

        let before = router
            .resolve(ConversationTarget::Group(group))
            .await
            .unwrap();
        assert_eq!(before.len(), 2);

        store.add_member(group, 3);
        let after = router
            .resolve(ConversationTarget::Group(group))
            .await
            .unwrap();
        assert_eq!(after.len(), 3);
    }
}
