//! External collaborator traits.
//!
//! The engine never checks credentials or touches storage itself; it calls
//! into an identity resolver and a persistence gateway supplied by the
//! embedding application. `memory::MemoryStore` implements both for tests
//! and the bundled server binary.

use crate::event::{GroupId, NewMessage, StoredMessage, UserId};
use async_trait::async_trait;
use thiserror::Error;

/// Authentication failure at the connection boundary.
///
/// An unauthenticated submit is rejected here and never enters the pipeline.
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("invalid credentials")]
    InvalidCredentials,

    #[error("identity backend unavailable: {0}")]
    Unavailable(String),
}

/// Failure reported by the persistence gateway.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// The requested user, group, or message does not exist.
    #[error("not found")]
    NotFound,

    /// The backing store failed; the caller may resubmit.
    #[error("storage failure: {0}")]
    Storage(String),
}

/// The authenticated identity behind a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserProfile {
    pub id: UserId,
    pub username: String,
}

/// Resolves connection credentials to a stable user identity.
#[async_trait]
pub trait IdentityResolver: Send + Sync {
    /// Authenticate an opaque credential token.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError`] if the token is unknown or the backend is down.
    async fn authenticate(&self, token: &str) -> Result<UserProfile, AuthError>;
}

/// Durable storage for messages and conversation metadata.
///
/// Group membership is always read per call; the engine never caches it.
#[async_trait]
pub trait PersistenceGateway: Send + Sync {
    /// Persist a message draft, assigning its authoritative id and timestamp.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError`] if the store rejects the write.
    async fn save_message(&self, draft: NewMessage) -> Result<StoredMessage, GatewayError>;

    /// The current member set of a group.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::NotFound`] if the group does not exist.
    async fn group_members(&self, group_id: GroupId) -> Result<Vec<UserId>, GatewayError>;

    /// Whether a user exists as a direct-message peer.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError`] if the store cannot be read.
    async fn peer_exists(&self, user_id: UserId) -> Result<bool, GatewayError>;
}
