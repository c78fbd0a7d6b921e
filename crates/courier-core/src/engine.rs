//! The Courier engine: connection lifecycle and the event ingest pipeline.
//!
//! An inbound event moves through `RECEIVED -> VALIDATED -> PERSISTED ->
//! ROUTED -> DISPATCHED`, or is rejected at validation. Persistence always
//! completes before fanout, so the sender's confirmation and every
//! recipient copy agree on the message id and timestamp. Transient signals
//! (typing, call invites) skip the persistence stage.
//!
//! Submission order per (sender, conversation) is preserved end to end: a
//! per-conversation async mutex is held across persist + dispatch, so a
//! second message for the same conversation cannot overtake the first. No
//! cross-conversation ordering is guaranteed.
//!
//! Connect and disconnect are serialized per user the same way: registry
//! mutation, presence update, and the transition broadcast happen under one
//! per-user async mutex, so a disconnect racing a reconnect cannot apply
//! transitions to the tracker in inverted order or interleave the
//! broadcasts.

use crate::dispatch::{DeliveryReport, Dispatcher};
use crate::event::{
    ClientEvent, ConversationTarget, NewMessage, ServerEvent, UserId,
};
use crate::gateway::{AuthError, GatewayError, IdentityResolver, PersistenceGateway};
use crate::presence::{PresenceState, PresenceTracker};
use crate::registry::{ConnectionId, Registry, RegistryStats};
use crate::router::{ConversationRouter, RouteError};
use dashmap::DashMap;
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

/// Why a submitted event was rejected. Validation and persistence errors
/// are terminal for the event and reported synchronously; delivery errors
/// never surface here.
#[derive(Debug, Error)]
pub enum SubmitError {
    /// The submitting connection is not registered.
    #[error("connection is not registered")]
    NotConnected,

    /// Message content was empty.
    #[error("message content is empty")]
    EmptyContent,

    /// The target peer or group does not exist. Nothing was persisted.
    #[error("unknown target: {0:?}")]
    UnknownTarget(ConversationTarget),

    /// Persistence failed; nothing was dispatched. The caller may resubmit.
    #[error("persistence failed: {0}")]
    Persist(#[source] GatewayError),

    /// Target resolution failed at the gateway.
    #[error("routing failed: {0}")]
    Routing(#[source] GatewayError),
}

impl From<RouteError> for SubmitError {
    fn from(err: RouteError) -> Self {
        match err {
            RouteError::UnknownTarget(target) => SubmitError::UnknownTarget(target),
            RouteError::Gateway(e) => SubmitError::Routing(e),
        }
    }
}

/// Engine tuning knobs.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Outbound buffer per connection channel.
    pub channel_capacity: usize,
    /// Per-channel send timeout during fanout.
    pub send_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            channel_capacity: Registry::default_capacity(),
            send_timeout: Duration::from_secs(5),
        }
    }
}

/// A live, authenticated connection as seen by the transport layer.
///
/// Dropping the handle (or its receiver) closes the delivery channel; the
/// transport must still call [`Engine::disconnect`] to release the
/// registration.
pub struct ConnectionHandle {
    /// Process-unique connection id.
    pub connection_id: ConnectionId,
    /// The authenticated user behind this connection.
    pub user_id: UserId,
    /// Display name from the identity resolver.
    pub username: String,
    /// Whether this connect flipped the user from offline to online.
    pub went_online: bool,
    /// Outbound events for this connection, in delivery order.
    pub events: mpsc::Receiver<Arc<ServerEvent>>,
}

/// The realtime fanout engine.
///
/// Owns the connection registry and presence state; everything else is
/// request-scoped. Credentials and durable storage live behind the
/// [`IdentityResolver`] and [`PersistenceGateway`] collaborators.
pub struct Engine {
    registry: Arc<Registry>,
    presence: PresenceTracker,
    router: ConversationRouter,
    dispatcher: Dispatcher,
    identity: Arc<dyn IdentityResolver>,
    gateway: Arc<dyn PersistenceGateway>,
    /// One lock per (sender, conversation); held across persist + dispatch
    /// to keep submission order. Entries are dropped once idle.
    conversations: DashMap<(UserId, ConversationTarget), Arc<Mutex<()>>>,
    /// One lock per user; registry mutation, presence update, and the
    /// transition broadcast happen under it so the tracker never disagrees
    /// with the registry. Entries are dropped once idle.
    presence_locks: DashMap<UserId, Arc<Mutex<()>>>,
    config: EngineConfig,
}

/// Fetch or create the serialization lock for a key.
fn lock_for<K>(map: &DashMap<K, Arc<Mutex<()>>>, key: K) -> Arc<Mutex<()>>
where
    K: Eq + Hash + Copy,
{
    map.entry(key)
        .or_insert_with(|| Arc::new(Mutex::new(())))
        .clone()
}

/// Remove a lock entry nobody holds, so the map tracks live contention
/// rather than every key ever seen. Callers must drop their clone first.
fn drop_idle_lock<K>(map: &DashMap<K, Arc<Mutex<()>>>, key: &K)
where
    K: Eq + Hash,
{
    map.remove_if(key, |_, lock| Arc::strong_count(lock) == 1);
}

impl Engine {
    /// Create an engine with default tuning.
    #[must_use]
    pub fn new(
        identity: Arc<dyn IdentityResolver>,
        gateway: Arc<dyn PersistenceGateway>,
    ) -> Self {
        Self::with_config(identity, gateway, EngineConfig::default())
    }

    /// Create an engine with explicit tuning.
    #[must_use]
    pub fn with_config(
        identity: Arc<dyn IdentityResolver>,
        gateway: Arc<dyn PersistenceGateway>,
        config: EngineConfig,
    ) -> Self {
        info!(
            channel_capacity = config.channel_capacity,
            send_timeout_ms = config.send_timeout.as_millis() as u64,
            "Creating engine"
        );
        let registry = Arc::new(Registry::new());
        Self {
            presence: PresenceTracker::new(),
            router: ConversationRouter::new(Arc::clone(&gateway)),
            dispatcher: Dispatcher::with_timeout(Arc::clone(&registry), config.send_timeout),
            registry,
            identity,
            gateway,
            conversations: DashMap::new(),
            presence_locks: DashMap::new(),
            config,
        }
    }

    /// Authenticate credentials and register a new connection.
    ///
    /// On the user's first connection the presence change is broadcast to
    /// every connected user, including the new connection itself.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError`] if the credentials are rejected; nothing is
    /// registered in that case.
    pub async fn connect(&self, token: &str) -> Result<ConnectionHandle, AuthError> {
        let profile = self.identity.authenticate(token).await?;

        let (tx, events) = mpsc::channel(self.config.channel_capacity);

        let lock = lock_for(&self.presence_locks, profile.id);
        let (connection_id, went_online) = {
            let _presence = lock.lock().await;
            let (connection_id, transition) =
                self.registry.register(profile.id, &profile.username, tx);

            debug!(
                user = profile.id,
                connection = connection_id,
                "Connection established"
            );

            let went_online = transition.is_some();
            if let Some(transition) = transition {
                let event = self.presence.apply(profile.id, transition);
                self.dispatcher.broadcast(event).await;
            }
            (connection_id, went_online)
        };
        drop(lock);
        drop_idle_lock(&self.presence_locks, &profile.id);

        Ok(ConnectionHandle {
            connection_id,
            user_id: profile.id,
            username: profile.username,
            went_online,
            events,
        })
    }

    /// Release a connection. Safe to call more than once.
    ///
    /// If this was the user's last connection the offline presence change
    /// (with last-seen stamped at the disconnect) is broadcast. Returns
    /// `true` when that happened.
    pub async fn disconnect(&self, connection_id: ConnectionId) -> bool {
        let Some(user_id) = self.registry.owner_of(connection_id) else {
            return false;
        };

        let lock = lock_for(&self.presence_locks, user_id);
        let went_offline = {
            let _presence = lock.lock().await;
            match self.registry.unregister(connection_id) {
                Some((_, Some(transition))) => {
                    let event = self.presence.apply(user_id, transition);
                    self.dispatcher.broadcast(event).await;
                    true
                }
                _ => false,
            }
        };
        drop(lock);
        drop_idle_lock(&self.presence_locks, &user_id);
        went_offline
    }

    /// Submit an event from a connection into the ingest pipeline.
    ///
    /// # Errors
    ///
    /// Returns [`SubmitError`] if validation or persistence rejects the
    /// event; nothing has been dispatched in that case.
    pub async fn submit(
        &self,
        connection_id: ConnectionId,
        event: ClientEvent,
    ) -> Result<DeliveryReport, SubmitError> {
        let sender = self
            .registry
            .owner_of(connection_id)
            .ok_or(SubmitError::NotConnected)?;

        match event {
            ClientEvent::Message {
                target,
                content,
                kind,
                file_url,
                reply_to,
            } => {
                if content.is_empty() {
                    return Err(SubmitError::EmptyContent);
                }
                self.ingest_message(
                    sender,
                    NewMessage {
                        sender,
                        target,
                        content,
                        kind,
                        file_url,
                        reply_to,
                    },
                )
                .await
            }
            ClientEvent::TypingStart { target } => {
                let event = ServerEvent::Typing {
                    user_id: sender,
                    username: self.display_name(sender),
                    target,
                };
                self.ingest_signal(target, event).await
            }
            ClientEvent::TypingStop { target } => {
                let event = ServerEvent::TypingStopped {
                    user_id: sender,
                    target,
                };
                self.ingest_signal(target, event).await
            }
            ClientEvent::CallInvite {
                target,
                call_kind,
                room_id,
            } => {
                let event = ServerEvent::IncomingCall {
                    caller_id: sender,
                    caller_name: self.display_name(sender),
                    call_kind,
                    room_id,
                };
                self.ingest_signal(target, event).await
            }
        }
    }

    /// Persist a message, then fan it out.
    ///
    /// The conversation lock serializes persist + dispatch per (sender,
    /// target); it is an async mutex and the only lock in the engine held
    /// across an await.
    async fn ingest_message(
        &self,
        sender: UserId,
        draft: NewMessage,
    ) -> Result<DeliveryReport, SubmitError> {
        let key = (sender, draft.target);
        let lock = lock_for(&self.conversations, key);
        let result = {
            let _ordering = lock.lock().await;
            self.persist_and_dispatch(draft).await
        };
        drop(lock);
        drop_idle_lock(&self.conversations, &key);
        result
    }

    async fn persist_and_dispatch(
        &self,
        draft: NewMessage,
    ) -> Result<DeliveryReport, SubmitError> {
        let sender = draft.sender;

        // target must resolve before anything is persisted
        let targets = self.router.resolve(draft.target).await?;

        let stored = self
            .gateway
            .save_message(draft)
            .await
            .map_err(SubmitError::Persist)?;

        debug!(
            message = stored.id,
            sender,
            targets = targets.len(),
            "Message persisted, dispatching"
        );

        let report = self
            .dispatcher
            .deliver_message(&stored, &targets, sender)
            .await;
        if report.failed > 0 {
            warn!(
                message = stored.id,
                failed = report.failed,
                "Partial delivery"
            );
        }
        Ok(report)
    }

    /// Route and dispatch a transient signal. No persistence, no echo.
    async fn ingest_signal(
        &self,
        target: ConversationTarget,
        event: ServerEvent,
    ) -> Result<DeliveryReport, SubmitError> {
        let targets = self.router.resolve(target).await?;
        Ok(self.dispatcher.deliver_signal(event, &targets).await)
    }

    fn display_name(&self, user_id: UserId) -> String {
        self.registry.username_of(user_id).unwrap_or_default()
    }

    /// Current presence for a user.
    #[must_use]
    pub fn presence(&self, user_id: UserId) -> PresenceState {
        self.presence.get(user_id)
    }

    /// Whether a user currently has any open channel.
    #[must_use]
    pub fn is_online(&self, user_id: UserId) -> bool {
        self.registry.is_online(user_id)
    }

    /// Registry statistics.
    #[must_use]
    pub fn stats(&self) -> RegistryStats {
        self.registry.stats()
    }

    #[cfg(test)]
    fn conversation_lock_count(&self) -> usize {
        self.conversations.len()
    }

    #[cfg(test)]
    fn presence_lock_count(&self) -> usize {
        self.presence_locks.len()
    }
}
