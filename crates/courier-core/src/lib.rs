//! # courier-core
//!
//! The real-time message and presence fanout engine behind Courier.
//!
//! This crate provides the fundamental building blocks:
//!
//! - **Registry** - Maps online users to their open delivery channels
//! - **Presence** - Derives and broadcasts online/offline/last-seen changes
//! - **Router** - Resolves peer/group conversation targets to recipients
//! - **Dispatcher** - Fans events out to channels, with self-echo for senders
//! - **Engine** - The ingest pipeline: validate, persist, route, dispatch
//!
//! Credential checking and durable storage are collaborator traits
//! ([`IdentityResolver`], [`PersistenceGateway`]); the engine never
//! reimplements them.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────┐     ┌──────────┐     ┌────────────┐
//! │ Connection │────▶│  Engine  │────▶│   Router   │
//! └────────────┘     └──────────┘     └────────────┘
//!                         │                  │
//!                         ▼                  ▼
//!                   ┌──────────┐     ┌────────────┐
//!                   │ Registry │◀────│ Dispatcher │
//!                   └──────────┘     └────────────┘
//!                         │
//!                         ▼
//!                   ┌──────────┐
//!                   │ Presence │
//!                   └──────────┘
//! ```

pub mod dispatch;
pub mod engine;
pub mod event;
pub mod gateway;
pub mod memory;
pub mod presence;
pub mod registry;
pub mod router;

pub use dispatch::{DeliveryReport, Dispatcher};
pub use engine::{ConnectionHandle, Engine, EngineConfig, SubmitError};
pub use event::{
    CallKind, ClientEvent, ConversationTarget, GroupId, MessageId, MessageKind, NewMessage,
    ServerEvent, StoredMessage, UserId,
};
pub use gateway::{AuthError, GatewayError, IdentityResolver, PersistenceGateway, UserProfile};
pub use memory::MemoryStore;
pub use presence::{PresenceState, PresenceTracker};
pub use registry::{Channel, ConnectionId, PresenceTransition, Registry, RegistryStats};
pub use router::{ConversationRouter, RouteError};
