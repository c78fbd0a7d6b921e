//! Event types for the Courier engine.
//!
//! All inbound and outbound traffic is expressed as closed tagged variants
//! decoded at the transport boundary. Inbound events are either persistable
//! messages or transient signals; outbound events are the delivery payloads
//! pushed to client channels.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

/// A stable user identifier, issued by the identity resolver.
pub type UserId = i64;

/// A group identifier, owned by the persistence gateway.
pub type GroupId = i64;

/// A message identifier, assigned at persistence time.
pub type MessageId = i64;

/// Milliseconds since the Unix epoch.
#[must_use]
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// The kind of content carried by a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    #[default]
    Text,
    Image,
    Document,
}

/// Where an event is addressed: a direct peer or a group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum ConversationTarget {
    Peer(UserId),
    Group(GroupId),
}

/// The kind of call being initiated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallKind {
    Audio,
    Video,
}

/// A message draft, before the persistence gateway has assigned an id.
#[derive(Debug, Clone, PartialEq)]
pub struct NewMessage {
    pub sender: UserId,
    pub target: ConversationTarget,
    pub content: String,
    pub kind: MessageKind,
    pub file_url: Option<String>,
    pub reply_to: Option<MessageId>,
}

/// A durably stored message. Immutable after persistence; the id and
/// timestamp are authoritative and identical in every delivered copy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredMessage {
    pub id: MessageId,
    pub sender: UserId,
    pub target: ConversationTarget,
    pub content: String,
    pub kind: MessageKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<MessageId>,
    /// Reactions keyed by user id, value is the emoji.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub reactions: HashMap<String, String>,
    pub is_read: bool,
    /// Milliseconds since the Unix epoch, stamped at persistence time.
    pub timestamp: u64,
}

/// An inbound event submitted over an authenticated connection.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    /// A persistable chat message.
    Message {
        target: ConversationTarget,
        content: String,
        kind: MessageKind,
        file_url: Option<String>,
        reply_to: Option<MessageId>,
    },
    /// The sender started typing in a conversation.
    TypingStart { target: ConversationTarget },
    /// The sender stopped typing in a conversation.
    TypingStop { target: ConversationTarget },
    /// A call invitation; only the signal is routed, not the call itself.
    CallInvite {
        target: ConversationTarget,
        call_kind: CallKind,
        room_id: String,
    },
}

impl ClientEvent {
    /// Whether this event goes through the persistence gateway before fanout.
    #[must_use]
    pub fn is_persistable(&self) -> bool {
        matches!(self, ClientEvent::Message { .. })
    }

    /// The conversation this event is addressed to.
    #[must_use]
    pub fn target(&self) -> ConversationTarget {
        match self {
            ClientEvent::Message { target, .. }
            | ClientEvent::TypingStart { target }
            | ClientEvent::TypingStop { target }
            | ClientEvent::CallInvite { target, .. } => *target,
        }
    }
}

/// An outbound event pushed to a client channel.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerEvent {
    /// The canonical copy of a message, delivered to recipients.
    Receive(StoredMessage),
    /// The sender's own confirmation copy, delivered to all sender devices.
    Echo(StoredMessage),
    /// Another participant started typing.
    Typing {
        user_id: UserId,
        username: String,
        target: ConversationTarget,
    },
    /// Another participant stopped typing.
    TypingStopped {
        user_id: UserId,
        target: ConversationTarget,
    },
    /// An incoming call invitation.
    IncomingCall {
        caller_id: UserId,
        caller_name: String,
        call_kind: CallKind,
        room_id: String,
    },
    /// A user's presence changed; broadcast to every connected user.
    PresenceChanged {
        user_id: UserId,
        online: bool,
        last_seen: Option<u64>,
    },
}

impl ServerEvent {
    /// The message carried by this event, if it is a delivery.
    #[must_use]
    pub fn message(&self) -> Option<&StoredMessage> {
        match self {
            ServerEvent::Receive(m) | ServerEvent::Echo(m) => Some(m),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_event_persistable() {
        let msg = ClientEvent::Message {
            target: ConversationTarget::Peer(2),
            content: "hi".into(),
            kind: MessageKind::Text,
            file_url: None,
            reply_to: None,
        };
        assert!(msg.is_persistable());

        let typing = ClientEvent::TypingStart {
            target: ConversationTarget::Peer(2),
        };
        assert!(!typing.is_persistable());
        assert_eq!(typing.target(), ConversationTarget::Peer(2));
    }

    #[test]
    fn test_stored_message_roundtrip() {
        let stored = StoredMessage {
            id: 7,
            sender: 1,
            target: ConversationTarget::Group(3),
            content: "hello".into(),
            kind: MessageKind::Image,
            file_url: Some("/uploads/images/a.png".into()),
            reply_to: Some(4),
            reactions: HashMap::new(),
            is_read: false,
            timestamp: now_millis(),
        };

        let json = serde_json::to_string(&stored).unwrap();
        let back: StoredMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(stored, back);
    }

    #[test]
    fn test_now_millis_monotonic_enough() {
        let a = now_millis();
        let b = now_millis();
        assert!(b >= a);
    }
}
