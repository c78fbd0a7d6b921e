//! Frame types for the Courier wire protocol.
//!
//! Client frames carry authentication and submitted events; server frames
//! carry deliveries pushed by the fanout engine plus acknowledgments.
//! Frame names mirror the event vocabulary the product has always used
//! (`receive`, `echo`, `user_typing`, `incoming_call`, `user_status`).

use courier_core::engine::SubmitError;
use courier_core::event::{
    CallKind, ClientEvent, ConversationTarget, MessageId, MessageKind, ServerEvent, StoredMessage,
    UserId,
};
use courier_core::gateway::AuthError;
use serde::{Deserialize, Serialize};

/// Error codes carried by [`ServerFrame::Error`].
pub mod code {
    /// Malformed or unexpected frame.
    pub const PROTOCOL: u16 = 4000;
    /// Authentication failed; the connection will be closed.
    pub const AUTH: u16 = 4001;
    /// Message content was empty.
    pub const EMPTY_CONTENT: u16 = 4002;
    /// Submitting connection is not registered.
    pub const NOT_CONNECTED: u16 = 4003;
    /// Target peer or group does not exist.
    pub const UNKNOWN_TARGET: u16 = 4004;
    /// Persistence failed; the event may be resubmitted.
    pub const PERSIST: u16 = 5001;
    /// Gateway failure during routing.
    pub const ROUTING: u16 = 5002;
}

/// A frame sent by the client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    /// Authentication handshake; must be the first frame.
    Connect { token: String },

    /// Submit a chat message.
    SendMessage {
        target: ConversationTarget,
        content: String,
        #[serde(default)]
        kind: MessageKind,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        file_url: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reply_to: Option<MessageId>,
    },

    /// The user started typing in a conversation.
    TypingStart { target: ConversationTarget },

    /// The user stopped typing in a conversation.
    TypingStop { target: ConversationTarget },

    /// Signal a call invitation.
    CallInvite {
        target: ConversationTarget,
        call_kind: CallKind,
        room_id: String,
    },

    /// Keepalive ping.
    Ping {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<u64>,
    },
}

impl ClientFrame {
    /// A short name for logging.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            ClientFrame::Connect { .. } => "connect",
            ClientFrame::SendMessage { .. } => "send_message",
            ClientFrame::TypingStart { .. } => "typing_start",
            ClientFrame::TypingStop { .. } => "typing_stop",
            ClientFrame::CallInvite { .. } => "call_invite",
            ClientFrame::Ping { .. } => "ping",
        }
    }

    /// Convert a submitted frame into the engine's event type.
    ///
    /// Returns `None` for frames that are not events (`Connect`, `Ping`).
    #[must_use]
    pub fn into_event(self) -> Option<ClientEvent> {
        match self {
            ClientFrame::SendMessage {
                target,
                content,
                kind,
                file_url,
                reply_to,
            } => Some(ClientEvent::Message {
                target,
                content,
                kind,
                file_url,
                reply_to,
            }),
            ClientFrame::TypingStart { target } => Some(ClientEvent::TypingStart { target }),
            ClientFrame::TypingStop { target } => Some(ClientEvent::TypingStop { target }),
            ClientFrame::CallInvite {
                target,
                call_kind,
                room_id,
            } => Some(ClientEvent::CallInvite {
                target,
                call_kind,
                room_id,
            }),
            ClientFrame::Connect { .. } | ClientFrame::Ping { .. } => None,
        }
    }
}

/// A frame pushed to the client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    /// Handshake accepted.
    Connected {
        connection_id: u64,
        user_id: UserId,
        /// Recommended keepalive interval in milliseconds.
        heartbeat: u32,
    },

    /// Canonical copy of a message addressed to this user.
    Receive { message: StoredMessage },

    /// Confirmation copy of this user's own message (multi-device sync).
    Echo { message: StoredMessage },

    /// A conversation participant started typing.
    UserTyping {
        user_id: UserId,
        username: String,
        target: ConversationTarget,
    },

    /// A conversation participant stopped typing.
    UserStoppedTyping {
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

    /// A user's online status changed.
    UserStatus {
        user_id: UserId,
        online: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        last_seen: Option<u64>,
    },

    /// The last submitted event was accepted.
    Ack,

    /// A request was rejected or the connection is unusable.
    Error { code: u16, message: String },

    /// Keepalive pong.
    Pong {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<u64>,
    },
}

impl ServerFrame {
    /// Build the rejection frame for a failed submit.
    #[must_use]
    pub fn rejection(err: &SubmitError) -> Self {
        let code = match err {
            SubmitError::NotConnected => code::NOT_CONNECTED,
            SubmitError::EmptyContent => code::EMPTY_CONTENT,
            SubmitError::UnknownTarget(_) => code::UNKNOWN_TARGET,
            SubmitError::Persist(_) => code::PERSIST,
            SubmitError::Routing(_) => code::ROUTING,
        };
        ServerFrame::Error {
            code,
            message: err.to_string(),
        }
    }

    /// Build the rejection frame for a failed handshake.
    #[must_use]
    pub fn auth_rejection(err: &AuthError) -> Self {
        ServerFrame::Error {
            code: code::AUTH,
            message: err.to_string(),
        }
    }

    /// Build a protocol error frame.
    #[must_use]
    pub fn protocol_error(message: impl Into<String>) -> Self {
        ServerFrame::Error {
            code: code::PROTOCOL,
            message: message.into(),
        }
    }
}

impl From<&ServerEvent> for ServerFrame {
    fn from(event: &ServerEvent) -> Self {
        match event {
            ServerEvent::Receive(message) => ServerFrame::Receive {
                message: message.clone(),
            },
            ServerEvent::Echo(message) => ServerFrame::Echo {
                message: message.clone(),
            },
            ServerEvent::Typing {
                user_id,
                username,
                target,
            } => ServerFrame::UserTyping {
                user_id: *user_id,
                username: username.clone(),
                target: *target,
            },
            ServerEvent::TypingStopped { user_id, target } => ServerFrame::UserStoppedTyping {
                user_id: *user_id,
                target: *target,
            },
            ServerEvent::IncomingCall {
                caller_id,
                caller_name,
                call_kind,
                room_id,
            } => ServerFrame::IncomingCall {
                caller_id: *caller_id,
                caller_name: caller_name.clone(),
                call_kind: *call_kind,
                room_id: room_id.clone(),
            },
            ServerEvent::PresenceChanged {
                user_id,
                online,
                last_seen,
            } => ServerFrame::UserStatus {
                user_id: *user_id,
                online: *online,
                last_seen: *last_seen,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_into_event() {
        let frame = ClientFrame::SendMessage {
            target: ConversationTarget::Peer(2),
            content: "hi".into(),
            kind: MessageKind::Text,
            file_url: None,
            reply_to: None,
        };
        assert!(matches!(
            frame.into_event(),
            Some(ClientEvent::Message { .. })
        ));

        assert!(ClientFrame::Ping { timestamp: None }.into_event().is_none());
        assert!(ClientFrame::Connect {
            token: "t".into()
        }
        .into_event()
        .is_none());
    }

    #[test]
    fn test_presence_event_to_frame() {
        let event = ServerEvent::PresenceChanged {
            user_id: 3,
            online: false,
            last_seen: Some(1234),
        };
        assert_eq!(
            ServerFrame::from(&event),
            ServerFrame::UserStatus {
                user_id: 3,
                online: false,
                last_seen: Some(1234),
            }
        );
    }

    #[test]
    fn test_rejection_codes() {
        let frame = ServerFrame::rejection(&SubmitError::EmptyContent);
        assert!(matches!(
            frame,
            ServerFrame::Error {
                code: code::EMPTY_CONTENT,
                ..
            }
        ));

        let frame = ServerFrame::rejection(&SubmitError::UnknownTarget(
            ConversationTarget::Peer(9),
        ));
        assert!(matches!(
            frame,
            ServerFrame::Error {
                code: code::UNKNOWN_TARGET,
                ..
            }
        ));
    }
}
