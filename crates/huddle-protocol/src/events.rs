//! Event types for the Huddle signaling protocol.
//!
//! Every message exchanged over a signaling connection is either a
//! [`ClientEvent`] (client to server) or a [`ServerEvent`] (server to client).
//! Both are tagged by a kebab-case `type` field on the wire.

use serde::{Deserialize, Serialize};

/// Current protocol version, announced in [`ServerEvent::Connected`].
pub const PROTOCOL_VERSION: u8 = 1;

/// Event kind identifiers, used for logging and metric labels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    JoinRoom,
    LeaveRoom,
    Subscribe,
    Unsubscribe,
    StreamUpdated,
    Typing,
    StopTyping,
    PeerReady,
    Call,
    Ping,
    Connected,
    UserConnected,
    UserDisconnected,
    UserStreamUpdated,
    UserReady,
    UserTyping,
    UserStoppedTyping,
    NewMessage,
    FriendRequestReceived,
    Pong,
    Error,
}

impl EventKind {
    /// The wire name of this kind.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::JoinRoom => "join-room",
            EventKind::LeaveRoom => "leave-room",
            EventKind::Subscribe => "subscribe",
            EventKind::Unsubscribe => "unsubscribe",
            EventKind::StreamUpdated => "stream-updated",
            EventKind::Typing => "typing",
            EventKind::StopTyping => "stop-typing",
            EventKind::PeerReady => "peer-ready",
            EventKind::Call => "call",
            EventKind::Ping => "ping",
            EventKind::Connected => "connected",
            EventKind::UserConnected => "user-connected",
            EventKind::UserDisconnected => "user-disconnected",
            EventKind::UserStreamUpdated => "user-stream-updated",
            EventKind::UserReady => "user-ready",
            EventKind::UserTyping => "user-typing",
            EventKind::UserStoppedTyping => "user-stopped-typing",
            EventKind::NewMessage => "new-message",
            EventKind::FriendRequestReceived => "friend-request-received",
            EventKind::Pong => "pong",
            EventKind::Error => "error",
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Point-to-point negotiation payload carried opaquely by the relay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum CallSignal {
    /// Session description offer.
    Offer { sdp: String },
    /// Session description answer.
    Answer { sdp: String },
    /// Connectivity candidate.
    Candidate {
        candidate: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sdp_mid: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sdp_m_line_index: Option<u16>,
    },
}

impl CallSignal {
    /// Create a candidate signal without media line hints.
    #[must_use]
    pub fn candidate(candidate: impl Into<String>) -> Self {
        CallSignal::Candidate {
            candidate: candidate.into(),
            sdp_mid: None,
            sdp_m_line_index: None,
        }
    }
}

/// Events sent by a client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ClientEvent {
    /// Join a room and announce the arrival to existing members.
    JoinRoom { room: String, participant: String },

    /// Leave a room and announce the departure.
    LeaveRoom { room: String, participant: String },

    /// Join a room silently, for example to follow a conversation.
    Subscribe { room: String, participant: String },

    /// Leave a silently joined room.
    Unsubscribe { room: String, participant: String },

    /// The sender switched its media source.
    StreamUpdated { room: String, participant: String },

    /// The user started typing.
    Typing { room: String, user: String },

    /// The user stopped typing.
    StopTyping { room: String, user: String },

    /// The sender's negotiation endpoint is ready to be dialed.
    PeerReady { room: String, participant: String },

    /// Negotiation payload for a single remote participant.
    ///
    /// `from` must be a participant the sending connection has joined as.
    Call {
        from: String,
        target: String,
        signal: CallSignal,
    },

    /// Keepalive ping.
    Ping {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<u64>,
    },
}

impl ClientEvent {
    /// Get the event kind.
    #[must_use]
    pub fn kind(&self) -> EventKind {
        match self {
            ClientEvent::JoinRoom { .. } => EventKind::JoinRoom,
            ClientEvent::LeaveRoom { .. } => EventKind::LeaveRoom,
            ClientEvent::Subscribe { .. } => EventKind::Subscribe,
            ClientEvent::Unsubscribe { .. } => EventKind::Unsubscribe,
            ClientEvent::StreamUpdated { .. } => EventKind::StreamUpdated,
            ClientEvent::Typing { .. } => EventKind::Typing,
            ClientEvent::StopTyping { .. } => EventKind::StopTyping,
            ClientEvent::PeerReady { .. } => EventKind::PeerReady,
            ClientEvent::Call { .. } => EventKind::Call,
            ClientEvent::Ping { .. } => EventKind::Ping,
        }
    }

    /// The room this event is scoped to, if any.
    #[must_use]
    pub fn room(&self) -> Option<&str> {
        match self {
            ClientEvent::JoinRoom { room, .. }
            | ClientEvent::LeaveRoom { room, .. }
            | ClientEvent::Subscribe { room, .. }
            | ClientEvent::Unsubscribe { room, .. }
            | ClientEvent::StreamUpdated { room, .. }
            | ClientEvent::Typing { room, .. }
            | ClientEvent::StopTyping { room, .. }
            | ClientEvent::PeerReady { room, .. } => Some(room),
            ClientEvent::Call { .. } | ClientEvent::Ping { .. } => None,
        }
    }

    /// Create a new JoinRoom event.
    #[must_use]
    pub fn join_room(room: impl Into<String>, participant: impl Into<String>) -> Self {
        ClientEvent::JoinRoom {
            room: room.into(),
            participant: participant.into(),
        }
    }

    /// Create a new LeaveRoom event.
    #[must_use]
    pub fn leave_room(room: impl Into<String>, participant: impl Into<String>) -> Self {
        ClientEvent::LeaveRoom {
            room: room.into(),
            participant: participant.into(),
        }
    }

    /// Create a new Subscribe event.
    #[must_use]
    pub fn subscribe(room: impl Into<String>, participant: impl Into<String>) -> Self {
        ClientEvent::Subscribe {
            room: room.into(),
            participant: participant.into(),
        }
    }

    /// Create a new Unsubscribe event.
    #[must_use]
    pub fn unsubscribe(room: impl Into<String>, participant: impl Into<String>) -> Self {
        ClientEvent::Unsubscribe {
            room: room.into(),
            participant: participant.into(),
        }
    }

    /// Create a new StreamUpdated event.
    #[must_use]
    pub fn stream_updated(room: impl Into<String>, participant: impl Into<String>) -> Self {
        ClientEvent::StreamUpdated {
            room: room.into(),
            participant: participant.into(),
        }
    }

    /// Create a new PeerReady event.
    #[must_use]
    pub fn peer_ready(room: impl Into<String>, participant: impl Into<String>) -> Self {
        ClientEvent::PeerReady {
            room: room.into(),
            participant: participant.into(),
        }
    }

    /// Create a new Typing event.
    #[must_use]
    pub fn typing(room: impl Into<String>, user: impl Into<String>) -> Self {
        ClientEvent::Typing {
            room: room.into(),
            user: user.into(),
        }
    }

    /// Create a new Call event.
    #[must_use]
    pub fn call(from: impl Into<String>, target: impl Into<String>, signal: CallSignal) -> Self {
        ClientEvent::Call {
            from: from.into(),
            target: target.into(),
            signal,
        }
    }
}

/// Sender summary attached to relayed chat messages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SenderInfo {
    pub id: String,
    pub name: String,
}

/// File reference attached to a chat message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    pub file_id: String,
    pub filename: String,
    pub file_type: String,
}

/// A persisted chat message as delivered to viewing clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatEnvelope {
    pub id: String,
    pub conversation: String,
    pub sender: SenderInfo,
    pub content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<Attachment>,
    /// Creation time in milliseconds since the Unix epoch.
    pub created_at: u64,
}

/// Events sent by the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ServerEvent {
    /// Connection established.
    Connected {
        connection_id: String,
        version: u8,
        /// Recommended heartbeat interval in milliseconds.
        heartbeat: u32,
    },

    /// A participant joined the room.
    UserConnected { room: String, participant: String },

    /// A participant left the room or dropped.
    UserDisconnected { room: String, participant: String },

    /// A participant switched its media source.
    UserStreamUpdated { room: String, participant: String },

    /// A participant is ready to be dialed.
    UserReady { room: String, participant: String },

    /// A user started typing.
    UserTyping { room: String, user: String },

    /// A user stopped typing.
    UserStoppedTyping { room: String, user: String },

    /// Negotiation payload from a remote participant.
    Call { from: String, signal: CallSignal },

    /// A message was persisted in a room the receiver is viewing.
    NewMessage { room: String, message: ChatEnvelope },

    /// A friend request was addressed to the receiver.
    FriendRequestReceived {
        request_id: String,
        from: String,
        from_name: String,
    },

    /// Keepalive pong.
    Pong {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<u64>,
    },

    /// Error response.
    Error { code: u16, message: String },
}

impl ServerEvent {
    /// Get the event kind.
    #[must_use]
    pub fn kind(&self) -> EventKind {
        match self {
            ServerEvent::Connected { .. } => EventKind::Connected,
            ServerEvent::UserConnected { .. } => EventKind::UserConnected,
            ServerEvent::UserDisconnected { .. } => EventKind::UserDisconnected,
            ServerEvent::UserStreamUpdated { .. } => EventKind::UserStreamUpdated,
            ServerEvent::UserReady { .. } => EventKind::UserReady,
            ServerEvent::UserTyping { .. } => EventKind::UserTyping,
            ServerEvent::UserStoppedTyping { .. } => EventKind::UserStoppedTyping,
            ServerEvent::Call { .. } => EventKind::Call,
            ServerEvent::NewMessage { .. } => EventKind::NewMessage,
            ServerEvent::FriendRequestReceived { .. } => EventKind::FriendRequestReceived,
            ServerEvent::Pong { .. } => EventKind::Pong,
            ServerEvent::Error { .. } => EventKind::Error,
        }
    }

    /// Create a new Connected event.
    #[must_use]
    pub fn connected(connection_id: impl Into<String>, heartbeat: u32) -> Self {
        ServerEvent::Connected {
            connection_id: connection_id.into(),
            version: PROTOCOL_VERSION,
            heartbeat,
        }
    }

    /// Create a new UserConnected event.
    #[must_use]
    pub fn user_connected(room: impl Into<String>, participant: impl Into<String>) -> Self {
        ServerEvent::UserConnected {
            room: room.into(),
            participant: participant.into(),
        }
    }

    /// Create a new UserDisconnected event.
    #[must_use]
    pub fn user_disconnected(room: impl Into<String>, participant: impl Into<String>) -> Self {
        ServerEvent::UserDisconnected {
            room: room.into(),
            participant: participant.into(),
        }
    }

    /// Create a new Error event.
    #[must_use]
    pub fn error(code: u16, message: impl Into<String>) -> Self {
        ServerEvent::Error {
            code,
            message: message.into(),
        }
    }
}

/// Error codes carried by [`ServerEvent::Error`].
pub mod error_codes {
    /// The inbound frame could not be decoded.
    pub const MALFORMED: u16 = 1001;
    /// The room name was rejected.
    pub const INVALID_ROOM: u16 = 1002;
    /// The connection holds too many memberships.
    pub const LIMIT_REACHED: u16 = 1003;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_event_wire_shape() {
        let json = r#"{"type":"join-room","room":"abc","participant":"p1"}"#;
        let event: ClientEvent = serde_json::from_str(json).unwrap();
        assert_eq!(event, ClientEvent::join_room("abc", "p1"));
        assert_eq!(event.kind(), EventKind::JoinRoom);
        assert_eq!(event.room(), Some("abc"));
    }

    #[test]
    fn test_call_signal_nested_tag() {
        let json = r#"{"type":"call","from":"p1","target":"p2","signal":{"kind":"candidate","candidate":"c1"}}"#;
        let event: ClientEvent = serde_json::from_str(json).unwrap();
        assert_eq!(event, ClientEvent::call("p1", "p2", CallSignal::candidate("c1")));
        assert_eq!(event.room(), None);
    }

    #[test]
    fn test_server_event_serializes_kebab_tag() {
        let event = ServerEvent::user_connected("abc", "p2");
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "user-connected");
        assert_eq!(value["participant"], "p2");
    }

    #[test]
    fn test_ping_without_timestamp() {
        let event: ClientEvent = serde_json::from_str(r#"{"type":"ping"}"#).unwrap();
        assert_eq!(event, ClientEvent::Ping { timestamp: None });
    }

    #[test]
    fn test_kind_names_match_wire_tags() {
        let event = ServerEvent::Pong { timestamp: Some(5) };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], event.kind().as_str());
    }
}
