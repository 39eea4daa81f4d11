use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    domain::{ChatId, ConnectionId, MessageId, Role, RoomId, SessionId, UserId},
    error::ApiError,
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaDescriptor {
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size_bytes: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessagePayload {
    pub id: MessageId,
    pub chat_id: ChatId,
    pub sender_id: UserId,
    pub sender_role: Role,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media: Option<MediaDescriptor>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub read_by_recipient: bool,
}

impl MessagePayload {
    /// Role of the participant this message is addressed to.
    pub fn recipient_role(&self) -> Role {
        self.sender_role.counterpart()
    }
}

/// Unread counters kept independently for each side of a thread.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnreadCounts {
    #[serde(default)]
    pub end_user: u32,
    #[serde(default)]
    pub provider: u32,
}

impl UnreadCounts {
    pub fn get(&self, role: Role) -> u32 {
        match role {
            Role::EndUser => self.end_user,
            Role::Provider => self.provider,
        }
    }

    pub fn get_mut(&mut self, role: Role) -> &mut u32 {
        match role {
            Role::EndUser => &mut self.end_user,
            Role::Provider => &mut self.provider,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationSummary {
    pub id: ChatId,
    pub participant_ids: Vec<UserId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_message_preview: Option<String>,
    #[serde(default)]
    pub unread: UnreadCounts,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendMessageRequest {
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media: Option<MediaDescriptor>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessagesPageQuery {
    pub page: u32,
    pub limit: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessagesReadPayload {
    pub chat_id: ChatId,
    pub reader_role: Role,
    /// Empty means every message addressed to `reader_role` in the chat.
    #[serde(default)]
    pub message_ids: Vec<MessageId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypingPayload {
    pub chat_id: ChatId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<UserId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresencePayload {
    pub user_id: UserId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallInitiatedPayload {
    pub session_id: SessionId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub caller_id: Option<UserId>,
}

/// First frame the server sends after the websocket upgrade.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum HandshakeFrame {
    Ready { connection_id: ConnectionId },
    Rejected(ApiError),
}

/// Events pushed by the realtime backend once the connection is ready.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum RealtimeEvent {
    #[serde(rename = "new-message")]
    NewMessage(MessagePayload),
    #[serde(rename = "messages-read")]
    MessagesRead(MessagesReadPayload),
    #[serde(rename = "typing:start")]
    TypingStart(TypingPayload),
    #[serde(rename = "typing:stop")]
    TypingStop(TypingPayload),
    #[serde(rename = "online")]
    Online(PresencePayload),
    #[serde(rename = "offline")]
    Offline(PresencePayload),
    #[serde(rename = "call-initiated")]
    CallInitiated(CallInitiatedPayload),
    #[serde(rename = "session-activated")]
    SessionActivated { session_id: SessionId },
}

impl RealtimeEvent {
    pub fn name(&self) -> EventName {
        match self {
            RealtimeEvent::NewMessage(_) => EventName::NewMessage,
            RealtimeEvent::MessagesRead(_) => EventName::MessagesRead,
            RealtimeEvent::TypingStart(_) => EventName::TypingStart,
            RealtimeEvent::TypingStop(_) => EventName::TypingStop,
            RealtimeEvent::Online(_) => EventName::Online,
            RealtimeEvent::Offline(_) => EventName::Offline,
            RealtimeEvent::CallInitiated(_) => EventName::CallInitiated,
            RealtimeEvent::SessionActivated { .. } => EventName::SessionActivated,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventName {
    NewMessage,
    MessagesRead,
    TypingStart,
    TypingStop,
    Online,
    Offline,
    CallInitiated,
    SessionActivated,
}

impl EventName {
    pub fn as_str(self) -> &'static str {
        match self {
            EventName::NewMessage => "new-message",
            EventName::MessagesRead => "messages-read",
            EventName::TypingStart => "typing:start",
            EventName::TypingStop => "typing:stop",
            EventName::Online => "online",
            EventName::Offline => "offline",
            EventName::CallInitiated => "call-initiated",
            EventName::SessionActivated => "session-activated",
        }
    }
}

impl fmt::Display for EventName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Frames the client sends over the realtime connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum ClientFrame {
    #[serde(rename = "join-room")]
    JoinRoom { room: RoomId },
    #[serde(rename = "leave-room")]
    LeaveRoom { room: RoomId },
    #[serde(rename = "typing:start")]
    TypingStart { chat_id: ChatId },
    #[serde(rename = "typing:stop")]
    TypingStop { chat_id: ChatId },
    #[serde(rename = "online")]
    Online,
    #[serde(rename = "offline")]
    Offline,
}
