use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::api::MessagePage;
use crate::models::{Message, MessageId, SidebarEntry, UserId, timestamp};

/// Events pushed by the server over the socket.
///
/// On the wire an event is a Socket.IO array `["name", payload]`; the serde
/// representation below is the adjacently tagged form of the same thing and
/// is converted with [`ServerEvent::from_frame`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "payload", rename_all = "snake_case")]
pub enum ServerEvent {
    /// Per-conversation inbox summary, keyed by username
    UpdateSidebar(SidebarUpdate),

    /// The remote participant started or stopped composing
    UserTyping { user_id: UserId, is_typing: bool },

    /// Authoritative unread count for the current user
    PushNotification {
        #[serde(default)]
        notification_count: Option<u32>,
    },

    /// A single new message in one of our conversations
    NewMessage(Message),

    /// The newest page of a conversation, pushed after a send or chat switch
    LoadMessages(LoadedMessages),

    /// A reaction was appended to a message
    MessageReaction {
        message_id: MessageId,
        reaction: String,
        user_id: UserId,
    },

    /// Delivery/read receipt for a message we sent
    MessageStatusUpdate {
        message_id: MessageId,
        status: ReceiptKind,
        #[serde(default, deserialize_with = "timestamp::optional")]
        timestamp: Option<DateTime<Utc>>,
    },

    /// A user came online or went offline
    UserStatus { user_id: UserId, status: Presence },

    /// The server refused a request (rate limit, validation)
    Error {
        message: String,
        #[serde(default)]
        client_id: Option<Uuid>,
    },
}

impl ServerEvent {
    /// Decode a Socket.IO event frame.
    pub fn from_frame(name: &str, payload: Option<Value>) -> serde_json::Result<Self> {
        let mut tagged = Map::new();
        tagged.insert("event".into(), Value::String(name.to_string()));
        if let Some(payload) = payload {
            tagged.insert("payload".into(), payload);
        }
        serde_json::from_value(Value::Object(tagged))
    }
}

/// Commands sent FROM client TO server over the socket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "payload", rename_all = "snake_case")]
pub enum ClientCommand {
    /// Send a direct message
    MessageInput { data: OutgoingMessage },

    /// Local composing state for a conversation
    HandleTyping { recipient_id: UserId, is_typing: bool },

    /// Ask for a fresh `update_sidebar`
    RefreshSidebar,

    /// Ask for a fresh `push_notification`
    UpdateMessageCounter,

    /// Mark a conversation as the open chat
    ChatUserConnected { data: ChatTarget },

    /// The open chat rendered its messages; clears its unread notifications
    MessagesLoaded { data: ChatTarget },

    /// Append a reaction to a message
    MessageReaction { message_id: MessageId, reaction: String },

    /// Report a delivery/read receipt
    MessageStatus {
        message_id: MessageId,
        #[serde(rename = "type")]
        kind: ReceiptKind,
    },
}

impl ClientCommand {
    pub fn name(&self) -> &'static str {
        match self {
            Self::MessageInput { .. } => "message_input",
            Self::HandleTyping { .. } => "handle_typing",
            Self::RefreshSidebar => "refresh_sidebar",
            Self::UpdateMessageCounter => "update_message_counter",
            Self::ChatUserConnected { .. } => "chat_user_connected",
            Self::MessagesLoaded { .. } => "messages_loaded",
            Self::MessageReaction { .. } => "message_reaction",
            Self::MessageStatus { .. } => "message_status",
        }
    }

    /// Render as a Socket.IO event array: `["name"]` or `["name", payload]`.
    pub fn to_frame(&self) -> serde_json::Result<Value> {
        let mut frame = vec![Value::String(self.name().to_string())];
        if let Value::Object(mut tagged) = serde_json::to_value(self)? {
            if let Some(payload) = tagged.remove("payload") {
                frame.push(payload);
            }
        }
        Ok(Value::Array(frame))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutgoingMessage {
    pub message: String,
    pub recipient_id: UserId,
    pub client_id: Uuid,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatTarget {
    pub recipient: UserId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReceiptKind {
    Delivered,
    Read,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Presence {
    Online,
    Offline,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SidebarUpdate {
    #[serde(default)]
    pub data: BTreeMap<String, SidebarEntry>,
    /// `0` when no chat is open.
    #[serde(default)]
    pub current_chat_id: Option<UserId>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatRecipient {
    pub id: UserId,
    pub username: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoadedMessages {
    #[serde(flatten)]
    pub page: MessagePage,
    #[serde(default)]
    pub chat_recipient: Option<ChatRecipient>,
}
