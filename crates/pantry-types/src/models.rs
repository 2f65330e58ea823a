use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Longest body the composer accepts.
pub const MAX_BODY_CHARS: usize = 280;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(pub i64);

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(pub i64);

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reaction {
    pub reaction: String,
    pub user_id: UserId,
}

/// A direct message as the server describes it.
///
/// Immutable once delivered, except `delivered_at`/`read_at` (set once) and
/// `reactions` (append-only).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub sender_id: UserId,
    pub recipient_id: UserId,
    pub body: String,
    #[serde(deserialize_with = "timestamp::required")]
    pub timestamp: DateTime<Utc>,
    #[serde(default, deserialize_with = "timestamp::optional")]
    pub delivered_at: Option<DateTime<Utc>>,
    #[serde(default, deserialize_with = "timestamp::optional")]
    pub read_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub reactions: Vec<Reaction>,
    /// Per-conversation sequence number assigned by the server.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seq: Option<u64>,
    /// Correlation id echoed back for messages this client sent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<Uuid>,
}

impl Message {
    /// The conversation this message belongs to, seen from `me`.
    pub fn conversation_with(&self, me: UserId) -> UserId {
        if self.sender_id == me {
            self.recipient_id
        } else {
            self.sender_id
        }
    }
}

/// The server renders naive `isoformat()` timestamps without an offset; those
/// are UTC. Offset-carrying RFC 3339 strings are accepted as well.
pub mod timestamp {
    use chrono::{DateTime, NaiveDateTime, Utc};
    use serde::{Deserialize, Deserializer, de};

    pub fn parse(raw: &str) -> Result<DateTime<Utc>, chrono::ParseError> {
        raw.parse::<DateTime<Utc>>().or_else(|_| {
            NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f").map(|ndt| ndt.and_utc())
        })
    }

    pub fn required<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        parse(&raw).map_err(de::Error::custom)
    }

    pub fn optional<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
    where
        D: Deserializer<'de>,
    {
        match Option::<String>::deserialize(deserializer)? {
            Some(raw) => parse(&raw).map(Some).map_err(de::Error::custom),
            None => Ok(None),
        }
    }
}

/// One row of the inbox sidebar.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SidebarEntry {
    pub user_id: UserId,
    #[serde(default)]
    pub avatar: String,
    #[serde(default)]
    pub message_preview: String,
    #[serde(default)]
    pub latest_timestamp: String,
    #[serde(default)]
    pub notif_count: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedUser {
    pub id: UserId,
    pub username: String,
    #[serde(default)]
    pub email: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_decodes_without_optional_fields() {
        let json = r#"{
            "id": 7,
            "sender_id": 2,
            "recipient_id": 1,
            "body": "hello",
            "timestamp": "2024-03-01T10:00:00+00:00",
            "read_at": null,
            "delivered_at": null,
            "reactions": []
        }"#;
        let msg: Message = serde_json::from_str(json).unwrap();
        assert_eq!(msg.id, MessageId(7));
        assert_eq!(msg.seq, None);
        assert_eq!(msg.client_id, None);
        assert_eq!(msg.conversation_with(UserId(1)), UserId(2));
        assert_eq!(msg.conversation_with(UserId(2)), UserId(1));
    }

    #[test]
    fn naive_server_timestamps_are_utc() {
        let json = r#"{
            "id": 1,
            "sender_id": 1,
            "recipient_id": 2,
            "body": "x",
            "timestamp": "2024-03-01T10:00:00.250000",
            "read_at": "2024-03-01T10:05:00"
        }"#;
        let msg: Message = serde_json::from_str(json).unwrap();
        assert_eq!(msg.timestamp.to_rfc3339(), "2024-03-01T10:00:00.250+00:00");
        assert!(msg.read_at.is_some());
        assert!(msg.delivered_at.is_none());
    }
}
