//! Engine.IO v4 / Socket.IO v5 framing, text packets only.
//!
//! Engine packet = one type digit followed by data:
//!
//!   0 open     `0{"sid":..,"pingInterval":..,"pingTimeout":..}`
//!   1 close
//!   2 ping     (server -> client in v4)
//!   3 pong
//!   4 message  carries a Socket.IO packet
//!   5 upgrade
//!   6 noop
//!
//! Socket packet (inside an engine message) = type digit, optional
//! `/namespace,`, optional ack id, JSON:
//!
//!   0 connect        `0{"token":..}` client -> server, `0{"sid":..}` back
//!   1 disconnect
//!   2 event          `2["name",payload]`
//!   4 connect_error  `4{"message":..}`
//!
//! Polling payloads concatenate engine packets with the 0x1e record separator.

use serde::Deserialize;
use serde_json::Value;

use crate::error::{ClientError, Result};

pub const RECORD_SEPARATOR: char = '\u{1e}';

/// Engine.IO protocol revision we speak.
pub const ENGINE_VERSION: &str = "4";

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Handshake {
    pub sid: String,
    #[serde(default)]
    pub upgrades: Vec<String>,
    pub ping_interval: u64,
    pub ping_timeout: u64,
    #[serde(default)]
    pub max_payload: Option<u64>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum EnginePacket {
    Open(Handshake),
    Close,
    Ping(String),
    Pong(String),
    Message(String),
    Upgrade,
    Noop,
}

impl EnginePacket {
    pub fn encode(&self) -> String {
        match self {
            // Clients never send open; render the type digit only
            Self::Open(_) => "0".to_string(),
            Self::Close => "1".to_string(),
            Self::Ping(data) => format!("2{}", data),
            Self::Pong(data) => format!("3{}", data),
            Self::Message(data) => format!("4{}", data),
            Self::Upgrade => "5".to_string(),
            Self::Noop => "6".to_string(),
        }
    }

    pub fn decode(raw: &str) -> Result<Self> {
        let mut chars = raw.chars();
        let kind = chars
            .next()
            .ok_or_else(|| ClientError::Protocol("empty engine packet".into()))?;
        let data = chars.as_str();

        match kind {
            '0' => {
                let handshake: Handshake = serde_json::from_str(data)
                    .map_err(|e| ClientError::Protocol(format!("bad open packet: {}", e)))?;
                Ok(Self::Open(handshake))
            }
            '1' => Ok(Self::Close),
            '2' => Ok(Self::Ping(data.to_string())),
            '3' => Ok(Self::Pong(data.to_string())),
            '4' => Ok(Self::Message(data.to_string())),
            '5' => Ok(Self::Upgrade),
            '6' => Ok(Self::Noop),
            other => Err(ClientError::Protocol(format!(
                "unknown engine packet type '{}'",
                other
            ))),
        }
    }
}

/// Split a long-polling response body into engine packets.
pub fn decode_payload(body: &str) -> Result<Vec<EnginePacket>> {
    body.split(RECORD_SEPARATOR)
        .filter(|chunk| !chunk.is_empty())
        .map(EnginePacket::decode)
        .collect()
}

pub fn encode_payload(packets: &[EnginePacket]) -> String {
    packets
        .iter()
        .map(EnginePacket::encode)
        .collect::<Vec<_>>()
        .join(&RECORD_SEPARATOR.to_string())
}

#[derive(Debug, Clone, PartialEq)]
pub enum SocketPacket {
    Connect(Option<Value>),
    Disconnect,
    Event { name: String, payload: Option<Value> },
    ConnectError(Value),
}

impl SocketPacket {
    /// Build an event packet from a `["name", payload?]` frame.
    pub fn from_frame(frame: Value) -> Result<Self> {
        let Value::Array(mut items) = frame else {
            return Err(ClientError::Protocol("event frame is not an array".into()));
        };
        if items.is_empty() {
            return Err(ClientError::Protocol("event frame is empty".into()));
        }
        let payload = if items.len() > 1 {
            Some(items.swap_remove(1))
        } else {
            None
        };
        match items.swap_remove(0) {
            Value::String(name) => Ok(Self::Event { name, payload }),
            other => Err(ClientError::Protocol(format!("event name is not a string: {}", other))),
        }
    }

    pub fn encode(&self) -> String {
        match self {
            Self::Connect(Some(auth)) => format!("0{}", auth),
            Self::Connect(None) => "0".to_string(),
            Self::Disconnect => "1".to_string(),
            Self::Event { name, payload } => {
                let mut frame = vec![Value::String(name.clone())];
                if let Some(payload) = payload {
                    frame.push(payload.clone());
                }
                format!("2{}", Value::Array(frame))
            }
            Self::ConnectError(data) => format!("4{}", data),
        }
    }

    pub fn decode(raw: &str) -> Result<Self> {
        let mut chars = raw.chars();
        let kind = chars
            .next()
            .ok_or_else(|| ClientError::Protocol("empty socket packet".into()))?;
        let mut rest = chars.as_str();

        // Only the default namespace is used; skip an explicit one if present
        if rest.starts_with('/') {
            rest = match rest.find(',') {
                Some(idx) => &rest[idx + 1..],
                None => "",
            };
        }
        // Skip an ack id
        let rest = rest.trim_start_matches(|c: char| c.is_ascii_digit());

        let json = || -> Result<Value> {
            serde_json::from_str(rest)
                .map_err(|e| ClientError::Protocol(format!("bad socket payload: {}", e)))
        };

        match kind {
            '0' if rest.is_empty() => Ok(Self::Connect(None)),
            '0' => Ok(Self::Connect(Some(json()?))),
            '1' => Ok(Self::Disconnect),
            '2' => Self::from_frame(json()?),
            '4' => Ok(Self::ConnectError(if rest.is_empty() {
                Value::Null
            } else {
                json()?
            })),
            other => Err(ClientError::Protocol(format!(
                "unsupported socket packet type '{}'",
                other
            ))),
        }
    }
}
