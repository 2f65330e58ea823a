use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::{CachedUser, Message, timestamp};

// -- JWT Claims --

/// Claims carried by the access token. The server stores the user id in
/// `sub` as a string.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub exp: usize,
}

// -- Auth --

#[derive(Debug, Serialize)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
    pub remember_me: bool,
}

#[derive(Debug, Deserialize)]
pub struct LoginResponse {
    #[serde(default)]
    pub success: bool,
    #[serde(default)]
    pub access_token: Option<String>,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub require_mfa: bool,
    #[serde(default)]
    pub user: Option<CachedUser>,
    #[serde(default)]
    pub error: Option<String>,
}

/// The refresh endpoint has been seen answering `{"succes": true, ...}`, so
/// only `access_token` is trusted.
#[derive(Debug, Deserialize)]
pub struct RefreshResponse {
    #[serde(default)]
    pub access_token: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct MfaVerifyRequest {
    pub code: String,
}

/// Generic `{success, message|error}` envelope most endpoints answer with.
#[derive(Debug, Default, Deserialize)]
pub struct Ack {
    #[serde(default)]
    pub success: bool,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

impl Ack {
    pub fn reason(&self) -> Option<&str> {
        self.message.as_deref().or(self.error.as_deref())
    }
}

// -- Messages --

/// One page of a conversation, newest message first.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct MessagePage {
    #[serde(default)]
    pub messages: Vec<Message>,
    #[serde(default)]
    pub has_next: bool,
    #[serde(default)]
    pub next_page: Option<u32>,
}

// -- Recipe progress --

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SaveProgressRequest {
    pub recipe_id: i64,
    pub checked_ingredients: BTreeMap<String, bool>,
    /// Server version the client last synced from; lets the server detect a
    /// stale overwrite.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ProgressResponse {
    #[serde(default)]
    pub success: bool,
    #[serde(default)]
    pub checked_ingredients: Option<BTreeMap<String, bool>>,
    #[serde(default, deserialize_with = "timestamp::optional")]
    pub updated_at: Option<DateTime<Utc>>,
}
