use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Keys of the `kv` table.
pub const TOKEN_KEY: &str = "token";
pub const REFRESH_TOKEN_KEY: &str = "refresh_token";
pub const USER_KEY: &str = "user";

pub fn checklist_key(recipe_id: i64) -> String {
    format!("recipe-{}-checked-ingredients", recipe_id)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub access_token: String,
    pub refresh_token: Option<String>,
}

/// Checklist state as persisted for one recipe.
///
/// `synced_at` is the server version this copy last matched; `None` means it
/// has never been confirmed by the server. `dirty` is set by local edits and
/// cleared only by a successful push, so it never depends on comparing the
/// local clock with the server's.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct StoredChecklist {
    pub items: BTreeMap<String, bool>,
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub synced_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub dirty: bool,
}

impl StoredChecklist {
    /// Older entries were written as a bare `{line: bool}` object.
    pub fn decode(raw: &str) -> serde_json::Result<Self> {
        serde_json::from_str::<Self>(raw).or_else(|_| {
            serde_json::from_str::<BTreeMap<String, bool>>(raw).map(|items| Self {
                items,
                updated_at: None,
                synced_at: None,
                dirty: true,
            })
        })
    }

    /// True when local edits have not reached the server yet.
    pub fn is_dirty(&self) -> bool {
        self.dirty || self.synced_at.is_none()
    }

    /// Record a local edit.
    pub fn touch(&mut self, at: DateTime<Utc>) {
        self.updated_at = Some(at);
        self.dirty = true;
    }

    /// The server accepted this state as version `version`.
    pub fn mark_synced(&mut self, version: DateTime<Utc>) {
        self.synced_at = Some(version);
        self.dirty = false;
    }
}
