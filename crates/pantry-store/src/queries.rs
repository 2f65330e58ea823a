use crate::Database;
use crate::models::{
    Credentials, REFRESH_TOKEN_KEY, StoredChecklist, TOKEN_KEY, USER_KEY, checklist_key,
};
use anyhow::{Context, Result};
use pantry_types::models::CachedUser;
use rusqlite::{Connection, OptionalExtension};

impl Database {
    // -- Raw key/value --

    pub fn get(&self, key: &str) -> Result<Option<String>> {
        self.with_conn(|conn| query_value(conn, key))
    }

    pub fn put(&self, key: &str, value: &str) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO kv (key, value) VALUES (?1, ?2)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = datetime('now')",
                (key, value),
            )?;
            Ok(())
        })
    }

    pub fn remove(&self, key: &str) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute("DELETE FROM kv WHERE key = ?1", [key])?;
            Ok(())
        })
    }

    // -- Credentials --

    pub fn credentials(&self) -> Result<Option<Credentials>> {
        self.with_conn(|conn| {
            let Some(access_token) = query_value(conn, TOKEN_KEY)? else {
                return Ok(None);
            };
            let refresh_token = query_value(conn, REFRESH_TOKEN_KEY)?;
            Ok(Some(Credentials {
                access_token,
                refresh_token,
            }))
        })
    }

    pub fn save_credentials(&self, creds: &Credentials) -> Result<()> {
        self.put(TOKEN_KEY, &creds.access_token)?;
        match &creds.refresh_token {
            Some(refresh) => self.put(REFRESH_TOKEN_KEY, refresh),
            None => self.remove(REFRESH_TOKEN_KEY),
        }
    }

    pub fn save_access_token(&self, token: &str) -> Result<()> {
        self.put(TOKEN_KEY, token)
    }

    /// Drops both tokens and the cached user.
    pub fn clear_credentials(&self) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "DELETE FROM kv WHERE key IN (?1, ?2, ?3)",
                (TOKEN_KEY, REFRESH_TOKEN_KEY, USER_KEY),
            )?;
            Ok(())
        })
    }

    // -- Cached user --

    pub fn cached_user(&self) -> Result<Option<CachedUser>> {
        let Some(raw) = self.get(USER_KEY)? else {
            return Ok(None);
        };
        let user = serde_json::from_str(&raw).context("corrupt cached user")?;
        Ok(Some(user))
    }

    pub fn save_cached_user(&self, user: &CachedUser) -> Result<()> {
        self.put(USER_KEY, &serde_json::to_string(user)?)
    }

    // -- Checklists --

    pub fn checklist(&self, recipe_id: i64) -> Result<Option<StoredChecklist>> {
        let Some(raw) = self.get(&checklist_key(recipe_id))? else {
            return Ok(None);
        };
        let checklist = StoredChecklist::decode(&raw)
            .with_context(|| format!("corrupt checklist for recipe {}", recipe_id))?;
        Ok(Some(checklist))
    }

    /// Full-state overwrite.
    pub fn save_checklist(&self, recipe_id: i64, checklist: &StoredChecklist) -> Result<()> {
        self.put(&checklist_key(recipe_id), &serde_json::to_string(checklist)?)
    }
}

fn query_value(conn: &Connection, key: &str) -> Result<Option<String>> {
    let value = conn
        .query_row("SELECT value FROM kv WHERE key = ?1", [key], |row| row.get(0))
        .optional()?;
    Ok(value)
}
