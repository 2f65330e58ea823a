use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info, warn};

use pantry_store::{Database, StoredChecklist};
use pantry_types::api::SaveProgressRequest;

use crate::api::ProgressRemote;
use crate::error::Result;

/// Item key for the ingredient on line `index` of a recipe.
pub fn line_key(index: usize) -> String {
    format!("ingredient-{}", index)
}

/// Checked-ingredient state for one recipe.
///
/// The local store is authoritative. The server copy is only read when no
/// local copy exists, and is written back best-effort when the view is
/// flushed or closed.
pub struct Checklist<R> {
    recipe_id: i64,
    store: Arc<Database>,
    remote: R,
    state: StoredChecklist,
}

impl<R: ProgressRemote> Checklist<R> {
    /// Read the local copy, seeding it from the server when there is none.
    pub async fn open(recipe_id: i64, store: Arc<Database>, remote: R) -> Result<Self> {
        if let Some(local) = store.checklist(recipe_id)? {
            debug!("recipe {} checklist from local store", recipe_id);
            return Ok(Self {
                recipe_id,
                store,
                remote,
                state: local,
            });
        }

        let mut checklist = Self {
            recipe_id,
            store,
            remote,
            state: StoredChecklist::default(),
        };
        checklist.seed().await?;
        Ok(checklist)
    }

    async fn seed(&mut self) -> Result<()> {
        let fetched = match self.remote.load_progress(self.recipe_id).await {
            Ok(resp) if resp.success => resp,
            Ok(_) => {
                debug!("no server progress for recipe {}", self.recipe_id);
                return Ok(());
            }
            Err(e) => {
                warn!("could not fetch progress for recipe {}: {}", self.recipe_id, e);
                return Ok(());
            }
        };

        // A toggle that landed while the fetch was out wins over the seed
        if let Some(local) = self.store.checklist(self.recipe_id)? {
            debug!("recipe {} written locally during seed, keeping it", self.recipe_id);
            self.state = local;
            return Ok(());
        }

        let Some(items) = fetched.checked_ingredients.filter(|items| !items.is_empty()) else {
            return Ok(());
        };
        let version = fetched.updated_at.unwrap_or_else(Utc::now);
        self.state = StoredChecklist {
            items,
            updated_at: Some(version),
            ..Default::default()
        };
        self.state.mark_synced(version);
        self.store.save_checklist(self.recipe_id, &self.state)?;
        info!(
            "seeded recipe {} checklist from server ({} items)",
            self.recipe_id,
            self.state.items.len()
        );
        Ok(())
    }

    pub fn recipe_id(&self) -> i64 {
        self.recipe_id
    }

    pub fn items(&self) -> &BTreeMap<String, bool> {
        &self.state.items
    }

    pub fn is_checked(&self, key: &str) -> bool {
        self.state.items.get(key).copied().unwrap_or(false)
    }

    /// Flip one item and persist the full state. Returns the new value.
    pub fn toggle(&mut self, key: &str) -> Result<bool> {
        let checked = !self.is_checked(key);
        self.set(key, checked)?;
        Ok(checked)
    }

    pub fn set(&mut self, key: &str, checked: bool) -> Result<()> {
        self.state.items.insert(key.to_string(), checked);
        self.state.touch(Utc::now());
        self.store.save_checklist(self.recipe_id, &self.state)?;
        Ok(())
    }

    /// Push local changes to the server. Never fails; problems are logged
    /// and the local copy stays dirty for the next attempt.
    pub async fn flush(&mut self) {
        if self.state.items.is_empty() || !self.state.is_dirty() {
            return;
        }

        let request = SaveProgressRequest {
            recipe_id: self.recipe_id,
            checked_ingredients: self.state.items.clone(),
            base_updated_at: self.state.synced_at,
        };
        match self.remote.save_progress(request).await {
            Ok(resp) if resp.success => {
                let version = resp.updated_at.or(self.state.updated_at).unwrap_or_else(Utc::now);
                self.state.mark_synced(version);
                if let Err(e) = self.store.save_checklist(self.recipe_id, &self.state) {
                    warn!("could not record sync of recipe {}: {}", self.recipe_id, e);
                }
                debug!("recipe {} progress saved", self.recipe_id);
            }
            Ok(_) => warn!("server refused progress for recipe {}", self.recipe_id),
            Err(e) => warn!("could not save progress for recipe {}: {}", self.recipe_id, e),
        }
    }

    /// Teardown: flush, then drop the view.
    pub async fn close(mut self) {
        self.flush().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use chrono::{DateTime, TimeZone};
    use pantry_types::api::ProgressResponse;

    use crate::error::ClientError;

    #[derive(Clone, Default)]
    struct FakeRemote {
        server: Option<BTreeMap<String, bool>>,
        updated_at: Option<DateTime<Utc>>,
        offline: bool,
        saved: Arc<Mutex<Vec<SaveProgressRequest>>>,
        /// Written to the store while the fetch is in flight
        race: Option<(Arc<Database>, StoredChecklist)>,
    }

    impl ProgressRemote for FakeRemote {
        async fn load_progress(&self, recipe_id: i64) -> Result<ProgressResponse> {
            if self.offline {
                return Err(ClientError::NotConnected);
            }
            if let Some((store, local)) = &self.race {
                store.save_checklist(recipe_id, local).unwrap();
            }
            Ok(ProgressResponse {
                success: self.server.is_some(),
                checked_ingredients: self.server.clone(),
                updated_at: self.updated_at,
            })
        }

        async fn save_progress(&self, request: SaveProgressRequest) -> Result<ProgressResponse> {
            if self.offline {
                return Err(ClientError::NotConnected);
            }
            self.saved.lock().unwrap().push(request);
            Ok(ProgressResponse {
                success: true,
                checked_ingredients: None,
                updated_at: Some(Utc.timestamp_opt(4_000_000_000, 0).unwrap()),
            })
        }
    }

    fn offline() -> FakeRemote {
        FakeRemote {
            offline: true,
            ..Default::default()
        }
    }

    fn items(pairs: &[(usize, bool)]) -> BTreeMap<String, bool> {
        pairs.iter().map(|(i, v)| (line_key(*i), *v)).collect()
    }

    #[tokio::test]
    async fn test_toggles_survive_reload_without_network() {
        let store = Arc::new(Database::open_in_memory().unwrap());

        let mut checklist = Checklist::open(7, store.clone(), offline()).await.unwrap();
        assert!(checklist.items().is_empty());
        assert!(checklist.toggle(&line_key(0)).unwrap());
        assert!(checklist.toggle(&line_key(2)).unwrap());
        assert!(!checklist.toggle(&line_key(2)).unwrap());
        let before = checklist.items().clone();
        checklist.close().await;

        let reopened = Checklist::open(7, store, offline()).await.unwrap();
        assert_eq!(reopened.items(), &before);
        assert_eq!(before, items(&[(0, true), (2, false)]));
    }

    #[tokio::test]
    async fn test_server_copy_seeds_only_when_local_absent() {
        let store = Arc::new(Database::open_in_memory().unwrap());
        let remote = FakeRemote {
            server: Some(items(&[(1, true)])),
            updated_at: Some(Utc.timestamp_opt(1_700_000_000, 0).unwrap()),
            ..Default::default()
        };

        let seeded = Checklist::open(3, store.clone(), remote.clone()).await.unwrap();
        assert!(seeded.is_checked(&line_key(1)));
        // Seeded state matches the server, nothing to push
        seeded.close().await;
        assert!(remote.saved.lock().unwrap().is_empty());

        // Local exists now; a different server copy is ignored
        let other = FakeRemote {
            server: Some(items(&[(1, false), (4, true)])),
            ..Default::default()
        };
        let local = Checklist::open(3, store, other).await.unwrap();
        assert_eq!(local.items(), &items(&[(1, true)]));
    }

    #[tokio::test]
    async fn test_toggle_during_seed_wins() {
        let store = Arc::new(Database::open_in_memory().unwrap());
        let local = StoredChecklist {
            items: items(&[(0, true)]),
            updated_at: Some(Utc::now()),
            synced_at: None,
            dirty: true,
        };
        let remote = FakeRemote {
            server: Some(items(&[(5, true)])),
            race: Some((store.clone(), local.clone())),
            ..Default::default()
        };

        let checklist = Checklist::open(9, store.clone(), remote).await.unwrap();
        assert_eq!(checklist.items(), &local.items);
        assert_eq!(store.checklist(9).unwrap().unwrap().items, local.items);
    }

    #[tokio::test]
    async fn test_close_pushes_dirty_state_with_base_version() {
        let store = Arc::new(Database::open_in_memory().unwrap());
        let synced = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        let remote = FakeRemote {
            server: Some(items(&[(0, true)])),
            updated_at: Some(synced),
            ..Default::default()
        };

        let mut checklist = Checklist::open(1, store.clone(), remote.clone()).await.unwrap();
        checklist.set(&line_key(3), true).unwrap();
        checklist.close().await;

        let saved = remote.saved.lock().unwrap().clone();
        assert_eq!(saved.len(), 1);
        assert_eq!(saved[0].recipe_id, 1);
        assert_eq!(saved[0].checked_ingredients, items(&[(0, true), (3, true)]));
        assert_eq!(saved[0].base_updated_at, Some(synced));

        let stored = store.checklist(1).unwrap().unwrap();
        assert!(!stored.is_dirty());
        assert_eq!(
            stored.synced_at,
            Some(Utc.timestamp_opt(4_000_000_000, 0).unwrap())
        );
    }

    #[tokio::test]
    async fn test_edits_reach_server_when_its_clock_runs_ahead() {
        let store = Arc::new(Database::open_in_memory().unwrap());
        let ahead = Utc::now() + chrono::Duration::seconds(30);
        let remote = FakeRemote {
            server: Some(items(&[(0, true)])),
            updated_at: Some(ahead),
            ..Default::default()
        };

        let mut checklist = Checklist::open(6, store.clone(), remote.clone()).await.unwrap();
        checklist.toggle(&line_key(1)).unwrap();
        checklist.close().await;
        assert_eq!(remote.saved.lock().unwrap().len(), 1);
        assert_eq!(remote.saved.lock().unwrap()[0].base_updated_at, Some(ahead));

        // Second session: the push above set a far-future version
        let mut checklist = Checklist::open(6, store.clone(), remote.clone()).await.unwrap();
        assert!(!store.checklist(6).unwrap().unwrap().is_dirty());
        checklist.toggle(&line_key(2)).unwrap();
        assert!(store.checklist(6).unwrap().unwrap().is_dirty());
        checklist.close().await;

        let saved = remote.saved.lock().unwrap().clone();
        assert_eq!(saved.len(), 2);
        assert_eq!(saved[1].checked_ingredients, items(&[(0, true), (1, true), (2, true)]));
        assert!(!store.checklist(6).unwrap().unwrap().is_dirty());
    }

    #[tokio::test]
    async fn test_failed_push_is_swallowed_and_stays_dirty() {
        let store = Arc::new(Database::open_in_memory().unwrap());
        let mut checklist = Checklist::open(2, store.clone(), offline()).await.unwrap();

        // Empty state never pushes
        checklist.flush().await;

        checklist.toggle(&line_key(0)).unwrap();
        checklist.close().await;
        assert!(store.checklist(2).unwrap().unwrap().is_dirty());
    }
}
