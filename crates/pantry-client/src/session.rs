use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

use pantry_store::Database;
use pantry_types::models::{CachedUser, UserId};

use crate::api::{ApiClient, LoginOutcome, user_id_from_token};
use crate::bus::EventBus;
use crate::chat::ChatView;
use crate::checklist::Checklist;
use crate::config::ClientConfig;
use crate::error::{ClientError, Result};
use crate::notify::{AlertSink, NotificationRelay};
use crate::sidebar;
use crate::transport::{Channel, ConnectionState, CredentialCell};

/// Everything that lives for one logged-in user: REST client, socket,
/// notification relay. Created on login, torn down on logout; nothing is
/// shared between sessions.
pub struct Session {
    config: Arc<ClientConfig>,
    user: CachedUser,
    api: ApiClient,
    channel: Channel,
    bus: EventBus,
    relay: NotificationRelay,
    cancel: CancellationToken,
    relay_task: JoinHandle<()>,
}

impl Session {
    /// Resume with the credentials already in the store.
    pub fn start(
        config: Arc<ClientConfig>,
        store: Arc<Database>,
        sink: Arc<dyn AlertSink>,
    ) -> Result<Self> {
        config.validate()?;
        let creds = store.credentials()?.ok_or(ClientError::Unauthenticated)?;
        let user = match store.cached_user()? {
            Some(user) => user,
            None => CachedUser {
                id: user_id_from_token(&creds.access_token)?,
                username: String::new(),
                email: None,
            },
        };

        let credential = CredentialCell::new(Some(creds.access_token));
        let api = ApiClient::new(config.clone(), store, credential.clone())?;
        Ok(Self::assemble(config, api, credential, user, sink))
    }

    /// Password login (plus second factor when the account has one), then
    /// start a session with the fresh tokens.
    pub async fn login(
        config: Arc<ClientConfig>,
        store: Arc<Database>,
        sink: Arc<dyn AlertSink>,
        username: &str,
        password: &str,
        mfa_code: Option<&str>,
    ) -> Result<Self> {
        config.validate()?;
        let credential = CredentialCell::new(None);
        let api = ApiClient::new(config.clone(), store, credential.clone())?;

        let user = match api.login(username, password, true).await? {
            LoginOutcome::LoggedIn(user) => user,
            LoginOutcome::MfaRequired(user) => {
                let Some(code) = mfa_code else {
                    api.logout().await?;
                    return Err(ClientError::Status {
                        status: 401,
                        message: "multi-factor code required".into(),
                    });
                };
                api.verify_mfa(code).await?;
                user
            }
        };
        Ok(Self::assemble(config, api, credential, user, sink))
    }

    fn assemble(
        config: Arc<ClientConfig>,
        api: ApiClient,
        credential: CredentialCell,
        user: CachedUser,
        sink: Arc<dyn AlertSink>,
    ) -> Self {
        let channel = Channel::spawn(config.clone(), credential);
        let bus = channel.bus();
        let relay = NotificationRelay::new(user.id, bus.clone(), sink);
        let cancel = CancellationToken::new();
        let relay_task = relay.spawn(cancel.child_token());

        info!("session started for user {}", user.id);
        Self {
            config,
            user,
            api,
            channel,
            bus,
            relay,
            cancel,
            relay_task,
        }
    }

    pub fn user(&self) -> &CachedUser {
        &self.user
    }

    pub fn user_id(&self) -> UserId {
        self.user.id
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn api(&self) -> &ApiClient {
        &self.api
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn relay(&self) -> &NotificationRelay {
        &self.relay
    }

    pub fn state(&self) -> ConnectionState {
        self.channel.state()
    }

    /// Wait until the socket is up. Fails with `NotConnected` on timeout.
    pub async fn wait_connected(&self, timeout: Duration) -> Result<()> {
        let mut state = self.bus.watch_state();
        let connected = state.wait_for(|s| matches!(s, ConnectionState::Connected(_)));
        match tokio::time::timeout(timeout, connected).await {
            Ok(Ok(_)) => Ok(()),
            _ => Err(ClientError::NotConnected),
        }
    }

    pub async fn open_chat(&self, with: UserId) -> Result<ChatView<ApiClient>> {
        ChatView::open(
            self.user.id,
            with,
            self.bus.clone(),
            self.api.clone(),
            self.relay.clone(),
            &self.config,
            &self.cancel,
        )
        .await
    }

    pub async fn open_checklist(&self, recipe_id: i64) -> Result<Checklist<ApiClient>> {
        Checklist::open(recipe_id, self.api.store().clone(), self.api.clone()).await
    }

    /// Keep `update_sidebar` coming; stops with the session.
    pub fn spawn_sidebar_refresher(&self) -> JoinHandle<()> {
        sidebar::spawn_refresher(
            self.bus.clone(),
            self.config.sidebar_refresh,
            self.cancel.child_token(),
        )
    }

    /// Stop background work and the socket, keeping stored credentials.
    pub async fn close(self) {
        self.cancel.cancel();
        let _ = self.relay_task.await;
        self.channel.shutdown().await;
        info!("session closed for user {}", self.user.id);
    }

    /// Close the session and forget its credentials, locally even if the
    /// server cannot be reached.
    pub async fn logout(self) -> Result<()> {
        let api = self.api.clone();
        self.close().await;
        api.logout().await
    }
}
