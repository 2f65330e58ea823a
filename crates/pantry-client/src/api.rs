use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use jsonwebtoken::{DecodingKey, Validation, decode};
use reqwest::{RequestBuilder, Response, StatusCode};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, info, warn};

use pantry_store::{Credentials, Database};
use pantry_types::api::{
    Ack, Claims, LoginRequest, LoginResponse, MessagePage, MfaVerifyRequest, ProgressResponse,
    RefreshResponse, SaveProgressRequest,
};
use pantry_types::models::{CachedUser, UserId};

use crate::config::ClientConfig;
use crate::error::{ClientError, Result};
use crate::transport::CredentialCell;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Paginated message history, newest page first.
pub trait MessageSource {
    fn fetch_page(
        &self,
        with: UserId,
        page: u32,
    ) -> impl Future<Output = Result<MessagePage>> + Send;
}

/// Server copy of per-recipe checklist progress.
pub trait ProgressRemote {
    fn load_progress(
        &self,
        recipe_id: i64,
    ) -> impl Future<Output = Result<ProgressResponse>> + Send;

    fn save_progress(
        &self,
        request: SaveProgressRequest,
    ) -> impl Future<Output = Result<ProgressResponse>> + Send;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoginOutcome {
    LoggedIn(CachedUser),
    /// Tokens are stored but the account wants a second factor before use.
    MfaRequired(CachedUser),
}

/// Authenticated REST calls against the recipe API.
///
/// Every call carries the stored access token. A 401 triggers exactly one
/// refresh and one retry; if the refresh fails the stored credentials are
/// dropped and the call fails with [`ClientError::Unauthenticated`].
#[derive(Clone)]
pub struct ApiClient {
    inner: Arc<ApiInner>,
}

struct ApiInner {
    http: reqwest::Client,
    config: Arc<ClientConfig>,
    store: Arc<Database>,
    /// Receives every new access token so the socket follows along
    credential: CredentialCell,
}

impl ApiClient {
    pub fn new(
        config: Arc<ClientConfig>,
        store: Arc<Database>,
        credential: CredentialCell,
    ) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        Ok(Self {
            inner: Arc::new(ApiInner {
                http,
                config,
                store,
                credential,
            }),
        })
    }

    pub fn store(&self) -> &Arc<Database> {
        &self.inner.store
    }

    pub async fn login(
        &self,
        username: &str,
        password: &str,
        remember_me: bool,
    ) -> Result<LoginOutcome> {
        let request = LoginRequest {
            username: username.to_string(),
            password: password.to_string(),
            remember_me,
        };
        let resp = self
            .inner
            .http
            .post(self.inner.config.endpoint("/login"))
            .json(&request)
            .send()
            .await?;

        let status = resp.status();
        let body: LoginResponse = resp.json().await?;
        if !status.is_success() || !body.success {
            return Err(ClientError::Status {
                status: status.as_u16(),
                message: body.error.unwrap_or_else(|| "login failed".into()),
            });
        }

        let Some(access_token) = body.access_token else {
            return Err(ClientError::Protocol("login response without access token".into()));
        };
        let user = match body.user {
            Some(user) => user,
            None => CachedUser {
                id: user_id_from_token(&access_token)?,
                username: username.to_string(),
                email: None,
            },
        };

        self.inner.store.save_credentials(&Credentials {
            access_token: access_token.clone(),
            refresh_token: body.refresh_token,
        })?;
        self.inner.store.save_cached_user(&user)?;
        info!("logged in as {} ({})", user.username, user.id);

        if body.require_mfa {
            return Ok(LoginOutcome::MfaRequired(user));
        }
        self.inner.credential.set(Some(access_token));
        Ok(LoginOutcome::LoggedIn(user))
    }

    /// Second step of an MFA login. A rejected code drops the provisional
    /// tokens.
    pub async fn verify_mfa(&self, code: &str) -> Result<()> {
        let request = MfaVerifyRequest {
            code: code.to_string(),
        };
        let outcome: Result<Ack> = self.post_json("/mfa/verify", &request).await;
        match outcome {
            Ok(ack) if ack.success => {
                let token = self.access_token()?;
                self.inner.credential.set(Some(token));
                Ok(())
            }
            Ok(ack) => {
                self.forget()?;
                Err(ClientError::Status {
                    status: StatusCode::UNAUTHORIZED.as_u16(),
                    message: ack.reason().unwrap_or("invalid code").to_string(),
                })
            }
            Err(e) => {
                self.forget()?;
                Err(e)
            }
        }
    }

    /// Tell the server, then forget local credentials whatever it said.
    pub async fn logout(&self) -> Result<()> {
        if let Ok(token) = self.access_token() {
            let sent = self
                .inner
                .http
                .post(self.inner.config.endpoint("/logout"))
                .header(reqwest::header::AUTHORIZATION, format!("Bearer {}", token))
                .send()
                .await;
            match sent {
                Ok(resp) if !resp.status().is_success() => {
                    warn!("logout returned {}", resp.status());
                }
                Err(e) => warn!("logout request failed: {}", e),
                Ok(_) => {}
            }
        }
        self.forget()?;
        info!("logged out");
        Ok(())
    }

    /// Exchange the refresh token for a new access token.
    pub async fn refresh(&self) -> Result<String> {
        let refresh_token = self
            .inner
            .store
            .credentials()?
            .and_then(|creds| creds.refresh_token);
        let Some(refresh_token) = refresh_token else {
            debug!("no refresh token stored");
            self.forget()?;
            return Err(ClientError::Unauthenticated);
        };

        let sent = self
            .inner
            .http
            .post(self.inner.config.endpoint("/refresh"))
            .header(
                reqwest::header::AUTHORIZATION,
                format!("Bearer {}", refresh_token),
            )
            .send()
            .await;

        let access_token = match sent {
            Ok(resp) if resp.status().is_success() => match resp.json::<RefreshResponse>().await {
                Ok(body) => body.access_token,
                Err(e) => {
                    warn!("unreadable refresh response: {}", e);
                    None
                }
            },
            Ok(resp) => {
                warn!("refresh rejected with {}", resp.status());
                None
            }
            Err(e) => {
                warn!("refresh request failed: {}", e);
                None
            }
        };

        match access_token {
            Some(token) => {
                self.inner.store.save_access_token(&token)?;
                self.inner.credential.set(Some(token.clone()));
                info!("access token refreshed");
                Ok(token)
            }
            None => {
                self.forget()?;
                Err(ClientError::Unauthenticated)
            }
        }
    }

    pub async fn get_json<T: DeserializeOwned>(&self, endpoint: &str) -> Result<T> {
        let url = self.inner.config.endpoint(endpoint);
        let resp = self.send_authed(|http| http.get(&url)).await?;
        Ok(check(resp).await?.json().await?)
    }

    pub async fn post_json<B, T>(&self, endpoint: &str, body: &B) -> Result<T>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let url = self.inner.config.endpoint(endpoint);
        let resp = self.send_authed(|http| http.post(&url).json(body)).await?;
        Ok(check(resp).await?.json().await?)
    }

    fn access_token(&self) -> Result<String> {
        self.inner
            .store
            .credentials()?
            .map(|creds| creds.access_token)
            .ok_or(ClientError::Unauthenticated)
    }

    fn forget(&self) -> Result<()> {
        self.inner.store.clear_credentials()?;
        self.inner.credential.set(None);
        Ok(())
    }

    async fn send_authed<F>(&self, build: F) -> Result<Response>
    where
        F: Fn(&reqwest::Client) -> RequestBuilder,
    {
        let token = self.access_token()?;
        let resp = build(&self.inner.http)
            .header(reqwest::header::AUTHORIZATION, format!("Bearer {}", token))
            .send()
            .await?;
        if resp.status() != StatusCode::UNAUTHORIZED {
            return Ok(resp);
        }

        debug!("access token rejected, refreshing once");
        let token = self.refresh().await?;
        let resp = build(&self.inner.http)
            .header(reqwest::header::AUTHORIZATION, format!("Bearer {}", token))
            .send()
            .await?;
        if resp.status() == StatusCode::UNAUTHORIZED {
            return Err(ClientError::Unauthenticated);
        }
        Ok(resp)
    }
}

impl MessageSource for ApiClient {
    async fn fetch_page(&self, with: UserId, page: u32) -> Result<MessagePage> {
        self.get_json(&format!("/messages/{}?page={}", with, page))
            .await
    }
}

impl ProgressRemote for ApiClient {
    async fn load_progress(&self, recipe_id: i64) -> Result<ProgressResponse> {
        self.get_json(&format!("/recipes/user/recipe-progress/{}", recipe_id))
            .await
    }

    async fn save_progress(&self, request: SaveProgressRequest) -> Result<ProgressResponse> {
        self.post_json("/recipes/user/recipe-progress", &request)
            .await
    }
}

/// Non-success statuses become [`ClientError::Status`], with the server's
/// `message`/`error` text when it sent one.
async fn check(resp: Response) -> Result<Response> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    let message = serde_json::from_str::<Ack>(&body)
        .ok()
        .and_then(|ack| ack.reason().map(str::to_string))
        .unwrap_or(body);
    Err(ClientError::Status {
        status: status.as_u16(),
        message,
    })
}

/// Read the user id out of an access token. The signature is the server's
/// business; the client only needs the subject.
pub fn user_id_from_token(token: &str) -> Result<UserId> {
    let mut validation = Validation::default();
    validation.insecure_disable_signature_validation();
    validation.validate_exp = false;
    validation.required_spec_claims.clear();

    let data = decode::<Claims>(token, &DecodingKey::from_secret(&[]), &validation)
        .map_err(|e| ClientError::Protocol(format!("unreadable access token: {}", e)))?;
    data.claims
        .sub
        .parse::<i64>()
        .map(UserId)
        .map_err(|_| ClientError::Protocol(format!("token subject '{}' is not a user id", data.claims.sub)))
}
