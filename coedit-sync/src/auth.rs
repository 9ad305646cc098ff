//! Explicit authentication state handed to the sync core.
//!
//! An [`AuthSession`] holds the signed-in identity and the current bearer
//! token. It is passed to the storage client at construction; nothing reads
//! credentials from ambient state. Expired tokens are refreshed before use
//! when a [`TokenRefresher`] is attached.

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use parking_lot::RwLock;
use serde::Deserialize;

use crate::protocol::deserialize_id;

/// Lifetime the token endpoint grants when it does not say otherwise.
pub const DEFAULT_TOKEN_LIFETIME: Duration = Duration::from_secs(30 * 60);

/// The signed-in user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserIdentity {
    pub id: String,
    pub username: String,
}

impl UserIdentity {
    pub fn new(id: impl Into<String>, username: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            username: username.into(),
        }
    }
}

#[derive(Clone, PartialEq, Eq)]
pub struct AccessToken {
    pub value: String,
    /// `None` = never expires.
    pub expires_at: Option<SystemTime>,
}

impl AccessToken {
    pub fn new(value: impl Into<String>, lifetime: Option<Duration>) -> Self {
        Self {
            value: value.into(),
            expires_at: lifetime.map(|l| SystemTime::now() + l),
        }
    }

    pub fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|at| at <= SystemTime::now())
    }
}

impl std::fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccessToken")
            .field("value", &"<redacted>")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Source of fresh tokens.
#[async_trait::async_trait]
pub trait TokenRefresher: Send + Sync {
    async fn fetch_token(&self) -> Result<(AccessToken, UserIdentity), AuthError>;
}

/// Identity plus a refreshable bearer token.
pub struct AuthSession {
    user: UserIdentity,
    token: RwLock<AccessToken>,
    refresher: Option<Arc<dyn TokenRefresher>>,
    /// Serializes refreshes so concurrent callers share one token request.
    refresh_lock: tokio::sync::Mutex<()>,
}

impl AuthSession {
    pub fn new(user: UserIdentity, token: AccessToken) -> Self {
        Self {
            user,
            token: RwLock::new(token),
            refresher: None,
            refresh_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn with_refresher(mut self, refresher: Arc<dyn TokenRefresher>) -> Self {
        self.refresher = Some(refresher);
        self
    }

    /// Sign in through `refresher` and keep it for later refreshes.
    pub async fn login(refresher: Arc<dyn TokenRefresher>) -> Result<Self, AuthError> {
        let (token, user) = refresher.fetch_token().await?;
        log::info!("Signed in as {} ({})", user.username, user.id);
        Ok(Self::new(user, token).with_refresher(refresher))
    }

    pub fn user(&self) -> &UserIdentity {
        &self.user
    }

    pub fn can_refresh(&self) -> bool {
        self.refresher.is_some()
    }

    /// A usable bearer token, refreshing first if the current one expired.
    pub async fn bearer(&self) -> Result<String, AuthError> {
        let current = self.token.read().clone();
        if !current.is_expired() {
            return Ok(current.value);
        }
        self.refresh(&current.value).await
    }

    /// Replace `stale` with a fresh token. If another caller already
    /// replaced it, that token is returned instead of requesting a new one.
    pub async fn refresh(&self, stale: &str) -> Result<String, AuthError> {
        let refresher = self.refresher.as_ref().ok_or(AuthError::Expired)?;
        let _guard = self.refresh_lock.lock().await;
        {
            let current = self.token.read();
            if current.value != stale && !current.is_expired() {
                return Ok(current.value.clone());
            }
        }

        let (token, _) = refresher.fetch_token().await?;
        log::debug!("Refreshed access token for {}", self.user.username);
        let value = token.value.clone();
        *self.token.write() = token;
        Ok(value)
    }

    /// Mark the current token unusable so the next `bearer` refreshes.
    pub fn invalidate(&self) {
        self.token.write().expires_at = Some(SystemTime::UNIX_EPOCH);
    }
}

impl std::fmt::Debug for AuthSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthSession")
            .field("user", &self.user)
            .field("token", &*self.token.read())
            .field("can_refresh", &self.can_refresh())
            .finish()
    }
}

// ───────────────────────────────────────────────────────────────────
// Password grant
// ───────────────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    token_type: Option<String>,
    #[serde(deserialize_with = "deserialize_id")]
    user_id: String,
    #[serde(default)]
    username: Option<String>,
}

/// `POST {api_url}/token` with form-encoded username and password.
pub struct PasswordGrant {
    client: reqwest::Client,
    api_url: String,
    username: String,
    password: String,
    lifetime: Duration,
}

impl PasswordGrant {
    pub fn new(
        client: reqwest::Client,
        api_url: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            client,
            api_url: api_url.into(),
            username: username.into(),
            password: password.into(),
            lifetime: DEFAULT_TOKEN_LIFETIME,
        }
    }

    /// Grant with its own client and a per-request timeout.
    pub fn with_timeout(
        api_url: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, AuthError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| AuthError::Network(e.to_string()))?;
        Ok(Self::new(client, api_url, username, password))
    }

    pub fn with_lifetime(mut self, lifetime: Duration) -> Self {
        self.lifetime = lifetime;
        self
    }
}

#[async_trait::async_trait]
impl TokenRefresher for PasswordGrant {
    async fn fetch_token(&self) -> Result<(AccessToken, UserIdentity), AuthError> {
        let url = format!("{}/token", self.api_url.trim_end_matches('/'));
        let response = self
            .client
            .post(&url)
            .form(&[("username", &self.username), ("password", &self.password)])
            .send()
            .await
            .map_err(|e| AuthError::Network(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            log::warn!("Token request for {} failed: {status} {body}", self.username);
            return Err(AuthError::Rejected(format!("{status}")));
        }

        let body: TokenResponse = response
            .json()
            .await
            .map_err(|e| AuthError::Decode(e.to_string()))?;
        if let Some(kind) = &body.token_type {
            if !kind.eq_ignore_ascii_case("bearer") {
                return Err(AuthError::Decode(format!("unsupported token type {kind}")));
            }
        }

        let user = UserIdentity::new(
            body.user_id,
            body.username.unwrap_or_else(|| self.username.clone()),
        );
        Ok((AccessToken::new(body.access_token, Some(self.lifetime)), user))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuthError {
    #[error("access token expired and cannot be refreshed")]
    Expired,
    #[error("credentials rejected: {0}")]
    Rejected(String),
    #[error("token request failed: {0}")]
    Network(String),
    #[error("unexpected token response: {0}")]
    Decode(String),
}
