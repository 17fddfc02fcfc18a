use std::time::Duration;

use async_trait::async_trait;
use bon::Builder;
use chrono::{TimeDelta, Utc};
use reqwest::{Method, RequestBuilder};
use secrecy::{ExposeSecret as _, SecretString};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use url::Url;

use super::store::{ACCESS_TOKEN_KEY, REFRESH_TOKEN_KEY, TokenStore};
use super::{Credential, CredentialProvider};
use crate::Result;
use crate::error::Error;

/// Access tokens expiring sooner than this are refreshed before use.
const DEFAULT_REFRESH_SKEW: Duration = Duration::from_secs(30);

/// A freshly issued access token and its (rotated) refresh token.
#[non_exhaustive]
#[derive(Clone, Debug)]
pub struct TokenPair {
    pub access: Credential,
    pub refresh: SecretString,
}

impl TokenPair {
    #[must_use]
    pub fn new(access: Credential, refresh: SecretString) -> Self {
        Self { access, refresh }
    }
}

/// Exchanges a refresh token for a new [`TokenPair`].
#[async_trait]
pub trait Refresher: Send + Sync + 'static {
    async fn refresh(&self, refresh_token: &SecretString) -> Result<TokenPair>;

    /// Invalidates the session server-side. The default does nothing.
    async fn logout(&self, _access_token: &SecretString) -> Result<()> {
        Ok(())
    }
}

#[derive(Serialize)]
struct RefreshRequest<'token> {
    refresh_token: &'token str,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    refresh_token: String,
    #[serde(default)]
    expires_in: Option<i64>,
}

impl From<TokenResponse> for TokenPair {
    fn from(response: TokenResponse) -> Self {
        let mut access = Credential::from_token(response.access_token);
        if access.expires_at.is_none()
            && let Some(seconds) = response.expires_in
        {
            access.expires_at = Utc::now().checked_add_signed(TimeDelta::seconds(seconds));
        }

        TokenPair {
            access,
            refresh: SecretString::from(response.refresh_token),
        }
    }
}

/// [`Refresher`] backed by the session REST API.
///
/// Calls `POST {base}/auth/refresh` with `{"refresh_token": ..}` and expects
/// `{"access_token", "refresh_token", "expires_in"}` back. Logout is `POST {base}/auth/logout`
/// with the access token as bearer.
#[derive(Clone, Debug, Builder)]
pub struct HttpRefresher {
    /// Base URL of the auth API, e.g. `https://floor.example.com/api`.
    base: Url,
    #[builder(default)]
    client: reqwest::Client,
    #[builder(into, default = String::from("auth/refresh"))]
    refresh_path: String,
    #[builder(into, default = String::from("auth/logout"))]
    logout_path: String,
}

impl HttpRefresher {
    /// Creates a refresher for the API rooted at `base` with the default paths.
    pub fn new(base: &str) -> Result<Self> {
        Ok(Self::builder().base(Url::parse(base)?).build())
    }

    fn url(&self, path: &str) -> Result<Url> {
        let joined = format!(
            "{}/{}",
            self.base.as_str().trim_end_matches('/'),
            path.trim_start_matches('/')
        );
        Ok(Url::parse(&joined)?)
    }

    #[cfg_attr(
        feature = "tracing",
        tracing::instrument(level = "debug", skip_all, fields(path = %path, status_code))
    )]
    async fn execute(&self, request: RequestBuilder, path: &str) -> Result<reqwest::Response> {
        let response = request.send().await?;
        let status_code = response.status();

        #[cfg(feature = "tracing")]
        tracing::Span::current().record("status_code", status_code.as_u16());

        if !status_code.is_success() {
            let message = response.text().await.unwrap_or_default();

            #[cfg(feature = "tracing")]
            tracing::warn!(status = %status_code, path = %path, message = %message, "Auth request failed");

            return Err(Error::status(
                status_code,
                Method::POST,
                path.to_owned(),
                message,
            ));
        }

        Ok(response)
    }
}

#[async_trait]
impl Refresher for HttpRefresher {
    async fn refresh(&self, refresh_token: &SecretString) -> Result<TokenPair> {
        let url = self.url(&self.refresh_path)?;
        let request = self.client.post(url).json(&RefreshRequest {
            refresh_token: refresh_token.expose_secret(),
        });

        let response = self.execute(request, &self.refresh_path).await?;
        let body: TokenResponse = response.json().await?;

        Ok(body.into())
    }

    async fn logout(&self, access_token: &SecretString) -> Result<()> {
        let url = self.url(&self.logout_path)?;
        let request = self
            .client
            .post(url)
            .bearer_auth(access_token.expose_secret());

        self.execute(request, &self.logout_path).await?;
        Ok(())
    }
}

/// [`CredentialProvider`] that keeps the stored access token fresh.
///
/// Refreshes are single-flight: concurrent callers that all find the token stale queue on one
/// async mutex, the first performs the refresh, and the rest pick up the rotated token from the
/// store instead of spending the (single-use) refresh token again.
#[derive(Debug)]
pub struct RefreshingProvider<S: TokenStore, R: Refresher> {
    store: S,
    refresher: R,
    refresh_skew: Duration,
    refresh_lock: Mutex<()>,
}

impl<S: TokenStore, R: Refresher> RefreshingProvider<S, R> {
    #[must_use]
    pub fn new(store: S, refresher: R) -> Self {
        Self {
            store,
            refresher,
            refresh_skew: DEFAULT_REFRESH_SKEW,
            refresh_lock: Mutex::new(()),
        }
    }

    /// Refresh tokens that expire within `skew` instead of handing them out.
    #[must_use]
    pub fn with_refresh_skew(mut self, skew: Duration) -> Self {
        self.refresh_skew = skew;
        self
    }

    #[must_use]
    pub fn store(&self) -> &S {
        &self.store
    }

    fn stored(&self) -> Option<Credential> {
        self.store
            .get(ACCESS_TOKEN_KEY)
            .map(|token| Credential::from_token(token.expose_secret()))
    }

    fn fresh_stored(&self) -> Option<Credential> {
        self.stored()
            .filter(|credential| !credential.expires_within(self.refresh_skew, Utc::now()))
    }
}

#[async_trait]
impl<S: TokenStore, R: Refresher> CredentialProvider for RefreshingProvider<S, R> {
    async fn credential(&self) -> Option<Credential> {
        if let Some(credential) = self.fresh_stored() {
            return Some(credential);
        }

        let _guard = self.refresh_lock.lock().await;

        // Another caller may have finished a refresh while we waited on the lock
        if let Some(credential) = self.fresh_stored() {
            return Some(credential);
        }

        let Some(refresh_token) = self.store.get(REFRESH_TOKEN_KEY) else {
            #[cfg(feature = "tracing")]
            tracing::debug!("No refresh token stored, cannot refresh");
            return self.stored().filter(|credential| !credential.is_expired());
        };

        match self.refresher.refresh(&refresh_token).await {
            Ok(pair) => {
                #[cfg(feature = "tracing")]
                tracing::debug!(expires_at = ?pair.access.expires_at(), "Refreshed access token");

                self.store.set(REFRESH_TOKEN_KEY, pair.refresh);
                self.store.set(ACCESS_TOKEN_KEY, pair.access.token().clone());
                Some(pair.access)
            }
            Err(e) => {
                #[cfg(feature = "tracing")]
                tracing::warn!(error = %e, "Token refresh failed");
                #[cfg(not(feature = "tracing"))]
                let _ = &e;

                self.stored().filter(|credential| !credential.is_expired())
            }
        }
    }

    async fn logout(&self) {
        if let Some(access) = self.store.get(ACCESS_TOKEN_KEY)
            && let Err(e) = self.refresher.logout(&access).await
        {
            #[cfg(feature = "tracing")]
            tracing::warn!(error = %e, "Server-side logout failed, clearing local session anyway");
            #[cfg(not(feature = "tracing"))]
            let _ = &e;
        }

        self.store.remove(ACCESS_TOKEN_KEY);
        self.store.remove(REFRESH_TOKEN_KEY);
    }
}
