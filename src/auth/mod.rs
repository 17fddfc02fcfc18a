//! Credentials consumed by the real-time connection layer.
//!
//! The connection manager never owns the login flow. It only needs two capabilities from the
//! surrounding session, captured by [`CredentialProvider`]:
//!
//! - obtain a currently-valid bearer token, refreshing it first if necessary
//! - request that the session be logged out once the server has rejected the token
//!
//! Two providers ship with the crate: [`PassiveProvider`] reads whatever token sits in a
//! [`TokenStore`], and [`RefreshingProvider`] rotates tokens through a [`Refresher`] with
//! single-flight semantics.

pub mod refresh;
pub mod store;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::{DateTime, TimeDelta, Utc};
/// Secret string types that redact values in debug output for security.
pub use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;

pub use self::refresh::{HttpRefresher, Refresher, RefreshingProvider, TokenPair};
pub use self::store::{ACCESS_TOKEN_KEY, MemoryStore, PassiveProvider, REFRESH_TOKEN_KEY, TokenStore};
use crate::error::Error;
use crate::{Result, Timestamp};

/// A bearer token together with the expiry it claims.
///
/// The token itself is kept in a [`SecretString`] so that it never shows up in `Debug` output or
/// logs.
#[non_exhaustive]
#[derive(Clone, Debug)]
pub struct Credential {
    token: SecretString,
    expires_at: Option<DateTime<Utc>>,
}

#[derive(Deserialize)]
struct Claims {
    exp: Option<Timestamp>,
}

impl Credential {
    #[must_use]
    pub fn new(token: SecretString, expires_at: Option<DateTime<Utc>>) -> Self {
        Self { token, expires_at }
    }

    /// Builds a credential from a JWT, reading the `exp` claim from its payload.
    ///
    /// The signature is not verified; only the server can do that. A token without an `exp`
    /// claim is treated as non-expiring.
    pub fn from_jwt<T: Into<String>>(token: T) -> Result<Self> {
        let token = token.into();

        let mut segments = token.split('.');
        let (Some(_header), Some(payload), Some(_signature), None) = (
            segments.next(),
            segments.next(),
            segments.next(),
            segments.next(),
        ) else {
            return Err(Error::validation("token is not a three-segment JWT"));
        };

        let bytes = URL_SAFE_NO_PAD.decode(payload.trim_end_matches('='))?;
        let claims: Claims = serde_json::from_slice(&bytes)?;

        let expires_at = match claims.exp {
            Some(exp) => Some(
                DateTime::from_timestamp(exp, 0)
                    .ok_or(Error::validation(format!("exp claim {exp} is out of range")))?,
            ),
            None => None,
        };

        Ok(Self {
            token: SecretString::from(token),
            expires_at,
        })
    }

    /// Builds a credential from a stored token, falling back to an opaque, non-expiring
    /// credential when the token is not a decodable JWT.
    #[must_use]
    pub fn from_token<T: Into<String>>(token: T) -> Self {
        let token = token.into();
        match Self::from_jwt(token.clone()) {
            Ok(credential) => credential,
            Err(e) => {
                #[cfg(feature = "tracing")]
                tracing::debug!(error = %e, "Token has no readable expiry, treating it as opaque");
                #[cfg(not(feature = "tracing"))]
                let _ = &e;
                Self::new(SecretString::from(token), None)
            }
        }
    }

    #[must_use]
    pub fn token(&self) -> &SecretString {
        &self.token
    }

    #[must_use]
    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        self.expires_at
    }

    #[must_use]
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|exp| exp <= now)
    }

    #[must_use]
    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }

    /// Whether the credential is expired or will be within `skew` of `now`.
    #[must_use]
    pub fn expires_within(&self, skew: Duration, now: DateTime<Utc>) -> bool {
        let Some(exp) = self.expires_at else {
            return false;
        };

        match TimeDelta::from_std(skew)
            .ok()
            .and_then(|skew| now.checked_add_signed(skew))
        {
            Some(deadline) => exp <= deadline,
            None => true,
        }
    }
}

/// Source of bearer tokens for the connection manager.
///
/// Implementations are expected to do whatever is needed to hand back a token that is valid right
/// now, including refreshing it over the network, and to return `None` when that is impossible.
#[async_trait]
pub trait CredentialProvider: Send + Sync + 'static {
    /// Returns a currently-valid credential, or `None` if none can be obtained.
    async fn credential(&self) -> Option<Credential>;

    /// Requests that the owning session be logged out. Best effort; never fails.
    async fn logout(&self);
}

#[async_trait]
impl<T: CredentialProvider + ?Sized> CredentialProvider for Arc<T> {
    async fn credential(&self) -> Option<Credential> {
        (**self).credential().await
    }

    async fn logout(&self) {
        (**self).logout().await;
    }
}
