use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use secrecy::{ExposeSecret as _, SecretString};

use super::{Credential, CredentialProvider};
use crate::signal::{CredentialBus, CredentialChange};

/// Store key under which the access token lives.
pub const ACCESS_TOKEN_KEY: &str = "access_token";
/// Store key under which the refresh token lives.
pub const REFRESH_TOKEN_KEY: &str = "refresh_token";

/// Passive key/value storage for session tokens.
pub trait TokenStore: Send + Sync + 'static {
    fn get(&self, key: &str) -> Option<SecretString>;

    fn set(&self, key: &str, value: SecretString);

    fn remove(&self, key: &str);
}

impl<T: TokenStore + ?Sized> TokenStore for Arc<T> {
    fn get(&self, key: &str) -> Option<SecretString> {
        (**self).get(key)
    }

    fn set(&self, key: &str, value: SecretString) {
        (**self).set(key, value);
    }

    fn remove(&self, key: &str) {
        (**self).remove(key);
    }
}

/// In-memory [`TokenStore`].
///
/// When built with [`MemoryStore::with_bus`], every change to the access token is published on
/// the bus. Writes that leave the stored value unchanged publish nothing.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: DashMap<String, SecretString>,
    bus: Option<CredentialBus>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_bus(bus: CredentialBus) -> Self {
        Self {
            entries: DashMap::new(),
            bus: Some(bus),
        }
    }

    fn publish(&self, key: &str, change: CredentialChange) {
        if key != ACCESS_TOKEN_KEY {
            return;
        }
        if let Some(bus) = &self.bus {
            bus.notify(change);
        }
    }
}

impl TokenStore for MemoryStore {
    fn get(&self, key: &str) -> Option<SecretString> {
        self.entries.get(key).map(|entry| entry.value().clone())
    }

    fn set(&self, key: &str, value: SecretString) {
        let incoming = value.expose_secret().to_owned();
        let previous = self.entries.insert(key.to_owned(), value);

        if previous.is_none_or(|p| p.expose_secret() != incoming) {
            self.publish(key, CredentialChange::Rotated);
        }
    }

    fn remove(&self, key: &str) {
        if self.entries.remove(key).is_some() {
            self.publish(key, CredentialChange::Cleared);
        }
    }
}

/// Reads the access token straight from a [`TokenStore`] without ever refreshing it.
///
/// This is the fallback used when no refresh-capable session is available: a stored token is
/// handed out only while its `exp` claim lies in the future.
#[derive(Debug)]
pub struct PassiveProvider<S: TokenStore> {
    store: S,
}

impl<S: TokenStore> PassiveProvider<S> {
    #[must_use]
    pub fn new(store: S) -> Self {
        Self { store }
    }

    #[must_use]
    pub fn store(&self) -> &S {
        &self.store
    }
}

#[async_trait]
impl<S: TokenStore> CredentialProvider for PassiveProvider<S> {
    async fn credential(&self) -> Option<Credential> {
        let token = self.store.get(ACCESS_TOKEN_KEY)?;
        let credential = Credential::from_token(token.expose_secret());

        if credential.is_expired() {
            #[cfg(feature = "tracing")]
            tracing::debug!("Stored access token has expired");
            return None;
        }

        Some(credential)
    }

    async fn logout(&self) {
        #[cfg(feature = "tracing")]
        tracing::info!("Clearing stored session tokens");

        self.store.remove(ACCESS_TOKEN_KEY);
        self.store.remove(REFRESH_TOKEN_KEY);
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;
    use crate::auth::tests::jwt;

    #[tokio::test]
    async fn passive_returns_unexpired_token() {
        let store = MemoryStore::new();
        let token = jwt("operator", Utc::now().timestamp() + 60);
        store.set(ACCESS_TOKEN_KEY, SecretString::from(token.clone()));

        let provider = PassiveProvider::new(store);
        let credential = provider.credential().await.unwrap();

        assert_eq!(credential.token().expose_secret(), token);
    }

    #[tokio::test]
    async fn passive_rejects_expired_token() {
        let store = MemoryStore::new();
        store.set(
            ACCESS_TOKEN_KEY,
            SecretString::from(jwt("operator", Utc::now().timestamp() - 1)),
        );

        let provider = PassiveProvider::new(store);

        assert!(provider.credential().await.is_none());
    }

    #[tokio::test]
    async fn passive_without_token_is_none() {
        let provider = PassiveProvider::new(MemoryStore::new());

        assert!(provider.credential().await.is_none());
    }

    #[tokio::test]
    async fn logout_clears_both_tokens() {
        let store = Arc::new(MemoryStore::new());
        store.set(ACCESS_TOKEN_KEY, SecretString::from("a"));
        store.set(REFRESH_TOKEN_KEY, SecretString::from("r"));

        let provider = PassiveProvider::new(Arc::clone(&store));
        provider.logout().await;

        assert!(store.get(ACCESS_TOKEN_KEY).is_none());
        assert!(store.get(REFRESH_TOKEN_KEY).is_none());
    }

    #[tokio::test]
    async fn store_publishes_only_real_access_token_changes() {
        let bus = CredentialBus::new();
        let mut rx = bus.subscribe();
        let store = MemoryStore::with_bus(bus);

        store.set(ACCESS_TOKEN_KEY, SecretString::from("a"));
        store.set(ACCESS_TOKEN_KEY, SecretString::from("a"));
        store.set(REFRESH_TOKEN_KEY, SecretString::from("r"));
        store.remove(ACCESS_TOKEN_KEY);
        store.remove(ACCESS_TOKEN_KEY);

        assert_eq!(rx.recv().await.unwrap(), CredentialChange::Rotated);
        assert_eq!(rx.recv().await.unwrap(), CredentialChange::Cleared);
        assert!(rx.try_recv().is_err());
    }
}
