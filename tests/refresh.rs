#![allow(
    clippy::unwrap_used,
    clippy::missing_panics_doc,
    reason = "Do not need additional syntax for setting up tests"
)]

mod common;

use std::sync::Arc;

use chrono::Utc;
use httpmock::Method::POST;
use httpmock::MockServer;
use reqwest::StatusCode;
use secrecy::SecretString;
use serde_json::json;
use shopfloor_realtime::auth::{
    ACCESS_TOKEN_KEY, CredentialProvider as _, ExposeSecret as _, HttpRefresher, MemoryStore,
    REFRESH_TOKEN_KEY, Refresher as _, RefreshingProvider, TokenStore as _,
};
use shopfloor_realtime::error::{Kind, Status};
use shopfloor_realtime::signal::{CredentialBus, CredentialChange};

use crate::common::jwt;

fn session(access: &str, refresh: &str, bus: Option<CredentialBus>) -> Arc<MemoryStore> {
    let store = Arc::new(bus.map_or_else(MemoryStore::new, MemoryStore::with_bus));
    store.set(ACCESS_TOKEN_KEY, SecretString::from(access.to_owned()));
    store.set(REFRESH_TOKEN_KEY, SecretString::from(refresh.to_owned()));
    store
}

#[tokio::test]
async fn refresh_should_rotate_both_tokens() -> anyhow::Result<()> {
    let server = MockServer::start();
    let expired = jwt("operator", Utc::now().timestamp() - 60);
    let renewed = jwt("operator", Utc::now().timestamp() + 3600);

    let mock = server.mock(|when, then| {
        when.method(POST)
            .path("/auth/refresh")
            .json_body(json!({"refresh_token": "R1"}));
        then.status(StatusCode::OK).json_body(json!({
            "access_token": renewed,
            "refresh_token": "R2",
            "token_type": "bearer",
            "expires_in": 3600
        }));
    });

    let store = session(&expired, "R1", None);
    let provider = RefreshingProvider::new(
        Arc::clone(&store),
        HttpRefresher::new(&server.base_url())?,
    );

    let credential = provider.credential().await.unwrap();

    mock.assert();
    assert_eq!(credential.token().expose_secret(), renewed);
    assert!(!credential.is_expired());
    assert_eq!(
        store.get(ACCESS_TOKEN_KEY).unwrap().expose_secret(),
        renewed
    );
    assert_eq!(store.get(REFRESH_TOKEN_KEY).unwrap().expose_secret(), "R2");

    Ok(())
}

#[tokio::test]
async fn fresh_token_should_skip_refresh() -> anyhow::Result<()> {
    let server = MockServer::start();
    let fresh = jwt("operator", Utc::now().timestamp() + 3600);

    let mock = server.mock(|when, then| {
        when.method(POST).path("/auth/refresh");
        then.status(StatusCode::OK);
    });

    let provider = RefreshingProvider::new(
        session(&fresh, "R1", None),
        HttpRefresher::new(&server.base_url())?,
    );

    let credential = provider.credential().await.unwrap();

    mock.assert_calls(0);
    assert_eq!(credential.token().expose_secret(), fresh);

    Ok(())
}

#[tokio::test]
async fn rejected_refresh_should_yield_no_credential() -> anyhow::Result<()> {
    let server = MockServer::start();
    let expired = jwt("operator", Utc::now().timestamp() - 60);

    let mock = server.mock(|when, then| {
        when.method(POST).path("/auth/refresh");
        then.status(StatusCode::UNAUTHORIZED)
            .json_body(json!({"detail": "Invalid refresh token"}));
    });

    let provider = RefreshingProvider::new(
        session(&expired, "R1", None),
        HttpRefresher::new(&server.base_url())?,
    );

    assert!(provider.credential().await.is_none());
    mock.assert();

    Ok(())
}

#[tokio::test]
async fn non_success_status_should_surface_as_status_error() -> anyhow::Result<()> {
    let server = MockServer::start();

    server.mock(|when, then| {
        when.method(POST).path("/api/auth/refresh");
        then.status(StatusCode::UNAUTHORIZED)
            .body("Invalid refresh token");
    });

    let refresher = HttpRefresher::new(&format!("{}/api", server.base_url()))?;
    let err = refresher
        .refresh(&SecretString::from("R1".to_owned()))
        .await
        .unwrap_err();

    assert_eq!(err.kind(), Kind::Status);
    let status = err.downcast_ref::<Status>().unwrap();
    assert_eq!(status.status_code, StatusCode::UNAUTHORIZED);
    assert_eq!(status.path, "auth/refresh");
    assert_eq!(status.message, "Invalid refresh token");

    Ok(())
}

#[tokio::test]
async fn logout_should_revoke_and_clear_session() -> anyhow::Result<()> {
    let server = MockServer::start();
    let access = jwt("operator", Utc::now().timestamp() + 3600);

    let mock = server.mock(|when, then| {
        when.method(POST)
            .path("/auth/logout")
            .header("authorization", format!("Bearer {access}"));
        then.status(StatusCode::OK)
            .json_body(json!({"message": "Logged out"}));
    });

    let store = session(&access, "R1", None);
    let provider = RefreshingProvider::new(
        Arc::clone(&store),
        HttpRefresher::new(&server.base_url())?,
    );

    provider.logout().await;

    mock.assert();
    assert!(store.get(ACCESS_TOKEN_KEY).is_none());
    assert!(store.get(REFRESH_TOKEN_KEY).is_none());

    Ok(())
}

#[tokio::test]
async fn refresh_should_announce_rotation_on_bus() -> anyhow::Result<()> {
    let server = MockServer::start();
    let expired = jwt("operator", Utc::now().timestamp() - 60);
    let renewed = jwt("operator", Utc::now().timestamp() + 3600);

    server.mock(|when, then| {
        when.method(POST).path("/auth/refresh");
        then.status(StatusCode::OK).json_body(json!({
            "access_token": renewed,
            "refresh_token": "R2"
        }));
    });

    let bus = CredentialBus::new();
    let store = session(&expired, "R1", Some(bus.clone()));
    let mut changes = bus.subscribe();
    let provider = RefreshingProvider::new(store, HttpRefresher::new(&server.base_url())?);

    provider.credential().await.unwrap();

    assert_eq!(changes.recv().await?, CredentialChange::Rotated);
    assert!(changes.try_recv().is_err());

    Ok(())
}
