//! Streams production dashboard updates and prints them as they arrive.
//!
//! This demo shows how to:
//! 1. Derive the socket endpoint from the page origin
//! 2. Authenticate with a stored token and follow credential changes
//! 3. Observe connection status while messages stream in
//!
//! Run with tracing enabled:
//! ```sh
//! SHOPFLOOR_ORIGIN=https://floor.example.com SHOPFLOOR_TOKEN=eyJ... \
//!     RUST_LOG=info,shopfloor_realtime=debug cargo run --example dashboard --features tracing
//! ```
//!
//! Optionally log to a file:
//! ```sh
//! LOG_FILE=dashboard.log RUST_LOG=info cargo run --example dashboard --features tracing
//! ```

use std::fs::File;
use std::sync::Arc;

use secrecy::SecretString;
use serde_json::{Value, json};
use shopfloor_realtime::auth::{ACCESS_TOKEN_KEY, MemoryStore, PassiveProvider, TokenStore as _};
use shopfloor_realtime::signal::CredentialBus;
use shopfloor_realtime::ws::{ConnectionManager, DASHBOARD_PATH, Endpoint};
use shopfloor_realtime::{ORIGIN_VAR, TOKEN_VAR};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt as _;
use tracing_subscriber::util::SubscriberInitExt as _;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if let Ok(path) = std::env::var("LOG_FILE") {
        let file = File::create(path)?;
        tracing_subscriber::registry()
            .with(EnvFilter::from_default_env())
            .with(
                tracing_subscriber::fmt::layer()
                    .with_writer(file)
                    .with_ansi(false),
            )
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .init();
    }

    let origin = std::env::var(ORIGIN_VAR).unwrap_or_else(|_| "http://localhost:8000".to_owned());
    let bus = CredentialBus::new();
    let store = Arc::new(MemoryStore::with_bus(bus.clone()));
    match std::env::var(TOKEN_VAR) {
        Ok(token) => store.set(ACCESS_TOKEN_KEY, SecretString::from(token)),
        Err(_) => warn!("{TOKEN_VAR} is not set, the connection will fail to authenticate"),
    }

    let endpoint = Endpoint::from_origin(&origin, DASHBOARD_PATH)?;
    info!(endpoint = %endpoint.url(), "connecting to dashboard stream");

    let manager = ConnectionManager::builder(
        endpoint,
        PassiveProvider::new(Arc::clone(&store)),
        |msg: Value| match msg.get("type").and_then(Value::as_str) {
            Some(kind) => info!(%kind, payload = %msg, "dashboard update"),
            None => info!(payload = %msg, "message"),
        },
    )
    .on_error(|e| error!(kind = %e.kind, message = %e.message, "connection error"))
    .credential_changes(&bus)
    .build()?;

    manager.start();
    manager.send(json!({"type": "get_statistics"})).await;

    let mut status = manager.status_receiver();
    loop {
        tokio::select! {
            changed = status.changed() => {
                if changed.is_err() {
                    break;
                }
                let current = status.borrow_and_update().clone();
                info!(
                    state = %current.state,
                    attempt = current.attempt,
                    queued = current.queued,
                    reconnect_in = ?current.reconnect_delay,
                    "status"
                );
            }
            _ = tokio::signal::ctrl_c() => {
                info!("shutting down");
                manager.stop();
                break;
            }
        }
    }

    Ok(())
}
