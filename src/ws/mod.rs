//! Resilient WebSocket connections to the shop-floor backend.
//!
//! A [`ConnectionManager`] keeps one authenticated socket open for as long as its owner wants
//! it, and hides the unreliable parts of the network behind a small status model.
//!
//! # Architecture
//!
//! - [`ConnectionManager`]: cloneable handle to a background task owning the socket
//! - [`Config`]: heartbeat, timeout and backoff policy
//! - [`Endpoint`]: where to connect; the credential travels as a `token` query parameter
//! - [`MessageParser`]: turns inbound text frames into typed messages
//! - [`Connector`]: opens sockets; [`TungsteniteConnector`] in production
//!
//! Credentials come from any [`CredentialProvider`](crate::auth::CredentialProvider); a
//! [`CredentialBus`](crate::signal::CredentialBus) lets the manager follow logins and logouts.
//!
//! # Example
//!
//! ```ignore
//! let manager = ConnectionManager::builder(endpoint, provider, |msg: serde_json::Value| {
//!     println!("{msg}");
//! })
//! .credential_changes(&bus)
//! .build()?;
//!
//! manager.start();
//! ```

pub mod config;
pub mod connection;
pub mod endpoint;
pub mod error;
pub mod queue;
pub mod state;
pub mod traits;
pub mod transport;

pub use config::{Config, ReconnectConfig};
pub use connection::{Builder, ConnectionManager, SendOutcome};
pub use endpoint::{DASHBOARD_PATH, Endpoint, PCBA_PATH};
#[expect(
    clippy::module_name_repetitions,
    reason = "WsError includes module name for clarity when used outside this module"
)]
pub use error::WsError;
pub use error::ErrorKind;
pub use queue::Outbound;
pub use state::{ConnectionState, ConnectionStatus};
pub use traits::{JsonParser, MessageParser};
pub use transport::{Connector, TungsteniteConnector};
