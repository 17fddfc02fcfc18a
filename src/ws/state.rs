use std::time::Duration;

use super::config::Config;
use super::error::WsError;

/// Normal closure; the peer is done and no reconnect is wanted.
const NORMAL_CLOSE_CODE: u16 = 1000;

/// Lifecycle of the managed connection.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, strum_macros::Display)]
pub enum ConnectionState {
    /// Not connected; either never started or closed on request
    #[default]
    Disconnected,
    /// Obtaining a credential or waiting for the socket to open
    Connecting,
    /// Socket open
    Connected,
    /// The last attempt failed; see the status' `last_error`
    Error,
    /// Retry budget exhausted. Only a manual reconnect leaves this state.
    Failed,
}

impl ConnectionState {
    #[must_use]
    pub const fn is_connected(self) -> bool {
        matches!(self, Self::Connected)
    }

    #[must_use]
    pub const fn is_connecting(self) -> bool {
        matches!(self, Self::Connecting)
    }
}

/// Snapshot of a manager, published on every transition.
#[non_exhaustive]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectionStatus {
    pub state: ConnectionState,
    /// Consecutive connection attempts since the last successful open
    pub attempt: u32,
    pub last_error: Option<WsError>,
    /// Delay of the pending reconnect timer, if one is armed
    pub reconnect_delay: Option<Duration>,
    /// Messages waiting in the outbound queue
    pub queued: usize,
    /// Whether the owner has started (and not stopped) the manager
    pub active: bool,
}

impl ConnectionStatus {
    #[must_use]
    pub const fn is_connected(&self) -> bool {
        self.state.is_connected()
    }

    #[must_use]
    pub const fn is_connecting(&self) -> bool {
        self.state.is_connecting()
    }
}

/// How a close code is handled.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseClass {
    /// Orderly close; stay disconnected
    Normal,
    /// The server rejected the credential; escalate to logout, never retry
    AuthRejected,
    /// Anything else; retry with backoff
    Transient,
}

#[must_use]
pub fn classify_close(code: u16, config: &Config) -> CloseClass {
    if code == NORMAL_CLOSE_CODE {
        CloseClass::Normal
    } else if config.auth_close_codes.contains(&code) {
        CloseClass::AuthRejected
    } else {
        CloseClass::Transient
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_close_codes() {
        let config = Config::default();

        assert_eq!(classify_close(1000, &config), CloseClass::Normal);
        assert_eq!(classify_close(4003, &config), CloseClass::AuthRejected);
        assert_eq!(classify_close(1008, &config), CloseClass::AuthRejected);
        assert_eq!(classify_close(1006, &config), CloseClass::Transient);
        assert_eq!(classify_close(1001, &config), CloseClass::Transient);
        assert_eq!(classify_close(1011, &config), CloseClass::Transient);
    }

    #[test]
    fn default_status_is_disconnected_and_idle() {
        let status = ConnectionStatus::default();

        assert_eq!(status.state, ConnectionState::Disconnected);
        assert!(!status.is_connected());
        assert!(!status.active);
        assert!(status.reconnect_delay.is_none());
    }
}
