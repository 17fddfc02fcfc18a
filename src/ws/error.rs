#![expect(
    clippy::module_name_repetitions,
    reason = "Error types include the module name to indicate their scope"
)]

use std::error::Error as StdError;
use std::fmt;

/// Classification of connection failures.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum_macros::Display)]
pub enum ErrorKind {
    /// No usable credential was available when dialing
    AuthenticationRequired,
    /// The server rejected the credential after the socket was opened
    AuthenticationExpired,
    /// The socket did not open within the connect timeout
    ConnectTimeout,
    /// Abrupt close, dial failure, liveness timeout or any other close code
    TransientNetwork,
    /// The bounded retry budget was exhausted
    TooManyAttempts,
    /// A message could not be serialised or written; it was queued again
    SendFailed,
}

impl ErrorKind {
    /// Whether the manager recovers from this failure on its own.
    #[must_use]
    pub const fn is_retryable(self) -> bool {
        matches!(
            self,
            Self::ConnectTimeout | Self::TransientNetwork | Self::SendFailed
        )
    }

    /// Whether this failure is escalated to the session as a logout.
    #[must_use]
    pub const fn requires_logout(self) -> bool {
        matches!(
            self,
            Self::AuthenticationRequired | Self::AuthenticationExpired
        )
    }
}

/// The last failure observed by a connection manager.
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WsError {
    pub kind: ErrorKind,
    pub message: String,
    /// Close code reported by the server, when the failure came from a close frame
    pub close_code: Option<u16>,
}

impl WsError {
    pub fn new<S: Into<String>>(kind: ErrorKind, message: S) -> Self {
        Self {
            kind,
            message: message.into(),
            close_code: None,
        }
    }

    #[must_use]
    pub fn with_close_code(mut self, code: u16) -> Self {
        self.close_code = Some(code);
        self
    }

    pub(crate) fn authentication_required() -> Self {
        Self::new(ErrorKind::AuthenticationRequired, "authentication required")
    }

    pub(crate) fn authentication_expired(code: u16, reason: &str) -> Self {
        let message = if reason.is_empty() {
            "authentication expired".to_owned()
        } else {
            format!("authentication expired: {reason}")
        };
        Self::new(ErrorKind::AuthenticationExpired, message).with_close_code(code)
    }

    pub(crate) fn too_many_attempts(attempts: u32) -> Self {
        Self::new(
            ErrorKind::TooManyAttempts,
            format!("gave up after {attempts} connection attempts"),
        )
    }
}

impl fmt::Display for WsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.close_code {
            Some(code) => write!(f, "{}: {} (close code {code})", self.kind, self.message),
            None => write!(f, "{}: {}", self.kind, self.message),
        }
    }
}

impl StdError for WsError {}

// Integration with main Error type
impl From<WsError> for crate::error::Error {
    fn from(e: WsError) -> Self {
        crate::error::Error::with_source(crate::error::Kind::WebSocket, e)
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for crate::error::Error {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        crate::error::Error::with_source(crate::error::Kind::WebSocket, e)
    }
}
