//! Cross-instance credential change notifications.
//!
//! Several connection managers (or several processes bridged onto one bus) may share a single
//! session. When one of them rotates or clears the session's tokens, the others must pick the new
//! credential up. [`CredentialBus`] is the broadcast channel they meet on; it knows nothing about
//! where tokens are stored.

use tokio::sync::broadcast;

/// Capacity of the broadcast channel. Lagging receivers treat a lag as "something changed".
const BUS_CAPACITY: usize = 64;

/// What happened to the shared credential.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum_macros::Display)]
#[strum(serialize_all = "snake_case")]
pub enum CredentialChange {
    /// A new access token was stored, e.g. after a refresh or a fresh login.
    Rotated,
    /// The tokens were removed, e.g. on logout.
    Cleared,
}

/// Publish/subscribe hub for [`CredentialChange`] events.
#[derive(Clone, Debug)]
pub struct CredentialBus {
    sender: broadcast::Sender<CredentialChange>,
}

impl Default for CredentialBus {
    fn default() -> Self {
        Self::new()
    }
}

impl CredentialBus {
    #[must_use]
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(BUS_CAPACITY);
        Self { sender }
    }

    /// Notify every subscriber. Returns the number of subscribers that will see the event.
    pub fn notify(&self, change: CredentialChange) -> usize {
        #[cfg(feature = "tracing")]
        tracing::debug!(%change, "Publishing credential change");

        self.sender.send(change).unwrap_or(0)
    }

    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<CredentialChange> {
        self.sender.subscribe()
    }
}
