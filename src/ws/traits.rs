//! Framing strategy for inbound frames.

use std::marker::PhantomData;

use serde::de::DeserializeOwned;

/// Text frames the server uses for liveness. They never reach the message handler.
pub const HEARTBEAT_FRAMES: [&str; 2] = ["pong", "heartbeat"];

/// Message parser trait for converting raw bytes to messages.
///
/// The manager strips heartbeat frames before calling the parser, so implementations only see
/// application payloads.
///
/// # Example
///
/// ```ignore
/// pub struct BoardParser;
///
/// impl MessageParser<BoardEvent> for BoardParser {
///     fn parse(&self, bytes: &[u8]) -> crate::Result<Vec<BoardEvent>> {
///         let msg: BoardEvent = serde_json::from_slice(bytes)?;
///         Ok(vec![msg])
///     }
/// }
/// ```
pub trait MessageParser<M>: Send + Sync + 'static {
    /// Parse incoming bytes into messages.
    ///
    /// May return an empty vec if the frame carries nothing of interest.
    fn parse(&self, bytes: &[u8]) -> crate::Result<Vec<M>>;
}

/// Decodes each text frame as one JSON value of type `M`.
pub struct JsonParser<M = serde_json::Value> {
    _message: PhantomData<fn() -> M>,
}

impl<M> JsonParser<M> {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            _message: PhantomData,
        }
    }
}

impl<M> Default for JsonParser<M> {
    fn default() -> Self {
        Self::new()
    }
}

impl<M> Clone for JsonParser<M> {
    fn clone(&self) -> Self {
        Self::new()
    }
}

impl<M> std::fmt::Debug for JsonParser<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JsonParser").finish()
    }
}

impl<M: DeserializeOwned + 'static> MessageParser<M> for JsonParser<M> {
    fn parse(&self, bytes: &[u8]) -> crate::Result<Vec<M>> {
        Ok(vec![serde_json::from_slice(bytes)?])
    }
}

#[must_use]
pub fn is_heartbeat(text: &str) -> bool {
    HEARTBEAT_FRAMES.contains(&text)
}

/// Turns one inbound text frame into messages for the handler.
///
/// Heartbeat tokens and frames the parser cannot decode both yield nothing; the heartbeat
/// protocol is out-of-band and malformed frames are not surfaced as errors.
pub fn decode_text<M, P: MessageParser<M>>(parser: &P, text: &str) -> Vec<M> {
    if is_heartbeat(text) {
        return Vec::new();
    }

    match parser.parse(text.as_bytes()) {
        Ok(messages) => messages,
        Err(e) => {
            #[cfg(feature = "tracing")]
            tracing::debug!(%text, error = %e, "Dropping undecodable frame");
            #[cfg(not(feature = "tracing"))]
            let _ = &e;
            Vec::new()
        }
    }
}
