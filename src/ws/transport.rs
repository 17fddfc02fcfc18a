use std::pin::Pin;

use async_trait::async_trait;
use futures::{Sink, Stream, StreamExt as _};
use tokio_tungstenite::connect_async;
pub use tokio_tungstenite::tungstenite::protocol::CloseFrame;
pub use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
pub use tokio_tungstenite::tungstenite::{Error as TransportError, Message};
use url::Url;

/// Write half of an open socket.
pub type BoxSink = Pin<Box<dyn Sink<Message, Error = TransportError> + Send>>;
/// Read half of an open socket.
pub type BoxStream = Pin<Box<dyn Stream<Item = Result<Message, TransportError>> + Send>>;

/// Opens sockets for the connection manager.
///
/// The manager never touches the network directly, which lets tests drive it with in-memory
/// transports.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    /// Dial `url` and return the socket split into its write and read halves.
    async fn connect(&self, url: &Url) -> Result<(BoxSink, BoxStream), TransportError>;
}

/// [`Connector`] over `tokio-tungstenite`, with TLS for `wss://` endpoints.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, Default)]
pub struct TungsteniteConnector;

#[async_trait]
impl Connector for TungsteniteConnector {
    async fn connect(&self, url: &Url) -> Result<(BoxSink, BoxStream), TransportError> {
        let (ws_stream, _) = connect_async(url.as_str()).await?;
        let (write, read) = ws_stream.split();

        Ok((Box::pin(write), Box::pin(read)))
    }
}
