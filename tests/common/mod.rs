#![allow(
    clippy::unwrap_used,
    clippy::missing_panics_doc,
    reason = "Do not need additional syntax for setting up tests"
)]
#![allow(
    dead_code,
    reason = "Each test binary only uses part of the shared fixtures"
)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use futures::channel::mpsc as channel;
use futures::{SinkExt as _, StreamExt as _, future};
use serde_json::json;
use shopfloor_realtime::auth::{Credential, CredentialProvider};
use shopfloor_realtime::ws::config::Config;
use shopfloor_realtime::ws::transport::{
    BoxSink, BoxStream, CloseCode, CloseFrame, Connector, Message, TransportError,
};
use shopfloor_realtime::ws::{ConnectionManager, ConnectionStatus};
use tokio::sync::mpsc;
use tokio::time::timeout;
use url::Url;

/// Builds an unsigned JWT carrying `sub` and `exp`.
#[must_use]
pub fn jwt(sub: &str, exp: i64) -> String {
    let header = URL_SAFE_NO_PAD.encode(json!({"alg": "HS256", "typ": "JWT"}).to_string());
    let payload = URL_SAFE_NO_PAD.encode(json!({"sub": sub, "exp": exp}).to_string());
    format!("{header}.{payload}.signature")
}

/// Defaults with the liveness timeout disabled, so idle mock sockets stay open.
#[must_use]
pub fn quiet_config() -> Config {
    let mut config = Config::default();
    config.heartbeat_timeout = None;
    config
}

/// Wait (in virtual time when the clock is paused) until the manager's status satisfies `f`.
pub async fn wait_for<F>(manager: &ConnectionManager, f: F) -> ConnectionStatus
where
    F: FnMut(&ConnectionStatus) -> bool,
{
    let mut rx = manager.status_receiver();
    let status = timeout(Duration::from_secs(600), rx.wait_for(f))
        .await
        .expect("status was not reached in time")
        .unwrap()
        .clone();
    status
}

/// How the next dial of a [`MockConnector`] behaves.
#[derive(Debug, Clone, Copy)]
pub enum Dial {
    Accept,
    /// Accept, but fail the client's nth write (counting from 1) without delivering it
    FailWrite(usize),
    Refuse,
    Hang,
}

/// Server side of an in-memory socket handed out by [`MockConnector`].
pub struct MockSocket {
    pub url: Url,
    written: channel::UnboundedReceiver<Message>,
    inbound: channel::UnboundedSender<Result<Message, TransportError>>,
}

impl MockSocket {
    pub fn push_text(&self, text: &str) {
        self.inbound
            .unbounded_send(Ok(Message::Text(text.to_owned().into())))
            .unwrap();
    }

    /// Close the socket from the server with `code`.
    pub fn close(&self, code: u16, reason: &str) {
        let frame = CloseFrame {
            code: CloseCode::from(code),
            reason: reason.to_owned().into(),
        };
        drop(self.inbound.unbounded_send(Ok(Message::Close(Some(frame)))));
    }

    /// Vanish without a close frame, like a dropped network link.
    pub fn drop_connection(&self) {
        self.inbound.close_channel();
    }

    /// Whether the client still reads from this socket.
    #[must_use]
    pub fn is_open(&self) -> bool {
        !self.inbound.is_closed()
    }

    /// Next frame the client wrote, if any arrives within a second.
    pub async fn next_frame(&mut self) -> Option<Message> {
        timeout(Duration::from_secs(1), self.written.next())
            .await
            .ok()
            .flatten()
    }

    /// Next text frame the client wrote, skipping heartbeat probes.
    pub async fn next_text(&mut self) -> Option<String> {
        loop {
            match self.next_frame().await? {
                Message::Text(text) if text.as_str() != "ping" => return Some(text.to_string()),
                _ => {}
            }
        }
    }

    /// Every frame written so far, without waiting.
    pub fn drain(&mut self) -> Vec<Message> {
        std::iter::from_fn(|| self.written.try_next().ok().flatten()).collect()
    }
}

#[derive(Default)]
struct Script {
    dials: VecDeque<Dial>,
}

/// Scriptable in-memory [`Connector`]. Accepts every dial unless told otherwise.
#[derive(Clone)]
pub struct MockConnector {
    script: Arc<Mutex<Script>>,
    dialed: Arc<AtomicUsize>,
    sockets: mpsc::UnboundedSender<MockSocket>,
}

impl MockConnector {
    #[must_use]
    pub fn new() -> (Self, mpsc::UnboundedReceiver<MockSocket>) {
        let (sockets, rx) = mpsc::unbounded_channel();
        let connector = Self {
            script: Arc::default(),
            dialed: Arc::default(),
            sockets,
        };
        (connector, rx)
    }

    /// Queue the behaviour of upcoming dials.
    pub fn script<I: IntoIterator<Item = Dial>>(&self, dials: I) {
        self.script.lock().unwrap().dials.extend(dials);
    }

    #[must_use]
    pub fn dialed(&self) -> usize {
        self.dialed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(&self, url: &Url) -> Result<(BoxSink, BoxStream), TransportError> {
        self.dialed.fetch_add(1, Ordering::SeqCst);
        let dial = self
            .script
            .lock()
            .unwrap()
            .dials
            .pop_front()
            .unwrap_or(Dial::Accept);

        match dial {
            Dial::Refuse => Err(TransportError::Io(std::io::Error::from(
                std::io::ErrorKind::ConnectionRefused,
            ))),
            Dial::Hang => std::future::pending().await,
            Dial::Accept | Dial::FailWrite(_) => {
                let fail_on = match dial {
                    Dial::FailWrite(n) => Some(n),
                    _ => None,
                };
                let writes = AtomicUsize::new(0);
                let (written_tx, written) = channel::unbounded();
                let (inbound, inbound_rx) = channel::unbounded();

                let socket = MockSocket {
                    url: url.clone(),
                    written,
                    inbound,
                };
                drop(self.sockets.send(socket));

                let sink = written_tx
                    .sink_map_err(|_| TransportError::ConnectionClosed)
                    .with(move |message: Message| {
                        let n = writes.fetch_add(1, Ordering::SeqCst) + 1;
                        future::ready(if fail_on == Some(n) {
                            Err(TransportError::ConnectionClosed)
                        } else {
                            Ok(message)
                        })
                    });
                Ok((Box::pin(sink), Box::pin(inbound_rx)))
            }
        }
    }
}

/// Provider handing out a fixed opaque token and counting logouts.
#[derive(Clone, Default)]
pub struct StaticProvider {
    token: Arc<Mutex<Option<String>>>,
    requests: Arc<AtomicUsize>,
    logouts: Arc<AtomicUsize>,
}

impl StaticProvider {
    #[must_use]
    pub fn with_token(token: &str) -> Self {
        let provider = Self::default();
        provider.set(Some(token));
        provider
    }

    pub fn set(&self, token: Option<&str>) {
        *self.token.lock().unwrap() = token.map(str::to_owned);
    }

    #[must_use]
    pub fn requests(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn logouts(&self) -> usize {
        self.logouts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CredentialProvider for StaticProvider {
    async fn credential(&self) -> Option<Credential> {
        self.requests.fetch_add(1, Ordering::SeqCst);
        self.token.lock().unwrap().clone().map(Credential::from_token)
    }

    async fn logout(&self) {
        self.logouts.fetch_add(1, Ordering::SeqCst);
        self.set(None);
    }
}
