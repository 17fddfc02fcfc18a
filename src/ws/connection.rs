#![expect(
    clippy::module_name_repetitions,
    reason = "Connection types expose their domain in the name for clarity"
)]

use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt as _, StreamExt as _};
use secrecy::{ExposeSecret as _, SecretString};
use serde::de::DeserializeOwned;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval, MissedTickBehavior, Sleep, interval_at, sleep, timeout};

use super::config::{Config, ReconnectSchedule, SUPERSEDED_CLOSE_CODE};
use super::endpoint::Endpoint;
use super::error::{ErrorKind, WsError};
use super::queue::{Outbound, OutboundQueue};
use super::state::{CloseClass, ConnectionState, ConnectionStatus, classify_close};
use super::traits::{JsonParser, MessageParser, decode_text};
use super::transport::{
    BoxSink, BoxStream, CloseCode, CloseFrame, Connector, Message, TransportError,
    TungsteniteConnector,
};
use crate::Result;
use crate::auth::CredentialProvider;
use crate::error::{Error, Kind};
use crate::signal::{CredentialBus, CredentialChange};

/// Close code sent on a requested disconnect.
const NORMAL_CLOSE_CODE: u16 = 1000;
/// Close code sent when the server stopped answering heartbeats.
const GOING_AWAY_CLOSE_CODE: u16 = 1001;
/// Close code reported when a close frame carried no status.
const NO_STATUS_CLOSE_CODE: u16 = 1005;
/// Close code reported when the socket vanished without a close frame.
const ABNORMAL_CLOSE_CODE: u16 = 1006;
/// Upper bound for writing our own close frame before the socket is dropped anyway.
const CLOSE_WRITE_TIMEOUT: Duration = Duration::from_secs(1);

/// Callback receiving every decoded inbound message.
pub type MessageHandler<M> = Arc<dyn Fn(M) + Send + Sync>;
/// Callback receiving every failure recorded as the manager's last error.
pub type ErrorHandler = Arc<dyn Fn(&WsError) + Send + Sync>;

/// Result of [`ConnectionManager::send`].
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    /// Written to the open socket
    Sent,
    /// Held in the outbound queue until the socket is (re)opened
    Queued,
    /// The manager has shut down; the message was discarded
    Closed,
}

#[derive(Debug)]
enum Command {
    Connect,
    Disconnect,
    Reconnect,
    Stop,
    Send {
        message: Outbound,
        reply: oneshot::Sender<SendOutcome>,
    },
}

/// Results of work done outside the event loop, tagged with the connection generation they
/// belong to.
enum Event {
    CredentialMissing {
        generation: u64,
    },
    Opened {
        generation: u64,
        token: SecretString,
        sink: BoxSink,
        stream: BoxStream,
    },
    DialFailed {
        generation: u64,
        error: WsError,
    },
    Frame {
        generation: u64,
        message: Message,
    },
    Closed {
        generation: u64,
        code: u16,
        reason: String,
    },
    CredentialChecked {
        generation: u64,
        changed: bool,
    },
}

enum Transport {
    Idle,
    Dialing(JoinHandle<()>),
    Open {
        sink: BoxSink,
        reader: JoinHandle<()>,
    },
}

/// Keeps one authenticated socket alive on behalf of any number of cloned handles.
///
/// All lifecycle work (dialing, heartbeats, backoff, flushing the outbound queue) happens on a
/// single background task. The handle only sends commands to it and observes the status it
/// publishes, so every method here is cheap and never fails; problems surface through
/// [`ConnectionManager::status`] instead.
///
/// The background task stops when the last handle is dropped, closing the socket and cancelling
/// every timer.
///
/// # Example
///
/// ```ignore
/// let provider = PassiveProvider::new(store);
/// let endpoint = Endpoint::from_origin("https://floor.example.com", DASHBOARD_PATH)?;
///
/// let manager = ConnectionManager::builder(endpoint, provider, |msg: serde_json::Value| {
///     println!("Received: {msg}");
/// })
/// .build()?;
///
/// manager.start();
/// manager.send(json!({"type": "get_statistics"})).await;
/// ```
#[derive(Clone, Debug)]
pub struct ConnectionManager {
    commands: mpsc::UnboundedSender<Command>,
    status_rx: watch::Receiver<ConnectionStatus>,
}

impl ConnectionManager {
    /// Starts configuring a manager for `endpoint` that authenticates through `provider` and
    /// delivers JSON-decoded messages to `on_message`.
    pub fn builder<M, C, F>(
        endpoint: Endpoint,
        provider: C,
        on_message: F,
    ) -> Builder<M, JsonParser<M>>
    where
        M: DeserializeOwned + Send + 'static,
        C: CredentialProvider,
        F: Fn(M) + Send + Sync + 'static,
    {
        Builder {
            endpoint,
            provider: Arc::new(provider),
            on_message: Arc::new(on_message),
            parser: JsonParser::new(),
            config: Config::default(),
            connector: Arc::new(TungsteniteConnector),
            on_error: None,
            credential_changes: None,
        }
    }

    /// Activates the manager and opens the connection.
    pub fn start(&self) {
        self.command(Command::Connect);
    }

    /// Deactivates the manager: closes the connection, cancels every timer and ignores
    /// credential change notifications until started again.
    pub fn stop(&self) {
        self.command(Command::Stop);
    }

    /// Opens the connection unless it is already connecting or connected.
    pub fn connect(&self) {
        self.command(Command::Connect);
    }

    /// Closes the connection and cancels any pending reconnect. No automatic reconnect follows.
    pub fn disconnect(&self) {
        self.command(Command::Disconnect);
    }

    /// Drops the current connection and opens a fresh one with a fresh credential, resetting
    /// the retry budget.
    pub fn reconnect(&self) {
        self.command(Command::Reconnect);
    }

    /// Writes `message` now if the socket is open, otherwise queues it for the next connection.
    pub async fn send<T: Into<Outbound>>(&self, message: T) -> SendOutcome {
        let (reply, outcome) = oneshot::channel();
        let command = Command::Send {
            message: message.into(),
            reply,
        };

        if self.commands.send(command).is_err() {
            return SendOutcome::Closed;
        }
        outcome.await.unwrap_or(SendOutcome::Closed)
    }

    /// Get the current status snapshot.
    #[must_use]
    pub fn status(&self) -> ConnectionStatus {
        self.status_rx.borrow().clone()
    }

    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.status_rx.borrow().state
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.state().is_connected()
    }

    #[must_use]
    pub fn is_connecting(&self) -> bool {
        self.state().is_connecting()
    }

    #[must_use]
    pub fn last_error(&self) -> Option<WsError> {
        self.status_rx.borrow().last_error.clone()
    }

    #[must_use]
    pub fn attempt(&self) -> u32 {
        self.status_rx.borrow().attempt
    }

    /// Subscribe to status changes.
    ///
    /// The receiver is updated synchronously with every transition, which makes it suitable
    /// for driving a connection indicator.
    #[must_use]
    pub fn status_receiver(&self) -> watch::Receiver<ConnectionStatus> {
        self.status_rx.clone()
    }

    fn command(&self, command: Command) {
        if self.commands.send(command).is_err() {
            #[cfg(feature = "tracing")]
            tracing::debug!("Connection manager task has already stopped");
        }
    }
}

/// Configures and spawns a [`ConnectionManager`].
pub struct Builder<M, P> {
    endpoint: Endpoint,
    provider: Arc<dyn CredentialProvider>,
    on_message: MessageHandler<M>,
    parser: P,
    config: Config,
    connector: Arc<dyn Connector>,
    on_error: Option<ErrorHandler>,
    credential_changes: Option<broadcast::Receiver<CredentialChange>>,
}

impl<M: Send + 'static, P: MessageParser<M>> Builder<M, P> {
    #[must_use]
    pub fn config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    /// Replaces the default JSON framing.
    pub fn parser<Q: MessageParser<M>>(self, parser: Q) -> Builder<M, Q> {
        Builder {
            endpoint: self.endpoint,
            provider: self.provider,
            on_message: self.on_message,
            parser,
            config: self.config,
            connector: self.connector,
            on_error: self.on_error,
            credential_changes: self.credential_changes,
        }
    }

    /// Replaces the `tokio-tungstenite` transport.
    #[must_use]
    pub fn connector<C: Connector>(mut self, connector: C) -> Self {
        self.connector = Arc::new(connector);
        self
    }

    /// Observe every failure as it is recorded.
    #[must_use]
    pub fn on_error<F: Fn(&WsError) + Send + Sync + 'static>(mut self, on_error: F) -> Self {
        self.on_error = Some(Arc::new(on_error));
        self
    }

    /// Reconnect (once per throttle window) when `bus` reports a credential change.
    #[must_use]
    pub fn credential_changes(mut self, bus: &CredentialBus) -> Self {
        self.credential_changes = Some(bus.subscribe());
        self
    }

    /// Spawns the background task on the current Tokio runtime.
    ///
    /// The manager starts inactive; call [`ConnectionManager::start`] to connect.
    pub fn build(self) -> Result<ConnectionManager> {
        if self.config.heartbeat_interval.is_zero() {
            return Err(Error::validation("heartbeat interval must be non-zero"));
        }
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| Error::with_source(Kind::Internal, e))?;

        #[cfg(feature = "tracing")]
        if !self.endpoint.is_secure() {
            tracing::warn!(
                endpoint = %self.endpoint.url(),
                "Credentials will be sent over an unencrypted socket"
            );
        }

        let (commands, commands_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (status_tx, status_rx) = watch::channel(ConnectionStatus::default());

        let driver = Driver {
            schedule: ReconnectSchedule::new(&self.config.reconnect),
            queue: OutboundQueue::new(self.config.max_queued),
            config: self.config,
            endpoint: self.endpoint,
            provider: self.provider,
            connector: self.connector,
            parser: self.parser,
            on_message: self.on_message,
            on_error: self.on_error,
            status_tx,
            events_tx,
            credential_changes: self.credential_changes,
            active: false,
            state: ConnectionState::Disconnected,
            attempt: 0,
            last_error: None,
            generation: 0,
            transport: Transport::Idle,
            token_in_use: None,
            last_inbound: Instant::now(),
            reconnect_timer: None,
            reconnect_delay: None,
            flush_timer: None,
            change_timer: None,
            heartbeat: None,
        };

        runtime.spawn(driver.run(commands_rx, events_rx));

        Ok(ConnectionManager {
            commands,
            status_rx,
        })
    }
}

/// The event loop owning the socket. Only ever touched from its own task.
struct Driver<M, P> {
    config: Config,
    endpoint: Endpoint,
    provider: Arc<dyn CredentialProvider>,
    connector: Arc<dyn Connector>,
    parser: P,
    on_message: MessageHandler<M>,
    on_error: Option<ErrorHandler>,
    status_tx: watch::Sender<ConnectionStatus>,
    events_tx: mpsc::UnboundedSender<Event>,
    credential_changes: Option<broadcast::Receiver<CredentialChange>>,

    active: bool,
    state: ConnectionState,
    attempt: u32,
    last_error: Option<WsError>,
    /// Identifies the current transport; bumped whenever one is discarded
    generation: u64,
    transport: Transport,
    token_in_use: Option<SecretString>,
    queue: OutboundQueue,
    schedule: ReconnectSchedule,
    last_inbound: Instant,

    reconnect_timer: Option<Pin<Box<Sleep>>>,
    reconnect_delay: Option<Duration>,
    flush_timer: Option<Pin<Box<Sleep>>>,
    change_timer: Option<Pin<Box<Sleep>>>,
    heartbeat: Option<Interval>,
}

impl<M: Send + 'static, P: MessageParser<M>> Driver<M, P> {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut events: mpsc::UnboundedReceiver<Event>,
    ) {
        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => self.handle_command(command).await,
                    None => break,
                },
                Some(event) = events.recv() => self.handle_event(event).await,
                () = fire(&mut self.reconnect_timer) => {
                    self.reconnect_timer = None;
                    self.reconnect_delay = None;
                    self.connect().await;
                }
                () = fire(&mut self.flush_timer) => {
                    self.flush_timer = None;
                    self.flush().await;
                }
                () = fire(&mut self.change_timer) => {
                    self.change_timer = None;
                    self.check_credential_change();
                }
                () = tick(&mut self.heartbeat) => self.on_heartbeat().await,
                change = next_change(&mut self.credential_changes) => self.on_credential_change(change),
            }
        }

        #[cfg(feature = "tracing")]
        tracing::debug!("All connection handles dropped, shutting down");

        self.active = false;
        self.disconnect("client shut down").await;
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Connect => {
                self.active = true;
                self.connect().await;
            }
            Command::Disconnect => self.disconnect("client disconnect").await,
            Command::Reconnect => self.reconnect().await,
            Command::Stop => {
                self.active = false;
                self.disconnect("stopped").await;
            }
            Command::Send { message, reply } => {
                let outcome = self.send(message).await;
                _ = reply.send(outcome);
            }
        }
    }

    async fn handle_event(&mut self, event: Event) {
        match event {
            Event::Opened {
                generation,
                token,
                sink,
                stream,
            } => {
                if generation == self.generation && matches!(self.transport, Transport::Dialing(_))
                {
                    self.on_opened(token, sink, stream);
                } else {
                    drop(stream);
                    close_sink(sink, SUPERSEDED_CLOSE_CODE, "superseded").await;
                }
            }
            Event::CredentialMissing { generation } if generation == self.generation => {
                self.on_credential_missing();
            }
            Event::DialFailed { generation, error } if generation == self.generation => {
                self.on_dial_failed(error);
            }
            Event::Frame {
                generation,
                message,
            } if generation == self.generation => self.on_frame(message),
            Event::Closed {
                generation,
                code,
                reason,
            } if generation == self.generation => self.on_closed(code, &reason),
            Event::CredentialChecked {
                generation,
                changed,
            } if generation == self.generation => {
                if changed && self.active {
                    #[cfg(feature = "tracing")]
                    tracing::info!("Credential changed, reconnecting");
                    self.reconnect().await;
                }
            }
            _ => {
                #[cfg(feature = "tracing")]
                tracing::trace!("Ignoring event from a superseded connection");
            }
        }
    }

    async fn connect(&mut self) {
        if matches!(
            self.state,
            ConnectionState::Connecting | ConnectionState::Connected
        ) {
            return;
        }

        self.reconnect_timer = None;
        self.reconnect_delay = None;
        self.close_transport(SUPERSEDED_CLOSE_CODE, "superseded").await;

        self.attempt = self.attempt.saturating_add(1);
        self.state = ConnectionState::Connecting;

        #[cfg(feature = "tracing")]
        tracing::info!(attempt = self.attempt, endpoint = %self.endpoint.url(), "Connecting");

        let task = tokio::spawn(dial(
            self.generation,
            Arc::clone(&self.provider),
            Arc::clone(&self.connector),
            self.endpoint.clone(),
            self.config.connect_timeout,
            self.events_tx.clone(),
        ));
        self.transport = Transport::Dialing(task);
        self.publish();
    }

    async fn disconnect(&mut self, reason: &str) {
        self.reconnect_timer = None;
        self.reconnect_delay = None;
        self.change_timer = None;
        self.close_transport(NORMAL_CLOSE_CODE, reason).await;

        self.attempt = 0;
        self.schedule.reset();
        self.state = ConnectionState::Disconnected;
        self.publish();
    }

    async fn reconnect(&mut self) {
        self.active = true;
        self.disconnect("reconnecting").await;
        self.arm_reconnect(self.config.reconnect_settle);
        self.publish();
    }

    async fn send(&mut self, message: Outbound) -> SendOutcome {
        if self.state.is_connected()
            && self.queue.is_empty()
            && let Transport::Open { sink, .. } = &mut self.transport
        {
            match write(sink, &message).await {
                Ok(()) => return SendOutcome::Sent,
                Err(error) => self.record_error(error),
            }
        }

        self.enqueue(message);
        // A queue left behind by a failed write drains on the next flush, not the next open
        if self.state.is_connected() && self.flush_timer.is_none() {
            self.flush_timer = Some(Box::pin(sleep(self.config.flush_delay)));
        }
        self.publish();
        SendOutcome::Queued
    }

    fn enqueue(&mut self, message: Outbound) {
        if let Some(dropped) = self.queue.push_back(message) {
            #[cfg(feature = "tracing")]
            tracing::warn!(?dropped, "Outbound queue full, dropped oldest message");
            #[cfg(not(feature = "tracing"))]
            let _ = &dropped;
        }
    }

    /// Writes queued messages in order for as long as the socket stays open.
    async fn flush(&mut self) {
        while self.state.is_connected() {
            let Transport::Open { sink, .. } = &mut self.transport else {
                break;
            };
            let Some(message) = self.queue.pop_front() else {
                break;
            };

            if let Err(error) = write(sink, &message).await {
                self.queue.push_front(message);
                self.record_error(error);
                break;
            }
        }

        #[cfg(feature = "tracing")]
        tracing::debug!(remaining = self.queue.len(), "Flushed outbound queue");

        self.publish();
    }

    async fn on_heartbeat(&mut self) {
        if !self.state.is_connected() {
            self.heartbeat = None;
            return;
        }

        if let Some(limit) = self.config.heartbeat_timeout
            && self.last_inbound.elapsed() > limit
        {
            #[cfg(feature = "tracing")]
            tracing::warn!("Heartbeat timeout: nothing received within {limit:?}");

            self.close_transport(GOING_AWAY_CLOSE_CODE, "heartbeat timeout")
                .await;
            self.state = ConnectionState::Disconnected;
            self.record_error(WsError::new(
                ErrorKind::TransientNetwork,
                format!("nothing received within {limit:?}"),
            ));
            self.schedule_reconnect();
            self.publish();
            return;
        }

        let probe = Message::Text(self.config.heartbeat_message.clone().into());
        if let Transport::Open { sink, .. } = &mut self.transport
            && let Err(e) = sink.send(probe).await
        {
            // The reader reports the broken socket; nothing else to do here
            #[cfg(feature = "tracing")]
            tracing::debug!(error = %e, "Failed to send heartbeat");
            #[cfg(not(feature = "tracing"))]
            let _ = &e;
        }
    }

    fn on_opened(&mut self, token: SecretString, sink: BoxSink, stream: BoxStream) {
        let reader = tokio::spawn(read_frames(self.generation, stream, self.events_tx.clone()));
        self.transport = Transport::Open { sink, reader };
        self.token_in_use = Some(token);

        self.state = ConnectionState::Connected;
        self.attempt = 0;
        self.schedule.reset();
        self.last_error = None;
        self.last_inbound = Instant::now();

        let period = self.config.heartbeat_interval;
        let mut heartbeat = interval_at(Instant::now() + period, period);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        self.heartbeat = Some(heartbeat);

        if !self.queue.is_empty() {
            self.flush_timer = Some(Box::pin(sleep(self.config.flush_delay)));
        }

        #[cfg(feature = "tracing")]
        tracing::info!(queued = self.queue.len(), "Connected");

        self.publish();
    }

    fn on_credential_missing(&mut self) {
        self.transport = Transport::Idle;
        self.state = ConnectionState::Error;
        self.record_error(WsError::authentication_required());
        self.escalate_logout();
        self.publish();
    }

    fn on_dial_failed(&mut self, error: WsError) {
        self.transport = Transport::Idle;
        self.state = ConnectionState::Error;

        let kind = error.kind;
        self.record_error(error);
        if kind.requires_logout() {
            self.escalate_logout();
        } else if kind.is_retryable() {
            self.schedule_reconnect();
        }
        self.publish();
    }

    fn on_frame(&mut self, message: Message) {
        self.last_inbound = Instant::now();

        if let Message::Text(text) = message {
            for decoded in decode_text(&self.parser, text.as_str()) {
                (self.on_message)(decoded);
            }
        }
    }

    fn on_closed(&mut self, code: u16, reason: &str) {
        self.discard_transport();

        match classify_close(code, &self.config) {
            CloseClass::Normal => {
                #[cfg(feature = "tracing")]
                tracing::info!(%reason, "Server closed the connection");
                self.state = ConnectionState::Disconnected;
            }
            CloseClass::AuthRejected => {
                self.state = ConnectionState::Error;
                self.record_error(WsError::authentication_expired(code, reason));
                self.escalate_logout();
            }
            CloseClass::Transient => {
                self.state = ConnectionState::Disconnected;
                let message = if reason.is_empty() {
                    "connection closed".to_owned()
                } else {
                    reason.to_owned()
                };
                self.record_error(
                    WsError::new(ErrorKind::TransientNetwork, message).with_close_code(code),
                );
                self.schedule_reconnect();
            }
        }

        self.publish();
    }

    fn on_credential_change(&mut self, change: std::result::Result<CredentialChange, RecvError>) {
        match change {
            Ok(_) | Err(RecvError::Lagged(_)) => {
                if self.active && self.change_timer.is_none() {
                    self.change_timer = Some(Box::pin(sleep(self.config.credential_change_throttle)));
                }
            }
            Err(RecvError::Closed) => self.credential_changes = None,
        }
    }

    /// Decides whether a burst of credential changes needs a reconnect.
    ///
    /// A live connection is kept when the provider still hands out the token it was opened
    /// with, which is the case when this manager's own dial triggered the rotation. After the
    /// credential was rejected, only a newly available credential counts: the logout this
    /// manager requested clears the session too.
    fn check_credential_change(&mut self) {
        if !self.active {
            return;
        }
        if self.state.is_connecting() {
            self.change_timer = Some(Box::pin(sleep(self.config.credential_change_throttle)));
            return;
        }

        let generation = self.generation;
        let events = self.events_tx.clone();
        let in_use = self.token_in_use.clone();
        if in_use.is_none() && !self.awaiting_credential() {
            _ = events.send(Event::CredentialChecked {
                generation,
                changed: true,
            });
            return;
        }

        let provider = Arc::clone(&self.provider);
        tokio::spawn(async move {
            let current = provider.credential().await;
            let changed = match in_use {
                Some(in_use) => current
                    .is_none_or(|c| c.token().expose_secret() != in_use.expose_secret()),
                None => current.is_some(),
            };
            _ = events.send(Event::CredentialChecked {
                generation,
                changed,
            });
        });
    }

    /// Whether the last attempt ended in a credential rejection that was escalated to logout.
    fn awaiting_credential(&self) -> bool {
        self.state == ConnectionState::Error
            && self
                .last_error
                .as_ref()
                .is_some_and(|error| error.kind.requires_logout())
    }

    fn schedule_reconnect(&mut self) {
        if let Some(max) = self.config.reconnect.max_attempts
            && self.attempt >= max
        {
            #[cfg(feature = "tracing")]
            tracing::error!(attempts = self.attempt, "Giving up on reconnecting");

            self.state = ConnectionState::Failed;
            self.record_error(WsError::too_many_attempts(self.attempt));
            return;
        }

        let delay = self.schedule.next_delay();

        #[cfg(feature = "tracing")]
        tracing::info!(?delay, attempt = self.attempt, "Scheduling reconnect");

        self.arm_reconnect(delay);
    }

    /// Arms the single reconnect timer, replacing any pending one.
    fn arm_reconnect(&mut self, delay: Duration) {
        self.reconnect_timer = Some(Box::pin(sleep(delay)));
        self.reconnect_delay = Some(delay);
    }

    fn record_error(&mut self, error: WsError) {
        #[cfg(feature = "tracing")]
        tracing::warn!(error = %error, "Connection error");

        if let Some(on_error) = &self.on_error {
            on_error(&error);
        }
        self.last_error = Some(error);
    }

    fn escalate_logout(&self) {
        #[cfg(feature = "tracing")]
        tracing::warn!("Credential unusable, requesting logout");

        let provider = Arc::clone(&self.provider);
        tokio::spawn(async move { provider.logout().await });
    }

    /// Forgets the current transport without writing a close frame and returns its write half.
    fn discard_transport(&mut self) -> Option<BoxSink> {
        self.generation = self.generation.wrapping_add(1);
        self.heartbeat = None;
        self.flush_timer = None;
        self.token_in_use = None;

        match std::mem::replace(&mut self.transport, Transport::Idle) {
            Transport::Idle => None,
            Transport::Dialing(task) => {
                task.abort();
                None
            }
            Transport::Open { sink, reader } => {
                reader.abort();
                Some(sink)
            }
        }
    }

    async fn close_transport(&mut self, code: u16, reason: &str) {
        if let Some(sink) = self.discard_transport() {
            close_sink(sink, code, reason).await;
        }
    }

    fn publish(&self) {
        self.status_tx.send_replace(ConnectionStatus {
            state: self.state,
            attempt: self.attempt,
            last_error: self.last_error.clone(),
            reconnect_delay: self.reconnect_delay,
            queued: self.queue.len(),
            active: self.active,
        });
    }
}

/// Obtains a credential and opens the socket for connection `generation`.
async fn dial(
    generation: u64,
    provider: Arc<dyn CredentialProvider>,
    connector: Arc<dyn Connector>,
    endpoint: Endpoint,
    connect_timeout: Duration,
    events: mpsc::UnboundedSender<Event>,
) {
    // Runs detached so that aborting a superseded dial never cancels a refresh halfway through
    // a server-side token rotation. Only the socket handshake below is abortable.
    let acquire = tokio::spawn(async move { provider.credential().await });

    // Checked again here: the provider may hand back a token that expired while it refreshed
    let Some(credential) = acquire
        .await
        .ok()
        .flatten()
        .filter(|credential| !credential.is_expired())
    else {
        _ = events.send(Event::CredentialMissing { generation });
        return;
    };

    let url = endpoint.with_token(credential.token().expose_secret());
    let event = match timeout(connect_timeout, connector.connect(&url)).await {
        Ok(Ok((sink, stream))) => Event::Opened {
            generation,
            token: credential.token().clone(),
            sink,
            stream,
        },
        Ok(Err(TransportError::Http(response)))
            if matches!(response.status().as_u16(), 401 | 403) =>
        {
            Event::DialFailed {
                generation,
                error: WsError::new(
                    ErrorKind::AuthenticationExpired,
                    format!("handshake rejected with {}", response.status()),
                ),
            }
        }
        Ok(Err(e)) => Event::DialFailed {
            generation,
            error: WsError::new(ErrorKind::TransientNetwork, e.to_string()),
        },
        Err(_elapsed) => Event::DialFailed {
            generation,
            error: WsError::new(
                ErrorKind::ConnectTimeout,
                format!("socket did not open within {connect_timeout:?}"),
            ),
        },
    };

    _ = events.send(event);
}

/// Forwards frames of connection `generation` to the event loop until the socket closes.
async fn read_frames(generation: u64, mut stream: BoxStream, events: mpsc::UnboundedSender<Event>) {
    let (code, reason) = loop {
        match stream.next().await {
            Some(Ok(Message::Close(frame))) => {
                break match frame {
                    Some(frame) => (u16::from(frame.code), frame.reason.as_str().to_owned()),
                    None => (NO_STATUS_CLOSE_CODE, String::new()),
                };
            }
            Some(Ok(message)) => {
                if events
                    .send(Event::Frame {
                        generation,
                        message,
                    })
                    .is_err()
                {
                    return;
                }
            }
            Some(Err(e)) => break (ABNORMAL_CLOSE_CODE, e.to_string()),
            None => break (ABNORMAL_CLOSE_CODE, "connection lost".to_owned()),
        }
    };

    _ = events.send(Event::Closed {
        generation,
        code,
        reason,
    });
}

async fn write(sink: &mut BoxSink, message: &Outbound) -> std::result::Result<(), WsError> {
    let text = message.to_text().map_err(|e| {
        WsError::new(ErrorKind::SendFailed, format!("failed to serialise message: {e}"))
    })?;

    sink.send(Message::Text(text.into()))
        .await
        .map_err(|e| WsError::new(ErrorKind::SendFailed, e.to_string()))
}

async fn close_sink(mut sink: BoxSink, code: u16, reason: &str) {
    let frame = CloseFrame {
        code: CloseCode::from(code),
        reason: reason.to_owned().into(),
    };

    match timeout(CLOSE_WRITE_TIMEOUT, sink.send(Message::Close(Some(frame)))).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            #[cfg(feature = "tracing")]
            tracing::trace!(error = %e, "Socket already gone while closing");
            #[cfg(not(feature = "tracing"))]
            let _ = &e;
        }
        Err(_elapsed) => {
            #[cfg(feature = "tracing")]
            tracing::debug!("Timed out writing close frame");
        }
    }
}

async fn fire(timer: &mut Option<Pin<Box<Sleep>>>) {
    match timer {
        Some(sleep) => sleep.as_mut().await,
        None => std::future::pending().await,
    }
}

async fn tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

async fn next_change(
    receiver: &mut Option<broadcast::Receiver<CredentialChange>>,
) -> std::result::Result<CredentialChange, RecvError> {
    match receiver {
        Some(receiver) => receiver.recv().await,
        None => std::future::pending().await,
    }
}
