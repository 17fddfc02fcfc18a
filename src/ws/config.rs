#![expect(
    clippy::module_name_repetitions,
    reason = "Configuration types intentionally mirror the module name for clarity"
)]

use std::time::Duration;

use backoff::backoff::Backoff as _;
use backoff::{ExponentialBackoff, ExponentialBackoffBuilder};
use rand::Rng as _;

const DEFAULT_HEARTBEAT_INTERVAL_DURATION: Duration = Duration::from_secs(30);
const DEFAULT_HEARTBEAT_TIMEOUT_DURATION: Duration = Duration::from_secs(90);
const DEFAULT_CONNECT_TIMEOUT_DURATION: Duration = Duration::from_secs(10);
const DEFAULT_FLUSH_DELAY_DURATION: Duration = Duration::from_millis(100);
const DEFAULT_RECONNECT_SETTLE_DURATION: Duration = Duration::from_millis(300);
const DEFAULT_CREDENTIAL_CHANGE_THROTTLE_DURATION: Duration = Duration::from_secs(1);
const DEFAULT_HEARTBEAT_MESSAGE: &str = "ping";

const DEFAULT_MAX_ATTEMPTS: u32 = 10;
const DEFAULT_INITIAL_BACKOFF_DURATION: Duration = Duration::from_secs(1);
const DEFAULT_MAX_BACKOFF_DURATION: Duration = Duration::from_secs(30);
const DEFAULT_BACKOFF_MULTIPLIER: f64 = 1.5;
const DEFAULT_MAX_JITTER_DURATION: Duration = Duration::from_millis(500);

/// Application close code the server uses when it rejects the token.
pub const AUTH_REJECTED_CLOSE_CODE: u16 = 4003;
/// Close code used when a transport is replaced by a newer connection attempt.
pub const SUPERSEDED_CLOSE_CODE: u16 = 4000;

/// Configuration for the connection manager.
#[non_exhaustive]
#[derive(Debug, Clone)]
pub struct Config {
    /// Interval between liveness probes while connected
    pub heartbeat_interval: Duration,
    /// Text frame sent as the liveness probe
    pub heartbeat_message: String,
    /// Maximum silence from the server before the connection is considered dead.
    /// `None` disables the check.
    pub heartbeat_timeout: Option<Duration>,
    /// Maximum time between dialing and the socket opening
    pub connect_timeout: Duration,
    /// Pause between the socket opening and flushing queued messages
    pub flush_delay: Duration,
    /// Pause between the disconnect and the connect of a manual reconnect
    pub reconnect_settle: Duration,
    /// Window in which credential change notifications collapse into one reconnect
    pub credential_change_throttle: Duration,
    /// Upper bound of the outbound queue; the oldest message is dropped past it.
    /// `None` means unbounded.
    pub max_queued: Option<usize>,
    /// Close codes meaning the server rejected the credential. These are never retried.
    pub auth_close_codes: Vec<u16>,
    /// Reconnection strategy configuration
    pub reconnect: ReconnectConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL_DURATION,
            heartbeat_message: DEFAULT_HEARTBEAT_MESSAGE.to_owned(),
            heartbeat_timeout: Some(DEFAULT_HEARTBEAT_TIMEOUT_DURATION),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT_DURATION,
            flush_delay: DEFAULT_FLUSH_DELAY_DURATION,
            reconnect_settle: DEFAULT_RECONNECT_SETTLE_DURATION,
            credential_change_throttle: DEFAULT_CREDENTIAL_CHANGE_THROTTLE_DURATION,
            max_queued: None,
            // protocol error, policy violation, and the server's application auth codes
            auth_close_codes: vec![1002, 1008, 4001, AUTH_REJECTED_CLOSE_CODE],
            reconnect: ReconnectConfig::default(),
        }
    }
}

/// Configuration for automatic reconnection behavior.
#[non_exhaustive]
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Maximum number of consecutive connection attempts before giving up.
    /// `None` means infinite retries.
    pub max_attempts: Option<u32>,
    /// Initial backoff duration for first reconnection attempt
    pub initial_backoff: Duration,
    /// Maximum backoff duration, jitter included
    pub max_backoff: Duration,
    /// Multiplier for exponential backoff
    pub backoff_multiplier: f64,
    /// Upper bound of the uniform random delay added to every backoff
    pub max_jitter: Duration,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            max_attempts: Some(DEFAULT_MAX_ATTEMPTS),
            initial_backoff: DEFAULT_INITIAL_BACKOFF_DURATION,
            max_backoff: DEFAULT_MAX_BACKOFF_DURATION,
            backoff_multiplier: DEFAULT_BACKOFF_MULTIPLIER,
            max_jitter: DEFAULT_MAX_JITTER_DURATION,
        }
    }
}

impl From<ReconnectConfig> for ExponentialBackoff {
    fn from(config: ReconnectConfig) -> Self {
        ExponentialBackoffBuilder::default()
            .with_initial_interval(config.initial_backoff)
            .with_max_interval(config.max_backoff)
            .with_multiplier(config.backoff_multiplier)
            // Jitter is additive and applied by `ReconnectSchedule`
            .with_randomization_factor(0.0)
            .with_max_elapsed_time(None) // We handle max attempts separately
            .build()
    }
}

/// Stateful delay generator for consecutive reconnection attempts.
///
/// Delays follow `min(initial * multiplier^n + jitter, max_backoff)`, so they never decrease
/// while `initial_backoff * (multiplier - 1) >= max_jitter` and never exceed the cap.
#[derive(Debug)]
pub struct ReconnectSchedule {
    backoff: ExponentialBackoff,
    max_backoff: Duration,
    max_jitter: Duration,
}

impl ReconnectSchedule {
    #[must_use]
    pub fn new(config: &ReconnectConfig) -> Self {
        Self {
            backoff: config.clone().into(),
            max_backoff: config.max_backoff,
            max_jitter: config.max_jitter,
        }
    }

    /// Delay before the next attempt.
    pub fn next_delay(&mut self) -> Duration {
        let base = self.backoff.next_backoff().unwrap_or(self.max_backoff);
        (base + self.jitter()).min(self.max_backoff)
    }

    /// Start over from the initial backoff, e.g. after a successful connection.
    pub fn reset(&mut self) {
        self.backoff.reset();
    }

    fn jitter(&self) -> Duration {
        let max = u64::try_from(self.max_jitter.as_millis()).unwrap_or(u64::MAX);
        if max == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::rng().random_range(0..=max))
    }
}
