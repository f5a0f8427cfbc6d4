#![expect(
    clippy::module_name_repetitions,
    reason = "Configuration types intentionally mirror the module name for clarity"
)]

use std::time::Duration;

use bon::Builder;

use super::reconnect::BackoffTable;
use crate::Result;
use crate::error::Error;

const DEFAULT_HEARTBEAT_INTERVAL_DURATION: Duration = Duration::from_secs(30);
const DEFAULT_HEARTBEAT_TIMEOUT_DURATION: Duration = Duration::from_secs(10);
const DEFAULT_CONNECT_TIMEOUT_DURATION: Duration = Duration::from_secs(10);
const DEFAULT_CLOSE_TIMEOUT_DURATION: Duration = Duration::from_secs(5);
const DEFAULT_ACK_TIMEOUT_DURATION: Duration = Duration::from_secs(5);
const DEFAULT_POLL_INTERVAL_DURATION: Duration = Duration::from_secs(5);
const DEFAULT_POLL_TIMEOUT_DURATION: Duration = Duration::from_secs(10);
const DEFAULT_QUEUE_CAPACITY: usize = 100;
const DEFAULT_MAX_RECONNECT_ATTEMPTS: u32 = 5;

/// Configuration for the transport [`Client`](crate::Client).
///
/// ```
/// use std::time::Duration;
///
/// use analysis_realtime_client::ws::config::Config;
///
/// let config = Config::builder()
///     .heartbeat_interval(Duration::from_secs(15))
///     .queue_capacity(32)
///     .build();
///
/// assert_eq!(config.queue_capacity, 32);
/// ```
#[non_exhaustive]
#[derive(Debug, Clone, Builder)]
pub struct Config {
    /// Interval between liveness probes while the channel is open
    #[builder(default = DEFAULT_HEARTBEAT_INTERVAL_DURATION)]
    pub heartbeat_interval: Duration,
    /// Maximum time to wait for any frame after a probe before the channel is considered dead
    #[builder(default = DEFAULT_HEARTBEAT_TIMEOUT_DURATION)]
    pub heartbeat_timeout: Duration,
    /// Maximum time a single WebSocket handshake may take
    #[builder(default = DEFAULT_CONNECT_TIMEOUT_DURATION)]
    pub connect_timeout: Duration,
    /// Maximum time spent sending a close frame before the socket is dropped
    #[builder(default = DEFAULT_CLOSE_TIMEOUT_DURATION)]
    pub close_timeout: Duration,
    /// Time to wait for an `ack` before resubmitting a command
    #[builder(default = DEFAULT_ACK_TIMEOUT_DURATION)]
    pub ack_timeout: Duration,
    /// Number of commands buffered while the channel is not open
    #[builder(default = DEFAULT_QUEUE_CAPACITY)]
    pub queue_capacity: usize,
    /// Interval between catch-up polls once the fallback poller is active
    #[builder(default = DEFAULT_POLL_INTERVAL_DURATION)]
    pub poll_interval: Duration,
    /// Maximum time a single catch-up poll may take, including the response body
    #[builder(default = DEFAULT_POLL_TIMEOUT_DURATION)]
    pub poll_timeout: Duration,
    /// Reconnection strategy configuration
    #[builder(default)]
    pub reconnect: ReconnectConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl Config {
    pub(crate) fn validate(&self) -> Result<()> {
        if self.heartbeat_interval.is_zero() || self.heartbeat_timeout.is_zero() {
            return Err(Error::validation("heartbeat durations must be non-zero"));
        }
        if self.poll_interval.is_zero() || self.poll_timeout.is_zero() {
            return Err(Error::validation("poll durations must be non-zero"));
        }
        if self.connect_timeout.is_zero() || self.close_timeout.is_zero() {
            return Err(Error::validation("connect and close timeouts must be non-zero"));
        }
        if self.queue_capacity == 0 {
            return Err(Error::validation("queue capacity must be at least one"));
        }
        self.reconnect.validate()
    }
}

/// Configuration for automatic reconnection behavior.
#[non_exhaustive]
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Delay before each reconnection attempt. Attempts past the end of the
    /// table reuse its last entry.
    pub backoff: Vec<Duration>,
    /// Number of automatic reconnection attempts before switching to polling.
    /// `None` means infinite retries.
    pub max_attempts: Option<u32>,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            backoff: default_backoff(),
            max_attempts: Some(DEFAULT_MAX_RECONNECT_ATTEMPTS),
        }
    }
}

impl ReconnectConfig {
    #[must_use]
    pub fn new(backoff: Vec<Duration>, max_attempts: Option<u32>) -> Self {
        Self {
            backoff,
            max_attempts,
        }
    }

    fn validate(&self) -> Result<()> {
        if self.backoff.is_empty() {
            return Err(Error::validation("backoff table must not be empty"));
        }
        if self.backoff.windows(2).any(|pair| pair[0] > pair[1]) {
            return Err(Error::validation("backoff table must be non-decreasing"));
        }
        Ok(())
    }
}

impl From<ReconnectConfig> for BackoffTable {
    fn from(config: ReconnectConfig) -> Self {
        BackoffTable::new(config.backoff)
    }
}

fn default_backoff() -> Vec<Duration> {
    [1, 2, 4, 8, 16].map(Duration::from_secs).to_vec()
}
