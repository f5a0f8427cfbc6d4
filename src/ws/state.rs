use chrono::{DateTime, Utc};
use strum_macros::Display;
use tokio::time::Instant;

/// Lifecycle state of the real-time channel.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "snake_case")]
pub enum ConnectionState {
    /// No connection has been requested yet
    Idle,
    /// Handshake in progress
    Connecting,
    /// Channel established
    Open {
        /// When the channel was established
        since: Instant,
    },
    /// Client-initiated close in progress
    Closing,
    /// No channel; a reconnect may be scheduled
    Closed,
}

impl ConnectionState {
    /// Check if the channel is currently open.
    #[must_use]
    pub const fn is_open(self) -> bool {
        matches!(self, Self::Open { .. })
    }

    #[must_use]
    pub const fn is_connecting(self) -> bool {
        matches!(self, Self::Connecting)
    }
}

/// Diagnostic snapshot of the transport client, for UI indicators.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Status {
    pub state: ConnectionState,
    pub connected: bool,
    pub connecting: bool,
    /// Number of automatic reconnection attempts since the last open
    pub reconnect_attempt: u32,
    pub fallback_active: bool,
    pub queue_depth: usize,
    /// When the oldest command still waiting in the queue was submitted
    pub oldest_queued_at: Option<DateTime<Utc>>,
    pub pending_acks: usize,
    /// When the last frame arrived on the current or previous channel
    pub last_frame_at: Option<Instant>,
}

impl Default for Status {
    fn default() -> Self {
        Self {
            state: ConnectionState::Idle,
            connected: false,
            connecting: false,
            reconnect_attempt: 0,
            fallback_active: false,
            queue_depth: 0,
            oldest_queued_at: None,
            pending_acks: 0,
            last_frame_at: None,
        }
    }
}
